//! SSH key material in the host working directory.
//!
//! `setup` issues a dedicated keypair for the host; cleanup invalidates it
//! again by deleting both files. Key generation shells out to `ssh-keygen`,
//! like every other privileged tool invocation in this crate.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::runner::{HostContext, Runner};

/// Private key file name inside the working directory.
pub const PRIVATE_KEY_FILE: &str = "ssh_rsa";

/// Public key file name inside the working directory.
pub const PUBLIC_KEY_FILE: &str = "ssh_rsa.pub";

pub fn private_key_path(workdir: &Path) -> PathBuf {
    workdir.join(PRIVATE_KEY_FILE)
}

pub fn public_key_path(workdir: &Path) -> PathBuf {
    workdir.join(PUBLIC_KEY_FILE)
}

/// Remove previously generated key files, if any.
///
/// Missing files are fine (the pair may never have been issued), but a file
/// that exists and cannot be removed is a real workspace problem and is
/// surfaced as [`Error::Io`].
pub fn delete_key_files(workdir: &Path) -> Result<()> {
    for path in [private_key_path(workdir), public_key_path(workdir)] {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed ssh key file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Io {
                    context: format!("failed to remove ssh key file {}", path.display()),
                    source: e,
                });
            }
        }
    }
    Ok(())
}

/// Generate a fresh RSA keypair for the host unless one is already present.
///
/// With `force`, any existing pair is deleted and reissued.
pub async fn ensure_keypair<R: Runner>(runner: &R, ctx: &HostContext, force: bool) -> Result<()> {
    let private = private_key_path(&ctx.workdir);
    if private.exists() && !force {
        debug!(path = %private.display(), "ssh keypair already present");
        return Ok(());
    }
    delete_key_files(&ctx.workdir)?;
    info!(path = %private.display(), "generating ssh keypair");
    runner
        .run(
            ctx,
            "ssh-keygen",
            &["-t", "rsa", "-b", "4096", "-N", "", "-q", "-f", PRIVATE_KEY_FILE],
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        delete_key_files(dir.path()).unwrap();
    }

    #[test]
    fn delete_removes_both_key_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(private_key_path(dir.path()), "private").unwrap();
        std::fs::write(public_key_path(dir.path()), "public").unwrap();

        delete_key_files(dir.path()).unwrap();

        assert!(!private_key_path(dir.path()).exists());
        assert!(!public_key_path(dir.path()).exists());
    }
}
