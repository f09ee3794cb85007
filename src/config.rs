//! Host configuration: the `hostler.toml` file in the working directory.
//!
//! The file carries the cleanup policy, host-specific environment variables
//! and the ssh endpoint of the guest. Additional `KEY=VALUE` items supplied
//! on the command line are merged over the `[envs]` table, command line
//! winning.
//!
//! ```toml
//! cleanup_mode = "rollback"
//! is_cleanup_before_setup = true
//!
//! [envs]
//! CI = "true"
//!
//! [ssh]
//! host = "127.0.0.1"
//! port = 2222
//! user = "vagrant"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::keys;

/// Name of the configuration file inside the working directory.
pub const CONFIG_FILE_NAME: &str = "hostler.toml";

/// Cleanup strategy for returning the host to a clean condition between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Revert the host to its snapshot.
    Rollback,
    /// Destroy the host and create it from scratch.
    Recreate,
    /// Destroy the host and leave it destroyed.
    Destroy,
    /// Clean an existing host with a configured tool subcommand.
    CustomCommand(String),
}

impl CleanupPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            CleanupPolicy::Rollback => "rollback",
            CleanupPolicy::Recreate => "recreate",
            CleanupPolicy::Destroy => "destroy",
            CleanupPolicy::CustomCommand(_) => "custom-command",
        }
    }

    /// Reject configurations that must never reach an external action.
    pub fn validate(&self) -> Result<()> {
        match self {
            CleanupPolicy::CustomCommand(command) if command.trim().is_empty() => {
                Err(Error::Validation(
                    "cleanup mode is custom-command but no custom cleanup command is configured"
                        .to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// SSH options shared by every ssh invocation.
///
/// * `StrictHostKeyChecking=no` — build hosts are ephemeral; host keys change
///   on every recreate.
/// * `UserKnownHostsFile=/dev/null` — don't pollute the operator's known_hosts.
/// * `LogLevel=ERROR` — suppress banner noise.
/// * `BatchMode=yes` — fail immediately if a password prompt would appear.
/// * `ConnectTimeout=5` — don't hang waiting for sshd.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

/// SSH endpoint of the guest.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2222,
            user: "vagrant".to_string(),
        }
    }
}

impl SshConfig {
    /// Build the full `ssh` invocation that runs `remote_command` on the
    /// host, authenticated with the key material in `workdir`.
    pub fn transport_command(&self, workdir: &Path, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTS);
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg("-i").arg(keys::private_key_path(workdir));
        cmd.arg(format!("{}@{}", self.user, self.host));
        cmd.arg(remote_command);
        cmd
    }
}

/// The parsed `hostler.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    pub cleanup_mode: String,
    #[serde(default)]
    pub custom_cleanup_command: String,
    #[serde(default)]
    pub is_cleanup_before_setup: bool,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub ssh: SshConfig,
}

impl MachineConfig {
    /// Load and validate the config file from `workdir`.
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = workdir.join(CONFIG_FILE_NAME);
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::Io {
            context: format!("failed to read config file {}", path.display()),
            source: e,
        })?;
        let config = Self::from_toml(&raw)?;
        debug!(path = %path.display(), cleanup_mode = %config.cleanup_mode, "loaded machine config");
        Ok(config)
    }

    /// Parse and validate config content.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: MachineConfig = toml::from_str(raw)
            .map_err(|e| Error::Validation(format!("malformed config file: {e}")))?;
        config.cleanup_policy()?;
        Ok(config)
    }

    /// Resolve the configured cleanup mode into a policy value.
    ///
    /// An unrecognized mode string is a configuration error, as is the
    /// custom-command mode without a command.
    pub fn cleanup_policy(&self) -> Result<CleanupPolicy> {
        let policy = match self.cleanup_mode.as_str() {
            "rollback" => CleanupPolicy::Rollback,
            "recreate" => CleanupPolicy::Recreate,
            "destroy" => CleanupPolicy::Destroy,
            "custom-command" => {
                CleanupPolicy::CustomCommand(self.custom_cleanup_command.clone())
            }
            other => {
                return Err(Error::Validation(format!(
                    "unsupported cleanup mode {other:?}"
                )));
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Config envs with `additional` merged on top (additional wins).
    pub fn merged_envs(&self, additional: &[(String, String)]) -> Vec<(String, String)> {
        let mut merged = self.envs.clone();
        for (key, value) in additional {
            merged.insert(key.clone(), value.clone());
        }
        merged.into_iter().collect()
    }
}

/// Parse repeated `KEY=VALUE` command line items.
///
/// The key must be non-empty and a `=` must be present; the value may be
/// empty and may itself contain `=` or spaces.
pub fn parse_env_items(items: &[String]) -> Result<Vec<(String, String)>> {
    let mut envs = Vec::with_capacity(items.len());
    for item in items {
        let Some((key, value)) = item.split_once('=') else {
            return Err(Error::Validation(format!(
                "invalid environment item {item:?}: no value defined"
            )));
        };
        if key.is_empty() {
            return Err(Error::Validation(format!(
                "invalid environment item {item:?}: empty key"
            )));
        }
        envs.push((key.to_string(), value.to_string()));
    }
    Ok(envs)
}
