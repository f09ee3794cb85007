//! Cleanup transitions: returning the host to a usable, clean condition.
//!
//! The policy × state decision table:
//!
//! | policy          | not created        | exists                   |
//! |-----------------|--------------------|--------------------------|
//! | rollback        | `sandbox rollback` | `sandbox rollback`       |
//! | recreate        | `up`               | `destroy -f`, then `up`  |
//! | destroy         | nothing to do      | `destroy -f`             |
//! | custom-command  | `up`               | `<custom command>`       |
//!
//! Rollback reverts a snapshot, which is independent of creation state, so it
//! never probes. Destroy is only ever issued against an existing host:
//! whether `vagrant destroy` on a nonexistent host is a no-op or an error
//! depends on the installed provider, and this code relies on neither.
//!
//! After the policy action (and also when the action is skipped), previously
//! generated SSH key files are removed from the working directory: a
//! completed cleanup invalidates any key pair issued for the old host.

use tracing::{info, warn};

use crate::config::CleanupPolicy;
use crate::error::{CleanupStep, Result};
use crate::runner::{HostContext, Runner};

use super::{HostState, VAGRANT, keys, probe};

/// Execute the configured cleanup policy against the host.
///
/// With `host_will_be_destroyed` the policy action (probe included) is
/// skipped entirely, because the caller promised the host is discarded
/// immediately afterwards. Key removal still runs: stale key material in the
/// working directory is a hazard either way.
///
/// # Errors
///
/// The first failing sub-step aborts the invocation; nothing is retried. The
/// returned error names the step via [`CleanupStep`].
pub async fn run_cleanup<R: Runner>(
    runner: &R,
    ctx: &HostContext,
    policy: &CleanupPolicy,
    host_will_be_destroyed: bool,
) -> Result<()> {
    policy.validate()?;

    if host_will_be_destroyed {
        warn!(
            policy = policy.name(),
            "host will be destroyed by the caller, skipping the cleanup action"
        );
    } else {
        apply_policy(runner, ctx, policy).await?;
    }

    keys::delete_key_files(&ctx.workdir).map_err(|e| e.in_step(CleanupStep::KeyRemoval))?;

    info!(policy = policy.name(), "cleanup finished");
    Ok(())
}

/// Create the host (`vagrant up`), streaming tool output to the terminal.
pub async fn create_host<R: Runner>(runner: &R, ctx: &HostContext) -> Result<()> {
    runner.run(ctx, VAGRANT, &["up"]).await
}

/// Destroy the host unconditionally (`vagrant destroy -f`).
pub async fn destroy_host<R: Runner>(runner: &R, ctx: &HostContext) -> Result<()> {
    runner.run(ctx, VAGRANT, &["destroy", "-f"]).await
}

async fn apply_policy<R: Runner>(
    runner: &R,
    ctx: &HostContext,
    policy: &CleanupPolicy,
) -> Result<()> {
    match policy {
        CleanupPolicy::Rollback => {
            info!("rolling back host snapshot");
            runner
                .run(ctx, VAGRANT, &["sandbox", "rollback"])
                .await
                .map_err(|e| e.in_step(CleanupStep::PolicyAction))
        }
        CleanupPolicy::Recreate => recreate(runner, ctx).await,
        CleanupPolicy::Destroy => destroy_if_exists(runner, ctx).await.map(|_| ()),
        CleanupPolicy::CustomCommand(command) => custom(runner, ctx, command).await,
    }
}

/// Destroy the host when it exists; reports whether it existed.
async fn destroy_if_exists<R: Runner>(runner: &R, ctx: &HostContext) -> Result<bool> {
    let state = probed_state(runner, ctx).await?;
    if !state.exists() {
        info!("host is not created, skipping destroy");
        return Ok(false);
    }
    info!(state = state.as_str(), "destroying host");
    destroy_host(runner, ctx)
        .await
        .map_err(|e| e.in_step(CleanupStep::PolicyAction))?;
    info!("host destroyed");
    Ok(true)
}

async fn recreate<R: Runner>(runner: &R, ctx: &HostContext) -> Result<()> {
    destroy_if_exists(runner, ctx).await?;
    info!("creating host");
    create_host(runner, ctx)
        .await
        .map_err(|e| e.in_step(CleanupStep::PolicyAction))?;
    info!("host created and ready");
    Ok(())
}

async fn custom<R: Runner>(runner: &R, ctx: &HostContext, command: &str) -> Result<()> {
    let state = probed_state(runner, ctx).await?;
    if state.exists() {
        info!(command, "host exists, cleaning it up with the custom command");
        runner
            .run(ctx, VAGRANT, &[command])
            .await
            .map_err(|e| e.in_step(CleanupStep::PolicyAction))
    } else {
        info!("host not yet created, creating it instead");
        create_host(runner, ctx)
            .await
            .map_err(|e| e.in_step(CleanupStep::PolicyAction))
    }
}

async fn probed_state<R: Runner>(runner: &R, ctx: &HostContext) -> Result<HostState> {
    probe::probe_host_state(runner, ctx)
        .await
        .map_err(|e| e.in_step(CleanupStep::StatusProbe))
}
