//! Current-state query for the build host.

use tracing::debug;

use crate::error::{Error, Result};
use crate::runner::{HostContext, Runner};
use crate::status;

use super::{HostState, VAGRANT};

/// Ask the virtualization tool for the host's current state.
///
/// Invokes `vagrant status --machine-readable` in the host's working
/// directory and resolves the single global `state` record. Probing is cheap
/// and idempotent, so nothing is retried; a failure here means the host or
/// the workspace is genuinely broken and retrying would only mask it.
///
/// # Errors
///
/// * [`Error::CommandFailed`] when the status query cannot be run, carrying
///   its captured output for diagnostics.
/// * [`Error::StatusParse`] / [`Error::AmbiguousStatus`] when the output does
///   not contain exactly one well-formed state record.
pub async fn probe_host_state<R: Runner>(runner: &R, ctx: &HostContext) -> Result<HostState> {
    let output = runner
        .run_capture(ctx, VAGRANT, &["status", "--machine-readable"])
        .await?;
    let record = status::single_state_record(&output)?;
    let Some(reported) = record.fields.first() else {
        return Err(Error::StatusParse {
            line: format!("{},{},{}", record.timestamp, record.target, record.kind),
            reason: "state record carries no state field".to_string(),
        });
    };
    let state = HostState::from_reported(reported);
    debug!(state = state.as_str(), "probed host state");
    Ok(state)
}
