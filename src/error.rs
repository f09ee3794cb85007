//! Error kinds surfaced by hostler.
//!
//! A small closed enumeration so callers can branch on kind instead of
//! matching message substrings. Controlled termination of a supervised run
//! (timeout, external abort) is not an error; see
//! [`crate::host::supervise::ExecutionOutcome`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Which cleanup sub-step failed.
///
/// Lets an operator tell a broken host (probe or policy action) apart from a
/// broken workspace (key removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    StatusProbe,
    PolicyAction,
    KeyRemoval,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStep::StatusProbe => "status probe",
            CleanupStep::PolicyAction => "policy action",
            CleanupStep::KeyRemoval => "ssh key removal",
        };
        f.write_str(name)
    }
}

/// Every fatal failure this crate can report.
#[derive(Debug, Error)]
pub enum Error {
    /// A machine-readable status line could not be parsed.
    #[error("cannot parse status line {line:?}: {reason}")]
    StatusParse { line: String, reason: String },

    /// The status output did not contain exactly one state record.
    #[error(
        "ambiguous host status: expected exactly one state record, found {found}; \
         status output was:\n{output}"
    )]
    AmbiguousStatus { found: usize, output: String },

    /// An external command could not be started or exited non-zero.
    #[error("external command `{command}` failed; captured output:\n{output}")]
    CommandFailed { command: String, output: String },

    /// Invalid configuration, rejected before any external action is attempted.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A filesystem or stream operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A cleanup sub-step failed.
    #[error("cleanup step '{step}' failed: {source}")]
    Cleanup {
        step: CleanupStep,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the cleanup step this error occurred in.
    pub(crate) fn in_step(self, step: CleanupStep) -> Error {
        Error::Cleanup {
            step,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
