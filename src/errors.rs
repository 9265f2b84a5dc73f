//! Error taxonomy shared across the scheduling core.
//!
//! Worker-internal failures never surface here; they are logged and contained
//! inside the pool. Everything below crosses a public API boundary.

use std::io;

use thiserror::Error;

/// The backend refused or failed to enqueue a job.
///
/// The working directory minted for the submission is left behind for
/// diagnostics.
#[derive(Debug, Error)]
#[error("job submission failed: {0}")]
pub struct SubmissionError(pub String);

/// Status or result polling threw; the caller may retry later.
#[derive(Debug, Error)]
#[error("job retrieval failed: {0}")]
pub struct JobRetrievalError(pub String);

/// The queue server misbehaved from the client's point of view.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("queue server i/o error: {0}")]
    Io(#[from] io::Error),

    /// The server answered with the `ERROR   ` status header.
    #[error("queue server replied with an error status")]
    ErrorReply,

    /// The reply violated the wire protocol.
    #[error("malformed server response: {0}")]
    Protocol(String),
}

/// Service configuration could not be loaded or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown executor class {0:?}")]
    UnknownExecClass(String),

    #[error("unknown limits policy {0:?}")]
    UnknownLimits(String),

    #[error("file result must set exactly one of \"path\" or \"pattern\"")]
    BadFileResult,

    #[error("invalid command line {0:?}")]
    InvalidCommand(String),
}
