//! servex — task-queue server and executor core for service-execution
//! platforms.
//!
//! User-submitted requests for named services become external command
//! invocations: an [`executor::Executor`] assembles the command line from an
//! option-value map, mints a working directory, and submits to one of three
//! backends — an inline subprocess, the in-process worker queue behind
//! [`queue::TaskQueue`], or a grid engine. The returned [`executor::Job`]
//! translates backend-native progress into one canonical status lattice.

pub mod client;
pub mod command;
pub mod config;
pub mod errors;
pub mod executor;
pub mod limits;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod records;
pub mod server;

pub use command::ProcessOutput;
pub use errors::{ConfigError, JobRetrievalError, ServerError, SubmissionError};
pub use executor::{Backend, Executor, Job};
pub use queue::TaskQueue;
pub use records::JobStatus;
