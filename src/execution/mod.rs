//! Command execution: requests, results and the fluid handle.
//!
//! Every `exec` produces exactly one backend run. [`Execution`] and
//! [`Details`] are views over that run; they can be awaited, piped and
//! streamed in any combination.
//!
//! # Example
//!
//! ```no_run
//! use unishell::{PipeSinks, Unishell};
//!
//! # async fn demo() -> unishell::Result<()> {
//! let client = Unishell::local_default();
//!
//! // Trimmed combined output, whatever the exit code
//! let name = client.exec("uname -s").await?;
//!
//! // Full result, forwarded to our stdout while it runs
//! let result = client
//!     .exec("cargo build")
//!     .pipe(PipeSinks::inherit())
//!     .details()
//!     .await?;
//! println!("{} exited with {}", name, result.code);
//! # Ok(())
//! # }
//! ```

pub(crate) mod driver;
pub(crate) mod handle;
mod request;
mod result;

pub use handle::{Details, Execution, ExecutionState};
pub use request::{ExecOptions, ExecutionRequest};
pub use result::{ExecutionResult, OutputChunk, OutputSource};
