//! Drives a standalone execution from backend start to settlement.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, error};

use super::handle::{ExecutionShared, Failure};
use crate::backend::Backend;
use crate::error::UnishellError;
use crate::io::{pump, BoxReader, Termination};

/// Start `shared`'s request on `backend` and drain it in the background.
///
/// A start failure settles the handle as failed; the caller always gets a
/// handle back.
pub(crate) fn launch<B>(backend: &B, shared: &Arc<ExecutionShared>)
where
    B: Backend + ?Sized,
{
    match backend.start(shared.request()) {
        Ok(io) => {
            shared.begin(io.stdin);
            tokio::spawn(drain(
                Arc::clone(shared),
                io.stdout,
                io.stderr,
                io.exit,
            ));
        }
        Err(e) => {
            debug!(backend = backend.name(), "start failed: {}", e);
            let reason = match e {
                UnishellError::Spawn { reason, .. } => reason,
                other => other.to_string(),
            };
            shared.fail(Failure::Spawn(reason));
        }
    }
}

async fn drain(
    shared: Arc<ExecutionShared>,
    stdout: BoxReader,
    stderr: BoxReader,
    exit: BoxFuture<'static, std::io::Result<Termination>>,
) {
    let mut chunks = pump::spawn_output_pumps(stdout, stderr);
    while let Some(chunk) = chunks.recv().await {
        shared.publish(&chunk);
    }

    let termination = match exit.await {
        Ok(termination) => termination,
        Err(e) => {
            error!(cmd = %shared.request().command(), "failed to observe exit: {}", e);
            Termination::unknown()
        }
    };
    shared.settle(termination).await;
}
