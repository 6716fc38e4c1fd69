use core::future::Future;

use anyhow::Result as AnyResult;
use futures::FutureExt;
use tokio::{spawn, task::JoinHandle};
use tracing::error;

/// Spawn a task whose failure is fatal for the process.
pub fn spawn_or_abort<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    spawn(future.map(|result| {
        if let Err(error) = result {
            error!(?error, "Error in task");
            std::process::abort();
        }
    }))
}
