use std::future::Future;

use tracing::error;

/// Submit work that must never run on a request path. The caller gets no
/// handle back; a panicking task is logged and the rest of the process is
/// unaffected.
pub fn spawn<F>(label: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            error!(task = label, %err, "background task failed");
        }
    });
}
