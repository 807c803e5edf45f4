//! Hops onto the main dispatch queue, where every `VZVirtualMachine` call
//! has to happen.

use burrow_core::{Error, Result};
use dispatch::Queue;
use objc2::MainThreadMarker;

/// Runs `f` on the main queue and waits for its result without blocking the
/// calling task. Runs inline when already on the main thread.
pub async fn on_main<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if MainThreadMarker::new().is_some() {
        return Ok(f());
    }
    let (tx, rx) = tokio::sync::oneshot::channel();
    Queue::main().exec_async(move || {
        let _ = tx.send(f());
    });
    rx.await
        .map_err(|_| Error::Resource("main queue dropped the call".to_string()))
}

/// Blocking variant for `Drop` impls.
pub fn on_main_sync<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if MainThreadMarker::new().is_some() {
        f()
    } else {
        Queue::main().exec_sync(f)
    }
}
