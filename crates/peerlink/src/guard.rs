use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a synchronous callback, logging instead of unwinding into the caller.
pub(crate) fn guard_callback<F: FnOnce()>(event: &'static str, callback: F) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            target = "peerlink::dispatch",
            event,
            panic = %panic_message(payload.as_ref()),
            "event callback panicked"
        );
    }
}

pub(crate) async fn guard_future<F>(event: &'static str, future: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
        tracing::error!(
            target = "peerlink::dispatch",
            event,
            panic = %panic_message(payload.as_ref()),
            "event handler panicked"
        );
    }
}
