//! Process-wide shutdown signal.
//!
//! A `watch` channel carrying `true` once shutdown is requested. Every
//! blocking wait in the tunnel races [`requested`] so it returns promptly.

use tokio::sync::watch;

/// Receiving side handed to listeners and connections.
pub type Shutdown = watch::Receiver<bool>;

/// Create a new shutdown channel in the "running" state.
pub fn channel() -> (watch::Sender<bool>, Shutdown) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested.
///
/// A dropped sender counts as a shutdown request.
pub async fn requested(shutdown: &mut Shutdown) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Non-blocking check.
pub fn is_requested(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}
