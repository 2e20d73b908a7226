//! Network plumbing shared by the release catalog and the image fetcher.
//!
//! Every network call in the core is a suspension point that honors a
//! caller-owned cancellation signal and a timeout.

use crate::error::ImagerError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Cancellation signal handed in by the caller. `true` means cancel.
pub type CancelSignal = watch::Receiver<bool>;

/// A signal that never fires, for callers without a cancel button.
///
/// The sender is dropped immediately; `cancelled` treats a closed channel as
/// "never cancelled".
pub fn never_cancel() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Build the HTTP client used for release listing and downloads.
pub fn http_client() -> Result<reqwest::Client, ImagerError> {
    reqwest::Client::builder()
        .user_agent(concat!("skyimager/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ImagerError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// Resolve once the signal reads `true`. Pends forever if the sender is gone.
pub async fn cancelled(cancel: &CancelSignal) {
    let mut rx = cancel.clone();
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    *cancel.borrow()
}

/// Run `fut` under both the cancellation signal and a timeout.
pub async fn bounded<T, F>(
    what: &str,
    fut: F,
    cancel: &CancelSignal,
    timeout: Duration,
) -> Result<T, ImagerError>
where
    F: Future<Output = Result<T, ImagerError>>,
{
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(ImagerError::Cancelled(what.to_string())),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ImagerError::Timeout { what: what.to_string(), after: timeout }),
        },
    }
}

/// Cancellable sleep between retries.
pub async fn pause(delay: Duration, cancel: &CancelSignal, what: &str) -> Result<(), ImagerError> {
    tokio::select! {
        _ = cancelled(cancel) => Err(ImagerError::Cancelled(what.to_string())),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
