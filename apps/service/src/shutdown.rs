//! Process-wide fatal shutdown signal.
//!
//! Components never terminate the process themselves. They report the fatal
//! condition here and `main` exits with a non-zero code once logs are written.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct FatalShutdown {
    reason: Arc<watch::Sender<Option<String>>>,
}

impl FatalShutdown {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason: Arc::new(reason) }
    }

    /// Record a fatal condition. Only the first reason is kept.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.reason.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        self.reason.borrow().is_some()
    }

    /// Wait until a fatal condition is reported and return its reason.
    pub async fn wait(&self) -> String {
        let mut rx = self.reason.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so this branch is unreachable in practice.
            Err(_) => String::from("fatal shutdown channel closed"),
        }
    }
}

impl Default for FatalShutdown {
    fn default() -> Self {
        Self::new()
    }
}
