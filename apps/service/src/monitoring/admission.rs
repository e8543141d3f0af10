use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::types::{CheckType, SiteEntry};

/// Global concurrency counter shared by the scheduler and the browser lifecycle.
#[derive(Debug)]
pub struct AdmissionState {
    running: AtomicUsize,
    max: usize,
}

impl AdmissionState {
    pub fn new(max: usize) -> Self {
        Self {
            running: AtomicUsize::new(0),
            max,
        }
    }

    /// Number of probes currently executing
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Test-and-increment. Returns `None` when the ceiling is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let max = self.max;
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < max).then_some(running + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                state: Arc::clone(self),
            })
    }
}

/// A running-probe slot. The counter is decremented when the permit is dropped,
/// on every exit path of the probe.
#[derive(Debug)]
pub struct AdmissionPermit {
    state: Arc<AdmissionState>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether the shared browser can accept new pages.
pub trait BrowserReadiness: Send + Sync {
    fn is_ready(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    BrowserNotReady,
    CapacityReached { running: usize, max: usize },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::BrowserNotReady => write!(f, "browser not ready"),
            DenyReason::CapacityReached { running, max } => {
                write!(f, "{running} of {max} jobs running")
            }
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    Granted(AdmissionPermit),
    Denied(DenyReason),
}

/// Decides whether a fired site may start a probe now.
pub struct AdmissionController {
    state: Arc<AdmissionState>,
    browser: Arc<dyn BrowserReadiness>,
}

impl AdmissionController {
    pub fn new(state: Arc<AdmissionState>, browser: Arc<dyn BrowserReadiness>) -> Self {
        Self { state, browser }
    }

    #[cfg(test)]
    pub fn state(&self) -> &Arc<AdmissionState> {
        &self.state
    }

    /// Browser readiness is checked before capacity; a granted verdict has
    /// already reserved its slot.
    pub fn evaluate(&self, site: &SiteEntry) -> Verdict {
        if site.check_type == CheckType::Browser && !self.browser.is_ready() {
            debug!(site = %site.name, "browser not ready, deferring check");
            return Verdict::Denied(DenyReason::BrowserNotReady);
        }

        match self.state.try_acquire() {
            Some(permit) => Verdict::Granted(permit),
            None => Verdict::Denied(DenyReason::CapacityReached {
                running: self.state.running(),
                max: self.state.max(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use url::Url;

    struct FixedReadiness(AtomicBool);

    impl BrowserReadiness for FixedReadiness {
        fn is_ready(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn site(check_type: CheckType) -> SiteEntry {
        SiteEntry {
            name: format!("{check_type}-site"),
            url: Url::parse("https://example.com").unwrap(),
            check_interval: Duration::from_secs(60),
            check_type,
            disabled: false,
        }
    }

    fn controller(max: usize, ready: bool) -> AdmissionController {
        AdmissionController::new(
            Arc::new(AdmissionState::new(max)),
            Arc::new(FixedReadiness(AtomicBool::new(ready))),
        )
    }

    #[test]
    fn grants_until_ceiling_then_denies() {
        let controller = controller(2, true);
        let first = controller.evaluate(&site(CheckType::Curl));
        let second = controller.evaluate(&site(CheckType::Curl));
        assert!(matches!(first, Verdict::Granted(_)));
        assert!(matches!(second, Verdict::Granted(_)));

        match controller.evaluate(&site(CheckType::Curl)) {
            Verdict::Denied(DenyReason::CapacityReached { running, max }) => {
                assert_eq!((running, max), (2, 2));
            }
            other => panic!("expected capacity denial, got {other:?}"),
        }

        drop(first);
        assert_eq!(controller.state().running(), 1);
        assert!(matches!(controller.evaluate(&site(CheckType::Curl)), Verdict::Granted(_)));
    }

    #[test]
    fn browser_readiness_checked_before_capacity() {
        let controller = controller(5, false);

        assert!(matches!(
            controller.evaluate(&site(CheckType::Browser)),
            Verdict::Denied(DenyReason::BrowserNotReady)
        ));
        assert_eq!(controller.state().running(), 0);

        // HTTP checks don't need the browser
        assert!(matches!(controller.evaluate(&site(CheckType::Curl)), Verdict::Granted(_)));
    }

    #[test]
    fn permit_released_when_probe_panics() {
        let controller = controller(1, true);
        let Verdict::Granted(permit) = controller.evaluate(&site(CheckType::Curl)) else {
            panic!("expected a permit");
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = permit;
            panic!("probe blew up");
        }));
        assert!(result.is_err());
        assert_eq!(controller.state().running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ceiling_holds_under_contention() {
        let state = Arc::new(AdmissionState::new(3));
        let controller = Arc::new(AdmissionController::new(
            state.clone(),
            Arc::new(FixedReadiness(AtomicBool::new(true))),
        ));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let controller = controller.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if let Verdict::Granted(_permit) = controller.evaluate(&site(CheckType::Curl)) {
                        peak.fetch_max(controller.state().running(), Ordering::SeqCst);
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(state.running(), 0);
    }
}
