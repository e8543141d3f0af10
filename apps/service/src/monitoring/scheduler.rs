use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionController, Verdict};
use super::executor::ProbeExecutor;
use super::types::{CheckReport, SiteEntry};
use crate::sink::{MetricsSink, report_records};

/// Capacity of the queue between site timers and the dispatcher
const FIRE_QUEUE_CAPACITY: usize = 256;

/// Random delays applied around a check, in milliseconds
#[derive(Debug, Clone)]
pub struct SchedulerTimings {
    /// Before a site's first fire
    pub initial_delay: Range<u64>,
    /// Before a denied fire is queued again
    pub retry_delay: Range<u64>,
    /// Between admission and the probe start
    pub dispatch_delay: Range<u64>,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            initial_delay: 0..5_000,
            retry_delay: 5_000..15_000,
            dispatch_delay: 2_000..7_000,
        }
    }
}

fn jitter(range: &Range<u64>) -> Duration {
    if range.is_empty() {
        return Duration::from_millis(range.start);
    }
    Duration::from_millis(rand::thread_rng().gen_range(range.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Scheduled,
    AlreadyScheduled,
    Disabled,
}

/// Handle to a site's timer task
struct SiteTimer {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Dispatcher {
    admission: Arc<AdmissionController>,
    executor: Arc<ProbeExecutor>,
    sink: Arc<dyn MetricsSink>,
    instance: String,
    timings: SchedulerTimings,
    fire_tx: mpsc::Sender<Arc<SiteEntry>>,
}

impl Dispatcher {
    fn dispatch(self: &Arc<Self>, site: Arc<SiteEntry>) {
        match self.admission.evaluate(&site) {
            Verdict::Denied(reason) => {
                let delay = jitter(&self.timings.retry_delay);
                debug!(site = %site.name, %reason, retry_in_ms = delay.as_millis() as u64, "check deferred");
                let fire_tx = self.fire_tx.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = fire_tx.send(site).await;
                });
            }
            Verdict::Granted(permit) => {
                let delay = jitter(&self.timings.dispatch_delay);
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(delay).await;
                    let report = dispatcher.executor.execute(&site).await;
                    drop(permit);
                    if let Some(report) = report {
                        dispatcher.forward(report);
                    }
                });
            }
        }
    }

    /// Hand the report to the sink without waiting for the write
    fn forward(&self, report: CheckReport) {
        let records = report_records(&report, &self.instance, Utc::now());
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.write_points(&records).await {
                error!(site = %report.site, error = %e, "unable to write metrics");
            }
        });
    }
}

/// Site scheduler - one cancellable timer per site feeding an admission-gated dispatcher
pub struct SiteScheduler {
    dispatcher: Arc<Dispatcher>,
    timers: Mutex<HashMap<String, SiteTimer>>,
    dispatch_loop: JoinHandle<()>,
}

impl SiteScheduler {
    pub fn start(
        admission: Arc<AdmissionController>,
        executor: Arc<ProbeExecutor>,
        sink: Arc<dyn MetricsSink>,
        instance: String,
        timings: SchedulerTimings,
    ) -> Self {
        let (fire_tx, mut fire_rx) = mpsc::channel::<Arc<SiteEntry>>(FIRE_QUEUE_CAPACITY);
        let dispatcher = Arc::new(Dispatcher { admission, executor, sink, instance, timings, fire_tx });

        let dispatch_loop = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                while let Some(site) = fire_rx.recv().await {
                    dispatcher.dispatch(site);
                }
            })
        };

        Self {
            dispatcher,
            timers: Mutex::new(HashMap::new()),
            dispatch_loop,
        }
    }

    /// Start the timer for `site`. Names are unique; a second registration is ignored.
    pub fn register(&self, site: SiteEntry) -> Registration {
        if site.disabled {
            info!(site = %site.name, "site disabled, not scheduling");
            return Registration::Disabled;
        }

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.contains_key(&site.name) {
            warn!(site = %site.name, "{} already scheduled. Not scheduling a second time.", site.name);
            return Registration::AlreadyScheduled;
        }

        let name = site.name.clone();
        let period = site.check_interval;
        let site = Arc::new(site);
        let fire_tx = self.dispatcher.fire_tx.clone();
        let initial_delay = jitter(&self.dispatcher.timings.initial_delay);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(site = %name, interval_secs = period.as_secs(), check_type = %site.check_type, "scheduling site");
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tokio::select! {
                _ = sleep(initial_delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            if fire_tx.send(Arc::clone(&site)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if fire_tx.send(Arc::clone(&site)).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        timers.insert(name, SiteTimer { handle, shutdown_tx });
        Registration::Scheduled
    }

    /// Stop a site's timer. Returns false if the site wasn't scheduled.
    pub fn unregister(&self, name: &str) -> bool {
        let timer = self.timers.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
        match timer {
            Some(timer) => {
                let _ = timer.shutdown_tx.send(true);
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn scheduled_sites(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Cancel every timer and stop dispatching
    pub fn stop_all(&self) {
        for name in self.scheduled_sites() {
            debug!(site = %name, "stopping timer");
            self.unregister(&name);
        }
        self.dispatch_loop.abort();
    }
}
