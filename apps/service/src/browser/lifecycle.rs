use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use super::driver::{BrowserDriver, BrowserSession, LaunchOptions};
use crate::error::LifecycleError;
use crate::monitoring::admission::{AdmissionState, BrowserReadiness};
use crate::shutdown::FatalShutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Uninitialized,
    Launching,
    Ready,
    Disconnected,
    Restarting,
    Failed,
}

impl std::fmt::Display for BrowserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserState::Uninitialized => write!(f, "uninitialized"),
            BrowserState::Launching => write!(f, "launching"),
            BrowserState::Ready => write!(f, "ready"),
            BrowserState::Disconnected => write!(f, "disconnected"),
            BrowserState::Restarting => write!(f, "restarting"),
            BrowserState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub launch: LaunchOptions,
    /// Failed launches and crash relaunches allowed without a successful probe in between
    pub max_restarts: u32,
    /// Period of the maintenance restart
    pub restart_interval: Duration,
    /// Pause between two failed launches
    pub retry_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            launch: LaunchOptions::default(),
            max_restarts: 5,
            restart_interval: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(2),
        }
    }
}

struct Current {
    state: BrowserState,
    session: Option<Arc<dyn BrowserSession>>,
    endpoint: Option<String>,
    /// Bumped whenever the session is replaced; disconnects of older sessions are ignored
    generation: u64,
}

/// Owns the shared browser: launch, reconnect, relaunch and periodic restart.
///
/// Transitions are serialized by an async mutex so a disconnect and a
/// maintenance restart never race each other.
pub struct BrowserLifecycleManager {
    driver: Arc<dyn BrowserDriver>,
    config: LifecycleConfig,
    jobs: Arc<AdmissionState>,
    fatal: FatalShutdown,
    current: RwLock<Current>,
    restart_attempts: AtomicU32,
    transition: Mutex<()>,
}

impl BrowserLifecycleManager {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        config: LifecycleConfig,
        jobs: Arc<AdmissionState>,
        fatal: FatalShutdown,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            config,
            jobs,
            fatal,
            current: RwLock::new(Current {
                state: BrowserState::Uninitialized,
                session: None,
                endpoint: None,
                generation: 0,
            }),
            restart_attempts: AtomicU32::new(0),
            transition: Mutex::new(()),
        })
    }

    fn current(&self) -> RwLockReadGuard<'_, Current> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_mut(&self) -> RwLockWriteGuard<'_, Current> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BrowserState) {
        let mut current = self.current_mut();
        if current.state != state {
            debug!(from = %current.state, to = %state, "browser state change");
            current.state = state;
        }
    }

    pub fn state(&self) -> BrowserState {
        self.current().state
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    /// The session, if the browser is ready and still connected
    pub fn ready_session(&self) -> Option<Arc<dyn BrowserSession>> {
        let current = self.current();
        match (&current.state, &current.session) {
            (BrowserState::Ready, Some(session)) if session.is_connected() => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// A probe completed against the browser, so it is healthy again
    pub fn record_probe_success(&self) {
        self.restart_attempts.store(0, Ordering::SeqCst);
    }

    /// Start the browser, retrying until the restart budget is spent.
    ///
    /// Only failed launches spend the budget here. Exhausting it reports a
    /// fatal shutdown.
    pub async fn launch(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;
        self.launch_locked().await
    }

    async fn launch_locked(self: &Arc<Self>) -> Result<(), LifecycleError> {
        loop {
            self.set_state(BrowserState::Launching);

            match self.driver.launch(&self.config.launch).await {
                Ok(session) => {
                    info!(endpoint = %session.endpoint(), "browser started");
                    self.install(session);
                    return Ok(());
                }
                Err(e) => {
                    let attempts = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(attempts, max = self.config.max_restarts, error = %e, "unable to start browser");
                    if attempts >= self.config.max_restarts {
                        return Err(self.exhausted(attempts));
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn exhausted(&self, attempts: u32) -> LifecycleError {
        self.set_state(BrowserState::Failed);
        let failure = LifecycleError::RestartBudgetExhausted { attempts };
        error!(attempts, "browser restart budget exhausted");
        self.fatal.trigger(failure.to_string());
        failure
    }

    fn install(self: &Arc<Self>, session: Arc<dyn BrowserSession>) {
        let generation = {
            let mut current = self.current_mut();
            current.generation += 1;
            current.state = BrowserState::Ready;
            current.endpoint = Some(session.endpoint());
            current.session = Some(Arc::clone(&session));
            current.generation
        };

        let mut disconnected = session.disconnected();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            // A dropped sender means the session is gone as well
            let _ = disconnected.wait_for(|gone| *gone).await;
            if let Some(manager) = manager.upgrade() {
                if let Err(e) = manager.on_disconnected(generation).await {
                    error!(error = %e, "browser recovery failed");
                }
            }
        });
    }

    /// React to the loss of the session installed as `generation`.
    ///
    /// One reconnect to the last endpoint is tried before relaunching.
    pub async fn on_disconnected(self: &Arc<Self>, generation: u64) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;

        let endpoint = {
            let mut current = self.current_mut();
            if current.generation != generation {
                debug!(generation, "replaced browser session disconnected");
                return Ok(());
            }
            warn!(endpoint = ?current.endpoint, spent = self.restart_attempts(), "browser disconnected unexpectedly");
            current.state = BrowserState::Disconnected;
            current.session = None;
            current.endpoint.clone()
        };

        self.set_state(BrowserState::Restarting);

        if let Some(endpoint) = endpoint {
            match self.driver.connect(&endpoint).await {
                Ok(session) if session.is_connected() => {
                    info!(%endpoint, "reconnected to browser");
                    self.install(session);
                    return Ok(());
                }
                Ok(_) => warn!(%endpoint, "reconnected browser reports no connection"),
                Err(e) => warn!(%endpoint, error = %e, "unable to reconnect to browser"),
            }
        }

        // Relaunching a lost browser spends the budget even when it succeeds
        let spent = self.restart_attempts();
        if spent >= self.config.max_restarts {
            return Err(self.exhausted(spent));
        }
        self.launch_locked().await?;
        self.restart_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Periodic restart. Skipped while any probe is running.
    ///
    /// A successful relaunch does not touch the restart budget. Returns
    /// whether the browser was restarted.
    pub async fn maintenance_restart(self: &Arc<Self>) -> Result<bool, LifecycleError> {
        let _transition = self.transition.lock().await;

        let state = self.state();
        if state != BrowserState::Ready {
            debug!(%state, "browser not ready, skipping maintenance restart");
            return Ok(false);
        }
        let running = self.jobs.running();
        if running > 0 {
            debug!(running, "jobs running, skipping maintenance restart");
            return Ok(false);
        }

        info!("restarting browser for maintenance");
        let previous = {
            let mut current = self.current_mut();
            current.state = BrowserState::Restarting;
            current.generation += 1;
            current.session.take()
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "closing previous browser failed");
            }
        }

        self.launch_locked().await?;
        Ok(true)
    }

    /// Run `maintenance_restart` every `restart_interval`
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.restart_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.maintenance_restart().await {
                    error!(error = %e, "maintenance restart failed");
                    break;
                }
            }
        })
    }

    /// Close the browser for good
    pub async fn close(&self) {
        let _transition = self.transition.lock().await;
        let session = {
            let mut current = self.current_mut();
            current.generation += 1;
            current.state = BrowserState::Uninitialized;
            current.session.take()
        };
        if let Some(session) = session {
            info!("closing browser");
            if let Err(e) = session.close().await {
                warn!(error = %e, "unable to close browser");
            }
        }
    }
}

impl BrowserReadiness for BrowserLifecycleManager {
    fn is_ready(&self) -> bool {
        self.ready_session().is_some()
    }
}
