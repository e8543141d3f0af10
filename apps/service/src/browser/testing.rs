//! Scripted browser used by lifecycle and probe tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use super::driver::{
    BrowserDriver, BrowserPage, BrowserSession, LaunchOptions, NavigationResponse, RequestRecord,
};
use crate::error::BrowserError;

pub const BROWSER_AGENT: &str = "Mozilla/5.0 HeadlessChrome/120.0";

/// What one page will do when navigated
#[derive(Debug, Clone)]
pub struct PageScript {
    pub response: Option<u16>,
    pub timeline: serde_json::Value,
    pub requests: Vec<RequestRecord>,
}

impl PageScript {
    pub fn loaded(duration: f64, status: u16) -> Self {
        let timeline = json!({
            "navigation": [{ "name": "https://example.com/", "duration": duration, "responseStatus": status }],
            "resources": []
        });
        Self {
            response: Some(status),
            timeline: serde_json::Value::String(timeline.to_string()),
            requests: Vec::new(),
        }
    }

    pub fn no_response() -> Self {
        Self { response: None, ..Self::loaded(0.0, 0) }
    }

    pub fn malformed(status: u16) -> Self {
        Self {
            timeline: serde_json::Value::String("{\"navigation\":".into()),
            ..Self::loaded(0.0, status)
        }
    }
}

pub struct MockBrowser {
    calls: Mutex<Vec<&'static str>>,
    launch_failures: AtomicU32,
    connect_allowed: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    pages: Mutex<VecDeque<PageScript>>,
    pub opened: Mutex<Vec<bool>>,
    pub closed_pages: AtomicUsize,
    pub user_agents: Mutex<Vec<String>>,
}

impl MockBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            launch_failures: AtomicU32::new(0),
            connect_allowed: AtomicBool::new(true),
            sessions: Mutex::new(Vec::new()),
            pages: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            closed_pages: AtomicUsize::new(0),
            user_agents: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    /// Fail the next `count` launches
    pub fn fail_launches(&self, count: u32) {
        self.launch_failures.store(count, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self) {
        self.connect_allowed.store(false, Ordering::SeqCst);
    }

    pub fn script_pages(&self, scripts: impl IntoIterator<Item = PageScript>) {
        self.pages.lock().unwrap().extend(scripts);
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        Arc::clone(self.sessions.lock().unwrap().last().expect("no session created"))
    }

    fn new_session(self: &Arc<Self>) -> Arc<MockSession> {
        let (disconnected, _) = watch::channel(false);
        let session = Arc::new(MockSession {
            browser: Arc::clone(self),
            connected: AtomicBool::new(true),
            disconnected,
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        session
    }
}

pub struct MockDriver(pub Arc<MockBrowser>);

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        self.0.record("launch");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let failures = self.0.launch_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.0.launch_failures.store(failures - 1, Ordering::SeqCst);
            return Err(BrowserError::Launch("chrome exited".into()));
        }
        Ok(self.0.new_session())
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        self.0.record("connect");
        if !self.0.connect_allowed.load(Ordering::SeqCst) {
            return Err(BrowserError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.0.new_session())
    }
}

pub struct MockSession {
    browser: Arc<MockBrowser>,
    connected: AtomicBool,
    disconnected: watch::Sender<bool>,
}

impl MockSession {
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(true);
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        "ws://127.0.0.1:9222/devtools/browser/mock".into()
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn user_agent(&self) -> Result<String, BrowserError> {
        Ok(BROWSER_AGENT.into())
    }

    async fn new_page(&self, isolated: bool) -> Result<Box<dyn BrowserPage>, BrowserError> {
        if !self.is_connected() {
            return Err(BrowserError::Disconnected);
        }
        self.browser.opened.lock().unwrap().push(isolated);
        let script = self
            .browser
            .pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PageScript::loaded(100.0, 200));
        Ok(Box::new(MockPage { browser: Arc::clone(&self.browser), script }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.browser.record("close");
        self.drop_connection();
        Ok(())
    }
}

struct MockPage {
    browser: Arc<MockBrowser>,
    script: PageScript,
}

#[async_trait]
impl BrowserPage for MockPage {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError> {
        self.browser.user_agents.lock().unwrap().push(user_agent.to_string());
        Ok(())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<Option<NavigationResponse>, BrowserError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.script.response.map(|status| NavigationResponse { url: url.to_string(), status }))
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(self.script.timeline.clone())
    }

    fn requests(&self) -> Vec<RequestRecord> {
        self.script.requests.clone()
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.browser.closed_pages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
