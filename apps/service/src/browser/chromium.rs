use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventRequestWillBeSent, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, EventLifecycleEvent, HandleJavaScriptDialogParams,
    SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::{Browser, BrowserConfig, Handler, Page};
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::driver::{
    BrowserDriver, BrowserPage, BrowserSession, LaunchOptions, NavigationResponse, RequestRecord,
};
use crate::error::BrowserError;

fn page_error(error: impl std::fmt::Display) -> BrowserError {
    BrowserError::Page(error.to_string())
}

/// Launches and attaches to Chromium over the DevTools protocol
pub struct ChromiumDriver;

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let mut builder = BrowserConfig::builder().request_timeout(options.request_timeout);
        if !options.headless {
            builder = builder.with_head();
        }
        if options.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &options.executable_path {
            builder = builder.chrome_executable(path);
        }
        if options.ignore_https_errors {
            builder = builder.arg("--ignore-certificate-errors");
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        Ok(ChromiumSession::start(browser, handler))
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let (browser, handler) = Browser::connect(endpoint.to_string())
            .await
            .map_err(|e| BrowserError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ChromiumSession::start(browser, handler))
    }
}

pub struct ChromiumSession {
    browser: Arc<Mutex<Browser>>,
    endpoint: String,
    connected: Arc<AtomicBool>,
    disconnected: watch::Receiver<bool>,
    handler: JoinHandle<()>,
}

impl ChromiumSession {
    fn start(browser: Browser, mut handler: Handler) -> Arc<dyn BrowserSession> {
        let endpoint = browser.websocket_address().clone();
        let connected = Arc::new(AtomicBool::new(true));
        let (notify, disconnected) = watch::channel(false);

        let flag = Arc::clone(&connected);
        let handler = tokio::spawn(async move {
            // The stream ends when the websocket to the browser closes
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler error");
                }
            }
            flag.store(false, Ordering::SeqCst);
            notify.send_replace(true);
        });

        Arc::new(Self {
            browser: Arc::new(Mutex::new(browser)),
            endpoint,
            connected,
            disconnected,
            handler,
        })
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    async fn user_agent(&self) -> Result<String, BrowserError> {
        let version = self.browser.lock().await.version().await.map_err(page_error)?;
        Ok(version.user_agent)
    }

    async fn new_page(&self, isolated: bool) -> Result<Box<dyn BrowserPage>, BrowserError> {
        if !self.is_connected() {
            return Err(BrowserError::Disconnected);
        }

        let (page, context) = {
            let browser = self.browser.lock().await;
            if isolated {
                let context = browser
                    .create_browser_context(CreateBrowserContextParams::default())
                    .await
                    .map_err(page_error)?;
                let params = CreateTargetParams::builder()
                    .url("about:blank")
                    .browser_context_id(context.clone())
                    .build()
                    .map_err(BrowserError::Page)?;
                (browser.new_page(params).await.map_err(page_error)?, Some(context))
            } else {
                (browser.new_page("about:blank").await.map_err(page_error)?, None)
            }
        };

        let page = ChromiumPage::attach(page, Arc::clone(&self.browser), context).await?;
        Ok(Box::new(page))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(page_error)?;
        if let Err(e) = browser.wait().await {
            debug!(error = %e, "waiting for browser exit failed");
        }
        Ok(())
    }
}

/// Requests of one page keyed by protocol request id
#[derive(Debug, Default)]
struct RequestLog {
    order: Vec<String>,
    by_id: HashMap<String, RequestRecord>,
    document: Option<NavigationResponse>,
}

impl RequestLog {
    fn on_request(&mut self, id: &str, url: &str, resource_type: Option<String>) {
        if !self.by_id.contains_key(id) {
            self.order.push(id.to_string());
        }
        // Redirects reuse the request id; keep the latest hop
        let record = self.by_id.entry(id.to_string()).or_default();
        record.url = url.to_string();
        if resource_type.is_some() {
            record.resource_type = resource_type;
        }
    }

    fn on_response(&mut self, id: &str, url: &str, status: u16, is_document: bool) {
        if is_document && self.document.is_none() {
            self.document = Some(NavigationResponse { url: url.to_string(), status });
        }
        if let Some(record) = self.by_id.get_mut(id) {
            record.status = Some(status);
        }
    }

    fn on_failure(&mut self, id: &str, reason: &str) {
        if let Some(record) = self.by_id.get_mut(id) {
            record.failure = Some(reason.to_string());
        }
    }

    fn records(&self) -> Vec<RequestRecord> {
        self.order.iter().filter_map(|id| self.by_id.get(id)).cloned().collect()
    }
}

struct ChromiumPage {
    page: Page,
    browser: Arc<Mutex<Browser>>,
    context: Option<BrowserContextId>,
    log: Arc<StdMutex<RequestLog>>,
    lifecycle: Mutex<EventStream<EventLifecycleEvent>>,
    listeners: Vec<JoinHandle<()>>,
}

impl ChromiumPage {
    async fn attach(
        page: Page,
        browser: Arc<Mutex<Browser>>,
        context: Option<BrowserContextId>,
    ) -> Result<Self, BrowserError> {
        page.execute(network::EnableParams::default()).await.map_err(page_error)?;
        page.execute(SetLifecycleEventsEnabledParams::new(true)).await.map_err(page_error)?;

        let lifecycle = page.event_listener::<EventLifecycleEvent>().await.map_err(page_error)?;
        let mut requests = page.event_listener::<EventRequestWillBeSent>().await.map_err(page_error)?;
        let mut responses = page.event_listener::<EventResponseReceived>().await.map_err(page_error)?;
        let mut failures = page.event_listener::<EventLoadingFailed>().await.map_err(page_error)?;
        let mut dialogs = page.event_listener::<EventJavascriptDialogOpening>().await.map_err(page_error)?;
        let mut console = page.event_listener::<EventConsoleApiCalled>().await.map_err(page_error)?;

        let log = Arc::new(StdMutex::new(RequestLog::default()));
        let mut listeners = Vec::with_capacity(5);

        let request_log = Arc::clone(&log);
        listeners.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                let kind = event.r#type.as_ref().map(|kind| format!("{kind:?}"));
                request_log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_request(event.request_id.inner(), &event.request.url, kind);
            }
        }));

        let response_log = Arc::clone(&log);
        listeners.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let status = u16::try_from(event.response.status).unwrap_or_default();
                response_log.lock().unwrap_or_else(PoisonError::into_inner).on_response(
                    event.request_id.inner(),
                    &event.response.url,
                    status,
                    event.r#type == ResourceType::Document,
                );
            }
        }));

        let failure_log = Arc::clone(&log);
        listeners.push(tokio::spawn(async move {
            while let Some(event) = failures.next().await {
                failure_log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_failure(event.request_id.inner(), &event.error_text);
            }
        }));

        let dialog_page = page.clone();
        listeners.push(tokio::spawn(async move {
            while let Some(event) = dialogs.next().await {
                debug!(message = %event.message, "dismissing dialog");
                if let Err(e) = dialog_page.execute(HandleJavaScriptDialogParams::new(false)).await {
                    debug!(error = %e, "unable to dismiss dialog");
                }
            }
        }));

        listeners.push(tokio::spawn(async move {
            while let Some(event) = console.next().await {
                let args: Vec<_> = event.args.iter().filter_map(|arg| arg.value.clone()).collect();
                trace!(kind = ?event.r#type, ?args, "console");
            }
        }));

        Ok(Self {
            page,
            browser,
            context,
            log,
            lifecycle: Mutex::new(lifecycle),
            listeners,
        })
    }

    /// Wait for the `networkIdle` lifecycle event of the document loading in `frame`
    async fn network_idle(&self, frame: Option<String>) {
        let mut events = self.lifecycle.lock().await;
        let mut idle = IdleWatch::new(frame);
        while let Some(event) = events.next().await {
            if idle.observe(event.frame_id.inner(), &event.name) {
                return;
            }
        }
    }
}

/// Follows the lifecycle events of the main frame. Child frames report their
/// own `networkIdle`, which says nothing about the document itself.
#[derive(Debug)]
struct IdleWatch {
    frame: Option<String>,
    loading: bool,
}

impl IdleWatch {
    fn new(frame: Option<String>) -> Self {
        Self { frame, loading: false }
    }

    /// True once the watched frame reached `networkIdle` after `init`
    fn observe(&mut self, frame: &str, name: &str) -> bool {
        if self.frame.as_deref().is_some_and(|main| main != frame) {
            return false;
        }
        match name {
            "init" => {
                self.loading = true;
                false
            }
            "networkIdle" => self.loading,
            _ => false,
        }
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError> {
        self.page
            .execute(SetUserAgentOverrideParams::new(user_agent.to_string()))
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Option<NavigationResponse>, BrowserError> {
        let frame = self.page.mainframe().await.map_err(page_error)?.map(|id| id.inner().clone());
        let load = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            self.network_idle(frame).await;
            Ok::<_, BrowserError>(())
        };
        tokio::time::timeout(timeout, load)
            .await
            .map_err(|_| BrowserError::Navigation(format!("{url} did not settle within {timeout:?}")))??;

        Ok(self.log.lock().unwrap_or_else(PoisonError::into_inner).document.clone())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Evaluate(e.to_string()))?
            .into_value::<serde_json::Value>()
            .map_err(|e| BrowserError::Evaluate(e.to_string()))
    }

    fn requests(&self) -> Vec<RequestRecord> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).records()
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let ChromiumPage { page, browser, context, listeners, .. } = *self;
        for listener in listeners {
            listener.abort();
        }
        let closed = page.close().await.map_err(page_error);
        if let Some(context) = context {
            if let Err(e) = browser.lock().await.dispose_browser_context(context).await {
                debug!(error = %e, "unable to dispose browser context");
            }
        }
        closed
    }
}
