//! Browser-automation capability.
//!
//! The engine only talks to these traits; [`super::chromium`] provides the
//! Chromium implementation and tests provide scripted ones.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::BrowserError;

/// How to start a browser process
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub no_sandbox: bool,
    pub executable_path: Option<PathBuf>,
    pub ignore_https_errors: bool,
    /// Upper bound for a single protocol command
    pub request_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            no_sandbox: false,
            executable_path: None,
            ignore_https_errors: false,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Main-document response of a navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationResponse {
    pub url: String,
    pub status: u16,
}

/// A network request observed on a page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestRecord {
    pub url: String,
    pub resource_type: Option<String>,
    pub status: Option<u16>,
    /// Error text when the request failed to load
    pub failure: Option<String>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Start a new browser process
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError>;

    /// Attach to a browser that is already running at `endpoint`
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// A connected browser
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Endpoint that [`BrowserDriver::connect`] accepts
    fn endpoint(&self) -> String;

    /// Flips to `true` once the connection to the browser is lost
    fn disconnected(&self) -> watch::Receiver<bool>;

    /// The browser's own user agent
    async fn user_agent(&self) -> Result<String, BrowserError>;

    /// Open a blank page; `isolated` pages get a fresh context with an empty cache
    async fn new_page(&self, isolated: bool) -> Result<Box<dyn BrowserPage>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError>;

    /// Navigate and wait until the network is idle.
    ///
    /// `Ok(None)` means the navigation finished without a main-document response.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Option<NavigationResponse>, BrowserError>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// Requests seen since the page was opened, in request order
    fn requests(&self) -> Vec<RequestRecord>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}
