use std::sync::Arc;

use tracing::debug;

use super::checker::Probe;
use super::types::{CheckReport, CheckType, SiteEntry};

/// Probe executor - routes a fired site to the probe for its check type
pub struct ProbeExecutor {
    http: Arc<dyn Probe>,
    browser: Arc<dyn Probe>,
}

impl ProbeExecutor {
    pub fn new(http: Arc<dyn Probe>, browser: Arc<dyn Probe>) -> Self {
        Self { http, browser }
    }

    /// Run one check for `site`
    pub async fn execute(&self, site: &SiteEntry) -> Option<CheckReport> {
        let probe: &dyn Probe = match site.check_type {
            CheckType::Browser => self.browser.as_ref(),
            CheckType::Curl => self.http.as_ref(),
        };

        debug!(site = %site.name, check_type = %site.check_type, "running check");
        probe.run(site).await
    }
}
