use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::driver::{BrowserPage, BrowserSession, RequestRecord};
use super::lifecycle::BrowserLifecycleManager;
use super::timing::{PerformanceTimeline, TIMELINE_SCRIPT};
use crate::error::BrowserError;
use crate::monitoring::aggregate::aggregate;
use crate::monitoring::checker::{PRODUCT, Probe};
use crate::monitoring::types::{CheckReport, CheckType, ResourceMetric, Sample, SiteEntry, Timings};

/// What a browser check measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    /// Several full navigations, averaged
    #[default]
    Repeat,
    /// One navigation, reported together with its sub-resources
    Resources,
}

#[derive(Debug, Clone)]
pub struct BrowserProbeSettings {
    pub mode: BrowserMode,
    pub repeat_count: usize,
    /// Reuse the default context (and its cache) instead of an isolated one per navigation
    pub allow_caching: bool,
    pub user_agent: Option<String>,
    pub log_resource_errors: bool,
}

impl Default for BrowserProbeSettings {
    fn default() -> Self {
        Self {
            mode: BrowserMode::Repeat,
            repeat_count: 3,
            allow_caching: false,
            user_agent: None,
            log_resource_errors: false,
        }
    }
}

struct Visit {
    sample: Option<Sample>,
    resources: Vec<ResourceMetric>,
}

/// Full page loads in the shared browser
pub struct BrowserProbe {
    lifecycle: Arc<BrowserLifecycleManager>,
    settings: BrowserProbeSettings,
}

impl BrowserProbe {
    pub fn new(lifecycle: Arc<BrowserLifecycleManager>, settings: BrowserProbeSettings) -> Self {
        Self { lifecycle, settings }
    }

    async fn user_agent(&self, session: &dyn BrowserSession) -> Option<String> {
        if let Some(agent) = &self.settings.user_agent {
            return Some(agent.clone());
        }
        match session.user_agent().await {
            Ok(agent) => Some(format!("{agent} {PRODUCT}/{}", env!("CARGO_PKG_VERSION"))),
            Err(e) => {
                error!(error = %e, "unable to read browser user agent");
                None
            }
        }
    }

    /// Open a page, load the site once and always close the page again
    async fn visit(&self, session: &dyn BrowserSession, site: &SiteEntry, user_agent: Option<&str>) -> Result<Visit, BrowserError> {
        let page = session.new_page(!self.settings.allow_caching).await?;
        let outcome = self.load(page.as_ref(), site, user_agent).await;
        if let Err(e) = page.close().await {
            debug!(site = %site.name, error = %e, "unable to close page");
        }
        outcome
    }

    async fn load(&self, page: &dyn BrowserPage, site: &SiteEntry, user_agent: Option<&str>) -> Result<Visit, BrowserError> {
        if let Some(agent) = user_agent {
            if let Err(e) = page.set_user_agent(agent).await {
                error!(site = %site.name, error = %e, "unable to set user agent");
            }
        }

        let response = page
            .navigate(site.url.as_str(), site.probe_timeout())
            .await?
            .ok_or_else(|| BrowserError::Navigation(format!("no response from {}", site.url)))?;
        debug!(site = %site.name, status = response.status, url = %response.url, "page loaded");

        let requests = page.requests();
        self.log_failed_requests(site, &requests);

        let timeline = match page
            .evaluate(TIMELINE_SCRIPT)
            .await
            .and_then(|value| PerformanceTimeline::parse(&value).map_err(|e| BrowserError::Evaluate(e.to_string())))
        {
            Ok(timeline) => timeline,
            Err(e) => {
                warn!(site = %site.name, error = %e, "unable to read performance timeline");
                return Ok(Visit { sample: None, resources: Vec::new() });
            }
        };

        let sample = timeline.navigation().map(|navigation| navigation.to_sample(Some(response.status)));
        if sample.is_none() {
            warn!(site = %site.name, "page reported no navigation timing");
        }
        let resources = match self.settings.mode {
            BrowserMode::Resources => resource_metrics(&timeline, &requests),
            BrowserMode::Repeat => Vec::new(),
        };
        Ok(Visit { sample, resources })
    }

    fn log_failed_requests(&self, site: &SiteEntry, requests: &[RequestRecord]) {
        for request in requests {
            let Some(reason) = &request.failure else { continue };
            if self.settings.log_resource_errors {
                error!(site = %site.name, url = %request.url, %reason, "request failed");
            } else {
                debug!(site = %site.name, url = %request.url, %reason, "request failed");
            }
        }
    }
}

/// Join timeline entries with the observed requests; failed requests without
/// a timeline entry are reported with empty timings.
fn resource_metrics(timeline: &PerformanceTimeline, requests: &[RequestRecord]) -> Vec<ResourceMetric> {
    let mut metrics: Vec<ResourceMetric> = timeline
        .resources
        .iter()
        .map(|resource| {
            let request = requests.iter().rev().find(|request| request.url == resource.entry.name);
            ResourceMetric {
                name: resource.entry.name.clone(),
                resource_type: resource.initiator_type.clone(),
                status_code: request.and_then(|r| r.status).or(resource.entry.response_status),
                failure: request.and_then(|r| r.failure.clone()),
                timings: resource.timings(),
            }
        })
        .collect();

    for failed in requests.iter().filter(|request| request.failure.is_some()) {
        if metrics.iter().any(|metric| metric.name == failed.url) {
            continue;
        }
        metrics.push(ResourceMetric {
            name: failed.url.clone(),
            resource_type: failed.resource_type.clone().unwrap_or_else(|| "other".into()),
            status_code: failed.status,
            failure: failed.failure.clone(),
            timings: Timings::default(),
        });
    }
    metrics
}

#[async_trait]
impl Probe for BrowserProbe {
    async fn run(&self, site: &SiteEntry) -> Option<CheckReport> {
        let Some(session) = self.lifecycle.ready_session() else {
            warn!(site = %site.name, "browser not ready, skipping check");
            return None;
        };
        let user_agent = self.user_agent(session.as_ref()).await;

        let visits = match self.settings.mode {
            BrowserMode::Repeat => self.settings.repeat_count.max(1),
            BrowserMode::Resources => 1,
        };
        let mut batch = Vec::with_capacity(visits);
        let mut resources = Vec::new();

        for run in 0..visits {
            match self.visit(session.as_ref(), site, user_agent.as_deref()).await {
                Ok(visit) => {
                    batch.push(visit.sample);
                    resources.extend(visit.resources);
                }
                Err(e) => {
                    warn!(site = %site.name, run, error = %e, "navigation failed, discarding check");
                    return None;
                }
            }
        }
        self.lifecycle.record_probe_success();

        let metric = aggregate(&batch);
        if metric.completed == 0 {
            warn!(site = %site.name, "no navigation timings collected");
            return None;
        }

        debug!(
            site = %site.name,
            status = %metric.status_codes_string(),
            total_ms = metric.timings.total.unwrap_or_default(),
            resources = resources.len(),
            "browser check complete"
        );

        Some(CheckReport {
            site: site.name.clone(),
            check_type: CheckType::Browser,
            metric,
            resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::lifecycle::LifecycleConfig;
    use crate::browser::testing::{BROWSER_AGENT, MockBrowser, MockDriver, PageScript};
    use crate::monitoring::admission::AdmissionState;
    use crate::shutdown::FatalShutdown;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use url::Url;

    async fn ready_probe(browser: &Arc<MockBrowser>, settings: BrowserProbeSettings) -> (BrowserProbe, Arc<BrowserLifecycleManager>) {
        let lifecycle = BrowserLifecycleManager::new(
            Arc::new(MockDriver(Arc::clone(browser))),
            LifecycleConfig::default(),
            Arc::new(AdmissionState::new(5)),
            FatalShutdown::new(),
        );
        lifecycle.launch().await.unwrap();
        (BrowserProbe::new(Arc::clone(&lifecycle), settings), lifecycle)
    }

    fn site() -> SiteEntry {
        SiteEntry {
            name: "landing".into(),
            url: Url::parse("https://example.com/").unwrap(),
            check_interval: Duration::from_secs(60),
            check_type: CheckType::Browser,
            disabled: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn averages_repeated_navigations() {
        let browser = MockBrowser::new();
        browser.script_pages([
            PageScript::loaded(100.0, 200),
            PageScript::loaded(200.0, 200),
            PageScript::loaded(300.0, 304),
        ]);
        let (probe, lifecycle) = ready_probe(&browser, BrowserProbeSettings::default()).await;

        let report = probe.run(&site()).await.unwrap();

        assert_eq!(report.check_type, CheckType::Browser);
        assert_eq!(report.metric.attempts, 3);
        assert_eq!(report.metric.timings.total, Some(200.0));
        assert_eq!(report.metric.status_codes_string(), "200:200:304");
        assert!(report.resources.is_empty());
        assert_eq!(*browser.opened.lock().unwrap(), vec![true, true, true]);
        assert_eq!(browser.closed_pages.load(Ordering::SeqCst), 3);
        assert_eq!(lifecycle.restart_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_without_response_discards_check() {
        let browser = MockBrowser::new();
        browser.script_pages([PageScript::loaded(100.0, 200), PageScript::no_response()]);
        let (probe, lifecycle) = ready_probe(&browser, BrowserProbeSettings::default()).await;

        assert!(probe.run(&site()).await.is_none());
        assert_eq!(browser.opened.lock().unwrap().len(), 2);
        assert_eq!(browser.closed_pages.load(Ordering::SeqCst), 2);
        assert_eq!(lifecycle.restart_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_timeline_leaves_sample_absent() {
        let browser = MockBrowser::new();
        browser.script_pages([
            PageScript::loaded(300.0, 200),
            PageScript::malformed(200),
            PageScript::loaded(300.0, 200),
        ]);
        let (probe, _) = ready_probe(&browser, BrowserProbeSettings::default()).await;

        let report = probe.run(&site()).await.unwrap();
        assert_eq!(report.metric.completed, 2);
        assert_eq!(report.metric.timings.total, Some(200.0));
    }

    #[tokio::test(start_paused = true)]
    async fn caching_reuses_default_context() {
        let browser = MockBrowser::new();
        let settings = BrowserProbeSettings { allow_caching: true, repeat_count: 2, ..Default::default() };
        let (probe, _) = ready_probe(&browser, settings).await;

        probe.run(&site()).await.unwrap();
        assert_eq!(*browser.opened.lock().unwrap(), vec![false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn user_agent_extends_browser_default() {
        let browser = MockBrowser::new();
        let settings = BrowserProbeSettings { repeat_count: 1, ..Default::default() };
        let (probe, _) = ready_probe(&browser, settings).await;

        probe.run(&site()).await.unwrap();
        let agents = browser.user_agents.lock().unwrap().clone();
        assert_eq!(agents, vec![format!("{BROWSER_AGENT} {PRODUCT}/{}", env!("CARGO_PKG_VERSION"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_user_agent_is_used_verbatim() {
        let browser = MockBrowser::new();
        let settings = BrowserProbeSettings {
            repeat_count: 1,
            user_agent: Some("MonitorBot/2.0".into()),
            ..Default::default()
        };
        let (probe, _) = ready_probe(&browser, settings).await;

        probe.run(&site()).await.unwrap();
        assert_eq!(*browser.user_agents.lock().unwrap(), vec!["MonitorBot/2.0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_mode_reports_sub_resources() {
        let browser = MockBrowser::new();
        let timeline = json!({
            "navigation": [{ "name": "https://example.com/", "duration": 500.0 }],
            "resources": [
                { "name": "https://example.com/app.js", "initiatorType": "script", "duration": 40.0 },
                { "name": "https://example.com/logo.png", "initiatorType": "img", "duration": 10.0 }
            ]
        });
        browser.script_pages([PageScript {
            response: Some(200),
            timeline: serde_json::Value::String(timeline.to_string()),
            requests: vec![
                RequestRecord {
                    url: "https://example.com/app.js".into(),
                    resource_type: Some("Script".into()),
                    status: Some(200),
                    failure: None,
                },
                RequestRecord {
                    url: "https://example.com/logo.png".into(),
                    resource_type: Some("Image".into()),
                    status: Some(404),
                    failure: None,
                },
                RequestRecord {
                    url: "https://ads.example.net/tag.js".into(),
                    resource_type: Some("Script".into()),
                    status: None,
                    failure: Some("net::ERR_BLOCKED_BY_CLIENT".into()),
                },
            ],
        }]);
        let settings = BrowserProbeSettings { mode: BrowserMode::Resources, ..Default::default() };
        let (probe, _) = ready_probe(&browser, settings).await;

        let report = probe.run(&site()).await.unwrap();

        assert_eq!(report.metric.attempts, 1);
        assert_eq!(report.metric.timings.total, Some(500.0));
        assert_eq!(report.resources.len(), 3);
        assert_eq!(report.resources[0].resource_type, "script");
        assert_eq!(report.resources[0].timings.total, Some(40.0));
        assert_eq!(report.resources[1].status_code, Some(404));
        assert_eq!(report.resources[2].failure.as_deref(), Some("net::ERR_BLOCKED_BY_CLIENT"));
        assert_eq!(report.resources[2].timings, Timings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_browser_yields_nothing() {
        let browser = MockBrowser::new();
        let lifecycle = BrowserLifecycleManager::new(
            Arc::new(MockDriver(Arc::clone(&browser))),
            LifecycleConfig::default(),
            Arc::new(AdmissionState::new(5)),
            FatalShutdown::new(),
        );
        let probe = BrowserProbe::new(lifecycle, BrowserProbeSettings::default());

        assert!(probe.run(&site()).await.is_none());
        assert!(browser.opened.lock().unwrap().is_empty());
    }
}
