//! Typed records read from the page's performance timeline.

use serde::Deserialize;

use crate::monitoring::types::{Sample, Timings};

/// Script returning the navigation and resource entries as a JSON string
pub const TIMELINE_SCRIPT: &str = r#"JSON.stringify({
    navigation: performance.getEntriesByType('navigation').map((entry) => entry.toJSON()),
    resources: performance.getEntriesByType('resource').map((entry) => entry.toJSON())
})"#;

fn span(end: Option<f64>, start: Option<f64>) -> Option<f64> {
    let value = end? - start?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Fields shared by navigation and resource entries
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryTiming {
    pub name: String,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub domain_lookup_start: Option<f64>,
    pub domain_lookup_end: Option<f64>,
    pub connect_start: Option<f64>,
    pub connect_end: Option<f64>,
    pub secure_connection_start: Option<f64>,
    pub request_start: Option<f64>,
    pub response_start: Option<f64>,
    pub response_end: Option<f64>,
    pub transfer_size: Option<f64>,
    pub response_status: Option<u16>,
}

impl EntryTiming {
    fn network_timings(&self) -> Timings {
        // secureConnectionStart is 0 when no TLS handshake happened
        let tls_handshake = match self.secure_connection_start {
            Some(start) if start > 0.0 => span(self.connect_end, Some(start)),
            _ => None,
        };
        Timings {
            total: self.duration.filter(|d| d.is_finite() && *d >= 0.0),
            dns: span(self.domain_lookup_end, self.domain_lookup_start),
            connect: span(self.connect_end, self.connect_start),
            tls_handshake,
            ttfb: span(self.response_start, self.request_start),
            download: span(self.response_end, self.response_start),
            transfer_size: self.transfer_size,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NavigationTiming {
    #[serde(flatten)]
    pub entry: EntryTiming,
    pub dom_interactive: Option<f64>,
    pub dom_content_loaded_event_start: Option<f64>,
    pub dom_content_loaded_event_end: Option<f64>,
    pub dom_complete: Option<f64>,
}

impl NavigationTiming {
    pub fn timings(&self) -> Timings {
        Timings {
            dom_interactive: span(self.dom_interactive, self.entry.response_end),
            dom_content: span(self.dom_content_loaded_event_end, self.dom_content_loaded_event_start),
            dom_complete: span(self.dom_complete, self.dom_content_loaded_event_end),
            ..self.entry.network_timings()
        }
    }

    /// Sample for this navigation; `status` is the main-document response code
    pub fn to_sample(&self, status: Option<u16>) -> Sample {
        Sample {
            timings: self.timings(),
            status_code: status.or(self.entry.response_status),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceTiming {
    #[serde(flatten)]
    pub entry: EntryTiming,
    pub initiator_type: String,
}

impl ResourceTiming {
    pub fn timings(&self) -> Timings {
        self.entry.network_timings()
    }
}

/// Navigation and resource entries of one page load
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PerformanceTimeline {
    pub navigation: Vec<NavigationTiming>,
    pub resources: Vec<ResourceTiming>,
}

impl PerformanceTimeline {
    /// Accepts the JSON string produced by [`TIMELINE_SCRIPT`] or an already decoded object
    pub fn parse(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match value {
            serde_json::Value::String(raw) => serde_json::from_str(raw),
            other => Self::deserialize(other),
        }
    }

    /// The document's own navigation entry
    pub fn navigation(&self) -> Option<&NavigationTiming> {
        self.navigation.first()
    }
}
