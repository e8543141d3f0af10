use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Probe strategy used for a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Full page load in the shared browser
    #[default]
    Browser,
    /// Timed HTTP GET requests without rendering
    #[serde(alias = "http")]
    Curl,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckType::Browser => write!(f, "browser"),
            CheckType::Curl => write!(f, "curl"),
        }
    }
}

/// A validated, schedulable site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    /// Unique name, also used as the `website` tag on emitted points
    pub name: String,

    pub url: Url,

    /// Time between two fires of this site's timer
    pub check_interval: Duration,

    pub check_type: CheckType,

    pub disabled: bool,
}

impl SiteEntry {
    /// Per-request and per-navigation deadline: one second less than the interval
    pub fn probe_timeout(&self) -> Duration {
        self.check_interval
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }
}

/// Names of the timing fields carried by samples and aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingField {
    Total,
    Dns,
    Connect,
    TlsHandshake,
    PreTransfer,
    Ttfb,
    Download,
    DomInteractive,
    DomContent,
    DomComplete,
    TransferSize,
}

impl TimingField {
    pub const ALL: [TimingField; 11] = [
        TimingField::Total,
        TimingField::Dns,
        TimingField::Connect,
        TimingField::TlsHandshake,
        TimingField::PreTransfer,
        TimingField::Ttfb,
        TimingField::Download,
        TimingField::DomInteractive,
        TimingField::DomContent,
        TimingField::DomComplete,
        TimingField::TransferSize,
    ];

    /// Field key used on the wire
    pub fn key(self) -> &'static str {
        match self {
            TimingField::Total => "total",
            TimingField::Dns => "dns",
            TimingField::Connect => "connect",
            TimingField::TlsHandshake => "tls_handshake",
            TimingField::PreTransfer => "pre_transfer",
            TimingField::Ttfb => "ttfb",
            TimingField::Download => "download",
            TimingField::DomInteractive => "dom_int",
            TimingField::DomContent => "dom_content",
            TimingField::DomComplete => "dom_complete",
            TimingField::TransferSize => "transfer_size",
        }
    }
}

/// Timings in milliseconds (transfer size in bytes). Absent fields were not measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timings {
    pub total: Option<f64>,
    pub dns: Option<f64>,
    pub connect: Option<f64>,
    pub tls_handshake: Option<f64>,
    pub pre_transfer: Option<f64>,
    pub ttfb: Option<f64>,
    pub download: Option<f64>,
    pub dom_interactive: Option<f64>,
    pub dom_content: Option<f64>,
    pub dom_complete: Option<f64>,
    pub transfer_size: Option<f64>,
}

impl Timings {
    pub fn get(&self, field: TimingField) -> Option<f64> {
        match field {
            TimingField::Total => self.total,
            TimingField::Dns => self.dns,
            TimingField::Connect => self.connect,
            TimingField::TlsHandshake => self.tls_handshake,
            TimingField::PreTransfer => self.pre_transfer,
            TimingField::Ttfb => self.ttfb,
            TimingField::Download => self.download,
            TimingField::DomInteractive => self.dom_interactive,
            TimingField::DomContent => self.dom_content,
            TimingField::DomComplete => self.dom_complete,
            TimingField::TransferSize => self.transfer_size,
        }
    }

    pub fn set(&mut self, field: TimingField, value: Option<f64>) {
        let slot = match field {
            TimingField::Total => &mut self.total,
            TimingField::Dns => &mut self.dns,
            TimingField::Connect => &mut self.connect,
            TimingField::TlsHandshake => &mut self.tls_handshake,
            TimingField::PreTransfer => &mut self.pre_transfer,
            TimingField::Ttfb => &mut self.ttfb,
            TimingField::Download => &mut self.download,
            TimingField::DomInteractive => &mut self.dom_interactive,
            TimingField::DomContent => &mut self.dom_content,
            TimingField::DomComplete => &mut self.dom_complete,
            TimingField::TransferSize => &mut self.transfer_size,
        };
        *slot = value;
    }

    /// Iterate over the measured fields only
    pub fn present(&self) -> impl Iterator<Item = (TimingField, f64)> + '_ {
        TimingField::ALL
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
    }
}

/// One successful measurement of a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Sample {
    pub timings: Timings,
    pub status_code: Option<u16>,
}

/// Mean of one check's samples
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMetric {
    pub timings: Timings,

    /// Number of attempts in the batch (the divisor)
    pub attempts: usize,

    /// Number of attempts that produced a sample
    pub completed: usize,

    /// Status codes in the order the attempts completed
    pub status_codes: Vec<u16>,
}

impl AggregatedMetric {
    /// Status codes joined with ':' (e.g. "200:200:500")
    pub fn status_codes_string(&self) -> String {
        self.status_codes
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Last observed status code
    pub fn status_code(&self) -> Option<u16> {
        self.status_codes.last().copied()
    }
}

/// Per-sub-resource timings collected in resource mode
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceMetric {
    /// Resource URL
    pub name: String,

    /// Initiator type reported by the page (script, img, css, ...)
    pub resource_type: String,

    pub status_code: Option<u16>,

    /// Network failure text, if the request failed
    pub failure: Option<String>,

    pub timings: Timings,
}

/// Result of one completed check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub site: String,
    pub check_type: CheckType,
    pub metric: AggregatedMetric,
    pub resources: Vec<ResourceMetric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(interval_secs: u64) -> SiteEntry {
        SiteEntry {
            name: "example".into(),
            url: Url::parse("https://example.com").unwrap(),
            check_interval: Duration::from_secs(interval_secs),
            check_type: CheckType::Curl,
            disabled: false,
        }
    }

    #[test]
    fn probe_timeout_is_one_second_below_interval() {
        assert_eq!(site(60).probe_timeout(), Duration::from_secs(59));
        assert_eq!(site(1).probe_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn check_type_names() {
        assert_eq!(CheckType::Browser.to_string(), "browser");
        assert_eq!(CheckType::Curl.to_string(), "curl");

        #[derive(Deserialize)]
        struct Wrapper {
            check_type: CheckType,
        }
        let parsed: Wrapper = toml::from_str("check_type = \"http\"").unwrap();
        assert_eq!(parsed.check_type, CheckType::Curl);
    }

    #[test]
    fn timings_get_and_set_are_symmetric() {
        let mut timings = Timings::default();
        for (index, field) in TimingField::ALL.into_iter().enumerate() {
            timings.set(field, Some(index as f64));
        }
        for (index, field) in TimingField::ALL.into_iter().enumerate() {
            assert_eq!(timings.get(field), Some(index as f64));
        }
        assert_eq!(timings.present().count(), TimingField::ALL.len());
    }

    #[test]
    fn status_code_string_keeps_order() {
        let metric = AggregatedMetric {
            status_codes: vec![200, 200, 500],
            ..Default::default()
        };
        assert_eq!(metric.status_codes_string(), "200:200:500");
        assert_eq!(metric.status_code(), Some(500));
    }
}
