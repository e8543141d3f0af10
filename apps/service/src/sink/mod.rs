//! Metric sinks.
//!
//! Reports are flattened into [`MetricRecord`]s and handed to a
//! [`MetricsSink`]. The only production sink is InfluxDB.

pub mod influx;
pub mod line_protocol;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SinkError;
use crate::monitoring::types::{CheckReport, Timings};

pub use influx::InfluxSink;

/// Measurement holding one point per completed check
pub const CHECK_MEASUREMENT: &str = "benchmark";

/// Measurement holding one point per sub-resource in resource mode
pub const RESOURCE_MEASUREMENT: &str = "benchmark_resource";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

/// A single point: measurement, tags, fields and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    fn timings(mut self, timings: &Timings) -> Self {
        for (field, value) in timings.present() {
            self.fields.insert(field.key().to_string(), FieldValue::Float(value));
        }
        self
    }
}

/// Flatten a report into points, all stamped with `timestamp`
pub fn report_records(report: &CheckReport, instance: &str, timestamp: DateTime<Utc>) -> Vec<MetricRecord> {
    let mut check = MetricRecord::new(CHECK_MEASUREMENT, timestamp)
        .tag("website", report.site.as_str())
        .tag("instance", instance)
        .tag("check_type", report.check_type.to_string())
        .timings(&report.metric.timings);
    if let Some(status) = report.metric.status_code() {
        check = check
            .field("status_code", FieldValue::Integer(i64::from(status)))
            .field("status_codes", FieldValue::Text(report.metric.status_codes_string()));
    }

    let mut records = vec![check];
    for resource in &report.resources {
        let mut record = MetricRecord::new(RESOURCE_MEASUREMENT, timestamp)
            .tag("website", report.site.as_str())
            .tag("instance", instance)
            .tag("resource_type", resource.resource_type.as_str())
            .tag("resource", resource.name.as_str())
            .timings(&resource.timings);
        if let Some(status) = resource.status_code {
            record = record.field("status_code", FieldValue::Integer(i64::from(status)));
        }
        if let Some(failure) = &resource.failure {
            record = record.field("failure", FieldValue::Text(failure.clone()));
        }
        records.push(record);
    }
    records
}

/// Destination for metric points
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Verify the destination exists and is reachable
    async fn check_connection(&self) -> Result<(), SinkError>;

    async fn write_points(&self, records: &[MetricRecord]) -> Result<(), SinkError>;
}
