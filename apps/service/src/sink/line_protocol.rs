//! InfluxDB line protocol encoding.

use super::{FieldValue, MetricRecord};

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\n' {
            out.push_str("\\n");
            continue;
        }
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_key(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn encode_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) if v.is_finite() => Some(v.to_string()),
        FieldValue::Float(_) => None,
        FieldValue::Integer(v) => Some(format!("{v}i")),
        FieldValue::Text(v) => Some(format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))),
    }
}

/// Encode one record, or `None` if it has no writable field.
///
/// Empty tag values and non-finite floats are dropped.
pub fn encode(record: &MetricRecord) -> Option<String> {
    let fields: Vec<String> = record
        .fields
        .iter()
        .filter_map(|(key, value)| encode_field(value).map(|v| format!("{}={v}", escape_key(key))))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&record.measurement);
    for (key, value) in record.tags.iter().filter(|(_, value)| !value.is_empty()) {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields.join(","));

    if let Some(nanos) = record.timestamp.timestamp_nanos_opt() {
        line.push(' ');
        line.push_str(&nanos.to_string());
    }
    Some(line)
}

/// Encode a batch, one line per writable record
pub fn encode_batch(records: &[MetricRecord]) -> String {
    records.iter().filter_map(encode).collect::<Vec<_>>().join("\n")
}
