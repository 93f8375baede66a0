use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::models::LayerStatus;

// ============================================================================
// Log page
// ============================================================================

/// One page of the replay + tail protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LogsPage {
    #[serde(default)]
    pub logs: Vec<RawLog>,
    /// Server's authoritative cursor for the next request.
    pub next_index: u64,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    #[ts(type = "Record<string, unknown> | null")]
    pub layer_status: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A log line as the backend sends it: either a bare string or an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(untagged)]
pub enum RawLog {
    Line(String),
    Entry(WireLog),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WireLog {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default, alias = "text")]
    pub message: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    #[ts(type = "string | number | null")]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, alias = "type")]
    pub level: Option<String>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub metadata: Option<serde_json::Value>,
}

impl RawLog {
    pub fn into_wire(self) -> WireLog {
        match self {
            RawLog::Line(message) => WireLog {
                message,
                ..Default::default()
            },
            RawLog::Entry(entry) => entry,
        }
    }
}

// ============================================================================
// Operation snapshot
// ============================================================================

/// Full run snapshot returned by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OperationSnapshot {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub logs: Vec<RawLog>,
    #[serde(default)]
    #[ts(type = "Record<string, unknown> | null")]
    pub layer_status: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    #[ts(type = "string | number | null")]
    pub started_at: Option<serde_json::Value>,
    #[serde(default)]
    #[ts(type = "string | number | null")]
    pub completed_at: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

// ============================================================================
// Normalization helpers
// ============================================================================

/// Flatten a sparse layer-status payload into `layer -> state`.
///
/// Values may be plain strings or objects carrying a `status` field; anything
/// else is kept as its JSON text. Null values are dropped.
pub fn normalize_layer_status(raw: &BTreeMap<String, serde_json::Value>) -> LayerStatus {
    raw.iter()
        .filter_map(|(layer, value)| {
            let state = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Object(obj) => match obj.get("status").and_then(|s| s.as_str()) {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                },
                other => other.to_string(),
            };
            Some((layer.clone(), state))
        })
        .collect()
}

/// Accept RFC 3339 strings or unix epochs (seconds, or milliseconds when large).
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<f64>().ok().and_then(epoch_to_datetime)),
        serde_json::Value::Number(n) => n.as_f64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let millis = if epoch > 1e11 { epoch } else { epoch * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}
