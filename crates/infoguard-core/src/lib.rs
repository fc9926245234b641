//! Core domain model for InfoGuard: watched documents, revisions, edit analyses and run records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "infoguard-core";

/// An edit is flagged for review at or above this final risk.
pub const FLAG_THRESHOLD: f64 = 0.5;

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Clamp into the closed unit interval. NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub fn is_flagged(final_risk: f64) -> bool {
    final_risk >= FLAG_THRESHOLD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Active,
    Paused,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Active => "active",
            WatchStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown watch status `{0}`")]
pub struct UnknownWatchStatus(pub String);

impl FromStr for WatchStatus {
    type Err = UnknownWatchStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WatchStatus::Active),
            "paused" => Ok(WatchStatus::Paused),
            other => Err(UnknownWatchStatus(other.to_string())),
        }
    }
}

/// Per-document monitoring state owned by the watchlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedDocument {
    pub document_id: String,
    pub last_seen_revision_id: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub watch_status: WatchStatus,
    pub priority_score: f64,
    pub added_at: DateTime<Utc>,
}

/// One stored version of a document, written only when a change against the baseline is seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub document_id: String,
    pub revision_id: i64,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
    pub raw_content: String,
    pub clean_content: String,
    pub content_sha256: String,
    pub previous_revision_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentRisk {
    pub score: f64,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsernameRisk {
    pub score: f64,
    pub reasons: Vec<String>,
    pub has_numbers: bool,
    pub all_caps: bool,
}

/// Risk verdict for a single edit. Exactly one per [`Revision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditAnalysis {
    pub document_id: String,
    pub revision_id: i64,
    pub author: String,
    pub semantic_similarity: f64,
    pub content_risk: ContentRisk,
    pub username_risk: UsernameRisk,
    pub final_risk: f64,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

/// Risk-score outlier, keyed by `(timestamp, document_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub document_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
    pub detected_at: DateTime<Utc>,
}

/// Edit whose `(final_risk, semantic_similarity)` pair an isolation forest marks as an
/// outlier. The stored set is a snapshot replaced on every sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAnomaly {
    pub document_id: String,
    pub revision_id: i64,
    pub final_risk: f64,
    pub semantic_similarity: f64,
    pub anomaly_score: f64,
}

/// One record per completed monitoring cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub cycle_at: DateTime<Utc>,
    pub documents_checked: u32,
    pub documents_discovered: u32,
    pub changes_detected: u32,
    pub flagged_count: u32,
    pub duration_seconds: f64,
}

/// Triage ranking row. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub document_id: String,
    pub avg_risk: f64,
    pub max_risk: f64,
    pub edit_volume: u32,
    pub flag_rate: f64,
    pub anomaly_boost: f64,
    pub edit_velocity: f64,
    pub priority_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCluster {
    pub topic_id: i64,
    pub count: u32,
    pub label: String,
    pub keywords: Vec<String>,
}
