//! Edit risk scoring, rolling anomaly detection and triage ranking.

mod forest;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infoguard_core::{
    clamp_unit, is_flagged, round_to, AnomalyRecord, ContentRisk, PriorityEntry, RunSummary,
    TopicCluster, UsernameRisk,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use forest::{contamination_threshold, EditFeatures, ForestConfig, ForestError, ForestScreen};

pub const CRATE_NAME: &str = "infoguard-analysis";

/// Terms whose presence in new text raises content risk.
pub const RISK_LEXICON: &[&str] = &[
    "propaganda",
    "agenda",
    "fake",
    "exposed",
    "corrupt",
    "biased",
    "manipulated",
    "truth",
];

/// Author-name fragments associated with impersonation or advocacy accounts.
pub const SUSPICIOUS_USERNAME_KEYWORDS: &[&str] = &[
    "official",
    "admin",
    "moderator",
    "verified",
    "gov",
    "government",
    "bjp",
    "congress",
    "party",
    "election",
    "vote",
    "politics",
    "truth",
    "real",
    "exposed",
    "agenda",
    "media",
    "news",
    "facts",
    "brand",
    "store",
    "shop",
    "officialpage",
    "anti",
    "pro",
    "support",
    "boycott",
];

pub const CONTENT_TERM_WEIGHT: f64 = 0.2;

pub const USERNAME_KEYWORD_WEIGHT: f64 = 0.3;
pub const USERNAME_DIGITS_WEIGHT: f64 = 0.2;
pub const USERNAME_ALL_CAPS_WEIGHT: f64 = 0.2;
pub const USERNAME_TOKEN_CAP: f64 = 0.3;
pub const USERNAME_MIN_DIGIT_RUN: usize = 3;

pub const SEMANTIC_WEIGHT: f64 = 0.4;
pub const CONTENT_WEIGHT: f64 = 0.4;
pub const USERNAME_WEIGHT: f64 = 0.2;

pub const REASON_EXCESSIVE_NUMBERS: &str = "excessive_numbers";
pub const REASON_ALL_CAPS: &str = "all_caps";

// ---------------------------------------------------------------------------
// Lexical and author heuristics
// ---------------------------------------------------------------------------

pub fn content_risk(new_text: &str) -> ContentRisk {
    let lowered = new_text.to_lowercase();
    let matched_terms = RISK_LEXICON
        .iter()
        .filter(|term| lowered.contains(*term))
        .map(|term| term.to_string())
        .collect::<Vec<_>>();
    let score = (matched_terms.len() as f64 * CONTENT_TERM_WEIGHT).min(1.0);
    ContentRisk {
        score: round_to(score, 2),
        matched_terms,
    }
}

/// Lower-cased ASCII alphabetic runs of the name.
pub fn username_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

// `\d` is any Unicode decimal digit, not only ASCII.
static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\d{{{USERNAME_MIN_DIGIT_RUN},}}")).unwrap());

/// True when the name has cased characters and none of them are lower-case.
fn is_all_caps(name: &str) -> bool {
    let mut has_cased = false;
    for c in name.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}

pub fn username_risk(name: &str) -> UsernameRisk {
    let lowered = name.to_lowercase();
    let matched_keywords = SUSPICIOUS_USERNAME_KEYWORDS
        .iter()
        .filter(|keyword| lowered.contains(*keyword))
        .collect::<Vec<_>>();
    let has_numbers = DIGIT_RUN.is_match(&lowered);
    let all_caps = is_all_caps(name);

    let tokens = username_tokens(name);
    let risky_tokens = tokens
        .iter()
        .filter(|token| SUSPICIOUS_USERNAME_KEYWORDS.contains(&token.as_str()))
        .collect::<Vec<_>>();
    let token_ratio = risky_tokens.len() as f64 / tokens.len().max(1) as f64;

    let mut score = 0.0;
    if !matched_keywords.is_empty() {
        score += USERNAME_KEYWORD_WEIGHT;
    }
    if has_numbers {
        score += USERNAME_DIGITS_WEIGHT;
    }
    if all_caps {
        score += USERNAME_ALL_CAPS_WEIGHT;
    }
    score += token_ratio.min(USERNAME_TOKEN_CAP);

    let mut reasons = BTreeSet::new();
    reasons.extend(matched_keywords.iter().map(|k| k.to_string()));
    reasons.extend(risky_tokens.iter().map(|t| t.to_string()));
    if has_numbers {
        reasons.insert(REASON_EXCESSIVE_NUMBERS.to_string());
    }
    if all_caps {
        reasons.insert(REASON_ALL_CAPS.to_string());
    }

    UsernameRisk {
        score: round_to(score.min(1.0), 2),
        reasons: reasons.into_iter().collect(),
        has_numbers,
        all_caps,
    }
}

// ---------------------------------------------------------------------------
// Semantic similarity oracle
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("similarity service unavailable: {0}")]
    Unavailable(String),
    #[error("similarity service returned malformed output: {0}")]
    Malformed(String),
}

/// Deterministic text similarity in `[0, 1]`. Only ever called with two non-empty texts.
#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    async fn similarity(&self, text_a: &str, text_b: &str) -> Result<f64, OracleError>;
}

/// Character-bigram Sørensen–Dice similarity. Used when no embedding service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOracle;

#[async_trait]
impl SimilarityOracle for LexicalOracle {
    async fn similarity(&self, text_a: &str, text_b: &str) -> Result<f64, OracleError> {
        Ok(strsim::sorensen_dice(text_a, text_b))
    }
}

/// Similarity between two revisions' clean text; 1.0 whenever either side is empty.
pub async fn semantic_similarity(
    oracle: &dyn SimilarityOracle,
    old_text: &str,
    new_text: &str,
) -> Result<f64, OracleError> {
    if old_text.is_empty() || new_text.is_empty() {
        return Ok(1.0);
    }
    let raw = oracle.similarity(old_text, new_text).await?;
    Ok(round_to(clamp_unit(raw), 3))
}

/// Combined verdict for one edit, before it is attached to a revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditScore {
    pub semantic_similarity: f64,
    pub content_risk: ContentRisk,
    pub username_risk: UsernameRisk,
    pub final_risk: f64,
    pub flagged: bool,
}

impl EditScore {
    pub fn combine(semantic_similarity: f64, new_text: &str, author: &str) -> Self {
        let semantic_similarity = clamp_unit(semantic_similarity);
        let content_risk = content_risk(new_text);
        let username_risk = username_risk(author);
        let semantic_risk = 1.0 - semantic_similarity;
        let final_risk = clamp_unit(round_to(
            SEMANTIC_WEIGHT * semantic_risk
                + CONTENT_WEIGHT * content_risk.score
                + USERNAME_WEIGHT * username_risk.score,
            3,
        ));
        Self {
            semantic_similarity,
            content_risk,
            username_risk,
            final_risk,
            flagged: is_flagged(final_risk),
        }
    }
}

pub async fn score_edit(
    oracle: &dyn SimilarityOracle,
    old_text: &str,
    new_text: &str,
    author: &str,
) -> Result<EditScore, OracleError> {
    let similarity = semantic_similarity(oracle, old_text, new_text).await?;
    Ok(EditScore::combine(similarity, new_text, author))
}

// ---------------------------------------------------------------------------
// Rolling z-score anomaly detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct AnomalyConfig {
    pub window: usize,
    pub threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: 10,
            threshold: 2.0,
        }
    }
}

/// Trailing-window statistics for one point of a series. NaN until the window is full.
#[derive(Debug, Clone, Copy)]
pub struct RollingPoint {
    pub value: f64,
    pub rolling_mean: f64,
    pub rolling_std: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMetric {
    EditVolume,
    FlagCount,
}

impl RunMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMetric::EditVolume => "edit_volume",
            RunMetric::FlagCount => "flag_count",
        }
    }

    fn value(&self, run: &RunSummary) -> f64 {
        match self {
            RunMetric::EditVolume => run.changes_detected as f64,
            RunMetric::FlagCount => run.flagged_count as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunAnomaly {
    pub metric: RunMetric,
    pub cycle_at: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
}

/// One point of the global, time-ordered risk stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskObservation {
    pub document_id: String,
    pub timestamp: DateTime<Utc>,
    pub final_risk: f64,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config: AnomalyConfig {
                window: config.window.max(2),
                threshold: config.threshold,
            },
        }
    }

    pub fn config(&self) -> AnomalyConfig {
        self.config
    }

    pub fn rolling(&self, values: &[f64]) -> Vec<RollingPoint> {
        let w = self.config.window;
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                if i + 1 < w {
                    return RollingPoint {
                        value,
                        rolling_mean: f64::NAN,
                        rolling_std: f64::NAN,
                        z_score: f64::NAN,
                        is_anomaly: false,
                    };
                }
                let window = &values[i + 1 - w..=i];
                let mean = window.iter().sum::<f64>() / w as f64;
                let variance =
                    window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (w as f64 - 1.0);
                let std = variance.sqrt();
                // Identical values can leave rounding residue in the mean; keep them undefined.
                let z_score = if window.iter().all(|v| *v == window[0]) {
                    f64::NAN
                } else {
                    (value - mean) / std
                };
                RollingPoint {
                    value,
                    rolling_mean: mean,
                    rolling_std: std,
                    z_score,
                    is_anomaly: z_score.abs() > self.config.threshold,
                }
            })
            .collect()
    }

    /// Indices of anomalous points with their z-scores.
    pub fn detect(&self, values: &[f64]) -> Vec<(usize, f64)> {
        self.rolling(values)
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_anomaly)
            .map(|(i, p)| (i, p.z_score))
            .collect()
    }

    /// Risk-score spikes over the global edit stream; `observations` must be time-ordered.
    pub fn detect_risk_spikes(
        &self,
        observations: &[RiskObservation],
        detected_at: DateTime<Utc>,
    ) -> Vec<AnomalyRecord> {
        let values = observations.iter().map(|o| o.final_risk).collect::<Vec<_>>();
        self.detect(&values)
            .into_iter()
            .map(|(i, z_score)| AnomalyRecord {
                document_id: observations[i].document_id.clone(),
                timestamp: observations[i].timestamp,
                value: observations[i].final_risk,
                z_score,
                detected_at,
            })
            .collect()
    }

    /// Outlier cycles on one per-run channel; `runs` must be ordered by cycle time.
    pub fn detect_run_anomalies(&self, runs: &[RunSummary], metric: RunMetric) -> Vec<RunAnomaly> {
        let values = runs.iter().map(|r| metric.value(r)).collect::<Vec<_>>();
        self.detect(&values)
            .into_iter()
            .map(|(i, z_score)| RunAnomaly {
                metric,
                cycle_at: runs[i].cycle_at,
                value: values[i],
                z_score,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Triage ranking
// ---------------------------------------------------------------------------

/// Weights of the canonical five-term priority formula.
///
/// A simpler three-term variant (`0.5·avg_risk + 0.3·anomaly_boost + 0.2·edit_velocity`)
/// has been used historically; it is intentionally not offered here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityWeights {
    pub avg_risk: f64,
    pub max_risk: f64,
    pub flag_rate: f64,
    pub anomaly_boost: f64,
    pub edit_velocity: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            avg_risk: 0.35,
            max_risk: 0.25,
            flag_rate: 0.20,
            anomaly_boost: 0.10,
            edit_velocity: 0.10,
        }
    }
}

impl PriorityWeights {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSample {
    pub document_id: String,
    pub final_risk: f64,
    pub flagged: bool,
}

#[derive(Default)]
struct DocumentAggregate {
    total_risk: f64,
    max_risk: f64,
    count: u32,
    flagged: u32,
}

pub struct PriorityRanker {
    weights: PriorityWeights,
}

impl PriorityRanker {
    pub fn new(weights: PriorityWeights) -> Self {
        Self { weights }
    }

    /// Full ranking, highest priority first. Take a prefix for a top-K triage list.
    pub fn rank(
        &self,
        samples: &[RiskSample],
        anomalous_documents: &HashSet<String>,
    ) -> Vec<PriorityEntry> {
        let mut by_document: BTreeMap<&str, DocumentAggregate> = BTreeMap::new();
        for sample in samples {
            let agg = by_document.entry(sample.document_id.as_str()).or_default();
            agg.total_risk += sample.final_risk;
            agg.max_risk = agg.max_risk.max(sample.final_risk);
            agg.count += 1;
            if sample.flagged {
                agg.flagged += 1;
            }
        }

        let max_volume = by_document.values().map(|a| a.count).max().unwrap_or(1).max(1);
        let w = self.weights;

        let mut entries = by_document
            .into_iter()
            .map(|(document_id, agg)| {
                let count = agg.count as f64;
                let avg_risk = agg.total_risk / count;
                let flag_rate = agg.flagged as f64 / count;
                let anomaly_boost = if anomalous_documents.contains(document_id) {
                    1.0
                } else {
                    0.0
                };
                let edit_velocity = count / max_volume as f64;
                let priority_score = w.avg_risk * avg_risk
                    + w.max_risk * agg.max_risk
                    + w.flag_rate * flag_rate
                    + w.anomaly_boost * anomaly_boost
                    + w.edit_velocity * edit_velocity;
                PriorityEntry {
                    document_id: document_id.to_string(),
                    avg_risk,
                    max_risk: agg.max_risk,
                    edit_volume: agg.count,
                    flag_rate,
                    anomaly_boost,
                    edit_velocity,
                    priority_score,
                }
            })
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| {
            b.priority_score
                .total_cmp(&a.priority_score)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        entries
    }
}

// ---------------------------------------------------------------------------
// Topic clustering collaborator
// ---------------------------------------------------------------------------

/// Edits at or above this risk feed topic clustering.
pub const TOPIC_RISK_THRESHOLD: f64 = 0.35;
pub const TOPIC_MIN_DOCUMENTS: usize = 5;
pub const TOPIC_MAX_KEYWORDS: usize = 5;

const TOPIC_STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "in", "on", "at", "to", "of", "by", "from", "is", "was",
];

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("clustering service unavailable: {0}")]
    Unavailable(String),
    #[error("clustering service returned malformed output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait TopicClusterer: Send + Sync {
    /// `None` when clustering is not configured; the stored snapshot is then left alone.
    async fn cluster(&self, texts: &[String]) -> Result<Option<Vec<TopicCluster>>, ClusterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTopicClusterer;

#[async_trait]
impl TopicClusterer for NoopTopicClusterer {
    async fn cluster(&self, _texts: &[String]) -> Result<Option<Vec<TopicCluster>>, ClusterError> {
        Ok(None)
    }
}

/// First three meaningful keywords, capitalized and comma-joined.
pub fn clean_topic_label(keywords: &[String]) -> String {
    keywords
        .iter()
        .filter(|w| !TOPIC_STOPWORDS.contains(&w.as_str()) && w.chars().count() > 2)
        .take(3)
        .map(|w| capitalize(w))
        .collect::<Vec<_>>()
        .join(", ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
