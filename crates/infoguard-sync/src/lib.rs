//! Monitoring cycle orchestration: discovery, ingestion, sweeps, ranking and reports.

mod reports;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use infoguard_adapters::{
    normalize_markup, top_edited_documents, ClusteringServiceClient, CorpusSource,
    EmbeddingServiceOracle, MediaWikiSource, DEFAULT_API_URL,
};
use infoguard_analysis::{
    score_edit, AnomalyConfig, AnomalyDetector, EditFeatures, ForestConfig, ForestScreen,
    LexicalOracle, NoopTopicClusterer, PriorityRanker, PriorityWeights, RiskObservation,
    RiskSample, RunAnomaly, RunMetric, SimilarityOracle, TopicClusterer, TOPIC_MIN_DOCUMENTS,
    TOPIC_RISK_THRESHOLD,
};
use infoguard_core::{
    AnomalyRecord, EditAnalysis, ModelAnomaly, PriorityEntry, Revision, RunSummary, TopicCluster,
};
use infoguard_storage::{sha256_hex, HttpClientConfig, HttpFetcher, RevisionArchive, Store};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reports::{
    render_triage_brief, write_report_bundle, CycleReport, SnapshotManifest, SnapshotManifestFile,
};

pub const CRATE_NAME: &str = "infoguard-sync";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_request_interval: Option<Duration>,
    pub max_documents: usize,
    pub discovery_limit: usize,
    pub discovery_top_n: usize,
    pub embedding_url: Option<String>,
    pub cluster_url: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub report_top_k: usize,
    pub scheduler_cron: String,
    pub cycle_deadline: Option<Duration>,
    pub ranking_file: Option<PathBuf>,
    pub risk_history_limit: usize,
    pub run_history_limit: usize,
    pub topic_lookback: chrono::Duration,
    pub anomaly: AnomalyConfig,
    pub forest: ForestConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://infoguard.db".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: "infoguard/0.1 (revision monitor)".to_string(),
            http_timeout_secs: 20,
            min_request_interval: None,
            max_documents: 100,
            discovery_limit: 80,
            discovery_top_n: 10,
            embedding_url: None,
            cluster_url: None,
            archive_dir: None,
            reports_dir: Some(PathBuf::from("reports")),
            report_top_k: 10,
            scheduler_cron: "0 0 * * * *".to_string(),
            cycle_deadline: None,
            ranking_file: None,
            risk_history_limit: 300,
            run_history_limit: 200,
            topic_lookback: chrono::Duration::hours(6),
            anomaly: AnomalyConfig::default(),
            forest: ForestConfig::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            api_url: env_string("INFOGUARD_API_URL").unwrap_or(defaults.api_url),
            user_agent: env_string("INFOGUARD_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("INFOGUARD_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            min_request_interval: env_parse::<u64>("INFOGUARD_MIN_REQUEST_INTERVAL_MS")
                .map(Duration::from_millis),
            max_documents: env_parse("INFOGUARD_MAX_DOCUMENTS").unwrap_or(defaults.max_documents),
            discovery_limit: env_parse("INFOGUARD_DISCOVERY_LIMIT")
                .unwrap_or(defaults.discovery_limit),
            discovery_top_n: env_parse("INFOGUARD_DISCOVERY_TOP_N")
                .unwrap_or(defaults.discovery_top_n),
            embedding_url: env_string("INFOGUARD_EMBEDDING_URL"),
            cluster_url: env_string("INFOGUARD_CLUSTER_URL"),
            archive_dir: env_string("INFOGUARD_ARCHIVE_DIR").map(PathBuf::from),
            // set but empty disables reports
            reports_dir: match std::env::var("INFOGUARD_REPORTS_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v.trim())),
                Err(_) => defaults.reports_dir,
            },
            report_top_k: defaults.report_top_k,
            scheduler_cron: env_string("INFOGUARD_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
            cycle_deadline: env_parse::<u64>("INFOGUARD_CYCLE_DEADLINE_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            ranking_file: env_string("INFOGUARD_RANKING_FILE").map(PathBuf::from),
            ..defaults
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_interval: self.min_request_interval,
            ..Default::default()
        }
    }

    pub fn load_weights(&self) -> Result<PriorityWeights> {
        match &self.ranking_file {
            Some(path) => PriorityWeights::from_yaml_file(path),
            None => Ok(PriorityWeights::default()),
        }
    }
}

/// What happened to one watched document during ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The corpus could not be read or returned an unexpected shape; nothing was touched.
    Skipped,
    /// First observation: the fetched revision became the baseline without analysis.
    BaselineEstablished { revision_id: i64 },
    Unchanged,
    /// The corpus returned an older revision than the stored baseline.
    Stale { fetched: i64, baseline: i64 },
    /// The revision was already stored by an interrupted cycle.
    Replayed { revision_id: i64 },
    Analyzed(Box<EditAnalysis>),
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, IngestOutcome::Analyzed(_))
    }

    pub fn flagged(&self) -> bool {
        matches!(self, IngestOutcome::Analyzed(analysis) if analysis.flagged)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub risk_anomalies: Vec<AnomalyRecord>,
    pub run_anomalies: Vec<RunAnomaly>,
    /// Empty when the history was too short to fit the forest.
    pub model_anomalies: Vec<ModelAnomaly>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopicRefresh {
    /// Too few high-risk edits in the lookback window.
    BelowMinimum { high_risk_edits: usize },
    NotConfigured,
    Replaced(Vec<TopicCluster>),
}

pub struct MonitorPipeline {
    config: MonitorConfig,
    store: Store,
    source: Box<dyn CorpusSource>,
    oracle: Box<dyn SimilarityOracle>,
    clusterer: Box<dyn TopicClusterer>,
    archive: Option<RevisionArchive>,
    detector: AnomalyDetector,
    forest: ForestScreen,
    ranker: PriorityRanker,
}

impl MonitorPipeline {
    /// Wire the production collaborators described by `config`.
    pub fn new(config: MonitorConfig, store: Store) -> Result<Self> {
        let http_config = config.http_client_config();
        let source = MediaWikiSource::new(
            HttpFetcher::new(http_config.clone()).context("building corpus http client")?,
            config.api_url.clone(),
        );

        let oracle: Box<dyn SimilarityOracle> = match &config.embedding_url {
            Some(url) => Box::new(EmbeddingServiceOracle::new(
                HttpFetcher::new(http_config.clone()).context("building embedding http client")?,
                url.clone(),
            )),
            None => Box::new(LexicalOracle),
        };
        let clusterer: Box<dyn TopicClusterer> = match &config.cluster_url {
            Some(url) => Box::new(ClusteringServiceClient::new(
                HttpFetcher::new(http_config).context("building clustering http client")?,
                url.clone(),
            )),
            None => Box::new(NoopTopicClusterer),
        };

        let weights = config.load_weights()?;
        let archive = config.archive_dir.clone().map(RevisionArchive::new);
        Ok(Self {
            detector: AnomalyDetector::new(config.anomaly),
            forest: ForestScreen::new(config.forest),
            ranker: PriorityRanker::new(weights),
            config,
            store,
            source: Box::new(source),
            oracle,
            clusterer,
            archive,
        })
    }

    pub fn with_collaborators(
        mut self,
        source: Box<dyn CorpusSource>,
        oracle: Box<dyn SimilarityOracle>,
        clusterer: Box<dyn TopicClusterer>,
    ) -> Self {
        self.source = source;
        self.oracle = oracle;
        self.clusterer = clusterer;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Promote the most-edited documents of the recent-changes feed. Returns the newly
    /// watched titles; a failed feed fetch promotes nothing.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let Some(changes) = self.source.fetch_recent_changes(self.config.discovery_limit).await
        else {
            warn!("recent-changes feed unavailable; skipping discovery");
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let mut promoted = Vec::new();
        for title in top_edited_documents(&changes, self.config.discovery_top_n) {
            if self
                .store
                .register_document(&title, now)
                .await
                .with_context(|| format!("registering {title}"))?
            {
                info!(document = %title, "promoted to watchlist");
                promoted.push(title);
            }
        }
        Ok(promoted)
    }

    pub async fn ingest_document(&self, document_id: &str) -> Result<IngestOutcome> {
        let Some(snapshot) = self.source.fetch_latest_revision(document_id).await else {
            info!(document = document_id, "no usable revision; skipping");
            return Ok(IngestOutcome::Skipped);
        };

        let now = Utc::now();
        let baseline = self
            .store
            .get_document(document_id)
            .await?
            .and_then(|doc| doc.last_seen_revision_id);
        let revision_id = snapshot.revision_id;

        let baseline = match baseline {
            None => {
                self.store.register_document(document_id, now).await?;
                self.store.mark_checked(document_id, Some(revision_id), now).await?;
                info!(document = document_id, revision_id, "baseline established");
                return Ok(IngestOutcome::BaselineEstablished { revision_id });
            }
            Some(baseline) if revision_id == baseline => {
                self.store.mark_checked(document_id, None, now).await?;
                return Ok(IngestOutcome::Unchanged);
            }
            Some(baseline) if revision_id < baseline => {
                warn!(document = document_id, fetched = revision_id, baseline, "stale revision read");
                self.store.mark_checked(document_id, None, now).await?;
                return Ok(IngestOutcome::Stale {
                    fetched: revision_id,
                    baseline,
                });
            }
            Some(baseline) => baseline,
        };

        let clean_content = normalize_markup(&snapshot.content);
        let previous_text = self
            .store
            .latest_clean_content(document_id)
            .await?
            .unwrap_or_default();
        let score = score_edit(
            self.oracle.as_ref(),
            &previous_text,
            &clean_content,
            &snapshot.author,
        )
        .await
        .with_context(|| format!("scoring revision {revision_id} of {document_id}"))?;

        if let Some(archive) = &self.archive {
            let archived = archive
                .store(document_id, revision_id, &snapshot.content)
                .await
                .with_context(|| format!("archiving revision {revision_id} of {document_id}"))?;
            if !archived.deduplicated {
                info!(path = %archived.relative_path.display(), bytes = archived.byte_size, "archived raw revision");
            }
        }

        let revision = Revision {
            document_id: document_id.to_string(),
            revision_id,
            author: snapshot.author,
            timestamp: snapshot.timestamp,
            comment: snapshot.comment,
            content_sha256: sha256_hex(snapshot.content.as_bytes()),
            raw_content: snapshot.content,
            clean_content,
            previous_revision_id: snapshot.parent_id.or(Some(baseline)),
        };
        let analysis = EditAnalysis {
            document_id: document_id.to_string(),
            revision_id,
            author: revision.author.clone(),
            semantic_similarity: score.semantic_similarity,
            content_risk: score.content_risk,
            username_risk: score.username_risk,
            final_risk: score.final_risk,
            flagged: score.flagged,
            created_at: now,
        };

        let inserted = self
            .store
            .record_edit(&revision, &analysis)
            .await
            .with_context(|| format!("persisting revision {revision_id} of {document_id}"))?;
        self.store.mark_checked(document_id, Some(revision_id), now).await?;

        if !inserted {
            info!(document = document_id, revision_id, "revision already recorded");
            return Ok(IngestOutcome::Replayed { revision_id });
        }

        if analysis.flagged {
            warn!(
                document = document_id,
                revision_id,
                author = %analysis.author,
                final_risk = analysis.final_risk,
                "flagged edit"
            );
        } else {
            warn!(document = document_id, revision_id, final_risk = analysis.final_risk, "change detected");
        }
        Ok(IngestOutcome::Analyzed(Box::new(analysis)))
    }

    /// Rolling z-score sweep over stored history plus the isolation-forest screen. Risk
    /// spikes are upserted, the model snapshot is replaced, run-level outliers are only
    /// reported.
    pub async fn sweep_anomalies(&self, detected_at: DateTime<Utc>) -> Result<SweepReport> {
        let observations = self
            .store
            .risk_rows(Some(self.config.risk_history_limit))
            .await
            .context("loading risk history")?
            .into_iter()
            .map(|row| RiskObservation {
                document_id: row.document_id,
                timestamp: row.created_at,
                final_risk: row.final_risk,
            })
            .collect::<Vec<_>>();
        let risk_anomalies = self.detector.detect_risk_spikes(&observations, detected_at);
        self.store
            .upsert_anomalies(&risk_anomalies)
            .await
            .context("storing risk anomalies")?;

        let runs = self
            .store
            .recent_runs(self.config.run_history_limit)
            .await
            .context("loading run history")?;
        let mut run_anomalies = self.detector.detect_run_anomalies(&runs, RunMetric::EditVolume);
        run_anomalies.extend(self.detector.detect_run_anomalies(&runs, RunMetric::FlagCount));

        let features = self
            .store
            .risk_rows(None)
            .await
            .context("loading edit features")?
            .into_iter()
            .map(|row| EditFeatures {
                document_id: row.document_id,
                revision_id: row.revision_id,
                final_risk: row.final_risk,
                semantic_similarity: row.semantic_similarity,
            })
            .collect::<Vec<_>>();
        let model_anomalies = match self
            .forest
            .screen(&features)
            .context("screening edits with the isolation forest")?
        {
            Some(found) => {
                self.store
                    .replace_model_anomalies(&found, detected_at)
                    .await
                    .context("replacing model anomaly snapshot")?;
                found
            }
            None => Vec::new(),
        };

        for a in &risk_anomalies {
            warn!(document = %a.document_id, value = a.value, z_score = a.z_score, "risk anomaly");
        }
        for a in &run_anomalies {
            warn!(metric = a.metric.as_str(), cycle_at = %a.cycle_at, value = a.value, z_score = a.z_score, "run anomaly");
        }
        for a in &model_anomalies {
            warn!(document = %a.document_id, revision_id = a.revision_id, score = a.anomaly_score, "model anomaly");
        }

        Ok(SweepReport {
            risk_anomalies,
            run_anomalies,
            model_anomalies,
        })
    }

    pub async fn refresh_topics(&self, now: DateTime<Utc>) -> Result<TopicRefresh> {
        let texts = self
            .store
            .high_risk_texts(TOPIC_RISK_THRESHOLD, now - self.config.topic_lookback)
            .await
            .context("loading high-risk texts")?;
        if texts.len() < TOPIC_MIN_DOCUMENTS {
            return Ok(TopicRefresh::BelowMinimum {
                high_risk_edits: texts.len(),
            });
        }

        let Some(topics) = self
            .clusterer
            .cluster(&texts)
            .await
            .context("clustering high-risk edits")?
        else {
            return Ok(TopicRefresh::NotConfigured);
        };

        self.store
            .replace_topics(&topics, now)
            .await
            .context("replacing topic snapshot")?;
        info!(topics = topics.len(), documents = texts.len(), "topic snapshot refreshed");
        Ok(TopicRefresh::Replaced(topics))
    }

    /// Full triage ordering recomputed from stored analyses and anomalies.
    pub async fn rank(&self) -> Result<Vec<PriorityEntry>> {
        let samples = self
            .store
            .risk_rows(None)
            .await
            .context("loading analyses for ranking")?
            .into_iter()
            .map(|row| RiskSample {
                document_id: row.document_id,
                final_risk: row.final_risk,
                flagged: row.flagged,
            })
            .collect::<Vec<_>>();
        let anomalous = self
            .store
            .anomalous_documents()
            .await
            .context("loading anomalous documents")?;
        Ok(self.ranker.rank(&samples, &anomalous))
    }

    /// One monitoring cycle. Exactly one `RunSummary` is recorded, and only on success.
    pub async fn run_cycle(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("monitor_cycle", %run_id);
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let cycle_at = Utc::now();
        let started = Instant::now();

        let promoted = self.discover().await?;
        let selected = self
            .store
            .select_for_cycle(self.config.max_documents)
            .await
            .context("selecting documents for cycle")?;

        let mut changes_detected = 0u32;
        let mut flagged_count = 0u32;
        for doc in &selected {
            let outcome = self.ingest_document(&doc.document_id).await?;
            if outcome.changed() {
                changes_detected += 1;
            }
            if outcome.flagged() {
                flagged_count += 1;
            }
        }

        let sweep = self.sweep_anomalies(Utc::now()).await?;
        let topics = match self.refresh_topics(Utc::now()).await? {
            TopicRefresh::Replaced(topics) => topics,
            _ => self.store.list_topics().await.context("loading topics")?,
        };
        let triage = self.rank().await?;
        self.store
            .update_priority_scores(&triage)
            .await
            .context("writing priority scores")?;

        let summary = RunSummary {
            run_id,
            cycle_at,
            documents_checked: u32::try_from(selected.len()).unwrap_or(u32::MAX),
            documents_discovered: u32::try_from(promoted.len()).unwrap_or(u32::MAX),
            changes_detected,
            flagged_count,
            duration_seconds: started.elapsed().as_secs_f64(),
        };

        if let Some(root) = &self.config.reports_dir {
            let report = CycleReport {
                summary: summary.clone(),
                promoted,
                triage,
                risk_anomalies: sweep.risk_anomalies,
                run_anomalies: sweep.run_anomalies,
                model_anomalies: sweep.model_anomalies,
                topics,
            };
            let run_dir = write_report_bundle(root, &report, self.config.report_top_k)
                .await
                .context("writing report bundle")?;
            info!(path = %run_dir.display(), "report bundle written");
        }

        self.store.record_run(&summary).await.context("recording run summary")?;
        info!(
            documents_checked = summary.documents_checked,
            documents_discovered = summary.documents_discovered,
            changes_detected = summary.changes_detected,
            flagged = summary.flagged_count,
            duration_seconds = summary.duration_seconds,
            "cycle complete"
        );
        Ok(summary)
    }

    /// `run_cycle` bounded by the configured deadline, if any.
    pub async fn run_cycle_with_deadline(&self) -> Result<RunSummary> {
        match self.config.cycle_deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.run_cycle())
                .await
                .map_err(|_| anyhow!("cycle exceeded its {}s deadline", deadline.as_secs()))?,
            None => self.run_cycle().await,
        }
    }
}

/// Cron-driven cycles. Ticks that arrive while a cycle is still running are skipped.
pub async fn maybe_build_scheduler(pipeline: Arc<MonitorPipeline>) -> Result<Option<JobScheduler>> {
    let cron = pipeline.config.scheduler_cron.trim().to_string();
    if cron.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            if let Some(Err(err)) = run_scheduled_tick(&pipeline, &running).await {
                error!(error = %format!("{err:#}"), "scheduled cycle failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// One scheduler tick. `None` when a cycle holding `running` is still in flight.
async fn run_scheduled_tick(
    pipeline: &MonitorPipeline,
    running: &Mutex<()>,
) -> Option<Result<RunSummary>> {
    let Ok(_guard) = running.try_lock() else {
        warn!("previous cycle still running; skipping tick");
        return None;
    };
    Some(pipeline.run_cycle_with_deadline().await)
}

pub async fn run_cycle_from_env() -> Result<RunSummary> {
    let config = MonitorConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let pipeline = MonitorPipeline::new(config, store.clone())?;
    let result = pipeline.run_cycle_with_deadline().await;
    store.close().await;
    result
}
