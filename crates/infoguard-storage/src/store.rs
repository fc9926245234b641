//! SQLite-backed monitoring store.
//!
//! Every write that may be replayed after an interrupted cycle is keyed by its natural
//! composite key: revisions and analyses by `(document_id, revision_id)`, anomalies by
//! `(timestamp, document_id)`, runs by `run_id`. Topic clusters and model anomalies are
//! snapshots, replaced wholesale.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use infoguard_core::{
    AnomalyRecord, ContentRisk, EditAnalysis, ModelAnomaly, PriorityEntry, Revision, RunSummary,
    TopicCluster, UsernameRisk, WatchStatus, WatchedDocument,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt value in {table}.{column}: {detail}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

fn corrupt(table: &'static str, column: &'static str, detail: impl ToString) -> StoreError {
    StoreError::Corrupt {
        table,
        column,
        detail: detail.to_string(),
    }
}

/// Lightweight projection of an analysis used by the anomaly sweeps and the ranker.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskRow {
    pub document_id: String,
    pub revision_id: i64,
    pub semantic_similarity: f64,
    pub final_risk: f64,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let store = Self {
            pool: pool_options.connect_with(options).await?,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // -- watchlist ---------------------------------------------------------

    /// Insert an active, baseline-less entry. Returns false when the document is already watched.
    pub async fn register_document(
        &self,
        document_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO watched_documents (document_id, watch_status, priority_score, added_at)
            VALUES (?1, 'active', 0, ?2)
            ON CONFLICT (document_id) DO NOTHING
            "#,
        )
        .bind(document_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<WatchedDocument>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document_id, last_seen_revision_id, last_checked_at, watch_status,
                   priority_score, added_at
              FROM watched_documents
             WHERE document_id = ?1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<WatchedDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, last_seen_revision_id, last_checked_at, watch_status,
                   priority_score, added_at
              FROM watched_documents
             ORDER BY document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Active documents, highest priority first, longest-unchecked breaking ties.
    pub async fn select_for_cycle(&self, cap: usize) -> Result<Vec<WatchedDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, last_seen_revision_id, last_checked_at, watch_status,
                   priority_score, added_at
              FROM watched_documents
             WHERE watch_status = 'active'
             ORDER BY priority_score DESC, last_checked_at ASC, document_id ASC
             LIMIT ?1
            "#,
        )
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Record a check. The baseline only ever moves forward.
    pub async fn mark_checked(
        &self,
        document_id: &str,
        new_revision_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE watched_documents
               SET last_checked_at = ?2,
                   last_seen_revision_id = CASE
                       WHEN ?3 IS NOT NULL
                        AND (last_seen_revision_id IS NULL OR last_seen_revision_id < ?3)
                       THEN ?3
                       ELSE last_seen_revision_id
                   END
             WHERE document_id = ?1
            "#,
        )
        .bind(document_id)
        .bind(at)
        .bind(new_revision_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, document_id: &str, status: WatchStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE watched_documents SET watch_status = ?2 WHERE document_id = ?1")
            .bind(document_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_priority_scores(&self, entries: &[PriorityEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query("UPDATE watched_documents SET priority_score = ?2 WHERE document_id = ?1")
                .bind(&entry.document_id)
                .bind(entry.priority_score)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // -- revisions and analyses --------------------------------------------

    pub async fn latest_clean_content(&self, document_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT clean_content
              FROM revisions
             WHERE document_id = ?1
             ORDER BY revision_id DESC
             LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("clean_content")).transpose()?)
    }

    /// Persist a revision and its analysis atomically.
    ///
    /// Returns false, writing nothing, when the revision is already stored.
    pub async fn record_edit(
        &self,
        revision: &Revision,
        analysis: &EditAnalysis,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO revisions (
                document_id, revision_id, author, timestamp, comment,
                raw_content, clean_content, content_sha256, previous_revision_id
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (document_id, revision_id) DO NOTHING
            "#,
        )
        .bind(&revision.document_id)
        .bind(revision.revision_id)
        .bind(&revision.author)
        .bind(revision.timestamp)
        .bind(&revision.comment)
        .bind(&revision.raw_content)
        .bind(&revision.clean_content)
        .bind(&revision.content_sha256)
        .bind(revision.previous_revision_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let terms = serde_json::to_string(&analysis.content_risk.matched_terms)
            .map_err(|e| corrupt("edit_analyses", "content_risk_terms", e))?;
        let reasons = serde_json::to_string(&analysis.username_risk.reasons)
            .map_err(|e| corrupt("edit_analyses", "username_risk_reasons", e))?;

        sqlx::query(
            r#"
            INSERT INTO edit_analyses (
                document_id, revision_id, author, semantic_similarity,
                content_risk, content_risk_terms,
                username_risk, username_risk_reasons, username_has_numbers, username_all_caps,
                final_risk, flagged, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&analysis.document_id)
        .bind(analysis.revision_id)
        .bind(&analysis.author)
        .bind(analysis.semantic_similarity)
        .bind(analysis.content_risk.score)
        .bind(terms)
        .bind(analysis.username_risk.score)
        .bind(reasons)
        .bind(analysis.username_risk.has_numbers)
        .bind(analysis.username_risk.all_caps)
        .bind(analysis.final_risk)
        .bind(analysis.flagged)
        .bind(analysis.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_analysis(
        &self,
        document_id: &str,
        revision_id: i64,
    ) -> Result<Option<EditAnalysis>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document_id, revision_id, author, semantic_similarity,
                   content_risk, content_risk_terms,
                   username_risk, username_risk_reasons, username_has_numbers, username_all_caps,
                   final_risk, flagged, created_at
              FROM edit_analyses
             WHERE document_id = ?1 AND revision_id = ?2
            "#,
        )
        .bind(document_id)
        .bind(revision_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(analysis_from_row).transpose()
    }

    pub async fn revision_count(&self) -> Result<u64, StoreError> {
        count(&self.pool, "SELECT COUNT(*) FROM revisions").await
    }

    pub async fn analysis_count(&self) -> Result<u64, StoreError> {
        count(&self.pool, "SELECT COUNT(*) FROM edit_analyses").await
    }

    /// The most recent `limit` analyses (all when `None`), returned oldest first.
    pub async fn risk_rows(&self, limit: Option<usize>) -> Result<Vec<RiskRow>, StoreError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT document_id, revision_id, semantic_similarity, final_risk, flagged, created_at
              FROM (
                    SELECT document_id, revision_id, semantic_similarity, final_risk, flagged,
                           created_at
                      FROM edit_analyses
                     ORDER BY created_at DESC, revision_id DESC
                     LIMIT ?1
                   )
             ORDER BY created_at ASC, revision_id ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RiskRow {
                    document_id: row.try_get("document_id")?,
                    revision_id: row.try_get("revision_id")?,
                    semantic_similarity: row.try_get("semantic_similarity")?,
                    final_risk: row.try_get("final_risk")?,
                    flagged: row.try_get("flagged")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Clean text of edits at or above `min_risk` analyzed since `since`, oldest first.
    pub async fn high_risk_texts(
        &self,
        min_risk: f64,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.clean_content
              FROM edit_analyses a
              JOIN revisions r
                ON r.document_id = a.document_id AND r.revision_id = a.revision_id
             WHERE a.final_risk >= ?1
               AND a.created_at >= ?2
             ORDER BY a.created_at ASC
            "#,
        )
        .bind(min_risk)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get("clean_content"))
            .collect::<Result<_, _>>()?)
    }

    // -- anomalies ---------------------------------------------------------

    /// Upsert by `(timestamp, document_id)`; replays refresh the row instead of adding one.
    pub async fn upsert_anomalies(&self, records: &[AnomalyRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO anomalies (timestamp, document_id, value, z_score, detected_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (timestamp, document_id) DO UPDATE
                   SET value = excluded.value,
                       z_score = excluded.z_score,
                       detected_at = excluded.detected_at
                "#,
            )
            .bind(record.timestamp)
            .bind(&record.document_id)
            .bind(record.value)
            .bind(record.z_score)
            .bind(record.detected_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_anomalies(&self) -> Result<Vec<AnomalyRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, document_id, value, z_score, detected_at
              FROM anomalies
             ORDER BY timestamp ASC, document_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AnomalyRecord {
                    document_id: row.try_get("document_id")?,
                    timestamp: row.try_get("timestamp")?,
                    value: row.try_get("value")?,
                    z_score: row.try_get("z_score")?,
                    detected_at: row.try_get("detected_at")?,
                })
            })
            .collect()
    }

    pub async fn anomalous_documents(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT document_id FROM anomalies")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get("document_id"))
            .collect::<Result<_, _>>()?)
    }

    pub async fn replace_model_anomalies(
        &self,
        anomalies: &[ModelAnomaly],
        detected_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM model_anomalies").execute(&mut *tx).await?;
        for anomaly in anomalies {
            sqlx::query(
                r#"
                INSERT INTO model_anomalies
                       (document_id, revision_id, final_risk, semantic_similarity, anomaly_score,
                        detected_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&anomaly.document_id)
            .bind(anomaly.revision_id)
            .bind(anomaly.final_risk)
            .bind(anomaly.semantic_similarity)
            .bind(anomaly.anomaly_score)
            .bind(detected_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Current model anomaly snapshot, most anomalous first.
    pub async fn list_model_anomalies(&self) -> Result<Vec<ModelAnomaly>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, revision_id, final_risk, semantic_similarity, anomaly_score
              FROM model_anomalies
             ORDER BY anomaly_score DESC, document_id ASC, revision_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ModelAnomaly {
                    document_id: row.try_get("document_id")?,
                    revision_id: row.try_get("revision_id")?,
                    final_risk: row.try_get("final_risk")?,
                    semantic_similarity: row.try_get("semantic_similarity")?,
                    anomaly_score: row.try_get("anomaly_score")?,
                })
            })
            .collect()
    }

    // -- runs --------------------------------------------------------------

    pub async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_summaries (
                run_id, cycle_at, documents_checked, documents_discovered,
                changes_detected, flagged_count, duration_seconds
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(summary.run_id.to_string())
        .bind(summary.cycle_at)
        .bind(i64::from(summary.documents_checked))
        .bind(i64::from(summary.documents_discovered))
        .bind(i64::from(summary.changes_detected))
        .bind(i64::from(summary.flagged_count))
        .bind(summary.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The most recent `limit` runs, oldest first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, cycle_at, documents_checked, documents_discovered,
                   changes_detected, flagged_count, duration_seconds
              FROM (
                    SELECT * FROM run_summaries ORDER BY cycle_at DESC LIMIT ?1
                   )
             ORDER BY cycle_at ASC
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    // -- topics ------------------------------------------------------------

    /// Swap in a new topic snapshot; the previous one is discarded, never merged.
    pub async fn replace_topics(
        &self,
        topics: &[TopicCluster],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM topic_clusters").execute(&mut *tx).await?;
        for topic in topics {
            let keywords = serde_json::to_string(&topic.keywords)
                .map_err(|e| corrupt("topic_clusters", "keywords", e))?;
            sqlx::query(
                r#"
                INSERT INTO topic_clusters (topic_id, member_count, label, keywords, refreshed_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(topic.topic_id)
            .bind(i64::from(topic.count))
            .bind(&topic.label)
            .bind(keywords)
            .bind(refreshed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicCluster>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT topic_id, member_count, label, keywords
              FROM topic_clusters
             ORDER BY member_count DESC, topic_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let keywords: String = row.try_get("keywords")?;
                Ok(TopicCluster {
                    topic_id: row.try_get("topic_id")?,
                    count: to_u32("topic_clusters", "member_count", row.try_get("member_count")?)?,
                    label: row.try_get("label")?,
                    keywords: serde_json::from_str(&keywords)
                        .map_err(|e| corrupt("topic_clusters", "keywords", e))?,
                })
            })
            .collect()
    }
}

async fn count(pool: &SqlitePool, sql: &'static str) -> Result<u64, StoreError> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n.max(0) as u64)
}

fn to_u32(table: &'static str, column: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| corrupt(table, column, e))
}

fn document_from_row(row: &SqliteRow) -> Result<WatchedDocument, StoreError> {
    let status: String = row.try_get("watch_status")?;
    Ok(WatchedDocument {
        document_id: row.try_get("document_id")?,
        last_seen_revision_id: row.try_get("last_seen_revision_id")?,
        last_checked_at: row.try_get("last_checked_at")?,
        watch_status: status
            .parse()
            .map_err(|e| corrupt("watched_documents", "watch_status", e))?,
        priority_score: row.try_get("priority_score")?,
        added_at: row.try_get("added_at")?,
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<EditAnalysis, StoreError> {
    let terms: String = row.try_get("content_risk_terms")?;
    let reasons: String = row.try_get("username_risk_reasons")?;
    Ok(EditAnalysis {
        document_id: row.try_get("document_id")?,
        revision_id: row.try_get("revision_id")?,
        author: row.try_get("author")?,
        semantic_similarity: row.try_get("semantic_similarity")?,
        content_risk: ContentRisk {
            score: row.try_get("content_risk")?,
            matched_terms: serde_json::from_str(&terms)
                .map_err(|e| corrupt("edit_analyses", "content_risk_terms", e))?,
        },
        username_risk: UsernameRisk {
            score: row.try_get("username_risk")?,
            reasons: serde_json::from_str(&reasons)
                .map_err(|e| corrupt("edit_analyses", "username_risk_reasons", e))?,
            has_numbers: row.try_get("username_has_numbers")?,
            all_caps: row.try_get("username_all_caps")?,
        },
        final_risk: row.try_get("final_risk")?,
        flagged: row.try_get("flagged")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunSummary, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    Ok(RunSummary {
        run_id: Uuid::parse_str(&run_id).map_err(|e| corrupt("run_summaries", "run_id", e))?,
        cycle_at: row.try_get("cycle_at")?,
        documents_checked: to_u32("run_summaries", "documents_checked", row.try_get("documents_checked")?)?,
        documents_discovered: to_u32(
            "run_summaries",
            "documents_discovered",
            row.try_get("documents_discovered")?,
        )?,
        changes_detected: to_u32("run_summaries", "changes_detected", row.try_get("changes_detected")?)?,
        flagged_count: to_u32("run_summaries", "flagged_count", row.try_get("flagged_count")?)?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).single().expect("ts") + Duration::minutes(minutes)
    }

    fn revision(doc: &str, id: i64, clean: &str) -> Revision {
        Revision {
            document_id: doc.to_string(),
            revision_id: id,
            author: "Editor".into(),
            timestamp: ts(id),
            comment: String::new(),
            raw_content: format!("'''{clean}'''"),
            clean_content: clean.to_string(),
            content_sha256: crate::sha256_hex(clean.as_bytes()),
            previous_revision_id: Some(id - 1),
        }
    }

    fn analysis(doc: &str, id: i64, final_risk: f64, created_at: DateTime<Utc>) -> EditAnalysis {
        EditAnalysis {
            document_id: doc.to_string(),
            revision_id: id,
            author: "Editor".into(),
            semantic_similarity: 0.9,
            content_risk: ContentRisk {
                score: 0.2,
                matched_terms: vec!["fake".into()],
            },
            username_risk: UsernameRisk::default(),
            final_risk,
            flagged: final_risk >= 0.5,
            created_at,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let store = Store::open_in_memory().await.expect("store");
        assert!(store.register_document("Moon", ts(0)).await.unwrap());
        assert!(!store.register_document("Moon", ts(5)).await.unwrap());

        let doc = store.get_document("Moon").await.unwrap().expect("doc");
        assert_eq!(doc.watch_status, WatchStatus::Active);
        assert_eq!(doc.last_seen_revision_id, None);
        assert_eq!(doc.last_checked_at, None);
        assert_eq!(doc.added_at, ts(0));
        assert_eq!(store.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn selection_orders_by_priority_then_staleness() {
        let store = Store::open_in_memory().await.expect("store");
        for doc in ["A", "B", "C", "D", "E"] {
            store.register_document(doc, ts(0)).await.unwrap();
        }
        store.mark_checked("A", None, ts(30)).await.unwrap();
        store.mark_checked("B", None, ts(10)).await.unwrap();
        store.mark_checked("C", None, ts(20)).await.unwrap();
        store.set_status("D", WatchStatus::Paused).await.unwrap();
        store
            .update_priority_scores(&[PriorityEntry {
                document_id: "C".into(),
                avg_risk: 0.5,
                max_risk: 0.5,
                edit_volume: 1,
                flag_rate: 1.0,
                anomaly_boost: 0.0,
                edit_velocity: 1.0,
                priority_score: 0.6,
            }])
            .await
            .unwrap();

        let order = store
            .select_for_cycle(10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.document_id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["C", "E", "B", "A"]);
        assert_eq!(store.select_for_cycle(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn baseline_never_reverts() {
        let store = Store::open_in_memory().await.expect("store");
        store.register_document("Moon", ts(0)).await.unwrap();
        store.mark_checked("Moon", Some(500), ts(1)).await.unwrap();
        store.mark_checked("Moon", Some(400), ts(2)).await.unwrap();
        store.mark_checked("Moon", None, ts(3)).await.unwrap();

        let doc = store.get_document("Moon").await.unwrap().expect("doc");
        assert_eq!(doc.last_seen_revision_id, Some(500));
        assert_eq!(doc.last_checked_at, Some(ts(3)));
    }

    #[tokio::test]
    async fn record_edit_is_keyed_by_revision() {
        let store = Store::open_in_memory().await.expect("store");
        store.register_document("Moon", ts(0)).await.unwrap();

        let rev = revision("Moon", 11, "The Moon orbits Earth.");
        let first = analysis("Moon", 11, 0.62, ts(11));
        assert!(store.record_edit(&rev, &first).await.unwrap());
        assert!(!store.record_edit(&rev, &analysis("Moon", 11, 0.1, ts(12))).await.unwrap());

        assert_eq!(store.revision_count().await.unwrap(), 1);
        assert_eq!(store.analysis_count().await.unwrap(), 1);
        let stored = store.get_analysis("Moon", 11).await.unwrap().expect("analysis");
        assert_eq!(stored, first);
        assert_eq!(
            store.latest_clean_content("Moon").await.unwrap().as_deref(),
            Some("The Moon orbits Earth.")
        );
        assert_eq!(store.latest_clean_content("Sun").await.unwrap(), None);
    }

    #[tokio::test]
    async fn inconsistent_flag_is_rejected_by_schema() {
        let store = Store::open_in_memory().await.expect("store");
        store.register_document("Moon", ts(0)).await.unwrap();
        let mut bad = analysis("Moon", 3, 0.7, ts(3));
        bad.flagged = false;
        assert!(store.record_edit(&revision("Moon", 3, "x"), &bad).await.is_err());
        assert_eq!(store.revision_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn anomaly_upsert_never_duplicates() {
        let store = Store::open_in_memory().await.expect("store");
        let record = AnomalyRecord {
            document_id: "Moon".into(),
            timestamp: ts(7),
            value: 0.9,
            z_score: 2.8,
            detected_at: ts(60),
        };
        store.upsert_anomalies(&[record.clone()]).await.unwrap();
        let mut again = record.clone();
        again.detected_at = ts(120);
        store.upsert_anomalies(&[again]).await.unwrap();

        let stored = store.list_anomalies().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].detected_at, ts(120));
        assert_eq!(
            store.anomalous_documents().await.unwrap(),
            HashSet::from(["Moon".to_string()])
        );
    }

    #[tokio::test]
    async fn risk_rows_return_most_recent_oldest_first() {
        let store = Store::open_in_memory().await.expect("store");
        store.register_document("Moon", ts(0)).await.unwrap();
        for id in 1..=5 {
            let risk = id as f64 / 10.0;
            store
                .record_edit(&revision("Moon", id, "text"), &analysis("Moon", id, risk, ts(id)))
                .await
                .unwrap();
        }
        let rows = store.risk_rows(Some(3)).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.final_risk).collect::<Vec<_>>(),
            vec![0.3, 0.4, 0.5]
        );
        assert!(rows[2].flagged);
        assert_eq!(rows[0].revision_id, 3);
        assert_eq!(rows[0].semantic_similarity, 0.9);
        assert_eq!(store.risk_rows(None).await.unwrap().len(), 5);

        let texts = store.high_risk_texts(0.35, ts(4)).await.unwrap();
        assert_eq!(texts.len(), 2);
    }

    #[tokio::test]
    async fn runs_and_topics_round_trip() {
        let store = Store::open_in_memory().await.expect("store");
        for i in 0..3 {
            store
                .record_run(&RunSummary {
                    run_id: Uuid::new_v4(),
                    cycle_at: ts(i * 60),
                    documents_checked: 10,
                    documents_discovered: 2,
                    changes_detected: i as u32,
                    flagged_count: 0,
                    duration_seconds: 4.5,
                })
                .await
                .unwrap();
        }
        let runs = store.recent_runs(2).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.changes_detected).collect::<Vec<_>>(), vec![1, 2]);

        let topic = |id: i64, label: &str| TopicCluster {
            topic_id: id,
            count: 6,
            label: label.into(),
            keywords: vec!["election".into(), "fraud".into()],
        };
        store.replace_topics(&[topic(0, "Election"), topic(1, "Fraud")], ts(0)).await.unwrap();
        store.replace_topics(&[topic(4, "Vaccine")], ts(10)).await.unwrap();
        let topics = store.list_topics().await.unwrap();
        assert_eq!(topics, vec![topic(4, "Vaccine")]);
    }

    #[tokio::test]
    async fn model_anomaly_snapshot_is_replaced() {
        let store = Store::open_in_memory().await.expect("store");
        let anomaly = |doc: &str, id: i64, score: f64| ModelAnomaly {
            document_id: doc.into(),
            revision_id: id,
            final_risk: 0.8,
            semantic_similarity: 0.1,
            anomaly_score: score,
        };
        store
            .replace_model_anomalies(&[anomaly("Moon", 3, 0.61), anomaly("Sun", 9, 0.74)], ts(0))
            .await
            .unwrap();
        assert_eq!(
            store
                .list_model_anomalies()
                .await
                .unwrap()
                .iter()
                .map(|a| a.document_id.as_str())
                .collect::<Vec<_>>(),
            vec!["Sun", "Moon"]
        );

        store.replace_model_anomalies(&[anomaly("Vaccine", 1, 0.7)], ts(60)).await.unwrap();
        assert_eq!(
            store.list_model_anomalies().await.unwrap(),
            vec![anomaly("Vaccine", 1, 0.7)]
        );

        store.replace_model_anomalies(&[], ts(120)).await.unwrap();
        assert!(store.list_model_anomalies().await.unwrap().is_empty());
    }
}
