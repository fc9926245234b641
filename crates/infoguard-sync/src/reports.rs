//! Per-cycle report bundle: triage brief, cycle record and Parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use infoguard_analysis::RunAnomaly;
use infoguard_core::{AnomalyRecord, ModelAnomaly, PriorityEntry, RunSummary, TopicCluster};
use infoguard_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Everything a completed cycle reports on.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub summary: RunSummary,
    pub promoted: Vec<String>,
    pub triage: Vec<PriorityEntry>,
    pub risk_anomalies: Vec<AnomalyRecord>,
    pub run_anomalies: Vec<RunAnomaly>,
    pub model_anomalies: Vec<ModelAnomaly>,
    pub topics: Vec<TopicCluster>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `<root>/<run_id>/` and return its path.
pub async fn write_report_bundle(root: &Path, report: &CycleReport, top_k: usize) -> Result<PathBuf> {
    let run_dir = root.join(report.summary.run_id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    fs::write(run_dir.join("triage_brief.md"), render_triage_brief(report, top_k))
        .await
        .context("writing triage_brief.md")?;

    let cycle_json = serde_json::to_vec_pretty(report).context("serializing cycle record")?;
    fs::write(run_dir.join("cycle.json"), cycle_json)
        .await
        .context("writing cycle.json")?;

    let priority_path = snapshot_dir.join("priority.parquet");
    let anomalies_path = snapshot_dir.join("anomalies.parquet");
    write_priority_parquet(&priority_path, &report.triage)?;
    write_anomalies_parquet(&anomalies_path, &report.risk_anomalies)?;

    let manifest = SnapshotManifest {
        schema_version: REPORT_SCHEMA_VERSION,
        files: vec![
            manifest_entry("priority", &run_dir, &priority_path)?,
            manifest_entry("anomalies", &run_dir, &anomalies_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

pub fn render_triage_brief(report: &CycleReport, top_k: usize) -> String {
    let s = &report.summary;
    let mut out = format!(
        "# InfoGuard Triage Brief\n\n- Run ID: `{}`\n- Cycle at: {}\n- Duration: {:.2}s\n\
         - Documents checked: {}\n- Documents discovered: {}\n- Changes detected: {}\n\
         - Flagged edits: {}\n",
        s.run_id,
        s.cycle_at.to_rfc3339(),
        s.duration_seconds,
        s.documents_checked,
        s.documents_discovered,
        s.changes_detected,
        s.flagged_count,
    );

    if !report.promoted.is_empty() {
        out.push_str("\n## Newly Watched\n");
        for title in &report.promoted {
            out.push_str(&format!("- {title}\n"));
        }
    }

    out.push_str("\n## Triage\n");
    if report.triage.is_empty() {
        out.push_str("No analyzed edits yet.\n");
    } else {
        out.push_str("| # | Document | Priority | Avg risk | Max risk | Flag rate | Edits | Anomaly |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for (i, e) in report.triage.iter().take(top_k).enumerate() {
            out.push_str(&format!(
                "| {} | {} | {:.3} | {:.3} | {:.3} | {:.2} | {} | {} |\n",
                i + 1,
                e.document_id,
                e.priority_score,
                e.avg_risk,
                e.max_risk,
                e.flag_rate,
                e.edit_volume,
                if e.anomaly_boost > 0.0 { "yes" } else { "" },
            ));
        }
    }

    if !report.risk_anomalies.is_empty() || !report.run_anomalies.is_empty() {
        out.push_str("\n## Anomalies\n");
        for a in &report.risk_anomalies {
            out.push_str(&format!(
                "- risk spike on {} at {}: {:.3} (z = {:.2})\n",
                a.document_id,
                a.timestamp.to_rfc3339(),
                a.value,
                a.z_score
            ));
        }
        for a in &report.run_anomalies {
            out.push_str(&format!(
                "- {} outlier in cycle {}: {} (z = {:.2})\n",
                a.metric.as_str(),
                a.cycle_at.to_rfc3339(),
                a.value,
                a.z_score
            ));
        }
    }

    if !report.model_anomalies.is_empty() {
        out.push_str("\n## Model Outliers\n");
        for a in &report.model_anomalies {
            out.push_str(&format!(
                "- {} rev {}: risk {:.3}, similarity {:.3} (score {:.3})\n",
                a.document_id, a.revision_id, a.final_risk, a.semantic_similarity, a.anomaly_score
            ));
        }
    }

    if !report.topics.is_empty() {
        out.push_str("\n## Topics\n");
        for t in &report.topics {
            out.push_str(&format!(
                "- {} ({} edits): {}\n",
                t.label,
                t.count,
                t.keywords.join(", ")
            ));
        }
    }

    out
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_priority_parquet(path: &Path, triage: &[PriorityEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("document_id", DataType::Utf8, false),
        ArrowField::new("priority_score", DataType::Float64, false),
        ArrowField::new("avg_risk", DataType::Float64, false),
        ArrowField::new("max_risk", DataType::Float64, false),
        ArrowField::new("edit_volume", DataType::UInt32, false),
        ArrowField::new("flag_rate", DataType::Float64, false),
        ArrowField::new("anomaly_boost", DataType::Float64, false),
        ArrowField::new("edit_velocity", DataType::Float64, false),
    ]));

    let floats = |f: fn(&PriorityEntry) -> f64| Float64Array::from(triage.iter().map(f).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                triage.iter().map(|e| e.document_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(floats(|e| e.priority_score)),
            Arc::new(floats(|e| e.avg_risk)),
            Arc::new(floats(|e| e.max_risk)),
            Arc::new(UInt32Array::from(
                triage.iter().map(|e| e.edit_volume).collect::<Vec<_>>(),
            )),
            Arc::new(floats(|e| e.flag_rate)),
            Arc::new(floats(|e| e.anomaly_boost)),
            Arc::new(floats(|e| e.edit_velocity)),
        ],
    )
    .context("building priority record batch")?;
    write_parquet(path, batch)
}

fn write_anomalies_parquet(path: &Path, anomalies: &[AnomalyRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("document_id", DataType::Utf8, false),
        ArrowField::new("value", DataType::Float64, false),
        ArrowField::new("z_score", DataType::Float64, false),
        ArrowField::new("detected_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                anomalies.iter().map(|a| a.timestamp.to_rfc3339()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                anomalies.iter().map(|a| a.document_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                anomalies.iter().map(|a| a.value).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                anomalies.iter().map(|a| a.z_score).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                anomalies.iter().map(|a| a.detected_at.to_rfc3339()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building anomalies record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use infoguard_analysis::RunMetric;
    use uuid::Uuid;

    fn sample_report() -> CycleReport {
        let cycle_at = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).single().unwrap();
        CycleReport {
            summary: RunSummary {
                run_id: Uuid::from_u128(7),
                cycle_at,
                documents_checked: 12,
                documents_discovered: 2,
                changes_detected: 3,
                flagged_count: 1,
                duration_seconds: 8.25,
            },
            promoted: vec!["Moon".into(), "Vaccine hesitancy".into()],
            triage: vec![
                PriorityEntry {
                    document_id: "Vaccine hesitancy".into(),
                    avg_risk: 0.62,
                    max_risk: 0.62,
                    edit_volume: 1,
                    flag_rate: 1.0,
                    anomaly_boost: 1.0,
                    edit_velocity: 0.5,
                    priority_score: 0.772,
                },
                PriorityEntry {
                    document_id: "Moon".into(),
                    avg_risk: 0.1,
                    max_risk: 0.1,
                    edit_volume: 2,
                    flag_rate: 0.0,
                    anomaly_boost: 0.0,
                    edit_velocity: 1.0,
                    priority_score: 0.16,
                },
            ],
            risk_anomalies: vec![AnomalyRecord {
                document_id: "Vaccine hesitancy".into(),
                timestamp: cycle_at,
                value: 0.62,
                z_score: 2.85,
                detected_at: cycle_at,
            }],
            run_anomalies: vec![RunAnomaly {
                metric: RunMetric::EditVolume,
                cycle_at,
                value: 40.0,
                z_score: 3.1,
            }],
            model_anomalies: vec![ModelAnomaly {
                document_id: "Vaccine hesitancy".into(),
                revision_id: 12,
                final_risk: 0.62,
                semantic_similarity: 0.25,
                anomaly_score: 0.71,
            }],
            topics: vec![TopicCluster {
                topic_id: 0,
                count: 6,
                label: "Vaccine, Safety".into(),
                keywords: vec!["vaccine".into(), "safety".into()],
            }],
        }
    }

    #[test]
    fn brief_lists_top_k_and_anomalies() {
        let brief = render_triage_brief(&sample_report(), 1);
        assert!(brief.contains("- Changes detected: 3"));
        assert!(brief.contains("| 1 | Vaccine hesitancy | 0.772 |"));
        assert!(!brief.contains("| 2 | Moon |"));
        assert!(brief.contains("risk spike on Vaccine hesitancy"));
        assert!(brief.contains("edit_volume outlier"));
        assert!(brief.contains("- Vaccine hesitancy rev 12: risk 0.620, similarity 0.250 (score 0.710)"));
        assert!(brief.contains("- Vaccine, Safety (6 edits): vaccine, safety"));
    }

    #[tokio::test]
    async fn bundle_writes_snapshots_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let report = sample_report();
        let run_dir = write_report_bundle(tmp.path(), &report, 10).await.unwrap();

        assert_eq!(run_dir, tmp.path().join(report.summary.run_id.to_string()));
        assert!(run_dir.join("triage_brief.md").exists());
        assert!(run_dir.join("cycle.json").exists());

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        for file in files {
            let path = run_dir.join(file["path"].as_str().unwrap());
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(file["bytes"].as_u64().unwrap(), bytes.len() as u64);
            assert_eq!(file["sha256"].as_str().unwrap(), infoguard_storage::sha256_hex(&bytes));
        }
    }
}
