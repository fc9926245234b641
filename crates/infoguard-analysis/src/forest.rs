//! Isolation-forest screening of edits in the `(final_risk, semantic_similarity)` plane.

use extended_isolation_forest::{Forest, ForestOptions};
use infoguard_core::ModelAnomaly;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// Expected share of outliers; the score threshold sits at this upper quantile.
    pub contamination: f64,
    pub min_rows: usize,
    /// Per-tree subsample, capped at the number of rows.
    pub max_samples: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 150,
            contamination: 0.05,
            min_rows: 10,
            max_samples: 256,
        }
    }
}

/// Features of one analyzed edit.
#[derive(Debug, Clone, PartialEq)]
pub struct EditFeatures {
    pub document_id: String,
    pub revision_id: i64,
    pub final_risk: f64,
    pub semantic_similarity: f64,
}

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("isolation forest could not be trained: {0:?}")]
    Training(extended_isolation_forest::Error),
}

pub struct ForestScreen {
    config: ForestConfig,
}

impl ForestScreen {
    pub fn new(config: ForestConfig) -> Self {
        Self { config }
    }

    /// Fit a forest on `rows` and return the outliers, most anomalous first.
    ///
    /// `None` when there are fewer than `min_rows` edits; callers keep their previous
    /// snapshot in that case.
    pub fn screen(&self, rows: &[EditFeatures]) -> Result<Option<Vec<ModelAnomaly>>, ForestError> {
        if rows.len() < self.config.min_rows.max(2) {
            return Ok(None);
        }

        let points = rows
            .iter()
            .map(|r| [r.final_risk, r.semantic_similarity])
            .collect::<Vec<_>>();
        let options = ForestOptions {
            n_trees: self.config.n_trees.max(1),
            sample_size: self.config.max_samples.min(points.len()).max(2),
            max_tree_depth: None,
            extension_level: 0,
        };
        let forest = Forest::from_slice(&points, &options).map_err(ForestError::Training)?;
        let scores = points.iter().map(|p| forest.score(p)).collect::<Vec<f64>>();
        let threshold = contamination_threshold(&scores, self.config.contamination);

        let mut anomalies = rows
            .iter()
            .zip(&scores)
            .filter(|(_, score)| **score > threshold)
            .map(|(row, score)| ModelAnomaly {
                document_id: row.document_id.clone(),
                revision_id: row.revision_id,
                final_risk: row.final_risk,
                semantic_similarity: row.semantic_similarity,
                anomaly_score: *score,
            })
            .collect::<Vec<_>>();
        anomalies.sort_by(|a, b| b.anomaly_score.total_cmp(&a.anomaly_score));
        Ok(Some(anomalies))
    }
}

/// Linearly interpolated `1 - contamination` quantile. Only scores strictly above it are
/// outliers, so a uniformly scored set yields none.
pub fn contamination_threshold(scores: &[f64], contamination: f64) -> f64 {
    if scores.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (1.0 - contamination.clamp(0.0, 0.5)) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(doc: &str, id: i64, final_risk: f64, semantic_similarity: f64) -> EditFeatures {
        EditFeatures {
            document_id: doc.into(),
            revision_id: id,
            final_risk,
            semantic_similarity,
        }
    }

    #[test]
    fn threshold_interpolates_the_upper_quantile() {
        let scores = (0..20).map(|i| i as f64).collect::<Vec<_>>();
        // rank 0.95 * 19 = 18.05
        assert!((contamination_threshold(&scores, 0.05) - 18.05).abs() < 1e-9);
        assert_eq!(contamination_threshold(&[0.4; 12], 0.05), 0.4);
        assert_eq!(contamination_threshold(&[], 0.05), f64::INFINITY);
    }

    #[test]
    fn too_little_history_is_not_screened() {
        let rows = (0..9).map(|i| edit("Moon", i, 0.1, 0.95)).collect::<Vec<_>>();
        let screen = ForestScreen::new(ForestConfig::default());
        assert!(screen.screen(&rows).unwrap().is_none());
        assert!(screen.screen(&[]).unwrap().is_none());
    }

    #[test]
    fn isolated_edit_is_the_only_outlier() {
        let mut rows = (0..19)
            .map(|i| edit("Moon", i + 1, 0.1 + i as f64 * 0.002, 0.95 - i as f64 * 0.002))
            .collect::<Vec<_>>();
        rows.push(edit("Vaccine hesitancy", 77, 0.9, 0.05));

        let anomalies = ForestScreen::new(ForestConfig::default())
            .screen(&rows)
            .unwrap()
            .expect("enough rows");
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].document_id, "Vaccine hesitancy");
        assert_eq!(anomalies[0].revision_id, 77);
        assert_eq!(anomalies[0].final_risk, 0.9);
        assert!(anomalies[0].anomaly_score > 0.5);
    }
}
