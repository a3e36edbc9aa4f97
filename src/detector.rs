use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::TargetId;
use crate::error::TrainError;

const EPS: f32 = 1e-16;

/// Which cascade variant evaluation scores.
///
/// `FineOnly` is the single-step setup: only escalated windows are scored, by
/// the fine detector. `CoarseFine` is the two-step cascade: non-escalated
/// windows fall back to the coarse detector's outputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CascadeLevel {
    FineOnly,
    CoarseFine,
}

/// One prediction emitted by a detector stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub true_positive: bool,
    pub score: f32,
    pub label: u32,
}

/// Predictions plus ground-truth labels produced for one batch.
#[derive(Clone, Debug, Default)]
pub struct BatchDetections {
    pub detections: Vec<Detection>,
    pub ground_truth: Vec<u32>,
}

/// External collaborator scoring a deterministic action batch against the
/// chosen cascade variant.
pub trait DetectionScorer {
    fn score_batch(
        &mut self,
        actions: &[Vec<f32>],
        targets: &[TargetId],
        level: CascadeLevel,
    ) -> Result<BatchDetections, TrainError>;
}

/// Per-class precision/recall summary.
#[derive(Clone, Debug)]
pub struct ClassMetrics {
    pub class: u32,
    pub precision: f32,
    pub recall: f32,
    pub ap: f32,
    pub f1: f32,
}

#[derive(Clone, Debug, Default)]
pub struct DetectionSummary {
    pub per_class: Vec<ClassMetrics>,
    pub mean_ap: f32,
    pub mean_recall: f32,
}

/// Accumulates (true-positive, score, label) triples and the running
/// ground-truth label multiset across an evaluation epoch.
#[derive(Clone, Debug, Default)]
pub struct DetectionAccumulator {
    detections: Vec<Detection>,
    ground_truth: Vec<u32>,
}

impl DetectionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, batch: BatchDetections) {
        self.detections.extend(batch.detections);
        self.ground_truth.extend(batch.ground_truth);
    }

    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }

    /// Average precision, precision, recall and F1 per ground-truth class,
    /// reducing all accumulated detections sorted by descending confidence.
    pub fn ap_per_class(&self) -> DetectionSummary {
        let mut order: Vec<usize> = (0..self.detections.len()).collect();
        order.sort_by(|&a, &b| {
            self.detections[b]
                .score
                .partial_cmp(&self.detections[a].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut classes: Vec<u32> = self.ground_truth.clone();
        classes.sort_unstable();
        classes.dedup();

        let mut per_class = Vec::with_capacity(classes.len());
        for class in classes {
            let gt_count = self.ground_truth.iter().filter(|&&c| c == class).count();
            let mut tp_cum = 0usize;
            let mut fp_cum = 0usize;
            let mut recall_curve = Vec::new();
            let mut precision_curve = Vec::new();
            for &index in &order {
                let detection = &self.detections[index];
                if detection.label != class {
                    continue;
                }
                if detection.true_positive {
                    tp_cum += 1;
                } else {
                    fp_cum += 1;
                }
                recall_curve.push(tp_cum as f32 / (gt_count as f32 + EPS));
                precision_curve.push(tp_cum as f32 / (tp_cum + fp_cum) as f32);
            }
            let (precision, recall) = match (precision_curve.last(), recall_curve.last()) {
                (Some(&p), Some(&r)) => (p, r),
                _ => (0.0, 0.0),
            };
            let ap = compute_ap(&recall_curve, &precision_curve);
            let f1 = 2.0 * precision * recall / (precision + recall + EPS);
            per_class.push(ClassMetrics {
                class,
                precision,
                recall,
                ap,
                f1,
            });
        }

        let count = per_class.len().max(1) as f32;
        let mean_ap = per_class.iter().map(|m| m.ap).sum::<f32>() / count;
        let mean_recall = per_class.iter().map(|m| m.recall).sum::<f32>() / count;
        DetectionSummary {
            per_class,
            mean_ap,
            mean_recall,
        }
    }
}

/// Area under the monotone precision envelope over the recall steps.
fn compute_ap(recall: &[f32], precision: &[f32]) -> f32 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);
    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }
    let mut ap = 0.0;
    for i in 0..mrec.len() - 1 {
        if mrec[i + 1] != mrec[i] {
            ap += (mrec[i + 1] - mrec[i]) * mpre[i + 1];
        }
    }
    ap
}

/// Per-target, per-window detection records for both stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetDetections {
    pub target: TargetId,
    pub ground_truth: Vec<u32>,
    /// One entry per window: predictions from the fine detector.
    pub fine: Vec<Vec<Detection>>,
    /// One entry per window: predictions from the coarse detector.
    pub coarse: Vec<Vec<Detection>>,
}

/// Table-backed scorer: looks up precomputed per-window predictions and
/// routes each window to the stage the action vector selected.
#[derive(Clone, Debug, Default)]
pub struct TableDetectionScorer {
    table: HashMap<TargetId, TargetDetections>,
}

impl TableDetectionScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: TargetDetections) {
        self.table.insert(record.target, record);
    }

    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let bytes = std::fs::read(path)?;
        let (records, _): (Vec<TargetDetections>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        let mut scorer = Self::new();
        for record in records {
            scorer.insert(record);
        }
        Ok(scorer)
    }

    pub fn save(path: &Path, records: &[TargetDetections]) -> Result<(), TrainError> {
        let bytes = bincode::serde::encode_to_vec(records, bincode::config::standard())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl DetectionScorer for TableDetectionScorer {
    fn score_batch(
        &mut self,
        actions: &[Vec<f32>],
        targets: &[TargetId],
        level: CascadeLevel,
    ) -> Result<BatchDetections, TrainError> {
        let mut batch = BatchDetections::default();
        for (action, &target) in actions.iter().zip(targets) {
            let record = self
                .table
                .get(&target)
                .ok_or(TrainError::MissingDetections(target))?;
            if record.fine.len() != action.len() || record.coarse.len() != action.len() {
                return Err(TrainError::ShapeMismatch {
                    expected: action.len(),
                    actual: record.fine.len(),
                });
            }
            batch.ground_truth.extend_from_slice(&record.ground_truth);
            for (window, &escalate) in action.iter().enumerate() {
                if escalate >= 0.5 {
                    batch.detections.extend_from_slice(&record.fine[window]);
                } else if level == CascadeLevel::CoarseFine {
                    batch.detections.extend_from_slice(&record.coarse[window]);
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(true_positive: bool, score: f32, label: u32) -> Detection {
        Detection {
            true_positive,
            score,
            label,
        }
    }

    #[test]
    fn ap_reduces_monotone_envelope() {
        let mut accumulator = DetectionAccumulator::new();
        accumulator.merge(BatchDetections {
            detections: vec![det(true, 0.9, 0), det(false, 0.8, 0), det(true, 0.7, 0)],
            ground_truth: vec![0, 0],
        });
        let summary = accumulator.ap_per_class();
        assert_eq!(summary.per_class.len(), 1);
        let metrics = &summary.per_class[0];
        assert!((metrics.ap - (0.5 + 0.5 * (2.0 / 3.0))).abs() < 1e-4);
        assert!((metrics.recall - 1.0).abs() < 1e-4);
        assert!((metrics.precision - 2.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn class_without_predictions_scores_zero() {
        let mut accumulator = DetectionAccumulator::new();
        accumulator.merge(BatchDetections {
            detections: vec![det(true, 0.6, 1)],
            ground_truth: vec![1, 2],
        });
        let summary = accumulator.ap_per_class();
        let missing = summary.per_class.iter().find(|m| m.class == 2).expect("class 2");
        assert_eq!(missing.ap, 0.0);
        assert_eq!(missing.recall, 0.0);
        assert_eq!(missing.f1, 0.0);
    }

    #[test]
    fn table_scorer_routes_windows_by_action_and_level() {
        let mut scorer = TableDetectionScorer::new();
        scorer.insert(TargetDetections {
            target: 5,
            ground_truth: vec![0],
            fine: vec![vec![det(true, 0.9, 0)], vec![det(true, 0.8, 0)]],
            coarse: vec![vec![det(false, 0.4, 0)], vec![det(false, 0.3, 0)]],
        });
        let actions = vec![vec![1.0, 0.0]];
        let cascade = scorer
            .score_batch(&actions, &[5], CascadeLevel::CoarseFine)
            .expect("cascade");
        assert_eq!(cascade.detections.len(), 2);
        assert!(cascade.detections[0].true_positive);
        assert!(!cascade.detections[1].true_positive);

        let fine_only = scorer
            .score_batch(&actions, &[5], CascadeLevel::FineOnly)
            .expect("fine only");
        assert_eq!(fine_only.detections.len(), 1);
        assert!(fine_only.detections[0].true_positive);

        assert!(matches!(
            scorer.score_batch(&actions, &[6], CascadeLevel::FineOnly),
            Err(TrainError::MissingDetections(6))
        ));
    }
}
