//! Training harness for a patch-selection agent driving a two-stage object
//! detection cascade: a REINFORCE policy with a greedy baseline decides, per
//! spatial window, whether to escalate to the expensive fine detector.

pub mod data;
pub mod detector;
pub mod error;
pub mod ml;

pub use crate::data::{
    Batch, BatchLoader, DirOffsetSource, InMemoryDataset, InMemoryOffsetSource, LoaderConfig,
    OffsetSource, Sample, SampleRecord, TargetId, load_dataset, save_dataset,
};
pub use crate::detector::{
    BatchDetections, CascadeLevel, ClassMetrics, Detection, DetectionAccumulator, DetectionScorer,
    DetectionSummary, TableDetectionScorer, TargetDetections,
};
pub use crate::error::TrainError;
pub use crate::ml::{
    DEFAULT_DEPTH, DEFAULT_HIDDEN, EpochStats, ExplorationSchedule, PatchAgent, PatchDistribution,
    Trainer, TrainerConfig,
};
