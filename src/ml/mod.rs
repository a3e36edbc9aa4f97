pub mod agent;
pub mod distribution;
pub mod reward;
pub mod stats;
pub mod training;

pub use agent::{DEFAULT_DEPTH, DEFAULT_HIDDEN, PatchAgent};
pub use distribution::{ExplorationSchedule, PROB_EPS, PatchDistribution, shape_probs};
pub use reward::compute_reward;
pub use stats::EpochStats;
pub use training::{
    Checkpoint, CheckpointMeta, EvalReport, MultiStepSchedule, TrainEpochReport, Trainer,
    TrainerConfig, checkpoint_file_name, load_checkpoint, restore_agent,
};
