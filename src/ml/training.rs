use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, LearningRate, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::{Batch, BatchLoader, OffsetSource};
use crate::detector::{CascadeLevel, DetectionAccumulator, DetectionScorer, DetectionSummary};
use crate::error::TrainError;
use crate::ml::agent::PatchAgent;
use crate::ml::distribution::{ExplorationSchedule, PatchDistribution, shape_probs};
use crate::ml::reward::compute_reward;
use crate::ml::stats::EpochStats;

/// Multi-step learning-rate decay: the base rate is scaled by `gamma` once
/// for every milestone the epoch has reached, and stays constant in between.
#[derive(Clone, Debug)]
pub struct MultiStepSchedule {
    base_lr: LearningRate,
    milestones: Vec<usize>,
    gamma: f64,
}

impl MultiStepSchedule {
    pub fn new(base_lr: LearningRate, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        Self {
            base_lr,
            milestones,
            gamma,
        }
    }

    pub fn lr_at(&self, epoch: usize) -> LearningRate {
        let passed = self.milestones.iter().filter(|&&m| epoch >= m).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    pub num_windows: usize,
    /// Coarse detector increment credited to non-escalated windows.
    pub beta: f32,
    /// Patch acquisition cost.
    pub sigma: f32,
    pub exploration: ExplorationSchedule,
    /// Score the single-step variant instead of the coarse+fine cascade.
    pub coarse_level_only: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub mean_reward: f32,
    pub feature_dim: usize,
    pub hidden: usize,
    pub depth: usize,
    pub num_windows: usize,
}

/// Snapshot of the agent written once per evaluation cycle. Superseded, never
/// mutated: each save produces a new file whose name embeds epoch and reward.
#[derive(Serialize, Deserialize)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub weights: Vec<u8>,
}

impl Checkpoint {
    /// Epoch at which a resumed run continues.
    pub fn resume_epoch(&self) -> usize {
        self.meta.epoch + 1
    }
}

pub fn checkpoint_file_name(epoch: usize, mean_reward: f32) -> String {
    format!("ckpt_E{epoch}_R{mean_reward:+.3e}.bin")
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint, TrainError> {
    let bytes = std::fs::read(path)?;
    let (checkpoint, _): (Checkpoint, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
    Ok(checkpoint)
}

/// Rebuilds the agent described by a checkpoint and restores its parameters.
pub fn restore_agent<B>(checkpoint: &Checkpoint) -> Result<PatchAgent<B>, TrainError>
where
    B: Backend,
    B::Device: Default,
{
    let meta = &checkpoint.meta;
    let agent = PatchAgent::<B>::new(meta.feature_dim, meta.hidden, meta.depth, meta.num_windows);
    let device = B::Device::default();
    let record = BinBytesRecorder::<FullPrecisionSettings>::new()
        .load::<<PatchAgent<B> as Module<B>>::Record>(checkpoint.weights.clone(), &device)
        .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
    Ok(agent.load_record(record))
}

#[derive(Clone, Debug)]
pub struct TrainEpochReport {
    pub epoch: usize,
    pub stats: EpochStats,
    pub mean_baseline_reward: f32,
    pub batches: usize,
    pub lr: LearningRate,
    pub alpha: f32,
}

#[derive(Clone, Debug)]
pub struct EvalReport {
    pub epoch: usize,
    pub stats: EpochStats,
    pub detection: DetectionSummary,
    pub checkpoint: Option<PathBuf>,
}

struct BatchOutcome {
    policy: Vec<Vec<f32>>,
    reward_sample: Vec<f32>,
    reward_baseline: Vec<f32>,
}

/// Owns the agent, its optimizer and the epoch schedules; the only component
/// allowed to mutate agent parameters. Batches run strictly sequentially.
pub struct Trainer<B: AutodiffBackend> {
    agent: PatchAgent<B>,
    optimizer: OptimizerAdaptor<Adam, PatchAgent<B>, B>,
    schedule: MultiStepSchedule,
    config: TrainerConfig,
}

impl<B> Trainer<B>
where
    B: AutodiffBackend,
    B::Device: Default,
{
    pub fn new(
        agent: PatchAgent<B>,
        optimizer: AdamConfig,
        schedule: MultiStepSchedule,
        config: TrainerConfig,
    ) -> Result<Self, TrainError> {
        if config.num_windows == 0 {
            return Err(TrainError::InvalidConfiguration("window count must be positive"));
        }
        if agent.num_windows() != config.num_windows {
            return Err(TrainError::ShapeMismatch {
                expected: config.num_windows,
                actual: agent.num_windows(),
            });
        }
        Ok(Self {
            agent,
            optimizer: optimizer.init(),
            schedule,
            config,
        })
    }

    pub fn agent(&self) -> &PatchAgent<B> {
        &self.agent
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &MultiStepSchedule {
        &self.schedule
    }

    /// One pass over the training split: per batch, sample a stochastic
    /// action vector, score it and the greedy baseline with the same reward
    /// function, and take a single REINFORCE step on the advantage.
    pub fn train_epoch<R: Rng>(
        &mut self,
        epoch: usize,
        loader: &mut BatchLoader<'_>,
        offsets: &dyn OffsetSource,
        rng: &mut R,
    ) -> Result<TrainEpochReport, TrainError> {
        let lr = self.schedule.lr_at(epoch);
        let alpha = self.config.exploration.alpha_at(epoch);
        loader.start_epoch(rng);

        let mut policies = Vec::new();
        let mut rewards = Vec::new();
        let mut baseline_rewards = Vec::new();
        let mut batches = 0usize;
        for batch in loader.batches() {
            let outcome = self.train_batch(alpha, lr, &batch, offsets, rng)?;
            policies.push(outcome.policy);
            rewards.push(outcome.reward_sample);
            baseline_rewards.push(outcome.reward_baseline);
            batches += 1;
        }

        let stats = EpochStats::from_batches(&policies, &rewards);
        let baseline: Vec<f32> = baseline_rewards.into_iter().flatten().collect();
        let mean_baseline_reward =
            baseline.iter().sum::<f32>() / baseline.len().max(1) as f32;
        Ok(TrainEpochReport {
            epoch,
            stats,
            mean_baseline_reward,
            batches,
            lr,
            alpha,
        })
    }

    fn train_batch<R: Rng>(
        &mut self,
        alpha: f32,
        lr: LearningRate,
        batch: &Batch,
        offsets: &dyn OffsetSource,
        rng: &mut R,
    ) -> Result<BatchOutcome, TrainError> {
        if batch.feature_dim != self.agent.feature_dim() {
            return Err(TrainError::ShapeMismatch {
                expected: self.agent.feature_dim(),
                actual: batch.feature_dim,
            });
        }
        let rows = batch.len();
        let windows = self.config.num_windows;
        let device = B::Device::default();
        let input = Tensor::<B, 2>::from_data(
            TensorData::new(batch.features.clone(), [rows, batch.feature_dim]),
            &device,
        );

        let probs = sigmoid(self.agent.forward(input));
        let distribution = PatchDistribution::new(shape_probs(probs, alpha));
        let sampled = distribution.sample(rng);
        let baseline = distribution.greedy();

        let (offset_fd, offset_cd) = offsets.offsets(&batch.targets, windows)?;
        let reward_sample =
            compute_reward(&offset_fd, &offset_cd, &sampled, self.config.beta, self.config.sigma);
        let reward_baseline =
            compute_reward(&offset_fd, &offset_cd, &baseline, self.config.beta, self.config.sigma);

        // Host-side advantage: no gradient flows through reward or baseline.
        let advantage: Vec<f32> = reward_sample
            .iter()
            .zip(&reward_baseline)
            .map(|(s, b)| s - b)
            .collect();
        let advantage = Tensor::<B, 2>::from_data(TensorData::new(advantage, [rows, 1]), &device);

        let log_prob = distribution.log_prob(&sampled);
        let loss = (-log_prob * advantage.expand([rows, windows])).mean();
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.agent);
        let model = self.agent.clone();
        self.agent = self.optimizer.step(lr, model, grads);

        Ok(BatchOutcome {
            policy: sampled,
            reward_sample,
            reward_baseline,
        })
    }

    /// One pass over the evaluation split with the agent's inference view:
    /// deterministic thresholded actions, detection scoring through the
    /// collaborator, and a checkpoint when a directory is given.
    pub fn evaluate(
        &self,
        epoch: usize,
        loader: &BatchLoader<'_>,
        offsets: &dyn OffsetSource,
        scorer: &mut dyn DetectionScorer,
        checkpoint_dir: Option<&Path>,
    ) -> Result<EvalReport, TrainError> {
        let agent = self.agent.valid();
        let level = if self.config.coarse_level_only {
            CascadeLevel::FineOnly
        } else {
            CascadeLevel::CoarseFine
        };
        let windows = self.config.num_windows;
        let device = B::Device::default();

        let mut accumulator = DetectionAccumulator::new();
        let mut policies = Vec::new();
        let mut rewards = Vec::new();
        for batch in loader.batches() {
            if batch.feature_dim != agent.feature_dim() {
                return Err(TrainError::ShapeMismatch {
                    expected: agent.feature_dim(),
                    actual: batch.feature_dim,
                });
            }
            let rows = batch.len();
            let input = Tensor::<B::InnerBackend, 2>::from_data(
                TensorData::new(batch.features.clone(), [rows, batch.feature_dim]),
                &device,
            );
            let probs = sigmoid(agent.forward(input));
            let distribution = PatchDistribution::new(probs);
            let policy = distribution.greedy();

            let (offset_fd, offset_cd) = offsets.offsets(&batch.targets, windows)?;
            let reward = compute_reward(
                &offset_fd,
                &offset_cd,
                &policy,
                self.config.beta,
                self.config.sigma,
            );
            accumulator.merge(scorer.score_batch(&policy, &batch.targets, level)?);
            policies.push(policy);
            rewards.push(reward);
        }

        let stats = EpochStats::from_batches(&policies, &rewards);
        let detection = accumulator.ap_per_class();
        let checkpoint = match checkpoint_dir {
            Some(dir) => Some(self.save_checkpoint(dir, epoch, stats.mean_reward)?),
            None => None,
        };
        Ok(EvalReport {
            epoch,
            stats,
            detection,
            checkpoint,
        })
    }

    pub fn save_checkpoint(
        &self,
        dir: &Path,
        epoch: usize,
        mean_reward: f32,
    ) -> Result<PathBuf, TrainError> {
        std::fs::create_dir_all(dir)?;
        let record = self.agent.clone().valid().into_record();
        let weights = BinBytesRecorder::<FullPrecisionSettings>::new()
            .record(record, ())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        let checkpoint = Checkpoint {
            meta: CheckpointMeta {
                epoch,
                mean_reward,
                feature_dim: self.agent.feature_dim(),
                hidden: self.agent.hidden(),
                depth: self.agent.depth(),
                num_windows: self.agent.num_windows(),
            },
            weights,
        };
        let bytes = bincode::serde::encode_to_vec(&checkpoint, bincode::config::standard())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        let path = dir.join(checkpoint_file_name(epoch, mean_reward));
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}
