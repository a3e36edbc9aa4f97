use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;

/// Probabilities are kept this far away from {0, 1} so log-probabilities stay
/// finite.
pub const PROB_EPS: f32 = 1.0e-6;

/// Exploration-bounding factor schedule: `a = clip(alpha0 + epoch * rate,
/// min, max)`. Shaping with `a` pushes each probability toward whichever side
/// of 0.5 it already favors, annealing toward near-deterministic behavior as
/// epochs advance.
#[derive(Clone, Debug)]
pub struct ExplorationSchedule {
    pub alpha0: f32,
    pub epoch_rate: f32,
    pub alpha_min: f32,
    pub alpha_max: f32,
}

impl Default for ExplorationSchedule {
    fn default() -> Self {
        Self {
            alpha0: 0.8,
            epoch_rate: 0.001,
            alpha_min: 0.6,
            alpha_max: 0.95,
        }
    }
}

impl ExplorationSchedule {
    pub fn with_alpha0(alpha0: f32) -> Self {
        Self {
            alpha0,
            ..Self::default()
        }
    }

    pub fn alpha_at(&self, epoch: usize) -> f32 {
        (self.alpha0 + epoch as f32 * self.epoch_rate).clamp(self.alpha_min, self.alpha_max)
    }
}

/// `p' = p*a + (1-a)*(1-p)`, applied entrywise before distribution
/// construction.
pub fn shape_probs<B: Backend>(probs: Tensor<B, 2>, alpha: f32) -> Tensor<B, 2> {
    probs.clone() * alpha + (-probs + 1.0) * (1.0 - alpha)
}

/// Bernoulli-per-entry action distribution over a batch of shaped probability
/// vectors. Pure computation: sampling draws from an explicit RNG, and
/// `log_prob` keeps gradients flowing through the probabilities only.
pub struct PatchDistribution<B: Backend> {
    probs: Tensor<B, 2>,
    host: Vec<f32>,
    batch: usize,
    windows: usize,
}

impl<B: Backend> PatchDistribution<B> {
    pub fn new(probs: Tensor<B, 2>) -> Self {
        let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS);
        let dims = probs.shape().dims;
        let host = probs
            .clone()
            .detach()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        Self {
            probs,
            host,
            batch: dims[0],
            windows: dims[1],
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn windows(&self) -> usize {
        self.windows
    }

    /// Independent Bernoulli draw per entry.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<Vec<f32>> {
        (0..self.batch)
            .map(|row| {
                self.host[row * self.windows..(row + 1) * self.windows]
                    .iter()
                    .map(|&p| if rng.r#gen::<f32>() < p { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    /// Deterministic thresholded action: `p >= 0.5` escalates, ties go to the
    /// "use" branch.
    pub fn greedy(&self) -> Vec<Vec<f32>> {
        (0..self.batch)
            .map(|row| {
                self.host[row * self.windows..(row + 1) * self.windows]
                    .iter()
                    .map(|&p| if p >= 0.5 { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    /// Per-entry log-likelihood of an action batch under the current
    /// probabilities: `a*ln(p) + (1-a)*ln(1-p)`.
    pub fn log_prob(&self, actions: &[Vec<f32>]) -> Tensor<B, 2> {
        let flat: Vec<f32> = actions.iter().flatten().copied().collect();
        let actions = Tensor::<B, 2>::from_data(
            TensorData::new(flat, [self.batch, self.windows]),
            &self.probs.device(),
        );
        let p = self.probs.clone();
        actions.clone() * p.clone().log() + (-actions + 1.0) * (-p + 1.0).log()
    }
}
