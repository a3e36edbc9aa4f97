use std::collections::HashSet;

/// Epoch-level reductions over the per-batch (action batch, reward batch)
/// sequence.
#[derive(Clone, Debug)]
pub struct EpochStats {
    /// Mean per-sample reward.
    pub mean_reward: f32,
    /// Mean fraction of windows escalated.
    pub sparsity: f32,
    /// Population variance of the per-sample reward.
    pub reward_variance: f32,
    /// Count of distinct action vectors seen, across batch boundaries.
    pub unique_policies: usize,
}

impl EpochStats {
    pub fn from_batches(policies: &[Vec<Vec<f32>>], rewards: &[Vec<f32>]) -> Self {
        let mut policy_set: HashSet<Vec<u8>> = HashSet::new();
        let mut samples = 0usize;
        let mut sparsity_sum = 0.0f64;
        for batch in policies {
            for action in batch {
                policy_set.insert(action.iter().map(|&a| (a >= 0.5) as u8).collect());
                let windows = action.len().max(1) as f64;
                sparsity_sum += action.iter().map(|&a| a as f64).sum::<f64>() / windows;
                samples += 1;
            }
        }

        let all_rewards: Vec<f32> = rewards.iter().flatten().copied().collect();
        let count = all_rewards.len().max(1) as f64;
        let mean = all_rewards.iter().map(|&r| r as f64).sum::<f64>() / count;
        let variance = all_rewards
            .iter()
            .map(|&r| {
                let d = r as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count;

        Self {
            mean_reward: mean as f32,
            sparsity: (sparsity_sum / samples.max(1) as f64) as f32,
            reward_variance: variance as f32,
            unique_policies: policy_set.len(),
        }
    }
}
