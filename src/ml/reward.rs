/// Per-sample reward for an action batch against precomputed offset tables.
///
/// Escalated windows score their fine-detector offset; the rest score the
/// coarse-detector offset plus the coarse increment `beta`. A linear
/// acquisition cost `sigma`, normalized by window count, is charged per
/// escalated window. Pure: no hidden state, identical inputs give identical
/// outputs, and the same function scores sampled and baseline actions so the
/// advantage stays unbiased.
pub fn compute_reward(
    offset_fd: &[Vec<f32>],
    offset_cd: &[Vec<f32>],
    actions: &[Vec<f32>],
    beta: f32,
    sigma: f32,
) -> Vec<f32> {
    assert_eq!(offset_fd.len(), actions.len(), "fine offsets per sample");
    assert_eq!(offset_cd.len(), actions.len(), "coarse offsets per sample");
    actions
        .iter()
        .zip(offset_fd)
        .zip(offset_cd)
        .map(|((action, fine), coarse)| {
            assert_eq!(action.len(), fine.len(), "fine offsets per window");
            assert_eq!(action.len(), coarse.len(), "coarse offsets per window");
            let windows = action.len().max(1) as f32;
            let mut correctness = 0.0f32;
            let mut escalated = 0.0f32;
            for ((&a, &f), &c) in action.iter().zip(fine).zip(coarse) {
                correctness += a * f + (1.0 - a) * (c + beta);
                escalated += a;
            }
            correctness - sigma * escalated / windows
        })
        .collect()
}
