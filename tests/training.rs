use burn::optim::AdamConfig;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use rand::SeedableRng;
use rand::rngs::StdRng;

use patchpick::ml::{ExplorationSchedule, MultiStepSchedule, load_checkpoint, restore_agent};
use patchpick::{
    BatchLoader, Detection, InMemoryDataset, InMemoryOffsetSource, LoaderConfig, PatchAgent,
    Sample, TableDetectionScorer, TargetDetections, Trainer, TrainerConfig,
};

type TrainBackend = Autodiff<NdArray<f32>>;

const FEATURES: usize = 4;
const WINDOWS: usize = 3;

fn synthetic_world(count: usize) -> (InMemoryDataset, InMemoryOffsetSource, TableDetectionScorer) {
    let mut dataset = InMemoryDataset::new(FEATURES);
    let mut offsets = InMemoryOffsetSource::new();
    let mut scorer = TableDetectionScorer::new();
    for index in 0..count as u64 {
        dataset
            .push(Sample {
                features: vec![index as f32 * 0.05, 0.3, -0.2, 0.9],
                target: index,
            })
            .expect("sample");
        // Window 0 pays off under the fine detector, the others do not.
        offsets.insert(index, vec![1.0, 0.1, 0.1], vec![0.2, 0.1, 0.1]);
        let hit = |score: f32| {
            vec![Detection {
                true_positive: true,
                score,
                label: 0,
            }]
        };
        let miss = |score: f32| {
            vec![Detection {
                true_positive: false,
                score,
                label: 0,
            }]
        };
        scorer.insert(TargetDetections {
            target: index,
            ground_truth: vec![0],
            fine: vec![hit(0.9), miss(0.5), miss(0.5)],
            coarse: vec![miss(0.4), miss(0.3), miss(0.3)],
        });
    }
    (dataset, offsets, scorer)
}

fn trainer(num_windows: usize) -> Trainer<TrainBackend> {
    Trainer::new(
        PatchAgent::<TrainBackend>::new(FEATURES, 16, 2, num_windows),
        AdamConfig::new(),
        MultiStepSchedule::new(5.0e-3, vec![100, 1000], 0.1),
        TrainerConfig {
            num_windows,
            beta: 0.1,
            sigma: 0.5,
            exploration: ExplorationSchedule::default(),
            coarse_level_only: false,
        },
    )
    .expect("trainer")
}

#[test]
fn training_and_evaluation_interleave_over_epochs() {
    let (dataset, offsets, mut scorer) = synthetic_world(24);
    let mut trainer = trainer(WINDOWS);
    let mut train_loader = BatchLoader::new(
        &dataset,
        LoaderConfig {
            batch_size: 8,
            shuffle: true,
            workers: 2,
        },
    )
    .expect("train loader");
    let eval_loader = BatchLoader::new(
        &dataset,
        LoaderConfig {
            batch_size: 8,
            shuffle: false,
            workers: 1,
        },
    )
    .expect("eval loader");

    let mut rng = StdRng::seed_from_u64(99);
    for epoch in 0..4 {
        let report = trainer
            .train_epoch(epoch, &mut train_loader, &offsets, &mut rng)
            .expect("train epoch");
        assert_eq!(report.epoch, epoch);
        assert_eq!(report.batches, 3);
        assert!(report.stats.mean_reward.is_finite());
        assert!(report.mean_baseline_reward.is_finite());
        assert!((0.0..=1.0).contains(&report.stats.sparsity));
        assert!(report.stats.unique_policies >= 1);
        assert!((report.alpha - (0.8 + epoch as f32 * 0.001)).abs() < 1e-6);
    }

    let eval = trainer
        .evaluate(3, &eval_loader, &offsets, &mut scorer, None)
        .expect("evaluate");
    assert_eq!(eval.detection.per_class.len(), 1);
    assert!((0.0..=1.0).contains(&eval.detection.mean_ap));
    assert!((0.0..=1.0).contains(&eval.detection.mean_recall));
    assert!(eval.stats.mean_reward.is_finite());
    assert!(eval.checkpoint.is_none());
}

#[test]
fn evaluation_checkpoint_resumes_the_run() {
    let (dataset, offsets, mut scorer) = synthetic_world(8);
    let mut trainer = trainer(WINDOWS);
    let mut loader = BatchLoader::new(
        &dataset,
        LoaderConfig {
            batch_size: 4,
            shuffle: true,
            workers: 1,
        },
    )
    .expect("loader");
    let mut rng = StdRng::seed_from_u64(5);
    for epoch in 0..2 {
        trainer
            .train_epoch(epoch, &mut loader, &offsets, &mut rng)
            .expect("train epoch");
    }

    let dir = std::env::temp_dir().join(format!("patchpick-e2e-{}", std::process::id()));
    let eval_loader = BatchLoader::new(
        &dataset,
        LoaderConfig {
            batch_size: 4,
            shuffle: false,
            workers: 1,
        },
    )
    .expect("eval loader");
    let eval = trainer
        .evaluate(1, &eval_loader, &offsets, &mut scorer, Some(dir.as_path()))
        .expect("evaluate");
    let path = eval.checkpoint.expect("checkpoint path");
    assert!(path.is_file());
    assert!(
        path.file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ckpt_E1_R")
    );

    let checkpoint = load_checkpoint(&path).expect("load checkpoint");
    assert_eq!(checkpoint.resume_epoch(), 2);
    assert!((checkpoint.meta.mean_reward - eval.stats.mean_reward).abs() < 1e-6);
    let restored = restore_agent::<TrainBackend>(&checkpoint).expect("restore");
    assert_eq!(restored.num_windows(), WINDOWS);
    assert_eq!(restored.feature_dim(), FEATURES);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn deterministic_evaluation_is_repeatable() {
    let (dataset, offsets, mut scorer) = synthetic_world(12);
    let trainer = trainer(WINDOWS);
    let loader = BatchLoader::new(
        &dataset,
        LoaderConfig {
            batch_size: 6,
            shuffle: false,
            workers: 1,
        },
    )
    .expect("loader");
    let first = trainer
        .evaluate(0, &loader, &offsets, &mut scorer, None)
        .expect("first");
    let second = trainer
        .evaluate(0, &loader, &offsets, &mut scorer, None)
        .expect("second");
    assert_eq!(first.stats.mean_reward, second.stats.mean_reward);
    assert_eq!(first.stats.unique_policies, second.stats.unique_policies);
    assert_eq!(first.detection.mean_ap, second.detection.mean_ap);
}
