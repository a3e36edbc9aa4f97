use std::error::Error;
use std::fs;
use std::path::PathBuf;

use burn::optim::AdamConfig;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_train::logger::{FileMetricLogger, MetricLogger};
use burn_train::metric::MetricEntry;
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;

use patchpick::ml::{
    ExplorationSchedule, MultiStepSchedule, Trainer, TrainerConfig, load_checkpoint, restore_agent,
};
use patchpick::{
    BatchLoader, DEFAULT_DEPTH, DEFAULT_HIDDEN, DirOffsetSource, LoaderConfig, PatchAgent,
    TableDetectionScorer, load_dataset,
};

type TrainBackend = Autodiff<NdArray<f32>>;

#[derive(Parser, Debug)]
#[command(
    about = "Train the patch-selection agent over a two-stage detection cascade",
    version,
    author
)]
struct TrainArgs {
    /// Learning rate passed to the Adam optimizer.
    #[arg(long, default_value_t = 1.0e-3)]
    lr: f64,
    /// Data directory holding train.bin, test.bin, offsets/ and detections.bin.
    #[arg(long, default_value = "data/")]
    data_dir: PathBuf,
    /// Checkpoint to resume the agent from.
    #[arg(long)]
    load: Option<PathBuf>,
    /// Directory where checkpoints and logs are written.
    #[arg(long, default_value = "cv/tmp/")]
    cv_dir: PathBuf,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    /// Edge length of the policy-network input image; recorded with the run.
    #[arg(long, default_value_t = 448)]
    img_size: usize,
    /// Epochs at which the learning rate decays (comma separated).
    #[arg(long = "epoch-step", value_delimiter = ',', default_values_t = vec![100usize, 1000])]
    epoch_step: Vec<usize>,
    /// Total epochs to run.
    #[arg(long, default_value_t = 10_000)]
    max_epochs: usize,
    /// Accepted for compatibility; the CPU backend runs single-device.
    #[arg(long, default_value_t = false)]
    parallel: bool,
    /// Score the single-step variant instead of the coarse+fine cascade.
    #[arg(long, default_value_t = false)]
    coarse_level_only: bool,
    /// Score substituted for targets with missing offset entries.
    #[arg(long, default_value_t = -0.5, allow_hyphen_values = true)]
    penalty: f32,
    /// Probability bounding factor at epoch 0.
    #[arg(long, default_value_t = 0.8)]
    alpha: f32,
    /// Coarse detector increment.
    #[arg(long, default_value_t = 0.1)]
    beta: f32,
    /// Cost for patch use.
    #[arg(long, default_value_t = 0.5)]
    sigma: f32,
    /// Hidden layer width of the agent.
    #[arg(long, default_value_t = DEFAULT_HIDDEN)]
    hidden: usize,
    /// Number of hidden layers of the agent.
    #[arg(long, default_value_t = DEFAULT_DEPTH)]
    depth: usize,
    /// Windows in the action vector; must match the offset tables.
    #[arg(long, default_value_t = 16)]
    num_windows: usize,
    /// Run evaluation and checkpointing every Nth epoch.
    #[arg(long, default_value_t = 10)]
    eval_every: usize,
    /// Loader prefetch hint for the training split.
    #[arg(long, default_value_t = 16)]
    workers: usize,
    /// Master seed controlling shuffling and policy sampling.
    #[arg(long, default_value_t = 0xCA5C_ADEu64)]
    seed: u64,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = TrainArgs::parse();
    validate_args(&args)?;
    fs::create_dir_all(&args.cv_dir)?;
    fs::write(args.cv_dir.join("args.txt"), format!("{args:#?}\n"))?;

    let train_set = load_dataset(&args.data_dir.join("train.bin"))?;
    let test_set = load_dataset(&args.data_dir.join("test.bin"))?;
    if train_set.feature_dim() != test_set.feature_dim() {
        return Err("train and test splits disagree on feature width".into());
    }
    let offsets = DirOffsetSource::new(args.data_dir.join("offsets"), args.penalty);
    let mut scorer = TableDetectionScorer::load(&args.data_dir.join("detections.bin"))?;

    let (agent, start_epoch) = match &args.load {
        Some(path) => {
            let checkpoint = load_checkpoint(path)?;
            if checkpoint.meta.num_windows != args.num_windows {
                return Err("checkpoint window count does not match --num-windows".into());
            }
            let agent = restore_agent::<TrainBackend>(&checkpoint)?;
            println!(
                "loaded agent from {} (epoch {}, reward {:.3e})",
                path.display(),
                checkpoint.meta.epoch,
                checkpoint.meta.mean_reward
            );
            (agent, checkpoint.resume_epoch())
        }
        None => (
            PatchAgent::<TrainBackend>::new(
                train_set.feature_dim(),
                args.hidden,
                args.depth,
                args.num_windows,
            ),
            0,
        ),
    };
    if agent.feature_dim() != train_set.feature_dim() {
        return Err("agent feature width does not match the dataset".into());
    }
    if args.parallel {
        println!("--parallel has no effect on the CPU backend; continuing single-device");
    }

    let mut trainer = Trainer::new(
        agent,
        AdamConfig::new(),
        MultiStepSchedule::new(args.lr, args.epoch_step.clone(), 0.1),
        TrainerConfig {
            num_windows: args.num_windows,
            beta: args.beta,
            sigma: args.sigma,
            exploration: ExplorationSchedule::with_alpha0(args.alpha),
            coarse_level_only: args.coarse_level_only,
        },
    )?;

    let mut train_loader = BatchLoader::new(
        &train_set,
        LoaderConfig {
            batch_size: args.batch_size,
            shuffle: true,
            workers: args.workers,
        },
    )?;
    let test_loader = BatchLoader::new(
        &test_set,
        LoaderConfig {
            batch_size: args.batch_size,
            shuffle: false,
            workers: 4,
        },
    )?;

    let log_dir = args.cv_dir.join("log");
    let mut train_logger = FileMetricLogger::new_train(&log_dir.join("train"));
    let mut test_logger = FileMetricLogger::new_eval(&log_dir.join("test"));
    let mut rng = StdRng::seed_from_u64(args.seed);

    for epoch in start_epoch..start_epoch + args.max_epochs {
        let report = trainer.train_epoch(epoch, &mut train_loader, &offsets, &mut rng)?;
        println!(
            "Train: {} | Rw: {:.2e} | S: {:.3} | V: {:.3} | #: {}",
            epoch,
            report.stats.mean_reward,
            report.stats.sparsity,
            report.stats.reward_variance,
            report.stats.unique_policies
        );
        log_scalar(&mut train_logger, "reward", report.stats.mean_reward as f64, epoch);
        log_scalar(&mut train_logger, "sparsity", report.stats.sparsity as f64, epoch);
        log_scalar(&mut train_logger, "variance", report.stats.reward_variance as f64, epoch);
        log_scalar(
            &mut train_logger,
            "baseline_reward",
            report.mean_baseline_reward as f64,
            epoch,
        );
        log_scalar(
            &mut train_logger,
            "unique_policies",
            report.stats.unique_policies as f64,
            epoch,
        );
        train_logger.end_epoch(epoch);

        if epoch % args.eval_every == 0 {
            let eval = trainer.evaluate(
                epoch,
                &test_loader,
                &offsets,
                &mut scorer,
                Some(args.cv_dir.as_path()),
            )?;
            println!(
                "Test - AP: {:.3} | AR: {:.3}",
                eval.detection.mean_ap, eval.detection.mean_recall
            );
            println!(
                "Test - Rw: {:.2e} | S: {:.3} | V: {:.3} | #: {}",
                eval.stats.mean_reward,
                eval.stats.sparsity,
                eval.stats.reward_variance,
                eval.stats.unique_policies
            );
            if let Some(path) = &eval.checkpoint {
                println!("checkpoint saved -> {}", path.display());
            }
            log_scalar(&mut test_logger, "reward", eval.stats.mean_reward as f64, epoch);
            log_scalar(&mut test_logger, "AP", eval.detection.mean_ap as f64, epoch);
            log_scalar(&mut test_logger, "AR", eval.detection.mean_recall as f64, epoch);
            log_scalar(&mut test_logger, "sparsity", eval.stats.sparsity as f64, epoch);
            log_scalar(&mut test_logger, "variance", eval.stats.reward_variance as f64, epoch);
            log_scalar(
                &mut test_logger,
                "unique_policies",
                eval.stats.unique_policies as f64,
                epoch,
            );
            test_logger.end_epoch(epoch);
        }
    }
    Ok(())
}

fn validate_args(args: &TrainArgs) -> Result<(), Box<dyn Error>> {
    if args.lr <= 0.0 {
        return Err("learning rate must be positive".into());
    }
    if args.batch_size == 0 {
        return Err("batch size must be positive".into());
    }
    if args.num_windows == 0 {
        return Err("window count must be positive".into());
    }
    if args.depth == 0 || args.hidden == 0 {
        return Err("agent hidden width and depth must be positive".into());
    }
    if args.eval_every == 0 {
        return Err("eval cadence must be positive".into());
    }
    if !(0.0..1.0).contains(&args.alpha) {
        return Err("alpha must be in [0, 1)".into());
    }
    if args.sigma < 0.0 {
        return Err("sigma must be non-negative".into());
    }
    if args.img_size == 0 {
        return Err("image size must be positive".into());
    }
    if let Some(path) = &args.load {
        if !path.is_file() {
            return Err("checkpoint to load does not exist".into());
        }
    }
    Ok(())
}

fn log_scalar(logger: &mut FileMetricLogger, name: &str, value: f64, epoch: usize) {
    let entry = MetricEntry::new(
        name.to_string().into(),
        format!("epoch {epoch}: {value:.6}"),
        format!("{value:.8}"),
    );
    logger.log(&entry);
}
