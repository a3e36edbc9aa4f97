use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Identifier keying a sample to its offset tables and ground-truth boxes.
pub type TargetId = u64;

/// One image sample: a flattened feature vector plus its target id.
#[derive(Clone, Debug)]
pub struct Sample {
    pub features: Vec<f32>,
    pub target: TargetId,
}

/// Fixed-width in-memory dataset of image samples.
#[derive(Clone, Debug)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    feature_dim: usize,
}

impl InMemoryDataset {
    pub fn new(feature_dim: usize) -> Self {
        Self {
            samples: Vec::new(),
            feature_dim,
        }
    }

    pub fn push(&mut self, sample: Sample) -> Result<(), TrainError> {
        if sample.features.len() != self.feature_dim {
            return Err(TrainError::ShapeMismatch {
                expected: self.feature_dim,
                actual: sample.features.len(),
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// On-disk record for one sample of a dataset split (`train.bin`,
/// `test.bin`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampleRecord {
    pub target: TargetId,
    pub features: Vec<f32>,
}

/// Loads a bincode-encoded split into memory. The first record fixes the
/// feature width; a record with a different width is a fatal shape error.
pub fn load_dataset(path: &Path) -> Result<InMemoryDataset, TrainError> {
    let bytes = std::fs::read(path)?;
    let (records, _): (Vec<SampleRecord>, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
    let feature_dim = records
        .first()
        .map(|record| record.features.len())
        .ok_or(TrainError::InvalidConfiguration("dataset split is empty"))?;
    let mut dataset = InMemoryDataset::new(feature_dim);
    for record in records {
        dataset.push(Sample {
            features: record.features,
            target: record.target,
        })?;
    }
    Ok(dataset)
}

/// Writes a dataset split in the format `load_dataset` reads.
pub fn save_dataset(path: &Path, records: &[SampleRecord]) -> Result<(), TrainError> {
    let bytes = bincode::serde::encode_to_vec(records, bincode::config::standard())
        .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Mini-batch materialized from the dataset: a row-major feature buffer plus
/// the per-sample target ids.
#[derive(Clone, Debug)]
pub struct Batch {
    pub features: Vec<f32>,
    pub targets: Vec<TargetId>,
    pub feature_dim: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Training loaders reshuffle at every epoch start; evaluation loaders
    /// keep dataset order.
    pub shuffle: bool,
    /// Prefetch-parallelism hint for external loaders. The in-memory loader
    /// is strictly sequential and only records it.
    pub workers: usize,
}

/// Sequential batch iterator over an [`InMemoryDataset`].
pub struct BatchLoader<'a> {
    dataset: &'a InMemoryDataset,
    config: LoaderConfig,
    order: Vec<usize>,
}

impl<'a> BatchLoader<'a> {
    pub fn new(dataset: &'a InMemoryDataset, config: LoaderConfig) -> Result<Self, TrainError> {
        if config.batch_size == 0 {
            return Err(TrainError::InvalidConfiguration("batch size must be positive"));
        }
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            config,
            order,
        })
    }

    /// Resets iteration order for a new epoch, reshuffling when configured.
    pub fn start_epoch<R: Rng>(&mut self, rng: &mut R) {
        if self.config.shuffle {
            self.order.shuffle(rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        let feature_dim = self.dataset.feature_dim();
        self.order.chunks(self.config.batch_size).map(move |chunk| {
            let mut features = Vec::with_capacity(chunk.len() * feature_dim);
            let mut targets = Vec::with_capacity(chunk.len());
            for &index in chunk {
                let sample = &self.dataset.samples()[index];
                features.extend_from_slice(&sample.features);
                targets.push(sample.target);
            }
            Batch {
                features,
                targets,
                feature_dim,
            }
        })
    }
}

/// Supplier of precomputed per-window outcome offsets for both detector
/// stages. Tables are read-only during training.
pub trait OffsetSource {
    /// Returns `(fine, coarse)` offset rows for the given targets, each row
    /// exactly `num_windows` wide.
    fn offsets(
        &self,
        targets: &[TargetId],
        num_windows: usize,
    ) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>), TrainError>;
}

/// Offset tables held in memory, keyed by target id.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOffsetSource {
    fine: HashMap<TargetId, Vec<f32>>,
    coarse: HashMap<TargetId, Vec<f32>>,
}

impl InMemoryOffsetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: TargetId, fine: Vec<f32>, coarse: Vec<f32>) {
        self.fine.insert(target, fine);
        self.coarse.insert(target, coarse);
    }

    fn row(
        table: &HashMap<TargetId, Vec<f32>>,
        target: TargetId,
        num_windows: usize,
    ) -> Result<Vec<f32>, TrainError> {
        let row = table.get(&target).ok_or(TrainError::MissingOffsets(target))?;
        if row.len() != num_windows {
            return Err(TrainError::ShapeMismatch {
                expected: num_windows,
                actual: row.len(),
            });
        }
        Ok(row.clone())
    }
}

impl OffsetSource for InMemoryOffsetSource {
    fn offsets(
        &self,
        targets: &[TargetId],
        num_windows: usize,
    ) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>), TrainError> {
        let mut fine = Vec::with_capacity(targets.len());
        let mut coarse = Vec::with_capacity(targets.len());
        for &target in targets {
            fine.push(Self::row(&self.fine, target, num_windows)?);
            coarse.push(Self::row(&self.coarse, target, num_windows)?);
        }
        Ok((fine, coarse))
    }
}

#[derive(Serialize, Deserialize)]
struct OffsetRecord {
    offsets: Vec<f32>,
}

/// Offset tables stored on disk as bincode files `fd/<target>.bin` and
/// `cd/<target>.bin` under the data directory. Rows shorter than the window
/// count are padded with the configured miss penalty.
#[derive(Clone, Debug)]
pub struct DirOffsetSource {
    root: PathBuf,
    penalty: f32,
}

impl DirOffsetSource {
    pub fn new(root: impl Into<PathBuf>, penalty: f32) -> Self {
        Self {
            root: root.into(),
            penalty,
        }
    }

    fn read_row(
        &self,
        stage: &str,
        target: TargetId,
        num_windows: usize,
    ) -> Result<Vec<f32>, TrainError> {
        let path = self.root.join(stage).join(format!("{target}.bin"));
        if !path.is_file() {
            return Err(TrainError::MissingOffsets(target));
        }
        let bytes = std::fs::read(&path)?;
        let (record, _): (OffsetRecord, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        let mut row = record.offsets;
        if row.len() > num_windows {
            return Err(TrainError::ShapeMismatch {
                expected: num_windows,
                actual: row.len(),
            });
        }
        row.resize(num_windows, self.penalty);
        Ok(row)
    }

    /// Writes one per-target offset row, creating the stage directory.
    pub fn write_row(
        root: &std::path::Path,
        stage: &str,
        target: TargetId,
        offsets: &[f32],
    ) -> Result<(), TrainError> {
        let dir = root.join(stage);
        std::fs::create_dir_all(&dir)?;
        let record = OffsetRecord {
            offsets: offsets.to_vec(),
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|err| TrainError::Checkpoint(err.to_string()))?;
        std::fs::write(dir.join(format!("{target}.bin")), bytes)?;
        Ok(())
    }
}

impl OffsetSource for DirOffsetSource {
    fn offsets(
        &self,
        targets: &[TargetId],
        num_windows: usize,
    ) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>), TrainError> {
        let mut fine = Vec::with_capacity(targets.len());
        let mut coarse = Vec::with_capacity(targets.len());
        for &target in targets {
            fine.push(self.read_row("fd", target, num_windows)?);
            coarse.push(self.read_row("cd", target, num_windows)?);
        }
        Ok((fine, coarse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dataset(count: usize) -> InMemoryDataset {
        let mut dataset = InMemoryDataset::new(2);
        for index in 0..count {
            dataset
                .push(Sample {
                    features: vec![index as f32, 0.5],
                    target: index as TargetId,
                })
                .expect("sample");
        }
        dataset
    }

    #[test]
    fn push_rejects_wrong_feature_width() {
        let mut dataset = InMemoryDataset::new(3);
        let err = dataset
            .push(Sample {
                features: vec![1.0],
                target: 0,
            })
            .unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { expected: 3, actual: 1 }));
    }

    #[test]
    fn eval_loader_preserves_dataset_order() {
        let dataset = dataset(5);
        let mut loader = BatchLoader::new(
            &dataset,
            LoaderConfig {
                batch_size: 2,
                shuffle: false,
                workers: 1,
            },
        )
        .expect("loader");
        let mut rng = StdRng::seed_from_u64(1);
        loader.start_epoch(&mut rng);
        let targets: Vec<TargetId> = loader.batches().flat_map(|b| b.targets).collect();
        assert_eq!(targets, vec![0, 1, 2, 3, 4]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn train_loader_shuffles_but_keeps_every_sample() {
        let dataset = dataset(16);
        let mut loader = BatchLoader::new(
            &dataset,
            LoaderConfig {
                batch_size: 4,
                shuffle: true,
                workers: 4,
            },
        )
        .expect("loader");
        let mut rng = StdRng::seed_from_u64(7);
        loader.start_epoch(&mut rng);
        let mut targets: Vec<TargetId> = loader.batches().flat_map(|b| b.targets).collect();
        assert_ne!(targets, (0..16).collect::<Vec<_>>());
        targets.sort_unstable();
        assert_eq!(targets, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn in_memory_offsets_validate_width() {
        let mut source = InMemoryOffsetSource::new();
        source.insert(3, vec![1.0, 0.0], vec![0.5, 0.5]);
        let (fine, coarse) = source.offsets(&[3], 2).expect("offsets");
        assert_eq!(fine, vec![vec![1.0, 0.0]]);
        assert_eq!(coarse, vec![vec![0.5, 0.5]]);
        assert!(source.offsets(&[3], 4).is_err());
        assert!(matches!(
            source.offsets(&[9], 2),
            Err(TrainError::MissingOffsets(9))
        ));
    }

    #[test]
    fn dataset_split_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("patchpick-split-{}.bin", std::process::id()));
        let records = vec![
            SampleRecord {
                target: 7,
                features: vec![0.1, 0.2],
            },
            SampleRecord {
                target: 9,
                features: vec![0.3, 0.4],
            },
        ];
        save_dataset(&path, &records).expect("save");
        let dataset = load_dataset(&path).expect("load");
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.feature_dim(), 2);
        assert_eq!(dataset.samples()[1].target, 9);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dir_offsets_round_trip_with_penalty_padding() {
        let root = std::env::temp_dir().join(format!("patchpick-offsets-{}", std::process::id()));
        DirOffsetSource::write_row(&root, "fd", 1, &[1.0, 0.0]).expect("write fd");
        DirOffsetSource::write_row(&root, "cd", 1, &[0.25]).expect("write cd");
        let source = DirOffsetSource::new(&root, -0.5);
        let (fine, coarse) = source.offsets(&[1], 3).expect("offsets");
        assert_eq!(fine, vec![vec![1.0, 0.0, -0.5]]);
        assert_eq!(coarse, vec![vec![0.25, -0.5, -0.5]]);
        assert!(matches!(
            source.offsets(&[2], 3),
            Err(TrainError::MissingOffsets(2))
        ));
        std::fs::remove_dir_all(&root).ok();
    }
}
