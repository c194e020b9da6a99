use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    thread,
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;

use crate::TrainError;

/// Label-name to class-id mapping, shared by the train and validation
/// manifests.
#[derive(Debug, Clone)]
pub struct LabelMapping {
    classes: HashMap<String, u32>,
}

impl LabelMapping {
    pub fn from_path(path: &Path) -> Result<Self, TrainError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainError::initialization(format!(
                "failed to read label mapping {}: {err}",
                path.display()
            ))
        })?;
        let classes: HashMap<String, u32> = serde_json::from_str(&contents).map_err(|err| {
            TrainError::initialization(format!(
                "failed to parse label mapping {}: {err}",
                path.display()
            ))
        })?;
        if classes.is_empty() {
            return Err(TrainError::initialization(format!(
                "label mapping {} contains no classes",
                path.display()
            )));
        }
        Ok(Self { classes })
    }

    pub fn class_id(&self, label: &str) -> Option<u32> {
        self.classes.get(label).copied()
    }

    /// Number of classes the classifier head must emit scores for.
    pub fn num_classes(&self) -> usize {
        self.classes
            .values()
            .map(|id| *id as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRecord {
    signal: PathBuf,
    label: String,
}

#[derive(Debug, Clone)]
struct Record {
    path: PathBuf,
    class: u32,
}

/// One fixed-length ECG waveform dataset, resolved against a label mapping at
/// construction so unknown labels fail before any training starts.
#[derive(Debug)]
pub struct EcgDataset {
    records: Vec<Record>,
    signal_len: usize,
}

impl EcgDataset {
    pub fn from_manifest(
        manifest: &Path,
        mapping: &LabelMapping,
        signal_len: usize,
    ) -> Result<Self, TrainError> {
        if signal_len == 0 {
            return Err(TrainError::initialization(
                "signal_len must be greater than zero",
            ));
        }
        let contents = fs::read_to_string(manifest).map_err(|err| {
            TrainError::initialization(format!(
                "failed to read dataset manifest {}: {err}",
                manifest.display()
            ))
        })?;
        let raw: Vec<ManifestRecord> = serde_json::from_str(&contents).map_err(|err| {
            TrainError::initialization(format!(
                "failed to parse dataset manifest {}: {err}",
                manifest.display()
            ))
        })?;
        if raw.is_empty() {
            return Err(TrainError::initialization(format!(
                "dataset manifest {} lists no records",
                manifest.display()
            )));
        }

        let base_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        let mut records = Vec::with_capacity(raw.len());
        for record in raw {
            let class = mapping.class_id(&record.label).ok_or_else(|| {
                TrainError::initialization(format!(
                    "label '{}' in {} is not present in the label mapping",
                    record.label,
                    manifest.display()
                ))
            })?;
            let path = if record.signal.is_relative() {
                base_dir.join(&record.signal)
            } else {
                record.signal
            };
            records.push(Record { path, class });
        }

        Ok(Self {
            records,
            signal_len,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn decode(&self, index: usize) -> Result<Vec<f32>, TrainError> {
        let record = &self.records[index];
        let bytes = fs::read(&record.path).map_err(|err| {
            TrainError::runtime(format!(
                "failed to read signal file {}: {err}",
                record.path.display()
            ))
        })?;
        if bytes.len() % 4 != 0 {
            return Err(TrainError::runtime(format!(
                "signal file {} is not a stream of f32 samples ({} bytes)",
                record.path.display(),
                bytes.len()
            )));
        }
        let mut samples = Vec::with_capacity(self.signal_len);
        for chunk in bytes.chunks_exact(4) {
            samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        // Fixed-length waveform: zero-pad short records, truncate long ones.
        samples.resize(self.signal_len, 0.0);
        Ok(samples)
    }
}

/// One group of examples, assembled on the CPU; the trainer moves the tensors
/// to the configured device.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, 1, signal_len]` f32 waveforms.
    pub signals: Tensor,
    /// `[batch]` u32 class ids.
    pub labels: Tensor,
    /// The same class ids, kept on the host for metric accumulation.
    pub label_ids: Vec<u32>,
}

/// Batch provider over an [`EcgDataset`]. Each call to [`start_pass`] begins
/// one full pass; the train loader reshuffles with a seed derived from the
/// caller's epoch index (so a resumed run does not replay earlier orders),
/// the validation loader preserves manifest order.
///
/// [`start_pass`]: EcgDataLoader::start_pass
pub struct EcgDataLoader {
    dataset: Arc<EcgDataset>,
    batch_size: usize,
    num_workers: usize,
    shuffle: bool,
    seed: u64,
}

impl EcgDataLoader {
    pub fn new(
        dataset: EcgDataset,
        batch_size: usize,
        num_workers: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, TrainError> {
        if batch_size == 0 {
            return Err(TrainError::initialization(
                "batch_size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset: Arc::new(dataset),
            batch_size,
            num_workers,
            shuffle,
            seed,
        })
    }

    /// Batches one pass will produce; the final short batch counts.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Begins one pass; `epoch` seeds the shuffle so the order is a pure
    /// function of `(seed, epoch)`.
    pub fn start_pass(&self, epoch: usize) -> Result<BatchStream, TrainError> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let source = if self.num_workers == 0 {
            ExampleSource::Inline
        } else {
            ExampleSource::workers(
                Arc::clone(&self.dataset),
                &order,
                self.num_workers.min(order.len().max(1)),
                self.batch_size * 2,
            )
        };

        Ok(BatchStream {
            dataset: Arc::clone(&self.dataset),
            order,
            emitted: 0,
            batch_size: self.batch_size,
            source,
        })
    }
}

enum ExampleSource {
    Inline,
    Workers {
        rx: Receiver<(usize, Result<Vec<f32>, TrainError>)>,
        pending: BTreeMap<usize, Vec<f32>>,
        next_pos: usize,
    },
}

impl ExampleSource {
    /// Spawns decode workers over a shared job queue. Results arrive out of
    /// order and are reassembled by position, so the emitted example order is
    /// identical to the inline path. The result channel is bounded so workers
    /// block instead of decoding the whole pass ahead of the consumer; the
    /// in-flight buffer stays O(readahead), not O(dataset).
    fn workers(
        dataset: Arc<EcgDataset>,
        order: &[usize],
        workers: usize,
        readahead: usize,
    ) -> Self {
        let jobs: Arc<Mutex<VecDeque<(usize, usize)>>> =
            Arc::new(Mutex::new(order.iter().copied().enumerate().collect()));
        let (tx, rx) = mpsc::sync_channel(readahead.max(workers));

        for _ in 0..workers {
            let jobs = Arc::clone(&jobs);
            let tx = tx.clone();
            let dataset = Arc::clone(&dataset);
            thread::spawn(move || loop {
                let job = match jobs.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(_) => None,
                };
                let Some((pos, index)) = job else {
                    break;
                };
                // A closed receiver means the pass was dropped early.
                if tx.send((pos, dataset.decode(index))).is_err() {
                    break;
                }
            });
        }

        ExampleSource::Workers {
            rx,
            pending: BTreeMap::new(),
            next_pos: 0,
        }
    }
}

/// One in-flight pass over the dataset.
pub struct BatchStream {
    dataset: Arc<EcgDataset>,
    order: Vec<usize>,
    emitted: usize,
    batch_size: usize,
    source: ExampleSource,
}

impl BatchStream {
    pub fn next_batch(&mut self) -> Result<Option<Batch>, TrainError> {
        let remaining = self.order.len() - self.emitted;
        if remaining == 0 {
            return Ok(None);
        }
        let take = self.batch_size.min(remaining);

        let signal_len = self.dataset.signal_len;
        let mut flat = Vec::with_capacity(take * signal_len);
        let mut label_ids = Vec::with_capacity(take);
        for _ in 0..take {
            let position = self.emitted;
            let index = self.order[position];
            let samples = self.next_example(position, index)?;
            flat.extend_from_slice(&samples);
            label_ids.push(self.dataset.records[index].class);
            self.emitted += 1;
        }

        let signals =
            Tensor::from_vec(flat, (take, 1, signal_len), &Device::Cpu).map_err(|err| {
                TrainError::runtime(format!("failed to materialize signal tensor: {err}"))
            })?;
        let labels = Tensor::from_vec(label_ids.clone(), take, &Device::Cpu).map_err(|err| {
            TrainError::runtime(format!("failed to materialize label tensor: {err}"))
        })?;

        Ok(Some(Batch {
            signals,
            labels,
            label_ids,
        }))
    }

    fn next_example(&mut self, position: usize, index: usize) -> Result<Vec<f32>, TrainError> {
        match &mut self.source {
            ExampleSource::Inline => self.dataset.decode(index),
            ExampleSource::Workers {
                rx,
                pending,
                next_pos,
            } => {
                debug_assert_eq!(position, *next_pos);
                loop {
                    if let Some(samples) = pending.remove(next_pos) {
                        *next_pos += 1;
                        return Ok(samples);
                    }
                    match rx.recv() {
                        Ok((pos, Ok(samples))) => {
                            pending.insert(pos, samples);
                        }
                        Ok((_, Err(err))) => return Err(err),
                        Err(_) => {
                            return Err(TrainError::runtime(
                                "decode workers exited before the pass completed",
                            ))
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_signal(path: &Path, samples: &[f32]) {
        let mut file = fs::File::create(path).unwrap();
        for sample in samples {
            file.write_all(&sample.to_le_bytes()).unwrap();
        }
    }

    fn write_fixture(dir: &Path, lengths: &[usize]) -> (PathBuf, LabelMapping) {
        let mapping_path = dir.join("mapping.json");
        fs::write(&mapping_path, r#"{"NSR": 0, "AF": 1}"#).unwrap();
        let mapping = LabelMapping::from_path(&mapping_path).unwrap();

        let mut entries = Vec::new();
        for (i, len) in lengths.iter().enumerate() {
            let name = format!("{i:03}.f32");
            let samples: Vec<f32> = (0..*len).map(|s| (i * 100 + s) as f32).collect();
            write_signal(&dir.join(&name), &samples);
            let label = if i % 2 == 0 { "NSR" } else { "AF" };
            entries.push(serde_json::json!({ "signal": name, "label": label }));
        }
        let manifest_path = dir.join("manifest.json");
        fs::write(
            &manifest_path,
            serde_json::to_string(&entries).unwrap(),
        )
        .unwrap();
        (manifest_path, mapping)
    }

    #[test]
    fn label_mapping_derives_class_count() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mapping.json");
        fs::write(&path, r#"{"NSR": 0, "AF": 1, "PVC": 4}"#).unwrap();
        let mapping = LabelMapping::from_path(&path).unwrap();
        assert_eq!(mapping.num_classes(), 5);
        assert_eq!(mapping.class_id("AF"), Some(1));
        assert_eq!(mapping.class_id("VT"), None);
    }

    #[test]
    fn unknown_label_fails_construction() {
        let tmp = tempdir().unwrap();
        let mapping_path = tmp.path().join("mapping.json");
        fs::write(&mapping_path, r#"{"NSR": 0}"#).unwrap();
        let mapping = LabelMapping::from_path(&mapping_path).unwrap();
        let manifest = tmp.path().join("manifest.json");
        fs::write(
            &manifest,
            r#"[{"signal": "a.f32", "label": "MYSTERY"}]"#,
        )
        .unwrap();
        assert!(EcgDataset::from_manifest(&manifest, &mapping, 8).is_err());
    }

    #[test]
    fn pads_and_truncates_to_signal_len() {
        let tmp = tempdir().unwrap();
        let (manifest, mapping) = write_fixture(tmp.path(), &[4, 12]);
        let dataset = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        let loader = EcgDataLoader::new(dataset, 2, 0, false, 0).unwrap();
        let mut pass = loader.start_pass(0).unwrap();
        let batch = pass.next_batch().unwrap().unwrap();
        assert_eq!(batch.signals.dims(), &[2, 1, 8]);

        let rows = batch
            .signals
            .reshape((2, 8))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        // Short record zero-padded.
        assert_eq!(rows[0][3], 3.0);
        assert_eq!(rows[0][4], 0.0);
        // Long record truncated.
        assert_eq!(rows[1][7], 107.0);
        assert!(pass.next_batch().unwrap().is_none());
    }

    #[test]
    fn final_short_batch_is_emitted() {
        let tmp = tempdir().unwrap();
        let (manifest, mapping) = write_fixture(tmp.path(), &[8, 8, 8, 8, 8]);
        let dataset = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        let loader = EcgDataLoader::new(dataset, 2, 0, false, 0).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let mut pass = loader.start_pass(0).unwrap();
        let mut sizes = Vec::new();
        while let Some(batch) = pass.next_batch().unwrap() {
            sizes.push(batch.label_ids.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn worker_pool_preserves_example_order() {
        let tmp = tempdir().unwrap();
        let lengths: Vec<usize> = (0..13).map(|_| 8).collect();
        let (manifest, mapping) = write_fixture(tmp.path(), &lengths);

        let collect = |workers: usize| -> Vec<u32> {
            let dataset = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
            let loader = EcgDataLoader::new(dataset, 4, workers, true, 7).unwrap();
            let mut pass = loader.start_pass(0).unwrap();
            let mut labels = Vec::new();
            while let Some(batch) = pass.next_batch().unwrap() {
                labels.extend(batch.label_ids);
            }
            labels
        };

        assert_eq!(collect(0), collect(3));
    }

    #[test]
    fn bounded_worker_queue_yields_every_example() {
        // Far more records than the readahead window, so workers must block
        // on the result channel rather than buffering the whole pass.
        let tmp = tempdir().unwrap();
        let lengths: Vec<usize> = (0..50).map(|_| 8).collect();
        let (manifest, mapping) = write_fixture(tmp.path(), &lengths);

        let dataset = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        let loader = EcgDataLoader::new(dataset, 2, 3, false, 0).unwrap();
        let mut pass = loader.start_pass(0).unwrap();
        let mut labels = Vec::new();
        while let Some(batch) = pass.next_batch().unwrap() {
            labels.extend(batch.label_ids);
        }
        let expected: Vec<u32> = (0..50).map(|i| (i % 2) as u32).collect();
        assert_eq!(labels, expected);
    }

    #[test]
    fn shuffle_is_a_function_of_seed_and_epoch() {
        let tmp = tempdir().unwrap();
        let lengths: Vec<usize> = (0..16).map(|_| 8).collect();
        let (manifest, mapping) = write_fixture(tmp.path(), &lengths);

        let first_batch_signals = |loader: &EcgDataLoader, epoch: usize| -> Vec<f32> {
            let mut pass = loader.start_pass(epoch).unwrap();
            let batch = pass.next_batch().unwrap().unwrap();
            batch.signals.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };

        let dataset_a = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        let dataset_b = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        let a = EcgDataLoader::new(dataset_a, 4, 0, true, 42).unwrap();
        let b = EcgDataLoader::new(dataset_b, 4, 0, true, 42).unwrap();

        // Same seed, same epoch: identical order across loaders, including a
        // fresh loader starting mid-run at epoch 3.
        let a_first = first_batch_signals(&a, 0);
        assert_eq!(a_first, first_batch_signals(&b, 0));
        assert_eq!(
            first_batch_signals(&a, 3),
            first_batch_signals(&b, 3)
        );
        // A later epoch reshuffles.
        assert_ne!(a_first, first_batch_signals(&a, 1));
    }

    #[test]
    fn decode_failure_propagates_mid_pass() {
        let tmp = tempdir().unwrap();
        let (manifest, mapping) = write_fixture(tmp.path(), &[8, 8, 8, 8]);
        let dataset = EcgDataset::from_manifest(&manifest, &mapping, 8).unwrap();
        fs::remove_file(tmp.path().join("002.f32")).unwrap();
        let loader = EcgDataLoader::new(dataset, 2, 0, false, 0).unwrap();
        let mut pass = loader.start_pass(0).unwrap();
        assert!(pass.next_batch().is_ok());
        assert!(pass.next_batch().is_err());
    }
}
