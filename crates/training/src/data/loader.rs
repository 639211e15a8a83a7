use std::{
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::config::TrainingError;

use super::{
    sample::{Sample, SampleLoader},
    Result,
};

/// Collated batch on the compute device.
#[derive(Debug)]
pub struct ImageBatch {
    /// `(batch, 3, height, width)` f32.
    pub images: Tensor,
    pub emotion_labels: Tensor,
    pub indices: Tensor,
    pub sensitive_labels: Tensor,
    pub size: usize,
    pub batch_index: usize,
    pub epoch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
    pub prefetch_factor: usize,
    pub seed: u64,
}

/// Groups loader output into batches, optionally in parallel.
pub struct BatchProvider {
    loader: Arc<SampleLoader>,
    options: BatchOptions,
    device: Device,
}

impl BatchProvider {
    pub fn new(loader: SampleLoader, options: BatchOptions, device: Device) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            loader: Arc::new(loader),
            options: BatchOptions {
                prefetch_factor: options.prefetch_factor.max(1),
                ..options
            },
            device,
        })
    }

    pub fn sample_loader(&self) -> &SampleLoader {
        &self.loader
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    /// Number of samples visited per epoch.
    pub fn len(&self) -> usize {
        self.loader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loader.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.options.batch_size)
    }

    /// Sample visiting order for `epoch`; a permutation of `0..len`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let chunks: Vec<Vec<usize>> = self
            .epoch_order(epoch)
            .chunks(self.options.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let total = chunks.len();
        let seed = self.options.seed;

        let source = if self.options.num_workers == 0 {
            Source::Inline {
                loader: Arc::clone(&self.loader),
                chunks,
            }
        } else {
            let workers = self.options.num_workers.min(total.max(1));
            let chunks = Arc::new(chunks);
            let mut receivers = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);

            for worker in 0..workers {
                let (sender, receiver) = sync_channel(self.options.prefetch_factor);
                let loader = Arc::clone(&self.loader);
                let chunks = Arc::clone(&chunks);
                handles.push(thread::spawn(move || {
                    for batch_index in (worker..chunks.len()).step_by(workers) {
                        let result =
                            load_samples(&loader, &chunks[batch_index], seed, epoch, batch_index);
                        let failed = result.is_err();
                        if sender.send(result).is_err() || failed {
                            break;
                        }
                    }
                }));
                receivers.push(receiver);
            }

            Source::Workers { receivers, handles }
        };

        EpochBatches {
            source,
            device: self.device.clone(),
            seed,
            epoch,
            next: 0,
            total,
        }
    }
}

enum Source {
    Inline {
        loader: Arc<SampleLoader>,
        chunks: Vec<Vec<usize>>,
    },
    Workers {
        receivers: Vec<Receiver<Result<Vec<Sample>>>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Batches of one epoch, in deterministic order.
pub struct EpochBatches {
    source: Source,
    device: Device,
    seed: u64,
    epoch: usize,
    next: usize,
    total: usize,
}

impl EpochBatches {
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn num_batches(&self) -> usize {
        self.total
    }

    fn next_samples(&mut self, batch_index: usize) -> Result<Vec<Sample>> {
        match &self.source {
            Source::Inline { loader, chunks } => {
                load_samples(loader, &chunks[batch_index], self.seed, self.epoch, batch_index)
            }
            Source::Workers { receivers, .. } => receivers[batch_index % receivers.len()]
                .recv()
                .map_err(|_| {
                    TrainingError::runtime(format!(
                        "data worker exited before producing batch {}",
                        batch_index
                    ))
                })?,
        }
    }
}

impl Iterator for EpochBatches {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let batch_index = self.next;
        self.next += 1;

        let batch = self
            .next_samples(batch_index)
            .and_then(|samples| collate(&samples, &self.device, batch_index, self.epoch));
        if batch.is_err() {
            self.next = self.total;
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let Source::Workers { receivers, handles } = &mut self.source {
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Augmentation seed for one batch, independent of which worker loads it.
pub fn batch_seed(seed: u64, epoch: usize, batch_index: usize) -> u64 {
    seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (batch_index as u64 + 1).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

fn load_samples(
    loader: &SampleLoader,
    indices: &[usize],
    seed: u64,
    epoch: usize,
    batch_index: usize,
) -> Result<Vec<Sample>> {
    let mut rng = StdRng::seed_from_u64(batch_seed(seed, epoch, batch_index));
    indices
        .iter()
        .map(|&index| loader.load(index, &mut rng))
        .collect()
}

pub fn collate(
    samples: &[Sample],
    device: &Device,
    batch_index: usize,
    epoch: usize,
) -> Result<ImageBatch> {
    let first = samples
        .first()
        .ok_or_else(|| TrainingError::runtime("cannot collate an empty batch"))?;
    let (channels, height, width) = first.image.shape();

    let mut pixels = Vec::with_capacity(samples.len() * channels * height * width);
    let mut emotion_labels = Vec::with_capacity(samples.len());
    let mut indices = Vec::with_capacity(samples.len());
    let mut sensitive_labels = Vec::with_capacity(samples.len());

    for sample in samples {
        if sample.image.shape() != (channels, height, width) {
            return Err(TrainingError::runtime(format!(
                "sample {} has shape {:?}, expected {:?}",
                sample.index,
                sample.image.shape(),
                (channels, height, width)
            )));
        }
        pixels.extend_from_slice(&sample.image.data);
        emotion_labels.push(sample.emotion_label);
        indices.push(sample.index as u32);
        sensitive_labels.push(sample.sensitive_label);
    }

    let size = samples.len();
    let images = Tensor::from_vec(pixels, (size, channels, height, width), device)
        .map_err(to_runtime_error)?;
    let emotion_labels = Tensor::from_vec(emotion_labels, size, device).map_err(to_runtime_error)?;
    let indices = Tensor::from_vec(indices, size, device).map_err(to_runtime_error)?;
    let sensitive_labels =
        Tensor::from_vec(sensitive_labels, size, device).map_err(to_runtime_error)?;

    Ok(ImageBatch {
        images,
        emotion_labels,
        indices,
        sensitive_labels,
        size,
        batch_index,
        epoch,
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
