use crate::data::{Batch, Collator, Dataset, TabularExample};
use crate::error::{Result, TrainerError};
use anyhow::Context;
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Iterator over the batches of one epoch
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Restartable, finite source of batches
pub trait BatchSource {
    /// Number of batches per epoch
    fn num_batches(&self) -> usize;

    /// Batches of the given epoch
    fn iter_epoch(&self, epoch: usize) -> BatchIter<'_>;
}

/// Data loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Examples per batch
    pub batch_size: usize,
    /// Reshuffle at the start of every epoch
    pub shuffle: bool,
    /// Collation workers (0 = collate on the calling thread)
    pub num_workers: usize,
    /// Seed for the shuffle order
    pub seed: u64,
    /// Drop a trailing partial batch
    pub drop_last: bool,
}

impl LoaderConfig {
    /// Shuffled loader for the training split
    pub fn train(batch_size: usize, num_workers: usize, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            num_workers,
            seed,
            drop_last: false,
        }
    }

    /// Ordered loader for evaluation and test splits
    pub fn eval(batch_size: usize, num_workers: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            num_workers,
            seed: 0,
            drop_last: false,
        }
    }
}

/// Batches a dataset through a collator
pub struct DataLoader<D, C> {
    dataset: D,
    collator: C,
    config: LoaderConfig,
    pool: Option<ThreadPool>,
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    pub fn new(dataset: D, collator: C, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(TrainerError::config("batch_size must be positive"));
        }
        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("collate-{i}"))
                .build()
                .map_err(|e| TrainerError::config(format!("failed to start data workers: {e}")))?;
            Some(pool)
        } else {
            None
        };

        debug!(
            "Data loader over {} examples: batch_size={}, shuffle={}, workers={}",
            dataset.len(),
            config.batch_size,
            config.shuffle,
            config.num_workers
        );

        Ok(Self {
            dataset,
            collator,
            config,
            pool,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Example order for an epoch
    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }

    fn collate_chunk(&self, chunk: &[usize]) -> Result<Batch> {
        let items = chunk
            .iter()
            .map(|&i| {
                self.dataset
                    .get(i)
                    .ok_or_else(|| TrainerError::data(format!("index {i} out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.collator.collate(items)
    }
}

impl<D, C> BatchSource for DataLoader<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    fn iter_epoch(&self, epoch: usize) -> BatchIter<'_> {
        let mut chunks: Vec<Vec<usize>> = self
            .order(epoch)
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.config.drop_last {
            chunks.retain(|c| c.len() == self.config.batch_size);
        }

        Box::new(EpochIter {
            loader: self,
            chunks: chunks.into(),
            ready: VecDeque::new(),
        })
    }
}

struct EpochIter<'a, D, C> {
    loader: &'a DataLoader<D, C>,
    chunks: VecDeque<Vec<usize>>,
    ready: VecDeque<Result<Batch>>,
}

impl<D, C> Iterator for EpochIter<'_, D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(batch) = self.ready.pop_front() {
            return Some(batch);
        }

        match &self.loader.pool {
            Some(pool) => {
                // Prefetch one batch per worker
                let window = self.loader.config.num_workers.min(self.chunks.len());
                let pending: Vec<Vec<usize>> = self.chunks.drain(..window).collect();
                let loader = self.loader;
                let batches: Vec<Result<Batch>> = pool.install(|| {
                    pending
                        .par_iter()
                        .map(|chunk| loader.collate_chunk(chunk))
                        .collect()
                });
                self.ready.extend(batches);
                self.ready.pop_front()
            }
            None => {
                let chunk = self.chunks.pop_front()?;
                Some(self.loader.collate_chunk(&chunk))
            }
        }
    }
}

/// Supported tabular file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(anyhow::anyhow!("Cannot determine format of gzipped file"))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(anyhow::anyhow!("Unsupported file format")),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Load labelled feature rows from a delimited file
///
/// Every column except `label_column` is read as a float feature. Rows with
/// unparsable values are skipped with a warning.
pub fn load_tabular<P: AsRef<Path>>(path: P, label_column: &str) -> anyhow::Result<Vec<TabularExample>> {
    let path = path.as_ref();
    info!("Loading data from {:?}", path);

    let format = FileFormat::from_path(path)?;
    debug!("Detected file format: {:?}", format);

    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let examples = if format.is_gzipped() {
        parse_tabular(BufReader::new(GzDecoder::new(file)), format, label_column)?
    } else {
        parse_tabular(BufReader::new(file), format, label_column)?
    };

    info!("Loaded {} examples", examples.len());
    Ok(examples)
}

fn parse_tabular<R: Read>(
    reader: R,
    format: FileFormat,
    label_column: &str,
) -> anyhow::Result<Vec<TabularExample>> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
    let label_idx = headers
        .iter()
        .position(|h| h == label_column)
        .with_context(|| format!("Missing label column: {label_column}"))?;

    let mut examples = Vec::new();
    for (line, result) in csv_reader.records().enumerate() {
        let record = result.context("Failed to parse CSV record")?;

        let label = record.get(label_idx).and_then(|s| s.trim().parse::<i64>().ok());
        let features: Option<Vec<f32>> = record
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != label_idx)
            .map(|(_, s)| s.trim().parse::<f32>().ok().filter(|v| v.is_finite()))
            .collect();

        match (features, label) {
            (Some(features), Some(label)) => examples.push(TabularExample::new(features, label)),
            _ => warn!("Skipping malformed record at line {}", line + 2),
        }
    }

    Ok(examples)
}
