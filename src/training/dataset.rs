//! Dataset loading and batching for regression training
//!
//! Supports loading text/label pairs from JSONL and CSV formats.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A single example: input text and an optional target in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionExample {
    /// Input text
    pub text: String,
    /// Target value (absent for prediction-only data)
    #[serde(default, alias = "labels", alias = "score")]
    pub label: Option<f32>,
    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RegressionExample {
    pub fn new(text: impl Into<String>, label: Option<f32>) -> Self {
        Self {
            text: text.into(),
            label,
            metadata: None,
        }
    }
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Whether to shuffle the dataset after loading
    pub shuffle: bool,
    /// Random seed for shuffling
    pub seed: Option<u64>,
    /// Every example must carry a label in [0, 1]
    pub require_labels: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            seed: Some(42),
            require_labels: true,
        }
    }
}

impl DatasetConfig {
    /// Configuration for unlabeled prediction input: keeps file order
    pub fn for_prediction() -> Self {
        Self {
            shuffle: false,
            seed: None,
            require_labels: false,
        }
    }
}

/// Check one example against the configuration
fn check_example(example: &RegressionExample, position: usize, config: &DatasetConfig) -> Result<()> {
    match example.label {
        Some(label) if !label.is_finite() || !(0.0..=1.0).contains(&label) => bail!(
            "Label {} at record {} is outside [0, 1]; the head predicts bounded values",
            label,
            position
        ),
        None if config.require_labels => bail!("Missing label at record {}", position),
        _ => Ok(()),
    }
}

/// Regression dataset
#[derive(Debug, Clone)]
pub struct RegressionDataset {
    examples: Vec<RegressionExample>,
    config: DatasetConfig,
}

impl RegressionDataset {
    /// Create a new dataset from examples
    pub fn new(examples: Vec<RegressionExample>, config: DatasetConfig) -> Result<Self> {
        for (i, example) in examples.iter().enumerate() {
            check_example(example, i + 1, &config)?;
        }
        Ok(Self { examples, config })
    }

    /// Load dataset from a JSONL file
    ///
    /// Expected format (one JSON object per line):
    /// ```json
    /// {"text": "...", "label": 0.42}
    /// ```
    pub fn from_jsonl(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset file: {:?}", path))?;
        let reader = BufReader::new(file);

        let mut examples = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;

            if line.trim().is_empty() {
                continue;
            }

            let example: RegressionExample = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSON at line {}", line_num + 1))?;
            check_example(&example, line_num + 1, &config)?;

            examples.push(example);
        }

        tracing::info!("Loaded {} examples from {:?}", examples.len(), path);
        Ok(Self::loaded(examples, config))
    }

    /// Load dataset from a CSV file
    ///
    /// Expected columns: text, label (optional unless labels are required)
    pub fn from_csv(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {:?}", path))?;

        let headers = reader.headers()?.clone();
        let text_idx = headers
            .iter()
            .position(|h| h == "text")
            .ok_or_else(|| anyhow!("CSV must have 'text' column"))?;
        let label_idx = headers
            .iter()
            .position(|h| h == "label" || h == "labels" || h == "score");

        let mut examples = Vec::new();
        for (row_num, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read CSV row {}", row_num + 1))?;

            let text = record
                .get(text_idx)
                .ok_or_else(|| anyhow!("Missing text at row {}", row_num + 1))?
                .to_string();

            let label = match label_idx.and_then(|idx| record.get(idx)).map(str::trim) {
                Some(value) if !value.is_empty() => Some(
                    value
                        .parse::<f32>()
                        .with_context(|| format!("Invalid label {:?} at row {}", value, row_num + 1))?,
                ),
                _ => None,
            };

            let example = RegressionExample::new(text, label);
            check_example(&example, row_num + 1, &config)?;
            examples.push(example);
        }

        tracing::info!("Loaded {} examples from {:?}", examples.len(), path);
        Ok(Self::loaded(examples, config))
    }

    /// Load dataset from file, auto-detecting format
    pub fn load(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match extension.to_lowercase().as_str() {
            "jsonl" | "json" => Self::from_jsonl(path, config),
            "csv" => Self::from_csv(path, config),
            _ => Self::from_jsonl(path, config.clone()).or_else(|_| Self::from_csv(path, config)),
        }
    }

    fn loaded(examples: Vec<RegressionExample>, config: DatasetConfig) -> Self {
        let mut dataset = Self { examples, config };
        if dataset.config.shuffle {
            dataset.shuffle();
        }
        dataset
    }

    /// Get the number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get an example by index
    pub fn get(&self, index: usize) -> Option<&RegressionExample> {
        self.examples.get(index)
    }

    /// Iterate over examples
    pub fn iter(&self) -> impl Iterator<Item = &RegressionExample> {
        self.examples.iter()
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Shuffle the dataset
    pub fn shuffle(&mut self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = if let Some(seed) = self.config.seed {
            rand::rngs::StdRng::seed_from_u64(seed)
        } else {
            rand::rngs::StdRng::from_entropy()
        };

        self.examples.shuffle(&mut rng);
    }

    /// Split into train/validation datasets, keeping the current order
    pub fn split(&self, train_ratio: f64) -> (RegressionDataset, RegressionDataset) {
        let ratio = train_ratio.clamp(0.0, 1.0);
        let split_idx = (self.examples.len() as f64 * ratio) as usize;

        let part = |examples: &[RegressionExample]| RegressionDataset {
            examples: examples.to_vec(),
            config: DatasetConfig {
                shuffle: false,
                ..self.config.clone()
            },
        };
        (part(&self.examples[..split_idx]), part(&self.examples[split_idx..]))
    }

    /// Get statistics about the dataset
    pub fn stats(&self) -> DatasetStats {
        let total = self.examples.len();
        let labels: Vec<f32> = self.examples.iter().filter_map(|e| e.label).collect();

        let avg_text_length = if total > 0 {
            self.examples.iter().map(|e| e.text.len()).sum::<usize>() as f64 / total as f64
        } else {
            0.0
        };

        let (label_mean, label_std, label_min, label_max) = if labels.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let n = labels.len() as f64;
            let mean = labels.iter().map(|&l| l as f64).sum::<f64>() / n;
            let var = labels.iter().map(|&l| (l as f64 - mean).powi(2)).sum::<f64>() / n;
            let min = labels.iter().copied().fold(f32::INFINITY, f32::min) as f64;
            let max = labels.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
            (mean, var.sqrt(), min, max)
        };

        DatasetStats {
            total_examples: total,
            labeled_examples: labels.len(),
            avg_text_length,
            label_mean,
            label_std,
            label_min,
            label_max,
        }
    }
}

/// Dataset statistics
#[derive(Debug, Clone)]
pub struct DatasetStats {
    /// Total number of examples
    pub total_examples: usize,
    /// Examples carrying a label
    pub labeled_examples: usize,
    /// Average text length in characters
    pub avg_text_length: f64,
    pub label_mean: f64,
    pub label_std: f64,
    pub label_min: f64,
    pub label_max: f64,
}

impl std::fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dataset: {} examples ({} labeled), {:.1} avg text chars, label mean {:.3} std {:.3} range [{:.3}, {:.3}]",
            self.total_examples,
            self.labeled_examples,
            self.avg_text_length,
            self.label_mean,
            self.label_std,
            self.label_min,
            self.label_max
        )
    }
}

/// A batch of examples, split into model inputs and targets
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    pub examples: Vec<&'a RegressionExample>,
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Texts in batch order
    pub fn texts(&self) -> Vec<String> {
        self.examples.iter().map(|e| e.text.clone()).collect()
    }

    /// Labels in batch order; fails if any example is unlabeled
    pub fn labels(&self) -> Result<Vec<f32>> {
        self.examples
            .iter()
            .map(|e| {
                e.label
                    .ok_or_else(|| anyhow!("Example without label in a training batch"))
            })
            .collect()
    }
}

/// Batch iterator for training
pub struct BatchIterator<'a> {
    dataset: &'a RegressionDataset,
    batch_size: usize,
    current_idx: usize,
}

impl<'a> BatchIterator<'a> {
    /// Create a new batch iterator
    pub fn new(dataset: &'a RegressionDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
        }
    }
}

impl<'a> Iterator for BatchIterator<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.dataset.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.dataset.len());
        let examples: Vec<_> = (self.current_idx..end_idx)
            .filter_map(|i| self.dataset.get(i))
            .collect();

        self.current_idx = end_idx;

        if examples.is_empty() {
            None
        } else {
            Some(Batch { examples })
        }
    }
}

/// Extension trait for creating batches
pub trait Batched {
    fn batches(&self, batch_size: usize) -> BatchIterator<'_>;

    fn num_batches(&self, batch_size: usize) -> usize;
}

impl Batched for RegressionDataset {
    fn batches(&self, batch_size: usize) -> BatchIterator<'_> {
        BatchIterator::new(self, batch_size)
    }

    fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }
}
