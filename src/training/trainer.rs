//! Training loop for the regression head
//!
//! Provides a high-level API for training with:
//! - Gradient accumulation
//! - Gradient clipping
//! - Learning rate scheduling
//! - Periodic evaluation and checkpointing
//! - Progress tracking

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::checkpoint::{self, HeadCheckpointConfig};
use super::dataset::{Batched, RegressionDataset};
use super::evaluation::{evaluate_model, EvaluationResult};
use super::lora::LoraConfig;
use super::models::{Backbone, RegressionModel, RegressionModelConfig, TokenizerWrapper};
use super::optimizer::{AdamW, AdamWConfig, GradientAccumulator, LearningRateScheduler};
use super::precision::PrecisionMode;

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// HuggingFace model ID or local path of the backbone
    pub base_model: String,
    /// Backbone precision, picked from the device when unset
    pub precision: Option<PrecisionMode>,
    /// Trainable layers: pooling, loss, adapter
    pub model: RegressionModelConfig,
    /// Batch size for training
    pub batch_size: usize,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Warmup steps (fraction of total)
    pub warmup_ratio: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Maximum gradient norm for clipping (0 to disable)
    pub max_grad_norm: f64,
    /// Save checkpoint every N steps (0 to disable)
    pub save_steps: usize,
    /// Evaluation steps (0 to disable)
    pub eval_steps: usize,
    /// Logging steps
    pub logging_steps: usize,
    /// Output directory for checkpoints
    pub output_dir: String,
    /// Maximum sequence length
    pub max_seq_length: usize,
    /// Fraction of the data held out for validation
    pub validation_split: f64,
    /// Seed for shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_model: "Qwen/Qwen2.5-0.5B".to_string(),
            precision: None,
            model: RegressionModelConfig::default().with_lora(Some(LoraConfig::default())),
            batch_size: 8,
            num_epochs: 3,
            learning_rate: 1e-4,
            warmup_ratio: 0.1,
            weight_decay: 0.01,
            gradient_accumulation_steps: 1,
            max_grad_norm: 1.0,
            save_steps: 500,
            eval_steps: 500,
            logging_steps: 10,
            output_dir: "./output".to_string(),
            max_seq_length: 512,
            validation_split: 0.1,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Load a configuration from JSON; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read training config: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse training config")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.num_epochs > 0, "num_epochs must be positive");
        anyhow::ensure!(
            self.gradient_accumulation_steps > 0,
            "gradient_accumulation_steps must be positive"
        );
        anyhow::ensure!(
            self.learning_rate > 0.0 && self.learning_rate.is_finite(),
            "learning_rate must be positive"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.warmup_ratio),
            "warmup_ratio must be in [0, 1)"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.validation_split),
            "validation_split must be in [0, 1)"
        );
        self.model.validate()
    }

    /// Sidecar written next to checkpoints
    pub fn checkpoint_config(&self, precision: PrecisionMode, global_step: usize) -> HeadCheckpointConfig {
        HeadCheckpointConfig {
            base_model: self.base_model.clone(),
            precision,
            model: self.model.clone(),
            max_seq_length: self.max_seq_length,
            global_step,
        }
    }
}

/// Training metrics
#[derive(Debug, Clone, Default)]
pub struct TrainingMetrics {
    /// Most recent micro-batch loss
    pub train_loss: f64,
    /// Number of optimization steps
    pub global_step: usize,
    /// Current epoch
    pub epoch: usize,
    /// Samples per second
    pub samples_per_second: f64,
    /// Current learning rate
    pub learning_rate: f64,
    /// Gradient norm before clipping at the last step
    pub grad_norm: f64,
}

impl std::fmt::Display for TrainingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} | Epoch {} | Loss: {:.4} | LR: {:.2e} | Grad norm: {:.3} | {:.1} samples/s",
            self.global_step,
            self.epoch,
            self.train_loss,
            self.learning_rate,
            self.grad_norm,
            self.samples_per_second
        )
    }
}

/// Training result
#[derive(Debug)]
pub struct TrainingResult {
    /// Final metrics
    pub metrics: TrainingMetrics,
    /// Path to final checkpoint
    pub checkpoint_path: Option<PathBuf>,
    /// Training history (loss per micro-batch)
    pub history: Vec<f64>,
    /// Evaluations as (global_step, result)
    pub evaluations: Vec<(usize, EvaluationResult)>,
}

impl TrainingResult {
    /// Most recent evaluation, if any
    pub fn final_evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluations.last().map(|(_, result)| result)
    }
}

/// Number of micro-batches in the accumulation window holding `batch_idx`
///
/// Windows restart every epoch; the last one is shorter when the epoch does
/// not divide evenly.
fn accumulation_window(batch_idx: usize, batches_per_epoch: usize, accumulation: usize) -> usize {
    let window_start = batch_idx - batch_idx % accumulation;
    accumulation.min(batches_per_epoch.saturating_sub(window_start)).max(1)
}

/// Progress callback for training
pub type ProgressCallback = Box<dyn Fn(&TrainingMetrics) + Send>;

/// Trainer for the regression head
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    precision: PrecisionMode,
    var_map: VarMap,
}

impl Trainer {
    /// Create a new trainer
    pub fn new(config: TrainingConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let precision = PrecisionMode::for_device(config.precision, &device);
        Ok(Self {
            config,
            device,
            precision,
            var_map: VarMap::new(),
        })
    }

    /// Get the device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Backbone precision resolved for the device
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    /// Get the config
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Get the var_map holding the trainable parameters
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Build the regression model on top of `backbone`, registering its
    /// trainable parameters with this trainer
    pub fn build_model(&self, backbone: Box<dyn Backbone>) -> Result<RegressionModel> {
        RegressionModel::new(backbone, self.config.model.clone(), &self.var_map)
    }

    /// Create optimizer
    pub fn create_optimizer(&self) -> Result<AdamW> {
        let config = AdamWConfig {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        AdamW::new(&self.var_map, config)
    }

    /// Create learning rate scheduler
    pub fn create_scheduler(&self, total_steps: usize) -> LearningRateScheduler {
        let warmup_steps = (total_steps as f64 * self.config.warmup_ratio) as usize;
        LearningRateScheduler::new(self.config.learning_rate, warmup_steps, total_steps)
    }

    /// Number of optimization steps for a dataset of `num_examples`
    pub fn total_steps(&self, num_examples: usize) -> usize {
        let batches_per_epoch = num_examples.div_ceil(self.config.batch_size);
        batches_per_epoch.div_ceil(self.config.gradient_accumulation_steps) * self.config.num_epochs
    }

    /// Save a checkpoint directory
    pub fn save_checkpoint(&self, path: impl AsRef<Path>, step: usize) -> Result<PathBuf> {
        checkpoint::save_checkpoint(&self.var_map, &self.config.checkpoint_config(self.precision, step), path)
    }

    /// Train the model on the dataset
    pub fn train(
        &mut self,
        model: &RegressionModel,
        tokenizer: &TokenizerWrapper,
        dataset: &RegressionDataset,
        eval_dataset: Option<&RegressionDataset>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<TrainingResult> {
        if dataset.is_empty() {
            return Err(anyhow!("Training dataset is empty"));
        }

        let accumulation = self.config.gradient_accumulation_steps;
        let batches_per_epoch = dataset.num_batches(self.config.batch_size);
        let total_steps = self.total_steps(dataset.len());

        tracing::info!("Starting training:");
        tracing::info!("  Dataset size: {}", dataset.len());
        tracing::info!("  Batch size: {}", self.config.batch_size);
        tracing::info!("  Gradient accumulation steps: {}", accumulation);
        tracing::info!("  Effective batch size: {}", self.config.batch_size * accumulation);
        tracing::info!("  Epochs: {}", self.config.num_epochs);
        tracing::info!("  Total optimization steps: {}", total_steps);
        tracing::info!("  Learning rate: {}", self.config.learning_rate);
        tracing::info!("  Loss: {}", self.config.model.loss);
        tracing::info!("  Trainable parameters: {}", model.num_trainable_params());

        let mut optimizer = self.create_optimizer()?;
        let mut scheduler = self.create_scheduler(total_steps);
        optimizer.set_learning_rate(scheduler.get_lr());

        let max_grad_norm = (self.config.max_grad_norm > 0.0).then_some(self.config.max_grad_norm);
        let mut accumulator = GradientAccumulator::new();
        let mut metrics = TrainingMetrics::default();
        let mut history = Vec::new();
        let mut evaluations = Vec::new();
        let mut step_samples = 0;
        let mut step_start = Instant::now();

        std::fs::create_dir_all(&self.config.output_dir)?;

        for epoch in 0..self.config.num_epochs {
            metrics.epoch = epoch + 1;
            let epoch_start = Instant::now();
            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0;

            for (batch_idx, batch) in dataset.batches(self.config.batch_size).enumerate() {
                let labels = batch.labels()?;
                let (input_ids, attention_mask) = tokenizer.encode_to_tensors(&batch.texts(), &self.device)?;
                let labels = Tensor::new(labels.as_slice(), &self.device)?;

                let output = model.forward(&input_ids, &attention_mask, Some(&labels), true)?;
                let loss = output
                    .loss
                    .ok_or_else(|| anyhow!("Model returned no loss for a labeled batch"))?;
                let loss_value = loss.to_scalar::<f32>()? as f64;

                // mean over the micro-batches of this optimization step
                let window = accumulation_window(batch_idx, batches_per_epoch, accumulation);
                let grads = (&loss / window as f64)?.backward()?;
                accumulator.add(grads, optimizer.vars())?;

                history.push(loss_value);
                epoch_loss += loss_value;
                epoch_batches += 1;
                step_samples += batch.len();
                metrics.train_loss = loss_value;

                let last_in_epoch = batch_idx + 1 == batches_per_epoch;
                if accumulator.micro_batches() < accumulation && !last_in_epoch {
                    continue;
                }

                let Some(mut grads) = accumulator.take() else {
                    continue;
                };
                metrics.grad_norm = optimizer.step_with_clipping(&mut grads, max_grad_norm)?;
                if let Some(max_norm) = max_grad_norm {
                    if metrics.grad_norm > max_norm {
                        tracing::debug!(
                            "Step {}: gradient norm {:.4} clipped to {:.4}",
                            metrics.global_step + 1,
                            metrics.grad_norm,
                            max_norm
                        );
                    }
                }

                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
                metrics.global_step += 1;
                metrics.learning_rate = lr;
                metrics.samples_per_second = step_samples as f64 / step_start.elapsed().as_secs_f64().max(1e-9);
                step_samples = 0;
                step_start = Instant::now();

                if self.config.logging_steps > 0 && metrics.global_step % self.config.logging_steps == 0 {
                    tracing::info!("{}", metrics);
                    let _ = std::io::stderr().flush();
                    if let Some(ref callback) = progress_callback {
                        callback(&metrics);
                    }
                }

                if self.config.eval_steps > 0 && metrics.global_step % self.config.eval_steps == 0 {
                    if let Some(eval_ds) = eval_dataset {
                        let result = self.evaluate(model, tokenizer, eval_ds)?;
                        tracing::info!("Evaluation loss: {:.4} | {}", result.loss, result.metrics);
                        evaluations.push((metrics.global_step, result));
                    }
                }

                if self.config.save_steps > 0 && metrics.global_step % self.config.save_steps == 0 {
                    let path = Path::new(&self.config.output_dir)
                        .join(format!("checkpoint-{}", metrics.global_step));
                    self.save_checkpoint(path, metrics.global_step)?;
                }
            }

            let avg_epoch_loss = if epoch_batches > 0 {
                epoch_loss / epoch_batches as f64
            } else {
                0.0
            };
            tracing::info!(
                "Epoch {} completed in {:.1}s | Avg loss: {:.4}",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64(),
                avg_epoch_loss
            );
            let _ = std::io::stderr().flush();
        }

        if let Some(eval_ds) = eval_dataset {
            let already_evaluated = evaluations
                .last()
                .is_some_and(|(step, _)| *step == metrics.global_step);
            if !already_evaluated {
                let result = self.evaluate(model, tokenizer, eval_ds)?;
                tracing::info!("Final evaluation loss: {:.4} | {}", result.loss, result.metrics);
                evaluations.push((metrics.global_step, result));
            }
        }

        let final_path = Path::new(&self.config.output_dir).join("final");
        let checkpoint_path = Some(self.save_checkpoint(&final_path, metrics.global_step)?);

        Ok(TrainingResult {
            metrics,
            checkpoint_path,
            history,
            evaluations,
        })
    }

    /// Evaluate on a labeled dataset
    pub fn evaluate(
        &self,
        model: &RegressionModel,
        tokenizer: &TokenizerWrapper,
        dataset: &RegressionDataset,
    ) -> Result<EvaluationResult> {
        evaluate_model(model, tokenizer, dataset, self.config.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::checkpoint::{CONFIG_FILE, WEIGHTS_FILE};
    use crate::training::dataset::{DatasetConfig, RegressionExample};
    use crate::training::loss::RegressionLoss;
    use crate::training::models::testing::{word_level_tokenizer, EmbeddingBackbone, VOCAB_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sentiment_dataset() -> RegressionDataset {
        let examples = vec![
            RegressionExample::new("the movie was great", Some(0.9)),
            RegressionExample::new("the plot was awful", Some(0.1)),
            RegressionExample::new("very good acting", Some(0.8)),
            RegressionExample::new("not good", Some(0.3)),
            RegressionExample::new("the ending was okay", Some(0.5)),
            RegressionExample::new("bad movie", Some(0.2)),
        ];
        let config = DatasetConfig {
            shuffle: false,
            ..Default::default()
        };
        RegressionDataset::new(examples, config).unwrap()
    }

    fn test_config(output_dir: &Path) -> TrainingConfig {
        TrainingConfig {
            base_model: "test-backbone".to_string(),
            model: RegressionModelConfig::default().with_loss(RegressionLoss::Mse),
            batch_size: 2,
            num_epochs: 2,
            learning_rate: 1e-2,
            warmup_ratio: 0.0,
            gradient_accumulation_steps: 2,
            save_steps: 0,
            eval_steps: 0,
            logging_steps: 1,
            output_dir: output_dir.to_string_lossy().to_string(),
            max_seq_length: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_training_config_default() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.num_epochs, 3);
        assert!((config.learning_rate - 1e-4).abs() < 1e-12);
        assert!(config.model.lora.is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_training_config_partial_json() {
        let config: TrainingConfig = serde_json::from_str(
            r#"{"batch_size": 4, "model": {"pooling": "mean", "loss": {"kind": "mae"}}}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.model.loss, RegressionLoss::Mae);
        assert_eq!(config.num_epochs, 3);
        assert!(config.model.lora.is_none());
    }

    #[test]
    fn test_invalid_training_config() {
        let config = TrainingConfig {
            gradient_accumulation_steps: 0,
            ..Default::default()
        };
        assert!(Trainer::new(config, Device::Cpu).is_err());
    }

    #[test]
    fn test_total_steps() {
        let dir = tempdir().unwrap();
        let trainer = Trainer::new(test_config(dir.path()), Device::Cpu).unwrap();
        // 6 examples / batch 2 = 3 batches, 2 steps per epoch with accumulation 2
        assert_eq!(trainer.total_steps(6), 4);
    }

    #[test]
    fn test_accumulation_window() {
        // 3 batches, accumulation 2: the epoch tail is a single batch
        assert_eq!(accumulation_window(0, 3, 2), 2);
        assert_eq!(accumulation_window(1, 3, 2), 2);
        assert_eq!(accumulation_window(2, 3, 2), 1);

        assert_eq!(accumulation_window(4, 5, 4), 1);
        assert_eq!(accumulation_window(3, 8, 4), 4);
        assert_eq!(accumulation_window(5, 6, 1), 1);
        // accumulation larger than the epoch
        assert_eq!(accumulation_window(1, 3, 8), 3);
    }

    #[test]
    fn test_precision_resolved_from_device() {
        let dir = tempdir().unwrap();
        let trainer = Trainer::new(test_config(dir.path()), Device::Cpu).unwrap();
        assert_eq!(trainer.config().precision, None);
        assert_eq!(trainer.precision(), PrecisionMode::F16);

        let requested = TrainingConfig {
            precision: Some(PrecisionMode::Bf16),
            ..test_config(dir.path())
        };
        let trainer = Trainer::new(requested, Device::Cpu).unwrap();
        assert_eq!(trainer.precision(), PrecisionMode::F16);
    }

    #[test]
    fn test_training_metrics_display() {
        let metrics = TrainingMetrics {
            train_loss: 0.5,
            global_step: 100,
            epoch: 1,
            samples_per_second: 32.5,
            learning_rate: 5e-5,
            grad_norm: 0.25,
        };

        let display = format!("{}", metrics);
        assert!(display.contains("Step 100"));
        assert!(display.contains("Epoch 1"));
    }

    #[test]
    fn test_train_loop_steps_and_checkpoint() {
        let dir = tempdir().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path()), Device::Cpu).unwrap();
        let tokenizer = word_level_tokenizer(16);
        let model = trainer
            .build_model(Box::new(EmbeddingBackbone::new(VOCAB_SIZE, 8).unwrap()))
            .unwrap();
        let dataset = sentiment_dataset();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: ProgressCallback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = trainer
            .train(&model, &tokenizer, &dataset, Some(&dataset), Some(callback))
            .unwrap();

        assert_eq!(result.history.len(), 6);
        assert_eq!(result.metrics.global_step, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(result.history.iter().all(|l| l.is_finite()));

        let evaluation = result.final_evaluation().unwrap();
        assert_eq!(evaluation.metrics.count, 6);

        let final_dir = result.checkpoint_path.unwrap();
        assert!(final_dir.join(WEIGHTS_FILE).exists());
        let saved = HeadCheckpointConfig::from_file(final_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(saved.global_step, 4);
        assert_eq!(saved.precision, PrecisionMode::F16);
        assert_eq!(saved.model, trainer.config().model);
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = tempdir().unwrap();
        let config = TrainingConfig {
            num_epochs: 40,
            gradient_accumulation_steps: 1,
            batch_size: 6,
            logging_steps: 0,
            ..test_config(dir.path())
        };
        let mut trainer = Trainer::new(config, Device::Cpu).unwrap();
        let tokenizer = word_level_tokenizer(16);
        let model = trainer
            .build_model(Box::new(EmbeddingBackbone::new(VOCAB_SIZE, 8).unwrap()))
            .unwrap();
        let dataset = sentiment_dataset();

        let before = trainer.evaluate(&model, &tokenizer, &dataset).unwrap();
        trainer.train(&model, &tokenizer, &dataset, None, None).unwrap();
        let after = trainer.evaluate(&model, &tokenizer, &dataset).unwrap();

        assert!(
            after.loss < before.loss,
            "loss went from {} to {}",
            before.loss,
            after.loss
        );
    }

    #[test]
    fn test_unlabeled_dataset_fails() {
        let dir = tempdir().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path()), Device::Cpu).unwrap();
        let tokenizer = word_level_tokenizer(16);
        let model = trainer
            .build_model(Box::new(EmbeddingBackbone::new(VOCAB_SIZE, 8).unwrap()))
            .unwrap();
        let dataset = RegressionDataset::new(
            vec![RegressionExample::new("good movie", None)],
            DatasetConfig::for_prediction(),
        )
        .unwrap();

        assert!(trainer.train(&model, &tokenizer, &dataset, None, None).is_err());
    }
}
