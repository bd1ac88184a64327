//! Command-line interface
//!
//! Provides CLI commands for train, predict and devices.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::training::checkpoint::load_for_inference;
use crate::training::dataset::{DatasetConfig, RegressionDataset, RegressionExample};
use crate::training::device::{available_devices, select_device, DevicePreference};
use crate::training::evaluation::{predict_dataset, RegressionMetrics};
use crate::training::hub::ModelLoader;
use crate::training::lora::LoraConfig;
use crate::training::loss::RegressionLoss;
use crate::training::models::{DecoderBackbone, PoolingStrategy, TokenizerWrapper};
use crate::training::precision::PrecisionMode;
use crate::training::trainer::{Trainer, TrainingConfig};

/// Arguments of the `train` command
///
/// Options left unset keep the value from `--config` (or the default).
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// Training data path (JSONL or CSV with text and label)
    #[arg(short, long)]
    pub data: PathBuf,

    /// JSON training configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output directory for checkpoints
    #[arg(short, long)]
    pub output: Option<String>,

    /// Base model name or HuggingFace model ID
    #[arg(short, long)]
    pub model: Option<String>,

    /// Validation data path; otherwise a split of the training data is used
    #[arg(long)]
    pub val_data: Option<PathBuf>,

    /// Loss: mse, mae or huber
    #[arg(long)]
    pub loss: Option<String>,

    /// Huber threshold
    #[arg(long)]
    pub delta: Option<f64>,

    /// Pooling: attention or mean
    #[arg(long)]
    pub pooling: Option<PoolingStrategy>,

    /// Backbone precision: bf16 or f16
    #[arg(long)]
    pub precision: Option<PrecisionMode>,

    /// Number of epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// LoRA rank (0 to disable LoRA)
    #[arg(long)]
    pub lora_rank: Option<usize>,

    /// LoRA alpha
    #[arg(long)]
    pub lora_alpha: Option<f32>,

    /// Maximum sequence length
    #[arg(long)]
    pub max_seq_length: Option<usize>,

    /// Gradient accumulation steps
    #[arg(long)]
    pub gradient_accumulation: Option<usize>,

    /// Warmup ratio (fraction of total steps)
    #[arg(long)]
    pub warmup_ratio: Option<f64>,

    /// Save checkpoint every N steps (0 to disable)
    #[arg(long)]
    pub save_steps: Option<usize>,

    /// Evaluate every N steps (0 to disable)
    #[arg(long)]
    pub eval_steps: Option<usize>,

    /// Log every N steps
    #[arg(long)]
    pub logging_steps: Option<usize>,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: DevicePreference,
}

impl TrainArgs {
    /// Resolve the training configuration: file (or defaults), then CLI overrides
    pub fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None => TrainingConfig::default(),
        };

        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(model) = &self.model {
            config.base_model = model.clone();
        }
        if let Some(precision) = self.precision {
            config.precision = Some(precision);
        }
        if let Some(pooling) = self.pooling {
            config.model.pooling = pooling;
        }

        match (&self.loss, self.delta) {
            (Some(loss), delta) => {
                let delta = delta.unwrap_or(match config.model.loss {
                    RegressionLoss::Huber { delta } => delta,
                    _ => crate::training::loss::DEFAULT_HUBER_DELTA,
                });
                config.model.loss = RegressionLoss::from_category(loss, delta)?;
            }
            (None, Some(delta)) => match config.model.loss {
                RegressionLoss::Huber { .. } => config.model.loss = RegressionLoss::Huber { delta },
                other => bail!("--delta only applies to the huber loss, configured loss is {}", other),
            },
            (None, None) => {}
        }

        match self.lora_rank {
            Some(0) => config.model.lora = None,
            Some(rank) => {
                let base = config.model.lora.clone().unwrap_or_default();
                config.model.lora = Some(LoraConfig { rank, ..base });
            }
            None => {}
        }
        if let Some(alpha) = self.lora_alpha {
            match config.model.lora.as_mut() {
                Some(lora) => lora.alpha = alpha,
                None => tracing::warn!("--lora-alpha ignored: LoRA is disabled"),
            }
        }

        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(max_seq_length) = self.max_seq_length {
            config.max_seq_length = max_seq_length;
        }
        if let Some(steps) = self.gradient_accumulation {
            config.gradient_accumulation_steps = steps;
        }
        if let Some(ratio) = self.warmup_ratio {
            config.warmup_ratio = ratio;
        }
        if let Some(steps) = self.save_steps {
            config.save_steps = steps;
        }
        if let Some(steps) = self.eval_steps {
            config.eval_steps = steps;
        }
        if let Some(steps) = self.logging_steps {
            config.logging_steps = steps;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Execute the train command
pub fn train(args: TrainArgs) -> Result<()> {
    let config = args.training_config()?;

    tracing::info!("Starting regression fine-tuning");
    tracing::info!("  Data: {:?}", args.data);
    tracing::info!("  Base model: {}", config.base_model);
    tracing::info!("  Output: {}", config.output_dir);
    tracing::info!("  Pooling: {}", config.model.pooling);
    tracing::info!("  Loss: {}", config.model.loss);

    let device = select_device(args.device)?;

    let dataset_config = DatasetConfig {
        shuffle: true,
        seed: Some(config.seed),
        require_labels: true,
    };
    let dataset = RegressionDataset::load(&args.data, dataset_config.clone())?;
    let (train_dataset, val_dataset) = match &args.val_data {
        Some(path) => (dataset, Some(RegressionDataset::load(path, dataset_config)?)),
        None if config.validation_split > 0.0 => {
            let (train, val) = dataset.split(1.0 - config.validation_split);
            (train, (!val.is_empty()).then_some(val))
        }
        None => (dataset, None),
    };
    tracing::info!("Train {}", train_dataset.stats());
    if let Some(val) = &val_dataset {
        tracing::info!("Validation {}", val.stats());
    }

    let model_path = ModelLoader::new()?.load_model_path(&config.base_model)?;
    let tokenizer = TokenizerWrapper::from_model_path(&model_path, config.max_seq_length)?;

    let mut trainer = Trainer::new(config, device)?;
    tracing::info!("  Precision: {}", trainer.precision());
    let backbone = DecoderBackbone::from_model_path(&model_path, trainer.precision(), trainer.device())?;
    let model = trainer.build_model(Box::new(backbone))?;

    let result = trainer.train(&model, &tokenizer, &train_dataset, val_dataset.as_ref(), None)?;

    println!("\nTraining Summary:");
    println!("  Optimization steps: {}", result.metrics.global_step);
    println!("  Final train loss: {:.5}", result.metrics.train_loss);
    if let Some(evaluation) = result.final_evaluation() {
        println!("  Validation loss: {:.5}", evaluation.loss);
        println!("  Validation metrics: {}", evaluation.metrics);
    }
    if let Some(path) = &result.checkpoint_path {
        println!("  Checkpoint: {}", path.display());
    }

    Ok(())
}

/// Arguments of the `predict` command
#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    /// Checkpoint directory written by `train`
    #[arg(short, long)]
    pub checkpoint: PathBuf,

    /// Input file (JSONL or CSV); labels, when present, are scored
    #[arg(short, long, conflicts_with = "text")]
    pub data: Option<PathBuf>,

    /// Texts to score
    #[arg(short, long, num_args = 1..)]
    pub text: Vec<String>,

    /// Output JSONL file (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Batch size
    #[arg(long, default_value = "16")]
    pub batch_size: usize,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: DevicePreference,
}

/// One line of `predict` output
#[derive(Debug, serde::Serialize)]
struct Prediction<'a> {
    text: &'a str,
    prediction: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<f32>,
}

/// Execute the predict command
pub fn predict(args: PredictArgs) -> Result<()> {
    let dataset = match (&args.data, args.text.is_empty()) {
        (Some(path), _) => RegressionDataset::load(path, DatasetConfig::for_prediction())?,
        (None, false) => {
            let examples = args
                .text
                .iter()
                .map(|text| RegressionExample::new(text.clone(), None))
                .collect();
            RegressionDataset::new(examples, DatasetConfig::for_prediction())?
        }
        (None, true) => bail!("Nothing to score: pass --data or --text"),
    };

    let device = select_device(args.device)?;
    let loaded = load_for_inference(&args.checkpoint, &device)?;
    let predictions = predict_dataset(&loaded.model, &loaded.tokenizer, &dataset, args.batch_size)?;

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    for (example, prediction) in dataset.iter().zip(&predictions) {
        let line = Prediction {
            text: &example.text,
            prediction: *prediction,
            label: example.label,
        };
        writeln!(writer, "{}", serde_json::to_string(&line)?)?;
    }
    writer.flush()?;

    let (scored, labels): (Vec<f32>, Vec<f32>) = dataset
        .iter()
        .zip(&predictions)
        .filter_map(|(example, prediction)| example.label.map(|label| (*prediction, label)))
        .unzip();
    if !labels.is_empty() {
        let metrics = RegressionMetrics::compute(&scored, &labels)?;
        tracing::info!("Scored {} labeled examples: {}", labels.len(), metrics);
        eprintln!("{}", metrics);
    }

    Ok(())
}

/// Execute the devices command
pub fn devices() -> Result<()> {
    println!("Available devices:");
    for (name, status) in available_devices() {
        println!("  {:<6} {}", name, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_overrides() {
        let args = TrainArgs::default();
        let config = args.training_config().unwrap();
        assert_eq!(config.batch_size, TrainingConfig::default().batch_size);
        assert!(config.model.lora.is_some());
    }

    #[test]
    fn test_precision_left_to_device_unless_requested() {
        let config = TrainArgs::default().training_config().unwrap();
        assert_eq!(config.precision, None);

        let args = TrainArgs {
            precision: Some(PrecisionMode::F16),
            ..Default::default()
        };
        assert_eq!(args.training_config().unwrap().precision, Some(PrecisionMode::F16));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"batch_size": 4, "num_epochs": 7, "model": {{"loss": {{"kind": "huber", "delta": 0.5}}}}}}"#
        )
        .unwrap();

        let args = TrainArgs {
            config: Some(file.path().to_path_buf()),
            batch_size: Some(2),
            pooling: Some(PoolingStrategy::Mean),
            delta: Some(0.25),
            lora_rank: Some(4),
            ..Default::default()
        };
        let config = args.training_config().unwrap();

        assert_eq!(config.batch_size, 2);
        assert_eq!(config.num_epochs, 7);
        assert_eq!(config.model.pooling, PoolingStrategy::Mean);
        assert_eq!(config.model.loss, RegressionLoss::Huber { delta: 0.25 });
        assert_eq!(config.model.lora.unwrap().rank, 4);
    }

    #[test]
    fn test_loss_overrides() {
        let args = TrainArgs {
            loss: Some("mae".to_string()),
            lora_rank: Some(0),
            ..Default::default()
        };
        let config = args.training_config().unwrap();
        assert_eq!(config.model.loss, RegressionLoss::Mae);
        assert!(config.model.lora.is_none());

        let typo = TrainArgs {
            loss: Some("msa".to_string()),
            ..Default::default()
        };
        assert!(typo.training_config().is_err());

        let delta_without_huber = TrainArgs {
            loss: None,
            delta: Some(0.5),
            config: None,
            ..Default::default()
        };
        // default loss is huber
        assert!(delta_without_huber.training_config().is_ok());

        let bad_delta = TrainArgs {
            loss: Some("huber".to_string()),
            delta: Some(0.0),
            ..Default::default()
        };
        assert!(bad_delta.training_config().is_err());
    }

    #[test]
    fn test_predict_requires_input() {
        let args = PredictArgs {
            checkpoint: PathBuf::from("missing"),
            data: None,
            text: vec![],
            output: None,
            batch_size: 4,
            device: DevicePreference::Cpu,
        };
        let err = predict(args).unwrap_err();
        assert!(err.to_string().contains("Nothing to score"));
    }
}
