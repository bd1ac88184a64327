//! Checkpoints of the trainable layers
//!
//! A checkpoint is a directory holding:
//! - `head.safetensors` - adapter, pooling and head weights (the trainable `VarMap`)
//! - `head_config.json` - everything needed to rebuild the model around them
//!
//! Backbone weights are never written; they are reloaded from `base_model`.

use anyhow::{ensure, Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::models::{DecoderBackbone, RegressionModel, RegressionModelConfig, TokenizerWrapper};
use super::precision::PrecisionMode;

/// Weights file inside a checkpoint directory
pub const WEIGHTS_FILE: &str = "head.safetensors";
/// Configuration file inside a checkpoint directory
pub const CONFIG_FILE: &str = "head_config.json";

/// Sidecar configuration stored next to the trainable weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadCheckpointConfig {
    /// HuggingFace model ID or local path of the backbone
    pub base_model: String,
    /// Backbone precision
    pub precision: PrecisionMode,
    /// Trainable layers
    pub model: RegressionModelConfig,
    /// Tokenizer truncation length used in training
    pub max_seq_length: usize,
    /// Optimization step the weights were saved at
    #[serde(default)]
    pub global_step: usize,
}

impl HeadCheckpointConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint config: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse checkpoint config")
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write checkpoint config: {:?}", path))
    }
}

/// Write weights and configuration into `dir`
pub fn save_checkpoint(var_map: &VarMap, config: &HeadCheckpointConfig, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

    var_map
        .save(dir.join(WEIGHTS_FILE))
        .context("Failed to save checkpoint weights")?;
    config.to_file(dir.join(CONFIG_FILE))?;

    tracing::info!("Saved checkpoint to {:?} (step {})", dir, config.global_step);
    Ok(dir.to_path_buf())
}

/// Load saved weights into the variables of an already built model
pub fn load_weights(var_map: &mut VarMap, dir: impl AsRef<Path>) -> Result<()> {
    let path = dir.as_ref().join(WEIGHTS_FILE);
    ensure!(path.exists(), "Checkpoint weights not found: {:?}", path);
    var_map
        .load(&path)
        .with_context(|| format!("Failed to load checkpoint weights: {:?}", path))?;
    tracing::info!("Loaded checkpoint weights from {:?}", path);
    Ok(())
}

/// A model restored from a checkpoint, ready for inference
pub struct LoadedModel {
    pub model: RegressionModel,
    pub tokenizer: TokenizerWrapper,
    pub config: HeadCheckpointConfig,
    /// Keeps the restored variables alive alongside the model
    pub var_map: VarMap,
}

/// Rebuild backbone, tokenizer and trainable layers from a checkpoint directory
pub fn load_for_inference(dir: impl AsRef<Path>, device: &Device) -> Result<LoadedModel> {
    let dir = dir.as_ref();
    let config = HeadCheckpointConfig::from_file(dir.join(CONFIG_FILE))?;
    tracing::info!(
        "Restoring checkpoint {:?}: base model {}, step {}",
        dir,
        config.base_model,
        config.global_step
    );

    let loader = super::hub::ModelLoader::new()?;
    let model_path = loader.load_model_path(&config.base_model)?;
    let backbone = DecoderBackbone::from_model_path(&model_path, config.precision, device)?;
    let tokenizer = TokenizerWrapper::from_model_path(&model_path, config.max_seq_length)?;

    let mut var_map = VarMap::new();
    let model = RegressionModel::new(Box::new(backbone), config.model.clone(), &var_map)?;
    load_weights(&mut var_map, dir)?;

    Ok(LoadedModel {
        model,
        tokenizer,
        config,
        var_map,
    })
}
