//! HuggingFace Hub integration for model downloading
//!
//! Resolves a model id or a local directory to the files needed to load a
//! decoder backbone: `config.json`, one or more safetensors shards and the
//! tokenizer files.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    /// Create a new HubApi instance
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download a model from HuggingFace Hub
    ///
    /// Fetches a single `model.safetensors` when present, otherwise every
    /// shard listed in `model.safetensors.index.json`.
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_file = repo
            .get("config.json")
            .context("Failed to download config.json")?;

        let weight_files = match repo.get(SINGLE_WEIGHTS) {
            Ok(path) => vec![path],
            Err(_) => {
                let index = repo.get(WEIGHTS_INDEX).with_context(|| {
                    format!("No model weights found (tried {} and {})", SINGLE_WEIGHTS, WEIGHTS_INDEX)
                })?;
                let shards = shard_names(&index)?;
                tracing::info!("Downloading {} weight shards", shards.len());
                shards
                    .iter()
                    .map(|shard| {
                        repo.get(shard)
                            .with_context(|| format!("Failed to download weight shard {}", shard))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let tokenizer_file = repo.get("tokenizer.json").ok();
        let tokenizer_config_file = repo.get("tokenizer_config.json").ok();
        if tokenizer_file.is_none() {
            tracing::warn!("tokenizer.json not found for {}", model_id);
        }

        let path = config_file
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path,
            model_id: model_id.to_string(),
            is_local: false,
            config_file,
            weight_files,
            tokenizer_file,
            tokenizer_config_file,
        })
    }
}

/// Shard file names listed in a safetensors index, sorted and deduplicated
pub fn shard_names(index_file: &Path) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct WeightsIndex {
        weight_map: HashMap<String, String>,
    }

    let content = std::fs::read_to_string(index_file)
        .with_context(|| format!("Failed to read weights index: {:?}", index_file))?;
    let index: WeightsIndex =
        serde_json::from_str(&content).context("Failed to parse weights index")?;

    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(anyhow!("Weights index {:?} lists no shards", index_file));
    }
    Ok(shards.into_iter().collect())
}

/// Represents a downloaded or local model path
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID or directory name
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files (one, or every shard in order)
    pub weight_files: Vec<PathBuf>,
    /// Path to tokenizer.json (optional)
    pub tokenizer_file: Option<PathBuf>,
    /// Path to tokenizer_config.json (optional)
    pub tokenizer_config_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weight_files = find_local_weights(&path)?;
        let existing = |name: &str| {
            let file = path.join(name);
            file.exists().then_some(file)
        };

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            is_local: true,
            config_file,
            weight_files,
            tokenizer_file: existing("tokenizer.json"),
            tokenizer_config_file: existing("tokenizer_config.json"),
            path,
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        if self.weight_files.is_empty() {
            return Err(anyhow!("No weight files for model {}", self.model_id));
        }
        for file in &self.weight_files {
            if !file.exists() {
                return Err(anyhow!("Weights file not found: {:?}", file));
            }
        }
        Ok(())
    }
}

/// Find weight files in a local directory
///
/// Prefers `model.safetensors`, then the shards named by the index file,
/// then any `model-XXXXX-of-YYYYY.safetensors` files.
fn find_local_weights(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let single_file = model_dir.join(SINGLE_WEIGHTS);
    if single_file.exists() {
        return Ok(vec![single_file]);
    }

    let index_file = model_dir.join(WEIGHTS_INDEX);
    if index_file.exists() {
        return Ok(shard_names(&index_file)?
            .into_iter()
            .map(|shard| model_dir.join(shard))
            .collect());
    }

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        let is_shard = path.extension().map(|e| e == "safetensors").unwrap_or(false)
            && path
                .file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("model-") && name.contains("-of-")
                })
                .unwrap_or(false);
        if is_shard {
            shards.push(path);
        }
    }

    if shards.is_empty() {
        return Err(anyhow!("No safetensors weight files found in {:?}", model_dir));
    }

    shards.sort();
    Ok(shards)
}

/// Configuration from a decoder model's config.json
#[derive(Debug, Clone, Deserialize)]
pub struct HubModelConfig {
    /// Model architectures (e.g., ["Qwen2ForCausalLM"])
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Model type (e.g., "qwen2")
    pub model_type: Option<String>,

    /// Vocabulary size
    pub vocab_size: Option<usize>,

    /// Hidden size
    pub hidden_size: Option<usize>,

    /// Number of hidden layers
    pub num_hidden_layers: Option<usize>,

    /// Number of attention heads
    pub num_attention_heads: Option<usize>,

    /// EOS token id(s); either a number or a list
    pub eos_token_id: Option<serde_json::Value>,

    /// Dtype the checkpoint was saved in
    pub torch_dtype: Option<String>,

    /// Any extra fields we don't explicitly handle
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl HubModelConfig {
    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config.json")
    }

    /// Get the model type, inferring from architectures if needed
    pub fn get_model_type(&self) -> Option<String> {
        if let Some(model_type) = &self.model_type {
            return Some(model_type.to_lowercase());
        }

        self.architectures.iter().find_map(|arch| {
            let arch = arch.to_lowercase();
            ["qwen2", "llama", "mistral", "exaone"]
                .into_iter()
                .find(|known| arch.contains(known))
                .map(str::to_string)
        })
    }

    /// EOS token ids declared in the config
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(serde_json::Value::Number(n)) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
            Some(serde_json::Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_u64())
                .map(|id| id as u32)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Check that this config describes a decoder we can load
    pub fn validate_decoder(&self) -> Result<()> {
        if self.hidden_size.is_none() {
            return Err(anyhow!("Config missing required field: hidden_size"));
        }
        if self.num_hidden_layers.is_none() {
            return Err(anyhow!("Config missing required field: num_hidden_layers"));
        }
        match self.get_model_type().as_deref() {
            Some("qwen2") => Ok(()),
            other => Err(anyhow!(
                "Unsupported decoder architecture: {:?} (architectures: {:?}). Supported: qwen2",
                other,
                self.architectures
            )),
        }
    }
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    hub: HubApi,
}

impl ModelLoader {
    /// Create a new ModelLoader
    pub fn new() -> Result<Self> {
        Ok(Self {
            hub: HubApi::new()?,
        })
    }

    /// Load model path - auto-detects local vs HuggingFace
    ///
    /// Existing paths, and anything starting with `.`, `/` or `~`, are local;
    /// everything else is treated as a Hub model id.
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = Path::new(model_id_or_path);
        let looks_local = model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~');

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            ModelPath::from_local(local_path)
        } else if looks_local {
            Err(anyhow!("Local model path does not exist: {}", model_id_or_path))
        } else {
            self.hub.download_model(model_id_or_path)
        }
    }
}
