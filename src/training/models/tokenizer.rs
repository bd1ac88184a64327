//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Decoder checkpoints usually ship without a padding token, so the EOS
//! token doubles as padding. Padding is always on the right: the regression
//! head reads the hidden state at the final position.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::training::hub::{HubModelConfig, ModelPath};

/// Default maximum sequence length
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Wrapper around a HuggingFace tokenizer configured for batched regression input
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    pad_token: String,
    pad_id: u32,
    max_length: usize,
}

impl TokenizerWrapper {
    /// Wrap a tokenizer, padding on the right with `pad_token`
    pub fn new(mut tokenizer: Tokenizer, pad_token: &str, max_length: usize) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| anyhow!("Padding token {:?} is not in the vocabulary", pad_token))?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_id,
            pad_token: pad_token.to_string(),
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self {
            tokenizer,
            pad_token: pad_token.to_string(),
            pad_id,
            max_length,
        })
    }

    /// Load the tokenizer of a model, using its EOS token for padding
    pub fn from_model_path(model_path: &ModelPath, max_length: usize) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow!("Tokenizer file not found in model path"))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let config = HubModelConfig::from_file(&model_path.config_file)?;
        let eos_token = resolve_eos_token(
            &tokenizer,
            model_path.tokenizer_config_file.as_deref(),
            &config.eos_token_ids(),
        )?;
        tracing::debug!("Using EOS token {:?} for padding", eos_token);

        Self::new(tokenizer, &eos_token, max_length)
    }

    /// Get the maximum sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Encode a batch of texts, right-padded to the longest one
    pub fn encode_batch(&self, texts: &[String]) -> Result<BatchEncodedInput> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Batch tokenization failed: {}", e))?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            input_ids.extend(encoding.get_ids());
            attention_mask.extend(encoding.get_attention_mask());
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }

    /// Encode texts to (input_ids, attention_mask) tensors on `device`
    pub fn encode_to_tensors(&self, texts: &[String], device: &Device) -> Result<(Tensor, Tensor)> {
        self.encode_batch(texts)?.to_tensors(device)
    }
}

/// Find the EOS token string
///
/// Looks at `eos_token` in tokenizer_config.json (plain string or
/// `{"content": ...}`), then at the EOS ids from config.json.
pub fn resolve_eos_token(
    tokenizer: &Tokenizer,
    tokenizer_config_file: Option<&Path>,
    eos_token_ids: &[u32],
) -> Result<String> {
    if let Some(path) = tokenizer_config_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokenizer config: {:?}", path))?;
        let config: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse tokenizer_config.json")?;

        let eos = match &config["eos_token"] {
            serde_json::Value::String(token) => Some(token.clone()),
            serde_json::Value::Object(token) => token
                .get("content")
                .and_then(|c| c.as_str())
                .map(str::to_string),
            _ => None,
        };
        if let Some(token) = eos {
            return Ok(token);
        }
    }

    eos_token_ids
        .iter()
        .find_map(|id| tokenizer.id_to_token(*id))
        .ok_or_else(|| anyhow!("Could not determine the EOS token to use for padding"))
}

/// Batch encoded input
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    /// Flattened token IDs [batch_size * seq_len]
    pub input_ids: Vec<u32>,
    /// Flattened attention mask
    pub attention_mask: Vec<u32>,
    /// Batch size
    pub batch_size: usize,
    /// Sequence length (after padding)
    pub seq_len: usize,
}

impl BatchEncodedInput {
    /// Convert to tensors [batch_size, seq_len]; the mask is F32
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::new(&self.input_ids[..], device)?
            .reshape((self.batch_size, self.seq_len))?;

        let attention_mask = Tensor::new(&self.attention_mask[..], device)?
            .to_dtype(DType::F32)?
            .reshape((self.batch_size, self.seq_len))?;

        Ok((input_ids, attention_mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<eos>": 0, "<unk>": 1, "the": 2, "cat": 3, "sat": 4},
            "unk_token": "<unk>"
        }
    }"#;

    fn word_level() -> Tokenizer {
        WORD_LEVEL.parse::<Tokenizer>().unwrap()
    }

    #[test]
    fn test_right_padding_with_eos() {
        let tokenizer = TokenizerWrapper::new(word_level(), "<eos>", 16).unwrap();
        assert_eq!(tokenizer.pad_id(), 0);

        let batch = tokenizer
            .encode_batch(&["the cat sat".to_string(), "cat".to_string()])
            .unwrap();
        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.seq_len, 3);
        assert_eq!(batch.input_ids, vec![2, 3, 4, 3, 0, 0]);
        assert_eq!(batch.attention_mask, vec![1, 1, 1, 1, 0, 0]);

        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 3]);
        assert_eq!(mask.dtype(), DType::F32);
    }

    #[test]
    fn test_truncation() {
        let tokenizer = TokenizerWrapper::new(word_level(), "<eos>", 2).unwrap();
        let batch = tokenizer.encode_batch(&["the cat sat".to_string()]).unwrap();
        assert_eq!(batch.input_ids, vec![2, 3]);
    }

    #[test]
    fn test_unknown_pad_token() {
        assert!(TokenizerWrapper::new(word_level(), "<pad>", 8).is_err());
    }

    #[test]
    fn test_resolve_eos_token() {
        let tokenizer = word_level();
        let dir = tempdir().unwrap();

        let plain = dir.path().join("plain.json");
        fs::write(&plain, r#"{"eos_token": "<eos>"}"#).unwrap();
        assert_eq!(resolve_eos_token(&tokenizer, Some(&plain), &[]).unwrap(), "<eos>");

        let object = dir.path().join("object.json");
        fs::write(&object, r#"{"eos_token": {"content": "sat", "lstrip": false}}"#).unwrap();
        assert_eq!(resolve_eos_token(&tokenizer, Some(&object), &[]).unwrap(), "sat");

        // falls back to config ids
        assert_eq!(resolve_eos_token(&tokenizer, None, &[0]).unwrap(), "<eos>");
        assert!(resolve_eos_token(&tokenizer, None, &[]).is_err());
    }
}
