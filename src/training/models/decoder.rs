//! Frozen decoder backbone producing last hidden states
//!
//! Wraps the Qwen2 base model (no LM head) from `candle-transformers`.
//! Weights are memory-mapped and never registered as trainable variables.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config as Qwen2Config, Model as Qwen2Model};
use std::path::Path;
use std::sync::Mutex;

use crate::training::hub::{HubModelConfig, ModelLoader, ModelPath};
use crate::training::models::common::Backbone;
use crate::training::precision::PrecisionMode;

/// Pretrained causal decoder used as a hidden-state encoder
pub struct DecoderBackbone {
    /// The base model keeps a KV cache, hence the Mutex
    model: Mutex<Qwen2Model>,
    model_id: String,
    hidden_size: usize,
    num_hidden_layers: usize,
    precision: PrecisionMode,
    device: Device,
}

impl DecoderBackbone {
    /// Load from a resolved model path
    ///
    /// `precision` is checked against the device; a bf16 request on the CPU
    /// loads in f16.
    pub fn from_model_path(
        model_path: &ModelPath,
        precision: PrecisionMode,
        device: &Device,
    ) -> Result<Self> {
        model_path.validate()?;

        let hub_config = HubModelConfig::from_file(&model_path.config_file)?;
        hub_config.validate_decoder()?;

        let config_str = std::fs::read_to_string(&model_path.config_file)
            .context("Failed to read model config")?;
        let config: Qwen2Config =
            serde_json::from_str(&config_str).context("Failed to parse Qwen2 config")?;

        let precision = PrecisionMode::for_device(Some(precision), device);
        let dtype = precision.dtype();
        tracing::info!(
            "Loading decoder backbone {}: hidden={}, layers={}, vocab={}, precision={}",
            model_path.model_id,
            config.hidden_size,
            config.num_hidden_layers,
            config.vocab_size,
            precision
        );

        let weight_refs: Vec<&Path> = model_path.weight_files.iter().map(|p| p.as_path()).collect();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weight_refs, dtype, device)
                .context("Failed to load model weights")?
        };
        let model = Qwen2Model::new(&config, vb).context("Failed to build Qwen2 model")?;

        Ok(Self {
            model: Mutex::new(model),
            model_id: model_path.model_id.clone(),
            hidden_size: config.hidden_size,
            num_hidden_layers: config.num_hidden_layers,
            precision,
            device: device.clone(),
        })
    }

    /// Load from a HuggingFace model ID or local path
    pub fn from_pretrained(model_id: &str, precision: PrecisionMode, device: &Device) -> Result<Self> {
        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(model_id)?;
        Self::from_model_path(&model_path, precision, device)
    }

    pub fn num_hidden_layers(&self) -> usize {
        self.num_hidden_layers
    }

    /// Precision the weights were loaded in
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }
}

impl Backbone for DecoderBackbone {
    /// Causal forward pass over the whole batch
    ///
    /// The mask is not forwarded: with right padding and causal attention,
    /// real tokens never attend to the padding that follows them.
    fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow!("Model lock error: {}", e))?;

        // no KV cache reuse across batches
        model.clear_kv_cache();
        let hidden_states = model.forward(input_ids, 0, None)?;

        tracing::debug!("Backbone hidden states: {:?}", hidden_states.dims());
        Ok(hidden_states)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn name(&self) -> String {
        format!("qwen2:{}", self.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::testing::{write_tiny_qwen2, TINY_QWEN2_HIDDEN};
    use tempfile::tempdir;

    fn tiny_backbone(precision: PrecisionMode) -> (tempfile::TempDir, DecoderBackbone) {
        let dir = tempdir().unwrap();
        write_tiny_qwen2(dir.path()).unwrap();
        let model_path = ModelPath::from_local(dir.path()).unwrap();
        let backbone = DecoderBackbone::from_model_path(&model_path, precision, &Device::Cpu).unwrap();
        (dir, backbone)
    }

    fn batch() -> (Tensor, Tensor) {
        let input_ids = Tensor::new(&[[4u32, 6, 11, 2], [3, 7, 0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 1.], [1., 1., 0., 0.]], &Device::Cpu).unwrap();
        (input_ids, mask)
    }

    #[test]
    fn test_loads_in_every_precision_on_cpu() {
        for precision in [PrecisionMode::Bf16, PrecisionMode::F16] {
            let (_dir, backbone) = tiny_backbone(precision);
            assert_eq!(backbone.precision(), PrecisionMode::F16);
            assert_eq!(backbone.hidden_size(), TINY_QWEN2_HIDDEN);
            assert_eq!(backbone.num_hidden_layers(), 2);

            let (input_ids, mask) = batch();
            let hidden = backbone.forward(&input_ids, &mask).unwrap();
            assert_eq!(hidden.dims(), &[2, 4, TINY_QWEN2_HIDDEN]);
        }
    }

    #[test]
    fn test_repeated_forward_is_identical() {
        let (_dir, backbone) = tiny_backbone(PrecisionMode::F16);
        let (input_ids, mask) = batch();

        let first = backbone.forward(&input_ids, &mask).unwrap();
        let second = backbone.forward(&input_ids, &mask).unwrap();
        let diff = (first - second)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_rejects_other_architectures() {
        let dir = tempdir().unwrap();
        write_tiny_qwen2(dir.path()).unwrap();
        let config_file = dir.path().join("config.json");
        let config = std::fs::read_to_string(&config_file).unwrap();
        std::fs::write(&config_file, config.replace(r#""qwen2""#, r#""gpt2""#)).unwrap();

        let model_path = ModelPath::from_local(dir.path()).unwrap();
        let result = DecoderBackbone::from_model_path(&model_path, PrecisionMode::F16, &Device::Cpu);
        assert!(result.is_err());
    }
}
