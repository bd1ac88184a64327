//! Regression model over a pretrained backbone
//!
//! Forward pass:
//!
//! ```text
//! input_ids, attention_mask
//!   -> backbone (frozen)        [batch, seq, hidden]
//!   -> LoRA adapter (optional)  [batch, seq, hidden]
//!   -> pooling                  [batch, hidden]
//!   ++ last-token hidden state  [batch, 2 * hidden]
//!   -> regression head          [batch] in (0, 1)
//!   -> loss (when labels are given)
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::common::Backbone;
use super::head::{last_token, RegressionHead};
use super::pooling::{Pooling, PoolingStrategy};
use crate::training::lora::{LoraAdapter, LoraConfig};
use crate::training::loss::RegressionLoss;

/// Configuration of the trainable part of the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegressionModelConfig {
    /// Pooling strategy
    #[serde(default)]
    pub pooling: PoolingStrategy,
    /// Training loss
    #[serde(default)]
    pub loss: RegressionLoss,
    /// LoRA adapter on the backbone hidden states (None to disable)
    #[serde(default)]
    pub lora: Option<LoraConfig>,
}

impl RegressionModelConfig {
    pub fn with_pooling(mut self, pooling: PoolingStrategy) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_loss(mut self, loss: RegressionLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_lora(mut self, lora: Option<LoraConfig>) -> Self {
        self.lora = lora;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.loss.validate()?;
        if let Some(lora) = &self.lora {
            lora.validate()?;
        }
        Ok(())
    }
}

/// Output of a forward pass
#[derive(Debug, Clone)]
pub struct RegressionOutput {
    /// Mean loss, present only when labels were supplied
    pub loss: Option<Tensor>,
    /// Predictions [batch_size] in (0, 1)
    pub logits: Tensor,
}

/// Backbone plus trainable regression layers
pub struct RegressionModel {
    backbone: Box<dyn Backbone>,
    adapter: Option<LoraAdapter>,
    pooling: Pooling,
    head: RegressionHead,
    config: RegressionModelConfig,
}

impl RegressionModel {
    /// Build the model; trainable parameters are registered in `var_map`
    pub fn new(
        backbone: Box<dyn Backbone>,
        config: RegressionModelConfig,
        var_map: &VarMap,
    ) -> Result<Self> {
        config.validate()?;

        let hidden_size = backbone.hidden_size();
        let vb = VarBuilder::from_varmap(var_map, DType::F32, backbone.device());

        let adapter = config
            .lora
            .as_ref()
            .map(|lora| LoraAdapter::new(hidden_size, lora, vb.pp("lora")))
            .transpose()?;
        let pooling = Pooling::new(config.pooling, hidden_size, vb.pp("pooling"))?;
        let head = RegressionHead::new(hidden_size, vb.pp("regressor"))?;

        let model = Self {
            backbone,
            adapter,
            pooling,
            head,
            config,
        };

        tracing::info!(
            "Built regression model on {}: pooling={}, loss={}, lora={}, trainable params={}",
            model.backbone.name(),
            model.config.pooling,
            model.config.loss,
            model.adapter.as_ref().map(|a| a.rank()).unwrap_or(0),
            model.num_trainable_params()
        );

        Ok(model)
    }

    pub fn config(&self) -> &RegressionModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.backbone.device()
    }

    pub fn hidden_size(&self) -> usize {
        self.backbone.hidden_size()
    }

    /// Number of trainable parameters (adapter, pooling and head)
    pub fn num_trainable_params(&self) -> usize {
        let adapter = self.adapter.as_ref().map(|a| a.num_params()).unwrap_or(0);
        let pooling = match self.pooling {
            Pooling::Attention(_) => self.hidden_size() + 1,
            Pooling::Mean => 0,
        };
        adapter + pooling + self.head.num_params()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs [batch_size, seq_len], right-padded
    /// * `attention_mask` - Attention mask [batch_size, seq_len]
    /// * `labels` - Targets [batch_size] (optional)
    /// * `train` - Enables dropout
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<RegressionOutput> {
        let hidden_states = self
            .backbone
            .forward(input_ids, attention_mask)?
            .detach()
            .to_dtype(DType::F32)?;

        let hidden_states = match &self.adapter {
            Some(adapter) => adapter.forward_t(&hidden_states, train)?,
            None => hidden_states,
        };

        let pooled = self.pooling.forward_t(&hidden_states, attention_mask, train)?;
        let last = last_token(&hidden_states)?;
        let logits = self.head.forward_t(&pooled, &last, train)?;

        let loss = labels
            .map(|labels| {
                let labels = labels.to_dtype(DType::F32)?;
                self.config.loss.forward(&logits, &labels)
            })
            .transpose()?;

        Ok(RegressionOutput { loss, logits })
    }

    /// Inference-mode predictions as host values
    pub fn predict(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Vec<f32>> {
        let output = self.forward(input_ids, attention_mask, None, false)?;
        Ok(output.logits.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::testing::EmbeddingBackbone;

    fn example_inputs() -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let input_ids = Tensor::new(&[[5u32, 9, 2, 0], [7, 3, 0, 0]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 0.], [1., 1., 0., 0.]], &device).unwrap();
        let labels = Tensor::new(&[0.3f32, 0.7], &device).unwrap();
        (input_ids, mask, labels)
    }

    fn model(config: RegressionModelConfig) -> (VarMap, RegressionModel) {
        let var_map = VarMap::new();
        let backbone = EmbeddingBackbone::new(16, 8).unwrap();
        let model = RegressionModel::new(Box::new(backbone), config, &var_map).unwrap();
        (var_map, model)
    }

    fn registered_params(var_map: &VarMap) -> usize {
        var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    #[test]
    fn test_end_to_end_forward() {
        let (_var_map, model) = model(RegressionModelConfig::default());
        let (input_ids, mask, labels) = example_inputs();

        let output = model.forward(&input_ids, &mask, Some(&labels), true).unwrap();
        assert_eq!(output.logits.dims(), &[2]);
        for p in output.logits.to_vec1::<f32>().unwrap() {
            assert!(p > 0.0 && p < 1.0);
        }

        let loss = output.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_forward_without_labels_has_no_loss() {
        let (_var_map, model) = model(RegressionModelConfig::default());
        let (input_ids, mask, _) = example_inputs();

        let output = model.forward(&input_ids, &mask, None, false).unwrap();
        assert!(output.loss.is_none());
    }

    #[test]
    fn test_inference_is_deterministic() {
        let config = RegressionModelConfig::default().with_lora(Some(LoraConfig::new(2, 4.0)));
        let (_var_map, model) = model(config);
        let (input_ids, mask, _) = example_inputs();

        let first = model.predict(&input_ids, &mask).unwrap();
        let second = model.predict(&input_ids, &mask).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_loss_gives_finite_value() {
        for loss in [
            RegressionLoss::Mse,
            RegressionLoss::Mae,
            RegressionLoss::Huber { delta: 0.1 },
        ] {
            let (_var_map, model) = model(RegressionModelConfig::default().with_loss(loss));
            let (input_ids, mask, labels) = example_inputs();
            let output = model.forward(&input_ids, &mask, Some(&labels), false).unwrap();
            let value = output.loss.unwrap().to_scalar::<f32>().unwrap();
            assert!(value.is_finite() && value >= 0.0, "{} gave {}", loss, value);
        }
    }

    #[test]
    fn test_trainable_param_count() {
        let (var_map, attention) = model(RegressionModelConfig::default());
        assert_eq!(attention.num_trainable_params(), registered_params(&var_map));

        let (var_map, mean) = model(RegressionModelConfig::default().with_pooling(PoolingStrategy::Mean));
        assert_eq!(mean.num_trainable_params(), registered_params(&var_map));
        assert_eq!(attention.num_trainable_params() - mean.num_trainable_params(), 8 + 1);

        let lora = RegressionModelConfig::default().with_lora(Some(LoraConfig::new(2, 4.0)));
        let (var_map, adapted) = model(lora);
        assert_eq!(adapted.num_trainable_params(), registered_params(&var_map));
    }

    #[test]
    fn test_gradients_reach_trainable_params() {
        let (var_map, model) = model(RegressionModelConfig::default());
        let (input_ids, mask, labels) = example_inputs();

        let loss = model.forward(&input_ids, &mask, Some(&labels), false).unwrap().loss.unwrap();
        let grads = loss.backward().unwrap();
        for var in var_map.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_fully_masked_sequence_fails() {
        let (_var_map, model) = model(RegressionModelConfig::default());
        let (input_ids, _, labels) = example_inputs();
        let mask = Tensor::new(&[[1f32, 1., 1., 0.], [0., 0., 0., 0.]], &Device::Cpu).unwrap();

        assert!(model.forward(&input_ids, &mask, Some(&labels), false).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let var_map = VarMap::new();
        let backbone = EmbeddingBackbone::new(16, 8).unwrap();
        let config = RegressionModelConfig::default().with_loss(RegressionLoss::Huber { delta: -1.0 });
        assert!(RegressionModel::new(Box::new(backbone), config, &var_map).is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = RegressionModelConfig::default()
            .with_pooling(PoolingStrategy::Mean)
            .with_loss(RegressionLoss::Huber { delta: 0.5 })
            .with_lora(Some(LoraConfig::new(4, 8.0)));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""kind":"huber""#));
        let parsed: RegressionModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
