//! LoRA adapter over backbone hidden states
//!
//! The backbone weights stay frozen. A low-rank residual update is applied
//! to its last hidden states before pooling:
//!
//! ```text
//! h' = h + dropout(h) A^T B^T * (alpha / rank)
//! ```
//!
//! Where:
//! - A ∈ ℝ^(rank × hidden) initialized with Kaiming uniform
//! - B ∈ ℝ^(hidden × rank) initialized to zeros, so h' = h at the start

use anyhow::{ensure, Result};
use candle_core::{ModuleT, Tensor};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{Dropout, Init, VarBuilder};
use serde::{Deserialize, Serialize};

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition (typically 4-64)
    pub rank: usize,
    /// Scaling numerator (typically rank * 2)
    pub alpha: f32,
    /// Dropout applied to the adapter input (0.0-0.1)
    #[serde(default)]
    pub dropout: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
        }
    }
}

impl LoraConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            ..Default::default()
        }
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.rank > 0, "LoRA rank must be positive");
        ensure!(self.alpha > 0.0, "LoRA alpha must be positive, got {}", self.alpha);
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            "LoRA dropout must be in [0, 1), got {}",
            self.dropout
        );
        Ok(())
    }
}

/// Trainable low-rank residual on hidden states
pub struct LoraAdapter {
    down: Tensor,
    up: Tensor,
    dropout: Dropout,
    scaling: f64,
    rank: usize,
    hidden_size: usize,
}

impl LoraAdapter {
    /// Create a new adapter; parameters are registered under `vb`
    pub fn new(hidden_size: usize, config: &LoraConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let down = vb.get_with_hints(
            (config.rank, hidden_size),
            "down",
            Init::Kaiming {
                dist: NormalOrUniform::Uniform,
                fan: FanInOut::FanIn,
                non_linearity: NonLinearity::Linear,
            },
        )?;
        let up = vb.get_with_hints((hidden_size, config.rank), "up", Init::Const(0.0))?;

        tracing::debug!(
            "Created LoRA adapter: rank={}, scaling={}, {} trainable params",
            config.rank,
            config.scaling(),
            config.rank * hidden_size * 2
        );

        Ok(Self {
            down,
            up,
            dropout: Dropout::new(config.dropout),
            scaling: config.scaling() as f64,
            rank: config.rank,
            hidden_size,
        })
    }

    /// Apply the adapter to hidden states [batch, seq_len, hidden_size]
    pub fn forward_t(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dropout.forward_t(hidden_states, train)?;
        let update = xs
            .broadcast_matmul(&self.down.t()?)?
            .broadcast_matmul(&self.up.t()?)?;
        Ok((hidden_states + (update * self.scaling)?)?)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of trainable parameters
    pub fn num_params(&self) -> usize {
        self.rank * self.hidden_size * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 8);
        assert_eq!(config.alpha, 16.0);
        assert_eq!(config.scaling(), 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_validation() {
        assert!(LoraConfig::new(0, 16.0).validate().is_err());
        assert!(LoraConfig::new(4, 0.0).validate().is_err());
        assert!(LoraConfig::new(4, 8.0).with_dropout(1.0).validate().is_err());
    }

    #[test]
    fn test_adapter_is_identity_at_init() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let adapter = LoraAdapter::new(8, &LoraConfig::new(2, 4.0), vb.pp("lora")).unwrap();

        let hidden = Tensor::randn(0f32, 1f32, (2, 4, 8), &Device::Cpu).unwrap();
        let adapted = adapter.forward_t(&hidden, false).unwrap();

        assert_eq!(adapted.dims(), hidden.dims());
        let diff = (adapted - &hidden)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_adapter_param_count() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let adapter = LoraAdapter::new(16, &LoraConfig::new(4, 8.0), vb.pp("lora")).unwrap();

        assert_eq!(adapter.rank(), 4);
        assert_eq!(adapter.num_params(), 4 * 16 * 2);
        assert_eq!(var_map.all_vars().len(), 2);
    }
}
