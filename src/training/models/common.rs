//! Common traits for backbone models

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Pretrained sequence encoder producing per-token hidden states
///
/// Any model that satisfies this contract can sit under the regression head.
pub trait Backbone: Send + Sync {
    /// Forward pass to get the last hidden states
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs [batch_size, seq_len]
    /// * `attention_mask` - Attention mask [batch_size, seq_len] (1 = token, 0 = padding)
    ///
    /// # Returns
    /// * Hidden states [batch_size, seq_len, hidden_size]
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Width of the hidden states
    fn hidden_size(&self) -> usize;

    /// Device the backbone runs on
    fn device(&self) -> &Device;

    /// Short name used in logs
    fn name(&self) -> String {
        "backbone".to_string()
    }
}
