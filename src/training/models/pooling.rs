//! Pooling of per-token hidden states into one vector per sequence
//!
//! Two strategies are available and exactly one is active per model:
//! - `Attention` - learned, mask-aware softmax weights (default)
//! - `Mean` - mask-weighted arithmetic mean

use anyhow::{anyhow, bail, ensure, Result};
use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Dropout applied to attention scores during training
pub const POOLING_DROPOUT: f32 = 0.1;

/// Score assigned to padding positions before the softmax
const MASKED_SCORE: f64 = -1e9;

/// Pooling strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingStrategy {
    /// Learned attention weights over non-padding tokens
    #[default]
    Attention,
    /// Mean over non-padding tokens
    Mean,
}

impl std::str::FromStr for PoolingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "attention" | "attn" => Ok(Self::Attention),
            "mean" => Ok(Self::Mean),
            _ => Err(anyhow!(
                "Invalid pooling strategy: {}. Valid options: attention, mean",
                s
            )),
        }
    }
}

impl std::fmt::Display for PoolingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attention => write!(f, "attention"),
            Self::Mean => write!(f, "mean"),
        }
    }
}

/// Check that the mask matches the hidden states and that every
/// sequence keeps at least one token.
///
/// # Arguments
/// * `hidden_states` - Hidden states [batch_size, seq_len, hidden_size]
/// * `attention_mask` - Attention mask [batch_size, seq_len]
pub fn validate_attention_mask(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<()> {
    let (batch_size, seq_len, _) = hidden_states.dims3()?;
    let mask_dims = attention_mask.dims2()?;
    ensure!(
        mask_dims == (batch_size, seq_len),
        "Attention mask shape {:?} does not match hidden states ({}, {})",
        mask_dims,
        batch_size,
        seq_len
    );

    let counts = attention_mask
        .to_dtype(DType::F32)?
        .sum(1)?
        .to_vec1::<f32>()?;
    if let Some(row) = counts.iter().position(|&count| count <= 0.0) {
        bail!(
            "Sequence {} in the batch has no unmasked tokens; at least one is required",
            row
        );
    }

    Ok(())
}

/// Attention pooling
///
/// Scores each token with a `hidden_size -> 1` projection followed by ReLU
/// and dropout, pushes padding positions to `-1e9`, normalizes with a
/// softmax over the sequence and returns the weighted sum of hidden states.
pub struct AttentionPooling {
    score: Linear,
    dropout: Dropout,
}

impl AttentionPooling {
    /// Create a new attention pooling layer
    pub fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let score = candle_nn::linear(hidden_size, 1, vb.pp("score"))?;
        Ok(Self {
            score,
            dropout: Dropout::new(POOLING_DROPOUT),
        })
    }

    /// Normalized attention weights [batch_size, seq_len, 1]
    ///
    /// Weights of each sequence sum to one; padding positions get ~0.
    pub fn weights(&self, hidden_states: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mask = attention_mask
            .to_dtype(hidden_states.dtype())?
            .unsqueeze(2)?;

        let scores = self.score.forward(hidden_states)?.relu()?;
        let scores = self.dropout.forward_t(&scores, train)?;

        let padding = ((1.0 - &mask)? * MASKED_SCORE)?;
        let scores = scores.broadcast_mul(&mask)?.broadcast_add(&padding)?;

        Ok(candle_nn::ops::softmax(&scores, 1)?)
    }

    /// Pool hidden states [batch_size, seq_len, hidden_size] -> [batch_size, hidden_size]
    pub fn forward_t(&self, hidden_states: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let weights = self.weights(hidden_states, attention_mask, train)?;
        Ok(hidden_states.broadcast_mul(&weights)?.sum(1)?)
    }
}

/// Mean pooling over non-padding tokens
pub fn mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .unsqueeze(2)?
        .to_dtype(hidden_states.dtype())?;
    let sum = hidden_states.broadcast_mul(&mask)?.sum(1)?;
    let count = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok(sum.broadcast_div(&count)?)
}

/// The active pooling stage of a model
pub enum Pooling {
    Attention(AttentionPooling),
    Mean,
}

impl Pooling {
    /// Build the pooling stage for a strategy
    ///
    /// Only attention pooling registers parameters under `vb`.
    pub fn new(strategy: PoolingStrategy, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        match strategy {
            PoolingStrategy::Attention => Ok(Self::Attention(AttentionPooling::new(hidden_size, vb)?)),
            PoolingStrategy::Mean => Ok(Self::Mean),
        }
    }

    pub fn strategy(&self) -> PoolingStrategy {
        match self {
            Self::Attention(_) => PoolingStrategy::Attention,
            Self::Mean => PoolingStrategy::Mean,
        }
    }

    /// Validate the mask and pool
    pub fn forward_t(&self, hidden_states: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        validate_attention_mask(hidden_states, attention_mask)?;
        match self {
            Self::Attention(pooling) => pooling.forward_t(hidden_states, attention_mask, train),
            Self::Mean => mean_pool(hidden_states, attention_mask),
        }
    }
}
