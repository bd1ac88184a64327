//! Feed-forward regression head
//!
//! Maps `[pooled ; last_token]` (2 * hidden_size) to a scalar in (0, 1):
//!
//! ```text
//! Linear(2h, h) -> ReLU -> Dropout(0.1) -> Linear(h, 1) -> Sigmoid
//! ```

use anyhow::{ensure, Result};
use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};

/// Dropout between the two projections during training
pub const HEAD_DROPOUT: f32 = 0.1;

/// Distance kept from 0 and 1; an f32 sigmoid saturates to exactly 0 or 1
/// once its input exceeds roughly 17 in magnitude.
pub const PREDICTION_MARGIN: f32 = f32::EPSILON;

/// Hidden state at the final sequence position
///
/// The position is taken literally (`seq_len - 1`), so inputs must be
/// right-padded for it to be meaningful.
pub fn last_token(hidden_states: &Tensor) -> Result<Tensor> {
    let seq_len = hidden_states.dim(1)?;
    ensure!(seq_len > 0, "Cannot select the last token of an empty sequence");
    Ok(hidden_states.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
}

/// Regression head over pooled and last-token features
pub struct RegressionHead {
    dense: Linear,
    dropout: Dropout,
    out: Linear,
    hidden_size: usize,
}

impl RegressionHead {
    /// Create a new head for a backbone with `hidden_size` features
    pub fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let dense = candle_nn::linear(hidden_size * 2, hidden_size, vb.pp("dense"))?;
        let out = candle_nn::linear(hidden_size, 1, vb.pp("out"))?;

        Ok(Self {
            dense,
            dropout: Dropout::new(HEAD_DROPOUT),
            out,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Number of parameters in the head
    pub fn num_params(&self) -> usize {
        let h = self.hidden_size;
        (2 * h * h + h) + (h + 1)
    }

    /// Predict from pooled [batch, hidden] and last-token [batch, hidden] vectors
    ///
    /// # Returns
    /// * Predictions [batch_size] in (0, 1)
    pub fn forward_t(&self, pooled: &Tensor, last_token: &Tensor, train: bool) -> Result<Tensor> {
        ensure!(
            pooled.dims() == last_token.dims(),
            "Pooled {:?} and last-token {:?} features must have the same shape",
            pooled.dims(),
            last_token.dims()
        );
        let features = Tensor::cat(&[pooled, last_token], D::Minus1)?;
        self.forward_features(&features, train)
    }

    /// Predict from already concatenated features [batch, 2 * hidden]
    ///
    /// The sigmoid output is clamped to
    /// `[PREDICTION_MARGIN, 1 - PREDICTION_MARGIN]`, so predictions stay
    /// strictly inside (0, 1) even when it saturates.
    pub fn forward_features(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dense.forward(features)?.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let xs = self.out.forward(&xs)?;
        let preds = candle_nn::ops::sigmoid(&xs)?.clamp(PREDICTION_MARGIN, 1.0 - PREDICTION_MARGIN)?;
        Ok(preds.squeeze(D::Minus1)?)
    }
}
