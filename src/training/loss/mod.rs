//! Loss functions for scalar regression
//!
//! Includes:
//! - Mean squared error
//! - Mean absolute error
//! - Huber loss (quadratic below `delta`, linear above)
//!
//! The loss is picked once when the model is built. Unknown category
//! names are rejected up front instead of falling back to Huber.

use anyhow::{anyhow, ensure, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Default Huber threshold
pub const DEFAULT_HUBER_DELTA: f64 = 1.0;

/// Regression loss selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegressionLoss {
    /// Mean of squared differences
    Mse,
    /// Mean of absolute differences
    Mae,
    /// Huber loss with threshold `delta`
    Huber { delta: f64 },
}

impl Default for RegressionLoss {
    fn default() -> Self {
        Self::Huber {
            delta: DEFAULT_HUBER_DELTA,
        }
    }
}

impl RegressionLoss {
    /// Build a loss from a category name and a Huber threshold
    ///
    /// `delta` is only used (and validated) for the Huber category.
    pub fn from_category(category: &str, delta: f64) -> Result<Self> {
        let loss = match category.parse::<Self>()? {
            Self::Huber { .. } => Self::Huber { delta },
            other => other,
        };
        loss.validate()?;
        Ok(loss)
    }

    /// Check the loss parameters
    pub fn validate(&self) -> Result<()> {
        if let Self::Huber { delta } = self {
            ensure!(
                delta.is_finite() && *delta > 0.0,
                "Huber delta must be a positive finite number, got {}",
                delta
            );
        }
        Ok(())
    }

    /// Compute the mean-reduced loss
    ///
    /// # Arguments
    /// * `preds` - Predictions [batch_size]
    /// * `labels` - Targets [batch_size]
    ///
    /// # Returns
    /// * Loss scalar tensor
    pub fn forward(&self, preds: &Tensor, labels: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mse => mse_loss(preds, labels),
            Self::Mae => mae_loss(preds, labels),
            Self::Huber { delta } => huber_loss(preds, labels, *delta),
        }
    }
}

impl std::str::FromStr for RegressionLoss {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mse" | "l2" => Ok(Self::Mse),
            "mae" | "l1" => Ok(Self::Mae),
            "huber" => Ok(Self::default()),
            _ => Err(anyhow!(
                "Invalid loss category: {}. Valid options: mse, mae, huber",
                s
            )),
        }
    }
}

impl std::fmt::Display for RegressionLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mse => write!(f, "mse"),
            Self::Mae => write!(f, "mae"),
            Self::Huber { delta } => write!(f, "huber(delta={})", delta),
        }
    }
}

fn ensure_same_shape(preds: &Tensor, labels: &Tensor, loss: &str) -> Result<()> {
    ensure!(
        preds.shape() == labels.shape(),
        "{} loss: predictions {:?} and labels {:?} must have the same shape",
        loss,
        preds.shape(),
        labels.shape()
    );
    Ok(())
}

/// Mean squared error
pub fn mse_loss(preds: &Tensor, labels: &Tensor) -> Result<Tensor> {
    ensure_same_shape(preds, labels, "mse")?;
    Ok((preds - labels)?.sqr()?.mean_all()?)
}

/// Mean absolute error
pub fn mae_loss(preds: &Tensor, labels: &Tensor) -> Result<Tensor> {
    ensure_same_shape(preds, labels, "mae")?;
    Ok((preds - labels)?.abs()?.mean_all()?)
}

/// Huber loss, mean-reduced over the batch
///
/// Per element, with `e = pred - label`:
/// ```text
/// 0.5 * e^2                  if |e| <= delta
/// delta * (|e| - 0.5*delta)  otherwise
/// ```
pub fn huber_loss(preds: &Tensor, labels: &Tensor, delta: f64) -> Result<Tensor> {
    ensure_same_shape(preds, labels, "huber")?;
    ensure!(delta > 0.0, "Huber delta must be positive, got {}", delta);

    let abs_error = (preds - labels)?.abs()?;

    // 0.5 * q^2 + delta * (|e| - q) with q = min(|e|, delta) covers both branches
    let quadratic = abs_error.clamp(0f64, delta)?;
    let linear = (&abs_error - &quadratic)?;
    let loss = ((quadratic.sqr()? * 0.5)? + (linear * delta)?)?;

    Ok(loss.mean_all()?)
}
