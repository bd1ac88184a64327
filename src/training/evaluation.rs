//! Evaluation utilities for regression models
//!
//! Metrics are computed on host values after batched inference.

use anyhow::{ensure, Result};
use candle_core::Tensor;

use super::dataset::{Batched, RegressionDataset};
use super::models::{RegressionModel, TokenizerWrapper};

/// Regression metrics over a set of predictions
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct RegressionMetrics {
    /// Number of evaluated examples
    pub count: usize,
    /// Mean squared error
    pub mse: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Root mean squared error
    pub rmse: f64,
    /// Pearson correlation (0 when either side is constant)
    pub pearson: f64,
    /// Coefficient of determination (0 when labels are constant)
    pub r2: f64,
}

impl RegressionMetrics {
    /// Compute metrics from paired predictions and labels
    pub fn compute(predictions: &[f32], labels: &[f32]) -> Result<Self> {
        ensure!(
            predictions.len() == labels.len(),
            "Got {} predictions for {} labels",
            predictions.len(),
            labels.len()
        );
        if predictions.is_empty() {
            return Ok(Self::default());
        }

        let n = predictions.len() as f64;
        let pairs = || predictions.iter().zip(labels).map(|(&p, &l)| (p as f64, l as f64));

        let mse = pairs().map(|(p, l)| (p - l).powi(2)).sum::<f64>() / n;
        let mae = pairs().map(|(p, l)| (p - l).abs()).sum::<f64>() / n;

        let pred_mean = pairs().map(|(p, _)| p).sum::<f64>() / n;
        let label_mean = pairs().map(|(_, l)| l).sum::<f64>() / n;

        let mut cov = 0.0;
        let mut pred_var = 0.0;
        let mut label_var = 0.0;
        for (p, l) in pairs() {
            cov += (p - pred_mean) * (l - label_mean);
            pred_var += (p - pred_mean).powi(2);
            label_var += (l - label_mean).powi(2);
        }

        let pearson = if pred_var > 0.0 && label_var > 0.0 {
            cov / (pred_var.sqrt() * label_var.sqrt())
        } else {
            0.0
        };
        let r2 = if label_var > 0.0 {
            1.0 - (mse * n) / label_var
        } else {
            0.0
        };

        Ok(Self {
            count: predictions.len(),
            mse,
            mae,
            rmse: mse.sqrt(),
            pearson,
            r2,
        })
    }
}

impl std::fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MSE: {:.5} | MAE: {:.5} | RMSE: {:.5} | Pearson: {:.4} | R²: {:.4} (n={})",
            self.mse, self.mae, self.rmse, self.pearson, self.r2, self.count
        )
    }
}

/// Result of evaluating a model on a labeled dataset
#[derive(Debug, Clone, Copy)]
pub struct EvaluationResult {
    /// Example-weighted mean of the training loss
    pub loss: f64,
    pub metrics: RegressionMetrics,
}

/// Run the model over a labeled dataset in inference mode
pub fn evaluate_model(
    model: &RegressionModel,
    tokenizer: &TokenizerWrapper,
    dataset: &RegressionDataset,
    batch_size: usize,
) -> Result<EvaluationResult> {
    let mut predictions = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    let mut loss_sum = 0.0;

    for (i, batch) in dataset.batches(batch_size).enumerate() {
        let batch_labels = batch.labels()?;
        let (input_ids, attention_mask) = tokenizer.encode_to_tensors(&batch.texts(), model.device())?;
        let label_tensor = Tensor::new(batch_labels.as_slice(), model.device())?;

        let output = model.forward(&input_ids, &attention_mask, Some(&label_tensor), false)?;
        if let Some(loss) = output.loss {
            loss_sum += loss.to_scalar::<f32>()? as f64 * batch.len() as f64;
        }

        predictions.extend(output.logits.to_vec1::<f32>()?);
        labels.extend(batch_labels);

        if (i + 1) % 50 == 0 {
            tracing::debug!("Evaluated {}/{} examples", labels.len(), dataset.len());
        }
    }

    let metrics = RegressionMetrics::compute(&predictions, &labels)?;
    let loss = if labels.is_empty() {
        0.0
    } else {
        loss_sum / labels.len() as f64
    };

    Ok(EvaluationResult { loss, metrics })
}

/// Predictions for every example of a dataset, in dataset order
pub fn predict_dataset(
    model: &RegressionModel,
    tokenizer: &TokenizerWrapper,
    dataset: &RegressionDataset,
    batch_size: usize,
) -> Result<Vec<f32>> {
    let mut predictions = Vec::with_capacity(dataset.len());
    for batch in dataset.batches(batch_size) {
        let (input_ids, attention_mask) = tokenizer.encode_to_tensors(&batch.texts(), model.device())?;
        predictions.extend(model.predict(&input_ids, &attention_mask)?);
    }
    Ok(predictions)
}
