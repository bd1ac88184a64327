//! # RustRegressionLab (rreg)
//!
//! Scalar regression on top of pretrained causal language models.
//!
//! ## Overview
//!
//! A frozen decoder backbone turns text into per-token hidden states. A small
//! trainable stack on top predicts one bounded value per text:
//!
//! - optional LoRA adapter over the hidden states
//! - attention pooling (or mean pooling) over non-padding tokens
//! - a feed-forward head over `[pooled ; last token]` ending in a sigmoid
//! - MSE, MAE or Huber loss
//!
//! ## Architecture
//!
//! - `training` - models, losses, data, optimizer and training loop (Candle)
//! - `cli` - Command-line interface

pub mod cli;
pub mod training;

// Re-export commonly used types
pub use anyhow::{Error, Result};
