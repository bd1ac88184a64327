//! Regression model components
//!
//! A pretrained decoder produces per-token hidden states; the trainable
//! layers on top pool them and regress to a bounded scalar.

pub mod common;
pub mod decoder;
pub mod head;
pub mod pooling;
pub mod regression;
pub mod tokenizer;

pub use common::Backbone;
pub use decoder::DecoderBackbone;
pub use head::{last_token, RegressionHead};
pub use pooling::{mean_pool, validate_attention_mask, AttentionPooling, Pooling, PoolingStrategy};
pub use regression::{RegressionModel, RegressionModelConfig, RegressionOutput};
pub use tokenizer::{BatchEncodedInput, TokenizerWrapper, DEFAULT_MAX_LENGTH};
