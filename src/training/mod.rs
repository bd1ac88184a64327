//! Regression fine-tuning with Candle
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device abstraction
//! - `precision` - Backbone numeric precision
//! - `hub` - HuggingFace Hub integration
//! - `models` - Backbone, pooling, regression head
//! - `lora` - LoRA adapter over backbone hidden states
//! - `loss` - Regression losses (MSE, MAE, Huber)
//! - `dataset` - Dataset loading and batching
//! - `evaluation` - Regression metrics
//! - `optimizer` - AdamW, clipping, LR schedule
//! - `checkpoint` - Saving and restoring trainable layers
//! - `trainer` - Training loop

pub mod checkpoint;
pub mod dataset;
pub mod device;
pub mod evaluation;
pub mod hub;
pub mod lora;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod precision;
pub mod trainer;

// Re-exports
pub use checkpoint::{load_for_inference, HeadCheckpointConfig, LoadedModel};
pub use dataset::{DatasetConfig, RegressionDataset, RegressionExample};
pub use device::{select_device, DevicePreference};
pub use evaluation::{EvaluationResult, RegressionMetrics};
pub use hub::{HubApi, ModelLoader};
pub use lora::{LoraAdapter, LoraConfig};
pub use loss::RegressionLoss;
pub use models::{
    Backbone, DecoderBackbone, PoolingStrategy, RegressionModel, RegressionModelConfig, RegressionOutput,
    TokenizerWrapper,
};
pub use precision::PrecisionMode;
pub use trainer::{Trainer, TrainingConfig, TrainingResult};
