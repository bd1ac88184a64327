//! Backbone precision selection

use anyhow::Result;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Numeric precision the backbone is loaded in
///
/// Trainable layers on top of the backbone always run in F32; hidden states
/// are upcast before pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    /// bfloat16, for hardware with native bf16 support
    Bf16,
    /// float16, for older accelerators
    F16,
}

impl PrecisionMode {
    /// Pick a mode from a hardware capability flag
    pub fn from_capability(supports_bf16: bool) -> Self {
        if supports_bf16 {
            Self::Bf16
        } else {
            Self::F16
        }
    }

    /// Resolve the mode to load a backbone with on `device`
    ///
    /// Without a request the device capability decides. A bf16 request on a
    /// device without bf16 kernels (the CPU backend) falls back to f16.
    pub fn for_device(requested: Option<Self>, device: &Device) -> Self {
        let supports_bf16 = device.supports_bf16();
        match requested {
            None => Self::from_capability(supports_bf16),
            Some(Self::Bf16) if !supports_bf16 => {
                tracing::warn!("bf16 is not supported on this device, loading the backbone in f16");
                Self::F16
            }
            Some(mode) => mode,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
        }
    }
}

impl std::str::FromStr for PrecisionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f16" | "fp16" | "float16" | "half" => Ok(Self::F16),
            _ => Err(anyhow::anyhow!(
                "Invalid precision: {}. Valid options: bf16, f16",
                s
            )),
        }
    }
}

impl std::fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bf16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_from_str() {
        assert_eq!("bf16".parse::<PrecisionMode>().unwrap(), PrecisionMode::Bf16);
        assert_eq!("half".parse::<PrecisionMode>().unwrap(), PrecisionMode::F16);
        assert!("f32".parse::<PrecisionMode>().is_err());
    }

    #[test]
    fn test_precision_dtype() {
        assert_eq!(PrecisionMode::from_capability(true).dtype(), DType::BF16);
        assert_eq!(PrecisionMode::from_capability(false).dtype(), DType::F16);
    }

    #[test]
    fn test_precision_for_cpu() {
        let cpu = Device::Cpu;
        assert_eq!(PrecisionMode::for_device(None, &cpu), PrecisionMode::F16);
        assert_eq!(PrecisionMode::for_device(Some(PrecisionMode::F16), &cpu), PrecisionMode::F16);
        assert_eq!(PrecisionMode::for_device(Some(PrecisionMode::Bf16), &cpu), PrecisionMode::F16);
    }
}
