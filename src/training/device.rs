//! Device selection for training and inference

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Device preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

#[cfg(feature = "cuda")]
fn try_cuda() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("CUDA initialization failed: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn try_cuda() -> Option<Device> {
    None
}

#[cfg(feature = "metal")]
fn try_metal() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("Metal initialization failed: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "metal"))]
fn try_metal() -> Option<Device> {
    None
}

/// Select device based on preference, falling back to CPU
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let selected = match preference {
        DevicePreference::Cuda => {
            if !cfg!(feature = "cuda") {
                tracing::warn!("CUDA requested but not compiled with 'cuda' feature");
            }
            try_cuda()
        }
        DevicePreference::Metal => {
            if !cfg!(feature = "metal") {
                tracing::warn!("Metal requested but not compiled with 'metal' feature");
            }
            try_metal()
        }
        DevicePreference::Cpu => Some(Device::Cpu),
        DevicePreference::Auto => try_cuda().or_else(try_metal),
    };

    let device = match selected {
        Some(device) => device,
        None => {
            if preference != DevicePreference::Auto {
                tracing::warn!("Falling back to CPU");
            }
            Device::Cpu
        }
    };

    tracing::info!("Selected device: {} (requested: {})", device_name(&device), preference);
    Ok(device)
}

/// Human readable device name
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Availability of every backend, for the `devices` command
pub fn available_devices() -> Vec<(&'static str, String)> {
    let status = |compiled: bool, available: bool, feature: &str| {
        if !compiled {
            format!("not compiled (use --features {})", feature)
        } else if available {
            "available".to_string()
        } else {
            "not available".to_string()
        }
    };

    vec![
        ("CPU", "available".to_string()),
        ("CUDA", status(cfg!(feature = "cuda"), try_cuda().is_some(), "cuda")),
        ("Metal", status(cfg!(feature = "metal"), try_metal().is_some(), "metal")),
    ]
}
