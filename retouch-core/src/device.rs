use candle_core::utils::{cuda_is_available, metal_is_available};
use serde::{Deserialize, Serialize};

/// Compute target the pipeline is resident on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    #[serde(alias = "gpu")]
    Cuda,
    Metal,
}

serde_plain::derive_display_from_serialize!(DeviceKind);
serde_plain::derive_fromstr_from_deserialize!(DeviceKind);

impl DeviceKind {
    /// Picks CUDA, then Metal, then falls back to the CPU.
    pub fn best_available() -> Self {
        if cuda_is_available() {
            Self::Cuda
        } else if metal_is_available() {
            Self::Metal
        } else {
            Self::Cpu
        }
    }

    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::best_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_names() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("cuda".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda);
        assert_eq!("gpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda);
        assert_eq!("metal".parse::<DeviceKind>().unwrap(), DeviceKind::Metal);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn displays_lowercase() {
        assert_eq!(DeviceKind::Cuda.to_string(), "cuda");
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert!(!DeviceKind::Cpu.is_accelerator());
        assert!(DeviceKind::Metal.is_accelerator());
    }
}
