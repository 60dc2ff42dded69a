//! Element types and devices.
//!
//! Tensors store `f32` values but every value is kept representable in
//! the tensor's [`DType`]: construction and casts round through
//! `half::f16`, `half::bf16`, or a saturating `i8`.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 16-bit float (IEEE 754 half-precision)
    F16,
    /// Brain float 16
    BF16,
    /// Signed 8-bit integer
    I8,
}

impl DType {
    /// Bytes per element.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 => 1,
        }
    }

    /// Whether this is a floating-point type.
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Short label used in benchmark tables and checkpoint metadata.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::I8 => "int8",
        }
    }

    /// Round a value to the nearest representable value of this dtype.
    ///
    /// Integer conversion rounds half away from zero and saturates.
    #[must_use]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::F32 => value,
            Self::F16 => f16::from_f32(value).to_f32(),
            Self::BF16 => bf16::from_f32(value).to_f32(),
            Self::I8 => {
                if value.is_nan() {
                    0.0
                } else {
                    value.round().clamp(f32::from(i8::MIN), f32::from(i8::MAX))
                }
            }
        }
    }

    /// Round every value of a slice in place.
    pub fn round_slice(self, values: &mut [f32]) {
        if self == Self::F32 {
            return;
        }
        for v in values {
            *v = self.round(*v);
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a tensor lives and which kernels run on it.
///
/// `Accelerator` is the host backend that executes the 2:4 compressed
/// kernels and runs dense kernels row-parallel on the rayon pool. `Cpu`
/// runs dense kernels serially and cannot host compressed tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    /// Serial reference device
    #[default]
    Cpu,
    /// Parallel device with semi-structured sparse support
    Accelerator,
}

impl Device {
    /// Whether 2:4 compressed tensors can live on this device.
    #[must_use]
    pub const fn supports_semi_structured(self) -> bool {
        matches!(self, Self::Accelerator)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator => f.write_str("accelerator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_rounding_is_lossy_but_stable() {
        let v = DType::F16.round(0.1);
        assert_ne!(v, 0.1);
        assert_eq!(DType::F16.round(v), v);
    }

    #[test]
    fn test_i8_saturates() {
        assert_eq!(DType::I8.round(300.0), 127.0);
        assert_eq!(DType::I8.round(-300.0), -128.0);
        assert_eq!(DType::I8.round(2.5), 3.0);
        assert_eq!(DType::I8.round(f32::NAN), 0.0);
    }

    #[test]
    fn test_floating_point_classification() {
        assert!(DType::F16.is_floating_point());
        assert!(DType::BF16.is_floating_point());
        assert!(!DType::I8.is_floating_point());
    }

    #[test]
    fn test_only_accelerator_hosts_semi_structured() {
        assert!(Device::Accelerator.supports_semi_structured());
        assert!(!Device::Cpu.supports_semi_structured());
    }
}
