//! Processor descriptor consumed by the kernel, platform and UEFI stages.
//!
//! Detection happens before the pipeline starts; this module only describes
//! the snapshot and the predicates stages use to gate CPU-specific work.

use alloc::string::String;

use serde::{Deserialize, Serialize};

/// Processor vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuVendor {
    /// GenuineIntel
    Intel,
    /// AuthenticAMD
    Amd,
    /// Anything else
    Other,
}

/// Intel core generation, ordered oldest first.
///
/// Non-Intel processors report [`CpuGeneration::Unknown`], which sorts before
/// every known generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CpuGeneration {
    #[allow(missing_docs)]
    Unknown,
    #[allow(missing_docs)]
    Penryn,
    #[allow(missing_docs)]
    Nehalem,
    #[allow(missing_docs)]
    Westmere,
    #[allow(missing_docs)]
    SandyBridge,
    #[allow(missing_docs)]
    IvyBridge,
    #[allow(missing_docs)]
    Haswell,
    #[allow(missing_docs)]
    Broadwell,
    #[allow(missing_docs)]
    Skylake,
    #[allow(missing_docs)]
    KabyLake,
    #[allow(missing_docs)]
    CoffeeLake,
    #[allow(missing_docs)]
    CometLake,
    #[allow(missing_docs)]
    IceLake,
    #[allow(missing_docs)]
    AlderLake,
}

impl CpuGeneration {
    /// Map a family 6 display model to its generation.
    pub fn from_intel_model(family: u8, model: u8) -> Self {
        if family != 6 {
            return CpuGeneration::Unknown;
        }
        match model {
            0x17 | 0x1D => CpuGeneration::Penryn,
            0x1A | 0x1E | 0x1F | 0x2E => CpuGeneration::Nehalem,
            0x25 | 0x2C | 0x2F => CpuGeneration::Westmere,
            0x2A | 0x2D => CpuGeneration::SandyBridge,
            0x3A | 0x3E => CpuGeneration::IvyBridge,
            0x3C | 0x3F | 0x45 | 0x46 => CpuGeneration::Haswell,
            0x3D | 0x47 | 0x4F | 0x56 => CpuGeneration::Broadwell,
            0x4E | 0x5E | 0x55 => CpuGeneration::Skylake,
            0x8E | 0x9E => CpuGeneration::KabyLake,
            0xA5 | 0xA6 => CpuGeneration::CometLake,
            0x7D | 0x7E | 0x6A | 0x6C => CpuGeneration::IceLake,
            0x97 | 0x9A | 0xB7 | 0xBA | 0xBF => CpuGeneration::AlderLake,
            _ => CpuGeneration::Unknown,
        }
    }
}

/// Immutable processor snapshot taken once before the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuDescriptor {
    /// Vendor
    pub vendor: CpuVendor,
    /// Brand string as reported by CPUID
    pub brand: String,
    /// Display family
    pub family: u8,
    /// Display model
    pub model: u8,
    /// Stepping
    pub stepping: u8,
    /// Core generation
    pub generation: CpuGeneration,
    /// Physical cores in the package
    pub core_count: u16,
    /// Logical threads in the package
    pub thread_count: u16,
    /// Time-stamp counter frequency in Hz
    pub tsc_frequency: u64,
    /// Front side bus frequency in Hz
    pub fsb_frequency: u64,
    /// Raw CPUID leaf 1 EAX..EDX
    pub cpuid1: [u32; 4],
}

impl CpuDescriptor {
    /// Placeholder descriptor for an unidentified processor.
    pub fn unknown() -> Self {
        Self {
            vendor: CpuVendor::Other,
            brand: String::new(),
            family: 0,
            model: 0,
            stepping: 0,
            generation: CpuGeneration::Unknown,
            core_count: 1,
            thread_count: 1,
            tsc_frequency: 0,
            fsb_frequency: 0,
            cpuid1: [0; 4],
        }
    }

    /// Whether this is an Intel processor.
    pub fn is_intel(&self) -> bool {
        self.vendor == CpuVendor::Intel
    }

    /// SMBIOS processor type code derived from generation and core count.
    pub fn processor_type(&self) -> u16 {
        if !self.is_intel() {
            return 0x0F01;
        }
        let base = match self.generation {
            CpuGeneration::Unknown | CpuGeneration::Penryn => return 0x0301,
            CpuGeneration::Nehalem | CpuGeneration::Westmere | CpuGeneration::SandyBridge => 0x0600,
            _ => 0x0700,
        };
        match self.core_count {
            0..=2 => base + 0x01,
            3..=4 => base + 0x05,
            _ => base + 0x09,
        }
    }
}

/// CPU gate attached to kernel and UEFI quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRequirement {
    /// Required vendor, if any
    pub vendor: Option<CpuVendor>,
    /// Oldest generation the quirk applies to
    pub min: Option<CpuGeneration>,
    /// Newest generation the quirk applies to
    pub max: Option<CpuGeneration>,
}

impl CpuRequirement {
    /// Applies to every processor.
    pub const ANY: Self = Self {
        vendor: None,
        min: None,
        max: None,
    };

    /// Applies to Intel processors only.
    pub const INTEL: Self = Self {
        vendor: Some(CpuVendor::Intel),
        min: None,
        max: None,
    };

    /// Applies to AMD processors only.
    pub const AMD: Self = Self {
        vendor: Some(CpuVendor::Amd),
        min: None,
        max: None,
    };

    /// Restrict to generations in `min..=max`.
    pub const fn generations(self, min: Option<CpuGeneration>, max: Option<CpuGeneration>) -> Self {
        Self { min, max, ..self }
    }

    /// Whether `cpu` satisfies this gate.
    pub fn matches(&self, cpu: &CpuDescriptor) -> bool {
        if let Some(vendor) = self.vendor {
            if cpu.vendor != vendor {
                return false;
            }
        }
        if let Some(min) = self.min {
            if cpu.generation < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if cpu.generation > max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intel(generation: CpuGeneration) -> CpuDescriptor {
        CpuDescriptor {
            vendor: CpuVendor::Intel,
            generation,
            core_count: 4,
            thread_count: 8,
            ..CpuDescriptor::unknown()
        }
    }

    #[test]
    fn generation_mapping() {
        assert_eq!(CpuGeneration::from_intel_model(6, 0x9E), CpuGeneration::KabyLake);
        assert_eq!(CpuGeneration::from_intel_model(6, 0x3C), CpuGeneration::Haswell);
        assert_eq!(CpuGeneration::from_intel_model(15, 0x3C), CpuGeneration::Unknown);
        assert!(CpuGeneration::Haswell < CpuGeneration::Skylake);
    }

    #[test]
    fn requirement_gates_vendor_and_range() {
        let haswell_and_older =
            CpuRequirement::INTEL.generations(None, Some(CpuGeneration::Haswell));
        assert!(haswell_and_older.matches(&intel(CpuGeneration::IvyBridge)));
        assert!(haswell_and_older.matches(&intel(CpuGeneration::Haswell)));
        assert!(!haswell_and_older.matches(&intel(CpuGeneration::Skylake)));

        let amd = CpuDescriptor {
            vendor: CpuVendor::Amd,
            ..CpuDescriptor::unknown()
        };
        assert!(!CpuRequirement::INTEL.matches(&amd));
        assert!(CpuRequirement::AMD.matches(&amd));
        assert!(CpuRequirement::ANY.matches(&amd));
    }

    #[test]
    fn processor_type_scales_with_cores() {
        assert_eq!(intel(CpuGeneration::Skylake).processor_type(), 0x0705);
        let dual = CpuDescriptor {
            core_count: 2,
            ..intel(CpuGeneration::SandyBridge)
        };
        assert_eq!(dual.processor_type(), 0x0601);
        assert_eq!(CpuDescriptor::unknown().processor_type(), 0x0F01);
    }
}
