//! `Kernel` section.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{enabled, hex_bytes};
use crate::errors::ConfigError;
use crate::patcher::Pattern;

/// Darwin kernel version, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DarwinVersion {
    #[allow(missing_docs)]
    pub major: u8,
    #[allow(missing_docs)]
    pub minor: u8,
    #[allow(missing_docs)]
    pub patch: u8,
}

impl DarwinVersion {
    /// Build from components.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for DarwinVersion {
    type Err = ();

    /// Missing trailing components read as zero: `20` is `20.0.0`.
    fn from_str(s: &str) -> Result<Self, ()> {
        let mut parts = [0u8; 3];
        let mut count = 0;
        for part in s.split('.') {
            if count == parts.len() {
                return Err(());
            }
            parts[count] = part.parse().map_err(|_| ())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for DarwinVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for DarwinVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DarwinVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map_err(|_| serde::de::Error::custom(format!("`{text}` is not a kernel version")))
    }
}

/// Inclusive kernel version range; a missing bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelRange {
    /// Oldest kernel the entry applies to
    pub min_kernel: Option<DarwinVersion>,
    /// Newest kernel the entry applies to
    pub max_kernel: Option<DarwinVersion>,
}

impl KernelRange {
    /// Whether `version` falls inside the range.
    pub fn contains(&self, version: DarwinVersion) -> bool {
        self.min_kernel.map_or(true, |min| version >= min)
            && self.max_kernel.map_or(true, |max| version <= max)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        match (self.min_kernel, self.max_kernel) {
            (Some(min), Some(max)) if min > max => Err(ConfigError::invalid(
                field,
                format!("MinKernel {min} is newer than MaxKernel {max}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Kernel extension to inject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct KextAdd {
    /// Bundle directory relative to `Kexts`, e.g. `Lilu.kext`
    pub bundle_path: String,
    /// Binary inside the bundle; empty for plist-only kexts
    #[serde(default)]
    pub executable_path: String,
    /// Info.plist inside the bundle
    pub plist_path: String,
    /// Oldest kernel the entry applies to
    #[serde(default)]
    pub min_kernel: Option<DarwinVersion>,
    /// Newest kernel the entry applies to
    #[serde(default)]
    pub max_kernel: Option<DarwinVersion>,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Kernel extension to prevent from loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct KextBlock {
    /// Bundle identifier
    pub identifier: String,
    /// Oldest kernel the entry applies to
    #[serde(default)]
    pub min_kernel: Option<DarwinVersion>,
    /// Newest kernel the entry applies to
    #[serde(default)]
    pub max_kernel: Option<DarwinVersion>,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Binary patch of the kernel or a kext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct KernelPatch {
    /// `kernel` or a kext bundle identifier
    pub identifier: String,
    #[allow(missing_docs)]
    #[serde(with = "hex_bytes")]
    pub find: Vec<u8>,
    #[allow(missing_docs)]
    #[serde(with = "hex_bytes")]
    pub replace: Vec<u8>,
    #[allow(missing_docs)]
    #[serde(with = "hex_bytes", default)]
    pub mask: Vec<u8>,
    #[allow(missing_docs)]
    #[serde(with = "hex_bytes", default)]
    pub replace_mask: Vec<u8>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub count: u32,
    #[allow(missing_docs)]
    #[serde(default)]
    pub skip: u32,
    #[allow(missing_docs)]
    #[serde(default)]
    pub limit: u32,
    /// Oldest kernel the entry applies to
    #[serde(default)]
    pub min_kernel: Option<DarwinVersion>,
    /// Newest kernel the entry applies to
    #[serde(default)]
    pub max_kernel: Option<DarwinVersion>,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

macro_rules! kernel_range {
    ($($ty:ty),*) => {$(
        impl $ty {
            /// Kernel versions the entry applies to.
            pub fn range(&self) -> KernelRange {
                KernelRange {
                    min_kernel: self.min_kernel,
                    max_kernel: self.max_kernel,
                }
            }
        }
    )*};
}

kernel_range!(KextAdd, KextBlock, KernelPatch);

impl KernelPatch {
    /// Matching parameters of this patch.
    pub fn pattern(&self) -> Pattern<'_> {
        Pattern {
            find: &self.find,
            replace: &self.replace,
            mask: &self.mask,
            replace_mask: &self.replace_mask,
            count: self.count,
            skip: self.skip,
            limit: self.limit,
        }
    }
}

/// CPUID spoofing for unsupported Intel processors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct KernelEmulate {
    /// Replacement CPUID leaf 1 EAX..EDX, 16 bytes or empty
    #[serde(with = "hex_bytes")]
    pub cpuid1_data: Vec<u8>,
    /// Bits of `cpuid1_data` to apply, 16 bytes or empty
    #[serde(with = "hex_bytes")]
    pub cpuid1_mask: Vec<u8>,
    /// Pretend power management is present
    pub dummy_power_management: bool,
}

/// Built-in kernel fixups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
#[allow(missing_docs)]
pub struct KernelQuirks {
    pub apple_cpu_pm_cfg_lock: bool,
    pub apple_xcpm_cfg_lock: bool,
    pub disable_io_mapper: bool,
    pub disable_rtc_checksum: bool,
    pub lapic_kernel_panic: bool,
    pub panic_no_kext_dump: bool,
    pub power_timeout_kernel_panic: bool,
    pub provide_current_cpu_info: bool,
    pub xhci_port_limit: bool,
}

/// `Kernel` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
#[allow(missing_docs)]
pub struct KernelConfig {
    pub add: Vec<KextAdd>,
    pub block: Vec<KextBlock>,
    pub patch: Vec<KernelPatch>,
    pub emulate: KernelEmulate,
    pub quirks: KernelQuirks,
}

impl KernelConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (index, kext) in self.add.iter().enumerate() {
            let field = format!("Kernel.Add[{index}]");
            if !kext.bundle_path.to_ascii_lowercase().ends_with(".kext") {
                return Err(ConfigError::invalid(field, "BundlePath must name a .kext bundle"));
            }
            if kext.plist_path.is_empty() {
                return Err(ConfigError::invalid(field, "PlistPath is empty"));
            }
            kext.range().validate(&field)?;
        }
        for (index, block) in self.block.iter().enumerate() {
            block.range().validate(&format!("Kernel.Block[{index}]"))?;
        }
        for (index, patch) in self.patch.iter().enumerate() {
            let field = format!("Kernel.Patch[{index}]");
            if patch.identifier.is_empty() {
                return Err(ConfigError::invalid(field, "Identifier is empty"));
            }
            patch
                .pattern()
                .check()
                .map_err(|reason| ConfigError::invalid(field.as_str(), reason))?;
            patch.range().validate(&field)?;
        }
        for (name, bytes) in [
            ("Kernel.Emulate.Cpuid1Data", &self.emulate.cpuid1_data),
            ("Kernel.Emulate.Cpuid1Mask", &self.emulate.cpuid1_mask),
        ] {
            if !bytes.is_empty() && bytes.len() != 16 {
                return Err(ConfigError::invalid(name, "must be empty or 16 bytes"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darwin_versions() {
        assert_eq!("20".parse::<DarwinVersion>(), Ok(DarwinVersion::new(20, 0, 0)));
        assert_eq!("19.6.1".parse::<DarwinVersion>(), Ok(DarwinVersion::new(19, 6, 1)));
        assert!("1.2.3.4".parse::<DarwinVersion>().is_err());
        assert!("x".parse::<DarwinVersion>().is_err());
    }

    #[test]
    fn range_is_inclusive_and_open_ended() {
        let range = KernelRange {
            min_kernel: Some(DarwinVersion::new(19, 0, 0)),
            max_kernel: None,
        };
        assert!(range.contains(DarwinVersion::new(19, 0, 0)));
        assert!(range.contains(DarwinVersion::new(23, 1, 0)));
        assert!(!range.contains(DarwinVersion::new(18, 7, 0)));
        assert!(KernelRange::default().contains(DarwinVersion::new(1, 0, 0)));
    }

    #[test]
    fn parses_kext_with_range() {
        let doc = br#"{"Add": [{"BundlePath": "Lilu.kext", "ExecutablePath": "Contents/MacOS/Lilu",
                       "PlistPath": "Contents/Info.plist", "MinKernel": "12.0.0"}]}"#;
        let kernel: KernelConfig = serde_json::from_slice(doc).unwrap();
        assert_eq!(kernel.add[0].min_kernel, Some(DarwinVersion::new(12, 0, 0)));
        assert!(kernel.validate().is_ok());
    }

    #[test]
    fn inverted_range_is_invalid() {
        let doc = br#"{"Block": [{"Identifier": "com.apple.iokit.IOSkywalkFamily",
                       "MinKernel": "23.0.0", "MaxKernel": "20.0.0"}]}"#;
        let kernel: KernelConfig = serde_json::from_slice(doc).unwrap();
        assert!(matches!(kernel.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn cpuid_data_must_be_sixteen_bytes() {
        let kernel = KernelConfig {
            emulate: KernelEmulate {
                cpuid1_data: alloc::vec![0; 4],
                ..KernelEmulate::default()
            },
            ..KernelConfig::default()
        };
        assert!(kernel.validate().is_err());
    }
}
