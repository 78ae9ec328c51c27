//! Configuration tree.
//!
//! `config.json` is deserialized in one step and then validated as a whole;
//! a tree handed to the stages is always fully validated. Keys are
//! PascalCase, unknown keys are rejected and byte blobs are hex strings.
//!
//! A missing subsystem section disables its stage. `Misc` is always present
//! and defaults to an unattended boot of the first entry.

pub mod acpi;
pub mod device_properties;
pub mod kernel;
pub mod misc;
pub mod nvram;
pub mod platform;
pub mod uefi;

use alloc::string::ToString;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub use acpi::AcpiConfig;
pub use device_properties::DevicePropertiesConfig;
pub use kernel::KernelConfig;
pub use misc::{MiscConfig, VaultPolicy};
pub use nvram::NvramConfig;
pub use platform::PlatformInfoConfig;
pub use uefi::UefiConfig;

/// Validated configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// ACPI table directives
    #[serde(rename = "ACPI", default)]
    pub acpi: Option<AcpiConfig>,
    /// Device property injection
    #[serde(default)]
    pub device_properties: Option<DevicePropertiesConfig>,
    /// Kernel patching
    #[serde(default)]
    pub kernel: Option<KernelConfig>,
    /// Boot, security and debug settings
    #[serde(default)]
    pub misc: MiscConfig,
    /// NVRAM variables
    #[serde(rename = "NVRAM", default)]
    pub nvram: Option<NvramConfig>,
    /// Platform identity
    #[serde(default)]
    pub platform_info: Option<PlatformInfoConfig>,
    /// Drivers, protocols and firmware quirks
    #[serde(rename = "UEFI", default)]
    pub uefi: Option<UefiConfig>,
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_slice(bytes).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(acpi) = &self.acpi {
            acpi.validate()?;
        }
        if let Some(kernel) = &self.kernel {
            kernel.validate()?;
        }
        self.misc.validate()?;
        if let Some(platform) = &self.platform_info {
            platform.validate()?;
        }
        if let Some(uefi) = &self.uefi {
            uefi.validate()?;
        }
        Ok(())
    }
}

fn enabled() -> bool {
    true
}

/// Hex string <-> byte vector.
pub(crate) mod hex_bytes {
    use alloc::string::String;
    use alloc::vec::Vec;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}
