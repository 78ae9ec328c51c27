//! `PlatformInfo` section.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Identity overrides shared by every reporting interface.
///
/// Zero and empty values are not overrides; they fall back to detected data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct GenericIdentity {
    /// Product name, e.g. `iMac19,1`
    pub system_product_name: String,
    /// System serial number
    pub system_serial_number: String,
    /// System UUID in GUID text form
    #[serde(rename = "SystemUUID")]
    pub system_uuid: String,
    /// Main logic board serial
    #[serde(rename = "MLB")]
    pub mlb: String,
    /// Board identifier
    pub board_id: String,
    /// SMBIOS processor type; 0 derives it from the CPU
    pub processor_type: u16,
    /// Hide the memory slot table
    pub spoof_vendor: bool,
}

/// One populated or empty memory slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MemoryDevice {
    /// Slot label
    pub device_locator: String,
    /// Bank label
    #[serde(default)]
    pub bank_locator: String,
    /// Size in MiB; 0 for an empty slot
    #[serde(default)]
    pub size: u32,
    /// Speed in MT/s
    #[serde(default)]
    pub speed: u32,
    #[allow(missing_docs)]
    #[serde(default)]
    pub manufacturer: String,
}

/// Memory topology hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct MemoryConfig {
    /// Form factor code
    pub form_factor: u8,
    /// Memory type code
    pub memory_type: u8,
    /// Slots
    pub devices: Vec<MemoryDevice>,
}

/// `PlatformInfo` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct PlatformInfoConfig {
    /// Use `Generic` for every interface instead of per-interface data
    pub automatic: bool,
    /// Publish through DataHub
    pub update_data_hub: bool,
    /// Publish through SMBIOS
    #[serde(rename = "UpdateSMBIOS")]
    pub update_smbios: bool,
    #[allow(missing_docs)]
    pub generic: GenericIdentity,
    /// Replace the memory table
    pub custom_memory: bool,
    #[allow(missing_docs)]
    pub memory: MemoryConfig,
}

impl Default for PlatformInfoConfig {
    fn default() -> Self {
        Self {
            automatic: true,
            update_data_hub: false,
            update_smbios: true,
            generic: GenericIdentity::default(),
            custom_memory: false,
            memory: MemoryConfig::default(),
        }
    }
}

impl PlatformInfoConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let uuid = &self.generic.system_uuid;
        if !uuid.is_empty() && uuid.parse::<crate::guid::Guid>().is_err() {
            return Err(ConfigError::invalid(
                "PlatformInfo.Generic.SystemUUID",
                format!("`{uuid}` is not a UUID"),
            ));
        }
        if self.custom_memory {
            for (index, device) in self.memory.devices.iter().enumerate() {
                if device.device_locator.is_empty() {
                    return Err(ConfigError::invalid(
                        format!("PlatformInfo.Memory.Devices[{index}].DeviceLocator"),
                        "is empty",
                    ));
                }
            }
        }
        Ok(())
    }
}
