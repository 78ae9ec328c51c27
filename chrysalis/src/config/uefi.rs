//! `UEFI` section.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::enabled;
use super::misc::parse_resolution;
use crate::errors::ConfigError;

/// Driver image in the `Drivers` directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct UefiDriver {
    /// Image relative to `Drivers`
    pub path: String,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    /// Failure to load or start abandons the boot attempt
    #[serde(default)]
    pub required: bool,
    /// Load options passed to the driver
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// `UEFI.Input`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct InputConfig {
    /// Timer period in 100 ns units; 0 keeps the firmware value
    pub timer_resolution: u32,
    /// Provide keyboard input through the picker's own driver
    pub key_support: bool,
    /// Provide pointer input
    pub pointer_support: bool,
}

/// `UEFI.Output`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct OutputConfig {
    /// Reconnect consoles after a resolution change
    pub reconnect_on_res_change: bool,
    /// Install a console GOP when firmware lacks one
    pub provide_console_gop: bool,
    /// `Max`, `<width>x<height>` or empty
    pub resolution: String,
    /// Set the resolution even when firmware refuses the mode
    pub force_resolution: bool,
    /// Clear the screen on every mode switch
    pub clear_screen_on_mode_switch: bool,
}

/// `UEFI.ProtocolOverrides`: reinstall protocols with built-in versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
#[allow(missing_docs)]
pub struct ProtocolOverrides {
    pub apple_boot_policy: bool,
    pub console_control: bool,
    pub data_hub: bool,
    pub device_properties: bool,
    pub firmware_volume: bool,
    pub hash_services: bool,
    pub unicode_collation: bool,
}

/// Page granularity of firmware memory allocations.
pub const PAGE_SIZE: u64 = 0x1000;

/// Memory type a reserved region is reported as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ReservedMemoryType {
    #[default]
    Reserved,
    RuntimeCode,
    RuntimeData,
    #[serde(rename = "ACPIReclaimMemory")]
    AcpiReclaimMemory,
    #[serde(rename = "ACPIMemoryNVS")]
    AcpiMemoryNvs,
    MemoryMappedIO,
    UnusableMemory,
    Persistent,
}

/// `UEFI.ReservedMemory` entry: a physical range firmware must not allocate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ReservedMemory {
    /// Physical start, page aligned
    pub address: u64,
    /// Length in bytes, page aligned
    pub size: u64,
    #[serde(rename = "Type", default)]
    #[allow(missing_docs)]
    pub kind: ReservedMemoryType,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

impl ReservedMemory {
    /// End of the range, or `None` when it wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.size)
    }
}

/// `UEFI.Quirks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct UefiQuirksConfig {
    /// Microseconds to wait after ExitBootServices
    pub exit_boot_services_delay: u32,
    /// Ignore an invalid flex ratio MSR (Intel only)
    pub ignore_invalid_flex_ratio: bool,
    /// Take USB controllers away from the firmware
    pub release_usb_ownership: bool,
    /// Keep boot variables under the vendor GUID
    pub request_boot_var_routing: bool,
    /// Allow connecting file system drivers blocked by firmware
    pub unblock_fs_connect: bool,
    /// Report a newer UEFI revision
    pub forge_uefi_support: bool,
    /// Load option ROMs of PCI devices again
    pub reload_option_roms: bool,
    /// Timeout in microseconds for TSC synchronization; 0 disables it
    pub tsc_sync_timeout: u32,
}

/// `UEFI` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
#[allow(missing_docs)]
pub struct UefiConfig {
    /// Connect every controller after loading drivers
    pub connect_drivers: bool,
    pub drivers: Vec<UefiDriver>,
    pub input: InputConfig,
    pub output: OutputConfig,
    pub protocol_overrides: ProtocolOverrides,
    pub quirks: UefiQuirksConfig,
    pub reserved_memory: Vec<ReservedMemory>,
}

impl UefiConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (index, driver) in self.drivers.iter().enumerate() {
            if !driver.path.to_ascii_lowercase().ends_with(".efi") {
                return Err(ConfigError::invalid(
                    format!("UEFI.Drivers[{index}].Path"),
                    format!("`{}` is not an .efi image", driver.path),
                ));
            }
        }
        for (index, region) in self.reserved_memory.iter().enumerate() {
            let reason = if region.size == 0 {
                Some("size is zero")
            } else if region.address % PAGE_SIZE != 0 || region.size % PAGE_SIZE != 0 {
                Some("address and size must be page aligned")
            } else if region.end().is_none() {
                Some("range wraps the address space")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::invalid(format!("UEFI.ReservedMemory[{index}]"), reason));
            }
        }
        if parse_resolution(&self.output.resolution).is_none() {
            return Err(ConfigError::invalid(
                "UEFI.Output.Resolution",
                "expected Max, <width>x<height> or empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drivers_default_to_enabled_and_optional() {
        let doc = br#"{"Drivers": [{"Path": "OpenRuntime.efi"}, {"Path": "HfsPlus.efi", "Required": true}]}"#;
        let uefi: UefiConfig = serde_json::from_slice(doc).unwrap();
        assert!(uefi.drivers[0].enabled && !uefi.drivers[0].required);
        assert!(uefi.drivers[1].required);
        assert!(uefi.validate().is_ok());
    }

    #[test]
    fn reserved_memory_must_be_page_aligned() {
        let doc = br#"{"ReservedMemory": [
            {"Address": 1048576, "Size": 4096, "Comment": "EBDA"},
            {"Address": 268435456, "Size": 8192, "Type": "ACPIMemoryNVS", "Enabled": false}
        ]}"#;
        let mut uefi: UefiConfig = serde_json::from_slice(doc).unwrap();
        assert_eq!(uefi.reserved_memory[0].kind, ReservedMemoryType::Reserved);
        assert_eq!(uefi.reserved_memory[1].kind, ReservedMemoryType::AcpiMemoryNvs);
        assert!(uefi.validate().is_ok());

        uefi.reserved_memory[0].size = 100;
        assert!(uefi.validate().is_err());
        uefi.reserved_memory[0].size = 0;
        assert!(uefi.validate().is_err());
        uefi.reserved_memory[0] = ReservedMemory {
            address: u64::MAX - 0xFFF,
            size: 0x2000,
            kind: ReservedMemoryType::Reserved,
            enabled: true,
            comment: String::new(),
        };
        assert!(uefi.validate().is_err());
    }

    #[test]
    fn bad_resolution_is_invalid() {
        let uefi = UefiConfig {
            output: OutputConfig {
                resolution: String::from("big"),
                ..OutputConfig::default()
            },
            ..UefiConfig::default()
        };
        assert!(uefi.validate().is_err());
    }
}
