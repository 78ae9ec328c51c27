//! Firmware capabilities.
//!
//! Every piece of mutable firmware state the pipeline touches is reached
//! through one of these traits. Each resource has exactly one writing stage:
//!
//! ```text
//!  AcpiTables              <- ACPI stage
//!  DevicePropertyDatabase  <- Device-Properties stage
//!  KernelInterceptor       <- Kernel stage (and its unload)
//!  VariableStore           <- NVRAM stage, Boot (boot options only)
//!  IdentityReporter        <- Platform stage
//!  UefiServices            <- UEFI stage
//!  PlatformTimer           <- quirks-loaded hook
//!  BootScreen              <- Late Init
//!  BootEntrySource/Picker  <- Boot
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::ops::BitOr;

use zeroize::Zeroizing;

use crate::device_path::DevicePath;
use crate::errors::FirmwareError;
use crate::guid::Guid;
use crate::misc::boot::{BootEntry, PickerAction, PickerMenu};
use crate::misc::ScreenSettings;
use crate::stage::acpi::AcpiTable;
use crate::stage::kernel::KernelPlan;
use crate::stage::platform::PlatformIdentity;
use crate::stage::uefi::{ConsoleOutput, ProtocolOverride, UefiQuirk};

/// Installed ACPI table set.
pub trait AcpiTables {
    /// Snapshot of every installed table, DSDT included.
    fn tables(&self) -> Result<Vec<AcpiTable>, FirmwareError>;

    /// Replace the installed set.
    fn publish(&mut self, tables: Vec<AcpiTable>) -> Result<(), FirmwareError>;
}

/// In-memory device property repository read by drivers and the OS.
pub trait DevicePropertyDatabase {
    /// Set or overwrite one property.
    fn set(&mut self, device: &DevicePath, name: &str, value: &[u8]) -> Result<(), FirmwareError>;

    /// Remove one property. Removing a missing property is not an error.
    fn remove(&mut self, device: &DevicePath, name: &str) -> Result<(), FirmwareError>;
}

/// Hook that rewrites the kernel image when the OS loader reads it.
pub trait KernelInterceptor {
    /// Register the hook. Only one plan is ever registered at a time.
    fn install(&mut self, plan: KernelPlan) -> Result<(), FirmwareError>;

    /// Remove the hook and release its buffers.
    fn uninstall(&mut self) -> Result<(), FirmwareError>;
}

/// NVRAM variable attributes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VariableAttributes(u32);

impl VariableAttributes {
    /// Survives reset
    pub const NON_VOLATILE: Self = Self(0x1);
    /// Visible while boot services run
    pub const BOOTSERVICE_ACCESS: Self = Self(0x2);
    /// Visible after ExitBootServices
    pub const RUNTIME_ACCESS: Self = Self(0x4);

    /// Externally visible variable
    pub const EXTERNAL: Self = Self(0x2 | 0x4);
    /// Internal-only variable
    pub const INTERNAL: Self = Self(0x2);

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for VariableAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for VariableAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariableAttributes({:#x})", self.0)
    }
}

/// Stored variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Attributes it was written with
    pub attributes: VariableAttributes,
    /// Contents
    pub data: Vec<u8>,
}

/// NVRAM variable services.
pub trait VariableStore {
    /// Read a variable through the boot-services path.
    fn get(&self, guid: &Guid, name: &str) -> Result<Variable, FirmwareError>;

    /// Write a variable.
    fn set(
        &mut self,
        guid: &Guid,
        name: &str,
        attributes: VariableAttributes,
        data: &[u8],
    ) -> Result<(), FirmwareError>;

    /// Delete a variable. Deleting a missing variable returns `NotFound`.
    fn delete(&mut self, guid: &Guid, name: &str) -> Result<(), FirmwareError>;

    /// Read a variable the way the OS sees it after ExitBootServices.
    fn get_runtime(&self, guid: &Guid, name: &str) -> Result<Variable, FirmwareError> {
        let variable = self.get(guid, name)?;
        if variable.attributes.contains(VariableAttributes::RUNTIME_ACCESS) {
            Ok(variable)
        } else {
            Err(FirmwareError::NotFound)
        }
    }
}

/// Platform identity publishing (DataHub and SMBIOS).
pub trait IdentityReporter {
    /// Publish through DataHub.
    fn update_data_hub(&mut self, identity: &PlatformIdentity) -> Result<(), FirmwareError>;

    /// Publish through SMBIOS tables.
    fn update_smbios(&mut self, identity: &PlatformIdentity) -> Result<(), FirmwareError>;
}

/// Opaque handle of a loaded driver image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverHandle(pub u64);

/// UEFI driver and protocol services.
pub trait UefiServices {
    /// Install or replace a firmware protocol.
    fn install_protocol(&mut self, protocol: ProtocolOverride) -> Result<(), FirmwareError>;

    /// Activate a firmware workaround.
    fn apply_quirk(&mut self, quirk: UefiQuirk) -> Result<(), FirmwareError>;

    /// Load a driver image. `path` is only used for diagnostics.
    fn load_driver(&mut self, path: &str, image: &[u8]) -> Result<DriverHandle, FirmwareError>;

    /// Start a loaded driver.
    fn start_driver(&mut self, handle: DriverHandle) -> Result<(), FirmwareError>;

    /// Connect every controller to the loaded drivers.
    fn connect_controllers(&mut self) -> Result<(), FirmwareError>;

    /// Apply console output settings.
    fn configure_console(&mut self, output: &ConsoleOutput) -> Result<(), FirmwareError>;
}

/// Timer and watchdog control, adjusted once every quirk is active.
pub trait PlatformTimer {
    /// Set the system timer period in 100 ns units.
    fn set_timer_resolution(&mut self, period: u32) -> Result<(), FirmwareError>;

    /// Turn the firmware watchdog off.
    fn disable_watchdog(&mut self) -> Result<(), FirmwareError>;
}

/// Handle the running image was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadHandle {
    /// Firmware handle of the boot volume
    pub handle: u64,
    /// Device path of the running image
    pub path: DevicePath,
}

/// Resolves device paths to firmware handles.
pub trait ImageLocator {
    /// Locate the volume that holds `path`.
    fn locate(&self, path: &DevicePath) -> Result<u64, FirmwareError>;
}

/// Boot screen and console setup.
pub trait BootScreen {
    /// Apply screen settings.
    fn configure(&mut self, settings: &ScreenSettings) -> Result<(), FirmwareError>;
}

/// Scanner producing bootable entries from attached volumes.
pub trait BootEntrySource {
    /// Scan volumes permitted by `policy`.
    fn scan(&mut self, policy: u32, load_handle: Option<&LoadHandle>) -> Vec<BootEntry>;
}

/// Interactive boot picker.
pub trait BootPicker {
    /// Show `menu` and wait for a choice or its timeout.
    fn choose(&mut self, menu: &PickerMenu) -> PickerAction;

    /// Prompt for the administrator password. `None` when the user cancels.
    fn read_password(&mut self) -> Option<Zeroizing<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore(BTreeMap<(Guid, String), Variable>);

    impl VariableStore for MapStore {
        fn get(&self, guid: &Guid, name: &str) -> Result<Variable, FirmwareError> {
            self.0
                .get(&(*guid, String::from(name)))
                .cloned()
                .ok_or(FirmwareError::NotFound)
        }

        fn set(
            &mut self,
            guid: &Guid,
            name: &str,
            attributes: VariableAttributes,
            data: &[u8],
        ) -> Result<(), FirmwareError> {
            self.0.insert(
                (*guid, String::from(name)),
                Variable {
                    attributes,
                    data: data.to_vec(),
                },
            );
            Ok(())
        }

        fn delete(&mut self, guid: &Guid, name: &str) -> Result<(), FirmwareError> {
            self.0
                .remove(&(*guid, String::from(name)))
                .map(|_| ())
                .ok_or(FirmwareError::NotFound)
        }
    }

    #[test]
    fn attribute_classes() {
        assert!(VariableAttributes::EXTERNAL.contains(VariableAttributes::RUNTIME_ACCESS));
        assert!(!VariableAttributes::INTERNAL.contains(VariableAttributes::RUNTIME_ACCESS));
        let nv = VariableAttributes::INTERNAL | VariableAttributes::NON_VOLATILE;
        assert_eq!(nv.bits(), 0x3);
    }

    #[test]
    fn runtime_path_hides_internal_variables() {
        let guid = crate::guid::CHRYSALIS_VENDOR;
        let mut store = MapStore::default();
        store
            .set(&guid, "inside", VariableAttributes::INTERNAL, b"x")
            .unwrap();
        store
            .set(&guid, "outside", VariableAttributes::EXTERNAL, b"y")
            .unwrap();

        assert!(store.get(&guid, "inside").is_ok());
        assert_eq!(
            store.get_runtime(&guid, "inside"),
            Err(FirmwareError::NotFound)
        );
        assert_eq!(store.get_runtime(&guid, "outside").unwrap().data, b"y");
    }
}
