//! UEFI stage.
//!
//! Order: protocol overrides, quirks, drivers, controller connection,
//! console output. A driver marked `Required` that fails to load or start
//! ends the stage as fatal; every other failure is isolated.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ops::Range;

use tracing::error;

use crate::config::misc::{parse_resolution, ConsoleMode};
use crate::config::uefi::{ReservedMemoryType, UefiConfig, UefiDriver, PAGE_SIZE};
use crate::config::Config;
use crate::cpu::{CpuDescriptor, CpuRequirement};
use crate::errors::StageError;
use crate::firmware::UefiServices;
use crate::paths::{asset_path, UEFI_DRIVER_PATH};
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::Storage;

/// Firmware protocol replaced with a built-in implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ProtocolOverride {
    AppleBootPolicy,
    ConsoleControl,
    DataHub,
    DeviceProperties,
    FirmwareVolume,
    HashServices,
    UnicodeCollation,
}

/// Firmware workaround.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UefiQuirk {
    /// Delay in microseconds after ExitBootServices
    ExitBootServicesDelay(u32),
    /// Ignore an invalid flex ratio MSR
    IgnoreInvalidFlexRatio,
    /// Take USB controllers away from the firmware
    ReleaseUsbOwnership,
    /// Keep boot variables under the vendor GUID
    RequestBootVarRouting,
    /// Allow connecting blocked file system drivers
    UnblockFsConnect,
    /// Report a newer UEFI revision
    ForgeUefiSupport,
    /// Load PCI option ROMs again
    ReloadOptionRoms,
    /// TSC synchronization timeout in microseconds
    TscSyncTimeout(u32),
}

impl UefiQuirk {
    /// Processors the quirk is meaningful on.
    pub fn requirement(self) -> CpuRequirement {
        match self {
            UefiQuirk::IgnoreInvalidFlexRatio => CpuRequirement::INTEL,
            _ => CpuRequirement::ANY,
        }
    }
}

/// Console output settings handed to firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleOutput {
    /// Install a console GOP when missing
    pub provide_console_gop: bool,
    /// Requested resolution
    pub resolution: ConsoleMode,
    /// Set the resolution even when firmware refuses the mode
    pub force_resolution: bool,
    /// Clear the screen on every mode switch
    pub clear_screen_on_mode_switch: bool,
}

impl ConsoleOutput {
    fn from_config(uefi: &UefiConfig) -> Self {
        let output = &uefi.output;
        Self {
            provide_console_gop: output.provide_console_gop,
            resolution: parse_resolution(&output.resolution).unwrap_or(ConsoleMode::Current),
            force_resolution: output.force_resolution,
            clear_screen_on_mode_switch: output.clear_screen_on_mode_switch,
        }
    }

    fn is_default(&self) -> bool {
        !self.provide_console_gop
            && self.resolution == ConsoleMode::Current
            && !self.force_resolution
            && !self.clear_screen_on_mode_switch
    }
}

/// Whether consoles must be reconnected after a resolution change.
///
/// Pure function of the configuration.
pub fn should_reconnect_console_on_resolution_change(config: &Config) -> bool {
    config
        .uefi
        .as_ref()
        .map_or(false, |uefi| uefi.output.reconnect_on_res_change)
}

/// Physical range withheld from firmware allocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedRegion {
    #[allow(missing_docs)]
    pub range: Range<u64>,
    /// Type the range is reported as in the memory map
    pub kind: ReservedMemoryType,
}

/// Allocation filter built from `UEFI.ReservedMemory`.
///
/// Firmware consults it before handing out pages; a request that overlaps
/// any reserved region must be placed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalloonHandler {
    reserved: Vec<ReservedRegion>,
}

impl BalloonHandler {
    /// Reserved regions, sorted by start address.
    pub fn reserved(&self) -> &[ReservedRegion] {
        &self.reserved
    }

    /// Whether `pages` pages at `address` stay clear of every reserved region.
    pub fn permits(&self, address: u64, pages: u64) -> bool {
        if pages == 0 {
            return true;
        }
        let end = match pages.checked_mul(PAGE_SIZE).and_then(|len| address.checked_add(len)) {
            Some(end) => end,
            None => return false,
        };
        self.reserved
            .iter()
            .all(|region| end <= region.range.start || region.range.end <= address)
    }
}

/// Ballooning handler for memory allocation protections, if any region is
/// reserved.
///
/// Pure function of the configuration.
pub fn ballooning_handler(config: &Config) -> Option<BalloonHandler> {
    let uefi = config.uefi.as_ref()?;
    let mut reserved: Vec<ReservedRegion> = uefi
        .reserved_memory
        .iter()
        .filter(|region| region.enabled && region.size != 0)
        .filter_map(|region| {
            Some(ReservedRegion {
                range: region.address..region.end()?,
                kind: region.kind,
            })
        })
        .collect();
    if reserved.is_empty() {
        return None;
    }
    reserved.sort_by_key(|region| region.range.start);
    Some(BalloonHandler { reserved })
}

/// Load drivers and apply protocol overrides and quirks.
pub fn load_uefi(
    storage: &Storage<'_>,
    config: &Config,
    cpu: &CpuDescriptor,
    services: &mut dyn UefiServices,
) -> StageOutcome {
    let uefi = match &config.uefi {
        Some(uefi) => uefi,
        None => return StageOutcome::Skipped,
    };
    let mut report = StageReport::new(Stage::Uefi);

    let overrides = &uefi.protocol_overrides;
    for (enabled, protocol) in [
        (overrides.apple_boot_policy, ProtocolOverride::AppleBootPolicy),
        (overrides.console_control, ProtocolOverride::ConsoleControl),
        (overrides.data_hub, ProtocolOverride::DataHub),
        (overrides.device_properties, ProtocolOverride::DeviceProperties),
        (overrides.firmware_volume, ProtocolOverride::FirmwareVolume),
        (overrides.hash_services, ProtocolOverride::HashServices),
        (overrides.unicode_collation, ProtocolOverride::UnicodeCollation),
    ] {
        if !enabled {
            continue;
        }
        let op = format!("ProtocolOverrides.{protocol:?}");
        match services.install_protocol(protocol) {
            Ok(()) => report.applied(&op),
            Err(e) => report.failed(&op, e),
        }
    }

    let quirks = &uefi.quirks;
    for (enabled, quirk) in [
        (
            quirks.exit_boot_services_delay != 0,
            UefiQuirk::ExitBootServicesDelay(quirks.exit_boot_services_delay),
        ),
        (quirks.ignore_invalid_flex_ratio, UefiQuirk::IgnoreInvalidFlexRatio),
        (quirks.release_usb_ownership, UefiQuirk::ReleaseUsbOwnership),
        (quirks.request_boot_var_routing, UefiQuirk::RequestBootVarRouting),
        (quirks.unblock_fs_connect, UefiQuirk::UnblockFsConnect),
        (quirks.forge_uefi_support, UefiQuirk::ForgeUefiSupport),
        (quirks.reload_option_roms, UefiQuirk::ReloadOptionRoms),
        (
            quirks.tsc_sync_timeout != 0,
            UefiQuirk::TscSyncTimeout(quirks.tsc_sync_timeout),
        ),
    ] {
        if !enabled {
            continue;
        }
        let op = format!("Quirks.{quirk:?}");
        if !quirk.requirement().matches(cpu) {
            report.skipped(&op, "not applicable to this CPU");
            continue;
        }
        match services.apply_quirk(quirk) {
            Ok(()) => report.applied(&op),
            Err(e) => report.failed(&op, e),
        }
    }

    for (index, driver) in uefi.drivers.iter().enumerate() {
        let op = format!("Drivers[{index}] {}", driver.path);
        if !driver.enabled {
            report.skipped(&op, "disabled");
            continue;
        }
        if let Err(reason) = load_driver(storage, driver, services) {
            if driver.required {
                error!(driver = %driver.path, reason = %reason, "required driver failed");
                return StageOutcome::Fatal(StageError::RequiredDriver {
                    path: driver.path.clone(),
                    reason,
                });
            }
            report.failed(&op, reason);
        } else {
            report.applied(&op);
        }
    }

    if uefi.connect_drivers {
        match services.connect_controllers() {
            Ok(()) => report.applied("ConnectDrivers"),
            Err(e) => report.failed("ConnectDrivers", e),
        }
    }

    let output = ConsoleOutput::from_config(uefi);
    if !output.is_default() {
        match services.configure_console(&output) {
            Ok(()) => report.applied("Output"),
            Err(e) => report.failed("Output", e),
        }
    }

    report.into_outcome()
}

fn load_driver(
    storage: &Storage<'_>,
    driver: &UefiDriver,
    services: &mut dyn UefiServices,
) -> Result<(), String> {
    let image = storage
        .read(&asset_path(UEFI_DRIVER_PATH, &driver.path))
        .map_err(|e| e.to_string())?;
    let handle = services
        .load_driver(&driver.path, &image)
        .map_err(|e| format!("load: {e}"))?;
    services
        .start_driver(handle)
        .map_err(|e| format!("start: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::uefi::{OutputConfig, ReservedMemory, UefiQuirksConfig};
    use crate::cpu::CpuVendor;
    use crate::errors::FirmwareError;
    use crate::firmware::DriverHandle;
    use crate::storage::AssetSource;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use alloc::vec::Vec;

    struct Files(BTreeMap<String, Vec<u8>>);

    impl AssetSource for Files {
        fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError> {
            self.0.get(path).cloned().ok_or(FirmwareError::NotFound)
        }
    }

    #[derive(Default)]
    struct Services {
        started: Vec<u64>,
        quirks: Vec<UefiQuirk>,
        next: u64,
    }

    impl UefiServices for Services {
        fn install_protocol(&mut self, _protocol: ProtocolOverride) -> Result<(), FirmwareError> {
            Ok(())
        }

        fn apply_quirk(&mut self, quirk: UefiQuirk) -> Result<(), FirmwareError> {
            self.quirks.push(quirk);
            Ok(())
        }

        fn load_driver(&mut self, _path: &str, image: &[u8]) -> Result<DriverHandle, FirmwareError> {
            if image.starts_with(b"MZ") {
                self.next += 1;
                Ok(DriverHandle(self.next))
            } else {
                Err(FirmwareError::SecurityViolation)
            }
        }

        fn start_driver(&mut self, handle: DriverHandle) -> Result<(), FirmwareError> {
            self.started.push(handle.0);
            Ok(())
        }

        fn connect_controllers(&mut self) -> Result<(), FirmwareError> {
            Ok(())
        }

        fn configure_console(&mut self, _output: &ConsoleOutput) -> Result<(), FirmwareError> {
            Ok(())
        }
    }

    fn files() -> Files {
        let mut files = BTreeMap::new();
        files.insert(String::from("EFI\\CHRYSALIS\\Drivers\\OpenRuntime.efi"), b"MZ..".to_vec());
        files.insert(String::from("EFI\\CHRYSALIS\\Drivers\\Broken.efi"), b"ELF".to_vec());
        Files(files)
    }

    fn driver(path: &str, required: bool) -> UefiDriver {
        UefiDriver {
            path: String::from(path),
            enabled: true,
            required,
            arguments: String::new(),
            comment: String::new(),
        }
    }

    fn config(uefi: UefiConfig) -> Config {
        Config {
            uefi: Some(uefi),
            ..Config::default()
        }
    }

    #[test]
    fn optional_driver_failure_is_isolated() {
        let source = files();
        let storage = Storage::new(&source);
        let mut services = Services::default();
        let uefi = UefiConfig {
            drivers: vec![
                driver("Broken.efi", false),
                driver("Missing.efi", false),
                driver("OpenRuntime.efi", false),
            ],
            ..UefiConfig::default()
        };
        let outcome = load_uefi(&storage, &config(uefi), &CpuDescriptor::unknown(), &mut services);
        let report = outcome.report().unwrap();
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.applied, 1);
        assert_eq!(services.started, [1]);
    }

    #[test]
    fn required_driver_failure_is_fatal() {
        let source = files();
        let storage = Storage::new(&source);
        let mut services = Services::default();
        let uefi = UefiConfig {
            drivers: vec![driver("Broken.efi", true), driver("OpenRuntime.efi", false)],
            ..UefiConfig::default()
        };
        let outcome = load_uefi(&storage, &config(uefi), &CpuDescriptor::unknown(), &mut services);
        assert!(matches!(
            outcome,
            StageOutcome::Fatal(StageError::RequiredDriver { ref path, .. }) if path == "Broken.efi"
        ));
        assert!(services.started.is_empty());
    }

    #[test]
    fn quirks_are_cpu_gated() {
        let source = files();
        let storage = Storage::new(&source);
        let mut services = Services::default();
        let uefi = UefiConfig {
            quirks: UefiQuirksConfig {
                ignore_invalid_flex_ratio: true,
                tsc_sync_timeout: 500,
                ..UefiQuirksConfig::default()
            },
            ..UefiConfig::default()
        };
        let amd = CpuDescriptor {
            vendor: CpuVendor::Amd,
            ..CpuDescriptor::unknown()
        };
        load_uefi(&storage, &config(uefi), &amd, &mut services);
        assert_eq!(services.quirks, [UefiQuirk::TscSyncTimeout(500)]);
    }

    #[test]
    fn reconnect_decision_is_pure() {
        let mut config = Config::default();
        assert!(!should_reconnect_console_on_resolution_change(&config));
        config.uefi = Some(UefiConfig {
            output: OutputConfig {
                reconnect_on_res_change: true,
                ..OutputConfig::default()
            },
            ..UefiConfig::default()
        });
        let first = should_reconnect_console_on_resolution_change(&config);
        assert!(first);
        assert_eq!(should_reconnect_console_on_resolution_change(&config), first);
    }

    fn reserved(address: u64, size: u64, enabled: bool) -> ReservedMemory {
        ReservedMemory {
            address,
            size,
            kind: ReservedMemoryType::Reserved,
            enabled,
            comment: String::new(),
        }
    }

    #[test]
    fn ballooning_handler_needs_an_enabled_region() {
        assert_eq!(ballooning_handler(&Config::default()), None);
        let disabled = config(UefiConfig {
            reserved_memory: vec![reserved(0x10_0000, 0x1000, false)],
            ..UefiConfig::default()
        });
        assert_eq!(ballooning_handler(&disabled), None);

        let active = config(UefiConfig {
            reserved_memory: vec![
                reserved(0x8000_0000, 0x2000, true),
                reserved(0x10_0000, 0x1000, true),
                reserved(0x20_0000, 0x1000, false),
            ],
            ..UefiConfig::default()
        });
        let handler = ballooning_handler(&active).unwrap();
        assert_eq!(ballooning_handler(&active).as_ref(), Some(&handler));
        let starts: Vec<u64> = handler.reserved().iter().map(|r| r.range.start).collect();
        assert_eq!(starts, [0x10_0000, 0x8000_0000]);

        assert!(handler.permits(0x20_0000, 16));
        assert!(handler.permits(0x0F_F000, 1));
        assert!(!handler.permits(0x0F_F000, 2));
        assert!(!handler.permits(0x8000_1000, 1));
        assert!(handler.permits(0x8000_2000, 1));
        assert!(!handler.permits(u64::MAX - 0xFFF, 2));
    }
}
