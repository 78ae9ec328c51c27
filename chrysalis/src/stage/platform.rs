//! Platform stage: synthesize identity data and publish it.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::platform::PlatformInfoConfig;
use crate::config::Config;
use crate::cpu::CpuDescriptor;
use crate::firmware::IdentityReporter;
use crate::guid::Guid;
use crate::stage::{Stage, StageOutcome, StageReport};

/// One memory slot as reported to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlot {
    #[allow(missing_docs)]
    pub device_locator: String,
    #[allow(missing_docs)]
    pub bank_locator: String,
    /// MiB; 0 when empty
    pub size: u32,
    /// MT/s
    pub speed: u32,
    #[allow(missing_docs)]
    pub manufacturer: String,
}

/// Memory table replacing the firmware one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTopology {
    #[allow(missing_docs)]
    pub form_factor: u8,
    #[allow(missing_docs)]
    pub memory_type: u8,
    #[allow(missing_docs)]
    pub slots: Vec<MemorySlot>,
}

/// Identity published through DataHub and SMBIOS.
///
/// Empty strings and zero values leave the firmware's own data in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformIdentity {
    #[allow(missing_docs)]
    pub product_name: String,
    #[allow(missing_docs)]
    pub serial_number: String,
    #[allow(missing_docs)]
    pub uuid: Option<Guid>,
    /// Main logic board serial
    pub mlb: String,
    #[allow(missing_docs)]
    pub board_id: String,
    /// SMBIOS processor type code
    pub processor_type: u16,
    #[allow(missing_docs)]
    pub core_count: u16,
    #[allow(missing_docs)]
    pub thread_count: u16,
    /// Hz
    pub fsb_frequency: u64,
    /// Hz
    pub tsc_frequency: u64,
    /// Replacement memory table
    pub memory: Option<MemoryTopology>,
}

impl PlatformIdentity {
    /// Combine configured overrides with the CPU descriptor.
    pub fn synthesize(platform: &PlatformInfoConfig, cpu: &CpuDescriptor) -> Self {
        let generic = &platform.generic;
        let mut identity = Self {
            product_name: generic.system_product_name.clone(),
            serial_number: generic.system_serial_number.clone(),
            uuid: generic.system_uuid.parse().ok(),
            mlb: generic.mlb.clone(),
            board_id: generic.board_id.clone(),
            processor_type: generic.processor_type,
            ..Self::default()
        };

        if platform.automatic {
            if identity.processor_type == 0 {
                identity.processor_type = cpu.processor_type();
            }
            identity.core_count = cpu.core_count;
            identity.thread_count = cpu.thread_count;
            identity.fsb_frequency = cpu.fsb_frequency;
            identity.tsc_frequency = cpu.tsc_frequency;
        }

        if platform.custom_memory && !generic.spoof_vendor {
            let memory = &platform.memory;
            identity.memory = Some(MemoryTopology {
                form_factor: memory.form_factor,
                memory_type: memory.memory_type,
                slots: memory
                    .devices
                    .iter()
                    .map(|device| MemorySlot {
                        device_locator: device.device_locator.clone(),
                        bank_locator: device.bank_locator.clone(),
                        size: device.size,
                        speed: device.speed,
                        manufacturer: device.manufacturer.clone(),
                    })
                    .collect(),
            });
        }
        identity
    }
}

/// Publish platform identity as configured.
pub fn load_platform(config: &Config, cpu: &CpuDescriptor, reporter: &mut dyn IdentityReporter) -> StageOutcome {
    let platform = match &config.platform_info {
        Some(platform) => platform,
        None => return StageOutcome::Skipped,
    };
    let mut report = StageReport::new(Stage::Platform);
    let identity = PlatformIdentity::synthesize(platform, cpu);

    if platform.update_data_hub {
        match reporter.update_data_hub(&identity) {
            Ok(()) => report.applied("UpdateDataHub"),
            Err(e) => report.failed("UpdateDataHub", e),
        }
    }
    if platform.update_smbios {
        match reporter.update_smbios(&identity) {
            Ok(()) => report.applied("UpdateSMBIOS"),
            Err(e) => report.failed("UpdateSMBIOS", e),
        }
    }
    if !platform.update_data_hub && !platform.update_smbios {
        report.skipped("publish identity", "no reporting interface enabled");
    }
    report.into_outcome()
}
