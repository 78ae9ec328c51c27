//! Kernel stage.
//!
//! Loading resolves kexts, block entries, patches, CPUID emulation and
//! built-in quirks into a [`KernelPlan`], filtered by the CPU descriptor, and
//! registers it with the firmware's kernel interceptor. Nothing is patched
//! here: the interceptor calls [`KernelPlan::patch_image`] when the OS loader
//! reads the kernel, which is when the kernel version becomes known.
//!
//! This is the only stage with a rollback. [`KernelSupport::unload`] tears
//! the hook down and is safe to call any number of times, with or without a
//! prior load.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use tracing::{info, warn};

use crate::config::kernel::{DarwinVersion, KernelConfig, KernelRange};
use crate::config::Config;
use crate::cpu::{CpuDescriptor, CpuGeneration, CpuRequirement};
use crate::errors::StageError;
use crate::firmware::KernelInterceptor;
use crate::paths::{asset_path, KEXT_PATH};
use crate::patcher::Pattern;
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::Storage;

/// Identifier patches use to target the kernel itself.
pub const KERNEL_IDENTIFIER: &str = "kernel";

/// Built-in kernel fixups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum KernelQuirk {
    AppleCpuPmCfgLock,
    AppleXcpmCfgLock,
    DisableIoMapper,
    DisableRtcChecksum,
    DummyPowerManagement,
    LapicKernelPanic,
    PanicNoKextDump,
    PowerTimeoutKernelPanic,
    ProvideCurrentCpuInfo,
    XhciPortLimit,
}

impl KernelQuirk {
    /// Processors the quirk is meaningful on.
    pub fn requirement(self) -> CpuRequirement {
        match self {
            KernelQuirk::AppleCpuPmCfgLock => {
                CpuRequirement::INTEL.generations(None, Some(CpuGeneration::IvyBridge))
            }
            KernelQuirk::AppleXcpmCfgLock => {
                CpuRequirement::INTEL.generations(Some(CpuGeneration::Haswell), None)
            }
            _ => CpuRequirement::ANY,
        }
    }
}

/// Kext ready for injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedKext {
    /// Bundle directory relative to `Kexts`
    pub bundle_path: String,
    /// Info.plist contents
    pub plist: Vec<u8>,
    /// Executable contents, absent for plist-only kexts
    pub executable: Option<Vec<u8>>,
    /// Kernels it is injected into
    pub range: KernelRange,
}

/// Kext that must not load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedKext {
    /// Bundle identifier
    pub identifier: String,
    /// Kernels the block applies to
    pub range: KernelRange,
}

/// Owned copy of a configured patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPatch {
    /// `kernel` or a bundle identifier
    pub identifier: String,
    #[allow(missing_docs)]
    pub find: Vec<u8>,
    #[allow(missing_docs)]
    pub replace: Vec<u8>,
    #[allow(missing_docs)]
    pub mask: Vec<u8>,
    #[allow(missing_docs)]
    pub replace_mask: Vec<u8>,
    #[allow(missing_docs)]
    pub count: u32,
    #[allow(missing_docs)]
    pub skip: u32,
    #[allow(missing_docs)]
    pub limit: u32,
    /// Kernels the patch applies to
    pub range: KernelRange,
}

impl PreparedPatch {
    fn pattern(&self) -> Pattern<'_> {
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

/// CPUID leaf 1 override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidOverride {
    /// EAX..EDX to report
    pub data: [u32; 4],
    /// Bits taken from `data`
    pub mask: [u32; 4],
}

impl CpuidOverride {
    fn from_config(data: &[u8], mask: &[u8]) -> Self {
        let words = |bytes: &[u8]| -> [u32; 4] {
            let mut out = [0u32; 4];
            for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            out
        };
        let mask = if mask.is_empty() { [u32::MAX; 4] } else { words(mask) };
        Self {
            data: words(data),
            mask,
        }
    }

    /// CPUID leaf 1 as the kernel will see it.
    pub fn apply(&self, real: [u32; 4]) -> [u32; 4] {
        let mut out = real;
        for ((word, data), mask) in out.iter_mut().zip(self.data).zip(self.mask) {
            *word = (*word & !mask) | (data & mask);
        }
        out
    }
}

/// Everything the kernel hook needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelPlan {
    /// Kexts to inject
    pub kexts: Vec<PreparedKext>,
    /// Kexts to block
    pub blocks: Vec<BlockedKext>,
    /// Binary patches
    pub patches: Vec<PreparedPatch>,
    /// CPUID emulation
    pub cpuid: Option<CpuidOverride>,
    /// Built-in fixups applicable to this CPU
    pub quirks: Vec<KernelQuirk>,
}

impl KernelPlan {
    /// Whether the hook would do nothing.
    pub fn is_empty(&self) -> bool {
        self.kexts.is_empty()
            && self.blocks.is_empty()
            && self.patches.is_empty()
            && self.cpuid.is_none()
            && self.quirks.is_empty()
    }

    /// Apply every patch targeting `identifier` on `version` to `image`.
    ///
    /// Returns the number of replacements made.
    pub fn patch_image(&self, identifier: &str, version: DarwinVersion, image: &mut [u8]) -> u32 {
        self.patches
            .iter()
            .filter(|p| p.identifier == identifier && p.range.contains(version))
            .map(|p| p.pattern().apply(image))
            .sum()
    }

    /// Kexts to inject into `version`.
    pub fn kexts_for(&self, version: DarwinVersion) -> impl Iterator<Item = &PreparedKext> {
        self.kexts.iter().filter(move |k| k.range.contains(version))
    }

    /// Whether `identifier` must be blocked on `version`.
    pub fn is_blocked(&self, identifier: &str, version: DarwinVersion) -> bool {
        self.blocks
            .iter()
            .any(|b| b.identifier == identifier && b.range.contains(version))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookState {
    Idle,
    Armed,
    // Registration was rejected; firmware may still hold part of it.
    Rejected,
}

/// Owner of the kernel hook for one boot attempt.
#[derive(Debug)]
pub struct KernelSupport {
    state: HookState,
}

impl Default for KernelSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelSupport {
    /// No hook registered.
    pub fn new() -> Self {
        Self {
            state: HookState::Idle,
        }
    }

    /// Whether a hook is registered.
    pub fn is_armed(&self) -> bool {
        self.state == HookState::Armed
    }

    /// Build the plan and register the hook.
    pub fn load(
        &mut self,
        storage: &Storage<'_>,
        config: &Config,
        cpu: &CpuDescriptor,
        interceptor: &mut dyn KernelInterceptor,
    ) -> StageOutcome {
        let kernel = match &config.kernel {
            Some(kernel) => kernel,
            None => return StageOutcome::Skipped,
        };
        if self.state != HookState::Idle {
            self.unload(interceptor);
        }

        let mut report = StageReport::new(Stage::Kernel);
        let plan = build_plan(storage, kernel, cpu, &mut report);
        if plan.is_empty() {
            report.skipped("register hook", "nothing to do");
            return report.into_outcome();
        }

        let kexts = plan.kexts.len();
        let patches = plan.patches.len();
        match interceptor.install(plan) {
            Ok(()) => {
                self.state = HookState::Armed;
                info!(kexts, patches, "kernel hook registered");
                report.into_outcome()
            }
            Err(e) => {
                self.state = HookState::Rejected;
                warn!(error = %e, "kernel hook registration rejected");
                StageOutcome::Fatal(StageError::KernelHook(e))
            }
        }
    }

    /// Tear the hook down. Returns whether anything was torn down.
    pub fn unload(&mut self, interceptor: &mut dyn KernelInterceptor) -> bool {
        if self.state == HookState::Idle {
            return false;
        }
        if let Err(e) = interceptor.uninstall() {
            warn!(error = %e, "kernel hook removal reported an error");
        }
        self.state = HookState::Idle;
        info!("kernel hook removed");
        true
    }
}

fn build_plan(
    storage: &Storage<'_>,
    kernel: &KernelConfig,
    cpu: &CpuDescriptor,
    report: &mut StageReport,
) -> KernelPlan {
    let mut plan = KernelPlan::default();

    for (index, kext) in kernel.add.iter().enumerate() {
        let op = format!("Add[{index}] {}", kext.bundle_path);
        if !kext.enabled {
            report.skipped(&op, "disabled");
            continue;
        }
        let bundle = asset_path(KEXT_PATH, &kext.bundle_path);
        let plist = match storage.read(&asset_path(&bundle, &kext.plist_path)) {
            Ok(plist) => plist,
            Err(e) => {
                report.failed(&op, e);
                continue;
            }
        };
        let executable = if kext.executable_path.is_empty() {
            None
        } else {
            match storage.read(&asset_path(&bundle, &kext.executable_path)) {
                Ok(executable) => Some(executable),
                Err(e) => {
                    report.failed(&op, e);
                    continue;
                }
            }
        };
        plan.kexts.push(PreparedKext {
            bundle_path: kext.bundle_path.clone(),
            plist,
            executable,
            range: kext.range(),
        });
        report.applied(&op);
    }

    for (index, block) in kernel.block.iter().enumerate() {
        let op = format!("Block[{index}] {}", block.identifier);
        if !block.enabled {
            report.skipped(&op, "disabled");
            continue;
        }
        plan.blocks.push(BlockedKext {
            identifier: block.identifier.clone(),
            range: block.range(),
        });
        report.applied(&op);
    }

    for (index, patch) in kernel.patch.iter().enumerate() {
        let op = format!("Patch[{index}] {}", patch.identifier);
        if !patch.enabled {
            report.skipped(&op, "disabled");
            continue;
        }
        plan.patches.push(PreparedPatch {
            identifier: patch.identifier.clone(),
            find: patch.find.clone(),
            replace: patch.replace.clone(),
            mask: patch.mask.clone(),
            replace_mask: patch.replace_mask.clone(),
            count: patch.count,
            skip: patch.skip,
            limit: patch.limit,
            range: patch.range(),
        });
        report.applied(&op);
    }

    let emulate = &kernel.emulate;
    if !emulate.cpuid1_data.is_empty() {
        if cpu.is_intel() {
            plan.cpuid = Some(CpuidOverride::from_config(
                &emulate.cpuid1_data,
                &emulate.cpuid1_mask,
            ));
            report.applied("Emulate.Cpuid1Data");
        } else {
            report.skipped("Emulate.Cpuid1Data", "Intel only");
        }
    }

    let quirks = &kernel.quirks;
    for (enabled, quirk) in [
        (quirks.apple_cpu_pm_cfg_lock, KernelQuirk::AppleCpuPmCfgLock),
        (quirks.apple_xcpm_cfg_lock, KernelQuirk::AppleXcpmCfgLock),
        (quirks.disable_io_mapper, KernelQuirk::DisableIoMapper),
        (quirks.disable_rtc_checksum, KernelQuirk::DisableRtcChecksum),
        (emulate.dummy_power_management, KernelQuirk::DummyPowerManagement),
        (quirks.lapic_kernel_panic, KernelQuirk::LapicKernelPanic),
        (quirks.panic_no_kext_dump, KernelQuirk::PanicNoKextDump),
        (quirks.power_timeout_kernel_panic, KernelQuirk::PowerTimeoutKernelPanic),
        (quirks.provide_current_cpu_info, KernelQuirk::ProvideCurrentCpuInfo),
        (quirks.xhci_port_limit, KernelQuirk::XhciPortLimit),
    ] {
        if !enabled {
            continue;
        }
        let op = format!("Quirks.{quirk:?}");
        if quirk.requirement().matches(cpu) {
            plan.quirks.push(quirk);
            report.applied(&op);
        } else {
            report.skipped(&op, "not applicable to this CPU");
        }
    }

    plan
}
