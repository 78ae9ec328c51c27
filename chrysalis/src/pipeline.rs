//! Boot-stage sequencer.
//!
//! ```text
//!  obtain_vault_key ─> early_init ──Err──> EarlyInitFailed   (no stage runs)
//!                          │
//!                          v
//!   Stage::first() ─> run ─> Fatal? ──yes──> unload kernel ─> Abandoned
//!        ^                     │no
//!        └──── Stage::next() ──┘ ... Boot returns ─> unload kernel ─> BootReturned
//! ```
//!
//! Stage order comes from [`Stage::next`] only. Every path back to the
//! caller after Early Init passes through [`KernelSupport::unload`], which
//! is a no-op when no hook was ever registered.

use alloc::vec::Vec;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::cpu::CpuDescriptor;
use crate::device_path::DevicePath;
use crate::errors::{BootError, EarlyInitError, StageError};
use crate::firmware::{
    AcpiTables, BootEntrySource, BootPicker, BootScreen, DevicePropertyDatabase, IdentityReporter,
    ImageLocator, KernelInterceptor, LoadHandle, PlatformTimer, UefiServices, VariableStore,
};
use crate::misc::boot::{boot, BootServices, ImageStart};
use crate::misc::privilege::PrivilegeContext;
use crate::misc::{early_init, late_init, uefi_quirks_loaded, EarlyBoot};
use crate::stage::acpi::load_acpi;
use crate::stage::device_properties::load_device_properties;
use crate::stage::kernel::KernelSupport;
use crate::stage::nvram::load_nvram;
use crate::stage::platform::load_platform;
use crate::stage::uefi::load_uefi;
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::{AssetSource, Storage};
use crate::vault::{obtain_vault_key, Bootstrap};

/// Every firmware capability the pipeline writes through.
pub struct Firmware<'f> {
    #[allow(missing_docs)]
    pub acpi: &'f mut dyn AcpiTables,
    #[allow(missing_docs)]
    pub device_properties: &'f mut dyn DevicePropertyDatabase,
    #[allow(missing_docs)]
    pub kernel: &'f mut dyn KernelInterceptor,
    #[allow(missing_docs)]
    pub variables: &'f mut dyn VariableStore,
    #[allow(missing_docs)]
    pub identity: &'f mut dyn IdentityReporter,
    #[allow(missing_docs)]
    pub uefi: &'f mut dyn UefiServices,
    #[allow(missing_docs)]
    pub timer: &'f mut dyn PlatformTimer,
    #[allow(missing_docs)]
    pub locator: &'f dyn ImageLocator,
    #[allow(missing_docs)]
    pub screen: &'f mut dyn BootScreen,
    #[allow(missing_docs)]
    pub scanner: &'f mut dyn BootEntrySource,
    #[allow(missing_docs)]
    pub picker: &'f mut dyn BootPicker,
}

/// Caller-owned inputs, borrowed for the whole run.
pub struct BootRequest<'r> {
    /// Supplies the optional vault key
    pub bootstrap: &'r dyn Bootstrap,
    /// Raw boot volume
    pub source: &'r dyn AssetSource,
    /// Detected processor
    pub cpu: &'r CpuDescriptor,
    /// Authorization for privileged picker actions. Built from
    /// `Misc.Security` when absent and a password is configured.
    pub privilege: Option<&'r PrivilegeContext>,
    /// Device path this image was loaded from
    pub load_path: Option<&'r DevicePath>,
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Early Init refused to continue; nothing was modified
    EarlyInitFailed(EarlyInitError),
    /// A stage made continuing unsafe
    Abandoned {
        /// Stage that failed
        stage: Stage,
        #[allow(missing_docs)]
        error: StageError,
    },
    /// Boot gave control back
    BootReturned(BootError),
}

/// Everything the sequencer observed.
#[derive(Debug)]
pub struct PipelineReport {
    /// Outcomes in execution order
    pub stages: Vec<(Stage, StageOutcome)>,
    /// Whether a registered kernel hook was torn down on the way out
    pub kernel_unloaded: bool,
    #[allow(missing_docs)]
    pub termination: Termination,
}

impl PipelineReport {
    /// Stages that ran, in order.
    pub fn executed(&self) -> Vec<Stage> {
        self.stages.iter().map(|(stage, _)| *stage).collect()
    }

    /// Outcome of `stage`, if it ran.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(ran, _)| *ran == stage)
            .map(|(_, outcome)| outcome)
    }
}

/// One boot attempt.
pub struct Pipeline<'r, 'f> {
    request: BootRequest<'r>,
    firmware: Firmware<'f>,
    kernel: KernelSupport,
}

impl<'r, 'f> Pipeline<'r, 'f> {
    #[allow(missing_docs)]
    pub fn new(request: BootRequest<'r>, firmware: Firmware<'f>) -> Self {
        Self {
            request,
            firmware,
            kernel: KernelSupport::new(),
        }
    }

    /// Run every stage and hand off to `image_start`.
    ///
    /// Returning at all means the boot attempt did not transfer control.
    pub fn run(mut self, image_start: &mut ImageStart<'_>) -> PipelineReport {
        let key = obtain_vault_key(self.request.bootstrap);
        let EarlyBoot { config, storage } = match early_init(self.request.source, key) {
            Ok(early) => early,
            Err(e) => {
                error!(error = %e, "early init failed, not continuing");
                return PipelineReport {
                    stages: Vec::new(),
                    kernel_unloaded: false,
                    termination: Termination::EarlyInitFailed(e),
                };
            }
        };

        let configured = match self.request.privilege {
            Some(_) => None,
            None => PrivilegeContext::from_config(&config.misc.security),
        };
        let privilege = self.request.privilege.or(configured.as_ref());

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut load_handle = None;
        let mut stage = Stage::first();

        while stage != Stage::Boot {
            info!(stage = %stage, "stage starting");
            let outcome = self.run_stage(stage, &storage, &config, &mut load_handle);
            if let StageOutcome::Fatal(e) = &outcome {
                let error = e.clone();
                error!(stage = %stage, error = %error, "stage failed fatally, abandoning");
                stages.push((stage, outcome));
                let kernel_unloaded = self.kernel.unload(&mut *self.firmware.kernel);
                return PipelineReport {
                    stages,
                    kernel_unloaded,
                    termination: Termination::Abandoned { stage, error },
                };
            }
            stages.push((stage, outcome));
            stage = match stage.next() {
                Some(next) => next,
                None => break,
            };
        }

        info!(stage = %Stage::Boot, "stage starting");
        let returned = self.boot(&storage, &config, privilege, image_start, load_handle.as_ref());
        warn!(error = %returned, "boot returned to the pipeline");
        let mut report = StageReport::new(Stage::Boot);
        report.failed("start", &returned);
        stages.push((Stage::Boot, report.into_outcome()));
        let kernel_unloaded = self.kernel.unload(&mut *self.firmware.kernel);
        PipelineReport {
            stages,
            kernel_unloaded,
            termination: Termination::BootReturned(returned),
        }
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        storage: &Storage<'_>,
        config: &Config,
        load_handle: &mut Option<LoadHandle>,
    ) -> StageOutcome {
        let cpu = self.request.cpu;
        let fw = &mut self.firmware;
        match stage {
            Stage::Acpi => load_acpi(storage, config, &mut *fw.acpi),
            Stage::DeviceProperties => load_device_properties(config, &mut *fw.device_properties),
            Stage::Kernel => self.kernel.load(storage, config, cpu, &mut *fw.kernel),
            Stage::Nvram => load_nvram(storage, config, &mut *fw.variables),
            Stage::Platform => load_platform(config, cpu, &mut *fw.identity),
            Stage::Uefi => load_uefi(storage, config, cpu, &mut *fw.uefi),
            Stage::QuirksLoaded => uefi_quirks_loaded(config, &mut *fw.timer),
            Stage::LateInit => {
                let late = late_init(config, self.request.load_path, fw.locator, &mut *fw.screen);
                *load_handle = late.load_handle;
                let mut report = StageReport::new(Stage::LateInit);
                match late.status {
                    Ok(()) => report.applied("late init"),
                    Err(e) => report.failed("late init", e),
                }
                report.into_outcome()
            }
            // Driven by `run` once every other stage is done.
            Stage::Boot => StageOutcome::Skipped,
        }
    }

    fn boot(
        &mut self,
        storage: &Storage<'_>,
        config: &Config,
        privilege: Option<&PrivilegeContext>,
        image_start: &mut ImageStart<'_>,
        load_handle: Option<&LoadHandle>,
    ) -> BootError {
        let routed = config
            .uefi
            .as_ref()
            .map_or(false, |uefi| uefi.quirks.request_boot_var_routing);
        let fw = &mut self.firmware;
        boot(
            storage,
            config,
            privilege,
            BootServices {
                scanner: &mut *fw.scanner,
                picker: &mut *fw.picker,
                variables: &mut *fw.variables,
            },
            image_start,
            routed,
            load_handle,
        )
    }
}
