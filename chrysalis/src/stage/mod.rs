//! Stage identifiers, outcomes and the per-subsystem loaders.
//!
//! The order of [`Stage::ALL`] is the only ordering guarantee of the
//! pipeline. Each loader returns a [`StageOutcome`] so the sequencer can
//! decide on rollback from data rather than from side effects.

pub mod acpi;
pub mod device_properties;
pub mod kernel;
pub mod nvram;
pub mod platform;
pub mod uefi;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use tracing::{debug, warn};

use crate::errors::StageError;

/// Pipeline position after Early Init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// ACPI table directives
    Acpi,
    /// Device property injection
    DeviceProperties,
    /// Kernel patch and extension staging
    Kernel,
    /// NVRAM variable writes
    Nvram,
    /// Platform identity publishing
    Platform,
    /// Drivers, protocols and firmware quirks
    Uefi,
    /// Hook run once every UEFI quirk is active
    QuirksLoaded,
    /// Boot screen and load handle
    LateInit,
    /// Entry selection and hand-off
    Boot,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 9] = [
        Stage::Acpi,
        Stage::DeviceProperties,
        Stage::Kernel,
        Stage::Nvram,
        Stage::Platform,
        Stage::Uefi,
        Stage::QuirksLoaded,
        Stage::LateInit,
        Stage::Boot,
    ];

    /// First stage after Early Init.
    pub const fn first() -> Stage {
        Stage::Acpi
    }

    /// Stage that runs after this one. `None` after Boot.
    pub const fn next(self) -> Option<Stage> {
        match self {
            Stage::Acpi => Some(Stage::DeviceProperties),
            Stage::DeviceProperties => Some(Stage::Kernel),
            Stage::Kernel => Some(Stage::Nvram),
            Stage::Nvram => Some(Stage::Platform),
            Stage::Platform => Some(Stage::Uefi),
            Stage::Uefi => Some(Stage::QuirksLoaded),
            Stage::QuirksLoaded => Some(Stage::LateInit),
            Stage::LateInit => Some(Stage::Boot),
            Stage::Boot => None,
        }
    }

    /// Short name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Acpi => "acpi",
            Stage::DeviceProperties => "device-properties",
            Stage::Kernel => "kernel",
            Stage::Nvram => "nvram",
            Stage::Platform => "platform",
            Stage::Uefi => "uefi",
            Stage::QuirksLoaded => "quirks-loaded",
            Stage::LateInit => "late-init",
            Stage::Boot => "boot",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One operation that did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Operation label, e.g. `Add[0] SSDT-EC.aml`
    pub operation: String,
    /// Why it failed
    pub reason: String,
}

/// Tally of a stage's operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Stage the report belongs to
    pub stage: Stage,
    /// Operations that took effect
    pub applied: u32,
    /// Operations disabled or not applicable
    pub skipped: u32,
    /// Operations that failed
    pub failures: Vec<OperationFailure>,
}

impl StageReport {
    /// Empty report for `stage`.
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            applied: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    pub(crate) fn applied(&mut self, operation: &str) {
        debug!(stage = %self.stage, operation, "applied");
        self.applied += 1;
    }

    pub(crate) fn skipped(&mut self, operation: &str, why: &str) {
        debug!(stage = %self.stage, operation, why, "skipped");
        self.skipped += 1;
    }

    pub(crate) fn failed(&mut self, operation: &str, reason: impl fmt::Display) {
        let reason = reason.to_string();
        warn!(stage = %self.stage, operation, reason = %reason, "operation failed");
        self.failures.push(OperationFailure {
            operation: String::from(operation),
            reason,
        });
    }

    /// `Completed` without failures, `Partial` otherwise.
    pub fn into_outcome(self) -> StageOutcome {
        if self.failures.is_empty() {
            StageOutcome::Completed(self)
        } else {
            StageOutcome::Partial(self)
        }
    }
}

/// Structured result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Every operation applied or was deliberately skipped
    Completed(StageReport),
    /// Some operations failed; the pipeline continues
    Partial(StageReport),
    /// Continuing is unsafe; the pipeline is abandoned
    Fatal(StageError),
    /// Subsystem disabled by configuration
    Skipped,
}

impl StageOutcome {
    /// Whether the pipeline must be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::Fatal(_))
    }

    /// Report, when the stage ran to the end.
    pub fn report(&self) -> Option<&StageReport> {
        match self {
            StageOutcome::Completed(report) | StageOutcome::Partial(report) => Some(report),
            StageOutcome::Fatal(_) | StageOutcome::Skipped => None,
        }
    }
}
