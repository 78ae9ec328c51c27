//! # Chrysalis - Pre-boot Environment Shaping
//!
//! Chrysalis runs once per boot attempt, between platform firmware and the OS
//! loader. It verifies its own asset volume, loads a declarative configuration,
//! reshapes firmware state (ACPI tables, device properties, kernel patches,
//! NVRAM, platform identity, UEFI drivers and quirks) and finally hands control
//! to the selected loader.
//!
//! ## Pipeline
//!
//! ```text
//! [Trust Gate] → [Early Init] → ACPI → DeviceProperties → Kernel → NVRAM
//!      → Platform → UEFI → QuirksLoaded → LateInit → Boot
//! ```
//!
//! Early Init is the only boot-or-abort decision point. Every later stage
//! isolates failures per operation and reports a [`stage::StageOutcome`]. A
//! fatal stage outcome, or a return from Boot, rolls back the kernel hook
//! before control goes back to the caller.
//!
//! Firmware state is reached only through the capability traits in
//! [`firmware`], so the whole pipeline runs against in-memory fakes on a host.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs, clippy::all)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod device_path;
pub mod errors;
pub mod firmware;
pub mod guid;
pub mod misc;
pub mod patcher;
pub mod paths;
pub mod pipeline;
pub mod stage;
pub mod storage;
pub mod vault;
pub mod version;

pub use config::Config;
pub use cpu::CpuDescriptor;
pub use errors::{BootError, EarlyInitError, FirmwareError, StageError};
pub use misc::boot::StartRequest;
pub use misc::privilege::PrivilegeContext;
pub use pipeline::{BootRequest, Firmware, Pipeline, PipelineReport, Termination};
pub use stage::{Stage, StageOutcome};
pub use storage::{AssetSource, Storage};
pub use vault::{obtain_vault_key, Bootstrap, EmbeddedBootstrap, VaultKey};
