//! Misc controller: Early Init, the quirks-loaded hook, Late Init and Boot.
//!
//! Early Init is the single boot-or-abort gate. It opens the vault, reads and
//! validates `config.json`, and only then applies the configured vault policy.
//! Nothing here writes firmware state until it has returned successfully.

pub mod boot;
pub mod privilege;

use alloc::format;
use alloc::string::String;

use tracing::{error, info, warn};

use crate::config::misc::{ConsoleBehaviour, ConsoleMode, HibernateMode, EXPOSE_VERSION_IN_MENU};
use crate::config::{Config, VaultPolicy};
use crate::device_path::DevicePath;
use crate::errors::{EarlyInitError, LateInitError, StorageError, VaultError};
use crate::firmware::{BootScreen, ImageLocator, LoadHandle, PlatformTimer};
use crate::paths::{CONFIG_PATH, VAULT_PATH};
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::{AssetSource, Storage};
use crate::vault::{self, VaultKey};
use crate::version::VERSION_STRING;

/// Result of a successful Early Init.
#[derive(Debug)]
pub struct EarlyBoot<'s> {
    /// Validated configuration, read-only from here on
    pub config: Config,
    /// Asset store, vault attached when one was opened
    pub storage: Storage<'s>,
}

/// Verify the asset store and load the configuration.
pub fn early_init<'s>(
    source: &'s dyn AssetSource,
    key: Option<&VaultKey>,
) -> Result<EarlyBoot<'s>, EarlyInitError> {
    let mut storage = Storage::new(source);
    if let Some(manifest) = vault::open(&storage, key).map_err(|e| {
        error!(error = %e, "asset store verification failed");
        e
    })? {
        storage.attach_vault(manifest);
    }

    let bytes = storage.read(CONFIG_PATH).map_err(|e| {
        error!(path = CONFIG_PATH, error = %e, "configuration unavailable");
        EarlyInitError::ConfigUnavailable(e)
    })?;
    let config = Config::from_json(&bytes).map_err(|e| {
        error!(error = %e, "configuration rejected");
        e
    })?;

    match config.misc.security.vault {
        VaultPolicy::Secure if key.is_none() => {
            error!("Secure vault requested without a vault key");
            return Err(EarlyInitError::MissingVaultKey);
        }
        VaultPolicy::Basic | VaultPolicy::Secure if !storage.is_vaulted() => {
            error!("vault required but no manifest present");
            return Err(VaultError::ManifestUnavailable(StorageError::NotFound(String::from(VAULT_PATH))).into());
        }
        _ => {}
    }

    info!(
        version = VERSION_STRING,
        vaulted = storage.is_vaulted(),
        signed = key.is_some(),
        "early init complete"
    );
    Ok(EarlyBoot { config, storage })
}

/// Runs once every UEFI quirk is active.
pub fn uefi_quirks_loaded(config: &Config, timer: &mut dyn PlatformTimer) -> StageOutcome {
    let mut report = StageReport::new(Stage::QuirksLoaded);

    let resolution = config
        .uefi
        .as_ref()
        .map_or(0, |uefi| uefi.input.timer_resolution);
    if resolution != 0 {
        match timer.set_timer_resolution(resolution) {
            Ok(()) => report.applied("TimerResolution"),
            Err(e) => report.failed("TimerResolution", e),
        }
    }

    if config.misc.debug.disable_watchdog {
        match timer.disable_watchdog() {
            Ok(()) => report.applied("DisableWatchDog"),
            Err(e) => report.failed("DisableWatchDog", e),
        }
    }

    if report.applied == 0 && report.failures.is_empty() {
        return StageOutcome::Skipped;
    }
    report.into_outcome()
}

/// Boot screen and picker presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSettings {
    #[allow(missing_docs)]
    pub console_behaviour: ConsoleBehaviour,
    #[allow(missing_docs)]
    pub console_mode: ConsoleMode,
    #[allow(missing_docs)]
    pub hibernate_mode: HibernateMode,
    /// Picker title
    pub title: String,
}

impl ScreenSettings {
    /// Settings derived from `Misc`.
    pub fn from_config(config: &Config) -> Self {
        let misc = &config.misc;
        let title = if misc.security.expose_sensitive_data & EXPOSE_VERSION_IN_MENU != 0 {
            format!("Chrysalis {VERSION_STRING}")
        } else {
            String::from("Chrysalis")
        };
        Self {
            console_behaviour: misc.boot.console_behaviour,
            console_mode: misc.console_mode(),
            hibernate_mode: misc.boot.hibernate_mode,
            title,
        }
    }
}

/// Outcome of Late Init. Never blocks booting.
#[derive(Debug)]
pub struct LateInit {
    /// First failure, if any
    pub status: Result<(), LateInitError>,
    /// Where this image was loaded from
    pub load_handle: Option<LoadHandle>,
}

/// Apply boot screen settings and resolve the load handle.
pub fn late_init(
    config: &Config,
    load_path: Option<&DevicePath>,
    locator: &dyn ImageLocator,
    screen: &mut dyn BootScreen,
) -> LateInit {
    let mut status = Ok(());

    if let Err(e) = screen.configure(&ScreenSettings::from_config(config)) {
        warn!(error = %e, "boot screen settings rejected");
        status = Err(LateInitError::BootScreen(e));
    }

    let load_handle = load_path.and_then(|path| match locator.locate(path) {
        Ok(handle) => Some(LoadHandle {
            handle,
            path: path.clone(),
        }),
        Err(e) => {
            warn!(path = %path, error = %e, "load handle unavailable");
            if status.is_ok() {
                status = Err(LateInitError::LoadHandle(e));
            }
            None
        }
    });

    LateInit { status, load_handle }
}
