// chrysalis/src/errors.rs
// Chrysalis Error Types: gate failures, per-operation failures, boot failures

use alloc::string::String;
use thiserror::Error;

/// Status reported by a firmware capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FirmwareError {
    /// Requested object does not exist
    #[error("not found")]
    NotFound,
    /// Firmware refused the operation
    #[error("access denied")]
    AccessDenied,
    /// Allocation or storage space exhausted
    #[error("out of resources")]
    OutOfResources,
    /// Operation not implemented by this firmware
    #[error("unsupported")]
    Unsupported,
    /// Arguments rejected by firmware
    #[error("invalid parameter")]
    InvalidParameter,
    /// Hardware reported an error
    #[error("device error")]
    DeviceError,
    /// Image or driver security check failed
    #[error("security violation")]
    SecurityViolation,
    /// Operation was aborted
    #[error("aborted")]
    Aborted,
}

/// Asset resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Path is empty, has a trailing separator or escapes the root
    #[error("invalid asset path `{0}`")]
    InvalidPath(String),
    /// Nothing stored under this path
    #[error("asset `{0}` not found")]
    NotFound(String),
    /// Volume read failed
    #[error("asset `{path}` unreadable: {source}")]
    Io {
        /// Path relative to the storage root
        path: String,
        /// Underlying firmware status
        source: FirmwareError,
    },
    /// A vault is active and does not list this path
    #[error("asset `{0}` is not covered by the vault")]
    NotInVault(String),
    /// Asset contents differ from the vault digest
    #[error("asset `{0}` does not match its vault digest")]
    IntegrityMismatch(String),
}

/// Vault verification failures. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// Manifest file could not be read
    #[error("vault manifest unavailable: {0}")]
    ManifestUnavailable(StorageError),
    /// Signature file could not be read
    #[error("vault signature unavailable: {0}")]
    SignatureUnavailable(StorageError),
    /// Signature file has the wrong size
    #[error("vault signature must be 64 bytes, got {0}")]
    SignatureLength(usize),
    /// Signature does not verify under the vault key
    #[error("vault signature does not verify under the vault key")]
    BadSignature,
    /// Manifest is not a valid vault document
    #[error("vault manifest is malformed: {0}")]
    Malformed(String),
    /// Listed file is missing or differs from its digest
    #[error(transparent)]
    Asset(#[from] StorageError),
}

/// Configuration schema and semantic validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Document does not match the schema
    #[error("configuration does not parse: {0}")]
    Parse(String),
    /// Field parsed but holds an unusable value
    #[error("`{field}` is invalid: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal Early Init failures. The caller must not run any stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EarlyInitError {
    /// Configuration file could not be read
    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(StorageError),
    /// Configuration failed schema or semantic validation
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Asset store integrity could not be established
    #[error("vault verification failed: {0}")]
    Vault(#[from] VaultError),
    /// Configuration demands a signed vault and no key was supplied
    #[error("configuration requires a signed vault but no vault key is available")]
    MissingVaultKey,
}

/// Stage failures that make continuing the pipeline unsafe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Kernel interception could not be registered
    #[error("kernel hook registration rejected: {0}")]
    KernelHook(FirmwareError),
    /// A driver marked as required did not load or start
    #[error("required driver `{path}` failed: {reason}")]
    RequiredDriver {
        /// Driver path relative to the driver directory
        path: String,
        /// Why it failed
        reason: String,
    },
}

/// Informational Late Init failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LateInitError {
    /// Boot screen settings were rejected
    #[error("boot screen configuration failed: {0}")]
    BootScreen(FirmwareError),
    /// Own load path did not resolve to a handle
    #[error("load handle unavailable: {0}")]
    LoadHandle(FirmwareError),
}

/// Reasons the Boot stage returned to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    /// Scanner and configuration produced nothing to boot
    #[error("no boot entries available")]
    NoEntries,
    /// Picker was dismissed without a choice
    #[error("boot picker aborted")]
    Aborted,
    /// Image could not be started
    #[error("entry `{name}` failed to start: {source}")]
    StartFailed {
        /// Entry display name
        name: String,
        /// Status from the image-start capability
        source: FirmwareError,
    },
    /// Image started and gave control back
    #[error("entry `{0}` returned control")]
    Returned(String),
    /// Tool image could not be read from storage
    #[error("entry `{name}` image unavailable: {source}")]
    ImageUnavailable {
        /// Entry display name
        name: String,
        /// Storage failure
        source: StorageError,
    },
}
