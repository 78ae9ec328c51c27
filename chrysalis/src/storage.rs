//! Asset store rooted at [`ROOT_PATH`](crate::paths::ROOT_PATH).
//!
//! Paths are relative to the root. A leading separator is accepted and
//! ignored, `/` is accepted as a separator, and a trailing separator is
//! rejected. Once a vault is attached every read must be listed in it and is
//! re-hashed against its digest.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use tracing::{debug, warn};

use crate::errors::{FirmwareError, StorageError};
use crate::paths::ROOT_PATH;
use crate::vault::VaultManifest;

/// Raw read-only volume access supplied by the caller.
pub trait AssetSource {
    /// Read a whole file. `path` is absolute on the volume and uses `\`.
    fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError>;
}

/// Borrowed view of the boot volume's asset tree.
pub struct Storage<'s> {
    source: &'s dyn AssetSource,
    vault: Option<VaultManifest>,
}

impl<'s> Storage<'s> {
    /// Open storage without integrity checking.
    pub fn new(source: &'s dyn AssetSource) -> Self {
        Self {
            source,
            vault: None,
        }
    }

    /// Enforce `manifest` on every subsequent read.
    pub(crate) fn attach_vault(&mut self, manifest: VaultManifest) {
        self.vault = Some(manifest);
    }

    /// Whether reads are checked against a vault.
    pub fn is_vaulted(&self) -> bool {
        self.vault.is_some()
    }

    /// Canonical form of a root-relative path.
    pub fn normalize(path: &str) -> Result<String, StorageError> {
        let trimmed = path.trim_start_matches(['\\', '/']);
        if trimmed.is_empty() || trimmed.ends_with(['\\', '/']) {
            return Err(StorageError::InvalidPath(String::from(path)));
        }

        let mut out = String::with_capacity(trimmed.len());
        for component in trimmed.split(['\\', '/']) {
            if component.is_empty() || component == "." || component == ".." {
                return Err(StorageError::InvalidPath(String::from(path)));
            }
            if !out.is_empty() {
                out.push('\\');
            }
            out.push_str(component);
        }
        Ok(out)
    }

    /// Read an asset, enforcing the vault when one is attached.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let relative = Self::normalize(path)?;
        let expected = match &self.vault {
            Some(vault) => Some(
                vault
                    .digest(&relative)
                    .ok_or_else(|| StorageError::NotInVault(relative.clone()))?,
            ),
            None => None,
        };

        let data = self.read_raw(&relative)?;
        if let Some(expected) = expected {
            if blake3::hash(&data) != expected {
                warn!(path = %relative, "asset digest mismatch");
                return Err(StorageError::IntegrityMismatch(relative));
            }
        }
        Ok(data)
    }

    /// Read a normalized path without consulting the vault.
    ///
    /// Only the vault itself reads this way.
    pub(crate) fn read_raw(&self, relative: &str) -> Result<Vec<u8>, StorageError> {
        let absolute = format!("{ROOT_PATH}\\{relative}");
        debug!(path = %absolute, "reading asset");
        self.source.read(&absolute).map_err(|status| match status {
            FirmwareError::NotFound => StorageError::NotFound(String::from(relative)),
            source => StorageError::Io {
                path: String::from(relative),
                source,
            },
        })
    }
}

impl fmt::Debug for Storage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("root", &ROOT_PATH)
            .field("vaulted_files", &self.vault.as_ref().map(VaultManifest::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    struct MapSource(BTreeMap<String, Vec<u8>>);

    impl AssetSource for MapSource {
        fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError> {
            self.0.get(path).cloned().ok_or(FirmwareError::NotFound)
        }
    }

    fn source() -> MapSource {
        let mut files = BTreeMap::new();
        files.insert(String::from("EFI\\CHRYSALIS\\ACPI\\SSDT.aml"), vec![1, 2, 3]);
        files.insert(String::from("EFI\\CHRYSALIS\\config.json"), b"{}".to_vec());
        MapSource(files)
    }

    #[test]
    fn leading_separator_is_ignored() {
        let source = source();
        let storage = Storage::new(&source);
        let plain = storage.read("ACPI\\SSDT.aml").unwrap();
        assert_eq!(storage.read("\\ACPI\\SSDT.aml").unwrap(), plain);
        assert_eq!(storage.read("/ACPI/SSDT.aml").unwrap(), plain);
    }

    #[test]
    fn rejects_unsafe_paths() {
        for bad in ["", "\\", "ACPI\\", "ACPI\\..\\config.json", "ACPI\\\\SSDT.aml"] {
            assert!(
                matches!(Storage::normalize(bad), Err(StorageError::InvalidPath(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn missing_asset_reports_not_found() {
        let source = source();
        let storage = Storage::new(&source);
        assert_eq!(
            storage.read("Kexts\\Lilu.kext"),
            Err(StorageError::NotFound(String::from("Kexts\\Lilu.kext")))
        );
    }

    #[test]
    fn vault_refuses_unlisted_and_modified_assets() {
        let source = source();
        let mut manifest = VaultManifest::new();
        manifest.insert("ACPI\\SSDT.aml", &[1, 2, 3]);
        manifest.insert("config.json", b"{ }");

        let mut storage = Storage::new(&source);
        storage.attach_vault(manifest);
        assert!(storage.is_vaulted());
        assert_eq!(storage.read("/ACPI/SSDT.aml").unwrap(), vec![1, 2, 3]);
        assert_eq!(
            storage.read("config.json"),
            Err(StorageError::IntegrityMismatch(String::from("config.json")))
        );
        assert!(matches!(
            storage.read("Drivers\\x.efi"),
            Err(StorageError::NotInVault(_))
        ));
    }
}
