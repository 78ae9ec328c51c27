//! Well-known locations on the boot volume.
//!
//! Several boards refuse to open directories with a trailing separator, while
//! a leading one makes no difference to them. Directory constants therefore
//! carry no trailing separator; [`asset_path`] joins them.

use alloc::format;
use alloc::string::String;

/// Root directory of every Chrysalis asset.
pub const ROOT_PATH: &str = "EFI\\CHRYSALIS";

/// Chrysalis image itself, used to hide its own entry from the picker.
pub const IMAGE_PATH: &str = "EFI\\CHRYSALIS\\Chrysalis.efi";

/// Configuration document, relative to [`ROOT_PATH`].
pub const CONFIG_PATH: &str = "config.json";

/// Prefix for log files written next to the configuration.
pub const LOG_PREFIX_PATH: &str = "chrysalis";

/// NVRAM snapshot used by legacy variable loading.
pub const NVRAM_PATH: &str = "nvram.json";

/// Vault manifest listing the digest of every trusted asset.
pub const VAULT_PATH: &str = "vault.json";

/// Detached ed25519 signature over [`VAULT_PATH`].
pub const VAULT_SIGNATURE_PATH: &str = "vault.sig";

/// ACPI table directory.
pub const ACPI_PATH: &str = "ACPI";

/// UEFI driver directory.
pub const UEFI_DRIVER_PATH: &str = "Drivers";

/// Kernel extension directory.
pub const KEXT_PATH: &str = "Kexts";

/// Tool image directory.
pub const TOOL_PATH: &str = "Tools";

/// Join a well-known directory and a configured relative path.
pub fn asset_path(directory: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches(['\\', '/']);
    format!("{directory}\\{relative}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_have_no_trailing_separator() {
        for dir in [ROOT_PATH, ACPI_PATH, UEFI_DRIVER_PATH, KEXT_PATH, TOOL_PATH] {
            assert!(!dir.ends_with('\\') && !dir.ends_with('/'), "{dir}");
        }
        assert!(IMAGE_PATH.starts_with(ROOT_PATH));
    }

    #[test]
    fn asset_path_drops_duplicate_separator() {
        assert_eq!(asset_path(ACPI_PATH, "SSDT-EC.aml"), "ACPI\\SSDT-EC.aml");
        assert_eq!(asset_path(ACPI_PATH, "\\SSDT-EC.aml"), "ACPI\\SSDT-EC.aml");
    }
}
