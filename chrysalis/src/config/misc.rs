//! `Misc` section: boot picker, debug, security and extra entries.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::{enabled, hex_bytes};
use crate::device_path::DevicePath;
use crate::errors::ConfigError;

/// Asset store integrity policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultPolicy {
    /// Use a vault when one is present
    #[default]
    Optional,
    /// Require `vault.json`; a signature is checked when a key is present
    Basic,
    /// Require `vault.json` signed under the embedded key
    Secure,
}

/// Console ownership after the picker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleBehaviour {
    /// Leave firmware defaults
    #[default]
    Keep,
    /// Switch to text mode
    Text,
    /// Switch to graphics mode
    Graphics,
    /// Force text mode and keep it
    ForceText,
    /// Force graphics mode and keep it
    ForceGraphics,
}

/// How hibernation wake images are detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum HibernateMode {
    #[default]
    None,
    Auto,
    #[serde(rename = "RTC")]
    Rtc,
    #[serde(rename = "NVRAM")]
    Nvram,
}

/// `Misc.Boot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct BootConfig {
    /// Show the picker instead of booting the default entry
    pub show_picker: bool,
    /// Picker timeout in seconds; 0 waits forever
    pub timeout: u32,
    /// Hide the entry of this loader itself
    pub hide_self: bool,
    /// Hide auxiliary entries until requested
    pub hide_auxiliary: bool,
    #[allow(missing_docs)]
    pub console_behaviour: ConsoleBehaviour,
    /// `Max`, `<width>x<height>` or empty for the current mode
    pub console_mode: String,
    #[allow(missing_docs)]
    pub hibernate_mode: HibernateMode,
    /// Delay in microseconds before starting the chosen image
    pub takeoff_delay: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            show_picker: false,
            timeout: 5,
            hide_self: true,
            hide_auxiliary: true,
            console_behaviour: ConsoleBehaviour::Keep,
            console_mode: String::new(),
            hibernate_mode: HibernateMode::None,
            takeoff_delay: 0,
        }
    }
}

/// `Misc.Debug`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct DebugConfig {
    /// Turn the firmware watchdog off
    pub disable_watchdog: bool,
    /// Log target bit mask
    pub target: u32,
}

/// `Misc.Security`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct SecurityConfig {
    #[allow(missing_docs)]
    pub vault: VaultPolicy,
    /// Volume and device classes the scanner may look at
    pub scan_policy: u32,
    /// Bit mask of diagnostics exposed to the OS
    pub expose_sensitive_data: u32,
    /// Allow choosing a persistent default from the picker
    pub allow_set_default: bool,
    /// Ask for the password before privileged picker actions
    pub enable_password: bool,
    /// blake3(salt || password)
    #[serde(with = "hex_bytes")]
    pub password_hash: Vec<u8>,
    #[allow(missing_docs)]
    #[serde(with = "hex_bytes")]
    pub password_salt: Vec<u8>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            vault: VaultPolicy::Optional,
            scan_policy: 0,
            expose_sensitive_data: EXPOSE_VERSION_VARIABLE | EXPOSE_VERSION_IN_MENU,
            allow_set_default: false,
            enable_password: false,
            password_hash: Vec::new(),
            password_salt: Vec::new(),
        }
    }
}

/// `ExposeSensitiveData` bit: version variable readable at runtime.
pub const EXPOSE_VERSION_VARIABLE: u32 = 0x02;

/// `ExposeSensitiveData` bit: version shown in the picker title.
pub const EXPOSE_VERSION_IN_MENU: u32 = 0x04;

/// Extra picker entry pointing at an arbitrary device path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct CustomEntry {
    /// Picker label
    pub name: String,
    /// Device path of the image
    pub path: DevicePath,
    /// Load options passed to the image
    #[serde(default)]
    pub arguments: String,
    /// Hidden with the auxiliary entries
    #[serde(default)]
    pub auxiliary: bool,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Tool image shipped in the `Tools` directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ToolEntry {
    /// Picker label
    pub name: String,
    /// Image relative to `Tools`
    pub path: String,
    /// Load options passed to the image
    #[serde(default)]
    pub arguments: String,
    /// Hidden with the auxiliary entries
    #[serde(default = "enabled")]
    pub auxiliary: bool,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// `Misc` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
#[allow(missing_docs)]
pub struct MiscConfig {
    pub boot: BootConfig,
    pub debug: DebugConfig,
    pub security: SecurityConfig,
    pub entries: Vec<CustomEntry>,
    pub tools: Vec<ToolEntry>,
}

/// Parsed `ConsoleMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Keep the current mode
    Current,
    /// Largest available mode
    Max,
    /// Explicit resolution
    Resolution(u32, u32),
}

/// Parse a `Max`, `<width>x<height>` or empty resolution string.
pub fn parse_resolution(text: &str) -> Option<ConsoleMode> {
    let text = text.trim();
    if text.is_empty() {
        return Some(ConsoleMode::Current);
    }
    if text.eq_ignore_ascii_case("max") {
        return Some(ConsoleMode::Max);
    }
    let (width, height) = text.split_once(['x', 'X'])?;
    let width = width.trim().parse().ok()?;
    let height = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(ConsoleMode::Resolution(width, height))
}

impl MiscConfig {
    /// Parsed console mode. Only meaningful on a validated tree.
    pub fn console_mode(&self) -> ConsoleMode {
        parse_resolution(&self.boot.console_mode).unwrap_or(ConsoleMode::Current)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if parse_resolution(&self.boot.console_mode).is_none() {
            return Err(ConfigError::invalid(
                "Misc.Boot.ConsoleMode",
                "expected Max, <width>x<height> or empty",
            ));
        }

        let security = &self.security;
        if security.enable_password {
            if security.password_hash.len() != blake3::OUT_LEN {
                return Err(ConfigError::invalid(
                    "Misc.Security.PasswordHash",
                    "must be a 32-byte blake3 digest",
                ));
            }
            if security.password_salt.is_empty() {
                return Err(ConfigError::invalid(
                    "Misc.Security.PasswordSalt",
                    "must not be empty when EnablePassword is set",
                ));
            }
        }

        for (index, tool) in self.tools.iter().enumerate() {
            if !tool.path.to_ascii_lowercase().ends_with(".efi") {
                return Err(ConfigError::invalid(
                    format!("Misc.Tools[{index}].Path"),
                    "must name an .efi image",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_boot_first_entry_unattended() {
        let misc: MiscConfig = serde_json::from_slice(b"{}").unwrap();
        assert!(!misc.boot.show_picker);
        assert!(misc.boot.hide_self);
        assert_eq!(misc.security.vault, VaultPolicy::Optional);
        assert_eq!(misc.console_mode(), ConsoleMode::Current);
    }

    #[test]
    fn resolutions() {
        assert_eq!(parse_resolution("MAX"), Some(ConsoleMode::Max));
        assert_eq!(
            parse_resolution("1920x1080"),
            Some(ConsoleMode::Resolution(1920, 1080))
        );
        assert_eq!(parse_resolution("0x768"), None);
        assert_eq!(parse_resolution("wide"), None);
    }

    #[test]
    fn password_requires_hash_and_salt() {
        let doc = br#"{"Security": {"EnablePassword": true, "PasswordHash": "00"}}"#;
        let misc: MiscConfig = serde_json::from_slice(doc).unwrap();
        assert!(misc.validate().is_err());
    }

    #[test]
    fn vault_policy_names() {
        let doc = br#"{"Security": {"Vault": "Secure"}, "Boot": {"HibernateMode": "NVRAM"}}"#;
        let misc: MiscConfig = serde_json::from_slice(doc).unwrap();
        assert_eq!(misc.security.vault, VaultPolicy::Secure);
        assert_eq!(misc.boot.hibernate_mode, HibernateMode::Nvram);
    }
}
