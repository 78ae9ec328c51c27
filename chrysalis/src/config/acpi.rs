//! `ACPI` section.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{enabled, hex_bytes};
use crate::errors::ConfigError;
use crate::patcher::Pattern;

/// Four-character ACPI table signature such as `DSDT` or `SSDT`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableSignature(pub [u8; 4]);

impl TableSignature {
    /// Differentiated System Description Table
    pub const DSDT: Self = Self(*b"DSDT");
    /// Fixed ACPI Description Table
    pub const FADT: Self = Self(*b"FACP");
    /// Boot Graphics Resource Table
    pub const BGRT: Self = Self(*b"BGRT");
    /// Firmware ACPI Control Structure
    pub const FACS: Self = Self(*b"FACS");
}

impl fmt::Display for TableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableSignature({self})")
    }
}

impl Serialize for TableSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes: [u8; 4] = text
            .as_bytes()
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("`{text}` is not a 4-byte signature")))?;
        if !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(serde::de::Error::custom("table signature must be printable ASCII"));
        }
        Ok(Self(bytes))
    }
}

/// Insert a table from `ACPI\<Path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AcpiAdd {
    /// Table file relative to the ACPI directory
    pub path: String,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Remove tables matching signature and optional OEM table id / length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AcpiDelete {
    /// Table signature
    pub table_signature: TableSignature,
    /// OEM table id, space padded to 8 bytes; empty matches any
    #[serde(default)]
    pub oem_table_id: String,
    /// Table length; 0 matches any
    #[serde(default)]
    pub table_length: u32,
    /// Remove every match rather than the first
    #[serde(default)]
    pub all: bool,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Rename a table signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AcpiRename {
    /// Signature to replace
    pub from: TableSignature,
    /// Replacement signature
    pub to: TableSignature,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
}

/// Binary patch applied to table contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AcpiPatch {
    /// Restrict to tables with this signature
    #[serde(default)]
    pub table_signature: Option<TableSignature>,
    /// Restrict to tables with this OEM table id
    #[serde(default)]
    pub oem_table_id: String,
    /// Bytes to look for
    #[serde(with = "hex_bytes")]
    pub find: Vec<u8>,
    /// Bytes to write
    #[serde(with = "hex_bytes")]
    pub replace: Vec<u8>,
    /// Bits of `find` that must match; empty means all
    #[serde(with = "hex_bytes", default)]
    pub mask: Vec<u8>,
    /// Bits of `replace` to write; empty means all
    #[serde(with = "hex_bytes", default)]
    pub replace_mask: Vec<u8>,
    /// Maximum replacements; 0 means unlimited
    #[serde(default)]
    pub count: u32,
    /// Matches to skip before replacing
    #[serde(default)]
    pub skip: u32,
    /// Bytes of each table to search; 0 means whole table
    #[serde(default)]
    pub limit: u32,
    #[serde(default = "enabled")]
    #[allow(missing_docs)]
    pub enabled: bool,
    #[serde(default)]
    #[allow(missing_docs)]
    pub comment: String,
}

/// Built-in table fixups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct AcpiQuirks {
    /// Set the reset register and flag in FADT
    pub fadt_enable_reset: bool,
    /// Strip trailing spaces and garbage from table headers
    pub normalize_headers: bool,
    /// Zero the hardware signature in FACS
    pub reset_hw_sig: bool,
    /// Clear the displayed flag in BGRT
    pub reset_logo_status: bool,
}

/// `ACPI` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct AcpiConfig {
    #[allow(missing_docs)]
    pub add: Vec<AcpiAdd>,
    #[allow(missing_docs)]
    pub delete: Vec<AcpiDelete>,
    #[allow(missing_docs)]
    pub rename: Vec<AcpiRename>,
    #[allow(missing_docs)]
    pub patch: Vec<AcpiPatch>,
    #[allow(missing_docs)]
    pub quirks: AcpiQuirks,
}

impl AcpiPatch {
    /// Matching parameters of this patch.
    pub fn pattern(&self) -> Pattern<'_> {
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

impl AcpiConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (index, patch) in self.patch.iter().enumerate() {
            if patch.oem_table_id.len() > 8 {
                return Err(ConfigError::invalid(
                    format!("ACPI.Patch[{index}].OemTableId"),
                    "longer than 8 bytes",
                ));
            }
            patch
                .pattern()
                .check()
                .map_err(|reason| ConfigError::invalid(format!("ACPI.Patch[{index}]"), reason))?;
        }
        for (index, delete) in self.delete.iter().enumerate() {
            if delete.oem_table_id.len() > 8 {
                return Err(ConfigError::invalid(
                    format!("ACPI.Delete[{index}].OemTableId"),
                    "longer than 8 bytes",
                ));
            }
        }
        Ok(())
    }
}

/// Space-pad an OEM table id to its 8-byte header form.
pub fn padded_oem_table_id(id: &str) -> [u8; 8] {
    let mut out = [b' '; 8];
    for (slot, b) in out.iter_mut().zip(id.bytes()) {
        *slot = b;
    }
    out
}
