//! `NVRAM` section and the legacy `nvram.json` snapshot.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::hex_bytes;
use crate::guid::Guid;

/// Variable to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NvramVariable {
    /// Contents
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Boot-services only; never visible to the OS
    #[serde(default)]
    pub internal: bool,
}

/// `NVRAM` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct NvramConfig {
    /// Variables to create; existing variables are left untouched
    pub add: BTreeMap<Guid, BTreeMap<String, NvramVariable>>,
    /// Variables to remove before `add` runs
    pub delete: BTreeMap<Guid, Vec<String>>,
    /// Import the `nvram.json` snapshot
    pub legacy_enable: bool,
    /// Let snapshot values replace existing variables
    pub legacy_overwrite: bool,
    /// Snapshot variables allowed per GUID; `*` allows every name
    pub legacy_schema: BTreeMap<Guid, Vec<String>>,
    /// Persist written variables across resets
    pub write_flash: bool,
}

impl NvramConfig {
    /// Whether the legacy schema admits `guid:name`.
    pub fn schema_allows(&self, guid: &Guid, name: &str) -> bool {
        self.legacy_schema
            .get(guid)
            .map_or(false, |names| names.iter().any(|n| n == "*" || n == name))
    }
}

/// Contents of `nvram.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NvramSnapshot {
    /// Snapshot format version
    pub version: u32,
    /// Saved variables
    #[serde(default)]
    pub add: BTreeMap<Guid, BTreeMap<String, SnapshotValue>>,
}

/// Saved variable contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotValue(#[serde(with = "hex_bytes")] pub Vec<u8>);

/// Supported `nvram.json` version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::EFI_GLOBAL_VARIABLE;

    #[test]
    fn parses_guid_keyed_maps() {
        let doc = br#"{
            "Add": {"7C436110-AB2A-4BBB-A880-FE41995C9F82": {
                "boot-args": {"Data": "2D76"},
                "csr-active-config": {"Data": "00000000", "Internal": true}}},
            "Delete": {"8BE4DF61-93CA-11D2-AA0D-00E098032B8C": ["BootNext"]},
            "LegacySchema": {"8BE4DF61-93CA-11D2-AA0D-00E098032B8C": ["Boot0080", "*"]}
        }"#;
        let nvram: NvramConfig = serde_json::from_slice(doc).unwrap();
        let vars = nvram.add.values().next().unwrap();
        assert_eq!(vars["boot-args"].data, b"-v");
        assert!(vars["csr-active-config"].internal);
        assert_eq!(nvram.delete[&EFI_GLOBAL_VARIABLE], ["BootNext"]);
        assert!(nvram.schema_allows(&EFI_GLOBAL_VARIABLE, "Anything"));
    }

    #[test]
    fn schema_defaults_to_deny() {
        let nvram = NvramConfig::default();
        assert!(!nvram.schema_allows(&EFI_GLOBAL_VARIABLE, "BootOrder"));
    }

    #[test]
    fn bad_guid_key_is_rejected() {
        let doc = br#"{"Delete": {"not-a-guid": ["x"]}}"#;
        assert!(serde_json::from_slice::<NvramConfig>(doc).is_err());
    }
}
