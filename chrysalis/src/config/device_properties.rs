//! `DeviceProperties` section.
//!
//! Devices are keyed by their textual device path. Paths are kept as strings
//! here so one malformed path fails only its own entries at load time.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

/// Property value as a hex byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyValue(#[serde(with = "super::hex_bytes")] pub Vec<u8>);

/// `DeviceProperties` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct DevicePropertiesConfig {
    /// Properties to set, per device
    pub add: BTreeMap<String, BTreeMap<String, PropertyValue>>,
    /// Property names to remove, per device
    pub delete: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_maps() {
        let doc = br#"{
            "Add": {"PciRoot(0x0)/Pci(0x2,0x0)": {"AAPL,ig-platform-id": "07009B3E"}},
            "Delete": {"PciRoot(0x0)/Pci(0x1F,0x3)": ["layout-id"]}
        }"#;
        let props: DevicePropertiesConfig = serde_json::from_slice(doc).unwrap();
        let device = &props.add["PciRoot(0x0)/Pci(0x2,0x0)"];
        assert_eq!(device["AAPL,ig-platform-id"].0, [0x07, 0x00, 0x9B, 0x3E]);
        assert_eq!(props.delete["PciRoot(0x0)/Pci(0x1F,0x3)"], ["layout-id"]);
    }
}
