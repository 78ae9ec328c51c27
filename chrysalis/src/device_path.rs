//! Textual device paths, e.g. `PciRoot(0x0)/Pci(0x1F,0x3)`.
//!
//! Binary device path encoding belongs to firmware; Chrysalis only checks the
//! text form is well-formed and compares paths node by node.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Parsed textual device path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePath {
    text: String,
}

/// Reason a device path string was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePathError {
    /// Path is empty
    Empty,
    /// Node has no `Name(args)` shape and is not a file path
    MalformedNode(String),
}

impl fmt::Display for DevicePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePathError::Empty => write!(f, "device path is empty"),
            DevicePathError::MalformedNode(node) => write!(f, "malformed device path node `{node}`"),
        }
    }
}

impl DevicePath {
    /// Validate and wrap a device path string.
    pub fn parse(text: &str) -> Result<Self, DevicePathError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DevicePathError::Empty);
        }
        for node in nodes(text) {
            if !is_valid_node(node) {
                return Err(DevicePathError::MalformedNode(String::from(node)));
            }
        }
        Ok(Self {
            text: String::from(text),
        })
    }

    /// Text form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the final file path node ends with `suffix`, compared
    /// case-insensitively and ignoring the separator style.
    pub fn ends_with_file(&self, suffix: &str) -> bool {
        let normalize = |s: &str| -> String {
            s.chars()
                .map(|c| if c == '/' { '\\' } else { c.to_ascii_lowercase() })
                .collect()
        };
        let file = match self.text.find('\\') {
            Some(start) => normalize(&self.text[start..]),
            None => return false,
        };
        let suffix = normalize(suffix);
        let suffix = suffix.trim_start_matches('\\');
        file.ends_with(suffix)
            && file[..file.len() - suffix.len()].ends_with('\\')
    }

    /// UTF-16LE text with terminator, used as the file path list of load options.
    pub fn to_load_option_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.text.len() + 1) * 2);
        for unit in self.text.encode_utf16().chain(core::iter::once(0)) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    /// Inverse of [`DevicePath::to_load_option_bytes`].
    pub fn from_load_option_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 2 != 0 {
            return None;
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0)
            .collect();
        let text = String::from_utf16(&units).ok()?;
        Self::parse(&text).ok()
    }
}

// A file path node such as `\EFI\BOOT\BOOTx64.efi` may contain '/' as a
// separator once the first backslash appears, so split only before it.
fn nodes(text: &str) -> impl Iterator<Item = &str> {
    let (device, file) = match text.find('\\') {
        Some(start) => (text[..start].trim_end_matches('/'), Some(&text[start..])),
        None => (text, None),
    };
    device
        .split('/')
        .filter(|node| !node.is_empty())
        .chain(file)
}

fn is_valid_node(node: &str) -> bool {
    if node.starts_with('\\') {
        return node.len() > 1;
    }
    let open = match node.find('(') {
        Some(open) => open,
        None => return false,
    };
    let name = &node[..open];
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric())
        && node.ends_with(')')
        && !node[open + 1..node.len() - 1].contains(['(', ')'])
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePath({})", self.text)
    }
}

impl Serialize for DevicePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for DevicePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        DevicePath::parse(&text).map_err(serde::de::Error::custom)
    }
}
