//! Boot: pick an entry and start it.
//!
//! ```text
//!  scan ──> hide self ──> + Entries + Tools ──> default (BootNext, BootOrder)
//!                                                   │
//!              picker loop (privileged: auxiliary, set default) <──┘
//!                                                   │
//!              Boot0080 + BootOrder ──> image_start ──> returns = failure
//! ```
//!
//! Boot options live under the global variable GUID, or under the vendor GUID
//! when boot variable routing is requested so the firmware never sees them.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device_path::DevicePath;
use crate::errors::{BootError, FirmwareError};
use crate::firmware::{BootEntrySource, BootPicker, LoadHandle, VariableAttributes, VariableStore};
use crate::guid::{Guid, CHRYSALIS_VENDOR, EFI_GLOBAL_VARIABLE};
use crate::misc::privilege::PrivilegeContext;
use crate::misc::ScreenSettings;
use crate::paths::{asset_path, IMAGE_PATH, ROOT_PATH, TOOL_PATH};
use crate::storage::Storage;

/// Boot option number Chrysalis writes for the chosen entry.
pub const BOOT_OPTION_NUMBER: u16 = 0x0080;

/// `LOAD_OPTION_ACTIVE`.
pub const LOAD_OPTION_ACTIVE: u32 = 0x0000_0001;

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Found by the volume scanner
    Scanned,
    /// `Misc.Entries`
    Custom,
    /// `Misc.Tools`, image read from the asset store
    Tool {
        /// Path relative to the `Tools` directory
        asset: String,
    },
}

/// One bootable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    /// Picker label
    pub name: String,
    /// Image location
    pub path: DevicePath,
    /// Load options passed to the image
    pub arguments: String,
    /// Hidden until auxiliary entries are requested
    pub auxiliary: bool,
    #[allow(missing_docs)]
    pub kind: EntryKind,
}

impl BootEntry {
    /// Entry found on a scanned volume.
    pub fn scanned(name: &str, path: DevicePath) -> Self {
        Self {
            name: String::from(name),
            path,
            arguments: String::new(),
            auxiliary: false,
            kind: EntryKind::Scanned,
        }
    }
}

/// What the picker shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickerMenu {
    /// Title line
    pub title: String,
    /// Visible entries
    pub entries: Vec<BootEntry>,
    /// Index into `entries` booted on timeout
    pub default_index: usize,
    /// Seconds; 0 waits forever
    pub timeout: u32,
    /// Whether `SetDefault` is offered
    pub allow_set_default: bool,
}

/// User input from the picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerAction {
    /// Boot the entry at this menu index
    Boot(usize),
    /// Make the entry at this menu index the default, then boot it
    SetDefault(usize),
    /// Reveal auxiliary entries
    ShowAuxiliary,
    /// Timer expired
    Timeout,
    /// Leave the picker without booting
    Abort,
}

/// What the image-start capability receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Entry label
    pub name: String,
    /// Image location
    pub path: DevicePath,
    /// Load options
    pub arguments: String,
    /// Preloaded image; tools only
    pub image: Option<Vec<u8>>,
    /// Microseconds to wait before starting
    pub takeoff_delay: u32,
}

/// Capabilities the Boot stage drives.
pub struct BootServices<'b> {
    /// Volume scanner
    pub scanner: &'b mut dyn BootEntrySource,
    /// Interactive picker
    pub picker: &'b mut dyn BootPicker,
    /// Variable store for boot options
    pub variables: &'b mut dyn VariableStore,
}

/// Image-start capability. Returning at all means the image gave control back.
pub type ImageStart<'a> = dyn FnMut(&StartRequest) -> Result<(), FirmwareError> + 'a;

/// Decoded `EFI_LOAD_OPTION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOption {
    #[allow(missing_docs)]
    pub attributes: u32,
    #[allow(missing_docs)]
    pub description: String,
    #[allow(missing_docs)]
    pub path: DevicePath,
    /// UTF-16 load options
    pub arguments: String,
}

impl LoadOption {
    /// `attributes | path list length | description | path list | optional data`
    pub fn encode(&self) -> Vec<u8> {
        let path = self.path.to_load_option_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(&self.attributes.to_le_bytes());
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        push_utf16z(&mut out, &self.description);
        out.extend_from_slice(&path);
        for unit in self.arguments.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    /// Inverse of [`LoadOption::encode`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let attributes = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let path_len = u16::from_le_bytes(bytes.get(4..6)?.try_into().ok()?) as usize;
        let rest = bytes.get(6..)?;

        let mut units = Vec::new();
        let mut consumed = 0;
        for pair in rest.chunks_exact(2) {
            consumed += 2;
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        let description = String::from_utf16(&units).ok()?;

        let path = DevicePath::from_load_option_bytes(rest.get(consumed..consumed + path_len)?)?;
        let optional = rest.get(consumed + path_len..)?;
        if optional.len() % 2 != 0 {
            return None;
        }
        let optional: Vec<u16> = optional
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(Self {
            attributes,
            description,
            path,
            arguments: String::from_utf16(&optional).ok()?,
        })
    }
}

fn push_utf16z(out: &mut Vec<u8>, text: &str) {
    for unit in text.encode_utf16().chain(core::iter::once(0)) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

/// `Boot####` variable name.
pub fn boot_option_name(number: u16) -> String {
    format!("Boot{number:04X}")
}

fn parse_u16_list(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Run the boot picker and start the chosen entry.
///
/// Only returns when no entry could be started or the started image gave
/// control back.
pub fn boot(
    storage: &Storage<'_>,
    config: &Config,
    privilege: Option<&PrivilegeContext>,
    services: BootServices<'_>,
    image_start: &mut ImageStart<'_>,
    custom_boot_guid: bool,
    load_handle: Option<&LoadHandle>,
) -> BootError {
    let BootServices {
        scanner,
        picker,
        variables,
    } = services;
    let misc = &config.misc;
    let namespace = if custom_boot_guid {
        CHRYSALIS_VENDOR
    } else {
        EFI_GLOBAL_VARIABLE
    };

    let entries = collect_entries(config, scanner, load_handle);
    if entries.is_empty() {
        warn!("no boot entries");
        return BootError::NoEntries;
    }
    let default = default_entry(&entries, variables, &namespace);
    info!(
        entries = entries.len(),
        default = %entries[default].name,
        picker = misc.boot.show_picker,
        "boot entries ready"
    );

    let mut gate = Gate {
        context: privilege,
        required: misc.security.enable_password,
        granted: false,
        denied: false,
    };
    let mut show_auxiliary = !misc.boot.hide_auxiliary;
    let (chosen, persist) = if misc.boot.show_picker {
        let title = ScreenSettings::from_config(config).title;
        loop {
            let visible: Vec<usize> = (0..entries.len())
                .filter(|&i| show_auxiliary || !entries[i].auxiliary)
                .collect();
            let menu = PickerMenu {
                title: title.clone(),
                entries: visible.iter().map(|&i| entries[i].clone()).collect(),
                default_index: visible.iter().position(|&i| i == default).unwrap_or(0),
                timeout: misc.boot.timeout,
                allow_set_default: misc.security.allow_set_default,
            };
            match picker.choose(&menu) {
                PickerAction::Boot(index) => match visible.get(index) {
                    Some(&entry) => break (entry, false),
                    None => warn!(index, "picker returned an invalid entry"),
                },
                PickerAction::Timeout => break (default, false),
                PickerAction::SetDefault(index) => {
                    let entry = match visible.get(index) {
                        Some(&entry) => entry,
                        None => {
                            warn!(index, "picker returned an invalid entry");
                            continue;
                        }
                    };
                    if !misc.security.allow_set_default {
                        warn!("setting the default entry is disabled");
                    } else if gate.pass(picker) {
                        break (entry, true);
                    }
                }
                PickerAction::ShowAuxiliary => {
                    if !show_auxiliary && gate.pass(picker) {
                        show_auxiliary = true;
                    }
                }
                PickerAction::Abort => return BootError::Aborted,
            }
        }
    } else {
        (default, false)
    };

    let entry = &entries[chosen];
    record_boot_option(variables, &namespace, entry, persist);

    let image = match &entry.kind {
        EntryKind::Tool { asset } => match storage.read(&asset_path(TOOL_PATH, asset)) {
            Ok(image) => Some(image),
            Err(source) => {
                warn!(entry = %entry.name, error = %source, "tool image unavailable");
                return BootError::ImageUnavailable {
                    name: entry.name.clone(),
                    source,
                };
            }
        },
        _ => None,
    };

    let request = StartRequest {
        name: entry.name.clone(),
        path: entry.path.clone(),
        arguments: entry.arguments.clone(),
        image,
        takeoff_delay: misc.boot.takeoff_delay,
    };
    info!(entry = %request.name, path = %request.path, "starting image");
    match image_start(&request) {
        Ok(()) => BootError::Returned(request.name),
        Err(source) => BootError::StartFailed {
            name: request.name,
            source,
        },
    }
}

struct Gate<'p> {
    context: Option<&'p PrivilegeContext>,
    required: bool,
    granted: bool,
    denied: bool,
}

impl Gate<'_> {
    // Asks at most once per boot; without a context a required password
    // can never be satisfied.
    fn pass(&mut self, picker: &mut dyn BootPicker) -> bool {
        if !self.required || self.granted {
            return true;
        }
        if self.denied {
            warn!("privileged actions locked for this boot");
            return false;
        }
        self.granted = match self.context {
            Some(context) => context.authorize(picker),
            None => {
                warn!("password required but no privilege context");
                false
            }
        };
        self.denied = !self.granted;
        self.granted
    }
}

fn collect_entries(
    config: &Config,
    scanner: &mut dyn BootEntrySource,
    load_handle: Option<&LoadHandle>,
) -> Vec<BootEntry> {
    let misc = &config.misc;
    let mut entries = scanner.scan(misc.security.scan_policy, load_handle);
    if misc.boot.hide_self {
        entries.retain(|entry| {
            let own = entry.path.ends_with_file(IMAGE_PATH);
            if own {
                debug!(path = %entry.path, "hiding own entry");
            }
            !own
        });
    }

    entries.extend(misc.entries.iter().filter(|e| e.enabled).map(|custom| BootEntry {
        name: custom.name.clone(),
        path: custom.path.clone(),
        arguments: custom.arguments.clone(),
        auxiliary: custom.auxiliary,
        kind: EntryKind::Custom,
    }));

    for tool in misc.tools.iter().filter(|t| t.enabled) {
        let location = format!("\\{}", asset_path(&asset_path(ROOT_PATH, TOOL_PATH), &tool.path));
        match DevicePath::parse(&location) {
            Ok(path) => entries.push(BootEntry {
                name: tool.name.clone(),
                path,
                arguments: tool.arguments.clone(),
                auxiliary: tool.auxiliary,
                kind: EntryKind::Tool {
                    asset: tool.path.clone(),
                },
            }),
            Err(e) => warn!(tool = %tool.name, error = %e, "tool path rejected"),
        }
    }
    entries
}

// BootNext is consumed on read, like firmware does.
fn default_entry(entries: &[BootEntry], variables: &mut dyn VariableStore, namespace: &Guid) -> usize {
    let mut candidates = Vec::new();
    if let Ok(next) = variables.get(namespace, "BootNext") {
        candidates.extend(parse_u16_list(&next.data).into_iter().take(1));
        if let Err(e) = variables.delete(namespace, "BootNext") {
            warn!(error = %e, "BootNext could not be cleared");
        }
    }
    if let Ok(order) = variables.get(namespace, "BootOrder") {
        candidates.extend(parse_u16_list(&order.data));
    }

    for number in candidates {
        let option = variables
            .get(namespace, &boot_option_name(number))
            .ok()
            .and_then(|variable| LoadOption::decode(&variable.data));
        if let Some(option) = option {
            if let Some(index) = entries.iter().position(|e| e.path == option.path) {
                debug!(option = %boot_option_name(number), "default from boot options");
                return index;
            }
        }
    }
    0
}

// Only SetDefault writes non-volatile variables. A plain boot never
// replaces a persistent one.
fn record_boot_option(variables: &mut dyn VariableStore, namespace: &Guid, entry: &BootEntry, persist: bool) {
    let attributes = if persist {
        VariableAttributes::EXTERNAL | VariableAttributes::NON_VOLATILE
    } else {
        VariableAttributes::EXTERNAL
    };
    let option = LoadOption {
        attributes: LOAD_OPTION_ACTIVE,
        description: entry.name.clone(),
        path: entry.path.clone(),
        arguments: entry.arguments.clone(),
    };
    let name = boot_option_name(BOOT_OPTION_NUMBER);
    if !store_boot_variable(variables, namespace, &name, attributes, &option.encode()) {
        return;
    }

    let mut order = vec![BOOT_OPTION_NUMBER];
    if let Ok(existing) = variables.get(namespace, "BootOrder") {
        order.extend(
            parse_u16_list(&existing.data)
                .into_iter()
                .filter(|n| *n != BOOT_OPTION_NUMBER),
        );
    }
    let bytes: Vec<u8> = order.iter().flat_map(|n| n.to_le_bytes()).collect();
    store_boot_variable(variables, namespace, "BootOrder", attributes, &bytes);
}

// Returns whether `name` now holds `data`.
fn store_boot_variable(
    variables: &mut dyn VariableStore,
    namespace: &Guid,
    name: &str,
    attributes: VariableAttributes,
    data: &[u8],
) -> bool {
    if let Ok(existing) = variables.get(namespace, name) {
        let persistent = existing.attributes.contains(VariableAttributes::NON_VOLATILE);
        if persistent && !attributes.contains(VariableAttributes::NON_VOLATILE) {
            debug!(variable = %name, "keeping persistent variable");
            return false;
        }
        // Attributes of an existing variable cannot change in place.
        if existing.attributes != attributes {
            if let Err(e) = variables.delete(namespace, name) {
                warn!(variable = %name, error = %e, "could not replace variable");
                return false;
            }
        }
    }
    match variables.set(namespace, name, attributes, data) {
        Ok(()) => true,
        Err(e) => {
            warn!(variable = %name, error = %e, "boot variable not written");
            false
        }
    }
}
