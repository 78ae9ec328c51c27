// chrysalis/tests/common/mod.rs
// In-memory firmware for pipeline tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use chrysalis::device_path::DevicePath;
use chrysalis::firmware::{
    AcpiTables, BootEntrySource, BootPicker, BootScreen, DevicePropertyDatabase, DriverHandle,
    IdentityReporter, ImageLocator, KernelInterceptor, LoadHandle, PlatformTimer, UefiServices,
    Variable, VariableAttributes, VariableStore,
};
use chrysalis::guid::Guid;
use chrysalis::misc::boot::{BootEntry, PickerAction, PickerMenu};
use chrysalis::misc::ScreenSettings;
use chrysalis::stage::acpi::AcpiTable;
use chrysalis::stage::kernel::KernelPlan;
use chrysalis::stage::platform::PlatformIdentity;
use chrysalis::stage::uefi::{ConsoleOutput, ProtocolOverride, UefiQuirk};
use chrysalis::vault::VaultManifest;
use chrysalis::{AssetSource, Firmware, FirmwareError};
use ed25519_dalek::{Signer, SigningKey};
use zeroize::Zeroizing;

pub const ROOT: &str = "EFI\\CHRYSALIS\\";

/// Ordered log of every capability call.
#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<&'static str>>>);

impl Journal {
    pub fn record(&self, event: &'static str) {
        self.0.borrow_mut().push(event);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.borrow().iter().filter(|e| **e == event).count()
    }

    /// First occurrence of each event, in order.
    pub fn first_seen(&self) -> Vec<&'static str> {
        let mut seen = Vec::new();
        for event in self.0.borrow().iter() {
            if !seen.contains(event) {
                seen.push(*event);
            }
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Boot volume.
#[derive(Clone, Default)]
pub struct Volume(pub BTreeMap<String, Vec<u8>>);

impl Volume {
    pub fn with_config(config: &str) -> Self {
        let mut volume = Self::default();
        volume.put("config.json", config.as_bytes());
        volume
    }

    pub fn put(&mut self, relative: &str, data: &[u8]) {
        self.0.insert(format!("{ROOT}{relative}"), data.to_vec());
    }

    pub fn get_mut(&mut self, relative: &str) -> Option<&mut Vec<u8>> {
        self.0.get_mut(&format!("{ROOT}{relative}"))
    }

    /// Hash every file into `vault.json` and sign it.
    pub fn sign(&mut self, signer: &SigningKey) {
        let mut manifest = VaultManifest::new();
        for (path, data) in &self.0 {
            if let Some(relative) = path.strip_prefix(ROOT) {
                if !relative.starts_with("vault.") {
                    manifest.insert(relative, data);
                }
            }
        }
        let json = manifest.to_json();
        let signature = signer.sign(&json).to_bytes();
        self.put("vault.json", &json);
        self.put("vault.sig", &signature);
    }
}

impl AssetSource for Volume {
    fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError> {
        self.0.get(path).cloned().ok_or(FirmwareError::NotFound)
    }
}

/// SDT with a correct checksum.
pub fn sdt(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(36 + body.len());
    data.extend_from_slice(signature);
    data.extend_from_slice(&((36 + body.len()) as u32).to_le_bytes());
    data.push(2);
    data.push(0);
    data.extend_from_slice(b"CHRYSL");
    data.extend_from_slice(b"TESTTBL ");
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(b"TEST");
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(body);
    let sum = data.iter().fold(0u8, |s, b| s.wrapping_add(*b));
    data[9] = 0u8.wrapping_sub(sum);
    data
}

pub struct Acpi {
    pub journal: Journal,
    pub installed: Vec<AcpiTable>,
    pub publishes: u32,
}

impl AcpiTables for Acpi {
    fn tables(&self) -> Result<Vec<AcpiTable>, FirmwareError> {
        self.journal.record("acpi");
        Ok(self.installed.clone())
    }

    fn publish(&mut self, tables: Vec<AcpiTable>) -> Result<(), FirmwareError> {
        self.journal.record("acpi");
        self.installed = tables;
        self.publishes += 1;
        Ok(())
    }
}

pub struct Properties {
    pub journal: Journal,
    pub repo: BTreeMap<(String, String), Vec<u8>>,
}

impl DevicePropertyDatabase for Properties {
    fn set(&mut self, device: &DevicePath, name: &str, value: &[u8]) -> Result<(), FirmwareError> {
        self.journal.record("device-properties");
        self.repo
            .insert((device.as_str().to_owned(), name.to_owned()), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, device: &DevicePath, name: &str) -> Result<(), FirmwareError> {
        self.journal.record("device-properties");
        self.repo.remove(&(device.as_str().to_owned(), name.to_owned()));
        Ok(())
    }
}

pub struct Kernel {
    pub journal: Journal,
    pub plan: Option<KernelPlan>,
    pub reject: bool,
    pub installs: u32,
    pub uninstalls: u32,
}

impl KernelInterceptor for Kernel {
    fn install(&mut self, plan: KernelPlan) -> Result<(), FirmwareError> {
        self.journal.record("kernel");
        self.installs += 1;
        if self.reject {
            return Err(FirmwareError::AccessDenied);
        }
        self.plan = Some(plan);
        Ok(())
    }

    fn uninstall(&mut self) -> Result<(), FirmwareError> {
        self.journal.record("kernel-unload");
        self.uninstalls += 1;
        self.plan = None;
        Ok(())
    }
}

pub struct Variables {
    pub journal: Journal,
    pub vars: BTreeMap<(Guid, String), Variable>,
    pub writes: u32,
}

impl VariableStore for Variables {
    fn get(&self, guid: &Guid, name: &str) -> Result<Variable, FirmwareError> {
        self.vars
            .get(&(*guid, name.to_owned()))
            .cloned()
            .ok_or(FirmwareError::NotFound)
    }

    fn set(
        &mut self,
        guid: &Guid,
        name: &str,
        attributes: VariableAttributes,
        data: &[u8],
    ) -> Result<(), FirmwareError> {
        self.journal.record("nvram");
        self.writes += 1;
        self.vars.insert(
            (*guid, name.to_owned()),
            Variable {
                attributes,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn delete(&mut self, guid: &Guid, name: &str) -> Result<(), FirmwareError> {
        self.journal.record("nvram");
        self.vars
            .remove(&(*guid, name.to_owned()))
            .map(|_| ())
            .ok_or(FirmwareError::NotFound)
    }
}

pub struct Identity {
    pub journal: Journal,
    pub smbios: Option<PlatformIdentity>,
}

impl IdentityReporter for Identity {
    fn update_data_hub(&mut self, _identity: &PlatformIdentity) -> Result<(), FirmwareError> {
        self.journal.record("platform");
        Ok(())
    }

    fn update_smbios(&mut self, identity: &PlatformIdentity) -> Result<(), FirmwareError> {
        self.journal.record("platform");
        self.smbios = Some(identity.clone());
        Ok(())
    }
}

pub struct Uefi {
    pub journal: Journal,
    pub loaded: Vec<String>,
    pub started: u32,
}

impl UefiServices for Uefi {
    fn install_protocol(&mut self, _protocol: ProtocolOverride) -> Result<(), FirmwareError> {
        self.journal.record("uefi");
        Ok(())
    }

    fn apply_quirk(&mut self, _quirk: UefiQuirk) -> Result<(), FirmwareError> {
        self.journal.record("uefi");
        Ok(())
    }

    fn load_driver(&mut self, path: &str, _image: &[u8]) -> Result<DriverHandle, FirmwareError> {
        self.journal.record("uefi");
        self.loaded.push(path.to_owned());
        Ok(DriverHandle(self.loaded.len() as u64))
    }

    fn start_driver(&mut self, _handle: DriverHandle) -> Result<(), FirmwareError> {
        self.journal.record("uefi");
        self.started += 1;
        Ok(())
    }

    fn connect_controllers(&mut self) -> Result<(), FirmwareError> {
        self.journal.record("uefi");
        Ok(())
    }

    fn configure_console(&mut self, _output: &ConsoleOutput) -> Result<(), FirmwareError> {
        self.journal.record("uefi");
        Ok(())
    }
}

pub struct Timer {
    pub journal: Journal,
}

impl PlatformTimer for Timer {
    fn set_timer_resolution(&mut self, _period: u32) -> Result<(), FirmwareError> {
        self.journal.record("quirks-loaded");
        Ok(())
    }

    fn disable_watchdog(&mut self) -> Result<(), FirmwareError> {
        self.journal.record("quirks-loaded");
        Ok(())
    }
}

pub struct Locator;

impl ImageLocator for Locator {
    fn locate(&self, _path: &DevicePath) -> Result<u64, FirmwareError> {
        Ok(0xB007)
    }
}

pub struct Screen {
    pub journal: Journal,
}

impl BootScreen for Screen {
    fn configure(&mut self, _settings: &ScreenSettings) -> Result<(), FirmwareError> {
        self.journal.record("late-init");
        Ok(())
    }
}

pub struct Scanner {
    pub journal: Journal,
    pub entries: Vec<BootEntry>,
    pub seen_handle: Option<LoadHandle>,
}

impl BootEntrySource for Scanner {
    fn scan(&mut self, _policy: u32, load_handle: Option<&LoadHandle>) -> Vec<BootEntry> {
        self.journal.record("boot");
        self.seen_handle = load_handle.cloned();
        self.entries.clone()
    }
}

pub struct Picker {
    pub actions: Vec<PickerAction>,
}

impl BootPicker for Picker {
    fn choose(&mut self, _menu: &PickerMenu) -> PickerAction {
        if self.actions.is_empty() {
            PickerAction::Timeout
        } else {
            self.actions.remove(0)
        }
    }

    fn read_password(&mut self) -> Option<Zeroizing<String>> {
        None
    }
}

/// Every capability, sharing one journal.
pub struct Machine {
    pub journal: Journal,
    pub acpi: Acpi,
    pub properties: Properties,
    pub kernel: Kernel,
    pub variables: Variables,
    pub identity: Identity,
    pub uefi: Uefi,
    pub timer: Timer,
    pub screen: Screen,
    pub scanner: Scanner,
    pub picker: Picker,
}

impl Machine {
    pub fn new() -> Self {
        let journal = Journal::default();
        let macos = BootEntry::scanned(
            "macOS",
            DevicePath::parse("PciRoot(0x0)/Pci(0x1F,0x2)/\\System\\Library\\CoreServices\\boot.efi")
                .unwrap(),
        );
        Self {
            acpi: Acpi {
                journal: journal.clone(),
                installed: vec![
                    AcpiTable::parse(sdt(b"DSDT", &[0x10; 16])).unwrap(),
                    AcpiTable::parse(sdt(b"SSDT", &[0x20; 8])).unwrap(),
                ],
                publishes: 0,
            },
            properties: Properties {
                journal: journal.clone(),
                repo: BTreeMap::new(),
            },
            kernel: Kernel {
                journal: journal.clone(),
                plan: None,
                reject: false,
                installs: 0,
                uninstalls: 0,
            },
            variables: Variables {
                journal: journal.clone(),
                vars: BTreeMap::new(),
                writes: 0,
            },
            identity: Identity {
                journal: journal.clone(),
                smbios: None,
            },
            uefi: Uefi {
                journal: journal.clone(),
                loaded: Vec::new(),
                started: 0,
            },
            timer: Timer {
                journal: journal.clone(),
            },
            screen: Screen {
                journal: journal.clone(),
            },
            scanner: Scanner {
                journal: journal.clone(),
                entries: vec![macos],
                seen_handle: None,
            },
            picker: Picker { actions: Vec::new() },
            journal,
        }
    }

    pub fn firmware(&mut self) -> Firmware<'_> {
        Firmware {
            acpi: &mut self.acpi,
            device_properties: &mut self.properties,
            kernel: &mut self.kernel,
            variables: &mut self.variables,
            identity: &mut self.identity,
            uefi: &mut self.uefi,
            timer: &mut self.timer,
            locator: &Locator,
            screen: &mut self.screen,
            scanner: &mut self.scanner,
            picker: &mut self.picker,
        }
    }
}
