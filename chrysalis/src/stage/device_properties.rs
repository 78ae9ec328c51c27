//! Device-Properties stage. Delete runs before Add and Add overwrites, so
//! loading the same section twice leaves the repository unchanged.

use alloc::format;

use crate::config::Config;
use crate::device_path::DevicePath;
use crate::firmware::DevicePropertyDatabase;
use crate::stage::{Stage, StageOutcome, StageReport};

/// Apply the `DeviceProperties` section.
pub fn load_device_properties(config: &Config, db: &mut dyn DevicePropertyDatabase) -> StageOutcome {
    let props = match &config.device_properties {
        Some(props) => props,
        None => return StageOutcome::Skipped,
    };
    let mut report = StageReport::new(Stage::DeviceProperties);

    for (device, names) in &props.delete {
        let path = match DevicePath::parse(device) {
            Ok(path) => path,
            Err(e) => {
                report.failed(&format!("Delete {device}"), e);
                continue;
            }
        };
        for name in names {
            let op = format!("Delete {device} {name}");
            match db.remove(&path, name) {
                Ok(()) => report.applied(&op),
                Err(e) => report.failed(&op, e),
            }
        }
    }

    for (device, properties) in &props.add {
        let path = match DevicePath::parse(device) {
            Ok(path) => path,
            Err(e) => {
                report.failed(&format!("Add {device}"), e);
                continue;
            }
        };
        for (name, value) in properties {
            let op = format!("Add {device} {name}");
            match db.set(&path, name, &value.0) {
                Ok(()) => report.applied(&op),
                Err(e) => report.failed(&op, e),
            }
        }
    }

    report.into_outcome()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device_properties::{DevicePropertiesConfig, PropertyValue};
    use crate::errors::FirmwareError;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    #[derive(Default, PartialEq, Debug, Clone)]
    struct Repo(BTreeMap<(String, String), Vec<u8>>);

    impl DevicePropertyDatabase for Repo {
        fn set(&mut self, device: &DevicePath, name: &str, value: &[u8]) -> Result<(), FirmwareError> {
            if name.is_empty() {
                return Err(FirmwareError::InvalidParameter);
            }
            self.0
                .insert((String::from(device.as_str()), String::from(name)), value.to_vec());
            Ok(())
        }

        fn remove(&mut self, device: &DevicePath, name: &str) -> Result<(), FirmwareError> {
            self.0.remove(&(String::from(device.as_str()), String::from(name)));
            Ok(())
        }
    }

    fn config() -> Config {
        let mut gpu = BTreeMap::new();
        gpu.insert(String::from("AAPL,ig-platform-id"), PropertyValue(vec![7, 0, 0x9B, 0x3E]));
        gpu.insert(String::from(""), PropertyValue(vec![1]));
        let mut add = BTreeMap::new();
        add.insert(String::from("PciRoot(0x0)/Pci(0x2,0x0)"), gpu);
        add.insert(String::from("not a path"), BTreeMap::new());

        let mut delete = BTreeMap::new();
        delete.insert(String::from("PciRoot(0x0)/Pci(0x2,0x0)"), vec![String::from("device-id")]);

        Config {
            device_properties: Some(DevicePropertiesConfig { add, delete }),
            ..Config::default()
        }
    }

    #[test]
    fn failures_are_isolated_per_entry() {
        let mut repo = Repo::default();
        let outcome = load_device_properties(&config(), &mut repo);
        let report = outcome.report().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(repo.0.len(), 1);
    }

    #[test]
    fn loading_twice_matches_loading_once() {
        let mut once = Repo::default();
        load_device_properties(&config(), &mut once);
        let mut twice = once.clone();
        load_device_properties(&config(), &mut twice);
        assert_eq!(once, twice);
    }
}
