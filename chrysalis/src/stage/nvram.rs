//! NVRAM stage.
//!
//! Order: Delete, legacy snapshot import, Add, version record. Each write is
//! independent and a rejected write only fails itself. Variables marked
//! internal are written with boot-services access only, so the OS never
//! sees them.

use alloc::format;

use tracing::debug;

use crate::config::misc::EXPOSE_VERSION_VARIABLE;
use crate::config::nvram::{NvramConfig, NvramSnapshot, SNAPSHOT_VERSION};
use crate::config::Config;
use crate::errors::{FirmwareError, StorageError};
use crate::firmware::{VariableAttributes, VariableStore};
use crate::guid::{Guid, CHRYSALIS_VENDOR};
use crate::paths::NVRAM_PATH;
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::Storage;
use crate::version::VERSION_STRING;

/// Variable carrying the version string.
pub const VERSION_VARIABLE: &str = "chrysalis-version";

/// Apply the `NVRAM` section.
pub fn load_nvram(storage: &Storage<'_>, config: &Config, store: &mut dyn VariableStore) -> StageOutcome {
    let nvram = match &config.nvram {
        Some(nvram) => nvram,
        None => return StageOutcome::Skipped,
    };
    let mut report = StageReport::new(Stage::Nvram);
    let persist = if nvram.write_flash {
        VariableAttributes::NON_VOLATILE
    } else {
        VariableAttributes::default()
    };

    for (guid, names) in &nvram.delete {
        for name in names {
            let op = format!("Delete {guid}:{name}");
            match store.delete(guid, name) {
                Ok(()) => report.applied(&op),
                Err(FirmwareError::NotFound) => report.skipped(&op, "not present"),
                Err(e) => report.failed(&op, e),
            }
        }
    }

    if nvram.legacy_enable {
        import_snapshot(storage, nvram, store, persist, &mut report);
    }

    for (guid, variables) in &nvram.add {
        for (name, variable) in variables {
            let op = format!("Add {guid}:{name}");
            if exists(store, guid, name) {
                report.skipped(&op, "already set");
                continue;
            }
            let class = if variable.internal {
                VariableAttributes::INTERNAL
            } else {
                VariableAttributes::EXTERNAL
            };
            match store.set(guid, name, class | persist, &variable.data) {
                Ok(()) => report.applied(&op),
                Err(e) => report.failed(&op, e),
            }
        }
    }

    record_version(config, store, &mut report);
    report.into_outcome()
}

fn exists(store: &dyn VariableStore, guid: &Guid, name: &str) -> bool {
    store.get(guid, name).is_ok()
}

fn import_snapshot(
    storage: &Storage<'_>,
    nvram: &NvramConfig,
    store: &mut dyn VariableStore,
    persist: VariableAttributes,
    report: &mut StageReport,
) {
    let bytes = match storage.read(NVRAM_PATH) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            report.skipped("Legacy", "no snapshot");
            return;
        }
        Err(e) => {
            report.failed("Legacy", e);
            return;
        }
    };
    let snapshot: NvramSnapshot = match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            report.failed("Legacy", e);
            return;
        }
    };
    if snapshot.version != SNAPSHOT_VERSION {
        report.failed("Legacy", format!("unsupported snapshot version {}", snapshot.version));
        return;
    }

    for (guid, variables) in &snapshot.add {
        for (name, value) in variables {
            let op = format!("Legacy {guid}:{name}");
            if !nvram.schema_allows(guid, name) {
                report.skipped(&op, "not in LegacySchema");
                continue;
            }
            if !nvram.legacy_overwrite && exists(store, guid, name) {
                report.skipped(&op, "already set");
                continue;
            }
            match store.set(guid, name, VariableAttributes::EXTERNAL | persist, &value.0) {
                Ok(()) => report.applied(&op),
                Err(e) => report.failed(&op, e),
            }
        }
    }
}

fn record_version(config: &Config, store: &mut dyn VariableStore, report: &mut StageReport) {
    let exposed = config.misc.security.expose_sensitive_data & EXPOSE_VERSION_VARIABLE != 0;
    let attributes = if exposed {
        VariableAttributes::EXTERNAL
    } else {
        VariableAttributes::INTERNAL
    };
    // Attributes of an existing variable cannot change in place.
    if store.delete(&CHRYSALIS_VENDOR, VERSION_VARIABLE).is_ok() {
        debug!("replaced previous version record");
    }
    match store.set(&CHRYSALIS_VENDOR, VERSION_VARIABLE, attributes, VERSION_STRING.as_bytes()) {
        Ok(()) => report.applied("version record"),
        Err(e) => report.failed("version record", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::nvram::NvramVariable;
    use crate::firmware::Variable;
    use crate::guid::EFI_GLOBAL_VARIABLE;
    use crate::storage::AssetSource;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    struct Files(BTreeMap<String, Vec<u8>>);

    impl AssetSource for Files {
        fn read(&self, path: &str) -> Result<Vec<u8>, FirmwareError> {
            self.0.get(path).cloned().ok_or(FirmwareError::NotFound)
        }
    }

    #[derive(Default)]
    struct Store {
        vars: BTreeMap<(Guid, String), Variable>,
        size_limit: Option<usize>,
    }

    impl VariableStore for Store {
        fn get(&self, guid: &Guid, name: &str) -> Result<Variable, FirmwareError> {
            self.vars
                .get(&(*guid, String::from(name)))
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
            if self.size_limit.map_or(false, |limit| data.len() > limit) {
                return Err(FirmwareError::OutOfResources);
            }
            self.vars.insert(
                (*guid, String::from(name)),
                Variable {
                    attributes,
                    data: data.to_vec(),
                },
            );
            Ok(())
        }

        fn delete(&mut self, guid: &Guid, name: &str) -> Result<(), FirmwareError> {
            self.vars
                .remove(&(*guid, String::from(name)))
                .map(|_| ())
                .ok_or(FirmwareError::NotFound)
        }
    }

    fn variable(data: &[u8], internal: bool) -> NvramVariable {
        NvramVariable {
            data: data.to_vec(),
            internal,
        }
    }

    fn config(nvram: NvramConfig) -> Config {
        Config {
            nvram: Some(nvram),
            ..Config::default()
        }
    }

    #[test]
    fn add_respects_attribute_classes_and_existing_values() {
        let source = Files(BTreeMap::new());
        let storage = Storage::new(&source);
        let mut store = Store::default();
        store
            .set(&EFI_GLOBAL_VARIABLE, "keep", VariableAttributes::EXTERNAL, b"old")
            .unwrap();

        let mut vars = BTreeMap::new();
        vars.insert(String::from("boot-args"), variable(b"-v", false));
        vars.insert(String::from("secret"), variable(b"s", true));
        vars.insert(String::from("keep"), variable(b"new", false));
        let mut add = BTreeMap::new();
        add.insert(EFI_GLOBAL_VARIABLE, vars);

        let outcome = load_nvram(
            &storage,
            &config(NvramConfig {
                add,
                write_flash: true,
                ..NvramConfig::default()
            }),
            &mut store,
        );
        assert!(matches!(outcome, StageOutcome::Completed(_)));

        let args = store.get_runtime(&EFI_GLOBAL_VARIABLE, "boot-args").unwrap();
        assert!(args.attributes.contains(VariableAttributes::NON_VOLATILE));
        assert_eq!(store.get_runtime(&EFI_GLOBAL_VARIABLE, "secret"), Err(FirmwareError::NotFound));
        assert_eq!(store.get(&EFI_GLOBAL_VARIABLE, "secret").unwrap().data, b"s");
        assert_eq!(store.get(&EFI_GLOBAL_VARIABLE, "keep").unwrap().data, b"old");
    }

    #[test]
    fn rejected_write_is_isolated() {
        let source = Files(BTreeMap::new());
        let storage = Storage::new(&source);
        let mut store = Store {
            size_limit: Some(40),
            ..Store::default()
        };
        let mut vars = BTreeMap::new();
        vars.insert(String::from("huge"), variable(&[0u8; 64], false));
        vars.insert(String::from("small"), variable(b"1", false));
        let mut add = BTreeMap::new();
        add.insert(EFI_GLOBAL_VARIABLE, vars);

        let outcome = load_nvram(
            &storage,
            &config(NvramConfig {
                add,
                ..NvramConfig::default()
            }),
            &mut store,
        );
        let report = outcome.report().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(store.get(&EFI_GLOBAL_VARIABLE, "small").is_ok());
    }

    #[test]
    fn delete_runs_before_add() {
        let source = Files(BTreeMap::new());
        let storage = Storage::new(&source);
        let mut store = Store::default();
        store
            .set(&EFI_GLOBAL_VARIABLE, "boot-args", VariableAttributes::EXTERNAL, b"old")
            .unwrap();

        let mut vars = BTreeMap::new();
        vars.insert(String::from("boot-args"), variable(b"new", false));
        let mut add = BTreeMap::new();
        add.insert(EFI_GLOBAL_VARIABLE, vars);
        let mut delete = BTreeMap::new();
        delete.insert(EFI_GLOBAL_VARIABLE, vec![String::from("boot-args"), String::from("gone")]);

        load_nvram(
            &storage,
            &config(NvramConfig {
                add,
                delete,
                ..NvramConfig::default()
            }),
            &mut store,
        );
        assert_eq!(store.get(&EFI_GLOBAL_VARIABLE, "boot-args").unwrap().data, b"new");
    }

    #[test]
    fn legacy_snapshot_is_filtered_by_schema() {
        let mut files = BTreeMap::new();
        files.insert(
            String::from("EFI\\CHRYSALIS\\nvram.json"),
            br#"{"Version": 1, "Add": {"8BE4DF61-93CA-11D2-AA0D-00E098032B8C":
                {"prev-lang:kbd": "656E", "SystemAudioVolume": "46"}}}"#
                .to_vec(),
        );
        let source = Files(files);
        let storage = Storage::new(&source);
        let mut store = Store::default();
        let mut schema = BTreeMap::new();
        schema.insert(EFI_GLOBAL_VARIABLE, vec![String::from("prev-lang:kbd")]);

        let outcome = load_nvram(
            &storage,
            &config(NvramConfig {
                legacy_enable: true,
                legacy_schema: schema,
                ..NvramConfig::default()
            }),
            &mut store,
        );
        assert!(store.get(&EFI_GLOBAL_VARIABLE, "prev-lang:kbd").is_ok());
        assert!(store.get(&EFI_GLOBAL_VARIABLE, "SystemAudioVolume").is_err());
        assert_eq!(outcome.report().unwrap().skipped, 1);
    }

    #[test]
    fn version_record_visibility_follows_expose_bits() {
        let source = Files(BTreeMap::new());
        let storage = Storage::new(&source);

        let mut store = Store::default();
        let mut hidden = config(NvramConfig::default());
        hidden.misc.security.expose_sensitive_data = 0;
        load_nvram(&storage, &hidden, &mut store);
        assert!(store.get(&CHRYSALIS_VENDOR, VERSION_VARIABLE).is_ok());
        assert!(store.get_runtime(&CHRYSALIS_VENDOR, VERSION_VARIABLE).is_err());

        let mut shown = hidden.clone();
        shown.misc.security.expose_sensitive_data = EXPOSE_VERSION_VARIABLE;
        load_nvram(&storage, &shown, &mut store);
        let record = store.get_runtime(&CHRYSALIS_VENDOR, VERSION_VARIABLE).unwrap();
        assert_eq!(record.data, VERSION_STRING.as_bytes());
    }
}
