//! ACPI stage.
//!
//! Operation order: Delete, Rename, Add, Patch, Quirks. The working set is
//! taken from firmware once, edited in memory and published back in one
//! call. Every directive is isolated; none of them can abandon the boot.

use alloc::format;
use alloc::vec::Vec;

use tracing::info;

use crate::config::acpi::{padded_oem_table_id, AcpiConfig, TableSignature};
use crate::config::Config;
use crate::firmware::AcpiTables;
use crate::paths::{asset_path, ACPI_PATH};
use crate::stage::{Stage, StageOutcome, StageReport};
use crate::storage::Storage;

/// Length of the standard system description table header.
pub const HEADER_LEN: usize = 36;

const CHECKSUM_OFFSET: usize = 9;
const OEM_ID: core::ops::Range<usize> = 10..16;
const OEM_TABLE_ID: core::ops::Range<usize> = 16..24;
const CREATOR_ID: core::ops::Range<usize> = 28..32;

const FADT_FLAGS: usize = 112;
const FADT_RESET_REG: usize = 116;
const FADT_RESET_VALUE: usize = 128;
const FADT_RESET_REG_SUP: u32 = 1 << 10;

const FACS_MIN_LEN: usize = 12;
const FACS_HW_SIGNATURE: usize = 8;

const BGRT_STATUS: usize = 38;
const BGRT_DISPLAYED: u8 = 0x01;

/// Raw ACPI table with a validated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcpiTable {
    data: Vec<u8>,
}

impl AcpiTable {
    /// Validate the header of `data`.
    ///
    /// FACS has no standard header and only needs signature and length.
    pub fn parse(data: Vec<u8>) -> Result<Self, &'static str> {
        if data.len() < FACS_MIN_LEN {
            return Err("shorter than a table header");
        }
        let table = Self { data };
        if table.signature() != TableSignature::FACS && table.data.len() < HEADER_LEN {
            return Err("shorter than a table header");
        }
        if table.length() as usize != table.data.len() {
            return Err("header length does not match file size");
        }
        Ok(table)
    }

    /// Table signature.
    pub fn signature(&self) -> TableSignature {
        TableSignature([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Length from the header.
    pub fn length(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    /// OEM table id, space padded.
    pub fn oem_table_id(&self) -> Option<[u8; 8]> {
        self.data.get(OEM_TABLE_ID)?.try_into().ok()
    }

    /// Whole table.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// FACS and anything shorter than a standard header carry no checksum.
    fn has_checksum(&self) -> bool {
        self.signature() != TableSignature::FACS && self.data.len() >= HEADER_LEN
    }

    /// Whether the bytes sum to zero. Tables without a checksum always pass.
    pub fn checksum_valid(&self) -> bool {
        !self.has_checksum() || self.data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
    }

    /// Recompute the header checksum.
    pub fn update_checksum(&mut self) {
        if !self.has_checksum() {
            return;
        }
        self.data[CHECKSUM_OFFSET] = 0;
        let sum = self.data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        self.data[CHECKSUM_OFFSET] = 0u8.wrapping_sub(sum);
    }

    fn matches(&self, signature: Option<TableSignature>, oem_table_id: &str, length: u32) -> bool {
        signature.map_or(true, |s| self.signature() == s)
            && (oem_table_id.is_empty()
                || self.oem_table_id() == Some(padded_oem_table_id(oem_table_id)))
            && (length == 0 || self.length() == length)
    }
}

struct Working {
    table: AcpiTable,
    dirty: bool,
}

/// Apply the `ACPI` section to the installed table set.
pub fn load_acpi(storage: &Storage<'_>, config: &Config, firmware: &mut dyn AcpiTables) -> StageOutcome {
    let acpi = match &config.acpi {
        Some(acpi) => acpi,
        None => return StageOutcome::Skipped,
    };

    let mut report = StageReport::new(Stage::Acpi);
    let mut tables: Vec<Working> = match firmware.tables() {
        Ok(tables) => tables
            .into_iter()
            .map(|table| Working { table, dirty: false })
            .collect(),
        Err(e) => {
            report.failed("read installed tables", e);
            return report.into_outcome();
        }
    };

    delete_tables(acpi, &mut tables, &mut report);
    rename_tables(acpi, &mut tables, &mut report);
    add_tables(storage, acpi, &mut tables, &mut report);
    patch_tables(acpi, &mut tables, &mut report);
    apply_quirks(acpi, &mut tables, &mut report);

    if report.applied == 0 {
        return report.into_outcome();
    }

    let published: Vec<AcpiTable> = tables
        .into_iter()
        .map(|mut working| {
            if working.dirty {
                working.table.update_checksum();
            }
            working.table
        })
        .collect();
    let count = published.len();
    match firmware.publish(published) {
        Ok(()) => info!(tables = count, applied = report.applied, "ACPI tables published"),
        Err(e) => report.failed("publish tables", e),
    }
    report.into_outcome()
}

fn delete_tables(acpi: &AcpiConfig, tables: &mut Vec<Working>, report: &mut StageReport) {
    for (index, delete) in acpi.delete.iter().enumerate() {
        let op = format!("Delete[{index}] {}", delete.table_signature);
        if !delete.enabled {
            report.skipped(&op, "disabled");
            continue;
        }

        let before = tables.len();
        let mut removed = 0;
        tables.retain(|working| {
            let hit = (delete.all || removed == 0)
                && working.table.matches(
                    Some(delete.table_signature),
                    &delete.oem_table_id,
                    delete.table_length,
                );
            if hit {
                removed += 1;
            }
            !hit
        });

        if tables.len() == before {
            report.skipped(&op, "no matching table");
        } else {
            report.applied(&op);
        }
    }
}

fn rename_tables(acpi: &AcpiConfig, tables: &mut [Working], report: &mut StageReport) {
    for (index, rename) in acpi.rename.iter().enumerate() {
        let op = format!("Rename[{index}] {} -> {}", rename.from, rename.to);
        if !rename.enabled {
            report.skipped(&op, "disabled");
            continue;
        }
        // FACS has no standard header, so it can neither lose nor gain one.
        if rename.from == TableSignature::FACS || rename.to == TableSignature::FACS {
            report.skipped(&op, "FACS cannot be renamed");
            continue;
        }

        let mut renamed = false;
        for working in tables
            .iter_mut()
            .filter(|w| w.table.signature() == rename.from && w.table.has_checksum())
        {
            working.table.data[..4].copy_from_slice(&rename.to.0);
            working.dirty = true;
            renamed = true;
        }
        if renamed {
            report.applied(&op);
        } else {
            report.skipped(&op, "no matching table");
        }
    }
}

fn add_tables(storage: &Storage<'_>, acpi: &AcpiConfig, tables: &mut Vec<Working>, report: &mut StageReport) {
    for (index, add) in acpi.add.iter().enumerate() {
        let op = format!("Add[{index}] {}", add.path);
        if !add.enabled {
            report.skipped(&op, "disabled");
            continue;
        }

        let data = match storage.read(&asset_path(ACPI_PATH, &add.path)) {
            Ok(data) => data,
            Err(e) => {
                report.failed(&op, e);
                continue;
            }
        };
        let table = match AcpiTable::parse(data) {
            Ok(table) => table,
            Err(reason) => {
                report.failed(&op, reason);
                continue;
            }
        };

        let replaced = if table.signature() == TableSignature::DSDT {
            tables
                .iter_mut()
                .find(|w| w.table.signature() == TableSignature::DSDT)
        } else {
            None
        };
        match replaced {
            Some(existing) => {
                existing.table = table;
                existing.dirty = false;
            }
            None => tables.push(Working {
                table,
                dirty: false,
            }),
        }
        report.applied(&op);
    }
}

fn patch_tables(acpi: &AcpiConfig, tables: &mut [Working], report: &mut StageReport) {
    for (index, patch) in acpi.patch.iter().enumerate() {
        let op = format!("Patch[{index}]");
        if !patch.enabled {
            report.skipped(&op, "disabled");
            continue;
        }

        let pattern = patch.pattern();
        let mut replaced = 0;
        for working in tables
            .iter_mut()
            .filter(|w| w.table.matches(patch.table_signature, &patch.oem_table_id, 0))
        {
            // Header stays intact; only the body is searched.
            let start = if working.table.has_checksum() { HEADER_LEN } else { 0 };
            let hits = pattern.apply(&mut working.table.data[start..]);
            if hits > 0 {
                working.dirty = true;
                replaced += hits;
            }
        }
        if replaced > 0 {
            report.applied(&op);
        } else {
            report.skipped(&op, "pattern not found");
        }
    }
}

fn apply_quirks(acpi: &AcpiConfig, tables: &mut [Working], report: &mut StageReport) {
    let quirks = &acpi.quirks;

    if quirks.fadt_enable_reset {
        match tables
            .iter_mut()
            .find(|w| w.table.signature() == TableSignature::FADT && w.table.data.len() > FADT_RESET_VALUE)
        {
            Some(fadt) => {
                enable_fadt_reset(&mut fadt.table.data);
                fadt.dirty = true;
                report.applied("FadtEnableReset");
            }
            None => report.failed("FadtEnableReset", "no FADT with a reset register"),
        }
    }

    if quirks.normalize_headers {
        let mut changed = 0;
        for working in tables.iter_mut().filter(|w| w.table.has_checksum()) {
            if normalize_header(&mut working.table.data) {
                working.dirty = true;
                changed += 1;
            }
        }
        if changed > 0 {
            report.applied("NormalizeHeaders");
        } else {
            report.skipped("NormalizeHeaders", "headers already clean");
        }
    }

    if quirks.reset_hw_sig {
        match tables
            .iter_mut()
            .find(|w| w.table.signature() == TableSignature::FACS)
        {
            Some(facs) => {
                facs.table.data[FACS_HW_SIGNATURE..FACS_HW_SIGNATURE + 4].fill(0);
                report.applied("ResetHwSig");
            }
            None => report.failed("ResetHwSig", "no FACS"),
        }
    }

    if quirks.reset_logo_status {
        match tables
            .iter_mut()
            .find(|w| w.table.signature() == TableSignature::BGRT && w.table.data.len() > BGRT_STATUS)
        {
            Some(bgrt) => {
                bgrt.table.data[BGRT_STATUS] &= !BGRT_DISPLAYED;
                bgrt.dirty = true;
                report.applied("ResetLogoStatus");
            }
            None => report.skipped("ResetLogoStatus", "no BGRT"),
        }
    }
}

fn enable_fadt_reset(fadt: &mut [u8]) {
    let flags = u32::from_le_bytes([
        fadt[FADT_FLAGS],
        fadt[FADT_FLAGS + 1],
        fadt[FADT_FLAGS + 2],
        fadt[FADT_FLAGS + 3],
    ]);
    fadt[FADT_FLAGS..FADT_FLAGS + 4].copy_from_slice(&(flags | FADT_RESET_REG_SUP).to_le_bytes());

    let address = &fadt[FADT_RESET_REG + 4..FADT_RESET_REG + 12];
    if address.iter().all(|b| *b == 0) {
        // System I/O, 8-bit, byte access, port 0xCF9
        fadt[FADT_RESET_REG..FADT_RESET_REG + 4].copy_from_slice(&[1, 8, 0, 1]);
        fadt[FADT_RESET_REG + 4..FADT_RESET_REG + 12].copy_from_slice(&0xCF9u64.to_le_bytes());
        fadt[FADT_RESET_VALUE] = 0x06;
    }
}

fn normalize_header(table: &mut [u8]) -> bool {
    if table.len() < HEADER_LEN {
        return false;
    }
    let mut changed = false;
    for range in [0..4, OEM_ID, OEM_TABLE_ID, CREATOR_ID] {
        for b in &mut table[range] {
            if !(b.is_ascii_graphic() || *b == b' ') {
                *b = b' ';
                changed = true;
            }
        }
    }
    changed
}
