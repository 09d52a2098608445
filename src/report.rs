//! Error file and mapping-error file.

use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{io_utils::ensure_parent_dir, mapping::MappingError};

pub const ERROR_HEADER: [&str; 7] = ["FILE", "LINE", "COLUMN_NR", "COLUMN_NAME", "XPATH", "VALUE", "ERROR"];
pub const MAPPING_ERROR_HEADER: [&str; 4] = ["LINE", "OPERATION", "COLUMN_NAME", "ERROR"];

/// One data problem found while converting a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataError {
    pub file: String,
    pub line: usize,
    /// 1-based table column, when the value came from or goes to one.
    pub column_number: Option<usize>,
    pub column_name: String,
    pub xpath: String,
    pub value: String,
    pub message: String,
}

impl DataError {
    fn key(&self) -> String {
        if self.column_name.is_empty() {
            self.xpath.to_ascii_lowercase()
        } else {
            self.column_name.to_ascii_lowercase()
        }
    }
}

/// Data errors of one conversion, keeping the first per column.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Vec<DataError>,
    seen: HashSet<String>,
    occurrences: usize,
}

impl ErrorLog {
    /// Records `error` unless its column already has one. Returns true when
    /// it was kept.
    pub fn record(&mut self, error: DataError) -> bool {
        self.occurrences += 1;
        if !self.seen.insert(error.key()) {
            return false;
        }
        warn!(
            "{} line {}: {} '{}' ({}): {}",
            error.file, error.line, error.column_name, error.value, error.xpath, error.message
        );
        self.entries.push(error);
        true
    }

    pub fn entries(&self) -> &[DataError] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every error seen, including repeats on an already reported column.
    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    /// Writes the error file; nothing is written when the log is empty.
    pub fn write(&self, path: &Path) -> Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        ensure_parent_dir(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(path)
            .with_context(|| format!("Creating error file {path:?}"))?;
        writer.write_record(ERROR_HEADER)?;
        for entry in &self.entries {
            writer.write_record([
                entry.file.clone(),
                entry.line.to_string(),
                entry.column_number.map(|n| n.to_string()).unwrap_or_default(),
                entry.column_name.clone(),
                entry.xpath.clone(),
                entry.value.clone(),
                entry.message.clone(),
            ])?;
        }
        writer.flush().with_context(|| format!("Flushing error file {path:?}"))?;
        info!("Wrote {} error(s) to {:?}", self.entries.len(), path);
        Ok(true)
    }
}

/// Writes mapping-definition problems; nothing is written when there are none.
pub fn write_mapping_errors(path: &Path, errors: &[MappingError]) -> Result<bool> {
    if errors.is_empty() {
        return Ok(false);
    }
    ensure_parent_dir(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .with_context(|| format!("Creating mapping error file {path:?}"))?;
    writer.write_record(MAPPING_ERROR_HEADER)?;
    for error in errors {
        writer.write_record([
            error.line.to_string(),
            error.operation.clone(),
            error.column_name.clone(),
            error.message.clone(),
        ])?;
    }
    writer.flush()?;
    info!("Wrote {} mapping problem(s) to {:?}", errors.len(), path);
    Ok(true)
}
