//! Append-only run log.
//!
//! One `;`-separated line per event; the header is written when the file is
//! created.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;

use crate::{context::Direction, io_utils::ensure_parent_dir};

pub const LOG_HEADER: [&str; 13] = [
    "TIMESTAMP",
    "LOG_TYPE",
    "CONVERSION",
    "ERROR",
    "CONTENT_ERRORS",
    "CSV_DATA_RECORDS",
    "INPUT_FILE_NAME",
    "MAPPING_FILE_NAME",
    "TEMPLATE_FILE_NAME",
    "OUTPUT_FILE_NAME",
    "PROCESSED_FILE_NAME",
    "UNIQUE_DOCUMENT_ID",
    "ERROR_FILE_NAME",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Start,
    File,
    Error,
}

impl LogType {
    pub fn label(&self) -> &'static str {
        match self {
            LogType::Start => "START",
            LogType::File => "FILE",
            LogType::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log_type: LogType,
    pub direction: Direction,
    pub error: String,
    pub content_errors: usize,
    pub records: usize,
    pub input: String,
    pub mapping: String,
    pub template: String,
    pub output: String,
    pub processed: String,
    pub unique_document_id: String,
    pub error_file: String,
}

impl LogEntry {
    pub fn new(log_type: LogType, direction: Direction) -> Self {
        LogEntry {
            log_type,
            direction,
            error: String::new(),
            content_errors: 0,
            records: 0,
            input: String::new(),
            mapping: String::new(),
            template: String::new(),
            output: String::new(),
            processed: String::new(),
            unique_document_id: String::new(),
            error_file: String::new(),
        }
    }

    fn record(&self, timestamp: &str) -> [String; 13] {
        [
            timestamp.to_string(),
            self.log_type.label().to_string(),
            self.direction.label().to_string(),
            self.error.clone(),
            self.content_errors.to_string(),
            self.records.to_string(),
            self.input.clone(),
            self.mapping.clone(),
            self.template.clone(),
            self.output.clone(),
            self.processed.clone(),
            self.unique_document_id.clone(),
            self.error_file.clone(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RunLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.append_at(entry, &timestamp)
    }

    pub fn append_at(&self, entry: &LogEntry, timestamp: &str) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let is_new = std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Opening log file {:?}", self.path))?;
        let mut writer = csv::WriterBuilder::new().delimiter(b';').from_writer(file);
        if is_new {
            writer.write_record(LOG_HEADER)?;
        }
        writer.write_record(entry.record(timestamp))?;
        writer
            .flush()
            .with_context(|| format!("Writing log file {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_is_written_once() {
        let dir = tempdir().expect("tempdir");
        let log = RunLog::new(dir.path().join("logs").join("run.log"));
        let start = LogEntry::new(LogType::Start, Direction::CsvToXml);
        let mut file = LogEntry::new(LogType::File, Direction::CsvToXml);
        file.records = 3;
        file.input = "in.csv".into();
        file.unique_document_id = "DOC-1".into();
        log.append_at(&start, "2024-03-05 12:30:00").expect("start");
        log.append_at(&file, "2024-03-05 12:30:01").expect("file");
        let text = std::fs::read_to_string(log.path()).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("TIMESTAMP;LOG_TYPE;CONVERSION;"));
        assert_eq!(lines[1], "2024-03-05 12:30:00;START;CSV2XML;;0;0;;;;;;;");
        assert_eq!(lines[2], "2024-03-05 12:30:01;FILE;CSV2XML;;0;3;in.csv;;;;;DOC-1;");
    }
}
