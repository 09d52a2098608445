//! Per-conversion state shared by generation and extraction.

use crate::{
    counter::CounterStore,
    data::ConversionError,
    loops::LoopStack,
    mapping::{FieldMapping, MappingSet},
    report::{DataError, ErrorLog},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CsvToXml,
    XmlToCsv,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::CsvToXml => "CSV2XML",
            Direction::XmlToCsv => "XML2CSV",
        }
    }
}

/// Settings a conversion reads but never changes.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root element used when the mapping has no ROOT row.
    pub root_element: String,
    /// Tree path whose value becomes the run's unique document id.
    pub unique_id_path: String,
    pub indent: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            root_element: "Document".to_string(),
            unique_id_path: "ControlData/UniqueDocumentID".to_string(),
            indent: 2,
        }
    }
}

/// Everything one input/output file pair needs while it is converted.
pub struct ConversionContext<'a> {
    pub mappings: &'a MappingSet,
    pub counters: &'a mut CounterStore,
    pub settings: &'a EngineSettings,
    pub loops: LoopStack,
    pub errors: ErrorLog,
    /// Name reported in the error file's FILE column.
    pub file_name: String,
    pub unique_document_id: Option<String>,
    /// Data records read (generation) or written (extraction).
    pub records: usize,
}

impl<'a> ConversionContext<'a> {
    pub fn new(
        mappings: &'a MappingSet,
        counters: &'a mut CounterStore,
        settings: &'a EngineSettings,
        file_name: impl Into<String>,
    ) -> Self {
        ConversionContext {
            mappings,
            counters,
            settings,
            loops: LoopStack::new(mappings),
            errors: ErrorLog::default(),
            file_name: file_name.into(),
            unique_document_id: None,
            records: 0,
        }
    }

    /// Logs a conversion problem for `mapping`; repeats on the same column
    /// are counted but not reported again.
    pub fn report(
        &mut self,
        mapping: &FieldMapping,
        line: usize,
        xpath: &str,
        value: &str,
        error: &ConversionError,
    ) {
        let column_name = if mapping.csv.content.is_empty() {
            mapping.xml.content.clone()
        } else {
            mapping.csv.content.clone()
        };
        self.errors.record(DataError {
            file: self.file_name.clone(),
            line,
            column_number: mapping.column.map(|c| c + 1),
            column_name,
            xpath: xpath.to_string(),
            value: value.to_string(),
            message: error.to_string(),
        });
    }

    pub fn report_message(&mut self, column_name: &str, line: usize, xpath: &str, message: impl Into<String>) {
        self.errors.record(DataError {
            file: self.file_name.clone(),
            line,
            column_number: None,
            column_name: column_name.to_string(),
            xpath: xpath.to_string(),
            value: String::new(),
            message: message.into(),
        });
    }
}
