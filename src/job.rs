//! Single-file conversion pipeline.
//!
//! A [`Converter`] loads and validates the mapping once, then converts any
//! number of input/output pairs. Each conversion runs the same phases: load
//! the inputs, bind the mapping to their columns, generate or extract, then
//! write the output, the error file and the counters.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{debug, info, warn};

use crate::{
    config::ConverterConfig,
    context::{ConversionContext, Direction, EngineSettings},
    counter::CounterStore,
    document::Document,
    extract::extract,
    generate::generate,
    io_utils::{self, read_text, resolve_encoding, sibling_with_suffix, write_text},
    mapping::{CsvOp, MappingSet},
    report::write_mapping_errors,
    table::{Table, TableOptions},
};

/// Outcome of one converted file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records: usize,
    pub errors: usize,
    pub unique_document_id: Option<String>,
    /// Set when data errors were written.
    pub error_file: Option<PathBuf>,
}

pub struct Converter {
    direction: Direction,
    config: ConverterConfig,
    settings: EngineSettings,
    mappings: MappingSet,
    template: Option<PathBuf>,
    counters: CounterStore,
    input_encoding: &'static Encoding,
    output_encoding: &'static Encoding,
}

impl Converter {
    /// Loads the mapping and writes its problems to `mapping_errors`
    /// (default `<mapping-stem>-errors.csv`).
    pub fn new(
        direction: Direction,
        config: ConverterConfig,
        mapping_path: &Path,
        mapping_errors: Option<&Path>,
        template: Option<PathBuf>,
    ) -> Result<Self> {
        let input_encoding = resolve_encoding(config.input_encoding.as_deref())?;
        let output_encoding = resolve_encoding(config.output_encoding.as_deref())?;
        let mappings = MappingSet::load(mapping_path, input_encoding)
            .with_context(|| format!("Loading mapping {mapping_path:?}"))?;
        let error_path = mapping_errors
            .map(Path::to_path_buf)
            .unwrap_or_else(|| sibling_with_suffix(mapping_path, "-errors", "csv"));
        if write_mapping_errors(&error_path, &mappings.errors)? {
            warn!(
                "{} mapping problem(s) written to {:?}",
                mappings.errors.len(),
                error_path
            );
        }
        let counter_dir = config.counter_dir.clone().unwrap_or_else(|| {
            mapping_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        });
        Ok(Converter {
            direction,
            settings: config.engine_settings(),
            config,
            mappings,
            template,
            counters: CounterStore::new(counter_dir),
            input_encoding,
            output_encoding,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mappings(&self) -> &MappingSet {
        &self.mappings
    }

    pub fn template(&self) -> Option<&Path> {
        self.template.as_deref()
    }

    /// File extension of this direction's output.
    pub fn output_extension(&self) -> &'static str {
        match self.direction {
            Direction::CsvToXml => "xml",
            Direction::XmlToCsv => "csv",
        }
    }

    /// Converts `input` into `output`. Data errors go to `error_file`
    /// (default `<output-stem>-errors.csv`).
    pub fn convert(&mut self, input: &Path, output: &Path, error_file: Option<&Path>) -> Result<RunSummary> {
        info!(
            "{} {:?} -> {:?}",
            self.direction.label(),
            input,
            output
        );
        let error_path = error_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| sibling_with_suffix(output, "-errors", "csv"));
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        let mut set = self.mappings.clone();

        let (text, encoding, summary) = match self.direction {
            Direction::CsvToXml => {
                let mut tables = self.load_tables(input)?;
                let missing = set.bind(&tables);
                debug!("{} mapping(s) without a matching column", missing.len());
                for (idx, table) in tables.iter_mut().enumerate() {
                    self.apply_decimal_separator(&set, idx, table);
                }
                let mut ctx = ConversionContext::new(&set, &mut self.counters, &self.settings, file_name);
                let document = generate(&mut ctx, &mut tables)?;
                let xml = document.to_xml_string(self.settings.indent, self.output_encoding.name())?;
                let summary = finish(&ctx, &error_path)?;
                (xml, self.output_encoding, summary)
            }
            Direction::XmlToCsv => {
                let source = read_text(input, self.input_encoding)?;
                let document = Document::parse(&source).with_context(|| format!("Parsing {input:?}"))?;
                let mut template = self.load_template(&set, output)?;
                let missing = set.bind(std::slice::from_ref(&template));
                for idx in missing {
                    if let Some(mapping) = set.mappings.get(idx) {
                        warn!(
                            "Column '{}' (mapping line {}) is not part of the output header",
                            mapping.csv.content, mapping.line
                        );
                    }
                }
                self.apply_decimal_separator(&set, 0, &mut template);
                let mut ctx = ConversionContext::new(&set, &mut self.counters, &self.settings, file_name);
                let rows = extract(&mut ctx, &document, &template)?;
                let csv = template.render(&rows);
                let summary = finish(&ctx, &error_path)?;
                (csv, self.output_encoding, summary)
            }
        };

        write_text(output, &text, encoding)?;
        self.counters.save()?;
        info!(
            "{} record(s), {} error(s){}",
            summary.records,
            summary.errors,
            summary
                .unique_document_id
                .as_deref()
                .map(|id| format!(", document id {id}"))
                .unwrap_or_default()
        );
        Ok(summary)
    }

    fn table_options(&self, set: &MappingSet, table: usize) -> TableOptions {
        TableOptions {
            delimiter: None,
            ignore_chars: self.config.ignore_characters.clone(),
            min_populated_cells: self.config.min_populated_cells,
            mapped_columns: set.column_names(table),
        }
    }

    /// The primary table followed by every ADDFILE table.
    fn load_tables(&self, input: &Path) -> Result<Vec<Table>> {
        let mut tables = Vec::with_capacity(1 + self.mappings.linked_files.len());
        let primary = Table::load(input, self.input_encoding, &self.table_options(&self.mappings, 0))
            .with_context(|| format!("Loading table {input:?}"))?;
        tables.push(primary);
        for (offset, linked) in self.mappings.linked_files.iter().enumerate() {
            let path = linked.resolve(input);
            let options = self.table_options(&self.mappings, offset + 1);
            let table = Table::load(&path, self.input_encoding, &options)
                .with_context(|| format!("Loading linked table {path:?} (mapping line {})", linked.line))?;
            tables.push(table);
        }
        Ok(tables)
    }

    fn load_template(&self, set: &MappingSet, output: &Path) -> Result<Table> {
        match &self.template {
            Some(path) => Table::load(path, self.input_encoding, &self.table_options(set, 0))
                .with_context(|| format!("Loading template {path:?}")),
            None => {
                let name = output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Table::with_headers(&name, default_headers(set), ';'))
            }
        }
    }

    fn apply_decimal_separator(&self, set: &MappingSet, idx: usize, table: &mut Table) {
        match self.config.decimal_separator {
            Some(separator) => table.set_decimal_separator(separator),
            None => {
                let separator = table.detect_decimal_separator(&set.number_columns(idx));
                debug!(
                    "Decimal separator of {} is '{}'",
                    table.name(),
                    io_utils::printable_delimiter(separator)
                );
            }
        }
    }
}

/// Distinct table-side names of the primary MAP rows, in mapping order.
pub fn default_headers(set: &MappingSet) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for mapping in &set.mappings {
        if mapping.table == 0
            && mapping.csv.operation == CsvOp::Map
            && !headers.iter().any(|h| h.eq_ignore_ascii_case(&mapping.csv.content))
        {
            headers.push(mapping.csv.content.clone());
        }
    }
    headers
}

fn finish(ctx: &ConversionContext<'_>, error_path: &Path) -> Result<RunSummary> {
    let written = ctx.errors.write(error_path)?;
    Ok(RunSummary {
        records: ctx.records,
        errors: ctx.errors.len(),
        unique_document_id: ctx.unique_document_id.clone(),
        error_file: written.then(|| error_path.to_path_buf()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MAPPING: &str = "CSV_OP;CSV_CONTENT;CSV_TYPE;XML_OP;XML_CONTENT;XML_ATTRIBUTE\n\
        CHANGE;ID;Text;LOOP;Items/Item;\n\
        MAP;ID;Text;MAP;Items/Item;id\n\
        MAP;PRICE;Number;MAP;Items/Item/Price;\n";

    #[test]
    fn converts_both_directions() {
        let dir = tempdir().expect("tempdir");
        let mapping = dir.path().join("items.map.csv");
        std::fs::write(&mapping, MAPPING).expect("mapping");
        let input = dir.path().join("items.csv");
        std::fs::write(&input, "ID;PRICE\n1;2,5\n2;3,75\n").expect("input");

        let xml = dir.path().join("items.xml");
        let mut forward = Converter::new(
            Direction::CsvToXml,
            ConverterConfig::default(),
            &mapping,
            None,
            None,
        )
        .expect("converter");
        let summary = forward.convert(&input, &xml, None).expect("convert");
        assert_eq!(summary.records, 2);
        assert_eq!(summary.errors, 0);
        let text = std::fs::read_to_string(&xml).expect("xml");
        assert!(text.contains("<Item id=\"1\">"));
        assert!(text.contains("<Price>3.75</Price>"));

        let back = dir.path().join("back.csv");
        let mut reverse = Converter::new(
            Direction::XmlToCsv,
            ConverterConfig::default(),
            &mapping,
            None,
            None,
        )
        .expect("converter");
        let summary = reverse.convert(&xml, &back, None).expect("convert");
        assert_eq!(summary.records, 2);
        assert_eq!(
            std::fs::read_to_string(&back).expect("csv"),
            "ID;PRICE\n1;2.5\n2;3.75\n"
        );
    }

    #[test]
    fn default_headers_skip_loop_and_duplicate_columns() {
        let set = MappingSet::parse("m.csv", MAPPING).expect("mapping");
        assert_eq!(default_headers(&set), vec!["ID", "PRICE"]);
    }
}
