//! Mapping definitions.
//!
//! A mapping file is itself a delimited table: a header naming `CSV_*` and
//! `XML_*` columns, then one row per [`FieldMapping`]. Row order matters: a
//! LOOP row scopes every following row whose tree path lies below its own.
//!
//! Loading is lenient. A malformed row or field becomes a [`MappingError`]
//! and is dropped or defaulted; only an unreadable file, missing mandatory
//! columns or an empty result abort the load.

use std::{collections::HashMap, fmt, path::Path};

use anyhow::{Result, bail};
use encoding_rs::Encoding;
use log::{debug, info, warn};

use crate::{
    condition::Condition,
    data::{
        Affix, Bound, FieldType, FormatPattern, Side, ValueSpec, date_pattern_for,
        normalize_enumeration,
    },
    io_utils,
    path::path_contains,
    table::{Table, default_ignore_chars, detect_delimiter, split_line},
    transform::Transform,
};

pub const MANDATORY_COLUMNS: [&str; 5] = ["CSV_OP", "CSV_CONTENT", "CSV_TYPE", "XML_OP", "XML_CONTENT"];

const FIELD_COLUMNS: [&str; 16] = [
    "OP",
    "CONTENT",
    "CONTENT2",
    "SHORT_NAME",
    "MO",
    "TYPE",
    "MIN_LEN",
    "MAX_LEN",
    "MIN_VALUE",
    "MAX_VALUE",
    "FORMAT",
    "TRANSFORM",
    "DEFAULT",
    "CONDITION",
    "MAPPING_FORMAT",
    "ATTRIBUTE",
];

const CONTENT_CHECK: &str = "contentisvalid()";

/// Table-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvOp {
    Fix,
    Var,
    Map,
    Change,
    Unique,
    If,
    AddFile,
    Nop,
}

impl CsvOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FIX" | "F" => Some(CsvOp::Fix),
            "VAR" | "V" => Some(CsvOp::Var),
            "MAP" | "M" => Some(CsvOp::Map),
            "CHANGE" | "C" => Some(CsvOp::Change),
            "UNIQUE" | "U" => Some(CsvOp::Unique),
            "IF" | "I" => Some(CsvOp::If),
            "ADDFILE" | "A" => Some(CsvOp::AddFile),
            "NOP" | "N" | "" => Some(CsvOp::Nop),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CsvOp::Fix => "FIX",
            CsvOp::Var => "VAR",
            CsvOp::Map => "MAP",
            CsvOp::Change => "CHANGE",
            CsvOp::Unique => "UNIQUE",
            CsvOp::If => "IF",
            CsvOp::AddFile => "ADDFILE",
            CsvOp::Nop => "NOP",
        }
    }

    /// Operations whose content names a table column.
    pub fn reads_column(&self) -> bool {
        matches!(self, CsvOp::Map | CsvOp::Change | CsvOp::Unique | CsvOp::If)
    }
}

/// Tree-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlOp {
    Fix,
    Var,
    Map,
    Loop,
    If,
    Root,
}

impl XmlOp {
    /// False for operations whose content is a literal or an expression.
    pub fn addresses_tree(self) -> bool {
        !matches!(self, XmlOp::Fix | XmlOp::Var)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FIX" | "F" => Some(XmlOp::Fix),
            "VAR" | "V" => Some(XmlOp::Var),
            "MAP" | "M" => Some(XmlOp::Map),
            "LOOP" | "L" => Some(XmlOp::Loop),
            "IF" | "I" => Some(XmlOp::If),
            "ROOT" | "R" => Some(XmlOp::Root),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            XmlOp::Fix => "FIX",
            XmlOp::Var => "VAR",
            XmlOp::Map => "MAP",
            XmlOp::Loop => "LOOP",
            XmlOp::If => "IF",
            XmlOp::Root => "ROOT",
        }
    }
}

/// Legal (table, tree) operation pairs.
pub const ALLOWED_PAIRS: [(CsvOp, XmlOp); 10] = [
    (CsvOp::AddFile, XmlOp::Map),
    (CsvOp::Fix, XmlOp::Map),
    (CsvOp::Map, XmlOp::Fix),
    (CsvOp::Var, XmlOp::Map),
    (CsvOp::Map, XmlOp::Var),
    (CsvOp::Map, XmlOp::Map),
    (CsvOp::Change, XmlOp::Loop),
    (CsvOp::Unique, XmlOp::Loop),
    (CsvOp::If, XmlOp::If),
    (CsvOp::Nop, XmlOp::Root),
];

pub fn is_allowed_pair(csv: CsvOp, xml: XmlOp) -> bool {
    ALLOWED_PAIRS.contains(&(csv, xml))
}

/// One side of a mapping row.
#[derive(Debug, Clone)]
pub struct FieldDefinition<Op> {
    pub operation: Op,
    pub content: String,
    pub content2: String,
    pub short_name: String,
    /// Attribute written instead of element text (tree side only).
    pub attribute: String,
    pub value: ValueSpec,
    pub condition_text: String,
    pub condition: Option<Condition>,
    /// `contentisvalid()`: the IF holds when the column's value converts cleanly.
    pub content_check: bool,
}

impl<Op> FieldDefinition<Op> {
    fn new(operation: Op) -> Self {
        FieldDefinition {
            operation,
            content: String::new(),
            content2: String::new(),
            short_name: String::new(),
            attribute: String::new(),
            value: ValueSpec::default(),
            condition_text: String::new(),
            condition: None,
            content_check: false,
        }
    }

    pub fn attribute_name(&self) -> Option<&str> {
        let name = self.attribute.trim();
        (!name.is_empty()).then_some(name)
    }
}

pub type CsvField = FieldDefinition<CsvOp>;
pub type XmlField = FieldDefinition<XmlOp>;

#[derive(Debug, Clone)]
pub struct FieldMapping {
    /// Line in the mapping file.
    pub line: usize,
    pub csv: CsvField,
    pub xml: XmlField,
    /// Physical table the table side reads (0 = primary). FIX/VAR rows take
    /// the table of their innermost enclosing loop.
    pub table: usize,
    /// Column in that table, re-resolved for every input file.
    pub column: Option<usize>,
    /// MAP↔MAP mapping defining the same column, for CHANGE/UNIQUE/IF rows.
    pub source_mapping: Option<usize>,
    /// Slot in the loop stack when this row opens a loop.
    pub loop_slot: Option<usize>,
    /// UNIQUE loop whose key column this mapping fills.
    pub unique_slot: Option<usize>,
}

impl FieldMapping {
    /// Tree path of the row; empty for FIX and VAR rows, whose content is a
    /// value.
    pub fn path(&self) -> &str {
        if self.xml.operation.addresses_tree() {
            &self.xml.content
        } else {
            ""
        }
    }

    pub fn is_map_pair(&self) -> bool {
        self.csv.operation == CsvOp::Map && self.xml.operation == XmlOp::Map
    }

    pub fn operation_label(&self) -> String {
        format!("{}-{}", self.csv.operation.name(), self.xml.operation.name())
    }
}

/// Secondary table declared by an ADDFILE row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFile {
    pub line: usize,
    /// File name; `*` stands for the primary input's stem.
    pub file: String,
    pub primary_key: String,
    pub linked_key: String,
    pub scope: String,
}

impl LinkedFile {
    pub fn resolve(&self, primary_input: &Path) -> std::path::PathBuf {
        let stem = primary_input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = self.file.replace('*', &stem);
        let candidate = Path::new(&name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            primary_input
                .parent()
                .map(|dir| dir.join(candidate))
                .unwrap_or_else(|| candidate.to_path_buf())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub line: usize,
    pub operation: String,
    pub column_name: String,
    pub message: String,
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {} ({} '{}'): {}",
            self.line, self.operation, self.column_name, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootSpec {
    pub name: Option<String>,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MappingSet {
    pub name: String,
    pub mappings: Vec<FieldMapping>,
    pub linked_files: Vec<LinkedFile>,
    pub root: RootSpec,
    pub errors: Vec<MappingError>,
}

struct HeaderIndex {
    columns: HashMap<String, usize>,
}

impl HeaderIndex {
    fn new(headers: &[String]) -> Self {
        let mut columns = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let key = header.trim().to_ascii_uppercase();
            let recognized = ["CSV_", "XML_"].iter().any(|prefix| {
                key.strip_prefix(prefix)
                    .is_some_and(|suffix| FIELD_COLUMNS.contains(&suffix))
            });
            if recognized {
                columns.entry(key).or_insert(idx);
            } else if !key.is_empty() {
                debug!("Ignoring unknown mapping column '{header}'");
            }
        }
        HeaderIndex { columns }
    }

    fn missing_mandatory(&self) -> Vec<&'static str> {
        MANDATORY_COLUMNS
            .iter()
            .copied()
            .filter(|name| !self.columns.contains_key(*name))
            .collect()
    }

    fn get<'a>(&self, row: &'a [String], prefix: &str, column: &str) -> &'a str {
        self.columns
            .get(&format!("{prefix}_{column}"))
            .and_then(|idx| row.get(*idx))
            .map(|value| value.trim())
            .unwrap_or("")
    }
}

/// Row-level problem collector that remembers which row it is looking at.
struct RowErrors<'a> {
    line: usize,
    operation: String,
    column_name: String,
    sink: &'a mut Vec<MappingError>,
}

impl RowErrors<'_> {
    fn push(&mut self, message: impl Into<String>) {
        self.sink.push(MappingError {
            line: self.line,
            operation: self.operation.clone(),
            column_name: self.column_name.clone(),
            message: message.into(),
        });
    }
}

impl MappingSet {
    pub fn load(path: &Path, encoding: &'static Encoding) -> Result<Self> {
        let text = io_utils::read_text(path, encoding)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let set = Self::parse(&name, &text)?;
        info!(
            "Loaded {} mapping(s) and {} linked file(s) from {:?} ({} problem(s))",
            set.mappings.len(),
            set.linked_files.len(),
            path,
            set.errors.len()
        );
        Ok(set)
    }

    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')));
        let Some((_, header_line)) = lines.by_ref().find(|(_, line)| !line.trim().is_empty())
        else {
            bail!("Mapping file '{name}' is empty");
        };
        let delimiter = detect_delimiter(header_line);
        let ignore = default_ignore_chars(delimiter);
        let headers = split_line(header_line, delimiter, ignore)
            .into_iter()
            .map(|f| f.value)
            .collect::<Vec<_>>();
        let index = HeaderIndex::new(&headers);
        let missing = index.missing_mandatory();
        if !missing.is_empty() {
            bail!(
                "Mapping file '{name}' lacks mandatory column(s): {}",
                missing.join(", ")
            );
        }

        let mut set = MappingSet {
            name: name.to_string(),
            mappings: Vec::new(),
            linked_files: Vec::new(),
            root: RootSpec::default(),
            errors: Vec::new(),
        };
        for (line_number, line) in lines {
            if line.trim_start().starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let row = split_line(line, delimiter, ignore)
                .into_iter()
                .map(|f| f.value)
                .collect::<Vec<_>>();
            if row.iter().filter(|cell| !cell.is_empty()).count() < 3 {
                continue;
            }
            set.read_row(line_number, &row, &index);
        }
        set.finalize();
        for error in &set.errors {
            warn!("Mapping '{}' {}", set.name, error);
        }
        if set.mappings.is_empty() {
            bail!("Mapping file '{name}' defines no usable mappings");
        }
        Ok(set)
    }

    fn read_row(&mut self, line: usize, row: &[String], index: &HeaderIndex) {
        let csv_op_raw = index.get(row, "CSV", "OP");
        let xml_op_raw = index.get(row, "XML", "OP");
        let csv_content = index.get(row, "CSV", "CONTENT");
        let xml_content = index.get(row, "XML", "CONTENT");
        let mut errors = RowErrors {
            line,
            operation: format!("{csv_op_raw}-{xml_op_raw}"),
            column_name: if csv_content.is_empty() {
                xml_content.to_string()
            } else {
                csv_content.to_string()
            },
            sink: &mut self.errors,
        };

        let Some(csv_op) = CsvOp::parse(csv_op_raw) else {
            errors.push(format!("Invalid table operation '{csv_op_raw}'"));
            return;
        };
        let Some(xml_op) = XmlOp::parse(xml_op_raw) else {
            errors.push(format!("Invalid tree operation '{xml_op_raw}'"));
            return;
        };
        if !is_allowed_pair(csv_op, xml_op) {
            errors.push(format!(
                "Operation combination {}-{} is not allowed",
                csv_op.name(),
                xml_op.name()
            ));
            return;
        }
        errors.operation = format!("{}-{}", csv_op.name(), xml_op.name());

        if xml_op == XmlOp::Root {
            let attribute = index.get(row, "XML", "ATTRIBUTE");
            if !xml_content.is_empty() {
                self.root.name = Some(xml_content.trim_matches('/').to_string());
            }
            if !attribute.is_empty() {
                let value = [index.get(row, "XML", "DEFAULT"), index.get(row, "XML", "CONTENT2")]
                    .into_iter()
                    .find(|v| !v.is_empty())
                    .unwrap_or("");
                self.root.attributes.push((attribute.to_string(), value.to_string()));
            }
            if xml_content.is_empty() && attribute.is_empty() {
                errors.push("ROOT row names neither an element nor an attribute");
            }
            return;
        }

        if csv_op == CsvOp::AddFile {
            let key = index.get(row, "CSV", "CONTENT2");
            let (primary_key, linked_key) = match key.split_once('=') {
                Some((primary, linked)) => (primary.trim(), linked.trim()),
                None => (key, key),
            };
            if csv_content.is_empty() || primary_key.is_empty() {
                errors.push("ADDFILE needs a file name and a key column");
                return;
            }
            self.linked_files.push(LinkedFile {
                line,
                file: csv_content.to_string(),
                primary_key: primary_key.to_string(),
                linked_key: linked_key.to_string(),
                scope: xml_content.to_string(),
            });
            return;
        }

        let (table, csv_content) = split_table_prefix(csv_content);
        if csv_op.reads_column() && csv_content.is_empty() {
            errors.push("Table content is empty");
            return;
        }
        if matches!(xml_op, XmlOp::Loop | XmlOp::If | XmlOp::Map) && xml_content.is_empty() {
            errors.push("Tree content is empty");
            return;
        }

        let mut csv = read_side(FieldDefinition::new(csv_op), row, index, "CSV", &mut errors);
        csv.content = csv_content.to_string();
        let mut xml = read_side(FieldDefinition::new(xml_op), row, index, "XML", &mut errors);
        xml.attribute = index.get(row, "XML", "ATTRIBUTE").to_string();

        inherit_tree_defaults(&mut xml, &csv, row, index);
        if csv_op == CsvOp::Map && xml_op == XmlOp::Map {
            if csv.value.field_type != xml.value.field_type {
                errors.push(format!(
                    "Type mismatch: table side {} but tree side {}; using {}",
                    csv.value.field_type, xml.value.field_type, xml.value.field_type
                ));
                csv.value.field_type = xml.value.field_type;
            }
            let inherits_format = xml.value.format.is_empty()
                && matches!(xml.value.field_type, FieldType::Boolean | FieldType::Text);
            if inherits_format {
                xml.value.format = csv.value.format.clone();
            }
        }
        parse_pattern(&mut csv, &mut errors);
        parse_pattern(&mut xml, &mut errors);
        parse_bounds(&mut csv, row, index, "CSV", Side::Table, &mut errors);
        parse_bounds(&mut xml, row, index, "XML", Side::Tree, &mut errors);

        self.mappings.push(FieldMapping {
            line,
            csv,
            xml,
            table,
            column: None,
            source_mapping: None,
            loop_slot: None,
            unique_slot: None,
        });
    }

    /// Second pass: normalizes paths against the root and resolves the links
    /// between mappings.
    fn finalize(&mut self) {
        let root_name = self.root.name.clone();
        for mapping in &mut self.mappings {
            if mapping.xml.operation.addresses_tree() {
                mapping.xml.content = normalize_path(&mapping.xml.content, root_name.as_deref());
            }
        }

        let linked = self.linked_files.len();
        let mut kept = Vec::with_capacity(self.mappings.len());
        for mapping in self.mappings.drain(..) {
            if mapping.table > linked {
                self.errors.push(MappingError {
                    line: mapping.line,
                    operation: mapping.operation_label(),
                    column_name: mapping.csv.content.clone(),
                    message: format!("Table :{}: is not declared by an ADDFILE row", mapping.table),
                });
            } else {
                kept.push(mapping);
            }
        }
        self.mappings = kept;

        let mut slot = 0;
        for mapping in &mut self.mappings {
            if mapping.xml.operation == XmlOp::Loop {
                mapping.loop_slot = Some(slot);
                slot += 1;
            }
        }

        for idx in 0..self.mappings.len() {
            let mapping = &self.mappings[idx];
            if matches!(
                mapping.csv.operation,
                CsvOp::Change | CsvOp::Unique | CsvOp::If
            ) {
                let (table, content) = (mapping.table, mapping.csv.content.clone());
                self.mappings[idx].source_mapping = self.find_map_by_column(table, &content);
            }
        }

        let unique_loops = self
            .mappings
            .iter()
            .filter(|m| m.csv.operation == CsvOp::Unique)
            .filter_map(|m| Some((m.loop_slot?, m.table, m.csv.content.clone())))
            .collect::<Vec<_>>();
        for mapping in &mut self.mappings {
            if mapping.csv.operation != CsvOp::Map {
                continue;
            }
            mapping.unique_slot = unique_loops
                .iter()
                .find(|(_, table, content)| {
                    *table == mapping.table && content.eq_ignore_ascii_case(&mapping.csv.content)
                })
                .map(|(slot, _, _)| *slot);
        }

        let loops = self
            .mappings
            .iter()
            .filter(|m| m.xml.operation == XmlOp::Loop)
            .map(|m| (m.xml.content.clone(), m.table))
            .collect::<Vec<_>>();
        for mapping in &mut self.mappings {
            if matches!(mapping.csv.operation, CsvOp::Fix | CsvOp::Var) {
                mapping.table = loops
                    .iter()
                    .filter(|(path, _)| path_contains(path, &mapping.xml.content))
                    .max_by_key(|(path, _)| path.len())
                    .map(|(_, table)| *table)
                    .unwrap_or(0);
            }
        }

        let targets = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_map_pair())
            .map(|(idx, m)| (idx, m.table, m.csv.content.clone(), m.xml.content.clone()))
            .collect::<Vec<_>>();
        let resolve = |name: &str| {
            let path = normalize_path(name, root_name.as_deref());
            targets
                .iter()
                .find(|(_, _, _, xml)| *xml == path)
                .or_else(|| {
                    targets
                        .iter()
                        .find(|(_, _, csv, _)| csv.eq_ignore_ascii_case(name))
                })
                .map(|(idx, _, _, _)| *idx)
        };
        for mapping in &mut self.mappings {
            for condition in [&mut mapping.csv.condition, &mut mapping.xml.condition]
                .into_iter()
                .flatten()
            {
                condition.for_each_reference_mut(&mut |name, slot| *slot = resolve(name));
            }
        }
    }

    fn find_map_by_column(&self, table: usize, content: &str) -> Option<usize> {
        self.mappings.iter().position(|m| {
            m.is_map_pair() && m.table == table && m.csv.content.eq_ignore_ascii_case(content)
        })
    }

    /// Root element name, falling back to `default`.
    pub fn root_name<'a>(&'a self, default: &'a str) -> &'a str {
        self.root.name.as_deref().unwrap_or(default)
    }

    /// Column names the mappings read from `table`.
    pub fn column_names(&self, table: usize) -> Vec<String> {
        let mut names = Vec::new();
        for mapping in &self.mappings {
            if mapping.table == table
                && mapping.csv.operation.reads_column()
                && !names.iter().any(|n: &String| n.eq_ignore_ascii_case(&mapping.csv.content))
            {
                names.push(mapping.csv.content.clone());
            }
        }
        names
    }

    /// Resolves every mapping's column against `tables` (indexed like the
    /// `:N:` prefixes). Returns the indices of mappings whose column is absent.
    pub fn bind(&mut self, tables: &[Table]) -> Vec<usize> {
        let mut missing = Vec::new();
        for (idx, mapping) in self.mappings.iter_mut().enumerate() {
            let reads_column = mapping.csv.operation.reads_column();
            mapping.column = if reads_column {
                tables
                    .get(mapping.table)
                    .and_then(|table| table.column_index(&mapping.csv.content))
            } else {
                None
            };
            if reads_column && mapping.column.is_none() && tables.get(mapping.table).is_some() {
                missing.push(idx);
            }
        }
        missing
    }

    /// Columns of `table` holding numbers, sampled for decimal detection.
    pub fn number_columns(&self, table: usize) -> Vec<usize> {
        self.mappings
            .iter()
            .filter(|m| {
                m.table == table
                    && m.csv.operation == CsvOp::Map
                    && m.csv.value.field_type == FieldType::Number
            })
            .filter_map(|m| m.column)
            .collect()
    }

    pub fn loop_count(&self) -> usize {
        self.mappings.iter().filter(|m| m.loop_slot.is_some()).count()
    }
}

/// `:2:POSITION_ID` gives (2, `POSITION_ID`); unprefixed content is table 0.
pub fn split_table_prefix(content: &str) -> (usize, &str) {
    if let Some(rest) = content.strip_prefix(':') {
        if let Some((digits, name)) = rest.split_once(':') {
            if let Ok(table) = digits.trim().parse::<usize>() {
                return (table, name.trim());
            }
        }
    }
    (0, content)
}

/// Makes a tree path root-relative: `/Root/A/B`, `Root/A/B` and `A/B` all
/// become `A/B` when the root is `Root`.
pub fn normalize_path(path: &str, root_name: Option<&str>) -> String {
    let trimmed = path.trim();
    let absolute = trimmed.starts_with('/');
    let relative = trimmed.trim_matches('/');
    let (first, rest) = relative.split_once('/').unwrap_or((relative, ""));
    let first_is_root = root_name.is_some_and(|root| root == first);
    if (absolute && !relative.is_empty()) || first_is_root {
        if absolute && !first_is_root && root_name.is_some() {
            return relative.to_string();
        }
        return rest.to_string();
    }
    relative.to_string()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "" => None,
        "M" | "Y" | "YES" | "1" | "TRUE" | "MANDATORY" => Some(true),
        _ => Some(false),
    }
}

fn parse_length(raw: &str, label: &str, errors: &mut RowErrors<'_>) -> Option<usize> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-1" {
        return None;
    }
    match raw.parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(format!("Invalid {label} '{raw}'"));
            None
        }
    }
}

fn read_side<Op>(
    mut field: FieldDefinition<Op>,
    row: &[String],
    index: &HeaderIndex,
    prefix: &str,
    errors: &mut RowErrors<'_>,
) -> FieldDefinition<Op> {
    field.content = index.get(row, prefix, "CONTENT").to_string();
    field.content2 = index.get(row, prefix, "CONTENT2").to_string();
    field.short_name = index.get(row, prefix, "SHORT_NAME").to_string();
    field.value.mandatory = parse_flag(index.get(row, prefix, "MO")).unwrap_or(false);

    let type_raw = index.get(row, prefix, "TYPE");
    field.value.field_type = FieldType::parse(type_raw).unwrap_or_else(|| {
        errors.push(format!("Invalid type '{type_raw}', using Text"));
        FieldType::Text
    });
    field.value.min_len = parse_length(index.get(row, prefix, "MIN_LEN"), "minimum length", errors);
    field.value.max_len = parse_length(index.get(row, prefix, "MAX_LEN"), "maximum length", errors);

    field.value.format = normalize_enumeration(index.get(row, prefix, "FORMAT"));

    let transform = index.get(row, prefix, "TRANSFORM");
    if !transform.is_empty() {
        field.value.transform = Transform::parse(transform);
        if field.value.transform.is_none() {
            errors.push(format!("Unknown transform '{transform}'"));
        }
    }
    field.value.default = index.get(row, prefix, "DEFAULT").to_string();

    let template = index.get(row, prefix, "MAPPING_FORMAT");
    if !template.is_empty() {
        field.value.mapping_format = Affix::parse(template);
        if field.value.mapping_format.is_none() {
            errors.push(format!("Invalid mapping format '{template}'"));
        }
    }

    field.condition_text = index.get(row, prefix, "CONDITION").to_string();
    let compact = field.condition_text.replace(' ', "").to_ascii_lowercase();
    if compact == CONTENT_CHECK {
        field.content_check = true;
    } else if !field.condition_text.is_empty() {
        match Condition::parse(&field.condition_text) {
            Ok(condition) => field.condition = Some(condition),
            Err(err) => errors.push(format!("Invalid condition: {err}")),
        }
    }
    field
}

/// Dates keep their format as a date pattern; other types get a validation
/// pattern compiled from it.
fn parse_pattern<Op>(field: &mut FieldDefinition<Op>, errors: &mut RowErrors<'_>) {
    if field.value.field_type.is_temporal() {
        return;
    }
    field.value.pattern = FormatPattern::parse(&field.value.format).unwrap_or_else(|err| {
        errors.push(err);
        FormatPattern::None
    });
}

/// Empty tree-side value settings take the table side's.
fn inherit_tree_defaults(xml: &mut XmlField, csv: &CsvField, row: &[String], index: &HeaderIndex) {
    if parse_flag(index.get(row, "XML", "MO")).is_none() {
        xml.value.mandatory = csv.value.mandatory;
    }
    if index.get(row, "XML", "TYPE").is_empty() {
        xml.value.field_type = csv.value.field_type;
    }
    if index.get(row, "XML", "TRANSFORM").is_empty() {
        xml.value.transform = csv.value.transform;
    }
    if xml.value.min_len.is_none() {
        xml.value.min_len = csv.value.min_len;
    }
    if xml.value.max_len.is_none() {
        xml.value.max_len = csv.value.max_len;
    }
}

fn parse_bounds<Op>(
    field: &mut FieldDefinition<Op>,
    row: &[String],
    index: &HeaderIndex,
    prefix: &str,
    side: Side,
    errors: &mut RowErrors<'_>,
) {
    let field_type = field.value.field_type;
    let pattern = date_pattern_for(&field.value, side);
    let mut read = |column: &str| {
        let own = index.get(row, prefix, column);
        let raw = if own.is_empty() && prefix == "XML" {
            index.get(row, "CSV", column)
        } else {
            own
        };
        if raw.is_empty() || !(field_type.is_numeric() || field_type.is_temporal()) {
            return None;
        }
        let bound = Bound::parse(raw, field_type, &pattern);
        if bound.is_none() {
            errors.push(format!("Invalid {} '{raw}' for type {field_type}", column.to_ascii_lowercase()));
        }
        bound
    };
    field.value.min_value = read("MIN_VALUE");
    field.value.max_value = read("MAX_VALUE");
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "CSV_OP;CSV_CONTENT;CSV_CONTENT2;CSV_MO;CSV_TYPE;CSV_FORMAT;CSV_CONDITION;XML_OP;XML_CONTENT;XML_ATTRIBUTE;XML_TYPE;XML_FORMAT;XML_CONDITION;XML_DEFAULT";

    fn parse(rows: &[&str]) -> MappingSet {
        let text = std::iter::once(HEADER)
            .chain(rows.iter().copied())
            .collect::<Vec<_>>()
            .join("\n");
        MappingSet::parse("mapping.csv", &text).expect("parse mapping")
    }

    #[test]
    fn missing_mandatory_columns_abort_the_load() {
        let err = MappingSet::parse("m.csv", "CSV_OP;CSV_CONTENT;XML_OP\nMAP;A;MAP").unwrap_err();
        assert!(err.to_string().contains("CSV_TYPE"));
    }

    #[test]
    fn only_tree_paths_are_normalized() {
        let set = parse(&[
            "NOP;;;;;;;ROOT;R;;;;;",
            "MAP;ID;;;Text;;;MAP;/R/Items/Id;;;;;",
            "MAP;UNIT;;;Text;;;FIX;/kg;;;;;",
            "MAP;TAG;;;Text;;;FIX;R/x;;;;;",
            "MAP;STAMP;;;Text;;;VAR;'/'NOW;;;;;",
        ]);
        let contents = set
            .mappings
            .iter()
            .map(|m| (m.xml.content.as_str(), m.path()))
            .collect::<Vec<_>>();
        assert_eq!(
            contents,
            vec![
                ("Items/Id", "Items/Id"),
                ("/kg", ""),
                ("R/x", ""),
                ("'/'NOW", ""),
            ]
        );
    }

    #[test]
    fn invalid_pairs_are_reported_and_skipped() {
        let set = parse(&[
            "MAP;FUND_ID;;M;Text;;;MAP;Funds/Fund/Id;;;;;",
            "CHANGE;FUND_ID;;;Text;;;MAP;Funds/Fund;;;;;",
            "JUMP;FUND_ID;;;Text;;;MAP;Funds/Fund;;;;;",
        ]);
        assert_eq!(set.mappings.len(), 1);
        assert_eq!(set.errors.len(), 2);
        assert_eq!(set.errors[0].line, 3);
        assert!(set.errors[0].message.contains("CHANGE-MAP"));
    }

    #[test]
    fn comment_and_sparse_rows_are_ignored() {
        let set = parse(&[
            "# MAP;X;;;Text;;;MAP;A;;;;;",
            "MAP;;;;;;;;;;;;;",
            "MAP;NAME;;;Text;(A,B);;MAP;Funds/Fund/Name;;;;;",
        ]);
        assert_eq!(set.mappings.len(), 1);
        assert_eq!(set.mappings[0].csv.value.format, ",A,B,");
        assert_eq!(set.mappings[0].xml.value.format, ",A,B,");
        assert!(set.errors.is_empty());
    }

    #[test]
    fn root_rows_and_absolute_paths() {
        let set = parse(&[
            "NOP;;;;;;;ROOT;FundsXML;;;;;",
            "NOP;;;;;;;ROOT;;version;;;;4.1",
            "MAP;FUND_ID;;M;Text;;;MAP;/FundsXML/Funds/Fund/Id;;;;;",
        ]);
        assert_eq!(set.root.name.as_deref(), Some("FundsXML"));
        assert_eq!(set.root.attributes, vec![("version".into(), "4.1".into())]);
        assert_eq!(set.mappings[0].path(), "Funds/Fund/Id");
    }

    #[test]
    fn second_pass_links_loops_sources_and_references() {
        let set = parse(&[
            "MAP;FUND_ID;;M;Text;;;MAP;Funds/Fund/Id;;;;;",
            "CHANGE;FUND_ID;;;Text;;;LOOP;Funds/Fund;;;;;",
            "MAP;CCY;;;Text;;;MAP;Funds/Fund/Currency;;;;;",
            "MAP;NAV;;;Number;;;MAP;Funds/Fund/Navs/Nav;;;;@ccy = Funds/Fund/Currency;",
            "UNIQUE;ASSET_ID;;;Text;;;LOOP;Assets/Asset;;;;;",
            "MAP;ASSET_ID;;;Text;;;MAP;Assets/Asset/Id;;;;;",
            "FIX;'x';;;Text;;;MAP;Funds/Fund/Source;;;;;",
        ]);
        let loop_mapping = &set.mappings[1];
        assert_eq!(loop_mapping.loop_slot, Some(0));
        assert_eq!(loop_mapping.source_mapping, Some(0));
        assert_eq!(set.mappings[4].loop_slot, Some(1));
        assert_eq!(set.mappings[5].unique_slot, Some(1));
        let condition = set.mappings[3].xml.condition.as_ref().expect("condition");
        let mut resolved = Vec::new();
        let mut condition = condition.clone();
        condition.for_each_reference_mut(&mut |name, slot| resolved.push((name.to_string(), *slot)));
        assert_eq!(resolved, vec![("Funds/Fund/Currency".to_string(), Some(2))]);
        assert_eq!(set.loop_count(), 2);
    }

    #[test]
    fn linked_table_prefix_requires_addfile() {
        let set = parse(&[
            "ADDFILE;*-positions.csv;FUND_ID=FUND;;;;;MAP;Funds/Fund;;;;;",
            "MAP;:1:POS_ID;;;Text;;;MAP;Funds/Fund/Positions/Position/Id;;;;;",
            "MAP;:2:OTHER;;;Text;;;MAP;Funds/Fund/Other;;;;;",
        ]);
        assert_eq!(set.linked_files.len(), 1);
        assert_eq!(set.linked_files[0].primary_key, "FUND_ID");
        assert_eq!(set.linked_files[0].linked_key, "FUND");
        assert_eq!(set.mappings.len(), 1);
        assert_eq!(set.mappings[0].table, 1);
        assert_eq!(set.mappings[0].csv.content, "POS_ID");
        assert_eq!(set.errors.len(), 1);
        let resolved = set.linked_files[0].resolve(Path::new("/data/in/day1.csv"));
        assert_eq!(resolved, Path::new("/data/in/day1-positions.csv"));
    }

    #[test]
    fn invalid_condition_is_dropped_with_error() {
        let set = parse(&[
            "IF;KIND;;;Text;;(@a = '1') and (@b = '2') or (@c = '3');IF;Funds/Fund/Extra;;;;;",
            "IF;KIND;;;Text;;contentisvalid();IF;Funds/Fund/Other;;;;;",
        ]);
        assert_eq!(set.mappings.len(), 2);
        assert!(set.mappings[0].csv.condition.is_none());
        assert!(set.mappings[1].csv.content_check);
        assert_eq!(set.errors.len(), 1);
    }

    #[test]
    fn type_mismatch_uses_tree_type() {
        let set = parse(&["MAP;AMOUNT;;;Text;;;MAP;Funds/Fund/Amount;;Number;;;"]);
        assert_eq!(set.mappings[0].csv.value.field_type, FieldType::Number);
        assert_eq!(set.errors.len(), 1);
    }
}
