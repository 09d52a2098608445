//! Table → tree generation.
//!
//! Rows of the primary table are visited in order. For each row the loop
//! stack is advanced and every mapping of the primary table is applied; then
//! each linked table's window of rows matching the row's join key is played
//! through the same pass.

use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};

use crate::{
    condition::{ElementOperands, OperandSource},
    context::ConversionContext,
    data::{Endpoint, FormatPattern, convert},
    document::{Document, Element},
    mapping::{CsvOp, FieldMapping, MappingSet, XmlOp},
    path::{NodeFilter, path_contains},
    table::{JoinState, Table},
    variables,
};

/// Values visible to conditions while a row is processed.
struct RowValues<'t> {
    mappings: &'t MappingSet,
    tables: &'t [Table],
    /// Current row per table.
    rows: &'t [usize],
    table: usize,
}

impl RowValues<'_> {
    fn cell(&self, table: usize, column: Option<usize>) -> String {
        match (self.tables.get(table), column, self.rows.get(table)) {
            (Some(data), Some(column), Some(row)) => data.cell(*row, column).to_string(),
            _ => String::new(),
        }
    }

    fn mapping_value(&self, idx: usize) -> String {
        self.mappings
            .mappings
            .get(idx)
            .map(|m| self.cell(m.table, m.column))
            .unwrap_or_default()
    }
}

impl OperandSource for RowValues<'_> {
    fn reference(&self, name: &str, mapping: Option<usize>) -> Option<String> {
        match mapping {
            Some(idx) => Some(self.mapping_value(idx)),
            None => {
                let column = self.tables.get(self.table)?.column_index(name)?;
                Some(self.cell(self.table, Some(column)))
            }
        }
    }
}

struct GenerationState {
    /// Last outcome of each IF mapping, reused while another table is active.
    if_outcomes: Vec<Option<bool>>,
    rows: Vec<usize>,
}

/// Builds the tree for `tables` (primary first, then linked tables in
/// ADDFILE order).
pub fn generate(ctx: &mut ConversionContext<'_>, tables: &mut [Table]) -> Result<Document> {
    let mappings = ctx.mappings;
    if tables.is_empty() {
        bail!("No input table loaded");
    }
    link_tables(mappings, tables)?;
    report_missing_columns(ctx, tables);

    let root_name = mappings.root_name(&ctx.settings.root_element).to_string();
    let mut document = Document::new(&root_name);
    for (name, value) in &mappings.root.attributes {
        document.set_attribute(document.root(), name, value);
    }

    let mut state = GenerationState {
        if_outcomes: vec![None; mappings.mappings.len()],
        rows: vec![0; tables.len()],
    };
    let row_count = tables[0].row_count();
    if row_count == 0 {
        warn!("{} holds no data records", tables[0].name());
    }
    for row in 0..row_count {
        state.rows[0] = row;
        advance_loops(ctx, tables, 0, row);
        run_pass(ctx, &mut document, tables, &mut state, 0, row == 0)?;

        for linked in 1..tables.len() {
            let key = tables[linked]
                .join
                .as_ref()
                .and_then(|join| join.primary_column)
                .map(|column| tables[0].cell(row, column).to_string())
                .unwrap_or_default();
            let Some(window) = tables[linked].next_window(&key) else {
                continue;
            };
            debug!("{}: rows {:?} match key '{key}'", tables[linked].name(), window);
            for (offset, linked_row) in window.enumerate() {
                state.rows[linked] = linked_row;
                advance_loops(ctx, tables, linked, linked_row);
                run_pass(ctx, &mut document, tables, &mut state, linked, offset == 0)?;
            }
        }
        ctx.records += 1;
    }
    info!(
        "Generated {} node(s) from {} record(s) of {}",
        document.len(),
        ctx.records,
        tables[0].name()
    );
    Ok(document)
}

fn link_tables(mappings: &MappingSet, tables: &mut [Table]) -> Result<()> {
    for (offset, linked) in mappings.linked_files.iter().enumerate() {
        let index = offset + 1;
        if index >= tables.len() {
            bail!("Linked table {index} ('{}') was not loaded", linked.file);
        }
        let primary = tables[0].column_index(&linked.primary_key).ok_or_else(|| {
            anyhow!(
                "Join column '{}' not found in {}",
                linked.primary_key,
                tables[0].name()
            )
        })?;
        let secondary = tables[index].column_index(&linked.linked_key).ok_or_else(|| {
            anyhow!(
                "Join column '{}' not found in {}",
                linked.linked_key,
                tables[index].name()
            )
        })?;
        tables[index].join = Some(JoinState::new(Some(primary), Some(secondary)));
    }
    Ok(())
}

fn report_missing_columns(ctx: &mut ConversionContext<'_>, tables: &[Table]) {
    let mappings = ctx.mappings;
    for mapping in &mappings.mappings {
        if !mapping.csv.operation.reads_column() || mapping.column.is_some() {
            continue;
        }
        let Some(table) = tables.get(mapping.table) else {
            continue;
        };
        if mapping.csv.value.mandatory {
            let message = format!("Column '{}' not found in {}", mapping.csv.content, table.name());
            ctx.report_message(&mapping.csv.content, 1, mapping.path(), message);
        } else {
            debug!("Optional column '{}' not present in {}", mapping.csv.content, table.name());
        }
    }
}

fn advance_loops(ctx: &mut ConversionContext<'_>, tables: &[Table], table: usize, row: usize) {
    let data = &tables[table];
    ctx.loops.advance(table, |lp| {
        lp.column
            .map(|column| data.cell(row, column).to_string())
            .unwrap_or_default()
    });
}

fn run_pass(
    ctx: &mut ConversionContext<'_>,
    document: &mut Document,
    tables: &[Table],
    state: &mut GenerationState,
    table: usize,
    first_of_scope: bool,
) -> Result<()> {
    let mappings = ctx.mappings;
    let mut suppressed: Option<&str> = None;
    for (idx, mapping) in mappings.mappings.iter().enumerate() {
        let path = mapping.path();
        if let Some(scope) = suppressed {
            if path_contains(scope, path) {
                continue;
            }
            suppressed = None;
        }
        match (mapping.csv.operation, mapping.xml.operation) {
            (CsvOp::If, XmlOp::If) => {
                let outcome = if mapping.table == table {
                    let values = RowValues {
                        mappings,
                        tables,
                        rows: &state.rows,
                        table,
                    };
                    let outcome = if_holds(mappings, mapping, &values);
                    state.if_outcomes[idx] = Some(outcome);
                    outcome
                } else {
                    state.if_outcomes[idx].unwrap_or(true)
                };
                if !outcome {
                    debug!("IF on '{}' failed; skipping its block", mapping.csv.content);
                    suppressed = Some(path);
                }
                continue;
            }
            (_, XmlOp::Loop) | (_, XmlOp::Root) | (CsvOp::Map, XmlOp::Fix | XmlOp::Var) => continue,
            _ => {}
        }
        if mapping.table != table {
            continue;
        }
        let first = ctx
            .loops
            .first_record_for(path, table)
            .unwrap_or(first_of_scope);
        if !first {
            continue;
        }
        write_mapping(ctx, document, tables, &state.rows, table, mapping)?;
    }
    Ok(())
}

/// An IF holds when its column matches the enumeration format (or is merely
/// non-empty) and its condition, if any, is true.
fn if_holds(mappings: &MappingSet, mapping: &FieldMapping, values: &RowValues<'_>) -> bool {
    let value = values.cell(mapping.table, mapping.column);
    let mut holds = match &mapping.csv.value.pattern {
        FormatPattern::Enumeration(items) => items.iter().any(|item| *item == value),
        FormatPattern::None => !value.is_empty(),
        pattern => !value.is_empty() && pattern.matches(&value),
    };
    if holds && mapping.csv.content_check {
        let source = mapping
            .source_mapping
            .and_then(|idx| mappings.mappings.get(idx))
            .unwrap_or(mapping);
        let decimal = values
            .tables
            .get(mapping.table)
            .map(Table::decimal_separator)
            .unwrap_or('.');
        holds = convert(
            &value,
            Endpoint::table(&source.csv.value, decimal),
            Endpoint::tree(&source.xml.value),
        )
        .is_ok();
    }
    if holds {
        if let Some(condition) = &mapping.csv.condition {
            holds = condition.evaluate(values);
        }
    }
    holds
}

fn write_mapping(
    ctx: &mut ConversionContext<'_>,
    document: &mut Document,
    tables: &[Table],
    rows: &[usize],
    table: usize,
    mapping: &FieldMapping,
) -> Result<()> {
    let mappings = ctx.mappings;
    let values = RowValues {
        mappings,
        tables,
        rows,
        table,
    };
    let data = &tables[table];
    let row = rows[table];
    let xpath = ctx.loops.indexed_path(mapping.path());
    let value = match mapping.csv.operation {
        CsvOp::Fix => mapping.csv.content.clone(),
        CsvOp::Var => variables::evaluate(&mapping.csv.content, ctx.counters)?,
        CsvOp::Map => {
            if let Some(condition) = &mapping.csv.condition {
                if !condition.evaluate(&values) {
                    return Ok(());
                }
            }
            let raw = values.cell(table, mapping.column);
            let converted = convert(
                &raw,
                Endpoint::table(&mapping.csv.value, data.decimal_separator()),
                Endpoint::tree(&mapping.xml.value),
            );
            if let Some(error) = &converted.error {
                ctx.report(mapping, data.line_number(row), &xpath, &raw, error);
            }
            converted.value
        }
        _ => return Ok(()),
    };

    let attribute = mapping.xml.attribute_name();
    let keep_empty = mapping.xml.value.mandatory;
    match &mapping.xml.condition {
        Some(condition) => {
            let stamp = condition.attribute_assignments(&values);
            let predicate = |element: &Element| {
                condition.evaluate(&ElementOperands {
                    element,
                    inner: &values,
                })
            };
            let filter = NodeFilter {
                predicate: &predicate,
                stamp,
            };
            document.write_value(document.root(), &xpath, attribute, &value, keep_empty, Some(&filter));
        }
        None => {
            document.write_value(document.root(), &xpath, attribute, &value, keep_empty, None);
        }
    }

    if mapping.path().eq_ignore_ascii_case(&ctx.settings.unique_id_path) {
        ctx.unique_document_id = Some(value);
    }
    Ok(())
}
