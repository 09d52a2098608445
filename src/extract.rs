//! Tree → table extraction.
//!
//! Loops are sized by counting nodes in the tree, then every combination of
//! loop indices is visited odometer-style. Each combination assembles one
//! output row; rows left entirely empty are dropped.

use anyhow::Result;
use log::{debug, info, warn};

use crate::{
    condition::{ElementOperands, OperandSource},
    context::ConversionContext,
    data::{ConversionError, Endpoint, FormatPattern, convert},
    document::{Document, Element},
    mapping::{CsvOp, FieldMapping, MappingSet, XmlOp},
    path::{NodeFilter, path_contains},
    table::Table,
    variables,
};

/// Row being assembled: converted cells plus the tree values they came from.
struct RowBuffer {
    cells: Vec<String>,
    raw: Vec<String>,
}

impl RowBuffer {
    fn new(width: usize) -> Self {
        RowBuffer {
            cells: vec![String::new(); width],
            raw: vec![String::new(); width],
        }
    }

    fn set(&mut self, column: usize, value: String, raw: String) {
        let Some(cell) = self.cells.get_mut(column) else {
            return;
        };
        if cell.is_empty() || !value.is_empty() {
            *cell = value;
            self.raw[column] = raw;
        }
    }
}

/// Condition operands answered from the row under construction.
struct RowCells<'r> {
    mappings: &'r MappingSet,
    template: &'r Table,
    cells: &'r [String],
}

impl OperandSource for RowCells<'_> {
    fn reference(&self, name: &str, mapping: Option<usize>) -> Option<String> {
        let column = match mapping {
            Some(idx) => self.mappings.mappings.get(idx)?.column?,
            None => self.template.column_index(name)?,
        };
        self.cells.get(column).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Everything outside key-driven UNIQUE loops.
    Outer,
    /// Mappings inside key-driven UNIQUE loops, once their keys are known.
    Keyed,
}

/// Extracts the rows described by the primary-table mappings from
/// `document`. Columns follow `template`.
pub fn extract(ctx: &mut ConversionContext<'_>, document: &Document, template: &Table) -> Result<Vec<Vec<String>>> {
    let mappings = ctx.mappings;
    let expected_root = mappings.root_name(&ctx.settings.root_element);
    if !document.element(document.root()).is_named(expected_root) {
        warn!(
            "Root element is <{}>, mapping expects <{expected_root}>",
            document.root_name()
        );
    }

    ctx.loops.size_from(document);
    for lp in ctx.loops.iter() {
        debug!("Loop '{}' holds {} node(s)", lp.path, lp.size);
    }

    let width = template.headers().len();
    let mut rows = Vec::new();
    loop {
        let mut buffer = RowBuffer::new(width);
        ctx.loops.clear_resolved();
        fill_row(ctx, document, template, &mut buffer, Stage::Outer)?;
        for slot in ctx.loops.keyed_unique_slots() {
            let key = ctx
                .loops
                .get(slot)
                .and_then(|lp| lp.column)
                .and_then(|column| buffer.raw.get(column))
                .cloned()
                .unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            if ctx.loops.resolve_unique(document, slot, &key).is_none() {
                debug!("No UNIQUE sibling holds key '{key}'");
            }
        }
        fill_row(ctx, document, template, &mut buffer, Stage::Keyed)?;

        if buffer.cells.iter().any(|cell| !cell.is_empty()) {
            ctx.records += 1;
            rows.push(buffer.cells);
        }
        if !ctx.loops.increment(document) {
            break;
        }
    }
    info!(
        "Extracted {} record(s) from <{}>",
        rows.len(),
        document.root_name()
    );
    Ok(rows)
}

fn fill_row(
    ctx: &mut ConversionContext<'_>,
    document: &Document,
    template: &Table,
    buffer: &mut RowBuffer,
    stage: Stage,
) -> Result<()> {
    let mappings = ctx.mappings;
    let mut suppressed: Option<&str> = None;
    for mapping in &mappings.mappings {
        if mapping.table != 0 {
            continue;
        }
        let path = mapping.path();
        let keyed = ctx.loops.under_keyed_unique(path);
        if keyed != (stage == Stage::Keyed) {
            continue;
        }
        if let Some(scope) = suppressed {
            if path_contains(scope, path) {
                continue;
            }
            suppressed = None;
        }
        if keyed && ctx.loops.unresolved_unique(path) {
            continue;
        }
        match (mapping.csv.operation, mapping.xml.operation) {
            (CsvOp::If, XmlOp::If) => {
                if !if_holds(ctx, document, template, buffer, mapping) {
                    debug!("IF on '{}' failed; skipping its block", mapping.csv.content);
                    suppressed = Some(path);
                }
            }
            (CsvOp::Map, XmlOp::Map) => read_mapping(ctx, document, template, buffer, mapping),
            (CsvOp::Map, XmlOp::Fix) => {
                if let Some(column) = mapping.column {
                    buffer.set(column, mapping.xml.content.clone(), String::new());
                }
            }
            (CsvOp::Map, XmlOp::Var) => {
                if let Some(column) = mapping.column {
                    let value = variables::evaluate(&mapping.xml.content, ctx.counters)?;
                    buffer.set(column, value, String::new());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_node(
    ctx: &ConversionContext<'_>,
    document: &Document,
    template: &Table,
    cells: &[String],
    mapping: &FieldMapping,
) -> (String, Option<String>) {
    let xpath = ctx.loops.indexed_path(mapping.path());
    let attribute = mapping.xml.attribute_name();
    let found = match &mapping.xml.condition {
        Some(condition) => {
            let row = RowCells {
                mappings: ctx.mappings,
                template,
                cells,
            };
            let predicate = |element: &Element| {
                condition.evaluate(&ElementOperands {
                    element,
                    inner: &row,
                })
            };
            let filter = NodeFilter {
                predicate: &predicate,
                stamp: Vec::new(),
            };
            document.read_value(document.root(), &xpath, attribute, Some(&filter))
        }
        None => document.read_value(document.root(), &xpath, attribute, None),
    };
    (xpath, found)
}

fn read_mapping(
    ctx: &mut ConversionContext<'_>,
    document: &Document,
    template: &Table,
    buffer: &mut RowBuffer,
    mapping: &FieldMapping,
) {
    let Some(column) = mapping.column else {
        return;
    };
    let (xpath, found) = read_node(ctx, document, template, &buffer.cells, mapping);
    let line = ctx.records + 1;
    let Some(raw) = found else {
        if mapping.xml.value.mandatory {
            ctx.report(mapping, line, &xpath, "", &ConversionError::MandatoryMissing);
        }
        return;
    };
    let converted = convert(
        &raw,
        Endpoint::tree(&mapping.xml.value),
        Endpoint::table(&mapping.csv.value, template.decimal_separator()),
    );
    if let Some(error) = &converted.error {
        ctx.report(mapping, line, &xpath, &raw, error);
    }
    buffer.set(column, converted.value, raw);
}

/// The IF's column value is taken from its source mapping's node; without a
/// source mapping the IF holds when its own node exists.
fn if_holds(
    ctx: &ConversionContext<'_>,
    document: &Document,
    template: &Table,
    buffer: &RowBuffer,
    mapping: &FieldMapping,
) -> bool {
    let mappings = ctx.mappings;
    let source = mapping
        .source_mapping
        .and_then(|idx| mappings.mappings.get(idx));
    let (value, clean) = match source {
        Some(source) => {
            let (_, found) = read_node(ctx, document, template, &buffer.cells, source);
            let raw = found.unwrap_or_default();
            let converted = convert(
                &raw,
                Endpoint::tree(&source.xml.value),
                Endpoint::table(&source.csv.value, template.decimal_separator()),
            );
            let clean = converted.is_ok();
            (converted.value, clean)
        }
        None => {
            let xpath = ctx.loops.indexed_path(mapping.path());
            let exists = document.find(document.root(), &xpath, None).is_some();
            (if exists { xpath } else { String::new() }, true)
        }
    };
    let mut holds = match &mapping.csv.value.pattern {
        FormatPattern::Enumeration(items) => items.iter().any(|item| *item == value),
        FormatPattern::None => !value.is_empty(),
        pattern => !value.is_empty() && pattern.matches(&value),
    };
    if mapping.csv.content_check {
        holds = holds && clean;
    }
    if holds {
        if let Some(condition) = &mapping.csv.condition {
            holds = condition.evaluate(&RowCells {
                mappings,
                template,
                cells: &buffer.cells,
            });
        }
    }
    holds
}
