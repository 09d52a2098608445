//! Repeating-group state.
//!
//! Every LOOP mapping owns one [`LoopContext`]. Generation feeds the stack one
//! table row at a time through [`LoopStack::advance`]; extraction sizes the
//! loops from the tree and walks every index combination with
//! [`LoopStack::increment`].

use std::collections::HashMap;

use itertools::Itertools;
use log::debug;

use crate::{
    document::Document,
    mapping::{CsvOp, FieldMapping, MappingSet},
    path::{is_descendant, parse_path, path_contains},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Change,
    Unique,
}

#[derive(Debug, Clone)]
pub struct LoopContext {
    pub mapping: usize,
    pub kind: LoopKind,
    pub path: String,
    depth: usize,
    pub table: usize,
    /// Upper-cased column name, shared by lock-step loops.
    pub key: String,
    pub column: Option<usize>,
    pub index: usize,
    pub last_value: Option<String>,
    /// Values seen so far; a UNIQUE loop's index is a position in here.
    pub history: Vec<String>,
    pub first_record: bool,
    /// Sibling count in the tree (extraction).
    pub size: usize,
    /// Extraction: resolved sibling for a key-driven UNIQUE loop.
    pub resolved: Option<usize>,
    /// Path of the key node relative to the loop node, and its attribute.
    pub key_path: Option<(String, Option<String>)>,
    /// True when the key column is also filled from outside the loop, so
    /// extraction finds the sibling by value instead of enumerating.
    pub key_driven: bool,
    /// UNIQUE loops: nested loop state per group, restored on revisit.
    groups: HashMap<usize, Vec<NestedState>>,
}

/// Saved position of one nested loop while its UNIQUE parent is elsewhere.
#[derive(Debug, Clone)]
struct NestedState {
    slot: usize,
    index: usize,
    last_value: Option<String>,
    history: Vec<String>,
    groups: HashMap<usize, Vec<NestedState>>,
}

impl LoopContext {
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index used when addressing the tree.
    pub fn current(&self) -> usize {
        match (self.kind, self.key_driven) {
            (LoopKind::Unique, true) => self.resolved.unwrap_or(0),
            _ => self.index,
        }
    }

    fn enumerated(&self) -> bool {
        !(self.kind == LoopKind::Unique && self.key_driven)
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_value = None;
        self.history.clear();
        self.first_record = false;
        self.resolved = None;
        self.groups.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopStack {
    loops: Vec<LoopContext>,
}

impl LoopStack {
    /// One context per LOOP mapping, ordered by slot. Columns are taken from
    /// the mappings as currently bound.
    pub fn new(set: &MappingSet) -> Self {
        let mut loops = Vec::with_capacity(set.loop_count());
        for (idx, mapping) in set.mappings.iter().enumerate() {
            if mapping.loop_slot.is_none() {
                continue;
            }
            let kind = if mapping.csv.operation == CsvOp::Unique {
                LoopKind::Unique
            } else {
                LoopKind::Change
            };
            let path = mapping.xml.content.clone();
            let key = mapping.csv.content.to_ascii_uppercase();
            let same_column = |m: &&FieldMapping| {
                m.is_map_pair()
                    && m.table == mapping.table
                    && m.csv.content.eq_ignore_ascii_case(&mapping.csv.content)
            };
            let key_path = set
                .mappings
                .iter()
                .filter(same_column)
                .find(|m| is_descendant(&path, &m.xml.content))
                .map(|m| {
                    let relative = m.xml.content[path.trim_end_matches('/').len()..]
                        .trim_start_matches('/')
                        .to_string();
                    (relative, m.xml.attribute_name().map(str::to_string))
                })
                .or_else(|| {
                    set.mappings
                        .iter()
                        .filter(same_column)
                        .find(|m| m.xml.content == path)
                        .map(|m| (String::new(), m.xml.attribute_name().map(str::to_string)))
                });
            let key_driven = kind == LoopKind::Unique
                && key_path.is_some()
                && set
                    .mappings
                    .iter()
                    .filter(same_column)
                    .any(|m| !path_contains(&path, &m.xml.content));
            loops.push(LoopContext {
                mapping: idx,
                kind,
                depth: parse_path(&path).len(),
                path,
                table: mapping.table,
                key,
                column: mapping.column,
                index: 0,
                last_value: None,
                history: Vec::new(),
                first_record: false,
                size: 0,
                resolved: None,
                key_path,
                key_driven,
                groups: HashMap::new(),
            });
        }
        LoopStack { loops }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&LoopContext> {
        self.loops.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopContext> {
        self.loops.iter()
    }

    /// Slots from outermost to innermost; definition order breaks ties.
    fn by_depth(&self) -> Vec<usize> {
        (0..self.loops.len())
            .sorted_by_key(|slot| (self.loops[*slot].depth, *slot))
            .collect()
    }

    /// Feeds one row of `table` to every loop reading that table. Loops on
    /// other tables keep their index but are no longer on a first record.
    pub fn advance<F>(&mut self, table: usize, mut value_of: F)
    where
        F: FnMut(&LoopContext) -> String,
    {
        for slot in self.by_depth() {
            if self.loops[slot].table != table {
                self.loops[slot].first_record = false;
                continue;
            }
            let value = value_of(&self.loops[slot]);
            let ctx = &mut self.loops[slot];
            let previous = ctx.index;
            let fresh = ctx.last_value.is_none();
            let mut revisited = false;
            match ctx.kind {
                LoopKind::Change => {
                    let changed = ctx.last_value.as_deref() != Some(value.as_str());
                    if !fresh && changed {
                        ctx.index += 1;
                    }
                    if fresh {
                        ctx.index = 0;
                    }
                    ctx.first_record = changed;
                }
                LoopKind::Unique => match ctx.history.iter().position(|seen| *seen == value) {
                    Some(position) => {
                        ctx.index = position;
                        ctx.first_record = false;
                        revisited = true;
                    }
                    None => {
                        ctx.history.push(value.clone());
                        ctx.index = ctx.history.len() - 1;
                        ctx.first_record = true;
                    }
                },
            }
            ctx.last_value = Some(value);
            if !fresh && ctx.index == previous {
                continue;
            }
            debug!(
                "Loop '{}' now at index {} ({})",
                ctx.path,
                ctx.index,
                ctx.last_value.as_deref().unwrap_or_default()
            );
            let (kind, index) = (ctx.kind, ctx.index);
            if kind == LoopKind::Unique && !fresh {
                self.save_nested(slot, previous);
            }
            if revisited {
                self.restore_nested(slot, index);
            } else {
                self.reset_nested(slot);
            }
        }
    }

    fn nested_slots(&self, slot: usize) -> Vec<usize> {
        let outer = &self.loops[slot].path;
        (0..self.loops.len())
            .filter(|other| *other != slot && is_descendant(outer, &self.loops[*other].path))
            .collect()
    }

    fn reset_nested(&mut self, slot: usize) {
        for other in self.nested_slots(slot) {
            self.loops[other].reset();
        }
    }

    /// Parks the nested loops of UNIQUE `slot` under its group `group`.
    fn save_nested(&mut self, slot: usize, group: usize) {
        let states = self
            .nested_slots(slot)
            .into_iter()
            .map(|other| {
                let ctx = &self.loops[other];
                NestedState {
                    slot: other,
                    index: ctx.index,
                    last_value: ctx.last_value.clone(),
                    history: ctx.history.clone(),
                    groups: ctx.groups.clone(),
                }
            })
            .collect();
        self.loops[slot].groups.insert(group, states);
    }

    /// Puts the nested loops back where group `group` left them, so rows
    /// returning to it append after its existing children.
    fn restore_nested(&mut self, slot: usize, group: usize) {
        let Some(states) = self.loops[slot].groups.remove(&group) else {
            self.reset_nested(slot);
            return;
        };
        for state in states {
            let ctx = &mut self.loops[state.slot];
            ctx.index = state.index;
            ctx.last_value = state.last_value;
            ctx.history = state.history;
            ctx.groups = state.groups;
            ctx.first_record = false;
            ctx.resolved = None;
        }
    }

    /// Substitutes every enclosing loop's 1-based index into `path`.
    pub fn indexed_path(&self, path: &str) -> String {
        self.indexed_path_with(path, None)
    }

    fn indexed_path_with(&self, path: &str, forced: Option<(usize, usize)>) -> String {
        let segments = parse_path(path);
        let mut indices = segments
            .iter()
            .map(|segment| (segment.index > 1).then_some(segment.index))
            .collect::<Vec<_>>();
        for (slot, ctx) in self.loops.iter().enumerate() {
            if ctx.depth == 0 || ctx.depth > segments.len() || !path_contains(&ctx.path, path) {
                continue;
            }
            let position = match forced {
                Some((forced_slot, position)) if forced_slot == slot => position,
                _ => ctx.current(),
            };
            indices[ctx.depth - 1] = Some(position + 1);
        }
        segments
            .iter()
            .zip(indices)
            .map(|(segment, index)| match index {
                Some(index) => format!("{}[{index}]", segment.name),
                None => segment.name.to_string(),
            })
            .join("/")
    }

    /// First-record flag of the innermost loop on `table` enclosing `path`;
    /// `None` when no such loop exists.
    pub fn first_record_for(&self, path: &str, table: usize) -> Option<bool> {
        self.loops
            .iter()
            .filter(|ctx| ctx.table == table && path_contains(&ctx.path, path))
            .max_by_key(|ctx| ctx.depth)
            .map(|ctx| ctx.first_record)
    }

    /// Innermost loop enclosing `path`, on any table.
    pub fn innermost_for(&self, path: &str) -> Option<&LoopContext> {
        self.loops
            .iter()
            .filter(|ctx| path_contains(&ctx.path, path))
            .max_by_key(|ctx| ctx.depth)
    }

    /// True when `path` lies inside a key-driven UNIQUE loop.
    pub fn under_keyed_unique(&self, path: &str) -> bool {
        self.loops
            .iter()
            .any(|ctx| !ctx.enumerated() && path_contains(&ctx.path, path))
    }

    /// True when a key-driven UNIQUE loop enclosing `path` found no sibling
    /// for the current row.
    pub fn unresolved_unique(&self, path: &str) -> bool {
        self.loops
            .iter()
            .any(|ctx| !ctx.enumerated() && ctx.resolved.is_none() && path_contains(&ctx.path, path))
    }

    /// Extraction start: every index at zero and sizes counted in `document`.
    pub fn size_from(&mut self, document: &Document) {
        for ctx in &mut self.loops {
            ctx.reset();
        }
        for slot in self.by_depth() {
            let path = self.indexed_path(&self.loops[slot].path);
            self.loops[slot].size = document.count(document.root(), &path);
        }
    }

    /// Moves to the next index combination. Returns false once every
    /// enumerated loop is exhausted.
    pub fn increment(&mut self, document: &Document) -> bool {
        let candidate = self
            .loops
            .iter()
            .enumerate()
            .filter(|(_, ctx)| ctx.enumerated() && ctx.size > 0 && ctx.index + 1 < ctx.size)
            .max_by_key(|(slot, ctx)| (ctx.depth, *slot))
            .map(|(slot, _)| slot);
        let Some(chosen) = candidate else {
            return false;
        };
        let (table, key) = (self.loops[chosen].table, self.loops[chosen].key.clone());
        let mut moved = Vec::new();
        for (slot, ctx) in self.loops.iter_mut().enumerate() {
            let lock_step = slot == chosen
                || (ctx.enumerated() && ctx.table == table && ctx.key == key && ctx.index + 1 < ctx.size);
            if lock_step {
                ctx.index += 1;
                moved.push(slot);
            }
        }
        for slot in self.by_depth() {
            let nested = moved
                .iter()
                .any(|outer| is_descendant(&self.loops[*outer].path, &self.loops[slot].path));
            if nested && !moved.contains(&slot) {
                self.loops[slot].reset();
                let path = self.indexed_path(&self.loops[slot].path);
                self.loops[slot].size = document.count(document.root(), &path);
            }
        }
        true
    }

    /// Finds the sibling of a key-driven UNIQUE loop whose key node holds
    /// `value`. The first match wins.
    pub fn resolve_unique(&mut self, document: &Document, slot: usize, value: &str) -> Option<usize> {
        let ctx = self.loops.get(slot)?;
        let (relative, attribute) = ctx.key_path.clone()?;
        let count = document.count(document.root(), &self.indexed_path(&ctx.path));
        let found = (0..count).find(|position| {
            let sibling = self.indexed_path_with(&ctx.path, Some((slot, *position)));
            let key_path = if relative.is_empty() {
                sibling
            } else {
                format!("{sibling}/{relative}")
            };
            document
                .read_value(document.root(), &key_path, attribute.as_deref(), None)
                .is_some_and(|found| found == value)
        });
        self.loops[slot].resolved = found;
        found
    }

    /// Clears every UNIQUE resolution before a new row is assembled.
    pub fn clear_resolved(&mut self) {
        for ctx in &mut self.loops {
            ctx.resolved = None;
        }
    }

    /// Key-driven UNIQUE loops, outermost first.
    pub fn keyed_unique_slots(&self) -> Vec<usize> {
        self.by_depth()
            .into_iter()
            .filter(|slot| !self.loops[*slot].enumerated())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "CSV_OP;CSV_CONTENT;CSV_TYPE;XML_OP;XML_CONTENT;CSV_CONTENT2";

    fn stack(rows: &[&str]) -> (MappingSet, LoopStack) {
        let text = std::iter::once(HEADER)
            .chain(rows.iter().copied())
            .join("\n");
        let set = MappingSet::parse("m.csv", &text).expect("mapping");
        let stack = LoopStack::new(&set);
        (set, stack)
    }

    fn nested() -> (MappingSet, LoopStack) {
        stack(&[
            "CHANGE;FUND;Text;LOOP;Funds/Fund",
            "MAP;FUND;Text;MAP;Funds/Fund/Id",
            "CHANGE;NAV_DATE;Text;LOOP;Funds/Fund/Navs/Nav",
            "MAP;NAV_DATE;Text;MAP;Funds/Fund/Navs/Nav/Date",
        ])
    }

    #[test]
    fn change_loops_restart_nested_groups() {
        let (_, mut loops) = nested();
        let rows = [("A", "d1"), ("A", "d2"), ("B", "d1"), ("B", "d1")];
        let mut seen = Vec::new();
        for (fund, date) in rows {
            loops.advance(0, |ctx| if ctx.key == "FUND" { fund.into() } else { date.into() });
            seen.push((
                loops.get(0).map(|c| (c.index, c.first_record)),
                loops.get(1).map(|c| (c.index, c.first_record)),
            ));
        }
        assert_eq!(
            seen,
            vec![
                (Some((0, true)), Some((0, true))),
                (Some((0, false)), Some((1, true))),
                (Some((1, true)), Some((0, true))),
                (Some((1, false)), Some((0, false))),
            ]
        );
        assert_eq!(loops.indexed_path("Funds/Fund/Navs/Nav/Date"), "Funds/Fund[2]/Navs/Nav[1]/Date");
        assert_eq!(loops.first_record_for("Funds/Fund/Id", 0), Some(false));
        assert_eq!(loops.first_record_for("Header/Id", 0), None);
    }

    #[test]
    fn unique_loops_reuse_slots() {
        let (_, mut loops) = stack(&[
            "UNIQUE;ASSET;Text;LOOP;Assets/Asset",
            "MAP;ASSET;Text;MAP;Assets/Asset/Id",
        ]);
        let mut indices = Vec::new();
        for value in ["x", "y", "x", "z", "y"] {
            loops.advance(0, |_| value.to_string());
            indices.push(loops.get(0).map(|c| (c.index, c.first_record)));
        }
        assert_eq!(
            indices,
            vec![
                Some((0, true)),
                Some((1, true)),
                Some((0, false)),
                Some((2, true)),
                Some((1, false)),
            ]
        );
    }

    #[test]
    fn revisited_unique_group_keeps_nested_position() {
        let (_, mut loops) = stack(&[
            "UNIQUE;ASSET;Text;LOOP;Assets/Asset",
            "MAP;ASSET;Text;MAP;Assets/Asset/Id",
            "CHANGE;PRICE;Text;LOOP;Assets/Asset/Prices/Price",
            "MAP;PRICE;Text;MAP;Assets/Asset/Prices/Price/V",
        ]);
        let rows = [("x", "p1"), ("y", "p2"), ("x", "p3"), ("y", "p2")];
        let mut seen = Vec::new();
        for (asset, price) in rows {
            loops.advance(0, |ctx| if ctx.key == "ASSET" { asset.into() } else { price.into() });
            seen.push(loops.indexed_path("Assets/Asset/Prices/Price/V"));
            seen.push(format!("{:?}", loops.first_record_for("Assets/Asset/Prices/Price/V", 0)));
        }
        assert_eq!(
            seen,
            vec![
                "Assets/Asset[1]/Prices/Price[1]/V",
                "Some(true)",
                "Assets/Asset[2]/Prices/Price[1]/V",
                "Some(true)",
                "Assets/Asset[1]/Prices/Price[2]/V",
                "Some(true)",
                "Assets/Asset[2]/Prices/Price[1]/V",
                "Some(false)",
            ]
        );
    }

    #[test]
    fn loops_on_other_tables_lose_first_record() {
        let (_, mut loops) = stack(&[
            "ADDFILE;pos.csv;;MAP;Funds/Fund;FUND",
            "CHANGE;FUND;Text;LOOP;Funds/Fund",
            "CHANGE;:1:POS;Text;LOOP;Funds/Fund/Positions/Position",
            "MAP;:1:POS;Text;MAP;Funds/Fund/Positions/Position/Id",
        ]);
        loops.advance(0, |_| "A".into());
        assert_eq!(loops.first_record_for("Funds/Fund", 0), Some(true));
        loops.advance(1, |_| "p1".into());
        assert_eq!(loops.first_record_for("Funds/Fund", 0), Some(false));
        assert_eq!(loops.first_record_for("Funds/Fund/Positions/Position/Id", 1), Some(true));
    }

    #[test]
    fn odometer_visits_every_combination() {
        let (_, mut loops) = nested();
        let doc = Document::parse(
            "<D><Funds>\
               <Fund><Navs><Nav/><Nav/></Navs></Fund>\
               <Fund><Navs><Nav/></Navs></Fund>\
               <Fund/>\
             </Funds></D>",
        )
        .expect("doc");
        loops.size_from(&doc);
        let mut combos = vec![(loops.get(0).map(|c| c.index), loops.get(1).map(|c| c.index))];
        while loops.increment(&doc) {
            combos.push((loops.get(0).map(|c| c.index), loops.get(1).map(|c| c.index)));
        }
        assert_eq!(
            combos,
            vec![
                (Some(0), Some(0)),
                (Some(0), Some(1)),
                (Some(1), Some(0)),
                (Some(2), Some(0)),
            ]
        );
        assert_eq!(loops.get(1).map(|c| c.size), Some(0));
    }

    #[test]
    fn keyed_unique_loop_resolves_by_value() {
        let (_, mut loops) = stack(&[
            "CHANGE;POS;Text;LOOP;Funds/Fund/Positions/Position",
            "MAP;POS;Text;MAP;Funds/Fund/Positions/Position/Id",
            "MAP;ASSET;Text;MAP;Funds/Fund/Positions/Position/AssetId",
            "UNIQUE;ASSET;Text;LOOP;Assets/Asset",
            "MAP;ASSET;Text;MAP;Assets/Asset/Id",
            "MAP;NAME;Text;MAP;Assets/Asset/Name",
        ]);
        let doc = Document::parse(
            "<D><Assets><Asset><Id>a1</Id></Asset><Asset><Id>a2</Id></Asset><Asset><Id>a2</Id></Asset></Assets></D>",
        )
        .expect("doc");
        loops.size_from(&doc);
        assert_eq!(loops.keyed_unique_slots(), vec![1]);
        assert!(loops.under_keyed_unique("Assets/Asset/Name"));
        assert_eq!(loops.resolve_unique(&doc, 1, "a2"), Some(1));
        assert_eq!(loops.indexed_path("Assets/Asset/Name"), "Assets/Asset[2]/Name");
        assert_eq!(loops.resolve_unique(&doc, 1, "zz"), None);
        assert_eq!(loops.indexed_path("Assets/Asset/Name"), "Assets/Asset[1]/Name");
    }
}
