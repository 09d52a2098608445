//! Path addressing over a [`Document`].
//!
//! Paths are `/`-separated element names relative to the root; a segment may
//! carry a 1-based occurrence index (`Fund[2]`, default 1). The terminal
//! segment can additionally be narrowed by a [`NodeFilter`].

use crate::document::{Document, Element, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment<'a> {
    pub name: &'a str,
    pub index: usize,
}

/// Splits a path into segments, skipping empty ones.
pub fn parse_path(path: &str) -> Vec<PathSegment<'_>> {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('[') {
            Some((name, rest)) => {
                let index = rest
                    .trim_end_matches(']')
                    .trim()
                    .parse::<usize>()
                    .unwrap_or(1)
                    .max(1);
                PathSegment {
                    name: name.trim(),
                    index,
                }
            }
            None => PathSegment {
                name: segment,
                index: 1,
            },
        })
        .collect()
}

/// True when `inner` is `outer` or lies below it.
pub fn path_contains(outer: &str, inner: &str) -> bool {
    let outer = outer.trim_matches('/');
    let inner = inner.trim_matches('/');
    if outer.is_empty() {
        return true;
    }
    inner == outer
        || inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('['))
}

/// Strict descendant check used for loop nesting.
pub fn is_descendant(outer: &str, inner: &str) -> bool {
    path_contains(outer, inner) && outer.trim_matches('/') != inner.trim_matches('/')
}

/// Selects among same-named siblings on the terminal segment and names the
/// attributes a newly created match must carry.
pub struct NodeFilter<'a> {
    pub predicate: &'a dyn Fn(&Element) -> bool,
    pub stamp: Vec<(String, String)>,
}

impl Document {
    /// Finds the node at `path` below `from` without creating anything.
    pub fn find(&self, from: NodeId, path: &str, filter: Option<&NodeFilter<'_>>) -> Option<NodeId> {
        let segments = parse_path(path);
        let mut current = from;
        for (position, segment) in segments.iter().enumerate() {
            let terminal = position + 1 == segments.len();
            current = match (terminal, filter) {
                (true, Some(filter)) => self
                    .children_named(current, segment.name)
                    .find(|child| (filter.predicate)(self.element(*child)))?,
                _ => self
                    .children_named(current, segment.name)
                    .nth(segment.index - 1)?,
            };
        }
        Some(current)
    }

    /// Like [`Document::find`], appending same-named children until the
    /// requested occurrence exists. A filtered terminal segment without a
    /// match gets a fresh child stamped with the filter's attributes.
    pub fn find_or_create(&mut self, from: NodeId, path: &str, filter: Option<&NodeFilter<'_>>) -> NodeId {
        let segments = parse_path(path);
        let mut current = from;
        for (position, segment) in segments.iter().enumerate() {
            let terminal = position + 1 == segments.len();
            current = match (terminal, filter) {
                (true, Some(filter)) => {
                    let existing = self
                        .children_named(current, segment.name)
                        .find(|child| (filter.predicate)(self.element(*child)));
                    match existing {
                        Some(node) => node,
                        None => {
                            let node = self.append_child(current, segment.name);
                            for (name, value) in &filter.stamp {
                                self.set_attribute(node, name, value);
                            }
                            node
                        }
                    }
                }
                _ => {
                    let existing = self.children_named(current, segment.name).count();
                    for _ in existing..segment.index {
                        self.append_child(current, segment.name);
                    }
                    self.children_named(current, segment.name)
                        .nth(segment.index - 1)
                        .unwrap_or(current)
                }
            };
        }
        current
    }

    /// Number of same-named children addressed by the terminal segment of
    /// `path`; zero when an intermediate segment is missing.
    pub fn count(&self, from: NodeId, path: &str) -> usize {
        let segments = parse_path(path);
        let Some((last, parents)) = segments.split_last() else {
            return 0;
        };
        let mut current = from;
        for segment in parents {
            match self.children_named(current, segment.name).nth(segment.index - 1) {
                Some(node) => current = node,
                None => return 0,
            }
        }
        self.children_named(current, last.name).count()
    }

    /// Reads the text, or the attribute when `attribute` is given, at `path`.
    pub fn read_value(
        &self,
        from: NodeId,
        path: &str,
        attribute: Option<&str>,
        filter: Option<&NodeFilter<'_>>,
    ) -> Option<String> {
        let node = self.find(from, path, filter)?;
        match attribute {
            Some(name) => self.attribute(node, name).map(str::to_string),
            None => Some(self.text(node).trim().to_string()),
        }
    }

    /// Writes `value` at `path`, as text or as `attribute`. Empty values are
    /// skipped unless `keep_empty` asks for the (empty) node to exist.
    /// Returns the node written to.
    pub fn write_value(
        &mut self,
        from: NodeId,
        path: &str,
        attribute: Option<&str>,
        value: &str,
        keep_empty: bool,
        filter: Option<&NodeFilter<'_>>,
    ) -> Option<NodeId> {
        if value.is_empty() && !keep_empty {
            return None;
        }
        let node = self.find_or_create(from, path, filter);
        match attribute {
            Some(name) => self.set_attribute(node, name, value),
            None => self.set_text(node, value),
        }
        Some(node)
    }
}
