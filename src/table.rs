//! Delimited table store.
//!
//! A [`Table`] holds one delimited file fully in memory. Loading sniffs the
//! column delimiter from the header line, splits quoted fields and records
//! per-column quoting from the first data row so extraction can reproduce it.
//! Linked tables additionally carry a [`JoinState`] describing how their rows
//! correlate with the primary table.

use std::{ops::Range, path::Path};

use anyhow::{Result, bail};
use encoding_rs::Encoding;
use itertools::Itertools;
use log::debug;

use crate::io_utils;

/// Delimiter candidates in tie-break order.
pub const DELIMITER_CANDIDATES: [char; 11] =
    [',', ';', ':', '\t', '|', '/', '^', '!', '%', '$', '#'];

/// Picks the candidate occurring most often in `header`; the earlier
/// candidate wins a tie and `,` is used when none occurs.
pub fn detect_delimiter(header: &str) -> char {
    let mut best = (DELIMITER_CANDIDATES[0], 0usize);
    for candidate in DELIMITER_CANDIDATES {
        let count = header.matches(candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

/// Characters trimmed around unquoted fields.
pub fn default_ignore_chars(delimiter: char) -> &'static str {
    if delimiter == '\t' { " " } else { " \t" }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitField {
    pub value: String,
    pub quoted: bool,
}

/// Splits one line into fields.
///
/// Ignore characters are trimmed outside quotes. A quoted field runs to its
/// closing quote (`""` is an escaped quote) and anything between the closing
/// quote and the next delimiter is dropped.
pub fn split_line(line: &str, delimiter: char, ignore: &str) -> Vec<SplitField> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| ignore.contains(*c)) {
            chars.next();
        }
        let mut value = String::new();
        let mut quoted = false;
        let mut ended_on_delimiter = false;
        if chars.peek() == Some(&'"') {
            quoted = true;
            chars.next();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        value.push('"');
                    } else {
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            for c in chars.by_ref() {
                if c == delimiter {
                    ended_on_delimiter = true;
                    break;
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == delimiter {
                    ended_on_delimiter = true;
                    break;
                }
                value.push(c);
            }
            let trimmed_len = value.trim_end_matches(|c| ignore.contains(c)).len();
            value.truncate(trimmed_len);
        }
        fields.push(SplitField { value, quoted });
        if !ended_on_delimiter {
            break;
        }
    }
    fields
}

/// Infers the decimal separator from sample numeric values.
///
/// A value holding both characters votes for whichever comes last. A value
/// holding only one votes for it unless exactly three digits follow, which
/// reads as a thousands group. `.` wins a tie.
pub fn infer_decimal_separator<'a, I>(values: I) -> char
where
    I: IntoIterator<Item = &'a str>,
{
    let (mut comma, mut point) = (0usize, 0usize);
    for value in values {
        match (value.rfind(','), value.rfind('.')) {
            (Some(c), Some(p)) => {
                if c > p {
                    comma += 1;
                } else {
                    point += 1;
                }
            }
            (Some(c), None) if digits_after(value, c) != 3 => comma += 1,
            (None, Some(p)) if digits_after(value, p) != 3 => point += 1,
            _ => {}
        }
    }
    if comma > point { ',' } else { '.' }
}

fn digits_after(value: &str, position: usize) -> usize {
    value[position + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count()
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Overrides delimiter sniffing.
    pub delimiter: Option<char>,
    pub ignore_chars: Option<String>,
    /// Rows with fewer non-empty cells are skipped.
    pub min_populated_cells: usize,
    /// Column names the mapping refers to; used to spot a second header line.
    pub mapped_columns: Vec<String>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            ignore_chars: None,
            min_populated_cells: 1,
            mapped_columns: Vec::new(),
        }
    }
}

/// Join bookkeeping for a linked table.
#[derive(Debug, Clone, Default)]
pub struct JoinState {
    pub primary_column: Option<usize>,
    pub linked_column: Option<usize>,
    last_key: Option<String>,
    cursor: usize,
}

impl JoinState {
    pub fn new(primary_column: Option<usize>, linked_column: Option<usize>) -> Self {
        Self {
            primary_column,
            linked_column,
            ..Self::default()
        }
    }

    pub fn last_key(&self) -> Option<&str> {
        self.last_key.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    delimiter: char,
    header_line: String,
    headers: Vec<String>,
    second_headers: Vec<String>,
    quoted: Vec<bool>,
    rows: Vec<Vec<String>>,
    line_numbers: Vec<usize>,
    decimal_separator: char,
    pub join: Option<JoinState>,
}

impl Table {
    pub fn load(path: &Path, encoding: &'static Encoding, options: &TableOptions) -> Result<Self> {
        let text = io_utils::read_text(path, encoding)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::parse(&name, &text, options)
    }

    pub fn parse(name: &str, text: &str, options: &TableOptions) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')));
        let Some((_, header_line)) = lines.by_ref().find(|(_, line)| !line.trim().is_empty())
        else {
            bail!("Table '{name}' has no header line");
        };
        let delimiter = options
            .delimiter
            .unwrap_or_else(|| detect_delimiter(header_line));
        let ignore = options
            .ignore_chars
            .clone()
            .unwrap_or_else(|| default_ignore_chars(delimiter).to_string());
        let headers = split_line(header_line, delimiter, &ignore)
            .into_iter()
            .map(|f| f.value)
            .collect::<Vec<_>>();

        let mut table = Table {
            name: name.to_string(),
            delimiter,
            header_line: header_line.to_string(),
            quoted: vec![false; headers.len()],
            headers,
            second_headers: Vec::new(),
            rows: Vec::new(),
            line_numbers: Vec::new(),
            decimal_separator: '.',
            join: None,
        };

        let min_cells = options.min_populated_cells.max(1);
        let mut first_data_row = true;
        for (line_number, line) in lines {
            let fields = split_line(line, delimiter, &ignore);
            let populated = fields.iter().filter(|f| !f.value.is_empty()).count();
            if populated < min_cells {
                continue;
            }
            if first_data_row
                && table.rows.is_empty()
                && table.second_headers.is_empty()
                && is_second_header(&fields, &options.mapped_columns)
            {
                debug!("Treating line {line_number} of '{name}' as a second header");
                table.second_headers = fields.into_iter().map(|f| f.value).collect();
                continue;
            }
            if first_data_row {
                for (idx, field) in fields.iter().enumerate() {
                    if let Some(flag) = table.quoted.get_mut(idx) {
                        *flag = field.quoted;
                    }
                }
                first_data_row = false;
            }
            let mut row = fields.into_iter().map(|f| f.value).collect::<Vec<_>>();
            if row.len() < table.headers.len() {
                row.resize(table.headers.len(), String::new());
            }
            table.rows.push(row);
            table.line_numbers.push(line_number);
        }
        debug!(
            "Loaded table '{}' with {} column(s) and {} row(s), delimiter '{}'",
            table.name,
            table.headers.len(),
            table.rows.len(),
            io_utils::printable_delimiter(delimiter)
        );
        Ok(table)
    }

    /// An empty table carrying only a header, used as the extraction target
    /// when no template is supplied.
    pub fn with_headers(name: &str, headers: Vec<String>, delimiter: char) -> Self {
        let header_line = headers.iter().join(&delimiter.to_string());
        Table {
            name: name.to_string(),
            delimiter,
            header_line,
            quoted: vec![false; headers.len()],
            headers,
            second_headers: Vec::new(),
            rows: Vec::new(),
            line_numbers: Vec::new(),
            decimal_separator: '.',
            join: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn header_line(&self) -> &str {
        &self.header_line
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, row: usize) -> Option<&[String]> {
        self.rows.get(row).map(|r| r.as_slice())
    }

    /// Cell text, empty when the row or column does not exist.
    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Physical 1-based line number of a data row.
    pub fn line_number(&self, row: usize) -> usize {
        self.line_numbers.get(row).copied().unwrap_or(row + 2)
    }

    pub fn is_quoted(&self, column: usize) -> bool {
        self.quoted.get(column).copied().unwrap_or(false)
    }

    pub fn decimal_separator(&self) -> char {
        self.decimal_separator
    }

    pub fn set_decimal_separator(&mut self, separator: char) {
        self.decimal_separator = separator;
    }

    /// Case-insensitive column lookup. A trailing `*` in `name` matches any
    /// header starting with the text before it. Second-header names are
    /// consulted when the first header has no match.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        find_column(&self.headers, name).or_else(|| find_column(&self.second_headers, name))
    }

    /// Detects the decimal separator from the values of `columns` and stores it.
    pub fn detect_decimal_separator(&mut self, columns: &[usize]) -> char {
        let separator = infer_decimal_separator(
            self.rows
                .iter()
                .flat_map(|row| columns.iter().filter_map(move |&c| row.get(c)))
                .map(|s| s.as_str()),
        );
        self.decimal_separator = separator;
        separator
    }

    /// Returns the rows whose join column equals `key`, once per distinct
    /// consecutive key. `None` when the key was already consumed, the table is
    /// not linked, or nothing matches.
    pub fn next_window(&mut self, key: &str) -> Option<Range<usize>> {
        let join = self.join.as_ref()?;
        if join.last_key.as_deref() == Some(key) {
            return None;
        }
        let column = join.linked_column?;
        let cursor = join.cursor;
        let matches = |row: &usize| self.cell(*row, column) == key;
        let start = (cursor..self.rows.len())
            .find(matches)
            .or_else(|| (0..cursor.min(self.rows.len())).find(matches));
        let window = start.map(|start| {
            let end = (start..self.rows.len())
                .find(|row| self.cell(*row, column) != key)
                .unwrap_or(self.rows.len());
            start..end
        });
        if let Some(join) = self.join.as_mut() {
            join.last_key = Some(key.to_string());
            if let Some(window) = &window {
                join.cursor = window.end;
            }
        }
        window
    }

    /// Renders the header line followed by `rows`, quoting a cell when its
    /// column was quoted in the source or the value needs it.
    pub fn render(&self, rows: &[Vec<String>]) -> String {
        let separator = self.delimiter.to_string();
        let mut out = String::with_capacity(self.header_line.len() + 1);
        out.push_str(&self.header_line);
        out.push('\n');
        for row in rows {
            let line = row
                .iter()
                .enumerate()
                .map(|(idx, value)| self.quote_cell(idx, value))
                .join(&separator);
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn quote_cell(&self, column: usize, value: &str) -> String {
        let needs_quotes = self.is_quoted(column)
            || value.contains(self.delimiter)
            || value.contains(['"', '\n', '\r']);
        if needs_quotes {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }
}

fn find_column(headers: &[String], name: &str) -> Option<usize> {
    if let Some(prefix) = name.strip_suffix('*') {
        let prefix = prefix.to_lowercase();
        headers
            .iter()
            .position(|h| h.to_lowercase().starts_with(&prefix))
    } else {
        headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }
}

fn is_second_header(fields: &[SplitField], mapped_columns: &[String]) -> bool {
    if mapped_columns.is_empty() {
        return false;
    }
    let values = fields.iter().map(|f| f.value.clone()).collect::<Vec<_>>();
    let found = mapped_columns
        .iter()
        .filter(|name| find_column(&values, name).is_some())
        .count();
    found > 0 && found * 2 >= mapped_columns.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(fields: Vec<SplitField>) -> Vec<String> {
        fields.into_iter().map(|f| f.value).collect()
    }

    #[test]
    fn detect_delimiter_prefers_most_frequent_candidate() {
        assert_eq!(detect_delimiter("a;b;c,d"), ';');
        assert_eq!(detect_delimiter("a\tb\tc"), '\t');
        assert_eq!(detect_delimiter("a,b;c"), ',');
        assert_eq!(detect_delimiter("single"), ',');
    }

    #[test]
    fn split_line_honours_quotes_and_trims_ignore_chars() {
        let fields = split_line(r#" a ; "b;c" ; "say ""hi""" ;d"#, ';', " \t");
        assert_eq!(values(fields.clone()), vec!["a", "b;c", "say \"hi\"", "d"]);
        assert!(!fields[0].quoted);
        assert!(fields[1].quoted);
    }

    #[test]
    fn split_line_keeps_trailing_empty_field() {
        assert_eq!(values(split_line("a;b;", ';', " ")), vec!["a", "b", ""]);
    }

    #[test]
    fn second_header_is_skipped_when_half_of_mapped_columns_reappear() {
        let options = TableOptions {
            mapped_columns: vec!["ID".into(), "NAME".into()],
            ..TableOptions::default()
        };
        let table = Table::parse("t.csv", "ID;NAME\nid;name\n1;Alpha\n", &options).expect("parse");
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, 1), "Alpha");
        assert_eq!(table.line_number(0), 3);
    }

    #[test]
    fn column_lookup_supports_prefix_wildcard() {
        let table = Table::parse("t.csv", "FUND_ID;FUND_NAME\n1;A\n", &TableOptions::default())
            .expect("parse");
        assert_eq!(table.column_index("fund_name"), Some(1));
        assert_eq!(table.column_index("FUND_N*"), Some(1));
        assert_eq!(table.column_index("missing"), None);
    }

    #[test]
    fn next_window_consumes_each_key_once() {
        let mut table = Table::parse(
            "pos.csv",
            "FUND;POS\nA;1\nA;2\nB;3\n",
            &TableOptions::default(),
        )
        .expect("parse");
        table.join = Some(JoinState::new(Some(0), Some(0)));
        assert_eq!(table.next_window("A"), Some(0..2));
        assert_eq!(table.next_window("A"), None);
        assert_eq!(table.next_window("B"), Some(2..3));
        assert_eq!(table.next_window("C"), None);
    }
}
