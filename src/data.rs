//! Typed value conversion between the table and tree representations.
//!
//! Every conversion runs in one direction between two [`Endpoint`]s. The
//! source endpoint's [`ValueSpec`] drives validation: defaults, mandatory
//! check, length, format, range. The destination decides the output shape:
//! boolean words, date layout, decimal separator, enumeration slot.
//!
//! Conversions never fail outright. A [`Conversion`] carries the produced
//! value and, when validation tripped, the [`ConversionError`] to report.
//! Invalid values come out empty except for out-of-range date components,
//! which are clamped and still written.

use std::{cmp::Ordering, fmt};

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

use crate::transform::Transform;

/// Digits allowed on each side of the decimal point.
pub const MAX_DIGITS: usize = 64;

pub const DEFAULT_TABLE_DATE: &str = "DD.MM.YYYY";
pub const DEFAULT_TABLE_DATETIME: &str = "DD.MM.YYYY hh:mm:ss";
pub const DEFAULT_TREE_DATE: &str = "YYYY-MM-DD";
pub const DEFAULT_TREE_DATETIME: &str = "YYYY-MM-DDThh:mm:ss";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    Boolean,
    Date,
    DateTime,
    Integer,
    Number,
    #[default]
    Text,
}

impl FieldType {
    /// Parses a type name. Names are matched on their first letter, with
    /// `DATETIME`/`DT` distinguished from `DATE`; an empty name is Text.
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Some(FieldType::Text);
        }
        if upper == "DT" || upper.starts_with("DATET") || upper == "TIMESTAMP" {
            return Some(FieldType::DateTime);
        }
        match upper.chars().next() {
            Some('B') => Some(FieldType::Boolean),
            Some('D') => Some(FieldType::Date),
            Some('I') => Some(FieldType::Integer),
            Some('N') => Some(FieldType::Number),
            Some('T') | Some('S') => Some(FieldType::Text),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::DateTime => "DateTime",
            FieldType::Integer => "Integer",
            FieldType::Number => "Number",
            FieldType::Text => "Text",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Number)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("Mandatory field empty")]
    MandatoryEmpty,
    #[error("Mandatory field/node missing")]
    MandatoryMissing,
    #[error("Content too short (minimum length {0})")]
    TooShort(usize),
    #[error("Content too long (maximum length {0})")]
    TooLong(usize),
    #[error("Value not found in list ({0})")]
    NotInList(String),
    #[error("Invalid characters found (does not match {0})")]
    PatternMismatch(String),
    #[error("Invalid date (does not match '{0}')")]
    InvalidDate(String),
    #[error("Date component out of range ({0})")]
    DateOutOfRange(String),
    #[error("Invalid calendar date")]
    InvalidCalendarDate,
    #[error("Invalid number (invalid characters found, decimal point is '{0}')")]
    InvalidNumber(char),
    #[error("Number too long (more than {} digits)", MAX_DIGITS)]
    NumberTooLong,
    #[error("Value below minimum ({0})")]
    BelowMinimum(String),
    #[error("Value above maximum ({0})")]
    AboveMaximum(String),
    #[error("Second string missing in destination format")]
    MissingSecondBoolean,
}

/// Outcome of one value conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub value: String,
    pub error: Option<ConversionError>,
}

impl Conversion {
    pub fn ok(value: impl Into<String>) -> Self {
        Conversion {
            value: value.into(),
            error: None,
        }
    }

    pub fn failed(error: ConversionError) -> Self {
        Conversion {
            value: String::new(),
            error: Some(error),
        }
    }

    pub fn flagged(value: impl Into<String>, error: Option<ConversionError>) -> Self {
        Conversion {
            value: value.into(),
            error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Digit,
    Lower,
    Upper,
    DigitUpper,
    Alpha,
    Alnum,
}

impl CharClass {
    fn from_format(format: &str) -> Option<Self> {
        match format {
            "[0-9]" => Some(CharClass::Digit),
            "[a-z]" => Some(CharClass::Lower),
            "[A-Z]" => Some(CharClass::Upper),
            "[0-9A-Z]" | "[A-Z0-9]" => Some(CharClass::DigitUpper),
            "[a-zA-Z]" | "[A-Za-z]" => Some(CharClass::Alpha),
            "[0-9a-zA-Z]" | "[a-zA-Z0-9]" | "[A-Za-z0-9]" => Some(CharClass::Alnum),
            _ => None,
        }
    }

    fn allows(&self, c: char) -> bool {
        match self {
            CharClass::Digit => c.is_ascii_digit(),
            CharClass::Lower => c.is_ascii_lowercase(),
            CharClass::Upper => c.is_ascii_uppercase(),
            CharClass::DigitUpper => c.is_ascii_digit() || c.is_ascii_uppercase(),
            CharClass::Alpha => c.is_ascii_alphabetic(),
            CharClass::Alnum => c.is_ascii_alphanumeric(),
        }
    }
}

/// Validation pattern derived from a text or boolean format string.
#[derive(Debug, Clone, Default)]
pub enum FormatPattern {
    #[default]
    None,
    /// `,A,B,C,` (or `(A,B,C)`) list of allowed values.
    Enumeration(Vec<String>),
    /// Every character must fall in one class; any length.
    Class(CharClass),
    /// Bracketed per-position pattern, anchored at both ends.
    Positional(Regex),
}

impl FormatPattern {
    pub fn parse(format: &str) -> Result<Self, String> {
        let format = format.trim();
        if format.is_empty() {
            return Ok(FormatPattern::None);
        }
        if let Some(items) = enumeration_items(format) {
            return Ok(FormatPattern::Enumeration(items));
        }
        if format.starts_with('[') {
            if let Some(class) = CharClass::from_format(format) {
                return Ok(FormatPattern::Class(class));
            }
            return Regex::new(&format!("^(?:{format})$"))
                .map(FormatPattern::Positional)
                .map_err(|err| format!("Invalid format pattern '{format}': {err}"));
        }
        Ok(FormatPattern::None)
    }

    pub fn enumeration(&self) -> Option<&[String]> {
        match self {
            FormatPattern::Enumeration(items) => Some(items),
            _ => None,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            FormatPattern::None => true,
            FormatPattern::Enumeration(items) => items.iter().any(|item| item == value),
            FormatPattern::Class(class) => value.chars().all(|c| class.allows(c)),
            FormatPattern::Positional(regex) => regex.is_match(value),
        }
    }
}

/// Normalizes `(A,B,C)` to the internal `,A,B,C,` form; other formats are
/// returned trimmed.
pub fn normalize_enumeration(format: &str) -> String {
    let trimmed = format.trim();
    match trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(inner) => format!(",{inner},"),
        None => trimmed.to_string(),
    }
}

fn enumeration_items(format: &str) -> Option<Vec<String>> {
    let inner = format
        .strip_prefix(',')
        .and_then(|rest| rest.strip_suffix(','))
        .or_else(|| {
            format
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
        })?;
    Some(inner.split(',').map(|item| item.to_string()).collect())
}

/// Prefix/suffix template such as `'ISIN-'*` or `*'.00'`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affix {
    pub prefix: String,
    pub suffix: String,
}

impl Affix {
    pub fn parse(template: &str) -> Option<Self> {
        let mut rest = template.trim();
        let prefix = match take_quoted(rest) {
            Some((literal, remaining)) => {
                rest = remaining;
                literal
            }
            None => String::new(),
        };
        rest = rest.strip_prefix('*')?;
        let suffix = match take_quoted(rest) {
            Some((literal, remaining)) => {
                rest = remaining;
                literal
            }
            None => String::new(),
        };
        if !rest.trim().is_empty() || (prefix.is_empty() && suffix.is_empty()) {
            return None;
        }
        Some(Affix { prefix, suffix })
    }

    pub fn apply(&self, value: &str) -> String {
        format!("{}{}{}", self.prefix, value, self.suffix)
    }

    pub fn strip<'a>(&self, value: &'a str) -> &'a str {
        let value = value.strip_prefix(self.prefix.as_str()).unwrap_or(value);
        value.strip_suffix(self.suffix.as_str()).unwrap_or(value)
    }
}

fn take_quoted(text: &str) -> Option<(String, &str)> {
    let inner = text.strip_prefix('\'')?;
    let end = inner.find('\'')?;
    Some((inner[..end].to_string(), &inner[end + 1..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl Default for DateParts {
    fn default() -> Self {
        DateParts {
            year: 2000,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateToken {
    Year4,
    Year2,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Literal(char),
}

impl DateToken {
    fn width(&self) -> usize {
        match self {
            DateToken::Year4 => 4,
            DateToken::Literal(_) => 1,
            _ => 2,
        }
    }
}

/// Date layout built from `YYYY`, `YY`, `MM`, `DD`, `hh`, `mm` and `ss`
/// placeholders; every other character is a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    text: String,
    tokens: Vec<DateToken>,
}

impl DatePattern {
    pub fn parse(text: &str) -> Self {
        let chars = text.chars().collect::<Vec<_>>();
        let mut tokens = Vec::new();
        let mut idx = 0;
        while idx < chars.len() {
            let rest = &chars[idx..];
            let starts = |needle: &str| {
                needle.len() <= rest.len() && needle.chars().zip(rest).all(|(a, b)| a == *b)
            };
            let token = if starts("YYYY") || starts("yyyy") {
                DateToken::Year4
            } else if starts("YY") || starts("yy") {
                DateToken::Year2
            } else if starts("MM") {
                DateToken::Month
            } else if starts("DD") || starts("dd") {
                DateToken::Day
            } else if starts("hh") || starts("HH") {
                DateToken::Hour
            } else if starts("mm") {
                DateToken::Minute
            } else if starts("ss") || starts("SS") {
                DateToken::Second
            } else {
                DateToken::Literal(rest[0])
            };
            idx += token.width();
            tokens.push(token);
        }
        DatePattern {
            text: text.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.tokens.iter().map(DateToken::width).sum()
    }

    /// Parses `value` laid out exactly like this pattern.
    ///
    /// A length or literal mismatch fails. Out-of-range components are
    /// clamped and reported alongside the parts.
    pub fn parse_value(
        &self,
        value: &str,
    ) -> Result<(DateParts, Option<ConversionError>), ConversionError> {
        let chars = value.chars().collect::<Vec<_>>();
        if chars.len() != self.char_len() {
            return Err(ConversionError::InvalidDate(self.text.clone()));
        }
        let mut parts = DateParts::default();
        let mut clamped = false;
        let mut pos = 0;
        for token in &self.tokens {
            let width = token.width();
            let piece = &chars[pos..pos + width];
            pos += width;
            if let DateToken::Literal(expected) = token {
                if piece[0] != *expected {
                    return Err(ConversionError::InvalidDate(self.text.clone()));
                }
                continue;
            }
            if !piece.iter().all(|c| c.is_ascii_digit()) {
                return Err(ConversionError::InvalidDate(self.text.clone()));
            }
            let number = piece
                .iter()
                .fold(0u32, |acc, c| acc * 10 + c.to_digit(10).unwrap_or(0));
            match token {
                DateToken::Year4 => {
                    parts.year = clamp(number as i32, 1900, 2150, &mut clamped);
                }
                DateToken::Year2 => parts.year = 2000 + number as i32,
                DateToken::Month => parts.month = clamp(number, 1, 12, &mut clamped),
                DateToken::Day => parts.day = clamp(number, 1, 31, &mut clamped),
                DateToken::Hour => parts.hour = clamp(number, 0, 23, &mut clamped),
                DateToken::Minute => parts.minute = clamp(number, 0, 59, &mut clamped),
                DateToken::Second => parts.second = clamp(number, 0, 59, &mut clamped),
                DateToken::Literal(_) => {}
            }
        }
        if clamped {
            clamp_to_month_end(&mut parts);
            return Ok((
                parts,
                Some(ConversionError::DateOutOfRange(self.text.clone())),
            ));
        }
        if clamp_to_month_end(&mut parts) {
            return Ok((parts, Some(ConversionError::InvalidCalendarDate)));
        }
        Ok((parts, None))
    }

    pub fn format(&self, parts: &DateParts) -> String {
        let mut out = String::with_capacity(self.text.len());
        for token in &self.tokens {
            match token {
                DateToken::Year4 => out.push_str(&format!("{:04}", parts.year)),
                DateToken::Year2 => out.push_str(&format!("{:02}", parts.year.rem_euclid(100))),
                DateToken::Month => out.push_str(&format!("{:02}", parts.month)),
                DateToken::Day => out.push_str(&format!("{:02}", parts.day)),
                DateToken::Hour => out.push_str(&format!("{:02}", parts.hour)),
                DateToken::Minute => out.push_str(&format!("{:02}", parts.minute)),
                DateToken::Second => out.push_str(&format!("{:02}", parts.second)),
                DateToken::Literal(c) => out.push(*c),
            }
        }
        out
    }
}

fn clamp<T: PartialOrd + Copy>(value: T, min: T, max: T, clamped: &mut bool) -> T {
    if value < min {
        *clamped = true;
        min
    } else if value > max {
        *clamped = true;
        max
    } else {
        value
    }
}

/// Pulls an impossible day (31 April, 29 February in a common year) back to
/// the last day of its month. Returns true when the day moved.
fn clamp_to_month_end(parts: &mut DateParts) -> bool {
    let original = parts.day;
    while parts.day > 28 && NaiveDate::from_ymd_opt(parts.year, parts.month, parts.day).is_none() {
        parts.day -= 1;
    }
    parts.day != original
}

pub fn convert_date(value: &str, from: &DatePattern, to: &DatePattern) -> Conversion {
    match from.parse_value(value) {
        Ok((parts, issue)) => Conversion::flagged(to.format(&parts), issue),
        Err(err) => Conversion::failed(err),
    }
}

/// Decimal number kept as digit strings so arbitrarily long values survive
/// without rounding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericText {
    pub negative: bool,
    pub integer: String,
    pub fraction: String,
}

impl NumericText {
    /// Parses `value` written with `decimal` as decimal separator. With
    /// `strip_grouping`, spaces and the other of `,`/`.` are dropped as
    /// thousands separators first.
    pub fn parse(value: &str, decimal: char, strip_grouping: bool) -> Result<Self, ConversionError> {
        let mut body = value.trim();
        let mut negative = false;
        if let Some(rest) = body.strip_prefix('+') {
            body = rest.trim_start();
        } else if let Some(rest) = body.strip_prefix('-') {
            negative = true;
            body = rest.trim_start();
        }
        let cleaned: String = if strip_grouping {
            let grouping = if decimal == ',' { '.' } else { ',' };
            body.chars()
                .filter(|c| *c != grouping && *c != ' ' && *c != '\u{a0}' && *c != '\'')
                .collect()
        } else {
            body.to_string()
        };
        let mut pieces = cleaned.split(decimal);
        let integer = pieces.next().unwrap_or_default();
        let fraction = pieces.next().unwrap_or_default();
        if pieces.next().is_some()
            || (integer.is_empty() && fraction.is_empty())
            || !integer.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ConversionError::InvalidNumber(decimal));
        }
        if integer.len() > MAX_DIGITS || fraction.len() > MAX_DIGITS {
            return Err(ConversionError::NumberTooLong);
        }
        Ok(NumericText {
            negative,
            integer: integer.to_string(),
            fraction: fraction.to_string(),
        })
    }

    pub fn render(&self, decimal: char) -> String {
        let mut out = String::with_capacity(self.integer.len() + self.fraction.len() + 2);
        if self.negative && !self.is_zero() {
            out.push('-');
        }
        if self.integer.is_empty() {
            out.push('0');
        } else {
            out.push_str(&self.integer);
        }
        if !self.fraction.is_empty() {
            out.push(decimal);
            out.push_str(&self.fraction);
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.integer.chars().all(|c| c == '0') && self.fraction.chars().all(|c| c == '0')
    }

    /// Numeric ordering, independent of leading/trailing zeros.
    pub fn compare(&self, other: &Self) -> Ordering {
        let negative_a = self.negative && !self.is_zero();
        let negative_b = other.negative && !other.is_zero();
        match (negative_a, negative_b) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.compare_magnitude(other),
            (true, true) => self.compare_magnitude(other).reverse(),
        }
    }

    fn compare_magnitude(&self, other: &Self) -> Ordering {
        let int_a = self.integer.trim_start_matches('0');
        let int_b = other.integer.trim_start_matches('0');
        let frac_a = self.fraction.trim_end_matches('0');
        let frac_b = other.fraction.trim_end_matches('0');
        int_a
            .len()
            .cmp(&int_b.len())
            .then_with(|| int_a.cmp(int_b))
            .then_with(|| frac_a.cmp(frac_b))
    }
}

pub fn convert_integer(value: &str, decimal: char, strip_grouping: bool) -> Conversion {
    match NumericText::parse(value, decimal, strip_grouping) {
        Ok(number) if number.fraction.is_empty() => Conversion::ok(number.render(decimal)),
        Ok(_) => Conversion::failed(ConversionError::InvalidNumber(decimal)),
        Err(err) => Conversion::failed(err),
    }
}

pub fn convert_number(value: &str, from: char, to: char, strip_grouping: bool) -> Conversion {
    match NumericText::parse(value, from, strip_grouping) {
        Ok(number) => Conversion::ok(number.render(to)),
        Err(err) => Conversion::failed(err),
    }
}

const DEFAULT_BOOLEAN_WORDS: [&str; 2] = ["true", "false"];

/// Maps a boolean word from the source pair to the destination pair. The
/// value may be any case-insensitive prefix of a source word.
pub fn convert_boolean(value: &str, from: Option<&[String]>, to: Option<&[String]>) -> Conversion {
    let default_words = DEFAULT_BOOLEAN_WORDS.map(String::from);
    let from = from.unwrap_or(&default_words);
    let to = to.unwrap_or(&default_words);
    let needle = value.trim().to_lowercase();
    let position = from
        .iter()
        .take(2)
        .position(|word| !needle.is_empty() && word.to_lowercase().starts_with(&needle));
    let Some(position) = position else {
        return Conversion::failed(ConversionError::NotInList(from.join(",")));
    };
    match to.get(position) {
        Some(word) => Conversion::ok(word.clone()),
        None => Conversion::failed(ConversionError::MissingSecondBoolean),
    }
}

/// Validates `value` against `from` and, when both sides list enumerations,
/// replaces it with the destination entry at the same position.
pub fn convert_text(value: &str, from: &ValueSpec, to: &ValueSpec) -> Conversion {
    match &from.pattern {
        FormatPattern::Enumeration(items) => {
            let Some(position) = items.iter().position(|item| item == value) else {
                return Conversion::failed(ConversionError::NotInList(items.join(",")));
            };
            match to.pattern.enumeration() {
                Some(target) => match target.get(position) {
                    Some(mapped) => Conversion::ok(mapped.clone()),
                    None => Conversion::failed(ConversionError::NotInList(target.join(","))),
                },
                None => Conversion::ok(value),
            }
        }
        FormatPattern::None => Conversion::ok(value),
        pattern => {
            if pattern.matches(value) {
                Conversion::ok(value)
            } else {
                Conversion::failed(ConversionError::PatternMismatch(from.format.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValue {
    Number(NumericText),
    Date(DateParts),
}

/// A typed MIN_VALUE/MAX_VALUE, parsed once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub raw: String,
    pub value: BoundValue,
}

impl Bound {
    /// Numeric bounds accept either `.` or `,` as decimal separator. Date
    /// bounds are read with the field's own pattern or in ISO layout.
    pub fn parse(raw: &str, field_type: FieldType, pattern: &DatePattern) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let value = match field_type {
            FieldType::Integer | FieldType::Number => {
                let decimal = if raw.contains(',') && !raw.contains('.') { ',' } else { '.' };
                BoundValue::Number(NumericText::parse(raw, decimal, false).ok()?)
            }
            FieldType::Date | FieldType::DateTime => {
                let candidates = [
                    pattern.clone(),
                    DatePattern::parse(DEFAULT_TREE_DATE),
                    DatePattern::parse(DEFAULT_TREE_DATETIME),
                ];
                let parts = candidates
                    .iter()
                    .find_map(|p| match p.parse_value(raw) {
                        Ok((parts, None)) => Some(parts),
                        _ => None,
                    })?;
                BoundValue::Date(parts)
            }
            _ => return None,
        };
        Some(Bound {
            raw: raw.to_string(),
            value,
        })
    }

    fn compare(&self, value: &BoundValue) -> Option<Ordering> {
        match (&self.value, value) {
            (BoundValue::Number(bound), BoundValue::Number(v)) => Some(v.compare(bound)),
            (BoundValue::Date(bound), BoundValue::Date(v)) => Some(v.cmp(bound)),
            _ => None,
        }
    }
}

/// The value-related half of a field definition.
#[derive(Debug, Clone, Default)]
pub struct ValueSpec {
    pub mandatory: bool,
    pub field_type: FieldType,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    pub min_value: Option<Bound>,
    pub max_value: Option<Bound>,
    /// Format as written in the mapping, enumerations normalized.
    pub format: String,
    pub pattern: FormatPattern,
    pub transform: Option<Transform>,
    pub default: String,
    pub mapping_format: Option<Affix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Table,
    Tree,
}

/// One end of a conversion: the field's spec, which representation it lives
/// in, and that representation's decimal separator.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    pub spec: &'a ValueSpec,
    pub side: Side,
    pub decimal: char,
}

impl<'a> Endpoint<'a> {
    pub fn table(spec: &'a ValueSpec, decimal: char) -> Self {
        Endpoint {
            spec,
            side: Side::Table,
            decimal,
        }
    }

    pub fn tree(spec: &'a ValueSpec) -> Self {
        Endpoint {
            spec,
            side: Side::Tree,
            decimal: '.',
        }
    }

    pub fn date_pattern(&self) -> DatePattern {
        date_pattern_for(self.spec, self.side)
    }
}

/// The pattern a date field is read and written with, falling back to the
/// side's default layout.
pub fn date_pattern_for(spec: &ValueSpec, side: Side) -> DatePattern {
    if !spec.format.trim().is_empty() {
        return DatePattern::parse(spec.format.trim());
    }
    let default = match (side, spec.field_type) {
        (Side::Table, FieldType::DateTime) => DEFAULT_TABLE_DATETIME,
        (Side::Table, _) => DEFAULT_TABLE_DATE,
        (Side::Tree, FieldType::DateTime) => DEFAULT_TREE_DATETIME,
        (Side::Tree, _) => DEFAULT_TREE_DATE,
    };
    DatePattern::parse(default)
}

/// Converts `raw` from the `from` representation into the `to` one.
pub fn convert(raw: &str, from: Endpoint<'_>, to: Endpoint<'_>) -> Conversion {
    let spec = from.spec;
    let mut value = if raw.is_empty() && !spec.default.is_empty() {
        spec.default.clone()
    } else {
        raw.to_string()
    };
    if let Some(transform) = spec.transform {
        value = transform.apply(&value).into_owned();
    }
    if let Some(affix) = &spec.mapping_format {
        value = affix.strip(&value).to_string();
    }
    if value.is_empty() {
        return if spec.mandatory {
            Conversion::failed(ConversionError::MandatoryEmpty)
        } else {
            Conversion::ok(String::new())
        };
    }
    let length = value.chars().count();
    if let Some(min) = spec.min_len.filter(|min| length < *min) {
        return Conversion::failed(ConversionError::TooShort(min));
    }
    if let Some(max) = spec.max_len.filter(|max| length > *max) {
        return Conversion::failed(ConversionError::TooLong(max));
    }

    let mut conversion = match spec.field_type {
        FieldType::Boolean => convert_boolean(
            &value,
            spec.pattern.enumeration(),
            to.spec.pattern.enumeration(),
        ),
        FieldType::Date | FieldType::DateTime => {
            let source = from.date_pattern();
            match source.parse_value(&value) {
                Ok((parts, issue)) => match check_bounds(spec, &BoundValue::Date(parts)) {
                    Some(err) => Conversion::failed(err),
                    None => Conversion::flagged(to.date_pattern().format(&parts), issue),
                },
                Err(err) => Conversion::failed(err),
            }
        }
        FieldType::Integer | FieldType::Number => {
            let strip_grouping = from.side == Side::Table;
            match NumericText::parse(&value, from.decimal, strip_grouping) {
                Ok(number) if spec.field_type == FieldType::Integer && !number.fraction.is_empty() => {
                    Conversion::failed(ConversionError::InvalidNumber(from.decimal))
                }
                Ok(number) => {
                    let rendered = number.render(to.decimal);
                    match check_bounds(spec, &BoundValue::Number(number)) {
                        Some(err) => Conversion::failed(err),
                        None => Conversion::ok(rendered),
                    }
                }
                Err(err) => Conversion::failed(err),
            }
        }
        FieldType::Text => convert_text(&value, spec, to.spec),
    };

    if !conversion.value.is_empty() {
        if let Some(affix) = &to.spec.mapping_format {
            conversion.value = affix.apply(&conversion.value);
        }
        if let Some(transform) = to.spec.transform {
            conversion.value = transform.apply(&conversion.value).into_owned();
        }
    }
    conversion
}

fn check_bounds(spec: &ValueSpec, value: &BoundValue) -> Option<ConversionError> {
    if let Some(min) = &spec.min_value {
        if min.compare(value) == Some(Ordering::Less) {
            return Some(ConversionError::BelowMinimum(min.raw.clone()));
        }
    }
    if let Some(max) = &spec.max_value {
        if max.compare(value) == Some(Ordering::Greater) {
            return Some(ConversionError::AboveMaximum(max.raw.clone()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_spec(format: &str) -> ValueSpec {
        ValueSpec {
            format: normalize_enumeration(format),
            pattern: FormatPattern::parse(&normalize_enumeration(format)).expect("pattern"),
            ..ValueSpec::default()
        }
    }

    #[test]
    fn field_type_parse_uses_first_letter() {
        assert_eq!(FieldType::parse("Number"), Some(FieldType::Number));
        assert_eq!(FieldType::parse("datetime"), Some(FieldType::DateTime));
        assert_eq!(FieldType::parse("D"), Some(FieldType::Date));
        assert_eq!(FieldType::parse(""), Some(FieldType::Text));
        assert_eq!(FieldType::parse("xml"), None);
    }

    #[test]
    fn date_pattern_reformats_and_clamps() {
        let from = DatePattern::parse("DD.MM.YYYY");
        let to = DatePattern::parse("YYYY-MM-DD");
        assert_eq!(convert_date("31.12.2021", &from, &to), Conversion::ok("2021-12-31"));
        let clamped = convert_date("32.13.2021", &from, &to);
        assert_eq!(clamped.value, "2021-12-31");
        assert!(matches!(clamped.error, Some(ConversionError::DateOutOfRange(_))));
    }

    #[test]
    fn date_pattern_rejects_literal_and_length_mismatch() {
        let from = DatePattern::parse("DD.MM.YYYY");
        let to = DatePattern::parse("YYYY-MM-DD");
        assert!(convert_date("31/12/2021", &from, &to).value.is_empty());
        assert!(convert_date("1.1.2021", &from, &to).error.is_some());
    }

    #[test]
    fn impossible_calendar_day_moves_to_month_end() {
        let from = DatePattern::parse("YYYY-MM-DD");
        let result = convert_date("2023-02-30", &from, &from);
        assert_eq!(result.value, "2023-02-28");
        assert_eq!(result.error, Some(ConversionError::InvalidCalendarDate));
    }

    #[test]
    fn numeric_text_strips_grouping_and_rewrites_decimal() {
        assert_eq!(convert_number("1.234,56", ',', '.', true), Conversion::ok("1234.56"));
        assert_eq!(convert_number("+12.5", '.', ',', false), Conversion::ok("12,5"));
        assert_eq!(convert_number("-0,5", ',', '.', true), Conversion::ok("-0.5"));
        assert_eq!(
            convert_number("12a", '.', '.', false),
            Conversion::failed(ConversionError::InvalidNumber('.'))
        );
    }

    #[test]
    fn numeric_text_enforces_digit_ceiling_per_side() {
        let long = "9".repeat(MAX_DIGITS);
        assert!(convert_number(&format!("{long}.{long}"), '.', '.', false).is_ok());
        assert_eq!(
            convert_number(&format!("{long}9"), '.', '.', false).error,
            Some(ConversionError::NumberTooLong)
        );
    }

    #[test]
    fn numeric_compare_ignores_padding_zeros() {
        let a = NumericText::parse("007.50", '.', false).expect("a");
        let b = NumericText::parse("7.5", '.', false).expect("b");
        let c = NumericText::parse("-8", '.', false).expect("c");
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(c.compare(&a), Ordering::Less);
    }

    #[test]
    fn integer_rejects_fraction() {
        assert_eq!(convert_integer("1 000", '.', true), Conversion::ok("1000"));
        assert!(convert_integer("10.5", '.', false).error.is_some());
    }

    #[test]
    fn boolean_maps_word_by_position() {
        let from = vec!["Ja".to_string(), "Nein".to_string()];
        assert_eq!(convert_boolean("j", Some(&from), None), Conversion::ok("true"));
        assert_eq!(convert_boolean("NEIN", Some(&from), None), Conversion::ok("false"));
        assert!(convert_boolean("maybe", Some(&from), None).error.is_some());
        let short = vec!["yes".to_string()];
        assert_eq!(
            convert_boolean("nein", Some(&from), Some(&short)).error,
            Some(ConversionError::MissingSecondBoolean)
        );
    }

    #[test]
    fn text_enumeration_remaps_by_position() {
        let from = text_spec("(A,B,C)");
        let to = text_spec("(Alpha,Beta,Gamma)");
        assert_eq!(convert_text("B", &from, &to), Conversion::ok("Beta"));
        assert_eq!(
            convert_text("D", &from, &to).error,
            Some(ConversionError::NotInList("A,B,C".into()))
        );
    }

    #[test]
    fn text_patterns_cover_classes_and_positions() {
        let digits = text_spec("[0-9]");
        assert!(convert_text("0123", &digits, &ValueSpec::default()).is_ok());
        assert!(convert_text("01a", &digits, &ValueSpec::default()).error.is_some());
        let isin = text_spec("[A-Z]{2}[0-9A-Z]{9}[0-9]");
        assert!(convert_text("DE0001234567", &isin, &ValueSpec::default()).is_ok());
        assert!(convert_text("DE000123456", &isin, &ValueSpec::default()).error.is_some());
        let dotted = text_spec("[A-Z].[0-9]");
        assert!(convert_text("A-1", &dotted, &ValueSpec::default()).is_ok());
    }

    #[test]
    fn affix_parse_and_apply() {
        let affix = Affix::parse("'ISIN-'*").expect("prefix");
        assert_eq!(affix.apply("X"), "ISIN-X");
        assert_eq!(affix.strip("ISIN-X"), "X");
        let both = Affix::parse("'<'*'>'").expect("both");
        assert_eq!(both.apply("v"), "<v>");
        assert!(Affix::parse("ISIN-*").is_none());
        assert!(Affix::parse("*").is_none());
    }

    #[test]
    fn convert_applies_default_mandatory_and_bounds() {
        let spec = ValueSpec {
            mandatory: true,
            field_type: FieldType::Number,
            min_value: Bound::parse("0", FieldType::Number, &DatePattern::parse("")),
            ..ValueSpec::default()
        };
        let tree = ValueSpec {
            field_type: FieldType::Number,
            ..ValueSpec::default()
        };
        let empty = convert("", Endpoint::table(&spec, ','), Endpoint::tree(&tree));
        assert_eq!(empty, Conversion::failed(ConversionError::MandatoryEmpty));
        let negative = convert("-1,5", Endpoint::table(&spec, ','), Endpoint::tree(&tree));
        assert_eq!(negative.error, Some(ConversionError::BelowMinimum("0".into())));
        let fine = convert("1.000,5", Endpoint::table(&spec, ','), Endpoint::tree(&tree));
        assert_eq!(fine, Conversion::ok("1000.5"));

        let optional = ValueSpec {
            default: "n/a".into(),
            ..ValueSpec::default()
        };
        let defaulted = convert("", Endpoint::table(&optional, '.'), Endpoint::tree(&tree));
        assert_eq!(defaulted, Conversion::ok("n/a"));
    }
}
