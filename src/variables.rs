//! VAR expressions.
//!
//! An expression is a sequence of terms whose values are concatenated:
//! `'literal'`, `NOW`, `NOW(pattern)`, `COUNTER(name)` and `UUID`. For example
//! `'SAMPLE.' NOW(YYYY-MM-DD) '.' COUNTER(day-index)`.

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use log::debug;
use uuid::Uuid;

use crate::{
    counter::CounterStore,
    data::{DEFAULT_TREE_DATETIME, DateParts, DatePattern},
};

const COUNTER_PERIOD_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn evaluate(expression: &str, counters: &mut CounterStore) -> Result<String> {
    evaluate_at(expression, Local::now().naive_local(), counters)
}

/// Evaluates `expression` as of `now`.
pub fn evaluate_at(expression: &str, now: NaiveDateTime, counters: &mut CounterStore) -> Result<String> {
    let mut out = String::new();
    let mut rest = expression.trim_start();
    while !rest.is_empty() {
        if let Some(inner) = rest.strip_prefix('\'') {
            let end = inner.find('\'').unwrap_or(inner.len());
            out.push_str(&inner[..end]);
            rest = inner.get(end + 1..).unwrap_or("");
        } else if let Some(after) = strip_keyword(rest, "COUNTER(") {
            let (name, tail) = split_argument(after);
            let stamp = now.format(COUNTER_PERIOD_FORMAT).to_string();
            out.push_str(&counters.next_value_at(name.trim(), &stamp)?);
            rest = tail;
        } else if let Some(after) = strip_keyword(rest, "NOW") {
            let (pattern, tail) = match after.strip_prefix('(') {
                Some(argument) => split_argument(argument),
                None => (DEFAULT_TREE_DATETIME, after),
            };
            out.push_str(&DatePattern::parse(pattern.trim()).format(&date_parts(now)));
            rest = tail;
        } else if let Some(after) = strip_keyword(rest, "UUID") {
            out.push_str(&Uuid::new_v4().to_string());
            rest = after;
        } else {
            let skipped = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            debug!("Skipping unexpected character in VAR expression '{expression}'");
            rest = &rest[skipped..];
        }
        rest = rest.trim_start();
    }
    Ok(out)
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &text[keyword.len()..])
}

/// Splits `name) rest` at the closing bracket.
fn split_argument(text: &str) -> (&str, &str) {
    match text.find(')') {
        Some(end) => (&text[..end], &text[end + 1..]),
        None => (text, ""),
    }
}

fn date_parts(now: NaiveDateTime) -> DateParts {
    DateParts {
        year: now.year(),
        month: now.month(),
        day: now.day(),
        hour: now.hour(),
        minute: now.minute(),
        second: now.second(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn literals_and_timestamps_concatenate() {
        let mut counters = CounterStore::new(".");
        let value = evaluate_at("'DOC-' NOW(YYYYMMDD) '-' NOW", noon(), &mut counters).expect("value");
        assert_eq!(value, "DOC-20240305-2024-03-05T12:30:00");
    }

    #[test]
    fn counters_are_read_and_advanced() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("daily.cnt"), "DAY,20240305,NUM,4,1,7\n").expect("write counter");
        let mut counters = CounterStore::new(dir.path());
        let first = evaluate_at("'ID' COUNTER(daily)", noon(), &mut counters).expect("first");
        let second = evaluate_at("COUNTER(daily)", noon(), &mut counters).expect("second");
        assert_eq!(first, "ID0007");
        assert_eq!(second, "0008");
        counters.save().expect("save");
        let saved = std::fs::read_to_string(dir.path().join("daily.cnt")).expect("read");
        assert_eq!(saved, "DAY,20240305,NUM,4,0001,0009\n");
    }

    #[test]
    fn missing_counter_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut counters = CounterStore::new(dir.path());
        assert!(evaluate_at("COUNTER(nope)", noon(), &mut counters).is_err());
    }

    #[test]
    fn uuid_has_canonical_shape() {
        let mut counters = CounterStore::new(".");
        let value = evaluate_at("UUID", noon(), &mut counters).expect("uuid");
        assert_eq!(value.len(), 36);
        assert_eq!(value.matches('-').count(), 4);
    }
}
