//! Named counters persisted in `<dir>/<name>.cnt`.
//!
//! A counter file holds one line, `PERIOD,CURRENT_PERIOD,TYPE,LENGTH,START_VALUE[,CURRENT_VALUE]`
//! (`;` also accepted). The value restarts at START_VALUE whenever the period
//! rolls over.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use log::debug;

const MAX_LENGTH: usize = 50;
const PERIOD_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Ever,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl Period {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EVER" => Some(Period::Ever),
            "YEAR" => Some(Period::Year),
            "MONTH" => Some(Period::Month),
            "DAY" => Some(Period::Day),
            "HOUR" => Some(Period::Hour),
            "MINUTE" => Some(Period::Minute),
            "SECOND" => Some(Period::Second),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Period::Ever => "EVER",
            Period::Year => "YEAR",
            Period::Month => "MONTH",
            Period::Day => "DAY",
            Period::Hour => "HOUR",
            Period::Minute => "MINUTE",
            Period::Second => "SECOND",
        }
    }

    /// Length of the `%Y%m%d%H%M%S` prefix identifying one period.
    pub fn prefix_len(&self) -> usize {
        match self {
            Period::Ever => 0,
            Period::Year => 4,
            Period::Month => 6,
            Period::Day => 8,
            Period::Hour => 10,
            Period::Minute => 12,
            Period::Second => 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Num,
    Hex,
    Alpha,
    AlphaNum,
    NumAlpha,
}

impl CounterKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NUM" => Some(CounterKind::Num),
            "HEX" => Some(CounterKind::Hex),
            "ALPHA" => Some(CounterKind::Alpha),
            "ALPHANUM" => Some(CounterKind::AlphaNum),
            "NUMALPHA" => Some(CounterKind::NumAlpha),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CounterKind::Num => "NUM",
            CounterKind::Hex => "HEX",
            CounterKind::Alpha => "ALPHA",
            CounterKind::AlphaNum => "ALPHANUM",
            CounterKind::NumAlpha => "NUMALPHA",
        }
    }

    pub fn alphabet(&self) -> &'static str {
        match self {
            CounterKind::Num => "0123456789",
            CounterKind::Hex => "0123456789ABCDEF",
            CounterKind::Alpha => "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
            CounterKind::AlphaNum => "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
            CounterKind::NumAlpha => "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub name: String,
    pub period: Period,
    pub current_period: String,
    pub kind: CounterKind,
    pub length: usize,
    pub start_value: String,
    pub current_value: String,
}

impl Counter {
    pub fn parse(name: &str, line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut values = line.split(',').map(str::trim).collect::<Vec<_>>();
        if values.len() < 5 {
            values = line.split(';').map(str::trim).collect();
        }
        if values.len() < 5 {
            bail!("Missing value(s) in counter definition '{name}' (must contain at least five values)");
        }
        let period = Period::parse(values[0]).ok_or_else(|| {
            anyhow!(
                "Invalid period in counter definition '{name}' ('{}' not in 'EVER,YEAR,MONTH,DAY,HOUR,MINUTE,SECOND')",
                values[0]
            )
        })?;
        let current_period = values[1];
        if !current_period.chars().all(|c| c.is_ascii_digit()) || current_period.len() > 14 {
            bail!("Invalid current period '{current_period}' in counter definition '{name}'");
        }
        let kind = CounterKind::parse(values[2]).ok_or_else(|| {
            anyhow!(
                "Invalid type in counter definition '{name}' ('{}' not in 'NUM,HEX,ALPHA,ALPHANUM,NUMALPHA')",
                values[2]
            )
        })?;
        let length = values[3]
            .parse::<usize>()
            .ok()
            .filter(|len| (1..=MAX_LENGTH).contains(len))
            .ok_or_else(|| anyhow!("Invalid length '{}' in counter definition '{name}'", values[3]))?;
        let start_value = pad(values[4], kind, length)
            .ok_or_else(|| anyhow!("Invalid start value '{}' in counter definition '{name}'", values[4]))?;
        let current_value = match values.get(5).filter(|v| !v.is_empty()) {
            Some(raw) => pad(raw, kind, length)
                .ok_or_else(|| anyhow!("Invalid current value '{raw}' in counter definition '{name}'"))?,
            None => start_value.clone(),
        };
        Ok(Counter {
            name: name.to_string(),
            period,
            current_period: current_period.to_string(),
            kind,
            length,
            start_value,
            current_value,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}\n",
            self.period.name(),
            self.current_period,
            self.kind.name(),
            self.length,
            self.start_value,
            self.current_value
        )
    }

    /// Returns the current value for the period `now` (a `%Y%m%d%H%M%S`
    /// timestamp) and advances the counter.
    pub fn next_value(&mut self, now: &str) -> String {
        let period = &now[..self.period.prefix_len().min(now.len())];
        if self.period != Period::Ever && self.current_period != period {
            debug!("Counter '{}' enters period {period}", self.name);
            self.current_period = period.to_string();
            self.current_value = self.start_value.clone();
        }
        let value = self.current_value.clone();
        self.current_value = increment(&self.current_value, self.kind.alphabet());
        value
    }
}

fn pad(raw: &str, kind: CounterKind, length: usize) -> Option<String> {
    let alphabet = kind.alphabet();
    let raw = raw.to_ascii_uppercase();
    if raw.len() > length || !raw.chars().all(|c| alphabet.contains(c)) {
        return None;
    }
    let fill = alphabet.chars().next()?;
    let mut padded = std::iter::repeat_n(fill, length - raw.len()).collect::<String>();
    padded.push_str(&raw);
    Some(padded)
}

/// Odometer step within `alphabet`; wraps to all-first-character on overflow.
fn increment(value: &str, alphabet: &str) -> String {
    let symbols = alphabet.chars().collect::<Vec<_>>();
    let mut chars = value.chars().collect::<Vec<_>>();
    for position in (0..chars.len()).rev() {
        let index = symbols.iter().position(|c| *c == chars[position]).unwrap_or(symbols.len());
        if index + 1 < symbols.len() {
            chars[position] = symbols[index + 1];
            return chars.into_iter().collect();
        }
        chars[position] = symbols[0];
    }
    chars.into_iter().collect()
}

/// Counters used by one run, loaded lazily and saved back together.
#[derive(Debug, Clone, Default)]
pub struct CounterStore {
    dir: PathBuf,
    counters: HashMap<String, Counter>,
}

impl CounterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CounterStore {
            dir: dir.into(),
            counters: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.cnt"))
    }

    pub fn next_value(&mut self, name: &str) -> Result<String> {
        let now = Local::now().format(PERIOD_FORMAT).to_string();
        self.next_value_at(name, &now)
    }

    pub fn next_value_at(&mut self, name: &str, now: &str) -> Result<String> {
        let key = name.to_ascii_lowercase();
        if !self.counters.contains_key(&key) {
            let path = self.file_for(name);
            let line = fs::read_to_string(&path)
                .with_context(|| format!("Reading counter definition {path:?}"))?;
            let counter = Counter::parse(&path.display().to_string(), &line)?;
            self.counters.insert(key.clone(), Counter { name: name.to_string(), ..counter });
        }
        let counter = self
            .counters
            .get_mut(&key)
            .ok_or_else(|| anyhow!("Counter '{name}' not loaded"))?;
        Ok(counter.next_value(now))
    }

    /// Writes every counter used so far back to its file.
    pub fn save(&self) -> Result<()> {
        for counter in self.counters.values() {
            let path = self.file_for(&counter.name);
            fs::write(&path, counter.to_line())
                .with_context(|| format!("Writing counter definition {path:?}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_counter_resets_on_new_period() {
        let mut counter = Counter::parse("seq", "DAY,20240101,NUM,3,1").expect("counter");
        assert_eq!(counter.start_value, "001");
        assert_eq!(counter.next_value("20240101120000"), "001");
        assert_eq!(counter.next_value("20240101130000"), "002");
        assert_eq!(counter.next_value("20240102000000"), "001");
        assert_eq!(counter.to_line(), "DAY,20240102,NUM,3,001,002\n");
    }

    #[test]
    fn increments_carry_and_wrap() {
        assert_eq!(increment("0F", "0123456789ABCDEF"), "10");
        assert_eq!(increment("AZ", "ABCDEFGHIJKLMNOPQRSTUVWXYZ"), "BA");
        assert_eq!(increment("99", "0123456789"), "00");
    }

    #[test]
    fn semicolon_separated_definitions_are_accepted() {
        let counter = Counter::parse("seq", "EVER;0;HEX;4;A;1F").expect("counter");
        assert_eq!(counter.current_value, "001F");
        assert_eq!(counter.kind, CounterKind::Hex);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        assert!(Counter::parse("seq", "DAY,1,NUM,3").is_err());
        assert!(Counter::parse("seq", "WEEK,1,NUM,3,1").is_err());
        assert!(Counter::parse("seq", "DAY,1,NUM,3,ABC").is_err());
        assert!(Counter::parse("seq", "DAY,1,NUM,99,1").is_err());
    }
}
