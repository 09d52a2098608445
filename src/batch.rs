//! Wildcard batch mode.
//!
//! An input path whose file name holds `*` or `?` selects every matching
//! file in its directory. Each file converts on its own; a failure is logged
//! and the batch moves on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{error, info, warn};

use crate::{
    io_utils::{has_wildcard, move_into, replace_extension, unique_path},
    job::{Converter, RunSummary},
    runlog::{LogEntry, LogType, RunLog},
};

/// Where one run reads, writes and files its results.
#[derive(Debug, Clone, Default)]
pub struct RunTargets {
    pub input: PathBuf,
    /// Output file, or output directory in batch mode.
    pub output: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    /// Directory receiving converted inputs.
    pub processed: Option<PathBuf>,
}

/// Input files selected by a wildcard pattern, sorted by name. Only the
/// file name is a pattern; the directory is taken literally.
pub fn expand_inputs(pattern: &Path) -> Result<Vec<PathBuf>> {
    let directory = match pattern.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_pattern = pattern
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let full_pattern = Path::new(&glob::Pattern::escape(&directory.to_string_lossy()))
        .join(file_pattern)
        .display()
        .to_string();
    let mut matches = Vec::new();
    let entries =
        glob::glob(&full_pattern).with_context(|| format!("Invalid input pattern {pattern:?}"))?;
    for entry in entries {
        let path = entry.with_context(|| format!("Listing {directory:?}"))?;
        if path.is_file() {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Converts one file or a wildcard batch, appending to `log` when given.
/// Returns the summaries of the files that converted.
pub fn run(converter: &mut Converter, targets: &RunTargets, log: Option<&RunLog>) -> Result<Vec<RunSummary>> {
    let mut start = entry(converter, LogType::Start);
    start.input = targets.input.display().to_string();
    append(log, &start);

    if !has_wildcard(&targets.input) {
        let output = targets
            .output
            .clone()
            .unwrap_or_else(|| replace_extension(&targets.input, converter.output_extension()));
        let summary = convert_one(
            converter,
            &targets.input,
            &output,
            targets.error_file.as_deref(),
            targets.processed.as_deref(),
            log,
        )?;
        return Ok(vec![summary]);
    }

    let inputs = expand_inputs(&targets.input)?;
    if inputs.is_empty() {
        warn!("No files match {:?}", targets.input);
        return Ok(Vec::new());
    }
    if targets.error_file.is_some() {
        warn!("--errors is ignored in batch mode; error files are placed next to each output");
    }
    info!("Batch of {} file(s) matching {:?}", inputs.len(), targets.input);
    let mut summaries = Vec::with_capacity(inputs.len());
    let mut failures = 0usize;
    for input in &inputs {
        let output = batch_output(converter, input, targets.output.as_deref());
        match convert_one(converter, input, &output, None, targets.processed.as_deref(), log) {
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                failures += 1;
                error!("{input:?}: {err:#}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} file(s) failed to convert", inputs.len());
    }
    Ok(summaries)
}

fn batch_output(converter: &Converter, input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let renamed = replace_extension(input, converter.output_extension());
    let target = match (output_dir, renamed.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => renamed,
    };
    unique_path(&target)
}

fn convert_one(
    converter: &mut Converter,
    input: &Path,
    output: &Path,
    error_file: Option<&Path>,
    processed: Option<&Path>,
    log: Option<&RunLog>,
) -> Result<RunSummary> {
    let mut record = entry(converter, LogType::File);
    record.input = input.display().to_string();
    record.output = output.display().to_string();
    let result = converter.convert(input, output, error_file).and_then(|summary| {
        let moved = match processed {
            Some(dir) => Some(move_into(input, dir)?),
            None => None,
        };
        Ok((summary, moved))
    });
    match result {
        Ok((summary, moved)) => {
            record.records = summary.records;
            record.content_errors = summary.errors;
            record.unique_document_id = summary.unique_document_id.clone().unwrap_or_default();
            record.error_file = summary
                .error_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            record.processed = moved.map(|p| p.display().to_string()).unwrap_or_default();
            append(log, &record);
            Ok(summary)
        }
        Err(err) => {
            record.log_type = LogType::Error;
            record.error = format!("{err:#}");
            append(log, &record);
            Err(err)
        }
    }
}

fn entry(converter: &Converter, log_type: LogType) -> LogEntry {
    let mut entry = LogEntry::new(log_type, converter.direction());
    entry.mapping = converter.mappings().name.clone();
    entry.template = converter
        .template()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    entry
}

/// A log that cannot be written must not stop the conversion.
fn append(log: Option<&RunLog>, entry: &LogEntry) {
    let Some(log) = log else {
        return;
    };
    if let Err(err) = log.append(entry) {
        warn!("Could not write log file {:?}: {err:#}", log.path());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{config::ConverterConfig, context::Direction};
    use tempfile::tempdir;

    const MAPPING: &str = "CSV_OP;CSV_CONTENT;XML_OP;XML_CONTENT\n\
        CHANGE;ID;LOOP;Items/Item\n\
        MAP;ID;MAP;Items/Item/Id\n";

    #[test]
    fn expand_inputs_filters_by_pattern() {
        let dir = tempdir().expect("tempdir");
        for name in ["a.csv", "b.csv", "c.txt"] {
            fs::write(dir.path().join(name), "x").expect("write");
        }
        fs::create_dir(dir.path().join("d.csv")).expect("dir");
        let found = expand_inputs(&dir.path().join("*.csv")).expect("expand");
        assert_eq!(found, vec![dir.path().join("a.csv"), dir.path().join("b.csv")]);
        let single = expand_inputs(&dir.path().join("?.txt")).expect("expand");
        assert_eq!(single, vec![dir.path().join("c.txt")]);
    }

    #[test]
    fn batch_continues_after_a_failing_file() {
        let dir = tempdir().expect("tempdir");
        let mapping = dir.path().join("map.csv");
        fs::write(&mapping, MAPPING).expect("mapping");
        let inbox = dir.path().join("in");
        fs::create_dir_all(&inbox).expect("inbox");
        fs::write(inbox.join("one.csv"), "ID\n1\n2\n").expect("one");
        fs::write(inbox.join("two.csv"), "").expect("two");
        fs::write(inbox.join("three.csv"), "ID\n3\n").expect("three");
        let out = dir.path().join("out");
        let processed = dir.path().join("done");
        let log = RunLog::new(dir.path().join("run.log"));

        let mut converter = Converter::new(Direction::CsvToXml, ConverterConfig::default(), &mapping, None, None)
            .expect("converter");
        let targets = RunTargets {
            input: inbox.join("*.csv"),
            output: Some(out.clone()),
            error_file: None,
            processed: Some(processed.clone()),
        };
        let err = run(&mut converter, &targets, Some(&log)).unwrap_err();
        assert!(err.to_string().contains("1 of 3"));
        assert!(out.join("one.xml").exists());
        assert!(out.join("three.xml").exists());
        assert!(processed.join("one.csv").exists());
        assert!(inbox.join("two.csv").exists());

        let text = fs::read_to_string(log.path()).expect("log");
        let types = text
            .lines()
            .skip(1)
            .map(|line| line.split(';').nth(1).unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(types, vec!["START", "FILE", "FILE", "ERROR"]);
    }
}
