//! File helpers shared by the conversion pipeline.
//!
//! - **Encoding**: input decoding through `encoding_rs_io` (a byte-order mark
//!   wins over the configured label) and output encoding via `encoding_rs`,
//!   defaulting to UTF-8.
//! - **Naming**: extension replacement, `-NNNNNN` uniquifying and the
//!   batch-pattern check.

use std::{
    borrow::Cow,
    fs::{self, File},
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8};
use encoding_rs_io::DecodeReaderBytesBuilder;
use log::{debug, warn};

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

/// Reads a whole text file, decoding it from `encoding`.
pub fn read_text(path: &Path, encoding: &'static Encoding) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
    let mut decoder = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding))
        .bom_override(true)
        .build(BufReader::new(file));
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .with_context(|| format!("Decoding {path:?} as {}", encoding.name()))?;
    debug!("Read {} byte(s) from {:?}", text.len(), path);
    Ok(text)
}

/// Writes `text` to `path` in the requested encoding, creating parent
/// directories as needed.
pub fn write_text(path: &Path, text: &str, encoding: &'static Encoding) -> Result<()> {
    ensure_parent_dir(path)?;
    let bytes: Cow<'_, [u8]> = if encoding == UTF_8 {
        Cow::Borrowed(text.as_bytes())
    } else {
        let (bytes, _, had_errors) = encoding.encode(text);
        if had_errors {
            warn!(
                "Some characters in {:?} could not be represented in {} and were replaced",
                path,
                encoding.name()
            );
        }
        bytes
    };
    fs::write(path, &bytes).with_context(|| format!("Writing {path:?}"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            fs::create_dir_all(parent).with_context(|| format!("Creating directory {parent:?}"))
        }
        _ => Ok(()),
    }
}

pub fn replace_extension(path: &Path, extension: &str) -> PathBuf {
    let mut replaced = path.to_path_buf();
    replaced.set_extension(extension);
    replaced
}

/// `out/orders.xml` + `-errors` + `csv` gives `out/orders-errors.csv`.
pub fn sibling_with_suffix(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}.{extension}"))
}

/// Returns `path` itself when it does not exist yet, otherwise the first
/// free `stem-NNNNNN.ext` variant.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..=999_999)
        .map(|n| path.with_file_name(format!("{stem}-{n:06}{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Moves `path` into `directory`, keeping its file name unique there.
pub fn move_into(path: &Path, directory: &Path) -> Result<PathBuf> {
    fs::create_dir_all(directory).with_context(|| format!("Creating directory {directory:?}"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{path:?} has no file name"))?;
    let target = unique_path(&directory.join(file_name));
    if fs::rename(path, &target).is_err() {
        fs::copy(path, &target).with_context(|| format!("Copying {path:?} to {target:?}"))?;
        fs::remove_file(path).with_context(|| format!("Removing {path:?}"))?;
    }
    Ok(target)
}

/// True when the file name selects a batch of inputs.
pub fn has_wildcard(path: &Path) -> bool {
    path.to_string_lossy().contains(['*', '?'])
}

pub(crate) fn printable_delimiter(delimiter: char) -> String {
    match delimiter {
        '\t' => "\\t".to_string(),
        other => other.to_string(),
    }
}
