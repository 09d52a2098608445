//! Run configuration.
//!
//! A configuration file is optional; every field has a default and command
//! line flags override whatever the file provides. Files ending in `.yaml`
//! or `.yml` are read as YAML, anything else as JSON.

use std::{fs::File, io::BufReader, path::{Path, PathBuf}};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::context::EngineSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub root_element: String,
    pub unique_id_path: String,
    pub min_populated_cells: usize,
    pub indent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_separator: Option<char>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Characters stripped around unquoted fields; the delimiter decides
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_characters: Option<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        ConverterConfig {
            root_element: engine.root_element,
            unique_id_path: engine.unique_id_path,
            min_populated_cells: 1,
            indent: engine.indent,
            decimal_separator: None,
            input_encoding: None,
            output_encoding: None,
            counter_dir: None,
            log_file: None,
            ignore_characters: None,
        }
    }
}

impl ConverterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let reader = BufReader::new(file);
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        let config: ConverterConfig = if is_yaml {
            serde_yaml::from_reader(reader).context("Parsing config YAML")?
        } else {
            serde_json::from_reader(reader).context("Parsing config JSON")?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.root_element.trim().is_empty() {
            bail!("root_element must not be empty");
        }
        match self.decimal_separator {
            None | Some('.') | Some(',') => {}
            Some(other) => bail!("decimal_separator must be '.' or ',', got '{other}'"),
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            root_element: self.root_element.clone(),
            unique_id_path: self.unique_id_path.clone(),
            indent: self.indent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "root_element: Funds\ndecimal_separator: ','\nindent: 4\n").expect("write");
        let config = ConverterConfig::load(&path).expect("load");
        assert_eq!(config.root_element, "Funds");
        assert_eq!(config.decimal_separator, Some(','));
        assert_eq!(config.indent, 4);
        assert_eq!(config.unique_id_path, "ControlData/UniqueDocumentID");
        assert_eq!(config.min_populated_cells, 1);
    }

    #[test]
    fn json_is_the_fallback_format() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"counter_dir": "counters", "output_encoding": "windows-1252"}"#)
            .expect("write");
        let config = ConverterConfig::load(&path).expect("load");
        assert_eq!(config.counter_dir, Some(PathBuf::from("counters")));
        assert_eq!(config.output_encoding.as_deref(), Some("windows-1252"));
        assert_eq!(config.root_element, "Document");
    }

    #[test]
    fn rejects_unknown_decimal_separator() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.yml");
        std::fs::write(&path, "decimal_separator: ';'\n").expect("write");
        let err = ConverterConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("decimal_separator"));
    }
}
