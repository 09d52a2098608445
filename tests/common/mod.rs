#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

/// Column layout shared by the mapping fixtures below.
pub const MAPPING_HEADER: &str = "CSV_OP;CSV_CONTENT;CSV_CONTENT2;CSV_MO;CSV_TYPE;CSV_FORMAT;CSV_CONDITION;XML_OP;XML_CONTENT;XML_ATTRIBUTE;XML_TYPE;XML_FORMAT;XML_CONDITION;XML_DEFAULT";

/// Joins mapping rows under [`MAPPING_HEADER`].
pub fn mapping_text(rows: &[&str]) -> String {
    let mut text = String::from(MAPPING_HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text
}

/// Fund/NAV mapping used by several integration tests: one `Fund` node per
/// fund name, one `Nav` child per row.
pub fn fund_mapping() -> String {
    mapping_text(&[
        "NOP;;;;;;;ROOT;FundsXML;;;;;",
        "CHANGE;FUND;;;Text;;;LOOP;Funds/Fund;;;;;",
        "MAP;FUND;;M;Text;;;MAP;Funds/Fund/Name;;;;;",
        "MAP;CCY;;;Text;(EUR,USD,CHF);;MAP;Funds/Fund;ccy;;;;",
        "CHANGE;DAY;;;Text;;;LOOP;Funds/Fund/Navs/Nav;;;;;",
        "MAP;DAY;;M;Date;DD.MM.YYYY;;MAP;Funds/Fund/Navs/Nav;date;;YYYY-MM-DD;;",
        "MAP;NAV;;;Number;;;MAP;Funds/Fund/Navs/Nav;;;;;",
    ])
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Reads a file under the workspace.
    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.temp_dir.path().join(name)).expect("read workspace file")
    }
}
