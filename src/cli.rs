use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert CSV files to XML and back, driven by a mapping file", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate XML documents from CSV files
    #[command(name = "csv2xml", alias = "c2x")]
    CsvToXml(CsvToXmlArgs),
    /// Extract CSV files from XML documents
    #[command(name = "xml2csv", alias = "x2c")]
    XmlToCsv(XmlToCsvArgs),
}

#[derive(Debug, Args)]
pub struct CsvToXmlArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct XmlToCsvArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// CSV file whose header (and delimiter, quoting, decimal separator) shapes the output
    #[arg(short = 't', long = "template")]
    pub template: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Input file; `*` and `?` in the file name select a batch
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Mapping definition file
    #[arg(short = 'm', long = "mapping")]
    pub mapping: PathBuf,
    /// Output file, or output directory in batch mode (defaults next to the input)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Data error file (defaults to `<output>-errors.csv`)
    #[arg(short = 'e', long = "errors")]
    pub errors: Option<PathBuf>,
    /// Mapping error file (defaults to `<mapping>-errors.csv`)
    #[arg(long = "mapping-errors")]
    pub mapping_errors: Option<PathBuf>,
    /// Append run entries to this log file
    #[arg(short = 'l', long = "log")]
    pub log: Option<PathBuf>,
    /// Move converted input files into this directory
    #[arg(short = 'p', long = "processed")]
    pub processed: Option<PathBuf>,
    /// Directory holding counter files (defaults to the mapping's directory)
    #[arg(short = 'r', long = "counters")]
    pub counters: Option<PathBuf>,
    /// YAML or JSON run configuration
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Character encoding of input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Character encoding of output files (defaults to utf-8)
    #[arg(long = "output-encoding")]
    pub output_encoding: Option<String>,
    /// Decimal separator of CSV numbers (detected when omitted)
    #[arg(long = "decimal-separator", value_parser = parse_decimal_separator)]
    pub decimal_separator: Option<char>,
    /// Root element name used when the mapping has no ROOT row
    #[arg(long = "root")]
    pub root: Option<String>,
}

pub fn parse_decimal_separator(value: &str) -> Result<char, String> {
    match value {
        "." | "dot" | "point" => Ok('.'),
        "," | "comma" => Ok(','),
        other => Err(format!("Decimal separator must be '.' or ',', got '{other}'")),
    }
}
