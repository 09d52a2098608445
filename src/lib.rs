pub mod batch;
pub mod cli;
pub mod condition;
pub mod config;
pub mod context;
pub mod counter;
pub mod data;
pub mod document;
pub mod extract;
pub mod generate;
pub mod io_utils;
pub mod job;
pub mod loops;
pub mod mapping;
pub mod path;
pub mod report;
pub mod runlog;
pub mod table;
pub mod transform;
pub mod variables;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    batch::RunTargets,
    cli::{Cli, CommonArgs, Commands},
    config::ConverterConfig,
    context::Direction,
    job::Converter,
    runlog::RunLog,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_xml_mapper", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::CsvToXml(args) => handle_convert(Direction::CsvToXml, &args.common, None),
        Commands::XmlToCsv(args) => {
            handle_convert(Direction::XmlToCsv, &args.common, args.template.clone())
        }
    }
}

fn handle_convert(
    direction: Direction,
    args: &CommonArgs,
    template: Option<std::path::PathBuf>,
) -> Result<()> {
    let config = load_config(args)?;
    debug!("Effective configuration: {config:?}");
    let log = config.log_file.clone().map(RunLog::new);
    let mut converter = Converter::new(
        direction,
        config,
        &args.mapping,
        args.mapping_errors.as_deref(),
        template,
    )?;
    let targets = RunTargets {
        input: args.input.clone(),
        output: args.output.clone(),
        error_file: args.errors.clone(),
        processed: args.processed.clone(),
    };
    let summaries = batch::run(&mut converter, &targets, log.as_ref())?;
    let records: usize = summaries.iter().map(|s| s.records).sum();
    let errors: usize = summaries.iter().map(|s| s.errors).sum();
    info!(
        "{} finished: {} file(s), {} record(s), {} error(s)",
        direction.label(),
        summaries.len(),
        records,
        errors
    );
    Ok(())
}

/// Configuration file values with command line overrides applied.
fn load_config(args: &CommonArgs) -> Result<ConverterConfig> {
    let mut config = ConverterConfig::load_optional(args.config.as_deref())
        .with_context(|| format!("Loading configuration {:?}", args.config))?;
    if let Some(root) = &args.root {
        config.root_element = root.clone();
    }
    if let Some(separator) = args.decimal_separator {
        config.decimal_separator = Some(separator);
    }
    if let Some(encoding) = &args.input_encoding {
        config.input_encoding = Some(encoding.clone());
    }
    if let Some(encoding) = &args.output_encoding {
        config.output_encoding = Some(encoding.clone());
    }
    if let Some(dir) = &args.counters {
        config.counter_dir = Some(dir.clone());
    }
    if let Some(log) = &args.log {
        config.log_file = Some(log.clone());
    }
    Ok(config)
}
