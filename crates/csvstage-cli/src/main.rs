//! csvstage CLI - Main entry point
//!
//! Dry-run consumer of the staging pipeline: rows are validated, staged,
//! and reported on, but never committed anywhere.

mod logging;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use csvstage::processor::DEFAULT_MAX_FILE_SIZE;
use csvstage::{
    ChecksumConfig, ChecksumValidator, CsvProcessor, CsvSource, ProcessorConfig, RowHandler,
};
use tracing::error;

#[derive(Parser)]
#[command(name = "csvstage", version, about = "Validate and stage CSV files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a CSV file and print the status report as JSON
    Check {
        /// Input CSV file
        file: PathBuf,

        /// Columns that must be present in the header (comma separated)
        #[arg(long, value_delimiter = ',')]
        required_columns: Vec<String>,

        /// Maximum input size in bytes; 0 disables the check
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
        max_file_size: u64,

        /// Verify a checksum column computed over these columns (comma separated)
        #[arg(long, value_delimiter = ',')]
        checksum_columns: Vec<String>,

        /// Column holding the checksum value
        #[arg(long, default_value = "csum")]
        checksum_field: String,

        /// Truncated checksum length in hex characters
        #[arg(long, default_value_t = 4)]
        checksum_size: usize,

        /// Checksum secret
        #[arg(long, env = "CSVSTAGE_SECRET", default_value = "")]
        secret: String,

        /// Write a per-row error report (input columns plus status/error) here
        #[arg(long)]
        errors_out: Option<PathBuf>,
    },
}

/// Handler that stages everything and commits nothing.
struct DryRun;

impl RowHandler for DryRun {}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "warn" });

    match run(cli) {
        Ok(clean) => {
            if !clean {
                process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

/// Returns whether the file checked out clean.
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Check {
            file,
            required_columns,
            max_file_size,
            checksum_columns,
            checksum_field,
            checksum_size,
            secret,
            errors_out,
        } => {
            let config = ProcessorConfig {
                columns: Vec::new(),
                required_columns,
                max_file_size,
                ..ProcessorConfig::default()
            };
            if checksum_columns.is_empty() {
                let processor = CsvProcessor::new(config, DryRun);
                check_file(processor, &file, errors_out)
            } else {
                let mut checksum = ChecksumConfig::new(checksum_columns, secret);
                checksum.fieldname = checksum_field;
                checksum.size = checksum_size;
                let processor =
                    CsvProcessor::new(config, ChecksumValidator::new(checksum, DryRun));
                check_file(processor, &file, errors_out)
            }
        }
    }
}

fn check_file<H: RowHandler>(
    mut processor: CsvProcessor<H>,
    file: &Path,
    errors_out: Option<PathBuf>,
) -> Result<bool> {
    let source = CsvSource::open(file)
        .with_context(|| format!("Failed to open '{}'", file.display()))?;
    processor.process_file(source, false)?;

    let status = processor.status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    if let Some(path) = errors_out {
        let mut out = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;
        // Shape the error report like the input.
        let input_columns = processor.input_columns().to_vec();
        for line in processor.export_error_lines(Some(input_columns)) {
            out.write_all(line.as_bytes())?;
        }
    }

    Ok(status.error_messages.is_empty())
}
