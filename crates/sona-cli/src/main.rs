//! `sona` - storage inspection CLI.
//!
//! Scans a SONA storage root and reports, per file, the detected format,
//! embedding dimension and vector count, flagging files whose dimension
//! disagrees with the deployment configuration.

mod scan;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sona", version, about = "SONA storage inspection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a storage root and report per-file dimensions.
    Scan {
        /// Storage root directory.
        root: std::path::PathBuf,

        /// Expected embedding dimension (defaults to the configured D).
        #[arg(long)]
        dimension: Option<usize>,

        /// Emit the report as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scan {
            root,
            dimension,
            json,
        } => {
            let expected = match dimension {
                Some(d) => d,
                None => sona_core::SonaConfig::load(None::<&str>)
                    .map(|c| c.dimension)
                    .unwrap_or(1536),
            };

            let report = scan::scan_root(&root, expected)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_table(&report);
            }
        }
    }
    Ok(())
}

fn print_table(report: &scan::ScanReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).set_header(vec![
        "Path",
        "Type",
        "Dimension",
        "Vectors",
        "Needs migration",
    ]);

    for file in &report.files {
        table.add_row(vec![
            Cell::new(&file.path),
            Cell::new(file.file_type.as_str()),
            Cell::new(
                file.detected_dimension
                    .map_or_else(|| "-".to_string(), |d| d.to_string()),
            ),
            Cell::new(
                file.vector_count
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
            ),
            Cell::new(if file.needs_migration { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");

    let summary = format!(
        "{} files scanned, {} with vectors, {} need migration (expected dimension {})",
        report.summary.total_files,
        report.summary.files_with_vectors,
        report.summary.files_needing_migration,
        report.summary.expected_dimension,
    );
    if report.summary.files_needing_migration > 0 {
        println!("{}", summary.yellow());
    } else {
        println!("{}", summary.green());
    }
}
