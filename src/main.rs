use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use covsplit::classify::DEFAULT_EXCLUSION_PATTERN;
use covsplit::cli;
use covsplit::service::CoverageService;
use covsplit::store::SqliteStore;

/// Track Cobertura coverage history with a core/excluded split.
#[derive(Parser)]
#[command(name = "covsplit", version, about)]
struct Cli {
    /// Path to the SQLite database (default: ./.covsplit.db)
    #[arg(long, global = true, default_value = ".covsplit.db")]
    db: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not draw progress bars.
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a Cobertura file and save it (replaces any report from the same day).
    Upload {
        /// Path to the Cobertura XML file.
        file: PathBuf,

        /// Case-insensitive substring marking classes as excluded ("" disables).
        #[arg(long, default_value = DEFAULT_EXCLUSION_PATTERN)]
        exclude: String,
    },

    /// Parse a Cobertura file and print its summary without saving it.
    Parse {
        /// Path to the Cobertura XML file.
        file: PathBuf,

        /// Case-insensitive substring marking classes as excluded ("" disables).
        #[arg(long, default_value = DEFAULT_EXCLUSION_PATTERN)]
        exclude: String,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List saved reports, newest first.
    History {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show a saved report with per-package coverage.
    Show {
        /// Report id.
        id: i64,

        /// Re-partition the stored classes with a different pattern.
        #[arg(long)]
        exclude: Option<String>,

        /// Sort packages by coverage rate ascending (worst first).
        #[arg(long)]
        sort_by_coverage: bool,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Delete a saved report.
    Delete {
        /// Report id.
        id: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let show_progress = !cli.no_progress;

    let output = match cli.command {
        Commands::Upload { file, exclude } => {
            let document = read_document(&file)?;
            let mut service = open_service(&cli.db)?;
            let parse_bar = progress_bar(show_progress, "parsing");
            let save_bar = progress_bar(show_progress, "saving");
            let out = cli::cmd_upload(
                &mut service,
                &document,
                &exclude,
                &mut parse_progress(&parse_bar),
                &mut |p| save_bar.set_position(u64::from(p)),
            );
            parse_bar.finish_and_clear();
            save_bar.finish_and_clear();
            out?
        }
        Commands::Parse {
            file,
            exclude,
            json,
        } => {
            let document = read_document(&file)?;
            let bar = progress_bar(show_progress, "parsing");
            let out = cli::cmd_parse(&document, &exclude, json, &mut |f| {
                bar.set_position(percent(f))
            });
            bar.finish_and_clear();
            out?
        }
        Commands::History { json } => cli::cmd_history(&open_service(&cli.db)?, json)?,
        Commands::Show {
            id,
            exclude,
            sort_by_coverage,
            json,
        } => cli::cmd_show(
            &open_service(&cli.db)?,
            id,
            exclude.as_deref(),
            sort_by_coverage,
            json,
        )?,
        Commands::Delete { id } => cli::cmd_delete(&mut open_service(&cli.db)?, id)?,
    };
    print!("{}", output);
    Ok(())
}

fn open_service(db: &Path) -> Result<CoverageService<SqliteStore>> {
    let store = SqliteStore::open(db).context("Failed to open database")?;
    Ok(CoverageService::new(store))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn progress_bar(enabled: bool, message: &'static str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{msg:>8} [{bar:40}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message);
    bar
}

/// Feed parse fractions to `bar`, clearing it once parsing completes so the
/// save bar takes its place.
fn parse_progress(bar: &ProgressBar) -> impl FnMut(f64) + '_ {
    move |fraction| {
        bar.set_position(percent(fraction));
        if fraction >= 1.0 {
            bar.finish_and_clear();
        }
    }
}

fn percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u64
}
