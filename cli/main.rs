#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use isgvip::pipeline::{self, RunConfig};
use log::LevelFilter;
use std::io::Write;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "isgvip",
    version,
    about = "Predict infection status from interferon-stimulated gene expression with a five-fold stacking ensemble."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct RunArgs {
    /// Per-gene count table (TSV with sample_id, hum_symbol, raw_count, type)
    #[arg(long, value_name = "PATH", default_value = "input/per_gene_count.tsv")]
    gene_count_file: PathBuf,

    /// Sample metadata table (TSV with sample_id, species_host, order_host)
    #[arg(long, value_name = "PATH", default_value = "input/sample_metadata.tsv")]
    metadata: PathBuf,

    /// Directory receiving the prediction tables (created if absent)
    #[arg(long, value_name = "DIR", default_value = "output")]
    output: PathBuf,

    /// Directory holding the fitted normalizers, encoders, models and thresholds
    #[arg(long, value_name = "DIR", default_value = "model_dir")]
    model_dir: PathBuf,

    /// Newline-delimited gene symbols the models were trained on
    #[arg(long, value_name = "PATH", default_value = "reference/gene_list.txt")]
    gene_list: PathBuf,

    /// Number of worker threads for fold scoring (default: one per core)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Logging level: debug, info, warning, error or critical
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

impl From<RunArgs> for RunConfig {
    fn from(args: RunArgs) -> Self {
        RunConfig {
            gene_count_file: args.gene_count_file,
            metadata: args.metadata,
            output: args.output,
            model_dir: args.model_dir,
            gene_list: args.gene_list,
            threads: args.threads,
        }
    }
}

/// Maps a level name onto a filter. Unrecognized names fall back to `info`.
fn parse_log_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "critical" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Installs the stderr logger. `RUST_LOG` overrides the command-line level.
fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
}

fn print_version_info() {
    println!("isgvip {}", env!("CARGO_PKG_VERSION"));
    match option_env!("ISGVIP_RELEASE_TAG") {
        Some(tag) => println!("Release: {}", tag),
        None => println!("Release: development build"),
    }
}

fn main() {
    let Cli { command, run } = Cli::parse();

    if let Some(Commands::Version) = command {
        print_version_info();
        return;
    }

    init_logger(parse_log_level(&run.log_level));

    match pipeline::run(&RunConfig::from(run)) {
        Ok(summary) => {
            log::info!(
                "Wrote {} tables; {} of {} samples have a final prediction",
                summary.written.len(),
                summary.n_reported,
                summary.n_samples
            );
        }
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_uses_working_directory_defaults() {
        let cli = Cli::try_parse_from(["isgvip"]).unwrap();
        assert!(cli.command.is_none());
        let config = RunConfig::from(cli.run);
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "isgvip",
            "--model-dir",
            "/models",
            "--threads",
            "2",
            "--log-level",
            "DEBUG",
        ])
        .unwrap();
        assert_eq!(parse_log_level(&cli.run.log_level), LevelFilter::Debug);
        let config = RunConfig::from(cli.run);
        assert_eq!(config.model_dir, PathBuf::from("/models"));
        assert_eq!(config.threads, Some(2));
    }

    #[test]
    fn log_level_aliases_and_fallback() {
        assert_eq!(parse_log_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_log_level("critical"), LevelFilter::Error);
        assert_eq!(parse_log_level("verbose"), LevelFilter::Info);
    }
}
