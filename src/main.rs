//! fw-release CLI
//!
//! Entry point for the `fw-release` command-line tool.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use fw_release::pipeline::{Pipeline, PipelineResult};
use fw_release::signal::SignalHandler;
use fw_release::summary::{ExitCode, RunReport};
use fw_release::ReleaseConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fw-release")]
#[command(about = "Convert and sign OTA firmware images", version)]
struct Cli {
    /// Path to release config file (default: ./release.toml if present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level filter (e.g. info, debug, fw_release=trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert, sign and clean up (default)
    Run,

    /// Convert build artifacts into board images only
    Convert,

    /// Sign the board images already in the working directory
    Sign,

    /// Show the firmware catalog
    Catalog {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check that every present image is signed and no key is left behind
    Verify {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = match ReleaseConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(ExitCode::Config.as_i32());
        }
    };

    let pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code().as_i32());
        }
    };

    let code = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_release(pipeline, Pipeline::run),
        Commands::Convert => run_release(pipeline, Pipeline::convert),
        Commands::Sign => run_release(pipeline, Pipeline::sign),
        Commands::Catalog { json } => run_catalog(&pipeline, json),
        Commands::Verify { json } => run_verify(&pipeline, json),
    };

    process::exit(code.as_i32());
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run_release(pipeline: Pipeline, step: fn(&Pipeline) -> PipelineResult<RunReport>) -> ExitCode {
    let handler = SignalHandler::new();
    if let Err(e) = handler.install() {
        eprintln!("Error installing signal handler: {}", e);
        return ExitCode::Config;
    }
    let pipeline = pipeline.with_signal_state(handler.state());

    match step(&pipeline) {
        Ok(report) => {
            println!("{}", report.human_summary);
            report.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run_catalog(pipeline: &Pipeline, json: bool) -> ExitCode {
    let catalog = pipeline.catalog();

    if json {
        let entries: Vec<_> = catalog.entries().collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return ExitCode::Config;
            }
        }
    } else {
        println!("{:<20} {:<12} {:<7} {:>7}  {}", "ARTIFACT", "BOARD", "SLOT", "VERSION", "IMAGE");
        for entry in catalog.entries() {
            println!(
                "{:<20} {:<12} {:<7} {:>7}  {}{}",
                entry.artifact_name,
                entry.board_id,
                entry.slot,
                entry.version,
                entry.file_name(),
                if entry.strip { " (stripped)" } else { "" }
            );
        }
    }

    ExitCode::Success
}

fn run_verify(pipeline: &Pipeline, json: bool) -> ExitCode {
    let report = match pipeline.verify() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return ExitCode::Config;
            }
        }
    } else {
        for image in &report.images {
            let state = match (image.present, image.signed) {
                (false, _) => "missing",
                (true, false) => "UNSIGNED",
                (true, true) => "signed",
            };
            println!("{:<28} v{:<6} {}", image.file_name, image.version, state);
        }
        if report.key_present {
            println!("KEY RESIDUE: signing key present in working directory");
        }
    }

    report.exit_code()
}
