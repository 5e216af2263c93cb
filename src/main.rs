mod ask;
mod batch_demo;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;

use insights_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(
    name = "insights",
    about = "Sales data insights assistant",
    after_help = "Examples:\n  insights ask \"Which month had the most revenue?\"\n  insights batch-demo --tasks 13 --subtasks 7"
)]
struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Default log level; RUST_LOG overrides")]
    log_level: Level,

    #[arg(long, global = true, help = "Emit logs as JSON lines on stderr")]
    json_logs: bool,

    #[arg(long, global = true, help = "Also persist logs to this SQLite database")]
    log_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Ask the assistant a question and stream the answer")]
    Ask(ask::AskArgs),
    #[command(about = "Run concurrent chained jobs through a batch processor")]
    BatchDemo(batch_demo::BatchDemoArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    };
    if let Some(path) = cli.log_db {
        telemetry.log_to_sqlite = true;
        telemetry.log_db_path = path;
    }
    let _telemetry = init_telemetry(telemetry);

    let result = match cli.command {
        Command::Ask(args) => ask::run(args).await,
        Command::BatchDemo(args) => batch_demo::run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
