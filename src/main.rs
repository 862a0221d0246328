use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use siglo_fundos::core::config::DEFAULT_CONFIG_PATH;
use siglo_fundos::core::log::init_logging;
use siglo_fundos::core::month::ReferenceMonth;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the pipeline configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Directory receiving staging/ and curated/ CSVs
    #[arg(short, long, global = true, default_value = "output")]
    output_dir: PathBuf,

    /// Download cache directory (defaults to the platform cache directory)
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// Last month to consider, as YYYY-MM (defaults to the current month)
    #[arg(short, long, global = true)]
    reference_month: Option<ReferenceMonth>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for siglo_fundos::AppCommand {
    fn from(cmd: Commands) -> siglo_fundos::AppCommand {
        match cmd {
            Commands::Ingest { skip_bigquery } => siglo_fundos::AppCommand::Ingest { skip_bigquery },
            Commands::ExportLocal => siglo_fundos::AppCommand::ExportLocal,
            Commands::UploadBigquery => siglo_fundos::AppCommand::UploadBigquery,
            Commands::ExportFrontend { frontend_dir } => {
                siglo_fundos::AppCommand::ExportFrontend { frontend_dir }
            }
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration to --config-path
    Setup,
    /// Download, normalize, write CSVs and upload them to BigQuery
    Ingest {
        /// Keep the CSVs local and skip the warehouse upload
        #[arg(long)]
        skip_bigquery: bool,
    },
    /// Download, normalize and write CSVs without uploading
    ExportLocal,
    /// Upload CSVs already present in the output directory
    UploadBigquery,
    /// Write the static JSON payload for the dashboard frontend
    ExportFrontend {
        /// Destination directory (defaults to <output-dir>/frontend)
        #[arg(long)]
        frontend_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => siglo_fundos::cli::setup::setup_at_path(&cli.config_path),
        Some(cmd) => {
            let options = siglo_fundos::RunOptions {
                config_path: cli.config_path,
                output_dir: cli.output_dir,
                workdir: cli.workdir,
                reference_month: cli.reference_month,
                show_progress: true,
            };
            run(cmd.into(), &options).await
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "Pipeline failed");
    }
    result
}

async fn run(command: siglo_fundos::AppCommand, options: &siglo_fundos::RunOptions) -> Result<()> {
    let report = siglo_fundos::run_command(command, options).await?;
    println!("{}", report.display_as_table());

    if report.has_failures() {
        anyhow::bail!("{} table load(s) failed", report.load_failures.len());
    }
    Ok(())
}
