use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tsdat::{Pipeline, PipelineConfig, PipelineError, SimpleLogger};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level for output
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline against one set of input files
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Override the storage root from the config
        #[arg(long)]
        storage_root: Option<PathBuf>,

        /// Input files, all belonging to the same record
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Load and validate pipeline config without running it
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Pipeline config file(s); later files override earlier ones
    #[arg(short, long = "config", required = true)]
    configs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::init(level) {
        eprintln!("failed to install logger: {e}");
    }

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command) -> Result<(), PipelineError> {
    let total_start = Instant::now();
    match command {
        Command::Validate { config } => {
            let config = PipelineConfig::load(&config.configs)?;
            println!(
                "Config OK | pipeline={} datastream={} variables={}",
                config.pipeline.name,
                config.datastream(),
                config.dataset.variables().count()
            );
        }
        Command::Run {
            config,
            storage_root,
            inputs,
        } => {
            let load_start = Instant::now();
            let mut config = PipelineConfig::load(&config.configs)?;
            if let Some(root) = storage_root {
                config.storage.root = root;
            }
            debug!("Config loaded in {:.2?}", load_start.elapsed());

            println!(
                "tsdat! Running {} -> {}",
                config.pipeline.name,
                config.datastream()
            );
            let pipeline = Pipeline::new(config)?;
            let report = pipeline.run(&inputs);
            debug!(
                "Stages: {}",
                report
                    .transitions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            if let Some(qc) = &report.qc {
                println!(
                    "QC ran {} test(s) | {} value(s) flagged",
                    qc.outcomes.len(),
                    qc.total_failed()
                );
            }
            for file in &report.ancillary {
                debug!("  - {}", file.display());
            }
            let record = report.into_result()?;
            println!(
                "Stored {} version {} | content hash {}",
                record.key, record.version, record.content_hash
            );
        }
    }
    println!("Completed in {:.2?}", total_start.elapsed());
    Ok(())
}
