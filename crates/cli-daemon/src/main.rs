//! CLI entry point for the ABR transcoder
//!
//! `run` starts the daemon, `enqueue` drops a job into the daemon's inbox and
//! `status` prints job records.

use abr_transcoder::{
    load_jobs, submit_to_inbox, Config, Daemon, DaemonError, JobDescriptor, RenditionSpec,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// ABR Transcoder - turns uploaded videos into HLS rendition ladders
#[derive(Parser, Debug)]
#[command(name = "abr-transcoder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml); defaults apply when missing
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the transcoding daemon
    Run {
        /// Skip startup checks (encoder version, directories)
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Submit a job to the daemon's inbox
    Enqueue {
        /// Input video, relative to the configured input directory or absolute
        #[arg(short, long)]
        input: PathBuf,

        /// Job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Rendition as HEIGHT:KBPS (e.g. 720:1000); repeatable, defaults to the catalog
        #[arg(short, long = "rendition", value_parser = parse_rendition)]
        renditions: Vec<RenditionSpec>,
    },
    /// Print job records as JSON
    Status {
        /// Only this job
        id: Option<String>,
    },
}

/// Parse `720:1000` or `720p:1000k`.
fn parse_rendition(value: &str) -> Result<RenditionSpec, String> {
    let (height, kbps) = value
        .split_once(':')
        .ok_or_else(|| format!("expected HEIGHT:KBPS, got {:?}", value))?;
    let height: u32 = height
        .trim()
        .trim_end_matches('p')
        .parse()
        .map_err(|_| format!("invalid height in {:?}", value))?;
    let kbps: u32 = kbps
        .trim()
        .trim_end_matches('k')
        .parse()
        .map_err(|_| format!("invalid bitrate in {:?}", value))?;
    Ok(RenditionSpec::new(height, kbps))
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon(config: Config, skip_checks: bool) -> Result<(), DaemonError> {
    let daemon = if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)?
    } else {
        Daemon::with_config(config).await?
    };

    info!(
        job_slots = daemon.concurrency_plan.job_slots,
        encoder_processes = daemon.concurrency_plan.encoder_processes,
        "daemon initialized"
    );
    if daemon.config.server.enabled {
        info!(
            "serving metrics on http://{}/metrics",
            daemon.config.server.bind
        );
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        });
    }

    daemon.run_with_server(shutdown).await
}

fn print_status(config: &Config, id: Option<&str>) -> Result<(), String> {
    let jobs = load_jobs(&config.queue.state_dir.join("jobs")).map_err(|e| e.to_string())?;
    let json = match id {
        Some(id) => {
            let job = jobs
                .iter()
                .find(|j| j.id == id)
                .ok_or_else(|| format!("job {} not found", id))?;
            serde_json::to_string_pretty(job)
        }
        None => serde_json::to_string_pretty(&jobs),
    }
    .map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    match cli.command {
        Command::Run { skip_checks } => {
            if let Err(e) = run_daemon(config, skip_checks).await {
                error!(error = %e, "daemon failed");
                return ExitCode::FAILURE;
            }
        }
        Command::Enqueue {
            input,
            id,
            renditions,
        } => {
            let mut descriptor = JobDescriptor::new(input).with_renditions(renditions);
            descriptor.job_id = id;
            match submit_to_inbox(&config.queue.state_dir, descriptor) {
                Ok(id) => println!("{}", id),
                Err(e) => {
                    eprintln!("Failed to enqueue job: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Command::Status { id } => {
            if let Err(e) = print_status(&config, id.as_deref()) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
