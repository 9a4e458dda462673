use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use admissoor::admission::AdmissionController;
use admissoor::calculus::SncAlgorithm;
use admissoor::config::Config;
use admissoor::enforcer::LoggingEnforcer;
use admissoor::server::{self, AppState};
use admissoor::snc::arrival::MmbpArrival;
use admissoor::trace::{ProcessedTrace, TraceReader, WorkEstimator};

/// SNC-based admission control for per-tenant network latency QoS.
#[derive(Parser)]
#[command(name = "admissoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Fit an arrival model from a trace file and print its JSON form,
    /// suitable as a flow's `arrivalInfo`.
    Fit {
        /// Path to the trace file.
        #[arg(long)]
        trace: PathBuf,

        /// Traffic direction the estimator models.
        #[arg(long, value_enum, default_value = "in")]
        direction: Direction,

        /// Constant work for non-data-heavy requests.
        #[arg(long, default_value_t = 0.0)]
        non_data_constant: f64,

        /// Per-byte work factor for non-data-heavy requests.
        #[arg(long, default_value_t = 0.0)]
        non_data_factor: f64,

        /// Constant work for data-heavy requests.
        #[arg(long, default_value_t = 0.0)]
        data_constant: f64,

        /// Per-byte work factor for data-heavy requests.
        #[arg(long, default_value_t = 1.0)]
        data_factor: f64,
    },
}

/// Which host link direction a trace is fitted for.
#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    /// Tenant towards server: puts are data-heavy.
    In,
    /// Server towards tenant: gets are data-heavy.
    Out,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle subcommands that do not need a config or runtime first.
    match &cli.command {
        Some(Command::Version) => {
            println!("admissoor {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Fit {
            trace,
            direction,
            non_data_constant,
            non_data_factor,
            data_constant,
            data_factor,
        }) => {
            let estimator = match direction {
                Direction::In => WorkEstimator::NetworkIn {
                    non_data_constant: *non_data_constant,
                    non_data_factor: *non_data_factor,
                    data_constant: *data_constant,
                    data_factor: *data_factor,
                },
                Direction::Out => WorkEstimator::NetworkOut {
                    non_data_constant: *non_data_constant,
                    non_data_factor: *non_data_factor,
                    data_constant: *data_constant,
                    data_factor: *data_factor,
                },
            };
            let reader = TraceReader::from_path(trace)?;
            let mut processed = ProcessedTrace::new(reader, estimator);
            let arrival = MmbpArrival::from_trace(&mut processed);
            let json =
                serde_json::to_string(&arrival).context("serializing arrival model")?;
            println!("{json}");
            return Ok(());
        }
        None => {}
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the server run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        algorithm = ?cfg.algorithm,
        "starting admissoor",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let algorithm: SncAlgorithm = cfg.algorithm;
    let controller = AdmissionController::new(algorithm, Box::new(LoggingEnforcer));
    let state = Arc::new(AppState::new(controller));

    // Cancel the server on SIGINT/SIGTERM.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::error!(%error, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        signal_cancel.cancel();
    });

    server::serve(&cfg.listen_addr, state, cancel).await?;

    tracing::info!("admissoor stopped");
    Ok(())
}
