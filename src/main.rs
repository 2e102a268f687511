use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bsp_node::config::{DetectorConfig, SensorConfig, DEFAULT_DETECTOR_PORT};
use bsp_node::dashboard::{run_dashboard, DashboardState};
use bsp_node::detector::{FailureDetector, HeartbeatSensor};
use bsp_node::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "bsp-node")]
#[command(version)]
#[command(about = "BSP cluster node services: accrual failure detector and heartbeat sensor")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the accrual failure detector
    Detector(DetectorArgs),

    /// Send heartbeats to a failure detector
    Heartbeat(HeartbeatArgs),
}

#[derive(Parser, Debug)]
struct DetectorArgs {
    /// UDP port to receive heartbeats on
    #[arg(long, default_value_t = DEFAULT_DETECTOR_PORT)]
    port: u16,

    /// Number of inter-arrival samples kept per member
    #[arg(long, default_value = "100")]
    window_size: usize,

    /// Maximum number of heartbeats ingested concurrently
    #[arg(long, default_value = "20")]
    workers: usize,

    /// Port for the HTTP status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// phi above which a member is reported as suspected
    #[arg(long, default_value = "8.0")]
    threshold: f64,

    /// Seconds between suspicion summaries in the log
    #[arg(long, default_value = "10")]
    summary_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct HeartbeatArgs {
    /// Failure detector address ("host:port")
    #[arg(long, default_value = "127.0.0.1:16384")]
    target: SocketAddr,

    /// Interval between heartbeats in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,
}

async fn run_detector(args: DetectorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = DetectorConfig::new(listen_addr)
        .with_window_size(args.window_size)
        .with_worker_threads(args.workers);

    tracing::info!(
        listen_addr = %config.listen_addr,
        window_size = config.window_size,
        workers = config.worker_threads,
        dashboard_addr = ?dashboard_addr,
        "Starting failure detector"
    );

    let shutdown = install_shutdown_handler()?;
    let detector = Arc::new(FailureDetector::new(config));
    detector.start().await?;

    let dashboard = dashboard_addr.map(|addr| {
        let state = DashboardState::new(Arc::clone(&detector), args.threshold);
        let token = shutdown.clone();
        tokio::spawn(async move { run_dashboard(addr, state, token).await })
    });

    let mut summary = tokio::time::interval(Duration::from_secs(args.summary_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = summary.tick() => {
                let members = detector.snapshot();
                let suspected: Vec<&str> = members
                    .iter()
                    .filter(|m| m.phi > args.threshold)
                    .map(|m| m.address.as_str())
                    .collect();
                if suspected.is_empty() {
                    tracing::debug!(members = members.len(), "All members healthy");
                } else {
                    tracing::warn!(members = members.len(), suspected = ?suspected, "Members suspected");
                }
            }
        }
    }

    detector.shutdown().await;
    if let Some(handle) = dashboard {
        let _ = handle.await;
    }
    tracing::info!("Failure detector exited");
    Ok(())
}

async fn run_heartbeat(args: HeartbeatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SensorConfig {
        target: args.target,
        interval_ms: args.interval_ms,
    };
    let shutdown = install_shutdown_handler()?;
    HeartbeatSensor::new(config).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Detector(detector_args) => run_detector(detector_args).await?,
        Commands::Heartbeat(heartbeat_args) => run_heartbeat(heartbeat_args).await?,
    }

    Ok(())
}
