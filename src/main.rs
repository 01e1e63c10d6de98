//! hdr-capture-bridge: demo coordinator over synthetic backends
//!
//! `run` starts one capture session and serves its frames over the loopback
//! HTTP endpoint; `probe` prints what backend selection would pick.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use hdr_capture_bridge::{
    capture::{
        BackendKind, BackendRegistry, StaticBackendLoader, SyntheticBackend,
        constants::BridgeConfig, selector::normalize_route_preference,
    },
    coordinator::{Coordinator, SessionOptions},
    model::StartRequest,
    transport::{ConsumerCapabilities, FrameServer},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "hdr-capture-bridge")]
#[command(about = "HDR capture negotiation and frame transport demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a synthetic capture session and serve its frames over HTTP
    Run {
        /// Source to capture
        #[arg(long, default_value = "screen:0")]
        source: String,
        /// Display the source lives on
        #[arg(long)]
        display_id: Option<u64>,
        /// Frame rate cap (1-120)
        #[arg(long, default_value_t = 60)]
        fps: u32,
        /// Backend preference: auto, wgc or legacy
        #[arg(long, default_value = "auto")]
        route: String,
        /// Frame server port on 127.0.0.1 (0 picks a free port)
        #[arg(long, default_value_t = 0)]
        port: u16,
        /// Synthetic frame size as WIDTHxHEIGHT
        #[arg(long, default_value = "1280x720")]
        size: String,
    },
    /// Print the backend selection for a route preference as JSON
    Probe {
        /// Backend preference: auto, wgc or legacy
        #[arg(long, default_value = "auto")]
        route: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Respects RUST_LOG, default hdr_capture_bridge=info
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hdr_capture_bridge=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            source,
            display_id,
            fps,
            route,
            port,
            size,
        } => run(source, display_id, fps, &route, port, &size).await,
        Commands::Probe { route } => probe(&route),
    }
}

fn synthetic_registry(width: u32, height: u32) -> Arc<BackendRegistry> {
    let loader = StaticBackendLoader::new()
        .with_backend(
            BackendKind::Wgc,
            Arc::new(SyntheticBackend::new(BackendKind::Wgc.default_label()).with_resolution(width, height)),
        )
        .with_backend(
            BackendKind::Legacy,
            Arc::new(SyntheticBackend::new(BackendKind::Legacy.default_label()).with_resolution(width, height)),
        );
    Arc::new(BackendRegistry::new(loader))
}

fn parse_size(size: &str) -> Result<(u32, u32)> {
    let (width, height) = size
        .split_once('x')
        .ok_or_else(|| anyhow::anyhow!("size must look like WIDTHxHEIGHT, got '{size}'"))?;
    Ok((width.trim().parse()?, height.trim().parse()?))
}

async fn run(source: String, display_id: Option<u64>, fps: u32, route: &str, port: u16, size: &str) -> Result<()> {
    let (width, height) = parse_size(size)?;
    let config = BridgeConfig::from_env();
    info!(?config, "hdr-capture-bridge starting");

    let server = Arc::new(FrameServer::start(port).await?);
    let coordinator = Coordinator::new(synthetic_registry(width, height), config).with_frame_server(Arc::clone(&server));

    let mut request = StartRequest::new(source, fps).with_route(normalize_route_preference(route));
    request.display_id = display_id;
    let started = coordinator
        .start_session(SessionOptions::new(request).with_consumer(ConsumerCapabilities::remote()))
        .await?;

    info!(
        session_id = %started.session_id,
        route = %started.route,
        transport = %started.transport_mode,
        "session running"
    );
    if let Some(url) = started.frame_url() {
        println!("{url}");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                match coordinator.diagnostics(&started.session_id) {
                    Some(snapshot) => info!("diagnostics: {}", serde_json::to_string(&snapshot)?),
                    None => warn!("session disappeared"),
                }
            }
        }
    }

    info!("shutting down");
    coordinator.shutdown().await;
    drop(coordinator);
    match Arc::try_unwrap(server) {
        Ok(server) => server.shutdown().await,
        Err(_) => warn!("frame server still referenced, leaving it to the runtime"),
    }
    Ok(())
}

fn probe(route: &str) -> Result<()> {
    let coordinator = Coordinator::new(synthetic_registry(1280, 720), BridgeConfig::from_env());
    let summary = coordinator.select(normalize_route_preference(route));
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
