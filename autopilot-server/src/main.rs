use anyhow::Result;
use autopilot::session::extension::DEFAULT_WS_ADDR;
use autopilot::session::{ExtensionBridge, ExtensionSession, MemorySession};
use autopilot::{BrowserSession, FileStore, KeyValueStore, MemoryStore, WorkflowLibrary};
use autopilot_server::{router, utils::init_logging, CoordinatorConfig, PlaybackCoordinator};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SessionKind {
    /// Snapshot-backed in-memory pages (dry runs)
    Memory,
    /// A browser extension connected to the WebSocket bridge
    Extension,
}

#[derive(Parser, Debug)]
#[command(name = "autopilot-server")]
#[command(about = "HTTP/WebSocket server for recording and replaying browser workflows")]
struct Args {
    /// Address to bind
    #[arg(long, env = "AUTOPILOT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "AUTOPILOT_PORT", default_value = "8082")]
    port: u16,

    /// Directory for saved workflows; kept in memory when unset
    #[arg(long, env = "AUTOPILOT_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Browser session backend
    #[arg(long, env = "AUTOPILOT_SESSION", value_enum, default_value = "memory")]
    session: SessionKind,

    /// Listen address of the extension bridge
    #[arg(long, env = "AUTOPILOT_BRIDGE_ADDR", default_value = DEFAULT_WS_ADDR)]
    bridge_addr: String,

    /// Abort a playback run after this many milliseconds
    #[arg(long, env = "AUTOPILOT_RUN_TIMEOUT_MS")]
    run_timeout_ms: Option<u64>,

    /// Enable CORS for all origins
    #[arg(long)]
    cors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    info!("Starting autopilot-server v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn KeyValueStore> = match &args.store_dir {
        Some(dir) => {
            info!("Workflow store: {}", dir.display());
            Arc::new(FileStore::new(dir))
        }
        None => {
            info!("Workflow store: in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let library = WorkflowLibrary::new(store);

    let config = CoordinatorConfig {
        run_timeout_ms: args.run_timeout_ms,
        ..CoordinatorConfig::default()
    };

    let coordinator = match args.session {
        SessionKind::Memory => {
            let session: Arc<dyn BrowserSession> = Arc::new(MemorySession::new());
            PlaybackCoordinator::new(session, library, config)
        }
        SessionKind::Extension => {
            let bridge = ExtensionBridge::start(&args.bridge_addr).await?;
            info!("Extension bridge listening on ws://{}", bridge.local_addr());
            let session: Arc<dyn BrowserSession> = Arc::new(ExtensionSession::new(bridge.clone()));
            PlaybackCoordinator::new(session, library, config).with_interaction_source(bridge)
        }
    };

    let app = router(Arc::new(coordinator), args.cors);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Control channel: ws://{}/api/control", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
