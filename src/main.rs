use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use driftwood_client_core::config::EngineConfig;
use driftwood_client_core::protocol::{InboundEvent, ServerCommand, ServerInfo};
use driftwood_client_core::session::{
    ConnectionState, EngineHandler, FatalError, ProtocolEngine,
};
use driftwood_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use driftwood_client_core::transport::websocket::{WebSocketConfig, WebSocketFactory};

#[derive(Parser, Debug)]
#[command(name = "driftwood")]
struct Cli {
    /// Base server URL, e.g. https://office.example.com
    #[arg(long, env = "DRIFTWOOD_SERVER")]
    server: String,

    /// Storage URL of the document to open
    doc: String,

    #[arg(long, env = "DRIFTWOOD_LOG_LEVEL", default_value = "warn")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

/// Minimal handler: prints every decoded message. Useful for watching a
/// document session from a terminal.
struct PrintHandler {
    ready: bool,
}

impl EngineHandler for PrintHandler {
    fn on_decoded(&mut self, event: &InboundEvent, _command: &ServerCommand) -> Result<()> {
        println!("{}", event.text_msg);
        Ok(())
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        eprintln!("connection: {state:?}");
        self.ready = state == ConnectionState::Connected;
    }

    fn on_fatal_error(&mut self, error: &FatalError) {
        eprintln!("fatal: {error}");
    }

    fn ready_for_dispatch(&self) -> bool {
        self.ready
    }

    fn on_server_info(&mut self, info: &ServerInfo) {
        eprintln!("server: {} {}", info.id, info.version);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let factory = Arc::new(WebSocketFactory::new(WebSocketConfig {
        server: cli.server.clone(),
        doc_url: cli.doc.clone(),
        doc_params: Vec::new(),
    }));
    let config = EngineConfig::for_document(&cli.doc);
    let handler = PrintHandler { ready: false };

    let (handle, task) = ProtocolEngine::spawn(config, factory, handler);

    tokio::signal::ctrl_c().await?;
    handle.close();
    let _ = task.await;
    Ok(())
}
