//! WebSocket chat broker server.
//!
//! Accepts WebSocket clients, authenticates them, and routes room messages,
//! presence and typing indicators between them.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin server
//! cargo run --bin server -- --host 0.0.0.0 --port 3000 --room general --room random
//! ```

use std::sync::Arc;

use clap::Parser;
use irori::{
    broker::{BrokerConfig, DevAuthValidator},
    common::logger::setup_logger,
    server::run_server,
};

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "WebSocket chat broker with rooms, presence and typing indicators", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// Default rooms created at startup (repeatable)
    #[arg(long = "room", default_values = ["general"])]
    rooms: Vec<String>,

    /// Per-room message history cap
    #[arg(long, default_value = "1000")]
    history_cap: usize,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "debug");

    let args = Args::parse();

    // Initialize dependencies in order:
    // 1. BrokerConfig
    // 2. AuthValidator
    // 3. Server (wires transport, broker and heartbeat internally)

    // 1. Broker configuration from CLI arguments
    let config = BrokerConfig {
        max_messages_per_room: args.history_cap,
        default_rooms: args.rooms,
        ..BrokerConfig::default()
    };

    // 2. Credential validator (development: any non-empty token passes)
    let auth = Arc::new(DevAuthValidator);

    // 3. Run the server
    if let Err(e) = run_server(args.host, args.port, config, auth).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
