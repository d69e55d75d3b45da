//! `flagchat-relay`: development chat server for Flag chat clients.
//!
//! An axum server providing the live endpoints (`/ws/chat/room`,
//! `/ws/chat/private`) and the history endpoints (`/api/chat/...`) the
//! client expects, with members configured by token.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000 with the demo members
//! cargo run --bin flagchat-relay
//!
//! # Run on custom address
//! cargo run --bin flagchat-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! RELAY_ADDR=127.0.0.1:8080 cargo run --bin flagchat-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use flagchat_relay::config::{RelayCliArgs, RelayConfig};
use flagchat_relay::relay::{self, RelayState};
use flagchat_relay::store::HistoryStore;

/// Close code sent to clients when the server shuts down.
const GOING_AWAY: u16 = 1001;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        members = config.members.len(),
        "starting flagchat relay"
    );

    let history = HistoryStore::with_cap(config.history_cap);
    let state = Arc::new(RelayState::with_config(config.members, history));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    state.close_all_connections(GOING_AWAY).await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
