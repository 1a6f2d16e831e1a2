//! # classlink-server
//!
//! Real-time communication core of the classlink platform.
//!
//! This binary provides:
//! - **WebSocket transport** carrying chat and call-signaling events
//!   between students and staff, authenticated at handshake
//! - **Presence tracking** with a durable online flag, reconciled on a
//!   fixed interval against live connections
//! - **Message pipeline** with offline queuing, read receipts and
//!   attachment resolution
//! - **Call signaling FSM** relaying WebRTC offers, answers and ICE
//!   candidates with compare-and-set lifecycle transitions
//! - **REST API** (axum) for health checks and read-only message/call
//!   history

mod api;
mod attachments;
mod auth;
mod calls;
mod config;
mod error;
mod pipeline;
mod presence;
mod registry;
mod roster;
mod topic;
mod ws;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use classlink_store::Database;

use crate::api::{AppState, SharedStore};
use crate::attachments::AttachmentStore;
use crate::auth::Authenticator;
use crate::calls::CallSignaling;
use crate::config::ServerConfig;
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::roster::RosterService;
use crate::topic::Topics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,classlink_server=debug")),
        )
        .init();

    info!("Starting classlink real-time server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = Arc::new(ServerConfig::from_env());
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the durable store
    // -----------------------------------------------------------------------
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store: SharedStore = Arc::new(Mutex::new(database));

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let topics = Topics::new();
    let registry = SessionRegistry::new(topics.clone(), config.join_attempts, config.join_backoff);
    let presence = PresenceTracker::new(store.clone(), registry.clone(), topics.clone());

    let attachments = Arc::new(
        AttachmentStore::new(
            config.attachment_path.clone(),
            config.max_attachment_bytes(),
            config.public_base_url.clone(),
        )
        .await?,
    );

    let roster = RosterService::new(store.clone(), topics.clone());
    let pipeline = Arc::new(MessagePipeline::new(
        store.clone(),
        topics.clone(),
        attachments.clone(),
        roster.clone(),
        config.clone(),
    ));
    let calls = Arc::new(CallSignaling::new(
        store.clone(),
        topics.clone(),
        registry.clone(),
    ));
    let authenticator = Authenticator::new(store.clone());

    let app_state = AppState {
        store,
        registry,
        presence: presence.clone(),
        pipeline,
        calls,
        roster,
        attachments,
        authenticator,
        config: config.clone(),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic presence sweep: reconciles durable flags left stale by a
    // crash-without-disconnect and rebroadcasts the online set, covering
    // event broadcasts lost to connect/disconnect races.  The first tick
    // fires immediately, repairing flags from a previous run at startup.
    let sweep_interval = config.presence_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            presence.sweep_once().await;
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
