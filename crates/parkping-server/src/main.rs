//! # parkping-server
//!
//! Relay hub for vehicle contact codes.
//!
//! A stranger who scans a code on a parked vehicle can alert its owners and
//! chat with them without either side learning the other's phone number.
//! This binary provides:
//! - **WebSocket hub** (`/ws`) for owners, strangers and administrators
//! - **Alarm escalation** that keeps pushing owners until someone answers
//! - **Store-and-forward** delivery with push notifications for offline owners
//! - **Health endpoint** (`/health`) with live hub counters
//! - **Per-IP and per-connection rate limiting**

mod accounts;
mod alarm;
mod api;
mod channels;
mod config;
mod error;
mod hub;
mod presence;
mod push;
mod rate_limit;
mod session;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::{ServerConfig, DEV_ADMIN_SECRET};
use crate::hub::{spawn_hub, Hub};
use crate::push::{DisabledPush, HttpPushDispatcher, PushDispatcher};
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parkping_server=debug")),
        )
        .init();

    info!("Starting parkping hub v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.hub.admin_secret == DEV_ADMIN_SECRET {
        warn!("Running with the development administrator secret");
    }

    // -----------------------------------------------------------------------
    // 3. Push gateway
    // -----------------------------------------------------------------------
    let push: Arc<dyn PushDispatcher> = match &config.push_gateway_url {
        Some(url) => {
            info!(gateway = %url, "Push notifications enabled");
            Arc::new(HttpPushDispatcher::new(
                url,
                config.push_access_token.as_deref(),
            ))
        }
        None => {
            warn!("PUSH_GATEWAY_URL not set, push notifications disabled");
            Arc::new(DisabledPush)
        }
    };

    // -----------------------------------------------------------------------
    // 4. Hub task
    // -----------------------------------------------------------------------
    let (hub, pulses) = Hub::new(config.hub.clone(), push);
    let hub = spawn_hub(hub, pulses);

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        rate_limiter,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
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
