//! vpnctl-node — the VPN subscription control plane binary.
//!
//! Startup sequence:
//!   1. Load configuration from the environment
//!   2. Connect the database pool and run migrations
//!   3. Wire up the Peer Manager, Notifier, Points Engine, and Controller
//!   4. Spawn the two Time Workers (W1 expiry sweeper, W2 reminder scheduler)
//!   5. Serve the webhook/admin HTTP surface until shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vpnctl_controller::Controller;
use vpnctl_core::Settings;
use vpnctl_notify::{Notifier, TelegramNotifier};
use vpnctl_points::PointsEngine;
use vpnctl_store::Store;
use vpnctl_webhooks::WebhookState;
use vpnctl_wireguard::Gateway;

#[derive(Parser, Debug)]
#[command(
    name = "vpnctl-node",
    version,
    about = "VPN subscription control plane — webhooks, peer lifecycle, points & referrals"
)]
struct Args {
    /// HTTP address the webhook/admin surface binds to. Overrides `HTTP_BIND_ADDR`.
    #[arg(long)]
    http_bind_addr: Option<SocketAddr>,

    /// Run pending migrations and exit without starting the server.
    #[arg(long, default_value_t = false)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vpnctl=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let settings = Arc::new(Settings::load().context("loading configuration from environment")?);
    info!("vpnctl-node starting");

    // ── Storage ────────────────────────────────────────────────────────────
    let store = Arc::new(
        Store::connect(
            &settings.database_url(),
            settings.db_pool_min,
            settings.db_pool_max,
            settings.db_ip_alloc_lock_id,
        )
        .await
        .context("connecting to database")?,
    );
    store.migrate().await.context("running database migrations")?;
    info!("database migrated");

    if args.migrate_only {
        info!("migrate-only requested, exiting");
        return Ok(());
    }

    // ── Peer Manager / Notifier / Points Engine ───────────────────────────
    let gateway = Gateway::new(&settings);
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(settings.telegram_bot_token.clone()));
    let points = PointsEngine::new(Arc::clone(&store));

    // ── Controller ─────────────────────────────────────────────────────────
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        gateway.clone(),
        Arc::clone(&notifier),
        points,
        Arc::clone(&settings),
    ));

    // ── Time Workers ───────────────────────────────────────────────────────
    let expiry_handle = tokio::spawn(vpnctl_workers::run_expiry_worker(
        Arc::clone(&store),
        gateway.clone(),
        Duration::from_secs(settings.worker_expiry_interval_secs),
    ));
    let reminder_handle = tokio::spawn(vpnctl_workers::run_reminder_worker(
        Arc::clone(&store),
        Arc::clone(&notifier),
        Duration::from_secs(settings.worker_reminder_interval_secs),
        settings.worker_quiet_hours_start_utc,
        settings.worker_quiet_hours_end_utc,
    ));

    // ── HTTP surface ───────────────────────────────────────────────────────
    let webhook_state = Arc::new(WebhookState {
        controller,
        store: Arc::clone(&store),
        gateway,
    });
    let bind_addr: SocketAddr = args
        .http_bind_addr
        .map(Ok)
        .unwrap_or_else(|| {
            settings
                .http_bind_addr
                .parse()
                .with_context(|| format!("parsing HTTP_BIND_ADDR {}", settings.http_bind_addr))
        })?;

    info!("node ready");
    tokio::select! {
        result = vpnctl_webhooks::serve(webhook_state, bind_addr) => {
            result.context("webhook server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    expiry_handle.abort();
    reminder_handle.abort();
    Ok(())
}
