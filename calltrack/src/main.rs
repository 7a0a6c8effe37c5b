// calltrack - call-tracking sync and reminder daemon
// Entry point and engine setup

use anyhow::Context;
use calltrack::clock::SystemClock;
use calltrack::config::{DATABASE_FILE_NAME, DATA_DIR_ENV, DEFAULT_DATA_DIR};
use calltrack::database::{create_pool, SqliteStore};
use calltrack::services::{LogNotifier, SettingsService};
use calltrack::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calltrack=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting calltrack");

    let data_dir = std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    tracing::info!("Data directory: {:?}", data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    let pool = create_pool(&data_dir.join(DATABASE_FILE_NAME))
        .await
        .context("Failed to open database")?;

    let engine = Engine::new(
        Arc::new(SqliteStore::new(pool)),
        SettingsService::new(data_dir),
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
    );
    engine.start().await.context("Failed to start engine")?;

    let mut alerts = engine.subscribe_alerts();
    let mut blocked = engine.subscribe_access_blocked();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = alerts.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(log) = alerts.borrow_and_update().clone() {
                    tracing::info!(
                        "Callback due: {} ({}) at {:?}",
                        log.client_name,
                        log.client_phone.as_deref().unwrap_or("no phone"),
                        log.callback_time
                    );
                }
            }
            changed = blocked.changed() => {
                if changed.is_err() {
                    break;
                }
                if *blocked.borrow_and_update() {
                    tracing::error!("The store is refusing writes; check access rules");
                }
            }
        }
    }

    engine.shutdown();
    tracing::info!("calltrack stopped");
    Ok(())
}
