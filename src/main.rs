//! fleetd: a daemon that polls/subscribes to a mixed fleet of 3D printers,
//! hands out pending print orders, and runs post-print ejection routines
//! unattended (§1-2).
//!
//! The HTTP/WebSocket surface a UI would talk to is out of scope (§1); this
//! binary only runs the core loops and logs `status_update` events via
//! [`broadcaster::LogBroadcaster`].

mod broadcaster;
mod codec;
mod config;
mod distributor;
mod drivers;
mod ejection;
mod error;
mod fixtures;
mod model;
mod reconciler;
mod store;

use anyhow::{Context, Result};
use broadcaster::{Broadcaster, LogBroadcaster};
use clap::Parser;
use codec::CredentialCodec;
use config::{
    CONNECTION_MAINTENANCE_INTERVAL, CONNECTION_STALE_AFTER, DEDUP_INTERVAL, STATUS_REFRESH_INTERVAL,
    VENDOR_A_WATCHDOG_INTERVAL,
};
use distributor::Distributor;
use drivers::vendor_a::VendorADriver;
use drivers::vendor_b::VendorBManager;
use ejection::EjectionManager;
use futures::FutureExt;
use reconciler::Reconciler;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use store::FleetStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(about = "Fans print orders out across a mixed fleet of network 3D printers")]
#[command(version)]
struct Args {
    /// Path to the config file (defaults to ~/.config/fleetd/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against a pre-populated demo fleet instead of real printer credentials.
    #[arg(long)]
    demo: bool,

    /// Override the config's data directory (where printers.json etc. live).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Force-clear a stuck ejection lock for the named printer, then exit
    /// without starting the daemon loops (§4.6.3 sweep, manual escape hatch).
    #[arg(long, value_name = "PRINTER_NAME")]
    reset_lock: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config_path = match &args.config {
        Some(p) => p.clone(),
        None => config::Config::default_path().context("failed to determine config path")?,
    };
    let mut cfg = config::Config::load(&config_path).context("failed to load config")?;
    if let Some(data_dir) = &args.data_dir {
        cfg.data_dir = data_dir.clone();
    }

    if let Some(printer_name) = &args.reset_lock {
        let codec = CredentialCodec::load_or_create(&cfg.data_dir).context("failed to load credential codec")?;
        let store = Arc::new(FleetStore::load(&cfg.data_dir).context("failed to load fleet store")?);
        let vendor_a = Arc::new(VendorADriver::new());
        let vendor_b = Arc::new(VendorBManager::new());
        let distribute = Arc::new(Notify::new());
        let ejection_manager = EjectionManager::new(store, vendor_a, vendor_b, Arc::new(codec), distribute);
        ejection_manager.force_release_lock(printer_name).await?;
        log::info!("ejection lock for '{printer_name}' cleared");
        return Ok(());
    }

    if args.demo {
        cfg.data_dir = std::env::temp_dir().join(format!("fleetd-demo-{}", std::process::id()));
        std::fs::create_dir_all(&cfg.data_dir).context("failed to create demo data directory")?;
        fixtures::seed_demo_store(&cfg.data_dir).context("failed to seed demo fixtures")?;
        log::info!("running in demo mode; data dir {:?}", cfg.data_dir);
    } else {
        cfg.save(&config_path).context("failed to save config")?;
    }

    let codec = Arc::new(CredentialCodec::load_or_create(&cfg.data_dir).context("failed to load credential codec")?);
    let store = Arc::new(FleetStore::load(&cfg.data_dir).context("failed to load fleet store")?);
    let vendor_a = Arc::new(VendorADriver::new());
    let vendor_b = Arc::new(VendorBManager::new());
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(LogBroadcaster);

    let distribute = Arc::new(Notify::new());
    let ejection_manager = Arc::new(EjectionManager::new(
        Arc::clone(&store),
        Arc::clone(&vendor_a),
        Arc::clone(&vendor_b),
        Arc::clone(&codec),
        Arc::clone(&distribute),
    ));
    let distributor = Arc::new(Distributor::new(
        Arc::clone(&store),
        Arc::clone(&vendor_a),
        Arc::clone(&vendor_b),
        Arc::clone(&codec),
    ));
    let reconciler = Arc::new(Reconciler::new());

    if !args.demo {
        connect_vendor_b_sessions(&store, &vendor_b, &codec).await;
    } else {
        log::info!("demo mode: skipping Vendor-B MQTT connections");
    }

    let reconciler_task = {
        let store = Arc::clone(&store);
        let reconciler = Arc::clone(&reconciler);
        let vendor_a = Arc::clone(&vendor_a);
        let vendor_b = Arc::clone(&vendor_b);
        let codec = Arc::clone(&codec);
        let ejection_manager = Arc::clone(&ejection_manager);
        let broadcaster = Arc::clone(&broadcaster);
        let distribute = Arc::clone(&distribute);
        spawn_supervised("reconciler", async move {
            let mut ticker = tokio::time::interval(STATUS_REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = reconciler::run_tick(
                    &store,
                    &reconciler,
                    &vendor_a,
                    &vendor_b,
                    &codec,
                    &ejection_manager,
                    broadcaster.as_ref(),
                )
                .await
                {
                    log::error!("reconcile tick failed: {e}");
                }
                if let Err(e) = ejection_manager.trigger_mass_ejection_for_finished_printers().await {
                    log::warn!("mass ejection resume check failed: {e}");
                }
                distribute.notify_one();
            }
        })
    };

    let distributor_task = {
        let distributor = Arc::clone(&distributor);
        let broadcaster = Arc::clone(&broadcaster);
        let distribute = Arc::clone(&distribute);
        spawn_supervised("distributor", async move {
            loop {
                distribute.notified().await;
                if let Err(e) = distributor.run_pass(broadcaster.as_ref()).await {
                    log::error!("distribution pass failed: {e}");
                }
            }
        })
    };
    distribute.notify_one(); // run one pass at startup without waiting a full tick

    let dedup_task = {
        let store = Arc::clone(&store);
        spawn_supervised("dedup", async move {
            let mut ticker = tokio::time::interval(DEDUP_INTERVAL);
            ticker.tick().await; // load() already deduped; skip the immediate first fire
            loop {
                ticker.tick().await;
                if let Err(e) = store.deduplicate().await {
                    log::warn!("periodic dedup failed: {e}");
                }
            }
        })
    };

    let watchdog_task = {
        let ejection_manager = Arc::clone(&ejection_manager);
        spawn_supervised("vendor-a-ejection-watchdog", async move {
            let mut ticker = tokio::time::interval(VENDOR_A_WATCHDOG_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = ejection_manager.completion_pass().await {
                    log::warn!("vendor A ejection watchdog pass failed: {e}");
                }
            }
        })
    };

    let maintenance_task = if args.demo {
        None
    } else {
        let store = Arc::clone(&store);
        let vendor_b = Arc::clone(&vendor_b);
        let codec = Arc::clone(&codec);
        Some(spawn_supervised("connection-maintenance", async move {
            let mut ticker = tokio::time::interval(CONNECTION_MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                connect_vendor_b_sessions(&store, &vendor_b, &codec).await;
                for name in vendor_b.printer_names().await {
                    if let Some(session) = vendor_b.get(&name).await {
                        if session.is_stale(CONNECTION_STALE_AFTER).await {
                            log::warn!("Vendor-B session for {name} has been stale for over {CONNECTION_STALE_AFTER:?}");
                        }
                    }
                }
            }
        }))
    };

    shutdown_signal().await;
    log::info!("shutdown signal received, disconnecting Vendor-B sessions");

    reconciler_task.abort();
    distributor_task.abort();
    dedup_task.abort();
    watchdog_task.abort();
    if let Some(task) = maintenance_task {
        task.abort();
    }

    for name in vendor_b.printer_names().await {
        if let Some(session) = vendor_b.get(&name).await {
            session.disconnect().await;
        }
    }

    Ok(())
}

/// Spawns a background task whose panics are caught and logged instead of
/// taking down the runtime (§7: "no error ever aborts the process"). The
/// loop inside `fut` still stops if it panics once — this only prevents the
/// panic from propagating past the task boundary.
fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(payload) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic payload>".to_string());
            log::error!("background task '{name}' panicked: {msg}");
        }
    })
}

/// Connects a Vendor-B MQTT session for every printer that doesn't already
/// have one, decrypting each printer's access code from a snapshot taken
/// before the connect attempts (§4.4).
async fn connect_vendor_b_sessions(store: &FleetStore, vendor_b: &VendorBManager, codec: &CredentialCodec) {
    let printers = match store.read_printers().await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("could not read printers to establish Vendor-B sessions: {e}");
            return;
        }
    };
    let access_codes: HashMap<String, Option<String>> =
        printers.iter().map(|p| (p.name.clone(), p.access_code.clone())).collect();

    vendor_b
        .ensure_sessions(store, |name| {
            access_codes.get(name).and_then(|enc| enc.as_ref()).and_then(|enc| codec.decrypt(enc))
        })
        .await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
