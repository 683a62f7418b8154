//! rbmcd entry point.

use anyhow::Result;
use rbmc_common::store::Store;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rbmcd::interface::RedundancyInterface;
use rbmcd::manager::Manager;
use rbmcd::providers::Providers;
use rbmcd::server;
use rbmcd::services::ServicesImpl;
use rbmcd::shutdown::Shutdown;
use rbmcd::sibling::SiblingImpl;
use rbmcd::sync_interface::SyncInterfaceImpl;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rbmcd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Redundant BMC manager v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let store = Store::new();

    let interface = Arc::new(RedundancyInterface::new(store.clone()));

    let providers = Providers {
        sibling: Arc::new(SiblingImpl::new(shutdown.clone())),
        services: Arc::new(ServicesImpl::new(shutdown.clone())),
        sync: Arc::new(SyncInterfaceImpl::new(shutdown.clone())),
    };

    let manager = Manager::new(
        providers,
        Arc::clone(&interface),
        store,
        shutdown.clone(),
    );

    tokio::spawn(Arc::clone(&manager).startup());

    let mut sigterm = signal(SignalKind::terminate())?;
    let stop_on_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Stop requested");
        stop_on_signal.trigger();
    });

    server::serve(manager, interface, shutdown).await
}
