use std::sync::Arc;

use fogcoap::broker::{Broker, build_router};
use fogcoap::config::load_config;
use fogcoap::persistence::{SledStore, StorageAdapter};
use fogcoap::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init(&config.logging.level);

    let store = Arc::new(SledStore::open(&config.storage.path, &config.storage.database)?);
    let storage: Arc<dyn StorageAdapter> = store.clone();
    let router = build_router(&config, storage)?;
    info!(resources = router.len(), "resources registered");

    let broker = Arc::new(Broker::new(&config, router));

    let signals = Arc::clone(&broker);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                signals.request_stop();
            }
            Err(err) => error!(error = %err, "failed to listen for interrupt"),
        }
    });

    let outcome = broker.run().await;
    if let Err(err) = store.flush() {
        error!(error = %err, "failed to flush storage");
    }
    outcome?;
    Ok(())
}
