use std::env;
use std::sync::Arc;

use alice_monitor::cache::UnifiedCache;
use alice_monitor::config::ConfigManager;
use alice_monitor::services::monitor::MonitoringService;
use alice_monitor::store::Store;
use alice_monitor::tasks::TaskRouter;
use alice_monitor::utils::prelude::*;
use alice_monitor::Session;

/// Default database location, overridable with `ALICE_DB_PATH`.
const DEFAULT_DB_PATH: &str = "./data/alice.db";

/// Everything the event loop needs a handle on.
pub struct Services {
    pub store: Arc<Store>,
    pub monitor: Arc<MonitoringService>,
}

/// Build the store, config, caches and the monitoring coordinator.
pub fn create_services(session: Arc<Session>) -> AnyResult<Services> {
    let db_path = env::var("ALICE_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let store =
        Arc::new(Store::open(&db_path).with_context(|| format!("Failed to open {db_path}"))?);

    let config = Arc::new(ConfigManager::load().context("Failed to load configuration")?);
    let cache = Arc::new(UnifiedCache::default());
    let router = Arc::new(TaskRouter::new());

    let monitor = MonitoringService::new(session, Arc::clone(&store), config, cache, router);

    Ok(Services { store, monitor })
}
