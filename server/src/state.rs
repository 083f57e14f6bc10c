use crate::db::{DbPool, Stores};
use crate::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Store collaborators over `db`
    pub stores: Stores,
    /// Live connections, presence and event fan-out
    pub hub: Hub,
    /// Messages per page for GET /api/messages
    pub history_page_size: u32,
}

impl AppState {
    /// Build the state and start the hub's dispatcher. Must run inside a
    /// tokio runtime.
    pub fn new(db: DbPool, hub_config: crate::config::HubConfig, history_page_size: u32) -> Self {
        let stores = Stores::sqlite(db.clone());
        let hub = Hub::start(stores.clone(), hub_config);
        Self {
            db,
            stores,
            hub,
            history_page_size: history_page_size.max(1),
        }
    }
}
