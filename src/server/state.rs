use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::sync::Semaphore;

use crate::auth::JwtManager;
use crate::ipmi::OutOfBand;
use crate::webhook_dispatch::WebhookDispatcher;

/// Upper bound on concurrently running out-of-band power tasks.
const POWER_TASK_PERMITS: usize = 8;

#[derive(Clone)]
pub struct ServerConfig {
    pub enable_auth: bool,
    pub builder_url: Option<String>,
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<ServerConfig>,
    pub jwt: Arc<JwtManager>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub oob: Arc<dyn OutOfBand>,
    pub http: reqwest::Client,
    pub power_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        config: ServerConfig,
        jwt: JwtManager,
        oob: Arc<dyn OutOfBand>,
    ) -> Self {
        let dispatcher = Arc::new(WebhookDispatcher::new(db.clone()));
        Self {
            db,
            config: Arc::new(config),
            jwt: Arc::new(jwt),
            dispatcher,
            oob,
            http: reqwest::Client::new(),
            power_permits: Arc::new(Semaphore::new(POWER_TASK_PERMITS)),
        }
    }
}
