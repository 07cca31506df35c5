use sqlx::PgPool;
use std::sync::Arc;

use crate::db::Persistence;
use crate::services::{
    orchestrator::Orchestrator, queue::MatchQueue, schema::SchemaProvider, storage::ObjectStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub persistence: Arc<dyn Persistence>,
    pub storage: Arc<dyn ObjectStore>,
    pub queue: Arc<MatchQueue>,
    pub schemas: Arc<dyn SchemaProvider>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        persistence: Arc<dyn Persistence>,
        storage: Arc<dyn ObjectStore>,
        queue: Arc<MatchQueue>,
        schemas: Arc<dyn SchemaProvider>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            db,
            persistence,
            storage,
            queue,
            schemas,
            orchestrator,
        }
    }
}
