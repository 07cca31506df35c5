use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::schema::CompiledSchema;
use crate::services::cache::ExpiringCache;

/// How long a compiled schema stays cached between jobs.
const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves a schema id to its compiled form: prompt, target structure and
/// agent pipeline.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_and_compile_by_id(
        &self,
        schema_id: Uuid,
    ) -> Result<Arc<CompiledSchema>, SchemaError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema {0} not found")]
    NotFound(Uuid),

    #[error("Schema {id} definition is invalid: {source}")]
    Invalid {
        id: Uuid,
        source: serde_json::Error,
    },

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// The stored shape of a schema definition row.
#[derive(serde::Deserialize)]
struct SchemaDefinition {
    json_schema: serde_json::Value,
    prompt: String,
    #[serde(default)]
    examples: Vec<serde_json::Value>,
    #[serde(default)]
    agents: Vec<crate::models::schema::AgentDefinition>,
}

/// Postgres-backed schema provider with an expiring compiled-schema cache.
pub struct PgSchemaProvider {
    pool: PgPool,
    cache: Arc<ExpiringCache<Uuid, Arc<CompiledSchema>>>,
}

impl PgSchemaProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(ExpiringCache::new(SCHEMA_CACHE_TTL)),
        }
    }

    /// Start the cache's background sweep. Call once at startup.
    pub fn start_cache_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.cache.start_sweeper(Duration::from_secs(60))
    }
}

#[async_trait]
impl SchemaProvider for PgSchemaProvider {
    async fn get_and_compile_by_id(
        &self,
        schema_id: Uuid,
    ) -> Result<Arc<CompiledSchema>, SchemaError> {
        if let Some(schema) = self.cache.get(&schema_id) {
            return Ok(schema);
        }

        let row = sqlx::query(
            r#"
            SELECT id, name, definition
            FROM extraction_schemas
            WHERE id = $1
            "#,
        )
        .bind(schema_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SchemaError::NotFound(schema_id))?;

        let definition: serde_json::Value = row.try_get("definition")?;
        let parsed: SchemaDefinition = serde_json::from_value(definition)
            .map_err(|source| SchemaError::Invalid {
                id: schema_id,
                source,
            })?;

        let compiled = Arc::new(CompiledSchema {
            id: schema_id,
            name: row.try_get("name")?,
            json_schema: parsed.json_schema,
            prompt: parsed.prompt,
            examples: parsed.examples,
            agents: parsed.agents,
        });
        self.cache.insert(schema_id, Arc::clone(&compiled));
        Ok(compiled)
    }
}
