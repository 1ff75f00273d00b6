use crate::error::IngestError;
use crate::record::IngestedRecord;
use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;

/// Destination for validated records. Only the sink worker calls `insert`.
pub trait RecordSink: Send + Sync + 'static {
    fn insert(&self, record: &IngestedRecord) -> impl Future<Output = Result<(), IngestError>> + Send;
}

/// Document collection kept as a JSONB table in Postgres.
#[derive(Clone)]
pub struct DocumentStore {
    pool: PgPool,
    collection: String,
}

impl DocumentStore {
    /// Builds the pool without connecting; call [`DocumentStore::ping`] before use.
    pub fn connect_lazy(database_url: &str, max_connections: u32, collection: &str) -> Result<Self> {
        if !is_valid_collection_name(collection) {
            return Err(anyhow!(
                "collection name {collection:?} must be ASCII letters, digits or underscores"
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(database_url)
            .context("invalid document store connection string")?;
        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let select_one = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool);
        match tokio::time::timeout(timeout, select_one).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err).context("document store ping failed"),
            Err(_) => Err(anyhow!(
                "document store ping timed out after {}s",
                timeout.as_secs_f64()
            )),
        }
    }

    pub async fn ensure_collection(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {collection} (
                id text primary key,
                city text not null,
                ingested_at timestamptz not null,
                document jsonb not null
            )
            "#,
            collection = self.collection
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to ensure collection {}", self.collection))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl RecordSink for DocumentStore {
    async fn insert(&self, record: &IngestedRecord) -> Result<(), IngestError> {
        let document =
            serde_json::to_value(record).map_err(|err| IngestError::Sink(err.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (id, city, ingested_at, document) VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
            self.collection
        );
        let result = sqlx::query(&sql)
            .bind(record.document_id())
            .bind(&record.city)
            .bind(record.timestamp)
            .bind(SqlJson(document))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            tracing::warn!(site = %record.city, "document already stored; skipped duplicate");
        }
        Ok(())
    }
}

fn is_valid_collection_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
