pub mod memory;
pub mod relationship_repo;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::models::CopyRelationship;

pub use memory::InMemoryRelationshipStore;
pub use relationship_repo::{listen_for_changes, PgRelationshipStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read side of relationship persistence used by the replication engine.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Active, valid relationships following `master_wallet`.
    async fn list_active_by_master(&self, master_wallet: &str) -> Result<Vec<CopyRelationship>, StoreError>;

    /// Distinct master wallets with at least one active relationship.
    async fn list_active_master_wallets(&self) -> Result<Vec<String>, StoreError>;
}

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}
