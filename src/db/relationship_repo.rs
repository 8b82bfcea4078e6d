use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::models::{CopyRelationship, RelationshipError, SizingRule};

use super::{RelationshipStore, StoreError};

pub const CHANGE_CHANNEL: &str = "copy_relationships_changed";

#[derive(Debug, Clone, FromRow)]
pub struct RelationshipRow {
    pub id: Uuid,
    pub copier_wallet: String,
    pub master_wallet: String,
    pub encrypted_credential: String,
    pub sizing_method: String,
    pub sizing_value: Decimal,
    pub max_position_usd: Option<Decimal>,
    pub symbol_filter: Vec<String>,
    pub max_leverage: Option<i32>,
    pub max_total_exposure: Option<Decimal>,
    pub symbol_multipliers: Json<HashMap<String, Decimal>>,
    pub is_active: bool,
}

impl RelationshipRow {
    pub fn into_relationship(self) -> Result<CopyRelationship, RelationshipError> {
        let sizing = SizingRule::from_parts(&self.sizing_method, self.sizing_value)?;
        let max_leverage = match self.max_leverage {
            Some(lev) => Some(u32::try_from(lev).map_err(|_| RelationshipError::LeverageOutOfRange(lev as i64))?),
            None => None,
        };

        let rel = CopyRelationship {
            id: self.id,
            copier_wallet: self.copier_wallet,
            master_wallet: self.master_wallet,
            encrypted_credential: self.encrypted_credential,
            sizing,
            max_position_usd: self.max_position_usd,
            symbol_filter: self.symbol_filter,
            max_leverage,
            max_total_exposure: self.max_total_exposure,
            symbol_multipliers: self.symbol_multipliers.0,
            active: self.is_active,
        };
        rel.validate()?;
        Ok(rel)
    }
}

/// PostgreSQL-backed relationship store.
#[derive(Debug, Clone)]
pub struct PgRelationshipStore {
    pool: PgPool,
}

impl PgRelationshipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationshipStore for PgRelationshipStore {
    async fn list_active_by_master(&self, master_wallet: &str) -> Result<Vec<CopyRelationship>, StoreError> {
        let rows = sqlx::query_as::<_, RelationshipRow>(
            r#"
            SELECT id, copier_wallet, master_wallet, encrypted_credential,
                   sizing_method, sizing_value, max_position_usd, symbol_filter,
                   max_leverage, max_total_exposure, symbol_multipliers, is_active
            FROM copy_relationships
            WHERE master_wallet = $1 AND is_active = true
            ORDER BY created_at
            "#,
        )
        .bind(master_wallet)
        .fetch_all(&self.pool)
        .await?;

        let relationships = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match row.into_relationship() {
                    Ok(rel) => Some(rel),
                    Err(e) => {
                        tracing::warn!(relationship_id = %id, error = %e, "Skipping invalid copy relationship");
                        None
                    }
                }
            })
            .collect();

        Ok(relationships)
    }

    async fn list_active_master_wallets(&self) -> Result<Vec<String>, StoreError> {
        let wallets: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT master_wallet FROM copy_relationships WHERE is_active = true ORDER BY master_wallet",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(wallets)
    }
}

/// Fire `trigger` on every `copy_relationships_changed` notification until
/// shutdown.
pub async fn listen_for_changes(
    pool: PgPool,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StoreError> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    tracing::info!(channel = CHANGE_CHANNEL, "Listening for relationship changes");

    loop {
        tokio::select! {
            notification = listener.recv() => match notification {
                Ok(n) => {
                    tracing::debug!(master = n.payload(), "Relationship change notification");
                    trigger.notify_one();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Relationship listener error — retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    Ok(())
}
