use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::CopyRelationship;

use super::{RelationshipStore, StoreError};

/// Relationship store held in memory. Used by tests and single-node dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelationshipStore {
    relationships: Arc<RwLock<Vec<CopyRelationship>>>,
}

impl InMemoryRelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relationships(relationships: Vec<CopyRelationship>) -> Self {
        Self {
            relationships: Arc::new(RwLock::new(relationships)),
        }
    }

    pub async fn insert(&self, relationship: CopyRelationship) {
        self.relationships.write().await.push(relationship);
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> bool {
        let mut relationships = self.relationships.write().await;
        match relationships.iter_mut().find(|r| r.id == id) {
            Some(rel) => {
                rel.active = active;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let mut relationships = self.relationships.write().await;
        let before = relationships.len();
        relationships.retain(|r| r.id != id);
        relationships.len() != before
    }
}

#[async_trait]
impl RelationshipStore for InMemoryRelationshipStore {
    async fn list_active_by_master(&self, master_wallet: &str) -> Result<Vec<CopyRelationship>, StoreError> {
        let relationships = self.relationships.read().await;
        Ok(relationships
            .iter()
            .filter(|r| r.active && r.master_wallet == master_wallet)
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(relationship_id = %r.id, error = %e, "Skipping invalid copy relationship");
                    false
                }
            })
            .cloned()
            .collect())
    }

    async fn list_active_master_wallets(&self) -> Result<Vec<String>, StoreError> {
        let relationships = self.relationships.read().await;
        let wallets: BTreeSet<String> = relationships
            .iter()
            .filter(|r| r.active)
            .map(|r| r.master_wallet.clone())
            .collect();
        Ok(wallets.into_iter().collect())
    }
}
