use super::{
    ComplianceStatusSink, CredentialProvider, SessionCacheStore, StoreError,
    parse_credential_seed,
};
use crate::session::{SessionCache, SessionCredentials};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

/// Process-local backend for single-node runs and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    credentials: Arc<Mutex<HashMap<String, SessionCredentials>>>,
    sessions: Arc<Mutex<HashMap<String, SessionCache>>>,
    statuses: Arc<Mutex<HashMap<(String, i64), i32>>>,
}

impl MemoryStore {
    /// Seeds credentials from `DELIST_CREDENTIALS`.
    pub fn from_env() -> Self {
        let seeded: HashMap<_, _> = std::env::var("DELIST_CREDENTIALS")
            .map(|raw| parse_credential_seed(&raw).into_iter().collect())
            .unwrap_or_default();
        info!(target = "delist.store", accounts = seeded.len(), "seeded in-memory credentials");
        Self {
            credentials: Arc::new(Mutex::new(seeded)),
            ..Self::default()
        }
    }

    pub async fn insert_credentials(&self, account_id: &str, credentials: SessionCredentials) {
        self.credentials
            .lock()
            .await
            .insert(account_id.to_string(), credentials);
    }
}

#[async_trait]
impl CredentialProvider for MemoryStore {
    async fn credentials(
        &self,
        account_id: &str,
    ) -> Result<Option<SessionCredentials>, StoreError> {
        Ok(self.credentials.lock().await.get(account_id).cloned())
    }
}

#[async_trait]
impl SessionCacheStore for MemoryStore {
    async fn load(&self, account_id: &str) -> Result<Option<SessionCache>, StoreError> {
        Ok(self.sessions.lock().await.get(account_id).cloned())
    }

    async fn save(&self, account_id: &str, cache: &SessionCache) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .insert(account_id.to_string(), cache.clone());
        Ok(())
    }
}

#[async_trait]
impl ComplianceStatusSink for MemoryStore {
    async fn upsert_status(
        &self,
        account_id: &str,
        product_id: i64,
        status: i32,
    ) -> Result<(), StoreError> {
        self.statuses
            .lock()
            .await
            .insert((account_id.to_string(), product_id), status);
        Ok(())
    }

    async fn statuses(
        &self,
        account_id: &str,
        product_ids: &[i64],
    ) -> Result<HashMap<i64, i32>, StoreError> {
        let guard = self.statuses.lock().await;
        Ok(product_ids
            .iter()
            .filter_map(|id| {
                guard
                    .get(&(account_id.to_string(), *id))
                    .map(|status| (*id, *status))
            })
            .collect())
    }
}
