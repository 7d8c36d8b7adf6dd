use crate::config::{DelistConfig, PortalConfig};
use crate::dispatch::{actual_threads, aggregate, dedup_ids, run_pool};
use crate::models::BatchSummary;
use crate::portal::api::{ProductPageQuery, id_from_value};
use crate::portal::{PortalClient, PortalError, Transport};
use crate::session::{BootstrapError, Bootstrapper};
use crate::store::{
    ComplianceStatusSink, CredentialProvider, MemoryStore, RedisStore, SessionCacheStore,
    StoreError,
};
use crate::worker::DelistWorker;
use chrono::Utc;
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Failures that abort a whole request: a batch before any product is
/// dispatched, or a listing query.
#[derive(Debug, Error)]
pub enum DelistError {
    #[error("账号 {0} 未配置会话凭证")]
    MissingCredentials(String),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Portal(#[from] PortalError),
}

impl DelistError {
    pub fn stage(&self) -> &'static str {
        match self {
            DelistError::MissingCredentials(_) => "credentials",
            DelistError::Bootstrap(_) => "bootstrap",
            DelistError::Store(_) => "store",
            DelistError::Portal(_) => "portal",
        }
    }
}

/// Entry point for batch delisting and compliance-status marking.
#[derive(Clone)]
pub struct DelistService {
    credentials: Arc<dyn CredentialProvider>,
    sessions: Arc<dyn SessionCacheStore>,
    statuses: Arc<dyn ComplianceStatusSink>,
    transport: Transport,
    portal: Arc<PortalConfig>,
    config: Arc<DelistConfig>,
}

impl DelistService {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        sessions: Arc<dyn SessionCacheStore>,
        statuses: Arc<dyn ComplianceStatusSink>,
        portal: PortalConfig,
        config: DelistConfig,
    ) -> Self {
        Self {
            credentials,
            sessions,
            statuses,
            transport: Transport::new(&portal),
            portal: Arc::new(portal),
            config: Arc::new(config),
        }
    }

    pub fn with_memory(store: MemoryStore, portal: PortalConfig, config: DelistConfig) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store, portal, config)
    }

    /// Redis-backed when a client is given, otherwise a seeded in-memory store.
    pub fn from_env(redis: Option<redis::Client>) -> Self {
        let portal = PortalConfig::from_env();
        let config = DelistConfig::from_env();
        match redis {
            Some(client) => {
                info!(target = "delist.service", "using redis stores");
                let store = Arc::new(RedisStore::new(client));
                Self::new(store.clone(), store.clone(), store, portal, config)
            }
            None => {
                info!(target = "delist.service", "using in-memory stores");
                Self::with_memory(MemoryStore::from_env(), portal, config)
            }
        }
    }

    pub fn config(&self) -> &DelistConfig {
        &self.config
    }

    /// Delists `product_ids` for `account_id` over at most `max_threads`
    /// workers. Per-product failures land in the summary; only missing
    /// credentials and bootstrap failures abort the batch.
    pub async fn offline_products(
        &self,
        account_id: &str,
        product_ids: &[i64],
        max_threads: usize,
    ) -> Result<BatchSummary, DelistError> {
        let started = Instant::now();
        let portal = self.portal_for(account_id).await?;

        let ids = dedup_ids(product_ids);
        let actual = actual_threads(max_threads, ids.len());
        if actual == 0 {
            info!(
                target = "delist.service",
                account_id,
                requested = max_threads,
                products = ids.len(),
                "nothing_to_dispatch"
            );
            return Ok(aggregate(Vec::new(), max_threads, 0, None));
        }

        let session = Bootstrapper::new(self.config.bootstrap_retry, self.config.cache_ttl)
            .establish(account_id, self.sessions.as_ref(), &portal, Utc::now())
            .await?;
        crate::metrics::bootstrap(session.cache_used);
        info!(
            target = "delist.service",
            account_id,
            cache_used = session.cache_used,
            session_version = session.version,
            threads = actual,
            "session_ready"
        );

        let worker = DelistWorker::new(
            portal,
            Arc::new(session.handles.clone()),
            self.config.poll_retry,
        );
        let results = run_pool(&ids, actual, move |product_id| {
            let worker = worker.clone();
            async move { worker.run(product_id).await }
        })
        .await;

        let summary = aggregate(results, max_threads, actual, Some(&session));
        info!(
            target = "delist.service",
            account_id,
            total = summary.total(),
            success = summary.summary.success,
            failed = summary.summary.failed,
            threads = actual,
            cache_used = summary.cache_used,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch_completed"
        );
        Ok(summary)
    }

    /// Records one product's compliance status. `false` when the sink refused.
    pub async fn mark_product_status(&self, account_id: &str, product_id: i64, status: i32) -> bool {
        match self.statuses.upsert_status(account_id, product_id, status).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "delist.service",
                    account_id,
                    product_id,
                    status,
                    error = %err,
                    "mark_status_failed"
                );
                false
            }
        }
    }

    /// Marks every product the summary reports as delisted; returns how many
    /// were written.
    pub async fn mark_succeeded(&self, account_id: &str, summary: &BatchSummary, status: i32) -> usize {
        let mut marked = 0;
        for product_id in summary.succeeded_ids() {
            if self.mark_product_status(account_id, product_id, status).await {
                marked += 1;
            }
        }
        marked
    }

    pub async fn product_statuses(
        &self,
        account_id: &str,
        product_ids: &[i64],
    ) -> Result<HashMap<i64, i32>, DelistError> {
        Ok(self.statuses.statuses(account_id, product_ids).await?)
    }

    /// One page of goods flagged by compliance review, each annotated with
    /// `processed_status` from the status sink (0 when never marked).
    pub async fn compliance_list(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Value>, DelistError> {
        let portal = self.portal_for(account_id).await?;
        let mut items = portal.compliance_entries(page, page_size).await?;
        let ids: Vec<i64> = items.iter().filter_map(spu_id).collect();
        let statuses = self.statuses.statuses(account_id, &ids).await?;
        for item in &mut items {
            if let Some(id) = spu_id(item)
                && let Some(fields) = item.as_object_mut()
            {
                let status = statuses.get(&id).copied().unwrap_or(0);
                fields.insert("processed_status".into(), json!(status));
            }
        }
        info!(target = "delist.service", account_id, page, items = items.len(), "compliance_list_loaded");
        Ok(items)
    }

    pub async fn compliance_total(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<i64, DelistError> {
        let portal = self.portal_for(account_id).await?;
        Ok(portal.compliance_total(page, page_size).await?)
    }

    /// The seller's product listings, optionally filtered by id or name.
    pub async fn products(
        &self,
        account_id: &str,
        query: &ProductPageQuery,
    ) -> Result<Vec<Value>, DelistError> {
        let portal = self.portal_for(account_id).await?;
        Ok(portal.product_page(query).await?)
    }

    async fn portal_for(&self, account_id: &str) -> Result<PortalClient, DelistError> {
        let credentials = self
            .credentials
            .credentials(account_id)
            .await?
            .ok_or_else(|| DelistError::MissingCredentials(account_id.to_string()))?;
        Ok(PortalClient::new(
            self.transport.clone(),
            self.portal.clone(),
            Arc::new(credentials),
        ))
    }
}

fn spu_id(item: &Value) -> Option<i64> {
    item.get("spu_id")
        .and_then(id_from_value)
        .and_then(|id| id.parse().ok())
}
