//! Collaborator seams: credential lookup, session-cache persistence and the
//! compliance-status sink. Both backends implement all three.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::session::{SessionCache, SessionCredentials};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record at `{key}`: {message}")]
    Corrupt { key: String, message: String },
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, account_id: &str)
    -> Result<Option<SessionCredentials>, StoreError>;
}

#[async_trait]
pub trait SessionCacheStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<SessionCache>, StoreError>;
    async fn save(&self, account_id: &str, cache: &SessionCache) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ComplianceStatusSink: Send + Sync {
    async fn upsert_status(
        &self,
        account_id: &str,
        product_id: i64,
        status: i32,
    ) -> Result<(), StoreError>;

    /// Statuses recorded for `product_ids`; ids never marked are absent.
    async fn statuses(
        &self,
        account_id: &str,
        product_ids: &[i64],
    ) -> Result<HashMap<i64, i32>, StoreError>;
}

/// Parses `account|mall_id|cookie` entries. Cookies carry their own `;`,
/// so entries are split on `;;` when present, otherwise on newlines.
pub fn parse_credential_seed(raw: &str) -> Vec<(String, SessionCredentials)> {
    let separator = if raw.contains(";;") { ";;" } else { "\n" };
    raw.split(separator)
        .filter_map(|entry| {
            let mut parts = entry.trim().splitn(3, '|');
            let account = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
            let mall_id = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
            let cookie = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
            Some((account.to_string(), SessionCredentials::new(cookie, mall_id)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_seed_keeps_cookie_semicolons() {
        let raw = "shop-a|6344|api_uid=x; SUB_PASS_ID=y;;shop-b|7788|api_uid=z";
        let parsed = parse_credential_seed(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "shop-a");
        assert_eq!(parsed[0].1.mall_id, "6344");
        assert_eq!(parsed[0].1.cookie, "api_uid=x; SUB_PASS_ID=y");
        assert_eq!(parsed[1].0, "shop-b");
    }

    #[test]
    fn credential_seed_skips_malformed_entries() {
        let raw = "shop-a|6344|c=1\nbroken|only-two\n\n";
        let parsed = parse_credential_seed(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "shop-a");
    }
}
