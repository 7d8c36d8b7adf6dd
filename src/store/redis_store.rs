use super::{ComplianceStatusSink, CredentialProvider, SessionCacheStore, StoreError};
use crate::session::{SessionCache, SessionCredentials};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Redis-backed collaborators.
///
/// - `delist:cred:{account}`    JSON `SessionCredentials`, written by the config owner
/// - `delist:session:{account}` JSON `SessionCache`
/// - `delist:status:{account}`  hash of product id → status
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        raw.map(|value| {
            serde_json::from_str(&value).map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                message: err.to_string(),
            })
        })
        .transpose()
    }
}

fn credentials_key(account_id: &str) -> String {
    format!("delist:cred:{account_id}")
}

fn session_key(account_id: &str) -> String {
    format!("delist:session:{account_id}")
}

fn status_key(account_id: &str) -> String {
    format!("delist:status:{account_id}")
}

#[async_trait]
impl CredentialProvider for RedisStore {
    async fn credentials(
        &self,
        account_id: &str,
    ) -> Result<Option<SessionCredentials>, StoreError> {
        self.get_json(&credentials_key(account_id)).await
    }
}

#[async_trait]
impl SessionCacheStore for RedisStore {
    async fn load(&self, account_id: &str) -> Result<Option<SessionCache>, StoreError> {
        self.get_json(&session_key(account_id)).await
    }

    async fn save(&self, account_id: &str, cache: &SessionCache) -> Result<(), StoreError> {
        let key = session_key(account_id);
        let json = serde_json::to_string(cache).map_err(|err| StoreError::Corrupt {
            key: key.clone(),
            message: err.to_string(),
        })?;
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(key, json)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

#[async_trait]
impl ComplianceStatusSink for RedisStore {
    async fn upsert_status(
        &self,
        account_id: &str,
        product_id: i64,
        status: i32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(status_key(account_id), product_id, status)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn statuses(
        &self,
        account_id: &str,
        product_ids: &[i64],
    ) -> Result<HashMap<i64, i32>, StoreError> {
        if product_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<i32>> = redis::cmd("HMGET")
            .arg(status_key(account_id))
            .arg(product_ids)
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(product_ids
            .iter()
            .zip(values)
            .filter_map(|(id, status)| status.map(|s| (*id, s)))
            .collect())
    }
}
