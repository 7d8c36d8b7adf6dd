use crate::portal::{ChatMessage, PortalClient, PortalError};
use crate::retry::RetryPolicy;
use crate::store::SessionCacheStore;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Trigger phrase the service bot answers with the delisting tool button.
/// Also the catalog name of that tool.
pub const DELIST_TRIGGER: &str = "商品下架";

static TOOL_ID_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""toolId"\s*:\s*"?(\d+)"#).expect("static regex"));

/// Long-lived portal credentials for one seller account.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub cookie: String,
    pub mall_id: String,
}

impl SessionCredentials {
    pub fn new(cookie: impl Into<String>, mall_id: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            mall_id: mall_id.into(),
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("cookie", &"<redacted>")
            .field("mall_id", &self.mall_id)
            .finish()
    }
}

/// Cached bootstrap artifacts. Every successful rebuild overwrites the
/// record and bumps `version`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCache {
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub tool_handle: Option<String>,
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl SessionCache {
    /// Returns the cached handles iff every field is present and the record
    /// is younger than `ttl` at `now`.
    pub fn valid_handles(&self, now: DateTime<Utc>, ttl: Duration) -> Option<SessionHandles> {
        let parent_message_id = self.parent_message_id.as_deref().filter(|v| !v.is_empty())?;
        let tool_handle = self.tool_handle.as_deref().filter(|v| !v.is_empty())?;
        let cached_at = self.cached_at?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        if now.signed_duration_since(cached_at) >= ttl {
            return None;
        }
        Some(SessionHandles {
            parent_message_id: parent_message_id.to_string(),
            tool_handle: tool_handle.to_string(),
        })
    }

    pub fn rebuilt(previous: Option<&SessionCache>, handles: &SessionHandles, now: DateTime<Utc>) -> Self {
        Self {
            parent_message_id: Some(handles.parent_message_id.clone()),
            tool_handle: Some(handles.tool_handle.clone()),
            cached_at: Some(now),
            version: previous.map(|c| c.version).unwrap_or(0) + 1,
        }
    }
}

/// The pair every tool invocation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandles {
    pub parent_message_id: String,
    pub tool_handle: String,
}

#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub handles: SessionHandles,
    pub cache_used: bool,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("初始化下架对话失败: {0}")]
    Trigger(#[source] PortalError),
    #[error("无法获取下架所需的parentMsgId或toolId")]
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct Bootstrapper {
    retry: RetryPolicy,
    cache_ttl: Duration,
}

impl Bootstrapper {
    pub fn new(retry: RetryPolicy, cache_ttl: Duration) -> Self {
        Self { retry, cache_ttl }
    }

    /// Reads the cache once, rebuilds when it is unusable, and writes the
    /// fresh record back before returning. Runs before any worker starts.
    pub async fn establish(
        &self,
        account_id: &str,
        store: &dyn SessionCacheStore,
        portal: &PortalClient,
        now: DateTime<Utc>,
    ) -> Result<EstablishedSession, BootstrapError> {
        let cached = match store.load(account_id).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(target = "delist.session", account_id, error = %err, "session_cache_read_failed");
                None
            }
        };

        if let Some(cache) = cached.as_ref()
            && let Some(handles) = cache.valid_handles(now, self.cache_ttl)
        {
            debug!(target = "delist.session", account_id, version = cache.version, "session_cache_hit");
            return Ok(EstablishedSession {
                handles,
                cache_used: true,
                version: cache.version,
            });
        }

        let handles = self.rebuild(portal).await?;
        let record = SessionCache::rebuilt(cached.as_ref(), &handles, now);
        if let Err(err) = store.save(account_id, &record).await {
            warn!(target = "delist.session", account_id, error = %err, "session_cache_write_failed");
        }
        info!(
            target = "delist.session",
            account_id,
            version = record.version,
            tool_handle = %handles.tool_handle,
            "session_rebuilt"
        );
        Ok(EstablishedSession {
            handles,
            cache_used: false,
            version: record.version,
        })
    }

    /// Full bootstrap: trigger message, scan for the tool button, then fall
    /// back to the trigger id and the tool catalog.
    pub async fn rebuild(&self, portal: &PortalClient) -> Result<SessionHandles, BootstrapError> {
        let trigger_id = portal
            .send_text(DELIST_TRIGGER)
            .await
            .map_err(BootstrapError::Trigger)?;

        // Keep scanning until a button carries a numeric tool id; the latest
        // button seen still anchors the session if none ever does.
        let mut button_msg_id: Option<String> = None;
        let mut tool_handle: Option<String> = None;
        for attempt in self.retry.attempts() {
            match portal.query_messages(&trigger_id).await {
                Ok(messages) => {
                    match find_tool_button(&messages) {
                        Some((msg_id, Some(tool))) => {
                            button_msg_id = Some(msg_id);
                            tool_handle = Some(tool);
                            break;
                        }
                        Some((msg_id, None)) => {
                            debug!(target = "delist.session", attempt, msg_id = %msg_id, "tool_button_without_tool_id");
                            button_msg_id = Some(msg_id);
                        }
                        None => {
                            debug!(target = "delist.session", attempt, "tool_button_not_yet_visible");
                        }
                    }
                    if !self.retry.is_last(attempt) {
                        self.retry.pause().await;
                    }
                }
                Err(err) => {
                    warn!(target = "delist.session", attempt, error = %err, "bot_reply_query_failed");
                    if !self.retry.is_last(attempt) {
                        self.retry.pause_after_error().await;
                    }
                }
            }
        }

        let parent_message_id = match button_msg_id {
            Some(msg_id) => msg_id,
            None => {
                warn!(target = "delist.session", "tool_button_missing_using_trigger_anchor");
                trigger_id
            }
        };

        if tool_handle.is_none() {
            tool_handle = match portal.self_service_tools().await {
                Ok(tools) => tools
                    .into_iter()
                    .find(|tool| tool.toolName.as_deref() == Some(DELIST_TRIGGER))
                    .and_then(|tool| tool.toolId),
                Err(err) => {
                    warn!(target = "delist.session", error = %err, "tool_catalog_lookup_failed");
                    None
                }
            };
        }

        match tool_handle {
            Some(tool_handle) if !parent_message_id.is_empty() && !tool_handle.is_empty() => {
                Ok(SessionHandles {
                    parent_message_id,
                    tool_handle,
                })
            }
            _ => Err(BootstrapError::Unresolved),
        }
    }
}

/// Service-bot button message mentioning both `toolId` and `btnText`,
/// preferring one whose numeric tool id can be extracted. Yields its message
/// id and the tool id when present.
fn find_tool_button(messages: &[ChatMessage]) -> Option<(String, Option<String>)> {
    let mut buttons = messages.iter().filter_map(|msg| {
        if !msg.is_bot_button_message() {
            return None;
        }
        let content = msg.content.as_deref()?;
        if !(content.contains("toolId") && content.contains("btnText")) {
            return None;
        }
        let msg_id = msg.msgId.clone()?;
        Some((msg_id, extract_tool_id(content)))
    });
    let first = buttons.next()?;
    if first.1.is_some() {
        return Some(first);
    }
    Some(buttons.find(|(_, tool)| tool.is_some()).unwrap_or(first))
}

/// Pulls the numeric `toolId` field out of an opaque content blob.
pub fn extract_tool_id(content: &str) -> Option<String> {
    TOOL_ID_FIELD
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
