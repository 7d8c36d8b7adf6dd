#![allow(non_snake_case)]

use crate::config::PortalConfig;
use crate::portal::transport::{Transport, TransportError};
use crate::session::SessionCredentials;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;

pub const SEND_MESSAGE_PATH: &str = "/bg/cute/api/merchantService/chat/sendMessage";
pub const QUERY_MESSAGE_PATH: &str = "/bg/cute/api/merchantService/chat/queryMessage";
pub const PRODUCT_INFO_PATH: &str =
    "/api/kiana/marvel-supplier/api/ultraman/chat/reception/queryProductSkcBasicInfo";
pub const PRECHECK_PATH: &str =
    "/api/kiana/marvel-supplier/api/ultraman/chat/reception/queryPreInterceptForToolSubmit";
pub const SELF_SERVICE_TOOLS_PATH: &str =
    "/api/kiana/marvel-supplier/api/ultraman/chat/reception/querySelfServiceTools";
pub const COMPLIANCE_LIST_PATH: &str = "/mms/tmod_punish/agent/merchant_appeal/entrance/list";
pub const PRODUCT_PAGE_PATH: &str = "/visage-agent-seller/product/skc/pageQuery";

pub const CONTENT_TYPE_TEXT: i64 = 1;
pub const CONTENT_TYPE_BUTTONS: i64 = 6;
pub const CONTENT_TYPE_TOOL_INVOCATION: i64 = 7;
pub const SENDER_SERVICE_BOT: i64 = 1001;
/// Older-than-anchor direction for message history queries.
pub const DIRECTION_BACKWARD: i64 = 2;
pub const HISTORY_LIMIT: i64 = 20;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("portal rejected request: {0}")]
    Rejected(String),
    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default, alias = "errorMsg", alias = "msg")]
    error_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "flexible_id")]
    pub msgId: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub contentType: Option<i64>,
    #[serde(default)]
    pub senderType: Option<i64>,
}

impl ChatMessage {
    pub fn is_bot_button_message(&self) -> bool {
        self.senderType == Some(SENDER_SERVICE_BOT) && self.contentType == Some(CONTENT_TYPE_BUTTONS)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductInfo {
    #[serde(default)]
    pub productName: Option<String>,
    #[serde(default)]
    pub productPicture: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrecheckResult {
    #[serde(default)]
    pub interceptCode: Option<i64>,
    #[serde(default)]
    pub interceptMsg: Option<String>,
}

impl PrecheckResult {
    pub fn allows_submit(&self) -> bool {
        self.interceptCode == Some(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfServiceTool {
    #[serde(default)]
    pub toolName: Option<String>,
    #[serde(default, deserialize_with = "flexible_id")]
    pub toolId: Option<String>,
}

/// Structured content of a tool-invocation chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub img: String,
    pub dataType: i64,
    pub dataId: String,
    pub toolId: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(default, deserialize_with = "flexible_id")]
    msgId: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messageList: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ToolPage {
    #[serde(default)]
    list: Vec<SelfServiceTool>,
}

/// Goods flagged by the marketplace's compliance review, one page at a time.
#[derive(Debug, Deserialize)]
struct ComplianceEntries {
    #[serde(default)]
    punish_appeal_entrance_list: Option<Vec<Value>>,
    #[serde(default)]
    total: Option<i64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductPageQuery {
    pub page: u32,
    pub pageSize: u32,
    pub productIds: Option<Vec<i64>>,
    pub productName: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    #[serde(default)]
    pageItems: Option<Vec<Value>>,
}

/// Portal endpoints bound to one account's credentials.
#[derive(Debug, Clone)]
pub struct PortalClient {
    transport: Transport,
    config: Arc<PortalConfig>,
    credentials: Arc<SessionCredentials>,
}

impl PortalClient {
    pub fn new(
        transport: Transport,
        config: Arc<PortalConfig>,
        credentials: Arc<SessionCredentials>,
    ) -> Self {
        Self {
            transport,
            config,
            credentials,
        }
    }

    /// Sends a plain text chat message and returns its message id.
    pub async fn send_text(&self, content: &str) -> Result<String, PortalError> {
        let payload = json!({
            "contentType": CONTENT_TYPE_TEXT,
            "content": content,
        });
        let sent: SentMessage = self.call(SEND_MESSAGE_PATH, &payload).await?;
        sent.msgId
            .ok_or_else(|| PortalError::Malformed("sendMessage returned no msgId".into()))
    }

    /// Sends a tool invocation anchored at `parent_msg_id`; the content goes
    /// over the wire as a JSON-encoded string.
    pub async fn send_tool_invocation(
        &self,
        parent_msg_id: &str,
        invocation: &ToolInvocation,
    ) -> Result<String, PortalError> {
        let content = serde_json::to_string(invocation)
            .map_err(|err| PortalError::Malformed(err.to_string()))?;
        let payload = json!({
            "parentMsgId": parent_msg_id,
            "contentType": CONTENT_TYPE_TOOL_INVOCATION,
            "content": content,
        });
        let sent: SentMessage = self.call(SEND_MESSAGE_PATH, &payload).await?;
        sent.msgId
            .ok_or_else(|| PortalError::Malformed("sendMessage returned no msgId".into()))
    }

    pub async fn query_messages(&self, anchor_msg_id: &str) -> Result<Vec<ChatMessage>, PortalError> {
        let payload = json!({
            "msgId": anchor_msg_id,
            "direction": DIRECTION_BACKWARD,
            "limit": HISTORY_LIMIT,
        });
        let page: MessagePage = self.call(QUERY_MESSAGE_PATH, &payload).await?;
        Ok(page.messageList)
    }

    pub async fn product_info(&self, product_id: i64) -> Result<ProductInfo, PortalError> {
        let payload = json!({ "productSkcId": product_id });
        self.call(PRODUCT_INFO_PATH, &payload).await
    }

    pub async fn precheck(
        &self,
        tool_handle: &str,
        product_id: i64,
    ) -> Result<PrecheckResult, PortalError> {
        let payload = json!({
            "toolId": tool_handle,
            "dataId": product_id.to_string(),
        });
        self.call(PRECHECK_PATH, &payload).await
    }

    pub async fn self_service_tools(&self) -> Result<Vec<SelfServiceTool>, PortalError> {
        let page: ToolPage = self.call(SELF_SERVICE_TOOLS_PATH, &json!({})).await?;
        Ok(page.list)
    }

    /// Raw compliance entries for goods; items stay untyped since the caller
    /// annotates and forwards them.
    pub async fn compliance_entries(&self, page: u32, page_size: u32) -> Result<Vec<Value>, PortalError> {
        let entries = self.compliance_page(page, page_size).await?;
        entries
            .punish_appeal_entrance_list
            .ok_or_else(|| PortalError::Malformed("missing punish_appeal_entrance_list".into()))
    }

    pub async fn compliance_total(&self, page: u32, page_size: u32) -> Result<i64, PortalError> {
        let entries = self.compliance_page(page, page_size).await?;
        entries
            .total
            .ok_or_else(|| PortalError::Malformed("missing total".into()))
    }

    async fn compliance_page(&self, page: u32, page_size: u32) -> Result<ComplianceEntries, PortalError> {
        let payload = json!({
            "page_num": page,
            "page_size": page_size,
            "target_type": "goods",
        });
        self.call(COMPLIANCE_LIST_PATH, &payload).await
    }

    pub async fn product_page(&self, query: &ProductPageQuery) -> Result<Vec<Value>, PortalError> {
        let payload =
            serde_json::to_value(query).map_err(|err| PortalError::Malformed(err.to_string()))?;
        let page: ProductPage = self.call(PRODUCT_PAGE_PATH, &payload).await?;
        page.pageItems
            .ok_or_else(|| PortalError::Malformed("missing pageItems".into()))
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, payload: &Value) -> Result<T, PortalError> {
        let url = self.config.url(path);
        let body = self.transport.post(&url, payload, &self.credentials).await?;
        unwrap_envelope(body)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(body: Value) -> Result<T, PortalError> {
    let envelope: Envelope =
        serde_json::from_value(body).map_err(|err| PortalError::Malformed(err.to_string()))?;
    if !envelope.success {
        return Err(PortalError::Rejected(
            envelope.error_msg.unwrap_or_else(|| "success=false".into()),
        ));
    }
    if envelope.result.is_null() {
        return Err(PortalError::Malformed("missing result".into()));
    }
    serde_json::from_value(envelope.result).map_err(|err| PortalError::Malformed(err.to_string()))
}

/// Portal ids arrive as JSON numbers or strings depending on the endpoint.
fn flexible_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| id_from_value(&v)))
}

pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
