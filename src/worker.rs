use crate::models::{FailureKind, OutcomeDetails, OutcomeState, ProductOutcome};
use crate::portal::{ChatMessage, PortalClient, ToolInvocation};
use crate::retry::RetryPolicy;
use crate::session::SessionHandles;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MARKER_DELISTED: &str = "已下架";
pub const MARKER_ALREADY_PROCESSED: &str = "已在您的上次咨询后处理成功";
pub const MARKER_REFUSED: &str = "暂时无法操作下架";
pub const POLL_TIMEOUT_MESSAGE: &str = "查询下架结果超时";
const REPLY_GREETING: &str = "您好";
const PLACEHOLDER_NAME: &str = "商品名称";
const PLACEHOLDER_IMG: &str = "商品图片";

/// A pipeline step that could not complete for one product. Confined to
/// that product's outcome.
#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: FailureKind,
}

impl PipelineError {
    pub fn refused(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FailureKind::Refused,
        }
    }

    pub fn unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FailureKind::Unavailable,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// How a matched bot reply reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    Delisted,
    AlreadyProcessed,
    Refused,
    Unrecognized,
}

impl ReplyVerdict {
    pub fn state(self) -> OutcomeState {
        match self {
            ReplyVerdict::Delisted | ReplyVerdict::AlreadyProcessed => OutcomeState::Success,
            ReplyVerdict::Refused | ReplyVerdict::Unrecognized => OutcomeState::Failed,
        }
    }
}

pub fn classify_reply(text: &str) -> ReplyVerdict {
    if text.contains(MARKER_DELISTED) {
        ReplyVerdict::Delisted
    } else if text.contains(MARKER_ALREADY_PROCESSED) {
        ReplyVerdict::AlreadyProcessed
    } else if text.contains(MARKER_REFUSED) {
        ReplyVerdict::Refused
    } else {
        ReplyVerdict::Unrecognized
    }
}

/// The bot reply about `product_id`, if the history holds one.
pub fn find_product_reply(messages: &[ChatMessage], product_id: i64) -> Option<&str> {
    let markers = [
        format!("SKC ID：{product_id}"),
        format!("SKC ID:{product_id}"),
        format!("【SKC ID：{product_id}】"),
    ];
    messages
        .iter()
        .filter_map(|msg| msg.content.as_deref())
        .filter(|content| content.contains(REPLY_GREETING))
        .find(|content| markers.iter().any(|marker| mentions(content, marker)))
}

/// `marker` occurs in `content` and is not the prefix of a longer id.
fn mentions(content: &str, marker: &str) -> bool {
    content.match_indices(marker).any(|(at, _)| {
        !content[at + marker.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Runs `QueryInfo → Precheck → Submit → Poll` for single products against
/// an established session.
#[derive(Debug, Clone)]
pub struct DelistWorker {
    portal: PortalClient,
    handles: Arc<SessionHandles>,
    poll: RetryPolicy,
}

impl DelistWorker {
    pub fn new(portal: PortalClient, handles: Arc<SessionHandles>, poll: RetryPolicy) -> Self {
        Self {
            portal,
            handles,
            poll,
        }
    }

    /// Always yields an outcome; stage failures become `Failed` outcomes.
    pub async fn run(&self, product_id: i64) -> ProductOutcome {
        let mut details = OutcomeDetails::default();
        let outcome = match self.pipeline(product_id, &mut details).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    target = "delist.worker",
                    product_id,
                    stage = err.stage(),
                    kind = ?err.kind(),
                    error = %err,
                    "delist_pipeline_failed"
                );
                crate::metrics::pipeline_failure(err.stage(), err.kind());
                ProductOutcome {
                    failed_stage: Some(err.stage().to_string()),
                    failure_kind: Some(err.kind()),
                    ..ProductOutcome::new(product_id, OutcomeState::Failed, err.detail())
                }
            }
        };
        crate::metrics::outcome(outcome.state);
        ProductOutcome { details, ..outcome }
    }

    async fn pipeline(
        &self,
        product_id: i64,
        details: &mut OutcomeDetails,
    ) -> Result<ProductOutcome, PipelineError> {
        let info = capture_stage("query_info", async {
            self.portal
                .product_info(product_id)
                .await
                .map_err(|err| PipelineError::unavailable("query_info", format!("查询商品信息失败: {err}")))
        })
        .await?;
        details.product_name = info.productName.clone();
        details.product_img = info.productPicture.clone();

        let precheck = capture_stage("precheck", async {
            self.portal
                .precheck(&self.handles.tool_handle, product_id)
                .await
                .map_err(|err| PipelineError::unavailable("precheck", format!("预检查失败: {err}")))
        })
        .await?;
        if !precheck.allows_submit() {
            let reason = precheck
                .interceptMsg
                .filter(|msg| !msg.is_empty())
                .unwrap_or_else(|| "未知错误".to_string());
            return Err(PipelineError::refused("precheck", format!("无法下架：{reason}")));
        }

        let invocation = ToolInvocation {
            name: info.productName.unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
            img: info.productPicture.unwrap_or_else(|| PLACEHOLDER_IMG.to_string()),
            dataType: 1,
            dataId: product_id.to_string(),
            toolId: self.handles.tool_handle.clone(),
        };
        let offline_msg_id = capture_stage("submit", async {
            self.portal
                .send_tool_invocation(&self.handles.parent_message_id, &invocation)
                .await
                .map_err(|err| PipelineError::unavailable("submit", format!("发送下架请求失败: {err}")))
        })
        .await?;
        details.offline_msg_id = Some(offline_msg_id.clone());

        let started = Instant::now();
        let outcome = self.poll(product_id, &offline_msg_id, details).await;
        crate::metrics::stage_elapsed("poll", started.elapsed().as_millis());
        Ok(outcome)
    }

    async fn poll(
        &self,
        product_id: i64,
        offline_msg_id: &str,
        details: &mut OutcomeDetails,
    ) -> ProductOutcome {
        for attempt in self.poll.attempts() {
            self.poll.pause().await;
            details.retry_count = attempt;
            let messages = match self.portal.query_messages(offline_msg_id).await {
                Ok(messages) => messages,
                Err(err) => {
                    debug!(target = "delist.worker", product_id, attempt, error = %err, "poll_query_failed");
                    continue;
                }
            };
            if let Some(reply) = find_product_reply(&messages, product_id) {
                let verdict = classify_reply(reply);
                info!(target = "delist.worker", product_id, attempt, ?verdict, "delist_reply_matched");
                return ProductOutcome::new(product_id, verdict.state(), reply);
            }
        }
        warn!(target = "delist.worker", product_id, attempts = self.poll.max_attempts(), "delist_poll_timeout");
        ProductOutcome::new(product_id, OutcomeState::Timeout, POLL_TIMEOUT_MESSAGE)
    }
}

async fn capture_stage<T, Fut>(name: &'static str, fut: Fut) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let value = fut.await?;
    crate::metrics::stage_elapsed(name, started.elapsed().as_millis());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::portal::Transport;
    use crate::portal::api::{PRECHECK_PATH, PRODUCT_INFO_PATH, QUERY_MESSAGE_PATH, SEND_MESSAGE_PATH};
    use crate::session::SessionCredentials;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRODUCT: i64 = 4_821_337_002_519;

    fn worker(server: &MockServer, attempts: u32) -> DelistWorker {
        let config = Arc::new(PortalConfig::with_base_url(server.uri()));
        let portal = PortalClient::new(
            Transport::new(&config),
            config,
            Arc::new(SessionCredentials::new("c=1", "m1")),
        );
        DelistWorker::new(
            portal,
            Arc::new(SessionHandles {
                parent_message_id: "p-1".into(),
                tool_handle: "130".into(),
            }),
            RetryPolicy::immediate(attempts),
        )
    }

    fn messages(contents: &[&str]) -> Vec<ChatMessage> {
        contents
            .iter()
            .map(|c| serde_json::from_value(json!({"content": c})).unwrap())
            .collect()
    }

    async fn mount_happy_prefix(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(PRODUCT_INFO_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"productName": "陶瓷杯", "productPicture": "https://img/cup.png"}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(PRECHECK_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"interceptCode": 0}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(SEND_MESSAGE_PATH))
            .and(body_partial_json(json!({"parentMsgId": "p-1", "contentType": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"msgId": "m-77"}
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn classification_follows_markers() {
        assert_eq!(classify_reply("您好，商品已下架"), ReplyVerdict::Delisted);
        assert_eq!(
            classify_reply("您好，该商品已在您的上次咨询后处理成功"),
            ReplyVerdict::AlreadyProcessed
        );
        assert_eq!(classify_reply("您好，暂时无法操作下架"), ReplyVerdict::Refused);
        assert_eq!(classify_reply("您好，请稍后"), ReplyVerdict::Unrecognized);
        assert_eq!(ReplyVerdict::AlreadyProcessed.state(), OutcomeState::Success);
        assert_eq!(ReplyVerdict::Unrecognized.state(), OutcomeState::Failed);
    }

    #[test]
    fn reply_matching_needs_greeting_and_id_marker() {
        let history = messages(&[
            "SKC ID：42 已下架",
            "您好，【SKC ID：4200】已下架",
            "您好，SKC ID:42 暂时无法操作下架",
        ]);
        assert_eq!(find_product_reply(&history, 42), Some("您好，SKC ID:42 暂时无法操作下架"));
        assert_eq!(find_product_reply(&history, 7), None);

        let full_width = messages(&["您好，【SKC ID：42】已下架"]);
        assert_eq!(find_product_reply(&full_width, 42), Some("您好，【SKC ID：42】已下架"));
    }

    #[tokio::test]
    async fn success_on_third_poll_records_retry_count() {
        let server = MockServer::start().await;
        mount_happy_prefix(&server).await;
        Mock::given(method("POST"))
            .and(path(QUERY_MESSAGE_PATH))
            .and(body_partial_json(json!({"msgId": "m-77"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"messageList": []}
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        let reply = format!("您好，【SKC ID：{PRODUCT}】已下架");
        Mock::given(method("POST"))
            .and(path(QUERY_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"messageList": [{"content": reply}]}
            })))
            .mount(&server)
            .await;

        let outcome = worker(&server, 10).run(PRODUCT).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.state, OutcomeState::Success);
        assert_eq!(outcome.message, reply);
        assert_eq!(outcome.details.retry_count, 3);
        assert_eq!(outcome.details.offline_msg_id.as_deref(), Some("m-77"));
        assert_eq!(outcome.details.product_name.as_deref(), Some("陶瓷杯"));
    }

    #[tokio::test]
    async fn refused_reply_is_failed_verbatim() {
        let server = MockServer::start().await;
        mount_happy_prefix(&server).await;
        let reply = format!("您好，SKC ID：{PRODUCT} 暂时无法操作下架，请联系运营");
        Mock::given(method("POST"))
            .and(path(QUERY_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"messageList": [{"content": reply}]}
            })))
            .mount(&server)
            .await;

        let outcome = worker(&server, 3).run(PRODUCT).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.state, OutcomeState::Failed);
        assert_eq!(outcome.message, reply);
        assert_eq!(outcome.details.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_poll_is_timeout() {
        let server = MockServer::start().await;
        mount_happy_prefix(&server).await;
        Mock::given(method("POST"))
            .and(path(QUERY_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"messageList": [{"content": "您好，SKC ID：1 已下架"}]}
            })))
            .expect(4)
            .mount(&server)
            .await;

        let outcome = worker(&server, 4).run(PRODUCT).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.state, OutcomeState::Timeout);
        assert_eq!(outcome.message, POLL_TIMEOUT_MESSAGE);
        assert_eq!(outcome.details.retry_count, 4);
        assert_eq!(outcome.failure_kind, None);
    }

    #[tokio::test]
    async fn intercepted_precheck_skips_submit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(PRODUCT_INFO_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"productName": "陶瓷杯"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(PRECHECK_PATH))
            .and(body_partial_json(json!({"toolId": "130", "dataId": PRODUCT.to_string()})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"interceptCode": 5, "interceptMsg": "库存锁定中"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SEND_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let outcome = worker(&server, 3).run(PRODUCT).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.message, "无法下架：库存锁定中");
        assert_eq!(outcome.failed_stage.as_deref(), Some("precheck"));
        assert_eq!(outcome.failure_kind, Some(FailureKind::Refused));
        assert_eq!(outcome.details.retry_count, 0);
    }

    #[tokio::test]
    async fn missing_product_info_fails_query_stage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(PRODUCT_INFO_PATH))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let outcome = worker(&server, 3).run(PRODUCT).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.state, OutcomeState::Failed);
        assert_eq!(outcome.failed_stage.as_deref(), Some("query_info"));
        assert_eq!(outcome.failure_kind, Some(FailureKind::Unavailable));
        assert!(outcome.message.starts_with("查询商品信息失败"));
    }

    #[tokio::test]
    async fn missing_name_uses_placeholders() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(PRODUCT_INFO_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(PRECHECK_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"interceptCode": 0}
            })))
            .mount(&server)
            .await;
        let expected_content = serde_json::to_string(&ToolInvocation {
            name: "商品名称".into(),
            img: "商品图片".into(),
            dataType: 1,
            dataId: PRODUCT.to_string(),
            toolId: "130".into(),
        })
        .unwrap();
        Mock::given(method("POST"))
            .and(path(SEND_MESSAGE_PATH))
            .and(body_partial_json(json!({"content": expected_content})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "result": {"msgId": "m-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUERY_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"messageList": [{"content": format!("您好，SKC ID:{PRODUCT} 已下架")}]}
            })))
            .mount(&server)
            .await;

        let outcome = worker(&server, 2).run(PRODUCT).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.details.product_name, None);
    }
}
