use crate::portal::api::ProductPageQuery;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// Body of `POST /offline` and `POST /jobs/offline`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineRequest {
    #[serde(deserialize_with = "product_ids")]
    pub product_ids: Vec<i64>,
    #[serde(default, alias = "max_threads")]
    pub max_threads: Option<usize>,
    /// When set, written to the status sink for every product delisted.
    #[serde(default)]
    pub mark_status: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkStatusRequest {
    #[serde(deserialize_with = "product_id")]
    pub product_id: i64,
    pub status: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQueryRequest {
    #[serde(deserialize_with = "product_ids")]
    pub product_ids: Vec<i64>,
}

/// Query string of `GET /compliance/list` and `GET /compliance/total`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompliancePageQuery {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "compliance_page_size", alias = "pageSize")]
    pub page_size: u32,
}

/// Body of `POST /products`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQueryRequest {
    #[serde(default, deserialize_with = "optional_product_ids")]
    pub product_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "product_page_size", alias = "page_size")]
    pub page_size: u32,
}

impl From<ProductQueryRequest> for ProductPageQuery {
    fn from(request: ProductQueryRequest) -> Self {
        Self {
            page: request.page,
            pageSize: request.page_size,
            productIds: request.product_ids,
            productName: request.product_name,
        }
    }
}

fn first_page() -> u32 {
    1
}

fn compliance_page_size() -> u32 {
    20
}

fn product_page_size() -> u32 {
    500
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub items: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct TotalResponse {
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct MarkStatusResponse {
    pub updated: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusQueryResponse {
    pub statuses: BTreeMap<String, i32>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Terminal state of one product's delisting pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Success,
    Failed,
    Timeout,
}

/// Why a pipeline stage gave up on a product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The portal answered and said no.
    Refused,
    /// The portal could not be reached or answered nonsense.
    Unavailable,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeDetails {
    pub product_name: Option<String>,
    pub product_img: Option<String>,
    pub offline_msg_id: Option<String>,
    pub retry_count: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProductOutcome {
    pub product_id: i64,
    pub succeeded: bool,
    pub state: OutcomeState,
    pub message: String,
    pub failed_stage: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub details: OutcomeDetails,
}

impl ProductOutcome {
    pub fn new(product_id: i64, state: OutcomeState, message: impl Into<String>) -> Self {
        Self {
            product_id,
            succeeded: state == OutcomeState::Success,
            state,
            message: message.into(),
            failed_stage: None,
            failure_kind: None,
            details: OutcomeDetails::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub requested: usize,
    pub actual: usize,
    pub product_count: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub message: String,
    pub summary: Counts,
    pub thread_info: ThreadInfo,
    pub cache_used: bool,
    pub parent_msg_id: Option<String>,
    pub tool_id: Option<String>,
    pub results: Vec<ProductOutcome>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.summary.total
    }

    pub fn succeeded_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.results
            .iter()
            .filter(|outcome| outcome.succeeded)
            .map(|outcome| outcome.product_id)
    }
}

/// Response of `POST /offline`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineResponse {
    #[serde(flatten)]
    pub summary: BatchSummary,
    /// Products written to the status sink when `markStatus` was given.
    pub marked: Option<usize>,
}

/// Product ids come from browsers as numbers or, past 2^53, as strings.
fn product_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_json(&value).map_err(serde::de::Error::custom)
}

fn product_ids<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .iter()
        .map(id_from_json)
        .collect::<Result<_, _>>()
        .map_err(serde::de::Error::custom)
}

fn optional_product_ids<'de, D>(deserializer: D) -> Result<Option<Vec<i64>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Vec<Value>>::deserialize(deserializer)? {
        Some(values) => values
            .iter()
            .map(id_from_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn id_from_json(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("invalid product id: {n}")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("invalid product id: {s}")),
        other => Err(format!("invalid product id: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offline_request_accepts_numbers_and_strings() {
        let req: OfflineRequest = serde_json::from_value(json!({
            "productIds": [12, "98765432101234567", " 3 "],
            "max_threads": 4
        }))
        .unwrap();
        assert_eq!(req.product_ids, vec![12, 98_765_432_101_234_567, 3]);
        assert_eq!(req.max_threads, Some(4));
        assert_eq!(req.mark_status, None);
    }

    #[test]
    fn offline_request_rejects_non_numeric_ids() {
        let err = serde_json::from_value::<OfflineRequest>(json!({"productIds": ["abc"]}));
        assert!(err.is_err());
        let err = serde_json::from_value::<OfflineRequest>(json!({"productIds": [1.5]}));
        assert!(err.is_err());
    }

    #[test]
    fn product_query_defaults_to_first_large_page() {
        let req: ProductQueryRequest =
            serde_json::from_value(json!({"productIds": ["98765432101234567"]})).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 500);

        let query = ProductPageQuery::from(req);
        assert_eq!(query.productIds, Some(vec![98_765_432_101_234_567]));
        assert_eq!(query.productName, None);

        let named: ProductQueryRequest =
            serde_json::from_value(json!({"productName": "相框", "pageSize": 50})).unwrap();
        assert_eq!(named.product_ids, None);
        assert_eq!(named.page_size, 50);
    }

    #[test]
    fn compliance_query_accepts_both_page_size_spellings() {
        let snake: CompliancePageQuery = serde_json::from_value(json!({"page_size": 50})).unwrap();
        assert_eq!((snake.page, snake.page_size), (1, 50));
        let camel: CompliancePageQuery =
            serde_json::from_value(json!({"page": 3, "pageSize": 10})).unwrap();
        assert_eq!((camel.page, camel.page_size), (3, 10));
        let empty: CompliancePageQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!((empty.page, empty.page_size), (1, 20));
    }

    #[test]
    fn outcome_serializes_camel_case_without_empty_fields() {
        let outcome = ProductOutcome::new(5_000_000_001, OutcomeState::Timeout, "查询下架结果超时");
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["productId"], json!(5_000_000_001i64));
        assert_eq!(value["succeeded"], json!(false));
        assert_eq!(value["state"], json!("timeout"));
        assert!(value.get("failedStage").is_none());
        assert!(value.get("failureKind").is_none());
        assert_eq!(value["details"], json!({"retryCount": 0}));
    }
}
