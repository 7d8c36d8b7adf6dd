use crate::config::PortalConfig;
use crate::http::build_client;
use crate::session::SessionCredentials;
use flate2::read::GzDecoder;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}")]
    Status { status: u16 },
    #[error("empty response body")]
    EmptyBody,
    #[error("gzip decompression failed: {0}")]
    Decompress(String),
    #[error("invalid json body: {0}")]
    Decode(String),
}

/// Cookie-authenticated JSON POSTs against the seller portal.
#[derive(Debug, Clone)]
pub struct Transport {
    http: Client,
    origin: String,
    user_agent: String,
}

impl Transport {
    pub fn new(config: &PortalConfig) -> Self {
        Self::with_client(build_client(), config)
    }

    pub fn with_client(http: Client, config: &PortalConfig) -> Self {
        Self {
            http,
            origin: config.origin.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    pub async fn post<P>(
        &self,
        url: &str,
        payload: &P,
        credentials: &SessionCredentials,
    ) -> Result<Value, TransportError>
    where
        P: Serialize + ?Sized,
    {
        debug!(target = "delist.transport", url, mall_id = %credentials.mall_id, "portal_post");
        let response = self
            .http
            .post(url)
            .header("accept", "*/*")
            .header("accept-encoding", "gzip")
            .header("accept-language", "zh-CN,zh;q=0.9,en;q=0.8")
            .header("anti-content", "")
            .header("cache-control", "max-age=0")
            .header("cookie", credentials.cookie.as_str())
            .header("mallid", credentials.mall_id.as_str())
            .header("origin", self.origin.as_str())
            .header("referer", self.origin.as_str())
            .header(
                "sec-ch-ua",
                r#""Not)A;Brand";v="8", "Chromium";v="138", "Google Chrome";v="138""#,
            )
            .header("sec-ch-ua-mobile", "?1")
            .header("sec-ch-ua-platform", r#""Android""#)
            .header("sec-fetch-dest", "empty")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-site", "same-origin")
            .header("user-agent", self.user_agent.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(target = "delist.transport", url, error = %err, "portal_request_failed");
                TransportError::Request(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        if !status.is_success() {
            warn!(
                target = "delist.transport",
                url,
                status = status.as_u16(),
                body = %preview(&body),
                "portal_http_error"
            );
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        decode_body(&body).inspect_err(|err| {
            warn!(target = "delist.transport", url, error = %err, body = %preview(&body), "portal_body_rejected");
        })
    }
}

/// Decodes a portal response body, inflating it first when it starts with
/// the gzip magic bytes.
pub fn decode_body(bytes: &[u8]) -> Result<Value, TransportError> {
    if bytes.is_empty() {
        return Err(TransportError::EmptyBody);
    }
    let text = if bytes.starts_with(&GZIP_MAGIC) {
        let mut inflated = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut inflated)
            .map_err(|err| TransportError::Decompress(err.to_string()))?;
        inflated
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|err| TransportError::Decode(err.to_string()))?
    };
    if text.trim().is_empty() {
        return Err(TransportError::EmptyBody);
    }
    serde_json::from_str(&text).map_err(|err| TransportError::Decode(err.to_string()))
}

fn preview(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(500)]).into_owned()
}
