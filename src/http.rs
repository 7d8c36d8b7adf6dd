use crate::config::env_parse;
use reqwest::Client;
use std::time::Duration;

/// Client for portal traffic. Automatic gzip handling is off: the portal
/// sometimes gzips bodies without announcing it, so decoding is done by the
/// transport from the body bytes.
pub fn build_client() -> Client {
    let timeout = env_parse::<u64>("HTTP_TIMEOUT_SECS").unwrap_or(15);
    let connect = env_parse::<u64>("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .no_gzip()
        .build()
        .unwrap_or_else(|_| Client::new())
}
