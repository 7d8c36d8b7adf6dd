use crate::retry::RetryPolicy;
use once_cell::sync::Lazy;
use std::{env, time::Duration};

pub static PORTAL_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("PORTAL_BASE_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://agentseller.temu.com".to_string())
});

pub static PORTAL_ORIGIN: Lazy<String> =
    Lazy::new(|| env::var("PORTAL_ORIGIN").unwrap_or_else(|_| PORTAL_ROOT.clone()));

pub static PORTAL_USER_AGENT: Lazy<String> = Lazy::new(|| {
    env::var("PORTAL_USER_AGENT").unwrap_or_else(|_| {
        "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/138.0.0.0 Mobile Safari/537.36"
            .to_string()
    })
});

/// Where the seller portal lives and how requests to it present themselves.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub origin: String,
    pub user_agent: String,
}

impl PortalConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: PORTAL_ROOT.clone(),
            origin: PORTAL_ORIGIN.clone(),
            user_agent: PORTAL_USER_AGENT.clone(),
        }
    }

    /// Points every endpoint at `base_url`, using it as origin/referer as well.
    #[allow(dead_code)]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            origin: base_url.clone(),
            base_url,
            user_agent: PORTAL_USER_AGENT.clone(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Tuning for the batch workflow.
#[derive(Debug, Clone)]
pub struct DelistConfig {
    pub cache_ttl: Duration,
    pub bootstrap_retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
    pub default_max_threads: usize,
    pub max_threads_cap: usize,
}

impl Default for DelistConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            bootstrap_retry: RetryPolicy::new(5, Duration::from_secs(2))
                .with_error_delay(Duration::from_secs(1)),
            poll_retry: RetryPolicy::new(10, Duration::from_secs(1)),
            default_max_threads: 5,
            max_threads_cap: 32,
        }
    }
}

impl DelistConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cache_ttl = env_parse::<u64>("SESSION_CACHE_TTL_SECS")
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);
        let bootstrap_attempts = env_parse::<u32>("BOOTSTRAP_MAX_ATTEMPTS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.bootstrap_retry.max_attempts());
        let poll_attempts = env_parse::<u32>("POLL_MAX_ATTEMPTS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.poll_retry.max_attempts());
        let poll_interval = env_parse::<u64>("POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_retry.delay());
        let max_threads_cap = env_parse::<usize>("MAX_THREADS_CAP")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_threads_cap);
        let default_max_threads = env_parse::<usize>("DEFAULT_MAX_THREADS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.default_max_threads)
            .min(max_threads_cap);

        Self {
            cache_ttl,
            bootstrap_retry: RetryPolicy::new(bootstrap_attempts, defaults.bootstrap_retry.delay())
                .with_error_delay(defaults.bootstrap_retry.error_delay()),
            poll_retry: RetryPolicy::new(poll_attempts, poll_interval),
            default_max_threads,
            max_threads_cap,
        }
    }
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_urls_join_without_double_slash() {
        let config = PortalConfig::with_base_url("http://127.0.0.1:9999/");
        assert_eq!(config.base_url, "http://127.0.0.1:9999");
        assert_eq!(config.origin, "http://127.0.0.1:9999");
        assert_eq!(
            config.url("/bg/cute/api/merchantService/chat/sendMessage"),
            "http://127.0.0.1:9999/bg/cute/api/merchantService/chat/sendMessage"
        );
    }

    #[test]
    fn defaults_follow_portal_cadence() {
        let config = DelistConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(86_400));
        assert_eq!(config.bootstrap_retry.max_attempts(), 5);
        assert_eq!(config.bootstrap_retry.delay(), Duration::from_secs(2));
        assert_eq!(config.bootstrap_retry.error_delay(), Duration::from_secs(1));
        assert_eq!(config.poll_retry.max_attempts(), 10);
        assert_eq!(config.poll_retry.delay(), Duration::from_secs(1));
    }
}
