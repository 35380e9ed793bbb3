//! Data-plane proxy configuration, read from the environment once at start.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Substring allow-list; empty means everything is allowed.
    pub url_keyword_allow_list: Vec<String>,
    /// Header names stripped from every outbound request.
    pub del_headers: Vec<String>,
    pub reset_host: bool,
    pub client_reuse: bool,
    pub force_https: bool,
    pub auto_follow: bool,
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 1081,
            url_keyword_allow_list: Vec::new(),
            del_headers: Vec::new(),
            reset_host: true,
            client_reuse: true,
            force_https: false,
            auto_follow: true,
            debug: false,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name).as_deref() {
        Ok("true") => true,
        Ok("false") => false,
        _ => default,
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self {
            port: env::var("HttpServerProxyPort")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1081),
            force_https: env_flag("force_https", false),
            reset_host: env_flag("reset_host", true),
            client_reuse: env_flag("client_reuse", true),
            auto_follow: env_flag("auto_follow", true),
            debug: env_flag("debug", false),
            ..Default::default()
        };

        if let Ok(list) = env::var("proxy_url_keyword_white_list") {
            if !list.is_empty() {
                cfg.url_keyword_allow_list = list
                    .split('|')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_lowercase())
                    .collect();
                // ifconfig.me stays reachable for checking that the proxy
                // path works at all.
                cfg.url_keyword_allow_list.push("ifconfig".to_string());
            }
        }

        if let Ok(list) = env::var("proxy_del_headers") {
            if !list.is_empty() {
                cfg.del_headers = list
                    .split('|')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
            }
        }

        cfg
    }

    pub fn is_url_allowed(&self, target_url: &str) -> bool {
        if self.url_keyword_allow_list.is_empty() {
            return true;
        }
        let lower = target_url.to_lowercase();
        self.url_keyword_allow_list
            .iter()
            .any(|keyword| lower.contains(keyword))
    }
}

/// Batch coalescer tuning. The timing fields exist so tests can shrink the
/// collect window and poll cadence.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// The canonical asynchronous batch endpoint every eligible request is
    /// coalesced onto.
    pub batch_url: String,
    /// Base for job-status polls; the job name is appended.
    pub status_base_url: String,
    /// T_collect: how long a coalescer stays open waiting for more arrivals.
    pub collect_timeout: Duration,
    /// B_max: a coalescer reaching this many requests executes immediately.
    pub max_size: usize,
    /// Pause before the first status poll; a batch job never completes
    /// faster than this, so earlier polls are wasted.
    pub settle: Duration,
    pub poll_interval: Duration,
    pub debug: bool,
}

pub const DEFAULT_BATCH_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:batchGenerateContent";

pub const DEFAULT_STATUS_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_url: DEFAULT_BATCH_URL.to_string(),
            status_base_url: DEFAULT_STATUS_BASE_URL.to_string(),
            collect_timeout: Duration::from_secs(120),
            max_size: 20,
            settle: Duration::from_secs(50),
            poll_interval: Duration::from_secs(10),
            debug: false,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(value) = env::var("BatchCollectTimeout") {
            match value.parse::<u64>() {
                Ok(seconds) => cfg.collect_timeout = Duration::from_secs(seconds),
                Err(_) => panic!("env BatchCollectTimeout (seconds) must be a non-negative integer"),
            }
        }
        if let Ok(value) = env::var("BatchMaxSize") {
            match value.parse::<usize>() {
                Ok(size) => cfg.max_size = size,
                Err(_) => panic!("env BatchMaxSize must be a non-negative integer"),
            }
        }
        cfg.debug = env_flag("debug", false);
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_everything() {
        let cfg = ProxyConfig::default();
        assert!(cfg.is_url_allowed("https://api.example.com/v1"));
    }

    #[test]
    fn test_allow_list_is_substring_match() {
        let cfg = ProxyConfig {
            url_keyword_allow_list: vec!["googleapis".to_string(), "ifconfig".to_string()],
            ..Default::default()
        };
        assert!(cfg.is_url_allowed("https://generativelanguage.googleapis.com/v1beta"));
        assert!(cfg.is_url_allowed("https://ifconfig.me"));
        assert!(!cfg.is_url_allowed("https://api.example.com"));
    }

    #[test]
    fn test_allow_list_case_insensitive() {
        let cfg = ProxyConfig {
            url_keyword_allow_list: vec!["googleapis".to_string()],
            ..Default::default()
        };
        assert!(cfg.is_url_allowed("https://GenerativeLanguage.GoogleAPIs.com"));
    }
}
