//! Configuration types for form sessions and the HTTP backend.

use std::time::Duration;

/// Timing and sizing knobs of one form session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before a `fetch_from` lookup fires.
    pub fetch_debounce: Duration,
    /// Quiet period before a search-as-you-type query fires.
    pub search_debounce: Duration,
    /// Quiet period before a matrix grid is regenerated.
    pub regeneration_debounce: Duration,
    /// How long a save waits for pending lookups before giving up.
    pub submit_wait_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Maximum candidates requested per link search.
    pub search_page_length: usize,
    /// Fields never sent on save (UI-only composite widgets).
    pub exclude_fields: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_debounce: Duration::from_millis(400),
            search_debounce: Duration::from_millis(300),
            regeneration_debounce: Duration::from_millis(500),
            submit_wait_timeout: Duration::from_secs(5),
            event_capacity: 64,
            search_page_length: 20,
            exclude_fields: Vec::new(),
        }
    }
}

/// Connection settings for [`crate::RestBackend`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Site root, e.g. `https://erp.example.com`.
    pub base_url: String,
    /// API key of a token pair; sent as `token key:secret`.
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            api_secret: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.fetch_debounce, Duration::from_millis(400));
        assert_eq!(config.search_debounce, Duration::from_millis(300));
        assert_eq!(config.regeneration_debounce, Duration::from_millis(500));
        assert!(config.exclude_fields.is_empty());
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert!(config.api_key.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
