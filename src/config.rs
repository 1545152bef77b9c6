use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Configuration for the HTTP transport.
///
/// Timeouts are handled here rather than by queries: a request that exceeds
/// the timeout fails as a network error.
///
/// # Example
///
/// ```rust
/// use tears_query::config::TransportConfig;
///
/// let config = TransportConfig::from_yaml_str(
///     "base_url: https://api.example.com/\ntimeout_ms: 5000\nheaders:\n  accept: application/json\n",
/// )
/// .expect("valid config");
///
/// assert_eq!(config.timeout().as_secs(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL that relative request URLs are resolved against.
    pub base_url: Option<Url>,

    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Headers sent with every request. Request headers take precedence.
    pub headers: BTreeMap<String, String>,

    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000, // 30 seconds
            headers: BTreeMap::new(),
            user_agent: None,
        }
    }
}

impl TransportConfig {
    /// Creates a configuration with the given base URL and defaults otherwise.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: Some(base_url),
            ..Self::default()
        }
    }

    /// Parses a configuration from YAML. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML or a field has the
    /// wrong shape.
    pub fn from_yaml_str(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
