use std::time::Duration;

use route_core::FetchTimeout;

use crate::backoff::ReconnectPolicy;
use crate::settings::RouteSettings;

/// Runtime configuration of one broker instance.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Request-source (gateway) address.
    pub plugin_address: String,
    /// Data-source (sink) address.
    pub sink_address: String,
    /// Applies to both the request source and worker fetches.
    pub timeout: FetchTimeout,
    pub client_name: Option<String>,
    pub max_threads: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&RouteSettings::default())
    }
}

impl From<&RouteSettings> for BrokerConfig {
    fn from(s: &RouteSettings) -> Self {
        Self {
            plugin_address: s.plugin_address.clone(),
            sink_address: s.sink_address.clone(),
            timeout: FetchTimeout::from_millis(s.timeout_ms),
            client_name: s.client_name.clone(),
            max_threads: s.max_threads,
            reconnect: ReconnectPolicy::default().with_max_attempts(s.max_connect),
        }
    }
}

impl BrokerConfig {
    /// Idle pooled workers older than this are evicted. None disables sweeping.
    pub fn stale_threshold(&self) -> Option<Duration> {
        self.timeout.as_duration().map(|t| t * 2)
    }

    /// Workers idle longer than this are liveness-checked before reuse.
    pub fn refresh_threshold(&self) -> Option<Duration> {
        self.timeout.as_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_settings() {
        let mut s = RouteSettings::default();
        s.timeout_ms = 500;
        s.max_connect = 7;
        s.client_name = Some("Router".into());
        let c = BrokerConfig::from(&s);
        assert_eq!(c.timeout, FetchTimeout::After(Duration::from_millis(500)));
        assert_eq!(c.reconnect.max_attempts, 7);
        assert_eq!(c.client_name.as_deref(), Some("Router"));
        assert_eq!(c.stale_threshold(), Some(Duration::from_secs(1)));
        assert_eq!(c.refresh_threshold(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn infinite_timeout_disables_sweeping() {
        let mut s = RouteSettings::default();
        s.timeout_ms = -1;
        let c = BrokerConfig::from(&s);
        assert!(c.timeout.is_infinite());
        assert_eq!(c.stale_threshold(), None);
    }
}
