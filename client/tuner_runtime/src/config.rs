use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::SERVER_TO_CLIENT_CAP;
use crate::telemetry::DEFAULT_KEEP_LAST_SECS;

pub const DEFAULT_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub url: String,
    pub outbound_queue_cap: usize,
    /// How long one socket read may block before queued edits are flushed.
    pub poll_interval: Duration,
    pub default_keep_last_secs: f64,
    pub max_inbound_frame: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_keep_last_secs: DEFAULT_KEEP_LAST_SECS,
            max_inbound_frame: SERVER_TO_CLIENT_CAP,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `TUNER_*` environment variables. Values that
    /// do not parse, or are not positive, keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            url: lookup("TUNER_URL")
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.url),
            outbound_queue_cap: parse_positive(lookup("TUNER_OUTBOUND_QUEUE_CAP"))
                .unwrap_or(defaults.outbound_queue_cap),
            poll_interval: parse_positive::<u64>(lookup("TUNER_POLL_INTERVAL_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            default_keep_last_secs: lookup("TUNER_KEEP_LAST_SECS")
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .unwrap_or(defaults.default_keep_last_secs),
            max_inbound_frame: parse_positive(lookup("TUNER_MAX_FRAME_BYTES"))
                .unwrap_or(defaults.max_inbound_frame),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };

        let Some((scheme, rest)) = self.url.split_once("://") else {
            return Err(invalid("missing scheme"));
        };
        if scheme != "ws" && scheme != "wss" {
            return Err(invalid("scheme must be ws or wss"));
        }
        if rest.is_empty() || rest.starts_with('/') {
            return Err(invalid("missing host"));
        }
        Ok(())
    }
}

fn parse_positive<T>(raw: Option<String>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|raw| raw.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(RuntimeConfig::from_lookup(lookup(&[])), RuntimeConfig::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("TUNER_URL", "ws://10.0.0.1:9000/ws"),
            ("TUNER_OUTBOUND_QUEUE_CAP", "16"),
            ("TUNER_POLL_INTERVAL_MS", "5"),
            ("TUNER_KEEP_LAST_SECS", "2.5"),
            ("TUNER_MAX_FRAME_BYTES", "4096"),
        ]));

        assert_eq!(config.url, "ws://10.0.0.1:9000/ws");
        assert_eq!(config.outbound_queue_cap, 16);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.default_keep_last_secs, 2.5);
        assert_eq!(config.max_inbound_frame, 4096);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("TUNER_OUTBOUND_QUEUE_CAP", "0"),
            ("TUNER_POLL_INTERVAL_MS", "soon"),
            ("TUNER_KEEP_LAST_SECS", "-1"),
        ]));

        assert_eq!(config.outbound_queue_cap, DEFAULT_OUTBOUND_QUEUE_CAP);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.default_keep_last_secs, DEFAULT_KEEP_LAST_SECS);
    }

    #[test]
    fn url_validation() {
        let mut config = RuntimeConfig::default();
        assert!(config.validate().is_ok());

        config.url = "http://localhost:8080/ws".into();
        assert!(config.validate().is_err());

        config.url = "ws:///ws".into();
        assert!(config.validate().is_err());

        config.url = "localhost:8080".into();
        assert!(config.validate().is_err());
    }
}
