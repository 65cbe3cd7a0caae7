//! Client configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default proactive refresh cadence.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Shortest access-credential lifetime the backend issues by default.
pub const DEFAULT_MIN_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Refresh interval {interval:?} must be shorter than the minimum credential lifetime {lifetime:?}")]
    RefreshTooSlow { interval: Duration, lifetime: Duration },
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },
}

/// How long to wait before each reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed { delay: Duration },
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = match *self {
            Self::Fixed { delay } => delay.is_zero(),
            Self::Exponential { base, max } => base.is_zero() || max.is_zero(),
        };
        if zero {
            return Err(ConfigError::ZeroDuration("reconnect delay"));
        }
        Ok(())
    }
}

/// Endpoint layout of the backend, relative to `api_base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub logout: String,
    pub refresh: String,
    pub verify: String,
    /// Resource collection path, e.g. `shapes/`.
    pub resource: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "accounts/login/".to_string(),
            logout: "accounts/logout/".to_string(),
            refresh: "accounts/token/refresh/".to_string(),
            verify: "accounts/token/verify/".to_string(),
            resource: "shapes/".to_string(),
        }
    }
}

impl Endpoints {
    /// Path of a single record.
    #[must_use]
    pub fn record(&self, id: &impl std::fmt::Display) -> String {
        format!("{}{id}/", self.resource)
    }
}

/// Configuration for the whole client core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the REST API, with trailing slash (e.g. `http://host/api/`).
    pub api_base_url: String,
    /// Realtime endpoint URL.
    pub realtime_url: String,
    pub endpoints: Endpoints,
    /// Proactive refresh cadence.
    pub refresh_interval: Duration,
    /// Shortest credential lifetime the server issues.
    pub min_credential_lifetime: Duration,
    pub reconnect: ReconnectPolicy,
    /// Where the file credential store keeps its data.
    pub credential_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/".to_string(),
            realtime_url: "ws://localhost:8000/ws/shapes/".to_string(),
            endpoints: Endpoints::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            min_credential_lifetime: DEFAULT_MIN_CREDENTIAL_LIFETIME,
            reconnect: ReconnectPolicy::default(),
            credential_path: None,
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl ClientConfig {
    /// Build from `LIVECRUD_*` environment variables over the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut api_base_url =
            std::env::var("LIVECRUD_API_URL").unwrap_or(defaults.api_base_url);
        if !api_base_url.ends_with('/') {
            api_base_url.push('/');
        }

        let reconnect_delay =
            env_secs("LIVECRUD_RECONNECT_SECS").unwrap_or(DEFAULT_RECONNECT_DELAY);
        let reconnect = match env_secs("LIVECRUD_RECONNECT_MAX_SECS") {
            Some(max) => ReconnectPolicy::Exponential {
                base: reconnect_delay,
                max,
            },
            None => ReconnectPolicy::Fixed {
                delay: reconnect_delay,
            },
        };

        Self {
            api_base_url,
            realtime_url: std::env::var("LIVECRUD_WS_URL").unwrap_or(defaults.realtime_url),
            endpoints: Endpoints {
                resource: std::env::var("LIVECRUD_RESOURCE")
                    .map(|r| if r.ends_with('/') { r } else { format!("{r}/") })
                    .unwrap_or(defaults.endpoints.resource),
                ..defaults.endpoints
            },
            refresh_interval: env_secs("LIVECRUD_REFRESH_SECS")
                .unwrap_or(defaults.refresh_interval),
            min_credential_lifetime: env_secs("LIVECRUD_MIN_LIFETIME_SECS")
                .unwrap_or(defaults.min_credential_lifetime),
            reconnect,
            credential_path: std::env::var_os("LIVECRUD_CREDENTIAL_PATH").map(PathBuf::from),
        }
    }

    /// Check the policy invariants.
    ///
    /// # Errors
    /// Returns error if the refresh cadence cannot keep credentials valid,
    /// a delay is zero, or a URL has the wrong scheme.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("refresh interval"));
        }
        if self.refresh_interval >= self.min_credential_lifetime {
            return Err(ConfigError::RefreshTooSlow {
                interval: self.refresh_interval,
                lifetime: self.min_credential_lifetime,
            });
        }
        self.reconnect.validate()?;

        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidUrl {
                field: "api_base_url",
                value: self.api_base_url.clone(),
            });
        }
        if !(self.realtime_url.starts_with("ws://") || self.realtime_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl {
                field: "realtime_url",
                value: self.realtime_url.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(ClientConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_refresh_must_beat_lifetime() {
        let config = ClientConfig {
            refresh_interval: Duration::from_secs(900),
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RefreshTooSlow { .. })
        ));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(500), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_record_path() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.record(&7), "shapes/7/");
    }
}
