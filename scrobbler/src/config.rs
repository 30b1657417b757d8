use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub lastfm_api_key: String,
    pub lastfm_api_secret: String,
    pub lastfm_calls_per_sec: u32,
    pub operator_token: Option<String>,
    pub sync: SyncConfig,
}

/// Knobs of the background pipeline.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub workers: usize,
    pub run_timeout: Duration,
    /// Most plays submitted in one run when the watermark can't be located.
    pub backlog_cap: usize,
    /// Most observations read from the history source per run.
    pub fetch_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            workers: 4,
            run_timeout: Duration::from_secs(120),
            backlog_cap: 50,
            fetch_window: 200,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = SyncConfig::default();

        let sync = SyncConfig {
            interval: Duration::from_secs(parse_or(
                &get,
                "SYNC_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            workers: parse_or(&get, "SYNC_WORKERS", defaults.workers)?,
            run_timeout: Duration::from_secs(parse_or(
                &get,
                "RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )?),
            backlog_cap: parse_or(&get, "BACKLOG_CAP", defaults.backlog_cap)?,
            fetch_window: parse_or(&get, "FETCH_WINDOW", defaults.fetch_window)?,
        };

        let must_be_positive = [
            ("SYNC_WORKERS", sync.workers as u64),
            ("SYNC_INTERVAL_SECS", sync.interval.as_secs()),
            ("BACKLOG_CAP", sync.backlog_cap as u64),
            ("FETCH_WINDOW", sync.fetch_window as u64),
        ];
        if let Some(&(name, _)) = must_be_positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                name,
                value: "0".to_string(),
            });
        }

        let lastfm_calls_per_sec: u32 = parse_or(&get, "LASTFM_CALLS_PER_SEC", 5)?;
        if lastfm_calls_per_sec == 0 {
            return Err(ConfigError::Invalid {
                name: "LASTFM_CALLS_PER_SEC",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/ytmusic_scrobbler".to_string()),
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3001)))?,
            lastfm_api_key: get("LASTFM_API_KEY").ok_or(ConfigError::Missing("LASTFM_API_KEY"))?,
            lastfm_api_secret: get("LASTFM_API_SECRET")
                .ok_or(ConfigError::Missing("LASTFM_API_SECRET"))?,
            lastfm_calls_per_sec,
            operator_token: get("OPERATOR_TOKEN"),
            sync,
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config = Config::from_lookup(lookup(&[
            ("LASTFM_API_KEY", "key"),
            ("LASTFM_API_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.sync.interval, Duration::from_secs(300));
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.sync.backlog_cap, 50);
        assert_eq!(config.lastfm_calls_per_sec, 5);
        assert_eq!(config.bind_addr.port(), 3001);
        assert!(config.operator_token.is_none());
    }

    #[test]
    fn missing_secret_is_reported() {
        let err = Config::from_lookup(lookup(&[("LASTFM_API_KEY", "key")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("LASTFM_API_SECRET")));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("LASTFM_API_KEY", "key"),
            ("LASTFM_API_SECRET", "secret"),
            ("SYNC_WORKERS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SYNC_WORKERS", .. }));

        let err = Config::from_lookup(lookup(&[
            ("LASTFM_API_KEY", "key"),
            ("LASTFM_API_SECRET", "secret"),
            ("SYNC_WORKERS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SYNC_WORKERS", .. }));
    }

    #[test]
    fn zero_backlog_or_window_is_rejected() {
        for name in ["BACKLOG_CAP", "FETCH_WINDOW"] {
            let err = Config::from_lookup(lookup(&[
                ("LASTFM_API_KEY", "key"),
                ("LASTFM_API_SECRET", "secret"),
                (name, "0"),
            ]))
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: rejected, .. } if rejected == name),
                "{name} = 0 was accepted"
            );
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("LASTFM_API_KEY", "key"),
            ("LASTFM_API_SECRET", "secret"),
            ("SYNC_INTERVAL_SECS", "60"),
            ("BACKLOG_CAP", "10"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("OPERATOR_TOKEN", "letmein"),
        ]))
        .unwrap();

        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.backlog_cap, 10);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.operator_token.as_deref(), Some("letmein"));
    }
}
