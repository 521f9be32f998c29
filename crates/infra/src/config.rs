//! Worker configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::automation::{AutomationSettings, QUEUE as AUTOMATIONS_QUEUE};
use crate::broadcast::{BroadcastSettings, QUEUE as BROADCASTS_QUEUE};
use crate::jobs::{JobExecutorConfig, JobTypeOptions, DEFAULT_LEASE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// `None` runs the worker on in-memory stores.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub batch_size: usize,
    pub fan_out_page_size: usize,
    pub winner_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let broadcasts = BroadcastSettings::default();
        Self {
            database_url: None,
            db_max_connections: 10,
            queues: vec![AUTOMATIONS_QUEUE.to_string(), BROADCASTS_QUEUE.to_string()],
            concurrency: 10,
            poll_interval: Duration::from_millis(1000),
            lease: DEFAULT_LEASE,
            batch_size: broadcasts.batch_size,
            fan_out_page_size: AutomationSettings::default().page_size,
            winner_grace: broadcasts.winner_grace,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let queues = match get("MAILPULSE_QUEUES") {
            Some(raw) => {
                let queues: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect();
                if queues.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "MAILPULSE_QUEUES",
                        value: raw,
                        reason: "no queue names".into(),
                    });
                }
                queues
            }
            None => defaults.queues,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            db_max_connections: positive(&get, "MAILPULSE_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            queues,
            concurrency: positive(&get, "MAILPULSE_CONCURRENCY", defaults.concurrency)?,
            poll_interval: Duration::from_millis(positive(
                &get,
                "MAILPULSE_POLL_INTERVAL_MS",
                duration_millis(defaults.poll_interval),
            )?),
            lease: Duration::from_secs(positive(&get, "MAILPULSE_LEASE_SECONDS", defaults.lease.as_secs())?),
            batch_size: positive(&get, "MAILPULSE_BATCH_SIZE", defaults.batch_size)?,
            fan_out_page_size: positive(&get, "MAILPULSE_FANOUT_PAGE_SIZE", defaults.fan_out_page_size)?,
            winner_grace: Duration::from_secs(parse(
                &get,
                "MAILPULSE_WINNER_GRACE_SECONDS",
                defaults.winner_grace.as_secs(),
            )?),
        })
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("mailpulse-worker")
            .with_queues(self.queues.iter().cloned())
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
    }

    /// Options for every registered job type: the configured lease, default retry.
    pub fn job_type_options(&self) -> JobTypeOptions {
        JobTypeOptions::default().with_lease(self.lease)
    }

    pub fn automation_settings(&self) -> AutomationSettings {
        AutomationSettings {
            page_size: self.fan_out_page_size,
        }
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            batch_size: self.batch_size,
            winner_grace: self.winner_grace,
            ..BroadcastSettings::default()
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.queues, vec!["automations", "broadcasts"]);
        assert_eq!(config.lease, Duration::from_secs(15));
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.fan_out_page_size, 75);
        assert_eq!(config.winner_grace, Duration::from_secs(180));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/mailpulse"),
            ("MAILPULSE_QUEUES", " broadcasts , ,automations"),
            ("MAILPULSE_CONCURRENCY", "4"),
            ("MAILPULSE_POLL_INTERVAL_MS", "250"),
            ("MAILPULSE_WINNER_GRACE_SECONDS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/mailpulse"));
        assert_eq!(config.queues, vec!["broadcasts", "automations"]);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.winner_grace, Duration::ZERO);
        assert_eq!(config.broadcast_settings().winner_grace, Duration::ZERO);

        let executor = config.executor_config();
        assert_eq!(executor.queues, vec!["broadcasts", "automations"]);
        assert_eq!(executor.concurrency, 4);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = WorkerConfig::from_lookup(lookup(&[("MAILPULSE_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAILPULSE_BATCH_SIZE", .. }));

        let err = WorkerConfig::from_lookup(lookup(&[("MAILPULSE_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAILPULSE_CONCURRENCY", .. }));

        let err = WorkerConfig::from_lookup(lookup(&[("MAILPULSE_QUEUES", " , ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAILPULSE_QUEUES", .. }));
    }
}
