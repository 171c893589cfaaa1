//! Tidewatch alert providers.
//!
//! Uptime checks tagged with an application can be looked up over a time range so a
//! deployment narrative can be lined up against the alerts it caused. Providers are
//! built from configuration; a provider without a config block is never loaded.

#![forbid(unsafe_code)]

pub mod pingdom;
pub mod statuscake;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tidewatch_core::settings::AlertProvidersConfig;
use tracing::{error, info};

#[derive(Debug, ThisError)]
pub enum AlertError {
    #[error("{provider}: request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider}: unexpected status {status}")]
    Status { provider: &'static str, status: u16 },
    #[error("building http client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },
}

pub type Result<T> = std::result::Result<T, AlertError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
    Paused,
    Unknown,
}

impl From<&str> for CheckStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "up" => CheckStatus::Up,
            "down" => CheckStatus::Down,
            "paused" => CheckStatus::Paused,
            _ => CheckStatus::Unknown,
        }
    }
}

/// One state interval of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPeriod {
    pub status: CheckStatus,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub status: CheckStatus,
    /// State intervals overlapping the requested range, oldest first.
    pub periods: Vec<CheckPeriod>,
}

#[async_trait::async_trait]
pub trait AlertProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks carrying any of `tags` (comma separated), with their state changes
    /// between `from` and `to`.
    async fn lookup_checks_by_tag(&self, tags: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CheckResponse>>;
}

/// Keep the periods overlapping `[from, to]`, oldest first.
pub(crate) fn clip_periods(mut periods: Vec<CheckPeriod>, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<CheckPeriod> {
    periods.retain(|p| p.from <= to && p.to.map_or(true, |end| end >= from));
    periods.sort_by_key(|p| p.from);
    periods
}

const USER_AGENT: &str = concat!("tidewatch/", env!("CARGO_PKG_VERSION"));

fn http_client(user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|source| AlertError::Client { source })
}

/// Build every configured provider, keyed by name. One HTTP client is shared.
pub fn load(config: &AlertProvidersConfig) -> Result<BTreeMap<String, Arc<dyn AlertProvider>>> {
    load_with_agent(config, USER_AGENT)
}

fn load_with_agent(config: &AlertProvidersConfig, user_agent: &str) -> Result<BTreeMap<String, Arc<dyn AlertProvider>>> {
    let mut providers: BTreeMap<String, Arc<dyn AlertProvider>> = BTreeMap::new();
    if config.statuscake.is_none() && config.pingdom.is_none() {
        return Ok(providers);
    }
    let client = http_client(user_agent).inspect_err(|e| error!(error = %e, "alert providers not loaded"))?;
    if let Some(sc) = config.statuscake.as_ref() {
        let p = statuscake::Statuscake::new(client.clone(), &sc.endpoint, &sc.username, &sc.api_key);
        providers.insert(p.name().to_string(), Arc::new(p));
    }
    if let Some(pd) = config.pingdom.as_ref() {
        let p = pingdom::Pingdom::new(client, &pd.endpoint, &pd.token);
        providers.insert(p.name().to_string(), Arc::new(p));
    }
    info!(providers = ?providers.keys().collect::<Vec<_>>(), "alert providers loaded");
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tidewatch_core::settings::{PingdomConfig, StatuscakeConfig};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn nothing_configured_loads_nothing() {
        assert!(load(&AlertProvidersConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn loads_only_configured_providers() {
        let cfg = AlertProvidersConfig {
            statuscake: Some(StatuscakeConfig {
                endpoint: "https://app.statuscake.com".into(),
                username: "ops".into(),
                api_key: "key".into(),
            }),
            pingdom: None,
        };
        let providers = load(&cfg).unwrap();
        assert_eq!(providers.keys().collect::<Vec<_>>(), vec!["statuscake"]);

        let both = AlertProvidersConfig {
            pingdom: Some(PingdomConfig { endpoint: "https://api.pingdom.com/api/3.1".into(), token: "t".into() }),
            ..cfg
        };
        assert_eq!(load(&both).unwrap().len(), 2);
    }

    #[test]
    fn client_build_failure_is_reported() {
        let cfg = AlertProvidersConfig {
            statuscake: None,
            pingdom: Some(PingdomConfig { endpoint: "https://api.pingdom.com/api/3.1".into(), token: "t".into() }),
        };
        // A header value cannot carry a newline.
        let err = load_with_agent(&cfg, "tidewatch\n").err().expect("client build should fail");
        assert!(matches!(err, AlertError::Client { .. }));
        assert!(err.to_string().starts_with("building http client"));
        assert!(load_with_agent(&AlertProvidersConfig::default(), "tidewatch\n").unwrap().is_empty());
    }

    #[test]
    fn periods_are_clipped_to_the_range() {
        let periods = vec![
            CheckPeriod { status: CheckStatus::Up, from: ts(200), to: None },
            CheckPeriod { status: CheckStatus::Down, from: ts(0), to: Some(ts(50)) },
            CheckPeriod { status: CheckStatus::Up, from: ts(50), to: Some(ts(200)) },
        ];
        let kept = clip_periods(periods, ts(100), ts(150));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].from, ts(50));
        assert_eq!(CheckStatus::from("DOWN"), CheckStatus::Down);
    }
}
