//! Process settings: YAML file, then `TIDEWATCH_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Deployment,
    Daemonset,
    Statefulset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WatchSettings {
    pub namespaces: Vec<String>,
    pub kinds: Vec<WatchKind>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self { namespaces: Vec::new(), kinds: vec![WatchKind::Deployment, WatchKind::Daemonset, WatchKind::Statefulset] }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProgressSettings {
    #[serde(with = "duration_str")]
    pub stabilisation_window: Duration,
    pub max_pod_failures: u32,
    pub max_warning_events: u32,
    #[serde(with = "duration_str")]
    pub default_deadline: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            stabilisation_window: Duration::from_secs(10),
            max_pod_failures: 3,
            max_warning_events: 5,
            default_deadline: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistrySettings {
    #[serde(with = "duration_str")]
    pub linger: Duration,
    pub write_queue: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { linger: Duration::from_secs(60), write_queue: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventsSettings {
    #[serde(with = "duration_str")]
    pub replay_window: Duration,
    pub subscriber_buffer: usize,
}

impl Default for EventsSettings {
    fn default() -> Self {
        Self { replay_window: Duration::from_secs(30), subscriber_buffer: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackoffSettings {
    #[serde(with = "duration_str")]
    pub base: Duration,
    #[serde(with = "duration_str")]
    pub cap: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self { base: Duration::from_millis(250), cap: Duration::from_secs(30) }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy { base: self.base, cap: self.cap, max_attempts: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiSettings {
    pub startup_attempts: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { startup_attempts: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ShutdownSettings {
    #[serde(with = "duration_str")]
    pub window: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { window: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatuscakeConfig {
    pub endpoint: String,
    pub username: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PingdomConfig {
    pub endpoint: String,
    pub token: String,
}

/// Alert providers; an absent block means the provider is not loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AlertProvidersConfig {
    pub statuscake: Option<StatuscakeConfig>,
    pub pingdom: Option<PingdomConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub cluster_name: String,
    pub watch: WatchSettings,
    pub progress: ProgressSettings,
    pub registry: RegistrySettings,
    pub events: EventsSettings,
    pub backoff: BackoffSettings,
    pub api: ApiSettings,
    pub shutdown: ShutdownSettings,
    pub storage: StorageSettings,
    pub alerts: AlertProvidersConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            watch: WatchSettings::default(),
            progress: ProgressSettings::default(),
            registry: RegistrySettings::default(),
            events: EventsSettings::default(),
            backoff: BackoffSettings::default(),
            api: ApiSettings::default(),
            shutdown: ShutdownSettings::default(),
            storage: StorageSettings::default(),
            alerts: AlertProvidersConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from an optional file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| Error::Config(format!("reading {}: {}", p.display(), e)))?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env(|k| std::env::var(k).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TIDEWATCH_CLUSTER_NAME") {
            self.cluster_name = v;
        }
        if let Some(v) = lookup("TIDEWATCH_NAMESPACES") {
            self.watch.namespaces = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Some(v) = lookup("TIDEWATCH_DB_PATH") {
            self.storage.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TIDEWATCH_DEFAULT_DEADLINE") {
            self.progress.default_deadline = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TIDEWATCH_STABILISATION_WINDOW") {
            self.progress.stabilisation_window = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TIDEWATCH_LINGER") {
            self.registry.linger = parse_duration(&v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::Config("cluster-name must not be empty".into()));
        }
        if self.watch.kinds.is_empty() {
            return Err(Error::Config("watch.kinds must name at least one kind".into()));
        }
        if self.progress.max_pod_failures == 0 || self.progress.max_warning_events == 0 {
            return Err(Error::Config("progress thresholds must be positive".into()));
        }
        if self.progress.default_deadline.is_zero() {
            return Err(Error::Config("progress.default-deadline must be positive".into()));
        }
        if self.events.subscriber_buffer == 0 || self.registry.write_queue == 0 {
            return Err(Error::Config("buffers must be positive".into()));
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(Error::Config("backoff.cap must be >= backoff.base > 0".into()));
        }
        if self.api.startup_attempts == 0 {
            return Err(Error::Config("api.startup-attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Parse `500ms`, `10s`, `30m`, `1h` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num.parse().map_err(|_| Error::Config(format!("invalid duration: {s:?}")))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(Error::Config(format!("invalid duration unit {other:?} in {s:?}"))),
    }
}

pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => super::parse_duration(&s).map_err(de::Error::custom),
        }
    }
}
