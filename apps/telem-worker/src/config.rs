use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn setup_config_path() -> Option<PathBuf> {
    env::var("WORKER_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    nats_url: Option<String>,
    #[serde(default)]
    influx_url: Option<String>,
    #[serde(default)]
    influx_org: Option<String>,
    #[serde(default)]
    influx_bucket: Option<String>,
    #[serde(default)]
    influx_token: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telem-worker failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "telem-worker failed to parse setup config; using env defaults"
        );
        None
    })
}

fn parse_setup_overrides(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

/// Non-empty, trimmed environment value.
fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|v| v.parse::<T>().ok())
}

fn override_value(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub nats_url: String,
    pub nats_name: String,
    pub stream: String,
    pub durable: String,
    pub subject: String,
    pub ack_wait_secs: u64,
    pub max_deliver: i64,
    pub handlers: usize,
    pub stats_interval_secs: u64,
    pub influx_url: String,
    pub influx_org: String,
    pub influx_bucket: String,
    /// `None` switches the sink to diagnostic (log-only) mode.
    pub influx_token: Option<String>,
    pub influx_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            nats_name: "evabot-telem-worker".to_string(),
            stream: "TELEMETRY".to_string(),
            durable: "telem-worker".to_string(),
            subject: "telemetry.>".to_string(),
            ack_wait_secs: 30,
            max_deliver: 3,
            handlers: 1,
            stats_interval_secs: 60,
            influx_url: "http://127.0.0.1:8086".to_string(),
            influx_org: "r4f".to_string(),
            influx_bucket: "telemetry_raw".to_string(),
            influx_token: None,
            influx_timeout_ms: 10_000,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let mut config = Self {
            nats_url: env_value("NATS_URL").unwrap_or(defaults.nats_url),
            nats_name: env_value("WORKER_NATS_NAME").unwrap_or(defaults.nats_name),
            stream: env_value("WORKER_STREAM").unwrap_or(defaults.stream),
            durable: env_value("WORKER_DURABLE").unwrap_or(defaults.durable),
            subject: env_value("WORKER_SUBJECT").unwrap_or(defaults.subject),
            ack_wait_secs: env_parse("WORKER_ACK_WAIT_SECS").unwrap_or(defaults.ack_wait_secs),
            max_deliver: env_parse("WORKER_MAX_DELIVER").unwrap_or(defaults.max_deliver),
            handlers: env_parse("WORKER_HANDLERS").unwrap_or(defaults.handlers),
            stats_interval_secs: env_parse("WORKER_STATS_INTERVAL_SECS")
                .unwrap_or(defaults.stats_interval_secs),
            influx_url: env_value("INFLUX_URL").unwrap_or(defaults.influx_url),
            influx_org: env_value("INFLUX_ORG").unwrap_or(defaults.influx_org),
            influx_bucket: env_value("INFLUX_BUCKET").unwrap_or(defaults.influx_bucket),
            influx_token: env_value("INFLUX_TOKEN"),
            influx_timeout_ms: env_parse("INFLUX_TIMEOUT_MS")
                .unwrap_or(defaults.influx_timeout_ms),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = load_setup_config_overrides() {
            config.apply_setup_overrides(&overrides, |key| env_value(key).is_none());
        }
        config.clamp();

        Ok(config)
    }

    /// Setup-file values only fill settings the environment left unset.
    fn apply_setup_overrides(
        &mut self,
        overrides: &SetupConfigOverrides,
        env_allows: impl Fn(&str) -> bool,
    ) {
        if env_allows("NATS_URL") {
            if let Some(url) = override_value(overrides.nats_url.as_deref()) {
                self.nats_url = url;
            }
        }
        if env_allows("INFLUX_URL") {
            if let Some(url) = override_value(overrides.influx_url.as_deref()) {
                self.influx_url = url;
            }
        }
        if env_allows("INFLUX_ORG") {
            if let Some(org) = override_value(overrides.influx_org.as_deref()) {
                self.influx_org = org;
            }
        }
        if env_allows("INFLUX_BUCKET") {
            if let Some(bucket) = override_value(overrides.influx_bucket.as_deref()) {
                self.influx_bucket = bucket;
            }
        }
        if env_allows("INFLUX_TOKEN") {
            if let Some(token) = override_value(overrides.influx_token.as_deref()) {
                self.influx_token = Some(token);
            }
        }
    }

    fn clamp(&mut self) {
        self.handlers = self.handlers.max(1);
        self.max_deliver = self.max_deliver.max(1);
        self.ack_wait_secs = self.ack_wait_secs.max(1);
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn influx_timeout(&self) -> Duration {
        Duration::from_millis(self.influx_timeout_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}
