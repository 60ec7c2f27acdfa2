use config::{Config, ConfigError, Environment};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path, result::Result, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptLimits {
    pub rate_limit_per_sec: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub key: String,
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub prompt_limits: PromptLimits,
}

/// Tuning for backfill jobs. Handed to the registry explicitly so the pipeline
/// never reaches for the global config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    /// Retries after the first attempt when the service reports a rate limit.
    pub max_retries: u32,
    pub rate_limit_backoff_secs: u64,
    /// Producer pause when a whole batch was already in flight.
    pub idle_poll_ms: u64,
    /// Producer pause after dispatching new work.
    pub busy_poll_ms: u64,
    /// Items fetched per poll = `fetch_multiplier * workers`.
    pub fetch_multiplier: usize,
    pub max_recent_errors: usize,
    /// Longest given-up id list a poll sends before it collapses into a floor.
    pub max_excluded_ids: usize,
    pub default_workers: usize,
    pub max_workers: usize,
    pub default_delay_ms: u64,
    pub watch_interval_secs: u64,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_backoff_secs: 60,
            idle_poll_ms: 500,
            busy_poll_ms: 100,
            fetch_multiplier: 2,
            max_recent_errors: 100,
            max_excluded_ids: 1000,
            default_workers: 5,
            max_workers: 32,
            default_delay_ms: 2000,
            watch_interval_secs: 10,
        }
    }
}

impl BackfillSettings {
    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    api: ApiConfig,
    model: ModelConfig,
    #[serde(default)]
    backfill: BackfillSettings,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub backfill: BackfillSettings,
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\n\nAPI: {} (timeout {}s, prompts {:?})\n\nModel Config: {:?}\n\nBackfill Config: {:?}",
            self.api.endpoint,
            self.api.request_timeout_secs,
            self.api.prompt_limits,
            self.model,
            self.backfill,
        )
    }
}

fn config_root() -> String {
    env::var("APP_DIR").unwrap_or_else(|_| {
        let dir =
            env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
        let dir = Path::new(&dir)
            .parent()
            .expect("Failed to get parent dir")
            .display()
            .to_string();
        format!("{}/config", dir)
    })
}

fn load_config_file(root: &str) -> Result<ConfigFile, ConfigError> {
    let path = format!("{root}/config.toml");
    Config::builder()
        .add_source(config::File::with_name(&path))
        .add_source(Environment::with_prefix("BACKFILL").separator("__"))
        .build()?
        .try_deserialize()
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = config_root();
        let ConfigFile {
            mut api,
            model,
            backfill,
        } = load_config_file(&root).expect("config.toml is invalid");

        if let Ok(key) = env::var("MISTRAL_API_KEY") {
            api.key = key;
        }

        ServerConfig {
            api,
            model,
            backfill,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_backfill_section_uses_defaults() {
        let settings: BackfillSettings = Config::builder()
            .add_source(config::File::from_str(
                "max_retries = 5\nidle_poll_ms = 50",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.idle_poll(), Duration::from_millis(50));
        assert_eq!(settings.rate_limit_backoff(), Duration::from_secs(60));
        assert_eq!(settings.max_recent_errors, 100);
        assert_eq!(settings.max_excluded_ids, 1000);
    }

    #[test]
    fn test_repo_config_file_parses() {
        let root = format!("{}/../config", env!("CARGO_MANIFEST_DIR"));
        let file = load_config_file(&root).expect("config/config.toml should parse");

        assert_eq!(file.backfill.max_retries, 3);
        assert_eq!(file.backfill.default_delay_ms, 2000);
        assert!(file.api.prompt_limits.rate_limit_per_sec > 0);
    }
}
