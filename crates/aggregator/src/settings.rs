use anyhow::{Context, Result, bail};
use clap::Parser;
use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

pub const ENV_PREFIX: &str = "ORCHWATCH";

#[derive(Debug, Parser)]
#[command(version, about = "Collects orchestrator probe reports and exports rolling statistics")]
pub struct AppArgs {
    /// Path to a TOML settings file; environment variables take priority
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Prefix of every HTTP route
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// Secret every prober must present with its reports
    pub shared_secret: String,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Instance liveness entries older than this are pruned on the next write
    #[serde(default = "default_liveness_expiry_secs")]
    pub liveness_expiry_secs: u64,
    /// Writer housekeeping period while the queue is empty
    #[serde(default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,
    #[serde(default = "default_snapshot_refresh_secs")]
    pub snapshot_refresh_secs: u64,
    #[serde(default)]
    pub name_resolution: NameResolutionSettings,
    #[serde(default)]
    pub leaderboard: LeaderboardSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NameResolutionSettings {
    /// Alias lookup endpoint; nodes are shown by address when unset
    pub url: Option<Url>,
    pub ttl_secs: u64,
    pub retry_delay_ms: u64,
    pub max_retries: usize,
    pub requests_per_second: usize,
    pub timeout_ms: u64,
}

impl Default for NameResolutionSettings {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: 86_400,
            retry_delay_ms: 200,
            max_retries: 5,
            requests_per_second: 5,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderboardSettings {
    pub enabled: bool,
    pub url: Url,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: Url::parse("https://leaderboard-serverless.vercel.app")
                .expect("static leaderboard url is valid"),
            poll_interval_secs: 900,
            timeout_secs: 10,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 42069))
}

fn default_api_path() -> String {
    "/api/master".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_liveness_expiry_secs() -> u64 {
    86_400
}

fn default_idle_tick_ms() -> u64 {
    1_000
}

fn default_snapshot_refresh_secs() -> u64 {
    10
}

impl Settings {
    /// Loads `.env`, the optional settings file, then `ORCHWATCH__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // NOTE: a missing .env file is fine
        let _ = dotenvy::dotenv();

        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            bail!(
                "Invalid log level '{}'. Valid options are: {:?}",
                self.log_level,
                valid_log_levels
            );
        }

        if self.shared_secret.trim().is_empty() {
            bail!("shared_secret cannot be empty");
        }

        if !self.api_path.starts_with('/') {
            bail!("api_path must start with '/', got {}", self.api_path);
        }

        if self.liveness_expiry_secs == 0 {
            bail!("liveness_expiry_secs must be greater than 0");
        }
        if self.idle_tick_ms == 0 {
            bail!("idle_tick_ms must be greater than 0");
        }
        if self.snapshot_refresh_secs == 0 {
            bail!("snapshot_refresh_secs must be greater than 0");
        }

        if self.name_resolution.ttl_secs == 0 {
            bail!("name_resolution.ttl_secs must be greater than 0");
        }
        if self.name_resolution.requests_per_second == 0 {
            bail!("name_resolution.requests_per_second must be greater than 0");
        }
        if let Some(url) = &self.name_resolution.url {
            validate_http_url("name_resolution.url", url)?;
        }

        if self.leaderboard.poll_interval_secs == 0 {
            bail!("leaderboard.poll_interval_secs must be greater than 0");
        }
        validate_http_url("leaderboard.url", &self.leaderboard.url)?;

        Ok(())
    }

    pub fn liveness_expiry_ms(&self) -> i64 {
        self.liveness_expiry_secs.saturating_mul(1000) as i64
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn snapshot_refresh(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }

    /// Route prefix without a trailing slash, so it can be nested.
    pub fn route_prefix(&self) -> &str {
        self.api_path.trim_end_matches('/')
    }
}

fn validate_http_url(name: &str, url: &Url) -> Result<()> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => bail!("{name} must use http or https, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_toml(contents: &str) -> Result<Settings> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Settings::load(Some(file.path()))
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let settings = load_toml("shared_secret = \"hunter2\"\n").unwrap();

        assert_eq!(settings.listen_addr.port(), 42069);
        assert_eq!(settings.route_prefix(), "/api/master");
        assert_eq!(settings.liveness_expiry_ms(), 86_400_000);
        assert_eq!(settings.name_resolution.max_retries, 5);
        assert!(settings.name_resolution.url.is_none());
        assert_eq!(settings.leaderboard.poll_interval_secs, 900);
    }

    #[test]
    fn test_nested_sections_override_defaults() {
        let settings = load_toml(
            r#"
            shared_secret = "hunter2"
            api_path = "/stats/"

            [name_resolution]
            url = "https://names.example.com/lookup"
            ttl_secs = 60

            [leaderboard]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.route_prefix(), "/stats");
        assert_eq!(settings.name_resolution.ttl_secs, 60);
        assert_eq!(settings.name_resolution.retry_delay_ms, 200);
        assert!(!settings.leaderboard.enabled);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(load_toml("shared_secret = \"  \"\n").is_err());
        assert!(load_toml("shared_secret = \"s\"\nlog_level = \"loud\"\n").is_err());
        assert!(load_toml("shared_secret = \"s\"\nidle_tick_ms = 0\n").is_err());
        assert!(
            load_toml("shared_secret = \"s\"\n[leaderboard]\nurl = \"ftp://example.com\"\n").is_err()
        );
    }
}
