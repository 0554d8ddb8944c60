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
#[command(version, about = "Probes orchestrators from one region and reports to the aggregator")]
pub struct AppArgs {
    /// Path to a TOML settings file; environment variables take priority
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Friendly name of this prober, stamped on every result it submits
    pub tag: String,
    pub region: String,
    #[serde(default)]
    pub external_regions: Vec<String>,
    pub shared_secret: String,
    pub master: MasterSettings,
    #[serde(default)]
    pub population: PopulationSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub enrichment: EnrichmentSettings,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterSettings {
    pub host: String,
    #[serde(default = "default_master_port")]
    pub port: u16,
    #[serde(default = "default_master_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopulationSettings {
    /// Subgraph endpoint listing active orchestrators
    pub url: Url,
    pub refresh_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PopulationSettings {
    fn default() -> Self {
        Self {
            url: Url::parse("https://api.thegraph.com/subgraphs/name/livepeer/arbitrum-one")
                .expect("static subgraph url is valid"),
            refresh_secs: 1_800,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub deadline_ms: u64,
    pub concurrency: usize,
    pub round_secs: u64,
    pub sleep_ms: u64,
    pub status_path: String,
    /// Orchestrators commonly serve self-signed certificates
    pub accept_invalid_certs: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            deadline_ms: 5_000,
            concurrency: 10,
            round_secs: 60,
            sleep_ms: 1_000,
            status_path: "/status".to_string(),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub ttl_secs: u64,
    /// ipinfo-style endpoint answering `GET {geo_url}/{ip}`; geo is unknown when unset
    pub geo_url: Option<Url>,
    pub geo_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            geo_url: None,
            geo_token: None,
            timeout_ms: 5_000,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9100))
}

fn default_master_port() -> u16 {
    443
}

fn default_master_path() -> String {
    "/api/master/collectStats".to_string()
}

fn default_true() -> bool {
    true
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
                    .list_separator(",")
                    .with_list_parse_key("external_regions")
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

        for (name, value) in [
            ("tag", &self.tag),
            ("region", &self.region),
            ("shared_secret", &self.shared_secret),
            ("master.host", &self.master.host),
        ] {
            if value.trim().is_empty() {
                bail!("{name} cannot be empty");
            }
        }
        if !self.master.path.starts_with('/') {
            bail!("master.path must start with '/', got {}", self.master.path);
        }

        if self.probe.concurrency == 0 {
            bail!("probe.concurrency must be greater than 0");
        }
        if self.probe.deadline_ms == 0 {
            bail!("probe.deadline_ms must be greater than 0");
        }
        if self.probe.round_secs == 0 || self.probe.sleep_ms == 0 {
            bail!("probe.round_secs and probe.sleep_ms must be greater than 0");
        }
        if self.population.refresh_secs == 0 {
            bail!("population.refresh_secs must be greater than 0");
        }
        if self.enrichment.ttl_secs == 0 {
            bail!("enrichment.ttl_secs must be greater than 0");
        }

        validate_http_url("population.url", &self.population.url)?;
        if let Some(url) = &self.enrichment.geo_url {
            validate_http_url("enrichment.geo_url", url)?;
        }

        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.probe.deadline_ms)
    }

    pub fn round(&self) -> Duration {
        Duration::from_secs(self.probe.round_secs)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.probe.sleep_ms)
    }

    pub fn population_refresh(&self) -> Duration {
        Duration::from_secs(self.population.refresh_secs)
    }

    pub fn enrichment_ttl(&self) -> Duration {
        Duration::from_secs(self.enrichment.ttl_secs)
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

    const MINIMAL: &str = r#"
        tag = "fra-1"
        region = "eu"
        external_regions = ["FRA", "LON"]
        shared_secret = "hunter2"

        [master]
        host = "aggregator.example.com"
    "#;

    fn load_toml(contents: &str) -> Result<Settings> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Settings::load(Some(file.path()))
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let settings = load_toml(MINIMAL).unwrap();

        assert_eq!(settings.master.port, 443);
        assert_eq!(settings.master.path, "/api/master/collectStats");
        assert!(settings.master.tls);
        assert_eq!(settings.deadline(), Duration::from_secs(5));
        assert_eq!(settings.probe.concurrency, 10);
        assert_eq!(settings.round(), Duration::from_secs(60));
        assert_eq!(settings.population_refresh(), Duration::from_secs(1_800));
        assert_eq!(settings.external_regions, vec!["FRA".to_string(), "LON".to_string()]);
        assert!(settings.enrichment.geo_url.is_none());
    }

    #[test]
    fn test_sections_override_defaults() {
        let settings = load_toml(&format!(
            "{MINIMAL}\n[probe]\nconcurrency = 4\ndeadline_ms = 1500\n\n[enrichment]\ngeo_url = \"https://ipinfo.io\"\n"
        ))
        .unwrap();

        assert_eq!(settings.probe.concurrency, 4);
        assert_eq!(settings.deadline(), Duration::from_millis(1500));
        assert_eq!(settings.probe.status_path, "/status");
        assert_eq!(settings.enrichment.ttl_secs, 3_600);
        assert!(settings.enrichment.geo_url.is_some());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(load_toml(&MINIMAL.replace("hunter2", " ")).is_err());
        assert!(load_toml(&format!("{MINIMAL}\n[probe]\nconcurrency = 0\n")).is_err());
        assert!(load_toml(&format!("{MINIMAL}\n[population]\nurl = \"ftp://graph\"\n")).is_err());
        assert!(load_toml(&MINIMAL.replace("[master]\n        host = \"aggregator.example.com\"", "")).is_err());
    }
}
