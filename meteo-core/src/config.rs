use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::{Path, PathBuf}};

use crate::model::CityTarget;

pub const DEFAULT_ENDPOINT: &str = "https://api.open-meteo.com/v1/meteofrance";
pub const DEFAULT_REGION: &str = "eu-west-3";

/// Weather API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    /// Per-attempt request timeout.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Defaults to the platform cache directory.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Destination object and how to reach it.
///
/// Example TOML:
/// [storage]
/// bucket = "weather-data-wcs"
/// key = "weather.csv"
/// region = "eu-west-3"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    /// Path-style S3-compatible endpoint, e.g. a MinIO server.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub upload_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "weather-data-wcs".to_string(),
            key: "weather.csv".to_string(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            upload_retries: 3,
        }
    }
}

/// What to do when one city cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Log the city, leave it out of the dataset and carry on.
    #[default]
    BestEffort,
    /// Stop the run at the first city failure.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub failure_policy: FailurePolicy,
    /// Hourly variables, in output column order.
    pub variables: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            variables: default_variables(),
        }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,

    /// Example TOML:
    /// [[cities]]
    /// name = "Lille"
    /// latitude = 50.6365654
    /// longitude = 3.0635282
    pub cities: Vec<CityTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            cities: default_cities(),
        }
    }
}

impl Config {
    /// Load config from the platform path, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory holding cached API responses.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.cache_dir().join("responses")),
        }
    }

    /// Check the parts of the config a run cannot recover from.
    pub fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!("No cities configured. Add at least one [[cities]] entry.");
        }
        if self.pipeline.variables.is_empty() {
            bail!("No hourly variables configured in [pipeline].variables.");
        }

        let mut seen = HashSet::new();
        for variable in &self.pipeline.variables {
            if !seen.insert(variable.as_str()) {
                bail!("Hourly variable '{variable}' is listed more than once.");
            }
        }

        let mut names = HashSet::new();
        for city in &self.cities {
            if !names.insert(city.name.as_str()) {
                bail!("City '{}' is listed more than once.", city.name);
            }
            if !(-90.0..=90.0).contains(&city.latitude)
                || !(-180.0..=180.0).contains(&city.longitude)
            {
                bail!(
                    "City '{}' has out-of-range coordinates ({}, {}).",
                    city.name,
                    city.latitude,
                    city.longitude
                );
            }
        }

        if self.storage.bucket.is_empty() || self.storage.key.is_empty() {
            bail!("Storage bucket and key must both be set.");
        }

        Ok(())
    }

    /// Convenience helper: set/replace static storage credentials.
    pub fn upsert_storage_credentials(&mut self, access_key_id: String, secret_access_key: String) {
        self.storage.access_key_id = Some(access_key_id);
        self.storage.secret_access_key = Some(secret_access_key);
    }

    pub fn has_storage_credentials(&self) -> bool {
        self.storage.access_key_id.is_some() && self.storage.secret_access_key.is_some()
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "meteo-pipeline", "meteo")
        .ok_or_else(|| anyhow!("Could not determine platform config directory"))
}

pub fn default_variables() -> Vec<String> {
    [
        "temperature_2m",
        "wind_speed_10m",
        "wind_direction_10m",
        "sunshine_duration",
        "precipitation",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_cities() -> Vec<CityTarget> {
    vec![
        CityTarget::new("Lille", 50.6365654, 3.0635282),
        CityTarget::new("Paris", 48.8588897, 2.320041),
        CityTarget::new("Bordeaux", 44.841225, -0.5800364),
        CityTarget::new("Marseille", 43.2961743, 5.3699525),
        CityTarget::new("Lyon", 45.7578137, 4.8320114),
        CityTarget::new("Toulouse", 43.6044622, 1.4442469),
        CityTarget::new("Nantes", 47.2186371, -1.5541362),
        CityTarget::new("Montpellier", 43.610476, 3.87048),
        CityTarget::new("Calais", 50.9524769, 1.8538446),
        CityTarget::new("Dijon", 47.3215806, 5.0414701),
    ]
}
