use crate::sufy::dispatch::Endpoint;
use crate::sufy::types::MultipartConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Connection settings for one Sufy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service URL, e.g. https://sufy.example.com
    pub endpoint: String,

    /// Access key
    pub access_key: String,

    /// Secret key
    pub secret_key: String,

    /// Region used as the default bucket location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Address buckets as /{bucket}/{key} instead of {bucket}.host (default: true)
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Optional default bucket name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,

    /// High-level multipart upload settings
    #[serde(default)]
    pub multipart: MultipartConfig,
}

fn default_force_path_style() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            region: None,
            force_path_style: default_force_path_style(),
            bucket: None,
            request_timeout_secs: default_request_timeout(),
            insecure_tls: false,
            multipart: MultipartConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            ..Self::default()
        }
    }

    /// Check that the endpoint parses and credentials are present
    pub fn validate(&self) -> Result<()> {
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            anyhow::bail!("access key and secret key must both be set");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request timeout must be at least one second");
        }
        Endpoint::parse(&self.endpoint, self.force_path_style)
            .with_context(|| format!("Invalid endpoint: {:?}", self.endpoint))?;
        Ok(())
    }
}

/// Configuration file: named client profiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: HashMap<String, ClientConfig>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&ClientConfig> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else if self.profiles.len() == 1 {
            self.profiles.values().next()
        } else {
            None
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Load a client configuration from environment variables
///
/// - SUFY_ENDPOINT (required)
/// - SUFY_ACCESS_KEY / SUFY_SECRET_KEY (required)
/// - SUFY_REGION, SUFY_BUCKET (optional)
/// - SUFY_FORCE_PATH_STYLE (optional, defaults to true)
/// - SUFY_REQUEST_TIMEOUT (optional, seconds)
/// - SUFY_INSECURE_TLS (optional)
pub fn load_from_env() -> Result<ClientConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let endpoint =
        std::env::var("SUFY_ENDPOINT").context("SUFY_ENDPOINT environment variable not set")?;
    let access_key = std::env::var("SUFY_ACCESS_KEY")
        .context("SUFY_ACCESS_KEY environment variable not set")?;
    let secret_key = std::env::var("SUFY_SECRET_KEY")
        .context("SUFY_SECRET_KEY environment variable not set")?;

    let mut config = ClientConfig::new(endpoint.trim(), &access_key, &secret_key);
    config.region = std::env::var("SUFY_REGION").ok().filter(|r| !r.is_empty());
    config.bucket = std::env::var("SUFY_BUCKET").ok().filter(|b| !b.is_empty());

    if let Some(path_style) = env_flag("SUFY_FORCE_PATH_STYLE") {
        config.force_path_style = path_style;
    }
    if let Some(insecure) = env_flag("SUFY_INSECURE_TLS") {
        config.insecure_tls = insecure;
    }
    if let Ok(timeout) = std::env::var("SUFY_REQUEST_TIMEOUT") {
        config.request_timeout_secs = timeout
            .trim()
            .parse()
            .context(format!("SUFY_REQUEST_TIMEOUT is not a number: {:?}", timeout))?;
    }

    config.validate()?;
    Ok(config)
}

/// Load a client configuration from a file profile or the environment
///
/// With a path, the named profile (or the file's default) is used;
/// otherwise the environment is read.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<ClientConfig> {
    let Some(path) = config_path else {
        return load_from_env();
    };

    let config = load_from_yaml(path)?;
    let profile = match config.get_profile(profile_name) {
        Some(profile) => profile.clone(),
        None => match profile_name {
            Some(name) => anyhow::bail!("Profile '{}' not found in config file", name),
            None => anyhow::bail!("No default profile in config file {}", path),
        },
    };

    profile
        .validate()
        .context(format!("Invalid profile in {}", path))?;
    Ok(profile)
}
