use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::client::{BotIdentity, ClientOptions, RoamClient, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};

const DEFAULT_CONFIG_NAME: &str = "roam.toml";
pub const TOKEN_ENV_VAR: &str = "ROAM_TOKEN";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub profiles: HashMap<String, Profile>,
}

#[derive(Debug, Deserialize)]
pub struct Profile {
    pub bot_name: String,
    pub bot_id: String,
    pub image_url: String,
    /// Falls back to the ROAM_TOKEN environment variable
    pub token: Option<String>,
    /// Default channels used when a send names none
    #[serde(default)]
    pub channels: Vec<String>,
    pub base_url: Option<String>,
    /// Per-request timeout; defaults to 30 seconds
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from an explicit path, or search upward from current dir,
    /// then the user config directory.
    pub fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let path = match path_override {
            Some(p) => p,
            None => find_upwards(DEFAULT_CONFIG_NAME)
                .or_else(user_config_file)
                .context("Failed to locate roam.toml in current, parent or user config directories")?,
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Parsing TOML config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .with_context(|| format!("Profile '{}' not found in config", name))
    }
}

impl Profile {
    pub fn identity(&self) -> Result<BotIdentity> {
        let token = match &self.token {
            Some(t) => t.clone(),
            None => std::env::var(TOKEN_ENV_VAR).with_context(|| {
                format!("No token in profile and {TOKEN_ENV_VAR} is not set")
            })?,
        };
        Ok(
            BotIdentity::new(&self.bot_name, &self.bot_id, &self.image_url, token)
                .with_default_channels(self.channels.iter().cloned()),
        )
    }

    pub fn client(&self) -> Result<RoamClient> {
        let options = ClientOptions {
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            headers: self.headers.clone(),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
        };
        RoamClient::with_options(self.identity()?, options).context("Building Roam client")
    }
}

fn find_upwards(file_name: &str) -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        let candidate = dir.join(file_name);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

fn user_config_file() -> Option<PathBuf> {
    let candidate = dirs::config_dir()?.join("roam").join(DEFAULT_CONFIG_NAME);
    candidate.exists().then_some(candidate)
}
