//! Configuration loader and validator for the roster sync core.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::normalizer::{AliasTable, CanonicalField, Normalizer};
use crate::search::SearchField;
use crate::session::Session;

pub const TOKEN_ENV: &str = "ROSTER_TOKEN";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
const MAX_PAGE_SIZE: u32 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Unknown canonical field in normalizer.extra_aliases: {0}")]
    UnknownField(String),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    #[serde(default)]
    pub search: Search,
    #[serde(default)]
    pub normalizer: NormalizerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    crate::sync::DEFAULT_PAGE_SIZE
}

/// Remote endpoint and the logical database this device is bound to.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub database_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("base_url", &self.base_url)
            .field("database_id", &self.database_id)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Search {
    pub fields: Vec<SearchField>,
}

impl Default for Search {
    fn default() -> Self {
        Self {
            fields: crate::search::DEFAULT_FIELDS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizerSettings {
    /// Canonical field key (camelCase) to extra source column names.
    #[serde(default)]
    pub extra_aliases: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.resolved_data_dir())
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        PathBuf::from(self.app.data_dir.trim())
    }

    /// `DATABASE_URL` when set, otherwise `roster.db` inside the data dir.
    pub fn database_url(&self) -> String {
        match env::var(DATABASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => url,
            _ => format!(
                "sqlite://{}",
                self.resolved_data_dir().join("roster.db").display()
            ),
        }
    }

    /// Session for the configured database; `ROSTER_TOKEN` wins over the file.
    pub fn session(&self) -> Session {
        let token = env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.remote.token.clone());
        Session::new(&self.remote.database_id).with_token(token)
    }

    pub fn normalizer(&self) -> Result<Normalizer, ConfigError> {
        let mut extra = BTreeMap::new();
        for (key, aliases) in &self.normalizer.extra_aliases {
            let field = CanonicalField::from_key(key)
                .ok_or_else(|| ConfigError::UnknownField(key.clone()))?;
            extra.insert(field, aliases.clone());
        }
        Ok(Normalizer::new(AliasTable::default().with_extra(&extra)))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&cfg.app.page_size) {
        return Err(ConfigError::Invalid("app.page_size must be within 1..=5000"));
    }

    let base_url = cfg.remote.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::Invalid(
            "remote.base_url must start with http:// or https://",
        ));
    }
    if cfg.remote.database_id.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.database_id must be non-empty"));
    }

    if cfg.search.fields.is_empty() {
        return Err(ConfigError::Invalid("search.fields must list at least one field"));
    }
    for key in cfg.normalizer.extra_aliases.keys() {
        if CanonicalField::from_key(key).is_none() {
            return Err(ConfigError::UnknownField(key.clone()));
        }
    }
    Ok(())
}

/// Returns the canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  page_size: 500

remote:
  base_url: "https://roster.example.org/"
  database_id: "default"
  token: ""

search:
  fields: [name, voter_identifier]

normalizer:
  extra_aliases: {}
"#
}
