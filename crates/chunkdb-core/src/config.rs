//! Configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `CHUNKDB_*` env
//! vars (`__` separates nested keys, e.g. `CHUNKDB_REMOTE__API_KEY`).
//! Provides helpers to expand `~` and `${VAR}` and to resolve relative paths
//! against a known base directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::retry::CallOptions;

pub struct Config {
    figment: Figment,
    env_name: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("CHUNKDB_").split("__"));

        let config = Self { figment, env_name };
        config.validate_for_env()?;
        Ok(config)
    }

    /// Build from an explicit figment, e.g. in tests.
    pub fn from_figment(figment: Figment) -> Self { Self { figment, env_name: "test".to_string() } }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    /// Typed view over every section, defaults filled in.
    pub fn settings(&self) -> Result<Settings> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(self.figment.clone())
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    fn validate_for_env(&self) -> Result<()> {
        match self.env_name.as_str() {
            "prod" | "production" => {
                let settings = self.settings()?;
                if let Some(remote) = &settings.remote {
                    if remote.api_key.as_deref().unwrap_or("").is_empty() {
                        return Err(Error::InvalidConfig(
                            "remote.api_key is required in production".into(),
                        ));
                    }
                }
                if let Some(neo4j) = &settings.neo4j {
                    if neo4j.password.is_empty() {
                        return Err(Error::InvalidConfig(
                            "neo4j.password is required in production".into(),
                        ));
                    }
                }
            }
            "dev" | "development" | "test" | "testing" => {}
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lancedb: LanceSettings,
    pub tantivy: TantivySettings,
    pub neo4j: Option<Neo4jSettings>,
    pub remote: Option<RemoteSettings>,
    pub call: CallOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanceSettings {
    /// Local directory or object-store URI.
    pub uri: String,
}

impl Default for LanceSettings {
    fn default() -> Self { Self { uri: "data/lancedb".to_string() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TantivySettings {
    /// One sub-directory per index lives under here.
    pub root_dir: String,
    pub writer_heap_bytes: usize,
}

impl Default for TantivySettings {
    fn default() -> Self {
        Self { root_dir: "data/tantivy".to_string(), writer_heap_bytes: 50_000_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jSettings {
    /// HTTP endpoint, e.g. `http://localhost:7474`.
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Nodes deleted per transaction when purging an index.
    pub delete_batch_size: usize,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:7474".to_string(),
            database: "neo4j".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            delete_batch_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Documents per bulk request.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Pending documents per (index, node label) before writers wait.
    pub queue_capacity: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            api_key: None,
            batch_size: 100,
            flush_interval_ms: 1_000,
            queue_capacity: 10_000,
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    // Expand ~ at start
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
