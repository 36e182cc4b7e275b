// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Service configuration.
//!
//! Loaded from `~/.ragserve/config.json` (or an explicit path), falling back
//! to built-in defaults, then overridden by `RAGSERVE_*` environment
//! variables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::drivers::DriverKind;
use crate::security::mask_secret;

pub const DEFAULT_PORT: u16 = 4321;
pub const DEFAULT_AUTH_KEY: &str = "admin123";
pub const DEFAULT_SECRET_KEY: &str = "admin123";
pub const DEFAULT_ISSUER: &str = "server";
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 3600;

/// One backend descriptor to seed into an empty driver pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSeed {
    pub uri: String,
    pub kind: DriverKind,
}

impl DriverSeed {
    pub fn new(uri: impl Into<String>, kind: DriverKind) -> Self {
        Self {
            uri: uri.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Static access key exchanged for a session token.
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
    /// HMAC key signing session tokens.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    /// `iss` claim written into and required from every token.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_sessions_db_path")]
    pub sessions_db_path: PathBuf,
    #[serde(default = "default_llm_drivers_db_path")]
    pub llm_drivers_db_path: PathBuf,
    #[serde(default = "default_session_lifetime_secs")]
    pub session_lifetime_secs: u64,
    /// Seeded into the pool only when the persisted table is empty.
    #[serde(default = "default_drivers")]
    pub drivers: Vec<DriverSeed>,
    #[serde(default = "default_local_model")]
    pub local_model: String,
    #[serde(default = "default_hosted_model")]
    pub hosted_model: String,
    #[serde(default)]
    pub hosted_api_key: Option<String>,
    /// LibreTranslate-compatible endpoint. Without one, translation always
    /// falls back to the untranslated text.
    #[serde(default)]
    pub translator_url: Option<String>,
    #[serde(default = "default_rate_limit_enabled")]
    pub rate_limit_enabled: bool,
}

fn default_auth_key() -> String {
    DEFAULT_AUTH_KEY.to_string()
}

fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY.to_string()
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_sessions_db_path() -> PathBuf {
    PathBuf::from("./storage/sessions.sql")
}

fn default_llm_drivers_db_path() -> PathBuf {
    PathBuf::from("./storage/llm_drivers.sql")
}

fn default_session_lifetime_secs() -> u64 {
    DEFAULT_SESSION_LIFETIME_SECS
}

fn default_drivers() -> Vec<DriverSeed> {
    vec![
        DriverSeed::new("http://localhost:11434", DriverKind::Local),
        DriverSeed::new("https://openrouter.ai/api/v1", DriverKind::Hosted),
    ]
}

fn default_local_model() -> String {
    "llama3.2".to_string()
}

fn default_hosted_model() -> String {
    "openrouter/auto".to_string()
}

fn default_rate_limit_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_key: default_auth_key(),
            secret_key: default_secret_key(),
            issuer: default_issuer(),
            port: default_port(),
            bind_address: default_bind_address(),
            sessions_db_path: default_sessions_db_path(),
            llm_drivers_db_path: default_llm_drivers_db_path(),
            session_lifetime_secs: default_session_lifetime_secs(),
            drivers: default_drivers(),
            local_model: default_local_model(),
            hosted_model: default_hosted_model(),
            hosted_api_key: None,
            translator_url: None,
            rate_limit_enabled: default_rate_limit_enabled(),
        }
    }
}

/// Default location of the config file: `~/.ragserve/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".ragserve").join("config.json"))
}

impl Config {
    /// Load from `path` (or the default location), then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RAGSERVE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RAGSERVE_AUTH_KEY") {
            self.auth_key = v;
        }
        if let Some(v) = lookup("RAGSERVE_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Some(v) = lookup("RAGSERVE_ISSUER") {
            self.issuer = v;
        }
        if let Some(v) = lookup("RAGSERVE_PORT") {
            self.port = v
                .parse()
                .with_context(|| format!("RAGSERVE_PORT is not a port number: {}", v))?;
        }
        if let Some(v) = lookup("RAGSERVE_BIND") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("RAGSERVE_SESSIONS_DB") {
            self.sessions_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RAGSERVE_DRIVERS_DB") {
            self.llm_drivers_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RAGSERVE_SESSION_LIFETIME") {
            self.session_lifetime_secs = v
                .parse()
                .with_context(|| format!("RAGSERVE_SESSION_LIFETIME is not a number: {}", v))?;
        }
        if let Some(v) = lookup("RAGSERVE_LOCAL_MODEL") {
            self.local_model = v;
        }
        if let Some(v) = lookup("RAGSERVE_HOSTED_MODEL") {
            self.hosted_model = v;
        }
        if let Some(v) = lookup("OPENROUTER_API_KEY") {
            self.hosted_api_key = Some(v);
        }
        if let Some(v) = lookup("RAGSERVE_TRANSLATOR_URL") {
            self.translator_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_lifetime_secs == 0 {
            bail!("session_lifetime_secs must be greater than zero");
        }
        if self.drivers.is_empty() {
            bail!("at least one LLM driver must be configured");
        }
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.auth_key == DEFAULT_AUTH_KEY || self.secret_key == DEFAULT_SECRET_KEY {
            tracing::warn!(
                "Default access or signing key in use. Set RAGSERVE_AUTH_KEY and \
                 RAGSERVE_SECRET_KEY before exposing the service."
            );
        }
        Ok(())
    }

    pub fn session_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_lifetime_secs.min(i64::MAX as u64) as i64)
    }

    /// Pretty JSON with every secret masked.
    pub fn to_display_json(&self) -> Result<String> {
        let mut shown = self.clone();
        shown.auth_key = mask_secret(&shown.auth_key);
        shown.secret_key = mask_secret(&shown.secret_key);
        shown.hosted_api_key = shown.hosted_api_key.as_deref().map(mask_secret);
        Ok(serde_json::to_string_pretty(&shown)?)
    }
}
