use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::db::Database;
use crate::gmail::client::GMAIL_API_BASE;
use crate::sealed::{parse_seal_key_hex, SealKey};

pub const DB_PATH_ENV: &str = "MAILCORE_DB_PATH";
pub const REFRESH_URL_ENV: &str = "MAILCORE_REFRESH_URL";
pub const TOKEN_CACHE_KEY_ENV: &str = "MAILCORE_TOKEN_CACHE_KEY";
pub const GMAIL_API_BASE_ENV: &str = "MAILCORE_GMAIL_API_BASE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub refresh_url: Option<String>,
    pub token_cache_key: Option<String>,
    pub gmail_api_base: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Resolve settings through `lookup`; blank values count as unset.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let db_path = match get(DB_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => Database::default_db_path().context("resolve default mailcore database path")?,
        };

        Ok(Self {
            db_path,
            refresh_url: get(REFRESH_URL_ENV),
            token_cache_key: get(TOKEN_CACHE_KEY_ENV),
            gmail_api_base: get(GMAIL_API_BASE_ENV).unwrap_or_else(|| GMAIL_API_BASE.to_string()),
        })
    }

    pub fn seal_key(&self) -> Result<Option<SealKey>> {
        self.token_cache_key
            .as_deref()
            .map(parse_seal_key_hex)
            .transpose()
            .with_context(|| {
                format!("{TOKEN_CACHE_KEY_ENV} must be 64 hex characters (32 bytes)")
            })
    }
}
