use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_PROVIDER_URL: &str = "https://trefle.io/api/v1";

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool_size: u32,
    pub bind_addr: SocketAddr,
    pub provider_url: String,
    pub provider_token: String,
    pub provider_timeout: Duration,
    pub bcrypt_cost: u32,
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(Error::Config(format!(".env: {err}")));
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, which keeps parsing testable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let provider_token = lookup("TREFLE_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Config("TREFLE_TOKEN is not set".into()))?;

        Ok(Config {
            database_url: get("DATABASE_URL", "garden.db"),
            pool_size: parse("DB_POOL_SIZE", &get("DB_POOL_SIZE", "8"))?,
            bind_addr: parse("BIND_ADDR", &get("BIND_ADDR", "127.0.0.1:3030"))?,
            provider_url: get("TREFLE_BASE_URL", DEFAULT_PROVIDER_URL),
            provider_token,
            provider_timeout: Duration::from_secs(parse(
                "PROVIDER_TIMEOUT_SECS",
                &get("PROVIDER_TIMEOUT_SECS", "10"),
            )?),
            bcrypt_cost: parse("BCRYPT_COST", &get("BCRYPT_COST", "12"))?,
            session_ttl: Duration::from_secs(parse(
                "SESSION_TTL_SECS",
                &get("SESSION_TTL_SECS", "86400"),
            )?),
        })
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}
