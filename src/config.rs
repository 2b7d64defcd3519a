use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: i64,
    pub push_buffer: usize,
}

impl Config {
    /// Reads the environment, after `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();

        Ok(Config {
            database_url: var_or("DATABASE_URL", "sqlite://parrotnest.db?mode=rwc"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 16)?,
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 5000)))?,
            jwt_secret: dotenv::var("JWT_SECRET").ok().filter(|secret| !secret.is_empty()),
            token_ttl_hours: parse_or("TOKEN_TTL_HOURS", 24)?,
            push_buffer: parse_or("PUSH_BUFFER", 64)?,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    dotenv::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{key}={value} is not valid")),
        Err(_) => Ok(default),
    }
}
