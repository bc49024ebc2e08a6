//! Runtime configuration, read from plain environment variables at startup
//! (no config-file parser: the core has no CLI of its own, `§1` Non-goals).

use std::env;

use neotoma_models::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub default_interpretation_quota: i32,
    pub merge_redirect_hop_limit: u32,
}

impl Config {
    pub const DEFAULT_INTERPRETATION_QUOTA: i32 = 1000;
    pub const DEFAULT_MERGE_REDIRECT_HOP_LIMIT: u32 = 64;

    /// Reads `DATABASE_URL` (required), `DEFAULT_INTERPRETATION_QUOTA` and
    /// `MERGE_REDIRECT_HOP_LIMIT` (both optional, falling back to the
    /// `const` defaults above).
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| Error::invalid("DATABASE_URL must be set"))?;
        let default_interpretation_quota = env_or("DEFAULT_INTERPRETATION_QUOTA", Self::DEFAULT_INTERPRETATION_QUOTA)?;
        let merge_redirect_hop_limit =
            env_or("MERGE_REDIRECT_HOP_LIMIT", Self::DEFAULT_MERGE_REDIRECT_HOP_LIMIT)?;

        Ok(Config {
            database_url,
            default_interpretation_quota,
            merge_redirect_hop_limit,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::invalid(format!("{key} is not a valid value: {e}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(Error::invalid(format!("{key} is not valid unicode"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default() {
        let key = "NEOTOMA_TEST_CONFIG_ENV_OR_DEFAULT_PROBE";
        assert!(env::var(key).is_err());
        let value: i32 = env_or(key, 42).unwrap();
        assert_eq!(value, 42);
    }
}
