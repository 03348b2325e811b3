use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::Duration;

pub const DEFAULT_OTP_VALID_SECONDS: i64 = 120;
pub const DEFAULT_OVERRIDE_COOLDOWN_SECONDS: i64 = 300;

/// Timing rules of the attendance engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub otp_validity: Duration,
    pub override_cooldown: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            otp_validity: Duration::seconds(DEFAULT_OTP_VALID_SECONDS),
            override_cooldown: Duration::seconds(DEFAULT_OVERRIDE_COOLDOWN_SECONDS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub policy: Policy,
    pub reset_jobs_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_addr = parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5u32)?;
        let otp_validity = parse_or(&lookup, "OTP_VALID_SECONDS", DEFAULT_OTP_VALID_SECONDS)?;
        let override_cooldown = parse_or(
            &lookup,
            "OVERRIDE_COOLDOWN_SECONDS",
            DEFAULT_OVERRIDE_COOLDOWN_SECONDS,
        )?;
        let reset_jobs_enabled = parse_or(&lookup, "RESET_JOBS_ENABLED", true)?;

        if otp_validity <= 0 {
            return Err(anyhow!("OTP_VALID_SECONDS must be positive, got {}", otp_validity));
        }
        if override_cooldown < 0 {
            return Err(anyhow!(
                "OVERRIDE_COOLDOWN_SECONDS must not be negative, got {}",
                override_cooldown
            ));
        }

        Ok(Self {
            bind_addr,
            database_url,
            database_max_connections,
            policy: Policy {
                otp_validity: Duration::seconds(otp_validity),
                override_cooldown: Duration::seconds(override_cooldown),
            },
            reset_jobs_enabled,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: `{}`", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:3000");
        assert_eq!(config.database_url, None);
        assert_eq!(config.policy, Policy::default());
        assert!(config.reset_jobs_enabled);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("BIND_ADDR", "0.0.0.0:8080"),
            ("DATABASE_URL", "postgres://localhost/attendance"),
            ("OTP_VALID_SECONDS", "60"),
            ("OVERRIDE_COOLDOWN_SECONDS", "600"),
            ("RESET_JOBS_ENABLED", "false"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/attendance"));
        assert_eq!(config.policy.otp_validity, Duration::seconds(60));
        assert_eq!(config.policy.override_cooldown, Duration::seconds(600));
        assert!(!config.reset_jobs_enabled);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(config_from(&[("OTP_VALID_SECONDS", "two minutes")]).is_err());
        assert!(config_from(&[("OTP_VALID_SECONDS", "0")]).is_err());
        assert!(config_from(&[("BIND_ADDR", "nowhere")]).is_err());
    }
}
