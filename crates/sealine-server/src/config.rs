//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind. Env: `SEALINE_HOST`. Default: `0.0.0.0`.
    pub host: String,

    /// TCP port. Env: `SEALINE_PORT`. Default: `3000`.
    pub port: u16,

    /// SQLite database path. Env: `SEALINE_DB_PATH`. Default: `sealine.db`.
    pub db_path: PathBuf,

    /// HMAC secret for JWT signing. Env: `SEALINE_JWT_SECRET`.
    /// Default: a dev-only placeholder.
    pub jwt_secret: String,

    /// Prekey count below which the owner is asked to replenish.
    /// Env: `SEALINE_PREKEY_LOW_WATER`. Default: `10`.
    pub prekey_low_water: u32,

    /// How long a live push waits for the recipient's ACK.
    /// Env: `SEALINE_ACK_TIMEOUT_SECS`. Default: `5`.
    pub ack_timeout: Duration,

    /// Lifetime of an issued verification code.
    /// Env: `SEALINE_OTP_TTL_SECS`. Default: `300`.
    pub otp_ttl: Duration,

    /// Maximum live-push retries before the envelope is left to the queue.
    /// Env: `SEALINE_PUSH_RETRY_MAX`. Default: `3`.
    pub push_retry_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_path: PathBuf::from("sealine.db"),
            jwt_secret: "dev-secret-change-me".to_string(),
            prekey_low_water: 10,
            ack_timeout: Duration::from_secs(5),
            otp_ttl: Duration::from_secs(300),
            push_retry_max: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults. Malformed values are reported and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("SEALINE_HOST") {
            config.host = host;
        }

        if let Ok(val) = std::env::var("SEALINE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid SEALINE_PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("SEALINE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(secret) = std::env::var("SEALINE_JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }

        if let Ok(val) = std::env::var("SEALINE_PREKEY_LOW_WATER") {
            match val.parse::<u32>() {
                Ok(n) => config.prekey_low_water = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid SEALINE_PREKEY_LOW_WATER, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("SEALINE_ACK_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.ack_timeout = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid SEALINE_ACK_TIMEOUT_SECS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("SEALINE_OTP_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.otp_ttl = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid SEALINE_OTP_TTL_SECS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("SEALINE_PUSH_RETRY_MAX") {
            match val.parse::<u32>() {
                Ok(n) => config.push_retry_max = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid SEALINE_PUSH_RETRY_MAX, using default")
                }
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.prekey_low_water, 10);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.otp_ttl, Duration::from_secs(300));
    }
}
