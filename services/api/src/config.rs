//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use studius_core::domain::DEFAULT_STARTING_CREDITS;
use studius_core::UltraSettings;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub study_model: String,
    pub exam_model: String,
    pub sst_model: String,
    pub starting_credits: i64,
    pub ultra_section_delay: Duration,
    pub ultra_section_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub job_lease: Duration,
    pub payment_webhook_secret: String,
    pub cors_origin: String,
    pub support_email: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address = parsed("BIND_ADDRESS", "0.0.0.0:3000")?;
        let database_url = required("DATABASE_URL")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Model Settings ---
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let study_model = or_default("STUDY_MODEL", "gpt-4o-mini");
        let exam_model = or_default("EXAM_MODEL", "gpt-4o");
        let sst_model = or_default("SST_MODEL", "whisper-1");

        // --- Load Credits, Jobs and Payments ---
        let starting_credits: i64 =
            parsed("STARTING_CREDITS", &DEFAULT_STARTING_CREDITS.to_string())?;
        if starting_credits < 0 {
            return Err(ConfigError::InvalidValue(
                "STARTING_CREDITS".to_string(),
                "must not be negative".to_string(),
            ));
        }
        let ultra_section_delay =
            Duration::from_millis(parsed("ULTRA_SECTION_DELAY_MS", "2000")?);
        let ultra_section_timeout =
            Duration::from_secs(parsed("ULTRA_SECTION_TIMEOUT_SECS", "120")?);
        let worker_poll_interval =
            Duration::from_secs(parsed("WORKER_POLL_INTERVAL_SECS", "5")?);
        let job_lease = Duration::from_secs(parsed("JOB_LEASE_SECS", "1800")?);
        let payment_webhook_secret = required("PAYMENT_WEBHOOK_SECRET")?;

        let cors_origin = or_default("CORS_ORIGIN", "http://localhost:3000");
        let support_email = or_default("SUPPORT_EMAIL", "support@studius.ai");

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            study_model,
            exam_model,
            sst_model,
            starting_credits,
            ultra_section_delay,
            ultra_section_timeout,
            worker_poll_interval,
            job_lease,
            payment_webhook_secret,
            cors_origin,
            support_email,
        })
    }

    pub fn ultra_settings(&self) -> UltraSettings {
        UltraSettings {
            section_delay: self.ultra_section_delay,
            section_timeout: self.ultra_section_timeout,
            job_lease: self.job_lease,
            ..UltraSettings::default()
        }
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    or_default(name, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
