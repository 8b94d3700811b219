//! Configuration module
//!
//! Environment-driven configuration for the API service. All service objects
//! are constructed from this struct at startup and injected explicitly; there
//! are no module-level singletons.

use std::env;

use anyhow::Context;

// Common constants
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const JWT_EXPIRY_HOURS: i64 = 24;
const HTTP_RATE_LIMIT_PER_MINUTE: u32 = 100;
const SIGNUP_CREDIT_GRANT: i64 = 30;
const IMAGE_GENERATION_COST: i64 = 1;
const VIDEO_GENERATION_COST: i64 = 5;
const EDIT_COST: i64 = 1;
const GENERATION_POLL_INTERVAL_MS: u64 = 2_000;
const GENERATION_DEADLINE_SECS: u64 = 180;
const TRUSTED_PROXY_COUNT: usize = 1;

/// Application configuration, loaded once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub environment: String,
    pub cors_origins: Vec<String>,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Service-to-service key guarding provisioning/grant endpoints
    pub service_api_key: Option<String>,
    pub http_rate_limit_per_minute: u32,
    /// Per-authenticated-identity limit; falls back to the global limit
    pub http_identity_rate_limit_per_minute: Option<u32>,
    pub trusted_proxy_count: usize,
    // Credit metering
    pub signup_credit_grant: i64,
    pub image_generation_cost: i64,
    pub video_generation_cost: i64,
    pub edit_cost: i64,
    // Generation backend
    pub generation_base_url: String,
    pub generation_api_key: Option<String>,
    pub generation_poll_interval_ms: u64,
    /// Overall wait bound for one generation, polling included
    pub generation_deadline_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let generation_base_url = env::var("GENERATION_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:9800".to_string());

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
        let cors_origins = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            cors_origins,
            database_url,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| MAX_CONNECTIONS.to_string())
                .parse()
                .unwrap_or(MAX_CONNECTIONS),
            db_timeout_seconds: env::var("DB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| CONNECTION_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(CONNECTION_TIMEOUT_SECS),
            jwt_secret,
            jwt_expiry_hours: env::var("JWT_EXPIRY_HOURS")
                .unwrap_or_else(|_| JWT_EXPIRY_HOURS.to_string())
                .parse()
                .unwrap_or(JWT_EXPIRY_HOURS),
            service_api_key: env::var("SERVICE_API_KEY").ok().filter(|k| !k.is_empty()),
            http_rate_limit_per_minute: env::var("HTTP_RATE_LIMIT_PER_MINUTE")
                .unwrap_or_else(|_| HTTP_RATE_LIMIT_PER_MINUTE.to_string())
                .parse()
                .unwrap_or(HTTP_RATE_LIMIT_PER_MINUTE),
            http_identity_rate_limit_per_minute: env::var("HTTP_IDENTITY_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok()),
            trusted_proxy_count: env::var("TRUSTED_PROXY_COUNT")
                .unwrap_or_else(|_| TRUSTED_PROXY_COUNT.to_string())
                .parse()
                .unwrap_or(TRUSTED_PROXY_COUNT),
            signup_credit_grant: env::var("SIGNUP_CREDIT_GRANT")
                .unwrap_or_else(|_| SIGNUP_CREDIT_GRANT.to_string())
                .parse()
                .unwrap_or(SIGNUP_CREDIT_GRANT),
            image_generation_cost: env::var("IMAGE_GENERATION_COST")
                .unwrap_or_else(|_| IMAGE_GENERATION_COST.to_string())
                .parse()
                .unwrap_or(IMAGE_GENERATION_COST),
            video_generation_cost: env::var("VIDEO_GENERATION_COST")
                .unwrap_or_else(|_| VIDEO_GENERATION_COST.to_string())
                .parse()
                .unwrap_or(VIDEO_GENERATION_COST),
            edit_cost: env::var("EDIT_COST")
                .unwrap_or_else(|_| EDIT_COST.to_string())
                .parse()
                .unwrap_or(EDIT_COST),
            generation_base_url,
            generation_api_key: env::var("GENERATION_API_KEY").ok().filter(|k| !k.is_empty()),
            generation_poll_interval_ms: env::var("GENERATION_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| GENERATION_POLL_INTERVAL_MS.to_string())
                .parse()
                .unwrap_or(GENERATION_POLL_INTERVAL_MS),
            generation_deadline_secs: env::var("GENERATION_DEADLINE_SECS")
                .unwrap_or_else(|_| GENERATION_DEADLINE_SECS.to_string())
                .parse()
                .unwrap_or(GENERATION_DEADLINE_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 characters");
        }
        if self.signup_credit_grant < 0 {
            anyhow::bail!("SIGNUP_CREDIT_GRANT must not be negative");
        }
        if self.image_generation_cost < 1 || self.video_generation_cost < 1 || self.edit_cost < 1 {
            anyhow::bail!("generation costs must be at least 1 credit");
        }
        if self.generation_deadline_secs == 0 {
            anyhow::bail!("GENERATION_DEADLINE_SECS must be greater than zero");
        }
        if self.generation_poll_interval_ms == 0 {
            anyhow::bail!("GENERATION_POLL_INTERVAL_MS must be greater than zero");
        }
        Ok(())
    }

    pub fn credit_costs(&self) -> crate::models::CreditCosts {
        crate::models::CreditCosts {
            image_generation: self.image_generation_cost,
            video_generation: self.video_generation_cost,
            edit: self.edit_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server_port: 8080,
            environment: "test".to_string(),
            cors_origins: vec!["*".to_string()],
            database_url: "postgres://localhost/pixora_test".to_string(),
            db_max_connections: MAX_CONNECTIONS,
            db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            jwt_expiry_hours: JWT_EXPIRY_HOURS,
            service_api_key: None,
            http_rate_limit_per_minute: HTTP_RATE_LIMIT_PER_MINUTE,
            http_identity_rate_limit_per_minute: None,
            trusted_proxy_count: 1,
            signup_credit_grant: SIGNUP_CREDIT_GRANT,
            image_generation_cost: IMAGE_GENERATION_COST,
            video_generation_cost: VIDEO_GENERATION_COST,
            edit_cost: EDIT_COST,
            generation_base_url: "http://localhost:9800".to_string(),
            generation_api_key: None,
            generation_poll_interval_ms: GENERATION_POLL_INTERVAL_MS,
            generation_deadline_secs: GENERATION_DEADLINE_SECS,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_jwt_secret() {
        let mut config = test_config();
        config.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cost() {
        let mut config = test_config();
        config.image_generation_cost = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_production() {
        let mut config = test_config();
        assert!(!config.is_production());
        config.environment = "Production".to_string();
        assert!(config.is_production());
    }

    #[test]
    fn test_credit_costs_mapping() {
        let costs = test_config().credit_costs();
        assert_eq!(costs.image_generation, 1);
        assert_eq!(costs.video_generation, 5);
    }
}
