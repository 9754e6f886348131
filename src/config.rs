use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Shared secret for verifying session-registration tokens (HS256).
    pub jwt_secret: String,
    /// Consumer group name shared by every instance of this service.
    pub consumer_group: String,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8000);
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        if jwt_secret.len() < 32 {
            return Err(AppError::Config(
                "JWT_SECRET must be at least 32 bytes".into(),
            ));
        }
        let consumer_group =
            env::var("CONSUMER_GROUP").unwrap_or_else(|_| "notify-service".into());

        Ok(Self {
            database_url,
            redis_url,
            port,
            jwt_secret,
            consumer_group,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://127.0.0.1:6379/0".into(),
            port: 8000,
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            consumer_group: "notify-service".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = Config::test_defaults();
        assert_eq!(cfg.port, 8000);
        assert!(cfg.jwt_secret.len() >= 32);
        assert_eq!(cfg.consumer_group, "notify-service");
    }
}
