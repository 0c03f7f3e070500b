//! Server configuration module
//! Handles dynamic configuration parameters for the relay server

use crate::constants::{DEFAULT_HOST, DEFAULT_PORT};
use crate::error::Result;
use std::env;

/// Origins the server accepts cross-origin requests from
#[derive(Debug, Clone, PartialEq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins (`*` or a comma-separated allow-list)
    pub cors_origins: CorsOrigins,
    /// Secret gating admin routes; None disables gating
    pub admin_key: Option<String>,
    /// Presence selects the shared Redis backend
    pub redis_url: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let cors_origins = match env::var("CORS_ORIGIN") {
            Ok(raw) if raw.trim() != "*" && !raw.trim().is_empty() => CorsOrigins::List(
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect(),
            ),
            _ => CorsOrigins::Any,
        };

        // An empty key means the deployment opted out of gating
        let admin_key = env::var("ADMIN_KEY").ok().filter(|key| !key.is_empty());

        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

        Ok(Self {
            host,
            port,
            cors_origins,
            admin_key,
            redis_url,
        })
    }

    /// Create a test configuration
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: CorsOrigins::Any,
            admin_key: None,
            redis_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_defaults() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.cors_origins, CorsOrigins::Any);
        assert!(config.admin_key.is_none());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_cors_origin_list_parsing() {
        env::set_var("CORS_ORIGIN", "https://a.example, https://b.example");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(
            config.cors_origins,
            CorsOrigins::List(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        env::remove_var("CORS_ORIGIN");
    }

    #[test]
    fn test_empty_admin_key_disables_gating() {
        env::set_var("ADMIN_KEY", "");
        let config = ServerConfig::from_env().unwrap();
        assert!(config.admin_key.is_none());
        env::remove_var("ADMIN_KEY");
    }
}
