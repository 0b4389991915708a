/// Configuration management for the review workflow engine
///
/// Handles the database connection and review behaviour. Values come from
/// environment variables so the same binary runs unchanged in containers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Reviewer submission behaviour
    pub review: ReviewConfig,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g. "sqlite://data/reviewflow.db", "sqlite::memory:")
    pub url: String,
    /// Upper bound of pooled connections
    pub max_connections: u32,
}

/// Reviewer submission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// When false, any user may decide any task (no assignee check)
    pub require_login: bool,
    /// Table receiving audit records
    pub audit_table: String,
    /// Root directory for submission attachments; uploads are refused when unset
    pub attachment_dir: Option<PathBuf>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("REVIEWFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/reviewflow.db".to_string()),
                max_connections: std::env::var("REVIEWFLOW_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            review: ReviewConfig {
                require_login: std::env::var("REVIEWFLOW_REQUIRE_LOGIN")
                    .map(|v| parse_flag(&v))
                    .unwrap_or(true),
                audit_table: std::env::var("REVIEWFLOW_AUDIT_TABLE")
                    .unwrap_or_else(|_| crate::runtime::audit::DEFAULT_AUDIT_TABLE.to_string()),
                attachment_dir: std::env::var("REVIEWFLOW_ATTACHMENT_DIR")
                    .ok()
                    .filter(|dir| !dir.trim().is_empty())
                    .map(PathBuf::from),
            },
        }
    }
}

/// Anything but an explicit "off" keeps the check enabled
fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(parse_flag("garbage"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(" OFF "));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn serializes() {
        let config = Config {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            review: ReviewConfig {
                require_login: false,
                audit_table: "op_log".to_string(),
                attachment_dir: None,
            },
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["database"]["url"], "sqlite::memory:");
        assert_eq!(json["review"]["require_login"], false);
    }
}
