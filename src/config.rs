use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters that MongoDB rejects in database names.
const FORBIDDEN_DB_NAME_CHARS: &[char] =
    &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

const MAX_DB_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid MongoDB URI: {0}")]
    InvalidMongoUri(String),

    #[error("Invalid database name: {0:?}")]
    InvalidDatabaseName(String),

    #[error("Invalid priority {0}: must be an integer >= -1")]
    InvalidPriority(i32),
}

/// Eviction policy selector. `lru` scores connections by usage, idle time
/// and priority; `timeout` closes connections idle past `idle_timeout_ms`;
/// `manual` never closes anything on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionType {
    Manual,
    Timeout,
    #[serde(alias = "LRU")]
    Lru,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Host/port portion of the deployment. Any database path or query
    /// string is stripped; the pool appends `/<dbName>` per connection.
    pub mongo_uri: String,

    /// Database holding the `connection_metadata` collection.
    #[serde(default = "default_metadata_db")]
    pub metadata_db: String,

    /// Database used when a query does not select one explicitly.
    #[serde(default = "default_default_db")]
    pub default_db: String,

    /// Cap on concurrently open connections. `None` = unlimited.
    #[serde(default)]
    pub max_connections: Option<usize>,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// If false, every `get` opens a fresh connection.
    #[serde(default = "default_true")]
    pub cache_connections: bool,

    /// If false, no idle timers are armed.
    #[serde(default = "default_true")]
    pub disconnect_on_idle: bool,

    #[serde(default = "default_eviction")]
    pub eviction: EvictionType,
}

fn default_metadata_db() -> String {
    "polymongo-metadata".to_string()
}

fn default_default_db() -> String {
    "Default-DB".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_eviction() -> EvictionType {
    EvictionType::Lru
}

impl PoolConfig {
    pub fn new(mongo_uri: impl Into<String>) -> Self {
        Self {
            mongo_uri: mongo_uri.into(),
            metadata_db: default_metadata_db(),
            default_db: default_default_db(),
            max_connections: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            cache_connections: true,
            disconnect_on_idle: true,
            eviction: default_eviction(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        sanitize_mongo_uri(&self.mongo_uri)?;
        validate_db_name(&self.metadata_db)?;
        validate_db_name(&self.default_db)?;
        Ok(())
    }

    /// The URI with any path component and query string stripped.
    pub fn base_uri(&self) -> Result<String, ConfigError> {
        sanitize_mongo_uri(&self.mongo_uri)
    }
}

/// Accepts `mongodb://` and `mongodb+srv://` URIs and strips everything
/// after the host list, so callers cannot smuggle a database or options in.
pub fn sanitize_mongo_uri(uri: &str) -> Result<String, ConfigError> {
    let uri = uri.trim();
    let parts = uri
        .strip_prefix("mongodb://")
        .map(|rest| ("mongodb://", rest))
        .or_else(|| {
            uri.strip_prefix("mongodb+srv://")
                .map(|rest| ("mongodb+srv://", rest))
        });

    let (scheme, rest) = match parts {
        Some(parts) => parts,
        None => return Err(ConfigError::InvalidMongoUri(uri.to_string())),
    };

    let host = rest.split(['/', '?']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(ConfigError::InvalidMongoUri(uri.to_string()));
    }

    Ok(format!("{scheme}{host}"))
}

pub fn validate_db_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() || name.len() > MAX_DB_NAME_LEN {
        return Err(ConfigError::InvalidDatabaseName(name.to_string()));
    }
    if name.contains(FORBIDDEN_DB_NAME_CHARS) {
        return Err(ConfigError::InvalidDatabaseName(name.to_string()));
    }
    Ok(())
}

pub fn validate_priority(priority: i32) -> Result<(), ConfigError> {
    if priority < -1 {
        return Err(ConfigError::InvalidPriority(priority));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_sanitization() {
        assert_eq!(
            sanitize_mongo_uri("mongodb://localhost:27017").unwrap(),
            "mongodb://localhost:27017"
        );
        assert_eq!(
            sanitize_mongo_uri("mongodb://localhost:27017/somedb?w=majority").unwrap(),
            "mongodb://localhost:27017"
        );
        assert_eq!(
            sanitize_mongo_uri("mongodb+srv://cluster0.example.net/db").unwrap(),
            "mongodb+srv://cluster0.example.net"
        );
    }

    #[test]
    fn test_uri_rejection() {
        assert!(sanitize_mongo_uri("http://localhost:27017").is_err());
        assert!(sanitize_mongo_uri("mongodb://").is_err());
        assert!(sanitize_mongo_uri("").is_err());
        assert!(sanitize_mongo_uri("mongodb:/localhost").is_err());
    }

    #[test]
    fn test_db_name_validation() {
        assert!(validate_db_name("tenant_42").is_ok());
        assert!(validate_db_name("Default-DB").is_ok());

        assert!(validate_db_name("").is_err());
        assert!(validate_db_name("   ").is_err());
        assert!(validate_db_name(&"x".repeat(65)).is_err());
        for bad in [
            "a/b", "a\\b", "a.b", "a b", "a\"b", "a$b", "a*b", "a<b", "a>b", "a:b", "a|b", "a?b",
        ] {
            assert!(validate_db_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_priority_validation() {
        assert!(validate_priority(-1).is_ok());
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(10000).is_ok());
        assert!(validate_priority(-2).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::new("mongodb://localhost:27017");
        assert_eq!(config.metadata_db, "polymongo-metadata");
        assert_eq!(config.default_db, "Default-DB");
        assert_eq!(config.max_connections, None);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert!(config.cache_connections);
        assert!(config.disconnect_on_idle);
        assert_eq!(config.eviction, EvictionType::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_eviction_type_aliases() {
        let parsed: EvictionType = serde_json::from_str("\"LRU\"").unwrap();
        assert_eq!(parsed, EvictionType::Lru);
        let parsed: EvictionType = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(parsed, EvictionType::Timeout);
        let parsed: EvictionType = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(parsed, EvictionType::Manual);
    }
}
