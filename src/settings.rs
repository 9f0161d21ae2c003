//! Engine settings from the environment (`.env` honored via dotenvy).

use crate::error::DbError;
use std::time::Duration;

pub const DEFAULT_SCHEMA: &str = "public";

/// Schema sync holds the advisory lock on one pooled connection while running DDL on another.
pub const MIN_CONNECTIONS: u32 = 2;

#[derive(Clone, Debug)]
pub struct DatabaseSettings {
    pub database_url: String,
    /// Schema for entity tables and the `_neo_*` bookkeeping tables.
    pub schema: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Upper bound for any single statement round trip.
    pub statement_timeout: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            database_url: "postgres://localhost/neo".into(),
            schema: DEFAULT_SCHEMA.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_millis(5_000),
            statement_timeout: Duration::from_millis(30_000),
        }
    }
}

impl DatabaseSettings {
    /// Read `DATABASE_URL`, `NEO_DB_SCHEMA`, `NEO_DB_MAX_CONNECTIONS`,
    /// `NEO_DB_ACQUIRE_TIMEOUT_MS` and `NEO_DB_STATEMENT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, DbError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an explicit lookup, so callers can layer their own sources.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DbError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DatabaseSettings::default();
        let schema = lookup("NEO_DB_SCHEMA")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.schema);
        if !is_valid_identifier(&schema) {
            return Err(DbError::Config(format!("NEO_DB_SCHEMA '{}' is not a valid identifier", schema)));
        }
        let settings = DatabaseSettings {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            schema,
            max_connections: parse_number(&lookup, "NEO_DB_MAX_CONNECTIONS")?
                .map(|n| n as u32)
                .unwrap_or(defaults.max_connections),
            acquire_timeout: parse_number(&lookup, "NEO_DB_ACQUIRE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
            statement_timeout: parse_number(&lookup, "NEO_DB_STATEMENT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.statement_timeout),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.max_connections < MIN_CONNECTIONS {
            return Err(DbError::Config(format!(
                "NEO_DB_MAX_CONNECTIONS must be at least {}, got {}",
                MIN_CONNECTIONS, self.max_connections
            )));
        }
        if !is_valid_identifier(&self.schema) {
            return Err(DbError::Config(format!("schema '{}' is not a valid identifier", self.schema)));
        }
        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Result<Option<u64>, DbError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| DbError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))),
    }
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let s = DatabaseSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(s.schema, "public");
        assert_eq!(s.max_connections, 10);
        assert_eq!(s.statement_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reads_overrides() {
        let s = DatabaseSettings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://db/app"),
            ("NEO_DB_SCHEMA", "tenant_a"),
            ("NEO_DB_MAX_CONNECTIONS", "3"),
            ("NEO_DB_STATEMENT_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(s.database_url, "postgres://db/app");
        assert_eq!(s.schema, "tenant_a");
        assert_eq!(s.max_connections, 3);
        assert_eq!(s.statement_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_numbers_and_schema() {
        let err = DatabaseSettings::from_lookup(lookup_from(&[("NEO_DB_MAX_CONNECTIONS", "many")])).unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
        let err = DatabaseSettings::from_lookup(lookup_from(&[("NEO_DB_SCHEMA", "bad-name;")])).unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }

    #[test]
    fn pool_must_fit_lock_and_work_connections() {
        let err = DatabaseSettings::from_lookup(lookup_from(&[("NEO_DB_MAX_CONNECTIONS", "1")])).unwrap_err();
        assert!(matches!(err, DbError::Config(ref m) if m.contains("at least 2")));
        let by_hand = DatabaseSettings {
            max_connections: 1,
            ..DatabaseSettings::default()
        };
        assert!(by_hand.validate().is_err());
        assert!(DatabaseSettings::default().validate().is_ok());
    }
}
