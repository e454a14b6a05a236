//! Engine configuration loader.
//!
//! Reads `dagrun.toml` and deserializes it into [`EngineConfig`]. Falls back
//! to defaults when the file is missing or malformed, then applies
//! environment overrides.

use std::path::Path;

use dagrun_types::config::{Backend, EngineConfig};

/// Database URL override. A `postgres://` URL also switches the backend.
pub const ENV_DATABASE_URL: &str = "DAGRUN_DATABASE_URL";
/// Comma-separated list of namespaces to watch.
pub const ENV_NAMESPACES: &str = "NAMESPACES";
pub const ENV_WORKERS: &str = "DAGRUN_WORKERS";

/// Load engine configuration from `path`.
///
/// - If the file does not exist, starts from [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and starts from the default.
/// - Environment overrides are applied last in every case.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(content) => match toml::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
                EngineConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply overrides read through `lookup` (the process environment in
/// production, a map in tests).
pub fn apply_env_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(ENV_DATABASE_URL).filter(|u| !u.is_empty()) {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            config.database.backend = Backend::Postgres;
            config.database.postgres.url = url;
        } else {
            config.database.backend = Backend::Sqlite;
            config.database.sqlite.path = url.trim_start_matches("sqlite://").to_string();
        }
    }

    if let Some(raw) = lookup(ENV_NAMESPACES) {
        let namespaces: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(String::from)
            .collect();
        if !namespaces.is_empty() {
            config.namespaces = namespaces;
        }
    }

    if let Some(raw) = lookup(ENV_WORKERS) {
        match raw.parse::<usize>() {
            Ok(count) if count > 0 => config.workers.count = count,
            _ => tracing::warn!("Ignoring invalid {ENV_WORKERS}={raw}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join("dagrun.toml")).await;
        assert_eq!(config.allocation.max_name_attempts, 5);
        assert_eq!(config.scheduler.interval_secs, 60);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dagrun.toml");
        tokio::fs::write(
            &path,
            r#"
engine_id = "blue"

[scheduler]
interval_secs = 30

[allocation]
max_name_attempts = 3
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.engine_id, "blue");
        assert_eq!(config.scheduler.interval_secs, 30);
        assert_eq!(config.allocation.max_name_attempts, 3);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dagrun.toml");
        tokio::fs::write(&path, "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.engine_id, "dagrun");
    }

    #[test]
    fn env_overrides_postgres_url_switches_backend() {
        let mut config = EngineConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[(ENV_DATABASE_URL, "postgres://u:p@db/dagrun")]),
        );
        assert_eq!(config.database.backend, Backend::Postgres);
        assert_eq!(config.database.postgres.url, "postgres://u:p@db/dagrun");
    }

    #[test]
    fn env_overrides_sqlite_path_and_namespaces() {
        let mut config = EngineConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                (ENV_DATABASE_URL, "sqlite:///var/lib/dagrun.db"),
                (ENV_NAMESPACES, "jobs, batch,,"),
                (ENV_WORKERS, "12"),
            ]),
        );
        assert_eq!(config.database.backend, Backend::Sqlite);
        assert_eq!(config.database.sqlite.path, "/var/lib/dagrun.db");
        assert_eq!(config.namespaces, vec!["jobs", "batch"]);
        assert_eq!(config.workers.count, 12);
    }

    #[test]
    fn env_overrides_ignore_bad_worker_count() {
        let mut config = EngineConfig::default();
        apply_env_overrides(&mut config, env(&[(ENV_WORKERS, "zero")]));
        assert_eq!(config.workers.count, 4);
        apply_env_overrides(&mut config, env(&[(ENV_WORKERS, "0")]));
        assert_eq!(config.workers.count, 4);
    }
}
