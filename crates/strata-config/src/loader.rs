use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::StrataConfig;

/// File names looked for in the search directory when no explicit path is given.
const DEFAULT_FILE_NAMES: &[&str] = &["strata.yml", "strata.yaml", "strata.toml"];

/// Resolves configuration from an optional file plus environment overrides.
///
/// Precedence, lowest first: built-in defaults, config file, environment
/// (`STRATA_DATABASE_URL`, then `DATABASE_URL`; `STRATA_MIGRATIONS_DIR`).
/// Command-line flags are layered on top by the caller.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    search_dir: PathBuf,
    load_dotenv: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            search_dir: PathBuf::from("."),
            load_dotenv: true,
        }
    }

    /// Use this file instead of probing the search directory. The file must exist.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = dir.into();
        self
    }

    /// Skip reading `.env`.
    pub fn without_dotenv(mut self) -> Self {
        self.load_dotenv = false;
        self
    }

    pub fn load(&self) -> Result<StrataConfig> {
        if self.load_dotenv {
            if let Ok(path) = dotenvy::dotenv() {
                debug!("loaded environment from {}", path.display());
            }
        }
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading environment values through `env`.
    pub fn load_with_env(&self, env: impl Fn(&str) -> Option<String>) -> Result<StrataConfig> {
        let mut config = match self.resolve_path()? {
            Some(path) => {
                info!("loading config from {}", path.display());
                read_config(&path)?
            }
            None => StrataConfig::default(),
        };

        apply_env_overrides(&mut config, env);
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.path {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        Ok(DEFAULT_FILE_NAMES
            .iter()
            .map(|name| self.search_dir.join(name))
            .find(|candidate| candidate.is_file()))
    }
}

fn read_config(path: &Path) -> Result<StrataConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

fn apply_env_overrides(config: &mut StrataConfig, env: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty("STRATA_DATABASE_URL").or_else(|| non_empty("DATABASE_URL")) {
        config.database_url = Some(url);
    }
    if let Some(dir) = non_empty("STRATA_MIGRATIONS_DIR") {
        config.migrations_dir = PathBuf::from(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogFormat;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_env(no_env)
            .unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
    }

    #[test]
    fn reads_yaml_from_search_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("strata.yml"),
            "database_url: sqlite://app.db\nhistory_table: app_history\nretry:\n  max_attempts: 5\nlog:\n  format: json\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_env(no_env)
            .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite://app.db"));
        assert_eq!(config.history_table, "app_history");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn reads_toml_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "database_url = \"data.db\"\nmigrations_dir = \"db/migrations\"\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_path(&path)
            .load_with_env(no_env)
            .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("data.db"));
        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = ConfigLoader::new()
            .with_path("/definitely/not/here/strata.yml")
            .load_with_env(no_env)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("strata.yml"), "database_url: from-file.db\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "fallback.db"),
            ("STRATA_DATABASE_URL", "preferred.db"),
            ("STRATA_MIGRATIONS_DIR", "sql"),
        ]
        .into_iter()
        .collect();

        let config = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("preferred.db"));
        assert_eq!(config.migrations_dir, PathBuf::from("sql"));
    }

    #[test]
    fn database_url_falls_back_to_generic_variable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_env(|k| (k == "DATABASE_URL").then(|| "generic.db".to_string()))
            .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("generic.db"));
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("strata.yml"), "history_table: \"bad-name\"\n").unwrap();

        let err = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_env(no_env)
            .unwrap_err();
        assert!(err.to_string().contains("history_table"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.ini");
        std::fs::write(&path, "database_url=x").unwrap();

        let err = ConfigLoader::new()
            .with_path(&path)
            .load_with_env(no_env)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }
}
