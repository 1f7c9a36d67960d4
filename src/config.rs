//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Primary database used when `TASK_ORCHESTRATOR_DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///./data/orchestrator.db";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Primary database holding tasks and subscriptions.
    pub database_url: String,
    /// Parent of the `task_orchestrator/` cache directory.
    pub config_dir: PathBuf,
    /// Longest the scheduler sleeps between polls for due jobs.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            config_dir: PathBuf::from("./data"),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            std::env::var("TASK_ORCHESTRATOR_DATABASE_URL").unwrap_or(defaults.database_url);

        let config_dir = std::env::var("TASK_ORCHESTRATOR_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_dir);

        let poll_interval = match std::env::var("TASK_ORCHESTRATOR_POLL_INTERVAL_MS") {
            Ok(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: "TASK_ORCHESTRATOR_POLL_INTERVAL_MS".to_string(),
                    message: format!("{raw:?}: {e}"),
                })?;
                if ms == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TASK_ORCHESTRATOR_POLL_INTERVAL_MS".to_string(),
                        message: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_millis(ms)
            }
            Err(_) => defaults.poll_interval,
        };

        Ok(Self {
            database_url,
            config_dir,
            poll_interval,
        })
    }

    /// Connection string of the dedicated job store.
    pub fn jobs_database_url(&self) -> String {
        add_tasks_to_database_url(&self.database_url)
    }

    /// Directory holding orchestrator-private files.
    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("task_orchestrator")
    }

    /// File backing the durable notification queue.
    pub fn notifications_path(&self) -> PathBuf {
        self.cache_dir().join("notifications").join("queue.db")
    }
}

/// Where a sqlite-style URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(PathBuf),
}

impl SqliteTarget {
    pub fn file(path: impl AsRef<Path>) -> Self {
        SqliteTarget::File(path.as_ref().to_path_buf())
    }
}

/// Resolve a `sqlite://` URL.
///
/// `sqlite:///rel.db` is relative, `sqlite:////abs.db` absolute; an empty
/// path or `:memory:` is an in-memory database. Query strings are ignored.
pub fn sqlite_target(url: &str) -> Result<SqliteTarget, ConfigError> {
    let rest = url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ConfigError::UnsupportedUrl(url.to_string()))?;
    let path = rest.split_once('?').map_or(rest, |(path, _)| path);
    let path = path.strip_prefix('/').unwrap_or(path);

    if path.is_empty() || path == ":memory:" {
        return Ok(SqliteTarget::Memory);
    }
    Ok(SqliteTarget::File(PathBuf::from(path)))
}

/// Derive the job store URL from the primary database URL.
///
/// sqlite: `-tasks` goes before the file extension. postgres/mysql: `_tasks`
/// goes after the database name, ahead of any query string. Other schemes and
/// in-memory sqlite URLs are returned unchanged.
pub fn add_tasks_to_database_url(database_url: &str) -> String {
    if let Some(rest) = database_url.strip_prefix("sqlite://") {
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, format!("?{query}")),
            None => (rest, String::new()),
        };
        let (dir, file) = match path.rfind('/') {
            Some(idx) => path.split_at(idx + 1),
            None => ("", path),
        };
        if file.is_empty() || file == ":memory:" {
            return database_url.to_string();
        }
        let file = match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}-tasks.{ext}"),
            _ => format!("{file}-tasks"),
        };
        return format!("sqlite://{dir}{file}{query}");
    }

    if ["postgresql://", "postgres://", "mysql://"]
        .iter()
        .any(|scheme| database_url.starts_with(scheme))
    {
        return match database_url.split_once('?') {
            Some((base, params)) => format!("{base}_tasks?{params}"),
            None => format!("{database_url}_tasks"),
        };
    }

    database_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_suffix_goes_before_extension() {
        assert_eq!(
            add_tasks_to_database_url("sqlite:///./langflow.db"),
            "sqlite:///./langflow-tasks.db"
        );
        assert_eq!(
            add_tasks_to_database_url("sqlite:////var/lib/app/main.sqlite3"),
            "sqlite:////var/lib/app/main-tasks.sqlite3"
        );
    }

    #[test]
    fn sqlite_without_extension_gets_appended_suffix() {
        assert_eq!(
            add_tasks_to_database_url("sqlite:///./data.dir/orchestrator"),
            "sqlite:///./data.dir/orchestrator-tasks"
        );
    }

    #[test]
    fn sqlite_memory_is_unchanged() {
        assert_eq!(add_tasks_to_database_url("sqlite://"), "sqlite://");
        assert_eq!(
            add_tasks_to_database_url("sqlite:///:memory:"),
            "sqlite:///:memory:"
        );
    }

    #[test]
    fn server_databases_get_name_suffix() {
        assert_eq!(
            add_tasks_to_database_url("postgresql://u:p@localhost:5432/app"),
            "postgresql://u:p@localhost:5432/app_tasks"
        );
        assert_eq!(
            add_tasks_to_database_url("mysql://u@db/app?ssl=true&x=1"),
            "mysql://u@db/app_tasks?ssl=true&x=1"
        );
    }

    #[test]
    fn unknown_scheme_passes_through() {
        assert_eq!(
            add_tasks_to_database_url("redis://localhost/0"),
            "redis://localhost/0"
        );
    }

    #[test]
    fn sqlite_target_resolution() {
        assert_eq!(sqlite_target("sqlite://").unwrap(), SqliteTarget::Memory);
        assert_eq!(
            sqlite_target("sqlite:///:memory:").unwrap(),
            SqliteTarget::Memory
        );
        assert_eq!(
            sqlite_target("sqlite:///./data/app.db").unwrap(),
            SqliteTarget::file("./data/app.db")
        );
        assert_eq!(
            sqlite_target("sqlite:////abs/app.db?mode=rwc").unwrap(),
            SqliteTarget::file("/abs/app.db")
        );
        assert!(matches!(
            sqlite_target("postgresql://localhost/app"),
            Err(ConfigError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn derived_paths() {
        let config = OrchestratorConfig {
            config_dir: PathBuf::from("/tmp/orch"),
            ..Default::default()
        };
        assert_eq!(
            config.notifications_path(),
            PathBuf::from("/tmp/orch/task_orchestrator/notifications/queue.db")
        );
        assert_eq!(
            config.jobs_database_url(),
            "sqlite:///./data/orchestrator-tasks.db"
        );
    }
}
