use crate::application::tracker::{RecoveryOutcome, Tracker};
use crate::infrastructure::config::{ensure_default_configs, load_tracker_config, TrackerConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::SqliteSessionStore;
use crate::infrastructure::storage::{initialize_database, DatabaseState};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DATABASE_FILE: &str = "daytrack.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: TrackerConfig,
    pub schema_version: i64,
    pub database_state: DatabaseState,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_tracker_config(&config_dir)?;
    let database_state = initialize_database(&database_path)?;
    let schema_version = SqliteSessionStore::new(&database_path).migrate()?;

    tracing::info!(
        command = "bootstrap",
        workspace_root = %workspace_root.display(),
        schema_version,
        fresh_database = database_state == DatabaseState::Created,
        "workspace ready"
    );
    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
        config,
        schema_version,
        database_state,
    })
}

pub struct OpenedTracker {
    pub bootstrap: BootstrapResult,
    pub tracker: Tracker<SqliteSessionStore>,
    pub recovery: RecoveryOutcome,
}

/// Bootstraps `workspace_root` and returns a tracker with the stored day
/// already recovered.
pub fn open_tracker(workspace_root: &Path) -> Result<OpenedTracker, InfraError> {
    let bootstrap = bootstrap_workspace(workspace_root)?;
    let store = Arc::new(SqliteSessionStore::new(&bootstrap.database_path));
    let mut tracker = Tracker::new(store, bootstrap.config.clone());
    let recovery = tracker.recover_on_load();
    Ok(OpenedTracker {
        bootstrap,
        tracker,
        recovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Task, TaskType};
    use crate::infrastructure::session_store::{SessionStore, CURRENT_SCHEMA_VERSION};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "daytrack-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn at(hhmm: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-02-16T{hhmm}:00Z"))
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let workspace = TempWorkspace::new();
        let first = bootstrap_workspace(&workspace.path).expect("bootstrap");
        assert!(workspace.path.join("config").join("app.json").exists());
        assert!(workspace.path.join("logs").is_dir());
        assert!(first.database_path.exists());
        assert_eq!(first.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(first.config, TrackerConfig::default());
        assert_eq!(first.database_state, DatabaseState::Created);

        let second = bootstrap_workspace(&workspace.path).expect("bootstrap again");
        assert_eq!(second.database_path, first.database_path);
        assert_eq!(second.database_state, DatabaseState::Existing);
    }

    #[test]
    fn bootstrap_rejects_unsupported_config_schema() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.path.join("config");
        fs::create_dir_all(&config_dir).expect("create config dir");
        fs::write(config_dir.join("app.json"), r#"{"schema": 2}"#).expect("seed config");

        assert!(matches!(
            bootstrap_workspace(&workspace.path),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reopened_workspace_resumes_the_timed_task() {
        let workspace = TempWorkspace::new();
        let opened = open_tracker(&workspace.path).expect("open");
        assert_eq!(opened.recovery, RecoveryOutcome::NoSession);

        let mut tracker = opened.tracker;
        tracker
            .start_day(vec![
                Task::new("Morning Email", at("09:00"), 900, TaskType::Flexible),
                Task::new("Team Standup", at("09:15"), 900, TaskType::Fixed),
            ])
            .expect("start day");
        let task_id = tracker.machine().tasks()[0].task_id.clone();
        assert!(tracker.start_task(&task_id).expect("session"));
        assert!(tracker.sync_elapsed());
        drop(tracker);

        let reopened = open_tracker(&workspace.path).expect("reopen");
        assert!(matches!(
            reopened.recovery,
            RecoveryOutcome::Resumed { task_id: ref resumed, .. } if *resumed == task_id
        ));
        assert!(reopened.tracker.timer().is_running());
        let store = SqliteSessionStore::new(&reopened.bootstrap.database_path);
        assert_eq!(store.load_tasks().expect("load tasks").len(), 2);
    }
}
