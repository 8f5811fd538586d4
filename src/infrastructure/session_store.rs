use crate::domain::models::{DaySession, Task};
use crate::infrastructure::error::InfraError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

const TASKS_KEY: &str = "tasks";
const SESSION_KEY: &str = "session";
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Persistence for the live session. Writes are last-write-wins; the caller
/// guarantees a single writer.
pub trait SessionStore: Send + Sync {
    fn get_session(&self) -> Result<Option<DaySession>, InfraError>;
    fn save_session(&self, session: &DaySession) -> Result<(), InfraError>;
    fn clear_session(&self) -> Result<(), InfraError>;
    fn save_tasks(&self, tasks: &[Task]) -> Result<(), InfraError>;
    fn load_tasks(&self) -> Result<Vec<Task>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    pub fn schema_version(&self) -> Result<Option<i64>, InfraError> {
        let connection = self.connect()?;
        read_raw(&connection, SCHEMA_VERSION_KEY)?
            .map(|raw| {
                raw.trim().parse::<i64>().map_err(|error| {
                    InfraError::Storage(format!("invalid schema_version '{raw}': {error}"))
                })
            })
            .transpose()
    }

    /// Brings stored records up to [`CURRENT_SCHEMA_VERSION`], one step at a
    /// time. Records written before versioning existed count as version 1.
    pub fn migrate(&self) -> Result<i64, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;

        let mut session = read_raw(&transaction, SESSION_KEY)?
            .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
            .transpose()?;
        let mut tasks = read_raw(&transaction, TASKS_KEY)?
            .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
            .transpose()?;

        let stored_version = match read_raw(&transaction, SCHEMA_VERSION_KEY)? {
            Some(raw) => raw.trim().parse::<i64>().map_err(|error| {
                InfraError::Storage(format!("invalid schema_version '{raw}': {error}"))
            })?,
            None if session.is_none() && tasks.is_none() => CURRENT_SCHEMA_VERSION,
            None => 1,
        };
        if stored_version > CURRENT_SCHEMA_VERSION {
            return Err(InfraError::Storage(format!(
                "stored schema_version {stored_version} is newer than supported {CURRENT_SCHEMA_VERSION}"
            )));
        }

        for from_version in stored_version..CURRENT_SCHEMA_VERSION {
            apply_migration(from_version, session.as_mut(), tasks.as_mut());
            tracing::info!(
                command = "migrate_store",
                from_version,
                to_version = from_version + 1,
                "applied storage migration"
            );
        }

        if let Some(session) = &session {
            write_raw(&transaction, SESSION_KEY, &serde_json::to_string(session)?)?;
        }
        if let Some(tasks) = &tasks {
            write_raw(&transaction, TASKS_KEY, &serde_json::to_string(tasks)?)?;
        }
        write_raw(
            &transaction,
            SCHEMA_VERSION_KEY,
            &CURRENT_SCHEMA_VERSION.to_string(),
        )?;
        transaction.commit()?;
        Ok(CURRENT_SCHEMA_VERSION)
    }
}

impl SessionStore for SqliteSessionStore {
    fn get_session(&self) -> Result<Option<DaySession>, InfraError> {
        let connection = self.connect()?;
        let Some(raw) = read_raw(&connection, SESSION_KEY)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save_session(&self, session: &DaySession) -> Result<(), InfraError> {
        let connection = self.connect()?;
        write_raw(&connection, SESSION_KEY, &serde_json::to_string(session)?)
    }

    fn clear_session(&self) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute("DELETE FROM kv_store WHERE key = ?1", params![SESSION_KEY])?;
        Ok(())
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<(), InfraError> {
        let connection = self.connect()?;
        write_raw(&connection, TASKS_KEY, &serde_json::to_string(tasks)?)
    }

    fn load_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let connection = self.connect()?;
        let Some(raw) = read_raw(&connection, TASKS_KEY)? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

fn read_raw(connection: &Connection, key: &str) -> Result<Option<String>, InfraError> {
    connection
        .query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(InfraError::from)
}

fn write_raw(connection: &Connection, key: &str, value: &str) -> Result<(), InfraError> {
    connection.execute(
        "INSERT INTO kv_store (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn apply_migration(
    from_version: i64,
    session: Option<&mut serde_json::Value>,
    tasks: Option<&mut serde_json::Value>,
) {
    match from_version {
        // v2 introduced the schedule start policy on the session
        1 => {
            if let Some(object) = session.and_then(serde_json::Value::as_object_mut) {
                object.entry("scheduleConfig").or_insert_with(|| {
                    serde_json::json!({ "mode": "now", "customStartTime": null })
                });
            }
        }
        // v3 introduced ad-hoc tasks and the timer start timestamp
        2 => {
            if let Some(object) = session.and_then(serde_json::Value::as_object_mut) {
                object
                    .entry("timerStartedAtMs")
                    .or_insert(serde_json::Value::Null);
            }
            if let Some(list) = tasks.and_then(serde_json::Value::as_array_mut) {
                for task in list.iter_mut().filter_map(serde_json::Value::as_object_mut) {
                    task.entry("isAdHoc").or_insert(serde_json::Value::Bool(false));
                }
            }
        }
        _ => {}
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    session: Mutex<Option<DaySession>>,
    tasks: Mutex<Vec<Task>>,
}

impl SessionStore for InMemorySessionStore {
    fn get_session(&self) -> Result<Option<DaySession>, InfraError> {
        let session = self
            .session
            .lock()
            .map_err(|error| InfraError::Storage(format!("session lock poisoned: {error}")))?;
        Ok(session.clone())
    }

    fn save_session(&self, session: &DaySession) -> Result<(), InfraError> {
        let mut stored = self
            .session
            .lock()
            .map_err(|error| InfraError::Storage(format!("session lock poisoned: {error}")))?;
        *stored = Some(session.clone());
        Ok(())
    }

    fn clear_session(&self) -> Result<(), InfraError> {
        let mut stored = self
            .session
            .lock()
            .map_err(|error| InfraError::Storage(format!("session lock poisoned: {error}")))?;
        *stored = None;
        Ok(())
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<(), InfraError> {
        let mut stored = self
            .tasks
            .lock()
            .map_err(|error| InfraError::Storage(format!("tasks lock poisoned: {error}")))?;
        *stored = tasks.to_vec();
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let stored = self
            .tasks
            .lock()
            .map_err(|error| InfraError::Storage(format!("tasks lock poisoned: {error}")))?;
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        ScheduleConfig, ScheduleMode, SessionStatus, TaskProgress, TaskStatus, TaskType,
    };
    use crate::infrastructure::storage::initialize_database;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "daytrack-store-tests-{}-{}.sqlite",
                std::process::id(),
                sequence
            ));
            let _ = std::fs::remove_file(&path);
            initialize_database(&path).expect("initialize database");
            Self { path }
        }

        fn store(&self) -> SqliteSessionStore {
            SqliteSessionStore::new(&self.path)
        }

        fn write_raw(&self, key: &str, value: &str) {
            let connection = Connection::open(&self.path).expect("open database");
            write_raw(&connection, key, value).expect("write raw value");
        }

        fn read_raw(&self, key: &str) -> Option<String> {
            let connection = Connection::open(&self.path).expect("open database");
            read_raw(&connection, key).expect("read raw value")
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_task() -> Task {
        Task {
            task_id: "task-1".to_string(),
            name: "Morning Email".to_string(),
            planned_start: fixed_time("2026-02-16T09:00:00Z"),
            planned_duration_sec: 900,
            task_type: TaskType::Flexible,
            sort_order: 0,
            status: TaskStatus::Pending,
            is_ad_hoc: false,
        }
    }

    fn sample_session(task: &Task) -> DaySession {
        DaySession {
            session_id: "ses-1".to_string(),
            started_at: fixed_time("2026-02-16T08:55:00Z"),
            ended_at: None,
            status: SessionStatus::Running,
            current_task_index: 0,
            current_task_elapsed_ms: 42_000,
            last_persisted_at: 1_771_232_142_000,
            total_lag_sec: 0,
            task_progress: vec![TaskProgress::pending_for(task)],
            timer_started_at_ms: Some(1_771_232_100_000),
            schedule_config: ScheduleConfig::custom(fixed_time("2026-02-16T09:00:00Z")),
        }
    }

    #[test]
    fn sqlite_store_roundtrips_session_and_tasks() {
        let db = TempDb::new();
        let store = db.store();
        let task = sample_task();
        let session = sample_session(&task);

        assert_eq!(store.get_session().expect("read empty"), None);
        assert!(store.load_tasks().expect("read empty tasks").is_empty());

        store.save_tasks(std::slice::from_ref(&task)).expect("save tasks");
        store.save_session(&session).expect("save session");

        assert_eq!(store.load_tasks().expect("load tasks"), vec![task]);
        assert_eq!(store.get_session().expect("load session"), Some(session.clone()));

        let mut updated = session;
        updated.current_task_elapsed_ms = 60_000;
        store.save_session(&updated).expect("overwrite session");
        assert_eq!(
            store
                .get_session()
                .expect("load session")
                .map(|session| session.current_task_elapsed_ms),
            Some(60_000)
        );

        store.clear_session().expect("clear session");
        assert_eq!(store.get_session().expect("read cleared"), None);
        assert_eq!(store.load_tasks().expect("tasks survive").len(), 1);
    }

    #[test]
    fn corrupted_session_json_is_reported() {
        let db = TempDb::new();
        db.write_raw(SESSION_KEY, "{not json");
        assert!(matches!(db.store().get_session(), Err(InfraError::Json(_))));
    }

    #[test]
    fn fresh_database_migrates_to_current_version() {
        let db = TempDb::new();
        let store = db.store();
        assert_eq!(store.schema_version().expect("read version"), None);
        assert_eq!(store.migrate().expect("migrate"), CURRENT_SCHEMA_VERSION);
        assert_eq!(
            store.schema_version().expect("read version"),
            Some(CURRENT_SCHEMA_VERSION)
        );
        assert_eq!(store.get_session().expect("no session"), None);
    }

    #[test]
    fn unversioned_records_are_migrated_from_v1() {
        let db = TempDb::new();
        let task = sample_task();
        let mut legacy_task = serde_json::to_value(&task).expect("serialize task");
        legacy_task
            .as_object_mut()
            .expect("task object")
            .remove("isAdHoc");
        let mut legacy_session =
            serde_json::to_value(sample_session(&task)).expect("serialize session");
        let object = legacy_session.as_object_mut().expect("session object");
        object.remove("scheduleConfig");
        object.remove("timerStartedAtMs");

        db.write_raw(TASKS_KEY, &serde_json::json!([legacy_task]).to_string());
        db.write_raw(SESSION_KEY, &legacy_session.to_string());

        let store = db.store();
        assert_eq!(store.migrate().expect("migrate"), CURRENT_SCHEMA_VERSION);

        let raw_session: serde_json::Value =
            serde_json::from_str(&db.read_raw(SESSION_KEY).expect("session stored"))
                .expect("valid json");
        assert_eq!(raw_session["scheduleConfig"]["mode"], "now");
        assert!(raw_session["timerStartedAtMs"].is_null());
        let raw_tasks: serde_json::Value =
            serde_json::from_str(&db.read_raw(TASKS_KEY).expect("tasks stored"))
                .expect("valid json");
        assert_eq!(raw_tasks[0]["isAdHoc"], false);

        let session = store.get_session().expect("load").expect("session exists");
        assert_eq!(session.schedule_config.mode, ScheduleMode::Now);
        assert_eq!(session.timer_started_at_ms, None);
    }

    #[test]
    fn newer_schema_version_is_refused() {
        let db = TempDb::new();
        db.write_raw(SCHEMA_VERSION_KEY, "99");
        assert!(matches!(db.store().migrate(), Err(InfraError::Storage(_))));
    }

    #[test]
    fn in_memory_store_roundtrip() {
        let store = InMemorySessionStore::default();
        let task = sample_task();
        let session = sample_session(&task);
        store.save_tasks(std::slice::from_ref(&task)).expect("save tasks");
        store.save_session(&session).expect("save session");
        assert_eq!(store.get_session().expect("load"), Some(session));
        assert_eq!(store.load_tasks().expect("load tasks"), vec![task]);
        store.clear_session().expect("clear");
        assert_eq!(store.get_session().expect("load"), None);
    }
}
