use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MAX_TASK_NAME_CHARS: usize = 200;
pub const MAX_TASK_DURATION_SEC: u32 = 86_400;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Fixed,
    Flexible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub name: String,
    /// Only the time of day is meaningful; the date part is whatever the import produced.
    pub planned_start: DateTime<Utc>,
    pub planned_duration_sec: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub sort_order: usize,
    pub status: TaskStatus,
    #[serde(default)]
    pub is_ad_hoc: bool,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        planned_start: DateTime<Utc>,
        planned_duration_sec: u32,
        task_type: TaskType,
    ) -> Self {
        Self {
            task_id: next_id("task"),
            name: name.into(),
            planned_start,
            planned_duration_sec,
            task_type,
            sort_order: 0,
            status: TaskStatus::Pending,
            is_ad_hoc: false,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.task_type == TaskType::Fixed
    }

    pub fn planned_end(&self) -> DateTime<Utc> {
        self.planned_start + Duration::seconds(i64::from(self.planned_duration_sec))
    }

    pub fn start_time_of_day_secs(&self) -> u32 {
        self.planned_start.num_seconds_from_midnight()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.task_id, "task.task_id")?;
        validate_task_name(&self.name)?;
        validate_duration(self.planned_duration_sec)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Active,
    Complete,
    Missed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Missed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub planned_duration_sec: u32,
    pub actual_duration_sec: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ProgressStatus,
}

impl TaskProgress {
    pub fn pending_for(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            planned_duration_sec: task.planned_duration_sec,
            actual_duration_sec: 0,
            completed_at: None,
            status: ProgressStatus::Pending,
        }
    }

    /// Signed difference between recorded and planned duration.
    pub fn lag_sec(&self) -> i64 {
        i64::from(self.actual_duration_sec) - i64::from(self.planned_duration_sec)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.task_id, "progress.task_id")?;
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err(
                "progress.completed_at must be set exactly when status is complete or missed"
                    .to_string(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    #[default]
    Now,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub mode: ScheduleMode,
    pub custom_start_time: Option<DateTime<Utc>>,
}

impl ScheduleConfig {
    pub fn custom(start: DateTime<Utc>) -> Self {
        Self {
            mode: ScheduleMode::Custom,
            custom_start_time: Some(start),
        }
    }

    /// A custom policy without a time falls back to `now`.
    pub fn resolve_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.mode, self.custom_start_time) {
            (ScheduleMode::Custom, Some(start)) => start,
            _ => now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaySession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub current_task_index: usize,
    pub current_task_elapsed_ms: i64,
    pub last_persisted_at: i64,
    pub total_lag_sec: i64,
    pub task_progress: Vec<TaskProgress>,
    #[serde(default)]
    pub timer_started_at_ms: Option<i64>,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
}

impl DaySession {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    pub fn current_progress(&self) -> Option<&TaskProgress> {
        self.task_progress.get(self.current_task_index)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.task_progress
            .iter()
            .position(|progress| progress.status == ProgressStatus::Active)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.session_id, "session.session_id")?;
        for progress in &self.task_progress {
            progress.validate()?;
        }
        let active = self
            .task_progress
            .iter()
            .filter(|progress| progress.status == ProgressStatus::Active)
            .count();
        if active > 1 {
            return Err("session.task_progress must contain at most one active task".to_string());
        }
        if let Some(ended_at) = self.ended_at {
            if ended_at < self.started_at {
                return Err("session.ended_at must be >= session.started_at".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewTaskInput {
    pub name: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_duration_sec: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
}

impl NewTaskInput {
    pub fn validate(&self) -> Result<(), String> {
        validate_task_name(&self.name)?;
        validate_duration(self.planned_duration_sec)?;
        if self.task_type == TaskType::Fixed && self.planned_start.is_none() {
            return Err("fixed tasks require a planned start".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdates {
    pub name: Option<String>,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_duration_sec: Option<u32>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
}

impl TaskUpdates {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            validate_task_name(name)?;
        }
        if let Some(duration) = self.planned_duration_sec {
            validate_duration(duration)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub session_id: String,
    pub total_planned_sec: u64,
    pub total_actual_sec: u64,
    pub completed_count: usize,
    pub on_time_count: usize,
    pub late_count: usize,
    pub missed_count: usize,
    pub pending_count: usize,
    pub total_lag_sec: i64,
    pub session_duration_sec: i64,
}

/// Places a time of day on `date`, used to compare date-agnostic planned starts with "now".
pub fn at_time_of_day(date: NaiveDate, seconds_from_midnight: u32) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    midnight + Duration::seconds(i64::from(seconds_from_midnight))
}

pub(crate) fn validate_task_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("task name must not be empty".to_string());
    }
    if trimmed.chars().count() > MAX_TASK_NAME_CHARS {
        return Err(format!(
            "task name must be at most {MAX_TASK_NAME_CHARS} characters"
        ));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration_sec: u32) -> Result<(), String> {
    if duration_sec == 0 || duration_sec > MAX_TASK_DURATION_SEC {
        return Err(format!(
            "task duration must be between 1 and {MAX_TASK_DURATION_SEC} seconds"
        ));
    }
    Ok(())
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
