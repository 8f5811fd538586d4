use crate::domain::models::{at_time_of_day, ProgressStatus, Task, TaskProgress};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const RISK_BUFFER_SEC: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedTask {
    pub task: Task,
    pub progress_status: ProgressStatus,
    pub projected_start: DateTime<Utc>,
    pub projected_end: DateTime<Utc>,
    pub risk_level: Option<RiskLevel>,
    pub is_current: bool,
    pub can_drag: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FixedTaskWarning {
    pub task_id: String,
    pub task_name: String,
    pub scheduled_start: DateTime<Utc>,
    pub projected_arrival: DateTime<Utc>,
    pub minutes_late: i64,
}

/// Running estimate of when `target_index` starts. Ignores interruption
/// splitting; the full placement lives in `schedule::calculate_schedule`.
pub fn calculate_projected_start(
    tasks: &[Task],
    current_index: usize,
    current_elapsed_ms: i64,
    target_index: usize,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let target = tasks.get(target_index)?;
    if target_index < current_index {
        return Some(target.planned_start);
    }
    if target_index == current_index {
        return Some(now);
    }

    let remaining = tasks
        .get(current_index)
        .map(|current| remaining_on(current, current_elapsed_ms))
        .unwrap_or_else(Duration::zero);
    let between = tasks[current_index + 1..target_index]
        .iter()
        .map(|task| i64::from(task.planned_duration_sec))
        .sum::<i64>();
    Some(now + remaining + Duration::seconds(between))
}

pub fn calculate_risk_level(
    projected_start: DateTime<Utc>,
    scheduled_start: DateTime<Utc>,
) -> RiskLevel {
    let buffer = (scheduled_start - projected_start).num_seconds();
    if buffer > RISK_BUFFER_SEC {
        RiskLevel::Green
    } else if buffer > 0 {
        RiskLevel::Yellow
    } else {
        RiskLevel::Red
    }
}

pub fn create_projected_tasks(
    tasks: &[Task],
    progress: &[TaskProgress],
    current_index: usize,
    current_elapsed_ms: i64,
    now: DateTime<Utc>,
) -> Vec<ProjectedTask> {
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let status = progress
                .get(index)
                .map(|progress| progress.status)
                .unwrap_or(ProgressStatus::Pending);
            let projected_start =
                calculate_projected_start(tasks, current_index, current_elapsed_ms, index, now)
                    .unwrap_or(task.planned_start);
            let projected_end = if index == current_index {
                now + remaining_on(task, current_elapsed_ms)
            } else {
                let seconds = match progress.get(index) {
                    Some(progress) if progress.status == ProgressStatus::Complete => {
                        progress.actual_duration_sec
                    }
                    _ => task.planned_duration_sec,
                };
                projected_start + Duration::seconds(i64::from(seconds))
            };
            let risk_level = (task.is_fixed() && index > current_index && !status.is_terminal())
                .then(|| {
                    let scheduled = at_time_of_day(now.date_naive(), task.start_time_of_day_secs());
                    calculate_risk_level(projected_start, scheduled)
                });

            ProjectedTask {
                task: task.clone(),
                progress_status: status,
                projected_start,
                projected_end,
                risk_level,
                is_current: index == current_index,
                can_drag: !task.is_fixed() && !status.is_terminal() && index >= current_index,
            }
        })
        .collect()
}

/// Warns when the next pending fixed task would be reached after its start.
///
/// Arrival is `now`, plus what is left of the active current task, plus every
/// other pending task that comes earlier in the day than the fixed one.
pub fn fixed_task_warning(
    tasks: &[Task],
    progress: &[TaskProgress],
    current_index: usize,
    current_elapsed_ms: i64,
    now: DateTime<Utc>,
) -> Option<FixedTaskWarning> {
    let mut pending = tasks
        .iter()
        .zip(progress)
        .filter(|(_, progress)| progress.status == ProgressStatus::Pending)
        .map(|(task, _)| task)
        .collect::<Vec<_>>();
    pending.sort_by_key(|task| (task.start_time_of_day_secs(), task.sort_order));

    let fixed = pending.iter().copied().find(|task| task.is_fixed())?;

    let mut arrival = now;
    let current_is_active = progress
        .get(current_index)
        .is_some_and(|progress| progress.status == ProgressStatus::Active);
    if current_is_active {
        if let Some(current) = tasks.get(current_index) {
            arrival += remaining_on(current, current_elapsed_ms);
        }
    }
    for task in pending
        .iter()
        .take_while(|task| task.task_id != fixed.task_id)
    {
        arrival += Duration::seconds(i64::from(task.planned_duration_sec));
    }

    let scheduled = at_time_of_day(now.date_naive(), fixed.start_time_of_day_secs());
    if scheduled >= arrival {
        return None;
    }
    let late_sec = (arrival - scheduled).num_seconds();
    Some(FixedTaskWarning {
        task_id: fixed.task_id.clone(),
        task_name: fixed.name.clone(),
        scheduled_start: scheduled,
        projected_arrival: arrival,
        minutes_late: (late_sec + 59) / 60,
    })
}

fn remaining_on(task: &Task, elapsed_ms: i64) -> Duration {
    let planned_ms = i64::from(task.planned_duration_sec) * 1000;
    Duration::milliseconds((planned_ms - elapsed_ms).max(0))
}
