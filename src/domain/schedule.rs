use crate::domain::models::{at_time_of_day, ScheduleConfig, Task};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub task: Task,
    pub calculated_start: DateTime<Utc>,
    pub calculated_end: DateTime<Utc>,
    pub is_interrupted: bool,
    pub pause_time: Option<DateTime<Utc>>,
    pub duration_before_pause_sec: u32,
    pub remaining_duration_sec: u32,
}

impl ScheduledTask {
    fn uninterrupted(task: &Task, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            task: task.clone(),
            calculated_start: start,
            calculated_end: end,
            is_interrupted: false,
            pause_time: None,
            duration_before_pause_sec: task.planned_duration_sec,
            remaining_duration_sec: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FixedTaskConflict {
    pub task_id1: String,
    pub task_id2: String,
    pub overlap_sec: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResult {
    pub scheduled_tasks: Vec<ScheduledTask>,
    pub has_overflow: bool,
    pub schedule_end_time: DateTime<Utc>,
    pub conflicts: Vec<FixedTaskConflict>,
}

#[derive(Debug, Clone)]
struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Computes concrete start/end times for a mixed fixed/flexible task list.
///
/// Only the time of day of `planned_start` counts: every task is placed on the
/// schedule start's date and processed in that order. Fixed tasks keep their slot.
/// Flexible tasks flow from a cursor that starts at the resolved schedule start,
/// never runs behind the latest fixed end seen so far, and skips out of any fixed
/// block it lands in. A flexible task whose naive window strictly contains the
/// start of a fixed task is split around the first such task.
///
/// `now` is only consulted when the policy resolves to the current time.
pub fn calculate_schedule(
    tasks: &[Task],
    config: &ScheduleConfig,
    now: DateTime<Utc>,
) -> ScheduleResult {
    let schedule_start = config.resolve_start(now);
    if tasks.is_empty() {
        return ScheduleResult {
            scheduled_tasks: Vec::new(),
            has_overflow: false,
            schedule_end_time: schedule_start,
            conflicts: Vec::new(),
        };
    }

    let day = schedule_start.date_naive();
    let mut ordered = tasks
        .iter()
        .map(|task| (task, at_time_of_day(day, task.start_time_of_day_secs())))
        .collect::<Vec<_>>();
    ordered.sort_by_key(|(_, start)| *start);
    let blocked = fixed_intervals(&ordered);

    let mut cursor = schedule_start;
    let mut max_fixed_end: Option<DateTime<Utc>> = None;
    let mut scheduled_tasks = Vec::with_capacity(ordered.len());

    for (task, placed_start) in ordered {
        if task.is_fixed() {
            let end = placed_start + Duration::seconds(i64::from(task.planned_duration_sec));
            max_fixed_end = Some(max_fixed_end.map_or(end, |current| current.max(end)));
            scheduled_tasks.push(ScheduledTask::uninterrupted(task, placed_start, end));
            continue;
        }

        if let Some(fixed_end) = max_fixed_end {
            cursor = cursor.max(fixed_end);
        }
        cursor = skip_blocked(cursor, &blocked);

        let start = cursor;
        let planned = i64::from(task.planned_duration_sec);
        let naive_end = start + Duration::seconds(planned);
        let interruption = blocked
            .iter()
            .find(|interval| interval.start > start && interval.start < naive_end);

        let entry = match interruption {
            Some(interval) => {
                let before = (interval.start - start).num_seconds().clamp(0, planned);
                let remaining = (planned - before).max(0);
                ScheduledTask {
                    task: task.clone(),
                    calculated_start: start,
                    calculated_end: interval.end + Duration::seconds(remaining),
                    is_interrupted: true,
                    pause_time: Some(interval.start),
                    duration_before_pause_sec: u32::try_from(before).unwrap_or(0),
                    remaining_duration_sec: u32::try_from(remaining).unwrap_or(0),
                }
            }
            None => ScheduledTask::uninterrupted(task, start, naive_end),
        };

        cursor = entry.calculated_end;
        scheduled_tasks.push(entry);
    }

    let schedule_end_time = scheduled_tasks
        .iter()
        .map(|entry| entry.calculated_end)
        .max()
        .unwrap_or(schedule_start);
    let has_overflow = schedule_start
        .date_naive()
        .succ_opt()
        .map(|next_day| schedule_end_time >= at_time_of_day(next_day, 0))
        .unwrap_or(false);

    ScheduleResult {
        scheduled_tasks,
        has_overflow,
        schedule_end_time,
        conflicts: detect_conflicts(tasks),
    }
}

/// Every overlapping pair of fixed tasks, reported once per pair.
pub fn detect_conflicts(tasks: &[Task]) -> Vec<FixedTaskConflict> {
    let mut fixed = tasks.iter().filter(|task| task.is_fixed()).collect::<Vec<_>>();
    fixed.sort_by(|left, right| {
        left.start_time_of_day_secs()
            .cmp(&right.start_time_of_day_secs())
            .then_with(|| left.task_id.cmp(&right.task_id))
    });

    let mut conflicts = Vec::new();
    for (index, first) in fixed.iter().enumerate() {
        for second in &fixed[index + 1..] {
            let (first_start, first_end) = day_window(first);
            let (second_start, second_end) = day_window(second);
            let overlap_sec = first_end.min(second_end) - first_start.max(second_start);
            if overlap_sec <= 0 {
                continue;
            }
            conflicts.push(FixedTaskConflict {
                task_id1: first.task_id.clone(),
                task_id2: second.task_id.clone(),
                overlap_sec,
                message: format!(
                    "\"{}\" ({}) overlaps \"{}\" ({}) by {}",
                    first.name,
                    first.planned_start.format("%H:%M"),
                    second.name,
                    second.planned_start.format("%H:%M"),
                    format_overlap(overlap_sec)
                ),
            });
        }
    }
    conflicts
}

/// Seconds from midnight; the end may run past 86400.
fn day_window(task: &Task) -> (i64, i64) {
    let start = i64::from(task.start_time_of_day_secs());
    (start, start + i64::from(task.planned_duration_sec))
}

fn fixed_intervals(ordered: &[(&Task, DateTime<Utc>)]) -> Vec<Interval> {
    let mut intervals = ordered
        .iter()
        .filter(|(task, _)| task.is_fixed())
        .map(|(task, start)| Interval {
            start: *start,
            end: *start + Duration::seconds(i64::from(task.planned_duration_sec)),
        })
        .collect::<Vec<_>>();
    intervals.sort_unstable_by(|left, right| {
        left.start.cmp(&right.start).then_with(|| left.end.cmp(&right.end))
    });
    intervals
}

fn skip_blocked(mut cursor: DateTime<Utc>, blocked: &[Interval]) -> DateTime<Utc> {
    loop {
        let Some(interval) = blocked
            .iter()
            .find(|interval| interval.start <= cursor && cursor < interval.end)
        else {
            return cursor;
        };
        cursor = interval.end;
    }
}

fn format_overlap(seconds: i64) -> String {
    let minutes = seconds / 60;
    let rest = seconds % 60;
    match (minutes, rest) {
        (0, rest) => format!("{rest}s"),
        (minutes, 0) => format!("{minutes} min"),
        (minutes, rest) => format!("{minutes} min {rest}s"),
    }
}
