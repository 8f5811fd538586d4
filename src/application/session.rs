use crate::application::timer::NowProvider;
use crate::domain::error::SessionError;
use crate::domain::models::{
    next_id, DaySession, DaySummary, NewTaskInput, ProgressStatus, ScheduleConfig, SessionStatus,
    Task, TaskProgress, TaskStatus, TaskType, TaskUpdates,
};
use crate::domain::projection::{
    create_projected_tasks, fixed_task_warning, FixedTaskWarning, ProjectedTask,
};
use crate::domain::schedule::{calculate_schedule, ScheduleResult};
use crate::infrastructure::session_store::SessionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notifications for observers of the session (UI, other tabs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DayStarted { session_id: String },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String, actual_duration_sec: u32 },
    TaskMissed { task_id: String },
    TaskAdded { task_id: String, index: usize },
    TasksReordered { from_index: usize, to_index: usize },
    TaskUpdated { task_id: String },
    ProgressUpdated { task_id: String, actual_duration_sec: u32 },
    TaskUncompleted { task_id: String },
    DayEnded { summary: DaySummary },
    ScheduleConfigChanged,
    Restored,
    Reset,
}

/// Owns the day's task list and live session.
///
/// `tasks` and `session.task_progress` are parallel arrays; every structural
/// change below edits both and renumbers `sort_order` before persisting.
pub struct SessionMachine<S: SessionStore> {
    store: Arc<S>,
    tasks: Vec<Task>,
    session: Option<DaySession>,
    now_provider: NowProvider,
    events: broadcast::Sender<SessionEvent>,
}

impl<S: SessionStore> SessionMachine<S> {
    pub fn new(store: Arc<S>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            tasks: Vec::new(),
            session: None,
            now_provider: Arc::new(Utc::now),
            events,
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn session(&self) -> Option<&DaySession> {
        self.session.as_ref()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn current_task(&self) -> Option<&Task> {
        let session = self.session.as_ref()?;
        self.tasks.get(session.current_task_index)
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(DaySession::is_running)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn start_day(&mut self, tasks: Vec<Task>) -> Result<(), SessionError> {
        self.start_day_with_config(tasks, ScheduleConfig::default())
    }

    pub fn start_day_with_config(
        &mut self,
        mut tasks: Vec<Task>,
        schedule_config: ScheduleConfig,
    ) -> Result<(), SessionError> {
        if tasks.is_empty() {
            tracing::warn!(command = "start_day", "refusing to start a day without tasks");
            return Err(SessionError::EmptyTaskList);
        }
        if self.is_running() {
            tracing::warn!(command = "start_day", "a session is already running");
            return Err(SessionError::AlreadyRunning);
        }

        for task in &mut tasks {
            task.status = TaskStatus::Pending;
        }
        renumber(&mut tasks);
        let task_progress = tasks.iter().map(TaskProgress::pending_for).collect::<Vec<_>>();
        let current_task_index = next_pending_index(&tasks, &task_progress).unwrap_or(0);
        let now = self.now();
        let session = DaySession {
            session_id: next_id("ses"),
            started_at: now,
            ended_at: None,
            status: SessionStatus::Running,
            current_task_index,
            current_task_elapsed_ms: 0,
            last_persisted_at: now.timestamp_millis(),
            total_lag_sec: 0,
            task_progress,
            timer_started_at_ms: None,
            schedule_config,
        };
        let session_id = session.session_id.clone();
        self.tasks = tasks;
        self.session = Some(session);

        self.persist_elapsed_change("start_day");
        tracing::info!(
            command = "start_day",
            session_id = %session_id,
            tasks = self.tasks.len(),
            "day started"
        );
        self.emit(SessionEvent::DayStarted { session_id });
        Ok(())
    }

    pub fn complete_task(&mut self, actual_duration_sec: u32) -> Result<(), SessionError> {
        let now = self.now();
        let session = self.session.as_mut().ok_or(SessionError::NoSession)?;
        if !session.is_running() {
            return Err(SessionError::NotRunning);
        }
        let index = session.current_task_index;
        let Some(progress) = session
            .task_progress
            .get_mut(index)
            .filter(|progress| progress.status == ProgressStatus::Active)
        else {
            return Err(SessionError::NoActiveTask);
        };

        progress.status = ProgressStatus::Complete;
        progress.actual_duration_sec = actual_duration_sec;
        progress.completed_at = Some(now);
        let lag = progress.lag_sec();
        let task_id = progress.task_id.clone();
        session.total_lag_sec += lag;
        if let Some(task) = self.tasks.get_mut(index) {
            task.status = TaskStatus::Complete;
        }

        session.current_task_elapsed_ms = 0;
        session.timer_started_at_ms = None;
        match next_pending_index(&self.tasks, &session.task_progress) {
            Some(next) => session.current_task_index = next,
            None => {
                session.status = SessionStatus::Complete;
                session.ended_at = Some(now);
            }
        }
        let day_complete = session.status == SessionStatus::Complete;

        self.persist_elapsed_change("complete_task");
        tracing::info!(
            command = "complete_task",
            task_id = %task_id,
            actual_duration_sec,
            lag_sec = lag,
            day_complete,
            "task completed"
        );
        self.emit(SessionEvent::TaskCompleted {
            task_id,
            actual_duration_sec,
        });
        Ok(())
    }

    /// Makes `task_id` the active task, pausing whichever task was active.
    /// `current_elapsed_sec` is what the paused task has accumulated so far.
    pub fn jump_to_task(
        &mut self,
        task_id: &str,
        current_elapsed_sec: u32,
    ) -> Result<bool, SessionError> {
        let now_ms = self.now().timestamp_millis();
        let session = self.session.as_mut().ok_or(SessionError::NoSession)?;
        if !session.is_running() {
            tracing::warn!(command = "jump_to_task", task_id, "session is not running");
            return Ok(false);
        }
        let Some(target) = index_of(&self.tasks, task_id) else {
            tracing::warn!(command = "jump_to_task", task_id, "task not found");
            return Ok(false);
        };
        if session.task_progress[target].status.is_terminal() {
            tracing::warn!(command = "jump_to_task", task_id, "task is already finished");
            return Ok(false);
        }

        if let Some(active) = session.active_index() {
            let paused = &mut session.task_progress[active];
            paused.actual_duration_sec = current_elapsed_sec;
            paused.status = ProgressStatus::Pending;
            paused.completed_at = None;
            self.tasks[active].status = TaskStatus::Pending;
        }

        let progress = &mut session.task_progress[target];
        progress.status = ProgressStatus::Active;
        session.current_task_elapsed_ms = i64::from(progress.actual_duration_sec) * 1000;
        session.current_task_index = target;
        session.timer_started_at_ms = Some(now_ms);
        self.tasks[target].status = TaskStatus::Active;

        self.persist_elapsed_change("jump_to_task");
        tracing::info!(command = "jump_to_task", task_id, index = target, "task started");
        self.emit(SessionEvent::TaskStarted {
            task_id: task_id.to_string(),
        });
        Ok(true)
    }

    pub fn mark_missed(&mut self, task_id: &str) -> bool {
        let now = self.now();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(index) = index_of(&self.tasks, task_id) else {
            tracing::warn!(command = "mark_missed", task_id, "task not found");
            return false;
        };
        let progress = &mut session.task_progress[index];
        if progress.status.is_terminal() {
            tracing::warn!(command = "mark_missed", task_id, "task is already finished");
            return false;
        }

        progress.status = ProgressStatus::Missed;
        progress.completed_at = Some(now);
        self.tasks[index].status = TaskStatus::Complete;

        let was_current = index == session.current_task_index;
        if was_current {
            session.current_task_elapsed_ms = 0;
            session.timer_started_at_ms = None;
            match next_pending_index(&self.tasks, &session.task_progress) {
                Some(next) => session.current_task_index = next,
                None => {
                    session.status = SessionStatus::Complete;
                    session.ended_at = Some(now);
                }
            }
        }

        if was_current {
            self.persist_elapsed_change("mark_missed");
        } else {
            self.persist("mark_missed");
        }
        tracing::info!(command = "mark_missed", task_id, "task marked missed");
        self.emit(SessionEvent::TaskMissed {
            task_id: task_id.to_string(),
        });
        true
    }

    /// Inserts an ad-hoc task into the running day. Fixed tasks land at their
    /// chronological slot, flexible ones right after the current task.
    pub fn add_task(&mut self, input: NewTaskInput) -> Option<Task> {
        let now = self.now();
        let Some(session) = self.session.as_mut().filter(|session| session.is_running()) else {
            tracing::warn!(command = "add_task", "no running session");
            return None;
        };
        if let Err(message) = input.validate() {
            tracing::warn!(command = "add_task", reason = %message, "invalid task input");
            return None;
        }

        let planned_start = input.planned_start.unwrap_or(now);
        let mut task = Task::new(
            input.name.trim(),
            planned_start,
            input.planned_duration_sec,
            input.task_type,
        );
        task.is_ad_hoc = true;

        let index = match input.task_type {
            TaskType::Fixed => {
                let start = task.start_time_of_day_secs();
                self.tasks
                    .iter()
                    .position(|existing| existing.start_time_of_day_secs() > start)
                    .unwrap_or(self.tasks.len())
            }
            TaskType::Flexible => (session.current_task_index + 1).min(self.tasks.len()),
        };
        if index <= session.current_task_index {
            session.current_task_index += 1;
        }
        session
            .task_progress
            .insert(index, TaskProgress::pending_for(&task));
        self.tasks.insert(index, task);
        renumber(&mut self.tasks);

        let created = self.tasks[index].clone();
        self.persist("add_task");
        tracing::info!(
            command = "add_task",
            task_id = %created.task_id,
            index,
            "ad-hoc task added"
        );
        self.emit(SessionEvent::TaskAdded {
            task_id: created.task_id.clone(),
            index,
        });
        Some(created)
    }

    /// Moves a task to `to_index` (which may equal the task count, meaning
    /// "to the end"). Finished history and fixed tasks never move, and
    /// nothing may be placed at or before the current task.
    pub fn reorder_tasks(&mut self, from_index: usize, to_index: usize) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let len = self.tasks.len();
        if from_index >= len || to_index > len {
            tracing::warn!(command = "reorder_tasks", from_index, to_index, "index out of range");
            return false;
        }
        if from_index == to_index {
            return true;
        }

        let current = session.current_task_index;
        let rejection = if self.tasks[from_index].is_fixed() {
            Some("fixed tasks cannot be moved")
        } else if session.task_progress[from_index].status.is_terminal() {
            Some("finished tasks cannot be moved")
        } else if from_index < current {
            Some("tasks before the current one cannot be moved")
        } else if to_index <= current {
            Some("destination is at or before the current task")
        } else {
            None
        };
        if let Some(reason) = rejection {
            tracing::warn!(command = "reorder_tasks", from_index, to_index, reason, "reorder rejected");
            return false;
        }

        let destination = to_index.min(len - 1);
        let task = self.tasks.remove(from_index);
        let progress = session.task_progress.remove(from_index);
        self.tasks.insert(destination, task);
        session.task_progress.insert(destination, progress);
        if from_index == current {
            session.current_task_index = destination;
        }
        renumber(&mut self.tasks);

        self.persist("reorder_tasks");
        tracing::info!(command = "reorder_tasks", from_index, to_index = destination, "tasks reordered");
        self.emit(SessionEvent::TasksReordered {
            from_index,
            to_index: destination,
        });
        true
    }

    pub fn update_task(&mut self, task_id: &str, updates: TaskUpdates) -> bool {
        let Some(index) = index_of(&self.tasks, task_id) else {
            tracing::warn!(command = "update_task", task_id, "task not found");
            return false;
        };
        if let Err(message) = updates.validate() {
            tracing::warn!(command = "update_task", task_id, reason = %message, "invalid update");
            return false;
        }

        let task = &mut self.tasks[index];
        if let Some(name) = &updates.name {
            task.name = name.trim().to_string();
        }
        if let Some(planned_start) = updates.planned_start {
            task.planned_start = planned_start;
        }
        if let Some(task_type) = updates.task_type {
            task.task_type = task_type;
        }
        if let Some(duration) = updates.planned_duration_sec {
            task.planned_duration_sec = duration;
            if let Some(progress) = self
                .session
                .as_mut()
                .and_then(|session| session.task_progress.get_mut(index))
                .filter(|progress| !progress.status.is_terminal())
            {
                progress.planned_duration_sec = duration;
            }
        }

        self.persist("update_task");
        tracing::info!(command = "update_task", task_id, "task updated");
        self.emit(SessionEvent::TaskUpdated {
            task_id: task_id.to_string(),
        });
        true
    }

    /// Corrects the recorded duration of a completed task; lag moves by the
    /// same delta.
    pub fn update_task_progress(&mut self, task_id: &str, actual_duration_sec: u32) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(progress) = session
            .task_progress
            .iter_mut()
            .find(|progress| progress.task_id == task_id)
            .filter(|progress| progress.status == ProgressStatus::Complete)
        else {
            tracing::warn!(command = "update_task_progress", task_id, "no completed task to correct");
            return false;
        };

        let delta = i64::from(actual_duration_sec) - i64::from(progress.actual_duration_sec);
        progress.actual_duration_sec = actual_duration_sec;
        session.total_lag_sec += delta;

        self.persist("update_task_progress");
        tracing::info!(command = "update_task_progress", task_id, delta_sec = delta, "progress corrected");
        self.emit(SessionEvent::ProgressUpdated {
            task_id: task_id.to_string(),
            actual_duration_sec,
        });
        true
    }

    /// Reopens a completed task, keeping its recorded time so a later jump
    /// resumes from it.
    pub fn uncomplete_task(&mut self, task_id: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(index) = session
            .task_progress
            .iter()
            .position(|progress| progress.task_id == task_id)
            .filter(|&index| session.task_progress[index].status == ProgressStatus::Complete)
        else {
            tracing::warn!(command = "uncomplete_task", task_id, "task is not complete");
            return false;
        };

        let progress = &mut session.task_progress[index];
        session.total_lag_sec -= progress.lag_sec();
        progress.status = ProgressStatus::Pending;
        progress.completed_at = None;
        if let Some(task) = self.tasks.get_mut(index) {
            task.status = TaskStatus::Pending;
        }
        if session.status == SessionStatus::Complete {
            session.status = SessionStatus::Running;
            session.ended_at = None;
        }

        self.persist("uncomplete_task");
        tracing::info!(command = "uncomplete_task", task_id, "task reopened");
        self.emit(SessionEvent::TaskUncompleted {
            task_id: task_id.to_string(),
        });
        true
    }

    /// Closes the day. A task still being timed is paused with
    /// `current_elapsed_sec` first, so its time lands in the summary.
    pub fn end_day(&mut self, current_elapsed_sec: u32) -> Result<DaySummary, SessionError> {
        let now = self.now();
        let session = self.session.as_mut().ok_or(SessionError::NoSession)?;
        if let Some(active) = session.active_index() {
            let paused = &mut session.task_progress[active];
            paused.actual_duration_sec = current_elapsed_sec;
            paused.status = ProgressStatus::Pending;
            paused.completed_at = None;
            if let Some(task) = self.tasks.get_mut(active) {
                task.status = TaskStatus::Pending;
            }
        }
        let ended_at = *session.ended_at.get_or_insert(now);
        session.status = SessionStatus::Complete;
        session.current_task_elapsed_ms = 0;
        session.timer_started_at_ms = None;

        let mut summary = DaySummary {
            session_id: session.session_id.clone(),
            total_planned_sec: 0,
            total_actual_sec: 0,
            completed_count: 0,
            on_time_count: 0,
            late_count: 0,
            missed_count: 0,
            pending_count: 0,
            total_lag_sec: session.total_lag_sec,
            session_duration_sec: (ended_at - session.started_at).num_seconds().max(0),
        };
        for progress in &session.task_progress {
            summary.total_planned_sec += u64::from(progress.planned_duration_sec);
            summary.total_actual_sec += u64::from(progress.actual_duration_sec);
            match progress.status {
                ProgressStatus::Complete => {
                    summary.completed_count += 1;
                    if progress.actual_duration_sec <= progress.planned_duration_sec {
                        summary.on_time_count += 1;
                    } else {
                        summary.late_count += 1;
                    }
                }
                ProgressStatus::Missed => summary.missed_count += 1,
                ProgressStatus::Pending | ProgressStatus::Active => summary.pending_count += 1,
            }
        }

        self.persist_elapsed_change("end_day");
        tracing::info!(
            command = "end_day",
            session_id = %summary.session_id,
            completed = summary.completed_count,
            missed = summary.missed_count,
            total_lag_sec = summary.total_lag_sec,
            "day ended"
        );
        self.emit(SessionEvent::DayEnded {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    pub fn set_schedule_config(&mut self, schedule_config: ScheduleConfig) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.schedule_config = schedule_config;
        self.persist("set_schedule_config");
        self.emit(SessionEvent::ScheduleConfigChanged);
        true
    }

    /// Rehydrates state as-is. Nothing is validated or written back.
    pub fn restore(&mut self, session: Option<DaySession>, tasks: Vec<Task>) {
        self.session = session;
        self.tasks = tasks;
        self.emit(SessionEvent::Restored);
    }

    /// Reads the persisted day. Unreadable or inconsistent records leave the
    /// machine empty; returns whether a session was restored.
    pub fn load_from_store(&mut self) -> bool {
        let tasks = self.store.load_tasks().unwrap_or_else(|error| {
            tracing::error!(command = "load_from_store", error = %error, "failed to load tasks");
            Vec::new()
        });
        let session = self.store.get_session().unwrap_or_else(|error| {
            tracing::error!(command = "load_from_store", error = %error, "failed to load session");
            None
        });

        let session = session.filter(|session| match check_stored_day(session, &tasks) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!(
                    command = "load_from_store",
                    session_id = %session.session_id,
                    reason = %reason,
                    "stored session is inconsistent; discarding"
                );
                false
            }
        });

        let restored = session.is_some();
        if restored {
            self.restore(session, tasks);
        } else {
            self.restore(None, Vec::new());
        }
        tracing::info!(command = "load_from_store", restored, "state loaded");
        restored
    }

    /// Forgets the day in memory and in storage.
    pub fn reset(&mut self) -> bool {
        self.session = None;
        self.tasks.clear();

        let mut persisted = true;
        if let Err(error) = self.store.clear_session() {
            tracing::error!(command = "reset", error = %error, "failed to clear stored session");
            persisted = false;
        }
        if let Err(error) = self.store.save_tasks(&[]) {
            tracing::error!(command = "reset", error = %error, "failed to clear stored tasks");
            persisted = false;
        }
        tracing::info!(command = "reset", persisted, "session reset");
        self.emit(SessionEvent::Reset);
        persisted
    }

    /// Records the live timer value so a reload can recover it.
    pub fn persist_elapsed(&mut self, elapsed_ms: i64) -> bool {
        let now_ms = self.now().timestamp_millis();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.current_task_elapsed_ms = elapsed_ms.max(0);
        session.last_persisted_at = now_ms;
        match self.store.save_session(session) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(command = "persist_elapsed", error = %error, "failed to save session");
                false
            }
        }
    }

    pub fn schedule(&self) -> ScheduleResult {
        let config = self
            .session
            .as_ref()
            .map(|session| session.schedule_config.clone())
            .unwrap_or_default();
        calculate_schedule(&self.tasks, &config, self.now())
    }

    pub fn projected_tasks(&self, current_elapsed_ms: i64) -> Vec<ProjectedTask> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        create_projected_tasks(
            &self.tasks,
            &session.task_progress,
            session.current_task_index,
            current_elapsed_ms,
            self.now(),
        )
    }

    pub fn fixed_task_warning(&self, current_elapsed_ms: i64) -> Option<FixedTaskWarning> {
        let session = self.session.as_ref()?;
        fixed_task_warning(
            &self.tasks,
            &session.task_progress,
            session.current_task_index,
            current_elapsed_ms,
            self.now(),
        )
    }

    /// Saves after an operation that rewrote `current_task_elapsed_ms`, so the
    /// stamp marks when that value was true.
    fn persist_elapsed_change(&mut self, command: &'static str) -> bool {
        let now_ms = self.now().timestamp_millis();
        if let Some(session) = self.session.as_mut() {
            session.last_persisted_at = now_ms;
        }
        self.persist(command)
    }

    /// Saves without touching `last_persisted_at`; recovery keeps crediting
    /// the time since the elapsed value was last written.
    fn persist(&mut self, command: &'static str) -> bool {
        let mut persisted = true;
        if let Err(error) = self.store.save_tasks(&self.tasks) {
            tracing::error!(command, error = %error, "failed to save tasks");
            persisted = false;
        }
        if let Some(session) = &self.session {
            if let Err(error) = self.store.save_session(session) {
                tracing::error!(command, error = %error, "failed to save session");
                persisted = false;
            }
        }
        persisted
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// A stored day is usable only when every record is valid on its own and
/// the progress list lines up with the task list.
fn check_stored_day(session: &DaySession, tasks: &[Task]) -> Result<(), String> {
    session.validate()?;
    for task in tasks {
        task.validate()
            .map_err(|error| format!("task {}: {error}", task.task_id))?;
    }
    let aligned = session.task_progress.len() == tasks.len()
        && session
            .task_progress
            .iter()
            .zip(tasks)
            .all(|(progress, task)| progress.task_id == task.task_id);
    if !aligned {
        return Err("progress records do not match stored tasks".to_string());
    }
    Ok(())
}

fn index_of(tasks: &[Task], task_id: &str) -> Option<usize> {
    tasks.iter().position(|task| task.task_id == task_id)
}

fn renumber(tasks: &mut [Task]) {
    for (index, task) in tasks.iter_mut().enumerate() {
        task.sort_order = index;
    }
}

/// Earliest unfinished task by time of day, so skipped tasks stay reachable.
fn next_pending_index(tasks: &[Task], progress: &[TaskProgress]) -> Option<usize> {
    progress
        .iter()
        .enumerate()
        .filter(|(_, progress)| !progress.status.is_terminal())
        .filter_map(|(index, _)| tasks.get(index).map(|task| (index, task)))
        .min_by_key(|(_, task)| (task.start_time_of_day_secs(), task.sort_order))
        .map(|(index, _)| index)
}
