use crate::application::session::SessionMachine;
use crate::application::timer::{repeat_every, NowProvider, RepeatHandle, Timer, TimerRecovery, TimerSnapshot};
use crate::domain::error::SessionError;
use crate::domain::models::{DaySummary, ProgressStatus, Task};
use crate::domain::projection::{FixedTaskWarning, ProjectedTask};
use crate::infrastructure::config::TrackerConfig;
use crate::infrastructure::session_store::SessionStore;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Host visibility changes that force or follow up on persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Hidden,
    Visible,
    PageHide,
    BeforeUnload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NoSession,
    /// A session exists but no task was being timed.
    Idle,
    Resumed {
        task_id: String,
        recovery: TimerRecovery,
    },
    Reset {
        task_id: String,
    },
}

/// Pairs one session machine with one timer. The session holds what was
/// recorded; the timer holds what is being measured right now.
pub struct Tracker<S: SessionStore> {
    machine: SessionMachine<S>,
    timer: Timer,
    config: TrackerConfig,
}

impl<S: SessionStore> Tracker<S> {
    pub fn new(store: Arc<S>, config: TrackerConfig) -> Self {
        Self {
            machine: SessionMachine::new(store),
            timer: Timer::new(),
            config,
        }
    }

    pub fn with_now_provider(self, now_provider: NowProvider) -> Self {
        Self {
            machine: self.machine.with_now_provider(Arc::clone(&now_provider)),
            timer: self.timer.with_now_provider(now_provider),
            config: self.config,
        }
    }

    pub fn machine(&self) -> &SessionMachine<S> {
        &self.machine
    }

    /// Direct access for edits that do not touch the timer (add, reorder,
    /// update, corrections).
    pub fn machine_mut(&mut self) -> &mut SessionMachine<S> {
        &mut self.machine
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn on_tick(&mut self, listener: impl Fn(i64) + Send + Sync + 'static) {
        self.timer.on_tick(listener);
    }

    pub fn start_day(&mut self, tasks: Vec<Task>) -> Result<(), SessionError> {
        self.machine.start_day(tasks)?;
        self.timer.reset();
        self.timer.set_duration(0);
        Ok(())
    }

    /// Starts timing `task_id`, pausing the task being timed.
    pub fn start_task(&mut self, task_id: &str) -> Result<bool, SessionError> {
        let paused_elapsed_sec = whole_seconds(self.timer.elapsed());
        if !self.machine.jump_to_task(task_id, paused_elapsed_sec)? {
            return Ok(false);
        }

        let (elapsed_ms, duration_ms) = match (self.machine.session(), self.machine.current_task()) {
            (Some(session), Some(task)) => (
                session.current_task_elapsed_ms,
                i64::from(task.planned_duration_sec) * 1000,
            ),
            _ => (0, 0),
        };
        self.timer.start(Some(elapsed_ms));
        self.timer.set_duration(duration_ms);
        Ok(true)
    }

    /// Completes the timed task with the timer's value rounded to whole seconds.
    pub fn complete_current_task(&mut self) -> Result<(), SessionError> {
        let actual_duration_sec = whole_seconds(self.timer.elapsed());
        self.machine.complete_task(actual_duration_sec)?;
        self.timer.reset();
        self.timer.set_duration(0);
        Ok(())
    }

    pub fn mark_missed(&mut self, task_id: &str) -> bool {
        let was_current = self
            .machine
            .current_task()
            .is_some_and(|task| task.task_id == task_id);
        let marked = self.machine.mark_missed(task_id);
        if marked && was_current {
            self.timer.reset();
            self.timer.set_duration(0);
        }
        marked
    }

    /// Writes the running timer's value to the store. No-op while stopped.
    pub fn sync_elapsed(&mut self) -> bool {
        if !self.timer.is_running() {
            return false;
        }
        self.machine.persist_elapsed(self.timer.elapsed())
    }

    /// Returns whether the event caused a write.
    pub fn handle_lifecycle(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Hidden | LifecycleEvent::PageHide | LifecycleEvent::BeforeUnload => {
                let persisted = self.sync_elapsed();
                tracing::debug!(command = "handle_lifecycle", ?event, persisted, "forced sync");
                persisted
            }
            LifecycleEvent::Visible => {
                self.timer.tick();
                false
            }
        }
    }

    /// Reloads the stored day and resumes the timer for the active task,
    /// crediting the time spent away.
    pub fn recover_on_load(&mut self) -> RecoveryOutcome {
        if !self.machine.load_from_store() {
            self.timer.reset();
            return RecoveryOutcome::NoSession;
        }
        let Some(session) = self.machine.session() else {
            return RecoveryOutcome::NoSession;
        };
        let active = session
            .current_progress()
            .filter(|progress| session.is_running() && progress.status == ProgressStatus::Active)
            .map(|progress| progress.task_id.clone());
        let Some(task_id) = active else {
            self.timer.reset();
            return RecoveryOutcome::Idle;
        };
        let saved_elapsed_ms = session.current_task_elapsed_ms;
        let last_persisted_at = session.last_persisted_at;
        let duration_ms = self
            .machine
            .current_task()
            .map(|task| i64::from(task.planned_duration_sec) * 1000)
            .unwrap_or(0);

        let recovery = self.timer.recover(
            saved_elapsed_ms,
            last_persisted_at,
            self.config.max_recovery_elapsed_ms,
        );
        self.timer.set_duration(duration_ms);

        if recovery.is_valid {
            self.machine.persist_elapsed(recovery.recovered_elapsed_ms);
            tracing::info!(
                command = "recover_on_load",
                task_id = %task_id,
                recovered_elapsed_ms = recovery.recovered_elapsed_ms,
                away_time_ms = recovery.away_time_ms,
                "timer resumed"
            );
            RecoveryOutcome::Resumed { task_id, recovery }
        } else {
            self.machine.persist_elapsed(0);
            tracing::warn!(
                command = "recover_on_load",
                task_id = %task_id,
                "stored timer state rejected; timer reset"
            );
            RecoveryOutcome::Reset { task_id }
        }
    }

    pub fn end_day(&mut self) -> Result<DaySummary, SessionError> {
        let summary = self.machine.end_day(whole_seconds(self.timer.elapsed()))?;
        self.timer.reset();
        Ok(summary)
    }

    pub fn reset(&mut self) -> bool {
        self.timer.reset();
        self.timer.set_duration(0);
        self.machine.reset()
    }

    pub fn tick(&self) -> Option<i64> {
        self.timer.tick()
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.timer.snapshot()
    }

    pub fn projected_tasks(&self) -> Vec<ProjectedTask> {
        self.machine.projected_tasks(self.timer.elapsed())
    }

    pub fn fixed_task_warning(&self) -> Option<FixedTaskWarning> {
        self.machine.fixed_task_warning(self.timer.elapsed())
    }

    /// Final sync, then the timer stops accepting starts.
    pub fn shutdown(&mut self) {
        self.sync_elapsed();
        self.timer.destroy();
    }
}

fn whole_seconds(elapsed_ms: i64) -> u32 {
    u32::try_from((elapsed_ms.max(0) + 500) / 1000).unwrap_or(u32::MAX)
}

/// Tick, periodic sync and backup sync loops for one tracker. Dropping the
/// value stops all three.
#[derive(Debug)]
pub struct BackgroundHandles {
    tick: RepeatHandle,
    sync: RepeatHandle,
    backup: RepeatHandle,
}

impl BackgroundHandles {
    pub fn cancel(&self) {
        self.tick.cancel();
        self.sync.cancel();
        self.backup.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.tick.is_finished() && self.sync.is_finished() && self.backup.is_finished()
    }
}

/// Must be called inside a tokio runtime.
pub fn spawn_background<S>(tracker: Arc<Mutex<Tracker<S>>>) -> BackgroundHandles
where
    S: SessionStore + 'static,
{
    let config = tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .config()
        .clone();

    let tick = spawn_loop(
        "tick",
        Arc::clone(&tracker),
        config.tick_interval_ms,
        |tracker| {
            tracker.tick();
        },
    );
    let sync = spawn_loop(
        "sync",
        Arc::clone(&tracker),
        config.sync_interval_ms,
        |tracker| {
            tracker.sync_elapsed();
        },
    );
    let backup = spawn_loop("backup", tracker, config.backup_interval_ms, |tracker| {
        tracker.sync_elapsed();
    });
    tracing::info!(
        command = "spawn_background",
        tick_interval_ms = config.tick_interval_ms,
        sync_interval_ms = config.sync_interval_ms,
        backup_interval_ms = config.backup_interval_ms,
        "background loops started"
    );

    BackgroundHandles { tick, sync, backup }
}

fn spawn_loop<S, F>(
    name: &'static str,
    tracker: Arc<Mutex<Tracker<S>>>,
    period_ms: u64,
    action: F,
) -> RepeatHandle
where
    S: SessionStore + 'static,
    F: Fn(&mut Tracker<S>) + Send + 'static,
{
    repeat_every(Duration::from_millis(period_ms.max(1)), move || {
        match tracker.lock() {
            Ok(mut guard) => {
                action(&mut guard);
                ControlFlow::Continue(())
            }
            Err(_) => {
                tracing::error!(command = "background_loop", loop_name = name, "tracker lock poisoned; stopping");
                ControlFlow::Break(())
            }
        }
    })
}
