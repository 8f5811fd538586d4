use crate::application::timer::NowProvider;
use crate::domain::models::{ScheduleConfig, Task};
use crate::domain::schedule::{calculate_schedule, ScheduleResult};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::sleep;

type ResultListener = Arc<dyn Fn(ScheduleResult) + Send + Sync>;

/// Coalesces bursts of recalculation requests (e.g. while dragging rows)
/// into a single `calculate_schedule` call once the input has been quiet for
/// `delay`.
pub struct ScheduleRecalculator {
    delay: std::time::Duration,
    now_provider: NowProvider,
    on_result: ResultListener,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleRecalculator {
    pub fn new(
        delay: std::time::Duration,
        on_result: impl Fn(ScheduleResult) + Send + Sync + 'static,
    ) -> Self {
        Self {
            delay,
            now_provider: Arc::new(Utc::now),
            on_result: Arc::new(on_result),
            pending: Mutex::new(None),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Replaces any pending request. Must be called inside a tokio runtime.
    pub fn request(&self, tasks: Vec<Task>, config: ScheduleConfig) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let delay = self.delay;
        let now_provider = Arc::clone(&self.now_provider);
        let on_result = Arc::clone(&self.on_result);
        *pending = Some(tokio::spawn(async move {
            sleep(delay).await;
            let result = calculate_schedule(&tasks, &config, now_provider());
            tracing::debug!(
                command = "recalculate_schedule",
                tasks = result.scheduled_tasks.len(),
                conflicts = result.conflicts.len(),
                has_overflow = result.has_overflow,
                "schedule recalculated"
            );
            on_result(result);
        }));
    }

    /// Drops the pending request. Returns whether one was still waiting.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

impl Drop for ScheduleRecalculator {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}
