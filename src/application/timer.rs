use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type TickListener = Box<dyn Fn(i64) + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub elapsed_ms: i64,
    pub duration_ms: i64,
    pub remaining_ms: i64,
    pub is_running: bool,
    pub is_overtime: bool,
    pub started_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecovery {
    pub recovered_elapsed_ms: i64,
    pub away_time_ms: i64,
    pub is_valid: bool,
}

impl TimerRecovery {
    fn invalid() -> Self {
        Self {
            recovered_elapsed_ms: 0,
            away_time_ms: 0,
            is_valid: false,
        }
    }
}

/// Stopwatch measured against the wall clock.
///
/// Elapsed time is `base + (now - started_at)`, so time spent while the host
/// process is suspended still counts once it wakes up. The timer knows nothing
/// about tasks; `duration_ms` is only used for the remaining/overtime fields of
/// a snapshot.
pub struct Timer {
    now_provider: NowProvider,
    started_at_ms: Option<i64>,
    base_elapsed_ms: i64,
    duration_ms: i64,
    tick_listeners: Vec<TickListener>,
    destroyed: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            now_provider: Arc::new(Utc::now),
            started_at_ms: None,
            base_elapsed_ms: 0,
            duration_ms: 0,
            tick_listeners: Vec::new(),
            destroyed: false,
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn now_ms(&self) -> i64 {
        (self.now_provider)().timestamp_millis()
    }

    /// Starts (or restarts) counting from `offset_ms`, or from zero.
    pub fn start(&mut self, offset_ms: Option<i64>) {
        if self.destroyed {
            tracing::warn!(command = "timer_start", "ignoring start on destroyed timer");
            return;
        }
        self.base_elapsed_ms = offset_ms.unwrap_or(0).max(0);
        self.started_at_ms = Some(self.now_ms());
    }

    pub fn stop(&mut self) -> i64 {
        let elapsed = self.elapsed();
        self.base_elapsed_ms = elapsed;
        self.started_at_ms = None;
        elapsed
    }

    pub fn elapsed(&self) -> i64 {
        match self.started_at_ms {
            Some(started_at) => {
                let delta = (self.now_ms() - started_at).max(0);
                self.base_elapsed_ms.saturating_add(delta)
            }
            None => self.base_elapsed_ms,
        }
    }

    pub fn set_elapsed(&mut self, elapsed_ms: i64) {
        self.base_elapsed_ms = elapsed_ms.max(0);
        if self.started_at_ms.is_some() {
            self.started_at_ms = Some(self.now_ms());
        }
    }

    pub fn set_duration(&mut self, duration_ms: i64) {
        self.duration_ms = duration_ms.max(0);
    }

    pub fn reset(&mut self) {
        self.started_at_ms = None;
        self.base_elapsed_ms = 0;
    }

    pub fn is_running(&self) -> bool {
        self.started_at_ms.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let elapsed_ms = self.elapsed();
        TimerSnapshot {
            elapsed_ms,
            duration_ms: self.duration_ms,
            remaining_ms: (self.duration_ms - elapsed_ms).max(0),
            is_running: self.is_running(),
            is_overtime: self.duration_ms > 0 && elapsed_ms > self.duration_ms,
            started_at_ms: self.started_at_ms,
        }
    }

    pub fn on_tick(&mut self, listener: impl Fn(i64) + Send + Sync + 'static) {
        self.tick_listeners.push(Box::new(listener));
    }

    /// One frame of the tick loop. Returns the elapsed value handed to
    /// listeners, or `None` while stopped.
    pub fn tick(&self) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        let elapsed = self.elapsed();
        for listener in &self.tick_listeners {
            listener(elapsed);
        }
        Some(elapsed)
    }

    /// Restores elapsed time after a reload. A valid recovery resumes the
    /// timer at the recovered value; an invalid one resets it.
    pub fn recover(
        &mut self,
        saved_elapsed_ms: i64,
        last_persisted_at_ms: i64,
        max_elapsed_ms: i64,
    ) -> TimerRecovery {
        let recovery = recover_elapsed(
            saved_elapsed_ms,
            last_persisted_at_ms,
            self.now_ms(),
            max_elapsed_ms,
        );
        if recovery.is_valid {
            self.start(Some(recovery.recovered_elapsed_ms));
        } else {
            self.reset();
        }
        recovery
    }

    pub fn destroy(&mut self) {
        self.reset();
        self.tick_listeners.clear();
        self.destroyed = true;
    }
}

pub fn recover_elapsed(
    saved_elapsed_ms: i64,
    last_persisted_at_ms: i64,
    now_ms: i64,
    max_elapsed_ms: i64,
) -> TimerRecovery {
    let away_time_ms = now_ms - last_persisted_at_ms;
    if away_time_ms < 0 {
        tracing::warn!(
            command = "timer_recover",
            last_persisted_at_ms,
            now_ms,
            "last persisted timestamp is in the future"
        );
        return TimerRecovery::invalid();
    }
    if saved_elapsed_ms < 0 {
        tracing::warn!(
            command = "timer_recover",
            saved_elapsed_ms,
            "saved elapsed value is negative"
        );
        return TimerRecovery::invalid();
    }

    TimerRecovery {
        recovered_elapsed_ms: saved_elapsed_ms
            .saturating_add(away_time_ms)
            .clamp(0, max_elapsed_ms.max(0)),
        away_time_ms,
        is_valid: true,
    }
}

/// Handle to a loop started by [`repeat_every`]. Dropping it stops the loop.
#[derive(Debug)]
pub struct RepeatHandle {
    task: JoinHandle<()>,
}

impl RepeatHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RepeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `action` every `period` on the current tokio runtime until it breaks
/// or the handle is cancelled. Late ticks are skipped, not replayed.
pub fn repeat_every<F>(period: std::time::Duration, mut action: F) -> RepeatHandle
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if action().is_break() {
                break;
            }
        }
    });
    RepeatHandle { task }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::NowProvider;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now_ms: Arc<AtomicI64>,
    }

    impl ManualClock {
        pub fn at(value: &str) -> Self {
            let start = DateTime::parse_from_rfc3339(value)
                .expect("valid datetime")
                .with_timezone(&Utc);
            Self {
                now_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            }
        }

        pub fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.now_ms.load(Ordering::SeqCst))
                .expect("timestamp in range")
        }

        pub fn now_ms(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }

        pub fn advance(&self, duration: Duration) {
            self.now_ms
                .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
        }

        pub fn provider(&self) -> NowProvider {
            let clock = self.clone();
            Arc::new(move || clock.now())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    fn timer_with_clock() -> (Timer, ManualClock) {
        let clock = ManualClock::at("2026-02-16T09:00:00Z");
        let timer = Timer::new().with_now_provider(clock.provider());
        (timer, clock)
    }

    #[test]
    fn elapsed_follows_wall_clock_across_suspension() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(None);
        clock.advance(Duration::seconds(90));
        assert_eq!(timer.elapsed(), 90_000);
        assert_eq!(timer.tick(), Some(90_000));
    }

    #[test]
    fn start_with_offset_resumes_from_saved_value() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(Some(30_000));
        clock.advance(Duration::seconds(5));
        assert_eq!(timer.elapsed(), 35_000);
    }

    #[test]
    fn stop_freezes_elapsed() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(None);
        clock.advance(Duration::seconds(12));
        assert_eq!(timer.stop(), 12_000);
        clock.advance(Duration::seconds(60));
        assert_eq!(timer.elapsed(), 12_000);
        assert!(!timer.is_running());
        assert_eq!(timer.tick(), None);
    }

    #[test]
    fn backwards_clock_never_produces_negative_elapsed() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(None);
        clock.advance(Duration::seconds(-30));
        assert_eq!(timer.elapsed(), 0);
    }

    #[test]
    fn set_elapsed_rebases_running_timer() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(None);
        clock.advance(Duration::seconds(10));
        timer.set_elapsed(60_000);
        clock.advance(Duration::seconds(1));
        assert_eq!(timer.elapsed(), 61_000);
    }

    #[test]
    fn snapshot_reports_remaining_and_overtime() {
        let (mut timer, clock) = timer_with_clock();
        timer.set_duration(60_000);
        timer.start(None);
        clock.advance(Duration::seconds(45));
        let snapshot = timer.snapshot();
        assert_eq!(snapshot.remaining_ms, 15_000);
        assert!(!snapshot.is_overtime);
        assert!(snapshot.is_running);

        clock.advance(Duration::seconds(30));
        let snapshot = timer.snapshot();
        assert_eq!(snapshot.remaining_ms, 0);
        assert!(snapshot.is_overtime);
    }

    #[test]
    fn tick_notifies_listeners_with_elapsed() {
        let (mut timer, clock) = timer_with_clock();
        let last_seen = Arc::new(AtomicI64::new(-1));
        let seen = Arc::clone(&last_seen);
        timer.on_tick(move |elapsed| seen.store(elapsed, Ordering::SeqCst));

        assert_eq!(timer.tick(), None);
        assert_eq!(last_seen.load(Ordering::SeqCst), -1);

        timer.start(None);
        clock.advance(Duration::milliseconds(1500));
        timer.tick();
        assert_eq!(last_seen.load(Ordering::SeqCst), 1500);
    }

    #[test]
    fn destroyed_timer_ignores_start_and_drops_listeners() {
        let (mut timer, _clock) = timer_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        timer.on_tick(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.destroy();
        timer.start(Some(5_000));
        assert!(!timer.is_running());
        assert_eq!(timer.tick(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recovery_adds_time_spent_away() {
        let (mut timer, clock) = timer_with_clock();
        let now = clock.now_ms();
        let recovery = timer.recover(30_000, now - 10_000, 86_400_000);
        assert!(recovery.is_valid);
        assert!((39_000..=41_000).contains(&recovery.recovered_elapsed_ms));
        assert_eq!(recovery.away_time_ms, 10_000);
        assert!(timer.is_running());
        assert_eq!(timer.elapsed(), recovery.recovered_elapsed_ms);
    }

    #[test]
    fn recovery_from_future_timestamp_is_invalid_and_resets() {
        let (mut timer, clock) = timer_with_clock();
        timer.start(Some(99_000));
        let recovery = timer.recover(30_000, clock.now_ms() + 5_000, 86_400_000);
        assert!(!recovery.is_valid);
        assert!(!timer.is_running());
        assert_eq!(timer.elapsed(), 0);
    }

    #[test]
    fn recovery_is_capped() {
        let recovery = recover_elapsed(1_000, 0, 3 * 86_400_000, 86_400_000);
        assert!(recovery.is_valid);
        assert_eq!(recovery.recovered_elapsed_ms, 86_400_000);
    }

    // Property 5: recovery stays inside [0, cap] and is valid for past timestamps
    proptest! {
        #[test]
        fn property5_recovery_is_clamped(
            saved in 0i64..(2 * 86_400_000),
            away in 0i64..(2 * 86_400_000),
        ) {
            let now = 1_771_232_400_000i64;
            let recovery = recover_elapsed(saved, now - away, now, 86_400_000);
            prop_assert!(recovery.is_valid);
            prop_assert!(recovery.recovered_elapsed_ms >= 0);
            prop_assert!(recovery.recovered_elapsed_ms <= 86_400_000);
            prop_assert_eq!(recovery.recovered_elapsed_ms, (saved + away).min(86_400_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_every_runs_until_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = repeat_every(std::time::Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_every_stops_when_action_breaks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = repeat_every(std::time::Duration::from_millis(50), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(handle.is_finished());
    }
}
