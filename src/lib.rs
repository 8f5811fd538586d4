//! Day schedule tracking core.
//!
//! `domain` holds the pure model and calculations, `application` the session
//! machine, timer and tracker that drive a live day, and `infrastructure` the
//! SQLite store, configuration and logging.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, open_tracker, BootstrapResult, OpenedTracker};
pub use application::recalculation::ScheduleRecalculator;
pub use application::session::{SessionEvent, SessionMachine};
pub use application::timer::{recover_elapsed, repeat_every, NowProvider, RepeatHandle, Timer, TimerRecovery, TimerSnapshot};
pub use application::tracker::{spawn_background, BackgroundHandles, LifecycleEvent, RecoveryOutcome, Tracker};
pub use domain::error::SessionError;
pub use domain::models::{
    DaySession, DaySummary, NewTaskInput, ProgressStatus, ScheduleConfig, ScheduleMode,
    SessionStatus, Task, TaskProgress, TaskStatus, TaskType, TaskUpdates,
};
pub use domain::projection::{
    calculate_projected_start, calculate_risk_level, create_projected_tasks, fixed_task_warning,
    FixedTaskWarning, ProjectedTask, RiskLevel,
};
pub use domain::schedule::{calculate_schedule, detect_conflicts, FixedTaskConflict, ScheduleResult, ScheduledTask};
pub use infrastructure::config::TrackerConfig;
pub use infrastructure::error::InfraError;
pub use infrastructure::logging::init_logging;
pub use infrastructure::session_store::{InMemorySessionStore, SessionStore, SqliteSessionStore};
