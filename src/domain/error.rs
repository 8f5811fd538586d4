use thiserror::Error;

/// Caller misuse of the session API. Expected rejections (a disallowed drag,
/// an unknown task id) are reported through `false`/`None` instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot start a day without tasks")]
    EmptyTaskList,
    #[error("a day session is already running")]
    AlreadyRunning,
    #[error("no day session exists")]
    NoSession,
    #[error("day session is not running")]
    NotRunning,
    #[error("no task is active")]
    NoActiveTask,
}
