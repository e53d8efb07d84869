use thiserror::Error;

/// Errors that can occur within the scheduling subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be compiled.
    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    /// A periodic trigger or fixed-rate submission was given a zero period.
    #[error("Period must be greater than zero")]
    InvalidPeriod,

    /// The time-zone name could not be resolved to an IANA zone.
    #[error("Unknown time zone: {0}")]
    UnknownTimeZone(String),

    /// A task was submitted after the executor had been shut down.
    #[error("Executor is shut down; new tasks are not accepted")]
    AlreadyShutdown,

    /// `shutdown` was invoked on an executor that is already shut down.
    #[error("Executor is already shut down")]
    DoubleShutdown,

    /// The trigger produced no next execution time, so the task can never fire.
    #[error("Trigger produced no next execution time")]
    NoSatisfyingTime,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
