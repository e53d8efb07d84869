//! `cadence` — in-process task scheduling for Tokio.
//!
//! # Overview
//!
//! Jobs are submitted to a [`Scheduler`] together with a timing policy and
//! fire at the right wall-clock instants until cancelled or shut down. A
//! single dispatcher task owns the time-ordered activation queue and one
//! timer; submissions, reschedulings, and shutdown reach it over channels,
//! and due activations are handed to a [`Runner`] so jobs never block the
//! dispatcher.
//!
//! # Scheduling styles
//!
//! | Style         | Behaviour                                                  |
//! |---------------|------------------------------------------------------------|
//! | One-shot      | Single fire after a delay or at an absolute instant        |
//! | Fixed delay   | A gap of `delay` between one completion and the next start |
//! | Fixed rate    | The k-th firing at `start + k * period`, never slipping    |
//! | Cron          | Six-field cron expression, evaluated in an IANA time zone  |
//!
//! # Example
//!
//! ```no_run
//! use cadence::{job, ScheduleOptions, Scheduler};
//! use std::time::Duration;
//!
//! # async fn demo() -> cadence::Result<()> {
//! let scheduler = Scheduler::new();
//!
//! let task = scheduler.schedule_at_fixed_rate(
//!     job(|| async { println!("tick") }),
//!     Duration::from_secs(1),
//!     ScheduleOptions::new(),
//! )?;
//!
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! task.cancel();
//!
//! scheduler.shutdown()?.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod cron;
pub mod error;
pub mod executor;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod trigger;

pub use clock::{Clock, SystemClock};
pub use cron::CronExpression;
pub use error::{Result, SchedulerError};
pub use executor::{DelayQueueExecutor, TaskHandle};
pub use runner::{Runner, TokioRunner};
pub use scheduler::Scheduler;
pub use task::{job, Job, JobFuture, ScheduleOptions, ScheduledTask, TriggerTask};
pub use trigger::{CronTrigger, OneShotTrigger, PeriodicTrigger, Trigger, TriggerContext};
