//! Jobs, cancellation handles, submission options, and the adapter that
//! turns a [`Trigger`] into a chain of one-shot submissions.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::executor::{DelayQueueExecutor, TaskHandle};
use crate::trigger::{Trigger, TriggerContext};

/// The future produced by one invocation of a job.
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A schedulable unit of work: called once per firing, shared across
/// periodic invocations.
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}

/// Handle to a scheduled task.
///
/// Cancellation marks the task so it never fires again; an invocation that
/// is already running always completes.
pub trait ScheduledTask: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Per-submission options: an absolute first-firing time and the zone a
/// cron expression is evaluated in.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    start_time: Option<DateTime<Utc>>,
    time_zone: Option<String>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire no earlier than `start_time`; an instant in the past means
    /// "immediately".
    pub fn at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Evaluate cron expressions in the named IANA zone instead of UTC.
    pub fn in_time_zone(mut self, zone: impl Into<String>) -> Self {
        self.time_zone = Some(zone.into());
        self
    }

    pub(crate) fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match self.start_time {
            Some(start) if start > now => (start - now).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn resolve_zone(&self) -> Result<Tz> {
        match &self.time_zone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| SchedulerError::UnknownTimeZone(name.clone())),
            None => Ok(chrono_tz::UTC),
        }
    }
}

struct TriggerTaskState {
    context: TriggerContext,
    next_trigger_time: Option<DateTime<Utc>>,
    current: Option<TaskHandle>,
}

/// Drives a [`Trigger`] through repeated one-shot submissions.
///
/// After every completion the firing history is recorded and the trigger is
/// asked for the next instant; `None` ends the chain. The executor holds its
/// own reference to the underlying activation, so the only live link between
/// the two is the activation's shared cancelled bit.
pub struct TriggerTask {
    job: Job,
    executor: Arc<DelayQueueExecutor>,
    trigger: Arc<dyn Trigger>,
    clock: Arc<dyn Clock>,
    state: Mutex<TriggerTaskState>,
    cancelled: AtomicBool,
}

impl TriggerTask {
    pub fn new(job: Job, executor: Arc<DelayQueueExecutor>, trigger: Arc<dyn Trigger>) -> Arc<Self> {
        let clock = executor.clock();
        Arc::new(Self {
            job,
            executor,
            trigger,
            clock,
            state: Mutex::new(TriggerTaskState {
                context: TriggerContext::new(),
                next_trigger_time: None,
                current: None,
            }),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Submit the next one-shot activation of the chain.
    ///
    /// # Errors
    ///
    /// `NoSatisfyingTime` when the trigger yields no instant, or any
    /// submission error from the executor.
    pub fn schedule(this: &Arc<Self>) -> Result<()> {
        let mut state = this.state.lock().unwrap();
        if this.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(next) = this.trigger.next_execution(&state.context) else {
            return Err(SchedulerError::NoSatisfyingTime);
        };
        state.next_trigger_time = Some(next);

        let chain = Arc::clone(this);
        let delay = (next - this.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let handle = this.executor.schedule(
            Arc::new(move || Box::pin(TriggerTask::run_once(Arc::clone(&chain))) as JobFuture),
            delay,
        )?;
        state.current = Some(handle);
        Ok(())
    }

    async fn run_once(this: Arc<Self>) {
        let started = this.clock.now();
        if AssertUnwindSafe((this.job)()).catch_unwind().await.is_err() {
            warn!("triggered job panicked; treated as a completed run");
        }
        let completed = this.clock.now();

        {
            let mut state = this.state.lock().unwrap();
            let scheduled = state.next_trigger_time;
            state.context.record(completed, started, scheduled);
        }

        if this.is_cancelled() {
            return;
        }

        match TriggerTask::schedule(&this) {
            Ok(()) => {}
            Err(SchedulerError::NoSatisfyingTime) => {
                debug!("trigger produced no next execution time; chain stopped");
            }
            Err(err) => debug!("trigger chain stopped: {err}"),
        }
    }
}

impl ScheduledTask for TriggerTask {
    fn cancel(&self) {
        let state = self.state.lock().unwrap();
        self.cancelled.store(true, Ordering::Release);
        if let Some(current) = &state.current {
            current.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        let state = self.state.lock().unwrap();
        state.current.as_ref().map(ScheduledTask::is_cancelled).unwrap_or(false)
    }
}
