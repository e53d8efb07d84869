//! The user-facing scheduler: resolves submission options and routes each
//! scheduling style to the executor or a trigger chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::executor::DelayQueueExecutor;
use crate::runner::{Runner, TokioRunner};
use crate::task::{Job, ScheduleOptions, ScheduledTask, TriggerTask};
use crate::trigger::CronTrigger;

/// Schedules jobs one-shot, on a fixed-delay or fixed-rate cadence, or from
/// a cron expression.
///
/// Must be created inside a Tokio runtime. All scheduling entry points
/// return a [`ScheduledTask`] handle for cancellation.
pub struct Scheduler {
    executor: Arc<DelayQueueExecutor>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(TokioRunner))
    }

    /// Use a custom [`Runner`] to execute activations.
    pub fn with_runner(runner: Arc<dyn Runner>) -> Self {
        let executor = Arc::new(DelayQueueExecutor::with_runner(runner));
        let clock = executor.clock();
        Self { executor, clock }
    }

    /// Run `job` once, at `options.at(..)` or immediately without it.
    pub fn schedule(&self, job: Job, options: ScheduleOptions) -> Result<Arc<dyn ScheduledTask>> {
        let delay = options.initial_delay(self.clock.now());
        let handle = self.executor.schedule(job, delay)?;
        Ok(Arc::new(handle))
    }

    /// Run `job` periodically with a gap of `delay` between one completion
    /// and the next start.
    pub fn schedule_with_fixed_delay(
        &self,
        job: Job,
        delay: Duration,
        options: ScheduleOptions,
    ) -> Result<Arc<dyn ScheduledTask>> {
        let initial_delay = options.initial_delay(self.clock.now());
        let handle = self.executor.schedule_with_fixed_delay(job, initial_delay, delay)?;
        Ok(Arc::new(handle))
    }

    /// Run `job` periodically with successive starts `period` apart,
    /// regardless of how long each run takes.
    pub fn schedule_at_fixed_rate(
        &self,
        job: Job,
        period: Duration,
        options: ScheduleOptions,
    ) -> Result<Arc<dyn ScheduledTask>> {
        let initial_delay = options.initial_delay(self.clock.now());
        let handle = self.executor.schedule_at_fixed_rate(job, initial_delay, period)?;
        Ok(Arc::new(handle))
    }

    /// Run `job` at the instants matched by `expression`, evaluated in the
    /// zone from `options` (UTC without one).
    pub fn schedule_with_cron(
        &self,
        job: Job,
        expression: &str,
        options: ScheduleOptions,
    ) -> Result<Arc<dyn ScheduledTask>> {
        let zone = options.resolve_zone()?;
        let trigger = CronTrigger::new(expression, zone)?.with_clock(Arc::clone(&self.clock));

        let task = TriggerTask::new(job, Arc::clone(&self.executor), Arc::new(trigger));
        TriggerTask::schedule(&task)?;
        debug!(%expression, %zone, "cron task scheduled");
        Ok(task)
    }

    pub fn is_shutdown(&self) -> bool {
        self.executor.is_shutdown()
    }

    /// Stop the scheduler; the returned signal resolves once every running
    /// job has finished.
    pub fn shutdown(&self) -> Result<oneshot::Receiver<()>> {
        self.executor.shutdown()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::task::job;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_job(counter: Arc<AtomicU32>) -> Job {
        job(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn one_shot_with_start_time_fires_once() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let start = Utc::now() + Duration::from_millis(300);
        let task = scheduler
            .schedule(counting_job(Arc::clone(&counter)), ScheduleOptions::new().at(start))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "fired before its start time");

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn fixed_rate_runs_repeatedly() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let task = scheduler
            .schedule_at_fixed_rate(
                counting_job(Arc::clone(&counter)),
                Duration::from_millis(100),
                ScheduleOptions::new(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(550)).await;
        task.cancel();
        let count = counter.load(Ordering::SeqCst);
        assert!((2..=7).contains(&count), "expected 2..=7 runs, got {count}");
    }

    #[tokio::test]
    async fn cron_schedule_fires_on_matching_seconds() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let task = scheduler
            .schedule_with_cron(
                counting_job(Arc::clone(&counter)),
                "* * * * * *",
                ScheduleOptions::new(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        task.cancel();
        let count = counter.load(Ordering::SeqCst);
        assert!(count >= 1, "expected at least one firing, got {count}");
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            scheduler.schedule_with_cron(counting_job(counter), "* * *", ScheduleOptions::new()),
            Err(SchedulerError::InvalidCronExpression(_))
        ));
    }

    #[tokio::test]
    async fn unknown_zone_is_rejected_before_parsing_fires() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            scheduler.schedule_with_cron(
                counting_job(counter),
                "* * * * * *",
                ScheduleOptions::new().in_time_zone("Middle-Earth/Hobbiton"),
            ),
            Err(SchedulerError::UnknownTimeZone(_))
        ));
    }

    #[tokio::test]
    async fn zero_period_fixed_rate_is_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            scheduler.schedule_at_fixed_rate(
                counting_job(counter),
                Duration::ZERO,
                ScheduleOptions::new()
            ),
            Err(SchedulerError::InvalidPeriod)
        ));
    }

    #[tokio::test]
    async fn shutdown_quiesces_the_scheduler() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        scheduler
            .schedule_at_fixed_rate(
                counting_job(Arc::clone(&counter)),
                Duration::from_millis(100),
                ScheduleOptions::new(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!scheduler.is_shutdown());
        let done = scheduler.shutdown().unwrap();
        done.await.unwrap();
        assert!(scheduler.is_shutdown());

        let at_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(counter.load(Ordering::SeqCst), at_shutdown);
    }
}
