//! Triggers: strategies that yield the next execution instant from the
//! firing history recorded in a [`TriggerContext`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::clock::{Clock, SystemClock};
use crate::cron::CronExpression;
use crate::error::{Result, SchedulerError};

/// The firing history a trigger computes from.
///
/// All three instants are unset until the first completion, after which they
/// are updated together as one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerContext {
    last_scheduled_execution: Option<DateTime<Utc>>,
    last_actual_execution: Option<DateTime<Utc>>,
    last_completion: Option<DateTime<Utc>>,
}

impl TriggerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed run.
    pub fn record(
        &mut self,
        completion: DateTime<Utc>,
        actual_execution: DateTime<Utc>,
        scheduled_execution: Option<DateTime<Utc>>,
    ) {
        self.last_completion = Some(completion);
        self.last_actual_execution = Some(actual_execution);
        self.last_scheduled_execution = scheduled_execution;
    }

    /// The instant the trigger previously chose, if any.
    pub fn last_scheduled_execution(&self) -> Option<DateTime<Utc>> {
        self.last_scheduled_execution
    }

    /// When the runner actually started the last run, if any.
    pub fn last_actual_execution(&self) -> Option<DateTime<Utc>> {
        self.last_actual_execution
    }

    /// When the last run returned, if any.
    pub fn last_completion(&self) -> Option<DateTime<Utc>> {
        self.last_completion
    }

    fn has_fired(&self) -> bool {
        self.last_completion.is_some()
    }
}

/// A strategy producing the next execution instant, or `None` when the task
/// should not fire again.
pub trait Trigger: Send + Sync {
    fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>>;
}

/// Fires exactly once, `delay` after the first query.
pub struct OneShotTrigger {
    delay: Duration,
    clock: Arc<dyn Clock>,
}

impl OneShotTrigger {
    pub fn new(delay: Duration) -> Self {
        Self { delay, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Trigger for OneShotTrigger {
    fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>> {
        if ctx.has_fired() {
            None
        } else {
            Some(self.clock.now() + self.delay)
        }
    }
}

/// A periodic cadence, either rate-based (anchored on the previous scheduled
/// instant) or delay-based (anchored on the previous completion).
///
/// An instant in the past is returned as-is: an overrunning task fires
/// immediately, it never skips.
pub struct PeriodicTrigger {
    period: Duration,
    initial_delay: Duration,
    fixed_rate: bool,
    clock: Arc<dyn Clock>,
}

impl PeriodicTrigger {
    /// # Errors
    ///
    /// `InvalidPeriod` when `period` is zero.
    pub fn new(period: Duration, initial_delay: Duration, fixed_rate: bool) -> Result<Self> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidPeriod);
        }
        Ok(Self { period, initial_delay, fixed_rate, clock: Arc::new(SystemClock) })
    }

    /// Successive firings `period` apart, regardless of run time.
    pub fn at_fixed_rate(period: Duration, initial_delay: Duration) -> Result<Self> {
        Self::new(period, initial_delay, true)
    }

    /// A gap of `period` between one completion and the next start.
    pub fn with_fixed_delay(period: Duration, initial_delay: Duration) -> Result<Self> {
        Self::new(period, initial_delay, false)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Trigger for PeriodicTrigger {
    fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>> {
        if !ctx.has_fired() {
            return Some(self.clock.now() + self.initial_delay);
        }

        if self.fixed_rate {
            let anchor = ctx.last_scheduled_execution().or(ctx.last_completion())?;
            Some(anchor + self.period)
        } else {
            Some(ctx.last_completion()? + self.period)
        }
    }
}

/// Fires at the instants matched by a cron expression, evaluated in a fixed
/// time zone.
pub struct CronTrigger {
    expression: CronExpression,
    zone: Tz,
    clock: Arc<dyn Clock>,
}

impl CronTrigger {
    /// # Errors
    ///
    /// `InvalidCronExpression` when `expression` does not compile.
    pub fn new(expression: &str, zone: Tz) -> Result<Self> {
        Ok(Self {
            expression: CronExpression::parse(expression)?,
            zone,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Trigger for CronTrigger {
    fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>> {
        let mut anchor = self.clock.now();

        // If the previously chosen instant is still in the future (the
        // process clock was adjusted backwards), search from it instead of
        // from "now" so the same instant is not fired twice.
        if let Some(scheduled) = ctx.last_scheduled_execution() {
            if scheduled > anchor {
                anchor = scheduled;
            }
        }

        let next = self.expression.next_after(anchor.with_timezone(&self.zone))?;
        Some(next.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::future::BoxFuture;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }

        fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
            Box::pin(std::future::ready(()))
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn fired_context(
        scheduled: DateTime<Utc>,
        actual: DateTime<Utc>,
        completion: DateTime<Utc>,
    ) -> TriggerContext {
        let mut ctx = TriggerContext::new();
        ctx.record(completion, actual, Some(scheduled));
        ctx
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(matches!(
            PeriodicTrigger::new(Duration::ZERO, Duration::ZERO, true),
            Err(SchedulerError::InvalidPeriod)
        ));
    }

    #[test]
    fn one_shot_fires_once_then_stops() {
        let now = utc(2024, 1, 1, 12, 0, 0);
        let trigger =
            OneShotTrigger::new(Duration::from_secs(5)).with_clock(Arc::new(FixedClock(now)));

        let ctx = TriggerContext::new();
        assert_eq!(trigger.next_execution(&ctx), Some(utc(2024, 1, 1, 12, 0, 5)));

        let fired = fired_context(now, now, utc(2024, 1, 1, 12, 0, 6));
        assert_eq!(trigger.next_execution(&fired), None);
    }

    #[test]
    fn virgin_periodic_uses_initial_delay() {
        let now = utc(2024, 1, 1, 12, 0, 0);
        let trigger = PeriodicTrigger::at_fixed_rate(Duration::from_secs(10), Duration::from_secs(3))
            .unwrap()
            .with_clock(Arc::new(FixedClock(now)));

        assert_eq!(
            trigger.next_execution(&TriggerContext::new()),
            Some(utc(2024, 1, 1, 12, 0, 3))
        );
    }

    #[test]
    fn fixed_rate_anchors_on_the_scheduled_instant() {
        let scheduled = utc(2024, 1, 1, 12, 0, 0);
        let trigger = PeriodicTrigger::at_fixed_rate(Duration::from_secs(10), Duration::ZERO)
            .unwrap()
            .with_clock(Arc::new(FixedClock(utc(2024, 1, 1, 12, 0, 7))));

        // The run took 7 seconds; the cadence is unaffected.
        let ctx = fired_context(scheduled, scheduled, utc(2024, 1, 1, 12, 0, 7));
        assert_eq!(trigger.next_execution(&ctx), Some(utc(2024, 1, 1, 12, 0, 10)));
    }

    #[test]
    fn fixed_delay_anchors_on_the_completion() {
        let scheduled = utc(2024, 1, 1, 12, 0, 0);
        let trigger = PeriodicTrigger::with_fixed_delay(Duration::from_secs(10), Duration::ZERO)
            .unwrap()
            .with_clock(Arc::new(FixedClock(utc(2024, 1, 1, 12, 0, 7))));

        let ctx = fired_context(scheduled, scheduled, utc(2024, 1, 1, 12, 0, 7));
        assert_eq!(trigger.next_execution(&ctx), Some(utc(2024, 1, 1, 12, 0, 17)));
    }

    #[test]
    fn cron_trigger_searches_from_now() {
        let trigger = CronTrigger::new("0 30 9 * * *", chrono_tz::UTC)
            .unwrap()
            .with_clock(Arc::new(FixedClock(utc(2024, 6, 1, 8, 0, 0))));

        assert_eq!(
            trigger.next_execution(&TriggerContext::new()),
            Some(utc(2024, 6, 1, 9, 30, 0))
        );
    }

    #[test]
    fn cron_trigger_anchors_on_future_scheduled_instant_after_clock_skew() {
        // The clock stepped back behind the previously chosen instant; the
        // next firing must come after that instant, not after "now".
        let trigger = CronTrigger::new("0 0 * * * *", chrono_tz::UTC)
            .unwrap()
            .with_clock(Arc::new(FixedClock(utc(2024, 6, 1, 8, 10, 0))));

        let scheduled = utc(2024, 6, 1, 9, 0, 0);
        let ctx = fired_context(scheduled, scheduled, utc(2024, 6, 1, 9, 0, 1));
        assert_eq!(trigger.next_execution(&ctx), Some(utc(2024, 6, 1, 10, 0, 0)));
    }

    #[test]
    fn cron_trigger_evaluates_in_its_zone() {
        let zone: Tz = "Europe/Istanbul".parse().unwrap();
        let trigger = CronTrigger::new("0 0 9 * * *", zone)
            .unwrap()
            .with_clock(Arc::new(FixedClock(utc(2024, 6, 1, 0, 0, 0))));

        // 09:00 in Istanbul (UTC+3) is 06:00 UTC.
        assert_eq!(
            trigger.next_execution(&TriggerContext::new()),
            Some(utc(2024, 6, 1, 6, 0, 0))
        );
    }
}
