//! The delay-queue executor: a single dispatcher task owning a time-ordered
//! queue of pending activations and one timer.
//!
//! Every other task talks to the dispatcher exclusively through channels
//! (submission, reschedule, shutdown); nothing outside the dispatcher ever
//! touches the queue. The only shared state is the submission preamble
//! (shutdown flag + sequence counter, under one mutex), each activation's
//! atomic cancelled bit, and the in-flight counter the shutdown path drains.

use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::runner::{Runner, TokioRunner};
use crate::task::{Job, ScheduledTask};

/// One pending invocation: the executor's unit of work.
pub(crate) struct Activation {
    id: u64,
    job: Job,
    trigger_time: Mutex<DateTime<Utc>>,
    /// Zero means one-shot.
    period: Duration,
    fixed_rate: bool,
    cancelled: AtomicBool,
}

impl Activation {
    fn new(id: u64, job: Job, trigger_time: DateTime<Utc>, period: Duration, fixed_rate: bool) -> Self {
        Self {
            id,
            job,
            trigger_time: Mutex::new(trigger_time),
            period,
            fixed_rate,
            cancelled: AtomicBool::new(false),
        }
    }

    fn trigger_time(&self) -> DateTime<Utc> {
        *self.trigger_time.lock().unwrap()
    }

    fn set_trigger_time(&self, at: DateTime<Utc>) {
        *self.trigger_time.lock().unwrap() = at;
    }

    fn is_periodic(&self) -> bool {
        !self.period.is_zero()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Queue position: trigger time ascending, ties in submission order.
fn queue_order(a: &Arc<Activation>, b: &Arc<Activation>) -> std::cmp::Ordering {
    a.trigger_time().cmp(&b.trigger_time()).then(a.id.cmp(&b.id))
}

/// Cancellation handle for a submitted activation.
///
/// Cancelling never interrupts a running invocation; it marks the activation
/// so the dispatcher skips it at its next due time. A one-shot activation is
/// marked once its single run completes, so `is_cancelled` doubles as "will
/// never fire again".
#[derive(Clone)]
pub struct TaskHandle {
    activation: Arc<Activation>,
}

impl ScheduledTask for TaskHandle {
    fn cancel(&self) {
        self.activation.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.activation.is_cancelled()
    }
}

/// Tracks activations handed to the runner but not yet returned.
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self { count: AtomicUsize::new(0), drained: Notify::new() }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Submission preamble state: checked and advanced atomically so a task can
/// never be enqueued after the shutdown flag is set.
struct SubmissionState {
    is_shutdown: bool,
    next_sequence: u64,
}

/// Schedules jobs at absolute instants, concurrently and cancellably.
///
/// Must be constructed inside a Tokio runtime; the dispatcher runs as a
/// spawned task until [`shutdown`](Self::shutdown).
pub struct DelayQueueExecutor {
    state: Arc<Mutex<SubmissionState>>,
    new_task_tx: mpsc::UnboundedSender<Arc<Activation>>,
    shutdown_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    clock: Arc<dyn Clock>,
}

impl DelayQueueExecutor {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(TokioRunner))
    }

    pub fn with_runner(runner: Arc<dyn Runner>) -> Self {
        let (new_task_tx, new_task_rx) = mpsc::unbounded_channel();
        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Mutex::new(SubmissionState { is_shutdown: false, next_sequence: 0 }));
        let in_flight = Arc::new(InFlight::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let dispatcher = Dispatcher {
            queue: Vec::new(),
            new_task_rx,
            reschedule_rx,
            shutdown_rx,
            reschedule_tx,
            state: Arc::clone(&state),
            in_flight,
            clock: Arc::clone(&clock),
            runner,
        };
        tokio::spawn(dispatcher.run());

        Self { state, new_task_tx, shutdown_tx, clock }
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Enqueue a one-shot activation firing `delay` from now.
    pub fn schedule(&self, job: Job, delay: Duration) -> Result<TaskHandle> {
        self.submit(job, delay, Duration::ZERO, false)
    }

    /// Enqueue a periodic activation with a gap of `delay` between one
    /// completion and the next start.
    pub fn schedule_with_fixed_delay(
        &self,
        job: Job,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<TaskHandle> {
        self.submit(job, initial_delay, delay, false)
    }

    /// Enqueue a periodic activation whose k-th firing is scheduled at
    /// `first_trigger + k * period`, regardless of how long each run takes.
    ///
    /// # Errors
    ///
    /// `InvalidPeriod` when `period` is zero.
    pub fn schedule_at_fixed_rate(
        &self,
        job: Job,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidPeriod);
        }
        self.submit(job, initial_delay, period, true)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().is_shutdown
    }

    /// Stop accepting submissions, discard pending activations, and resolve
    /// the returned signal once every in-flight job has returned.
    ///
    /// # Errors
    ///
    /// `DoubleShutdown` when the executor is already shut down.
    pub fn shutdown(&self) -> Result<oneshot::Receiver<()>> {
        let mut state = self.state.lock().unwrap();
        if state.is_shutdown {
            return Err(SchedulerError::DoubleShutdown);
        }
        state.is_shutdown = true;

        let (done_tx, done_rx) = oneshot::channel();
        self.shutdown_tx
            .send(done_tx)
            .map_err(|_| SchedulerError::DoubleShutdown)?;
        info!("executor shutdown requested");
        Ok(done_rx)
    }

    fn submit(
        &self,
        job: Job,
        initial_delay: Duration,
        period: Duration,
        fixed_rate: bool,
    ) -> Result<TaskHandle> {
        // Held across the enqueue so a submission can never slip in behind
        // the shutdown flag.
        let mut state = self.state.lock().unwrap();
        if state.is_shutdown {
            return Err(SchedulerError::AlreadyShutdown);
        }
        state.next_sequence += 1;

        let activation = Arc::new(Activation::new(
            state.next_sequence,
            job,
            self.clock.now() + initial_delay,
            period,
            fixed_rate,
        ));
        self.new_task_tx
            .send(Arc::clone(&activation))
            .map_err(|_| SchedulerError::AlreadyShutdown)?;

        debug!(task_id = activation.id, periodic = activation.is_periodic(), "task submitted");
        Ok(TaskHandle { activation })
    }
}

impl Default for DelayQueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// The single task that owns the queue and the timer.
struct Dispatcher {
    queue: Vec<Arc<Activation>>,
    new_task_rx: mpsc::UnboundedReceiver<Arc<Activation>>,
    reschedule_rx: mpsc::UnboundedReceiver<Arc<Activation>>,
    shutdown_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    reschedule_tx: mpsc::UnboundedSender<Arc<Activation>>,
    state: Arc<Mutex<SubmissionState>>,
    in_flight: Arc<InFlight>,
    clock: Arc<dyn Clock>,
    runner: Arc<dyn Runner>,
}

impl Dispatcher {
    async fn run(mut self) {
        debug!("dispatcher started");

        loop {
            self.queue.sort_by(queue_order);

            // Arm the timer for the head entry; with an empty queue the
            // timer branch never resolves.
            let next_delay = self.queue.first().map(|head| {
                (head.trigger_time() - self.clock.now()).to_std().unwrap_or(Duration::ZERO)
            });
            let clock = Arc::clone(&self.clock);
            let timer = async move {
                match next_delay {
                    Some(delay) => clock.sleep(delay).await,
                    None => pending::<()>().await,
                }
            };

            // Exactly one event is handled per iteration.
            tokio::select! {
                _ = timer => {
                    let fired_at = self.clock.now();
                    self.fire_due(fired_at);
                }
                maybe_new = self.new_task_rx.recv() => match maybe_new {
                    Some(activation) => self.queue.push(activation),
                    None => return,
                },
                maybe_rescheduled = self.reschedule_rx.recv() => match maybe_rescheduled {
                    Some(activation) => self.queue.push(activation),
                    None => return,
                },
                maybe_done = self.shutdown_rx.recv() => match maybe_done {
                    Some(done) => {
                        if !self.queue.is_empty() {
                            debug!(discarded = self.queue.len(), "discarding pending activations");
                        }
                        self.queue.clear();
                        self.in_flight.wait_drained().await;
                        let _ = done.send(());
                        info!("dispatcher stopped");
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    /// Hand every due head entry to the runner. Cancelled entries are
    /// dropped; fixed-rate entries are re-enqueued at `trigger + period`
    /// before dispatch so their cadence never slips.
    fn fire_due(&mut self, fired_at: DateTime<Utc>) {
        let due = self
            .queue
            .iter()
            .take_while(|activation| activation.trigger_time() <= fired_at)
            .count();

        let due_entries: Vec<_> = self.queue.drain(..due).collect();
        for activation in due_entries {
            if activation.is_cancelled() {
                debug!(task_id = activation.id, "skipping cancelled activation");
                continue;
            }

            if activation.is_periodic() && activation.fixed_rate {
                activation.set_trigger_time(activation.trigger_time() + activation.period);
                self.queue.push(Arc::clone(&activation));
            }

            debug!(task_id = activation.id, "activation due");
            self.start_task(activation);
        }
    }

    fn start_task(&self, activation: Arc<Activation>) {
        self.in_flight.enter();

        let state = Arc::clone(&self.state);
        let in_flight = Arc::clone(&self.in_flight);
        let reschedule_tx = self.reschedule_tx.clone();
        let clock = Arc::clone(&self.clock);

        self.runner.run(Box::pin(async move {
            if AssertUnwindSafe((activation.job)()).catch_unwind().await.is_err() {
                warn!(task_id = activation.id, "job panicked; treated as a completed run");
            }

            if state.lock().unwrap().is_shutdown {
                activation.cancel();
                in_flight.exit();
                return;
            }
            in_flight.exit();

            if !activation.is_periodic() {
                // Terminal: a one-shot never fires again.
                activation.cancel();
            } else if !activation.fixed_rate {
                activation.set_trigger_time(clock.now() + activation.period);
                let _ = reschedule_tx.send(activation);
            }
        }));
    }
}
