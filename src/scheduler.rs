//! Print job scheduler.
//!
//! One timer per terminal drains at most one job per tick. The timer exists
//! only while there is something this terminal can print: it stops itself
//! when the queue has no eligible candidate and is restarted by
//! [`JobScheduler::enqueue`] and [`JobScheduler::retry`]. Processing a job
//! is `queued -> printing -> done | error`; `done` jobs are deleted after a
//! grace period so operators briefly see them complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Role;
use crate::error::PosError;
use crate::models::{NewPrintJob, PrintJob, PrintJobStatus};
use crate::print::{FailureInjector, PrintQueue, PrintRenderer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A job was already being processed.
    Busy,
    /// Nothing this terminal can print.
    Idle,
    Processed { job_id: String, status: PrintJobStatus },
}

#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    pub tick_every: Duration,
    pub print_latency: Duration,
    pub done_grace: Duration,
}

pub struct JobScheduler {
    queue: PrintQueue,
    renderer: Arc<dyn PrintRenderer>,
    failures: Arc<FailureInjector>,
    role: Role,
    clock: Arc<dyn Clock>,
    timing: SchedulerTiming,
    in_flight: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    jobs_tx: watch::Sender<Vec<PrintJob>>,
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        queue: PrintQueue,
        renderer: Arc<dyn PrintRenderer>,
        role: Role,
        clock: Arc<dyn Clock>,
        timing: SchedulerTiming,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, PosError> {
        let jobs = queue.list()?;
        Ok(Arc::new(Self {
            queue,
            renderer,
            failures: Arc::new(FailureInjector::default()),
            role,
            clock,
            timing,
            in_flight: AtomicBool::new(false),
            timer: Mutex::new(None),
            jobs_tx: watch::channel(jobs).0,
            cancel,
        }))
    }

    /// Recover from a previous run and arm the timer if there is work.
    pub fn start(self: &Arc<Self>) -> Result<(), PosError> {
        let now = self.clock.now_ms();
        self.queue.recover_interrupted(now)?;
        self.queue.purge_done_before(now - self.grace_ms())?;
        self.publish();
        if self.has_candidate()? {
            self.ensure_timer()?;
        }
        info!(role = %self.role, "Print scheduler started");
        Ok(())
    }

    pub fn failures(&self) -> &Arc<FailureInjector> {
        &self.failures
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PrintJob>> {
        self.jobs_tx.subscribe()
    }

    pub fn jobs(&self) -> Result<Vec<PrintJob>, PosError> {
        self.queue.list()
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub fn enqueue(self: &Arc<Self>, job: NewPrintJob) -> Result<PrintJob, PosError> {
        let created = self.queue.enqueue(&job, self.clock.now_ms())?;
        self.publish();
        if self.role.can_print(created.destination) {
            self.ensure_timer()?;
        } else {
            debug!(job_id = %created.id, role = %self.role, "Job queued for another terminal's printer");
        }
        Ok(created)
    }

    /// Manual retry of a failed job.
    pub fn retry(self: &Arc<Self>, job_id: &str) -> Result<PrintJob, PosError> {
        let job = self.queue.retry(job_id)?;
        self.publish();
        if self.role.can_print(job.destination) {
            self.ensure_timer()?;
        }
        Ok(job)
    }

    pub fn remove(&self, job_id: &str) -> Result<(), PosError> {
        self.queue.remove(job_id)?;
        self.publish();
        Ok(())
    }

    /// Stop the timer. Pending grace deletions are cancelled with it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Process at most one job.
    pub async fn tick(self: &Arc<Self>) -> Result<TickOutcome, PosError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Ok(TickOutcome::Busy);
        }
        let mut guard = TickGuard {
            scheduler: self,
            printing: None,
        };
        self.process_next(&mut guard).await
    }

    async fn process_next(
        self: &Arc<Self>,
        guard: &mut TickGuard<'_>,
    ) -> Result<TickOutcome, PosError> {
        let now = self.clock.now_ms();
        if self.queue.purge_done_before(now - self.grace_ms())? > 0 {
            self.publish();
        }

        let Some(candidate) = self.queue.next_candidate(self.role.print_destinations())? else {
            return Ok(TickOutcome::Idle);
        };

        let job = self.queue.mark_printing(&candidate.id, self.clock.now_ms())?;
        guard.printing = Some(job.id.clone());
        self.publish();
        info!(job_id = %job.id, attempt = job.attempts, priority = job.priority, "Printing job");

        tokio::time::sleep(self.timing.print_latency).await;

        let rendered = if self.failures.consume() {
            Err(PosError::Io(std::io::Error::other("injected print failure")))
        } else {
            self.renderer.render(&job).await
        };

        let finished = match rendered {
            Ok(()) => {
                let done = self.queue.mark_done(&job.id, self.clock.now_ms())?;
                self.schedule_removal(done.id.clone());
                info!(job_id = %done.id, "Print job done");
                done
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Print job failed");
                self.queue.mark_error(&job.id, &e.to_string(), self.clock.now_ms())?
            }
        };
        guard.printing = None;
        self.publish();

        Ok(TickOutcome::Processed {
            job_id: finished.id,
            status: finished.status,
        })
    }

    fn schedule_removal(self: &Arc<Self>, job_id: String) {
        let this = Arc::clone(self);
        let grace = self.timing.done_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    match this.queue.remove_done(&job_id) {
                        Ok(true) => {
                            debug!(job_id = %job_id, "Done print job removed after grace period");
                            this.publish();
                        }
                        Ok(false) => {}
                        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove done print job"),
                    }
                }
            }
        });
    }

    fn ensure_timer(self: &Arc<Self>) -> Result<(), PosError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let mut slot = self.timer.lock()?;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { this.run_timer().await }));
        debug!("Print timer armed");
        Ok(())
    }

    async fn run_timer(self: Arc<Self>) {
        let every = self.timing.tick_every;
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(TickOutcome::Idle) => {
                    // Re-check under the slot lock so a concurrent enqueue
                    // either sees this timer alive or finds the slot empty.
                    let Ok(mut slot) = self.timer.lock() else { break };
                    match self.has_candidate() {
                        Ok(true) => continue,
                        Ok(false) => {
                            *slot = None;
                            debug!("Print queue drained; timer stopped");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Print queue check failed");
                            continue;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Print tick failed"),
            }
        }
    }

    fn has_candidate(&self) -> Result<bool, PosError> {
        Ok(self
            .queue
            .next_candidate(self.role.print_destinations())?
            .is_some())
    }

    fn grace_ms(&self) -> i64 {
        self.timing.done_grace.as_millis() as i64
    }

    fn publish(&self) {
        match self.queue.list() {
            Ok(jobs) => {
                self.jobs_tx.send_replace(jobs);
            }
            Err(e) => warn!(error = %e, "Failed to publish print jobs"),
        }
    }
}

/// Frees the tick slot when a tick ends or is dropped. A job still marked
/// `printing` at that point never reached the device and goes to `error`.
struct TickGuard<'a> {
    scheduler: &'a JobScheduler,
    printing: Option<String>,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        let s = self.scheduler;
        if let Some(job_id) = self.printing.take() {
            match s.queue.mark_error(&job_id, "interrupted", s.clock.now_ms()) {
                Ok(_) => {
                    warn!(job_id = %job_id, "Print tick cancelled mid-job; job marked as error");
                    s.publish();
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to release interrupted print job"),
            }
        }
        s.in_flight.store(false, Ordering::SeqCst);
    }
}
