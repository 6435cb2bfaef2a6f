//! Ties validation, admission, execution and bookkeeping together.
//!
//! [`Orchestrator::submit`] does all its checking up front and returns at
//! once. Everything after that happens in a per-job driver task:
//!
//! 1. If the job needs a GPU, wait in the admission queue.
//! 2. Run the engine on its own task, racing it against the job's deadline.
//! 3. Record exactly one terminal state, then give back the slot.
//!
//! Queueing and execution share a single deadline, fixed at submission.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout_at},
};

use crate::{
    admission::{Admission, AdmissionQueue, AdmissionSlot},
    config::ServiceConfig,
    cpu_limit::CpuLimiter,
    engines::{EngineError, OcrEngine, default_engines},
    error::{
        AwaitError, JobErrorKind, JobLookupError, ProcessError, ResultError, SubmitError,
    },
    jobs::{JobId, JobStatus, JobStore, JobView, NewJob},
    params::{EngineConfig, ParameterValidator, RawParams},
    prelude::*,
    registry::{CapabilityRegistry, EngineRegistry, EngineSummary},
};

/// A request to OCR one file.
#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    /// Which engine to use. Required.
    pub engine: Option<String>,

    /// Engine parameters. Only parameters the engine declares are allowed.
    pub params: RawParams,

    /// The file to OCR.
    pub path: PathBuf,
}

/// What [`Orchestrator::submit`] returns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,

    /// Where the job is in the GPU queue, if it had to wait.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

/// The front door of the service.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    validator: ParameterValidator,
    queue: AdmissionQueue,
    jobs: Arc<JobStore>,
    config: ServiceConfig,
}

impl Orchestrator {
    /// Create an orchestrator over already-probed engines.
    pub fn new(registry: Arc<CapabilityRegistry>, config: ServiceConfig) -> Self {
        Self {
            validator: ParameterValidator::new(registry.clone()),
            queue: AdmissionQueue::new(config.max_concurrent_gpu),
            jobs: Arc::new(JobStore::new(config.retention)),
            registry,
            config,
        }
    }

    /// Register and probe our built-in engines, and create an orchestrator.
    pub async fn with_default_engines(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let table = EngineRegistry::with_engines(default_engines(CpuLimiter::per_cpu()))?;
        let registry = CapabilityRegistry::probe_all(table, config.probe_timeout).await;
        Ok(Self::new(Arc::new(registry), config))
    }

    /// Our configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Our GPU admission queue.
    pub fn admission_queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    /// Our capability registry.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// How many job records we are holding, finished or not.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Summaries of every registered engine.
    pub fn list_engines(&self) -> Vec<EngineSummary> {
        self.registry.list_engines()
    }

    /// Validate a request and start a job for it.
    ///
    /// Nothing is created if validation fails. On success the job runs in the
    /// background. Must be called from inside a Tokio runtime.
    #[instrument(level = "debug", skip_all, fields(engine = request.engine.as_deref()))]
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        let config = self
            .validator
            .parse(request.engine.as_deref(), &request.params)?;
        let engine_name = request.engine.as_deref().map(str::trim).unwrap_or_default();
        let engine = self.registry.engine(engine_name)?;
        let gpu = engine.descriptor().supports_gpu && config.requests_gpu();

        // The clock starts now, before any queueing.
        let deadline = Instant::now() + self.config.job_timeout;
        let job_id = self.jobs.create(NewJob {
            engine: engine_name.to_owned(),
            config: config.clone(),
            gpu,
            input_path: request.path.clone(),
        });

        // Join the queue before returning, so queue order is submission order.
        let admission = gpu.then(|| self.queue.try_acquire(job_id));
        let queue_position = match &admission {
            Some(Admission::Queued { position, .. }) => Some(*position),
            _ => None,
        };
        if queue_position.is_none() {
            // Nothing left to wait for.
            self.jobs.mark_admitted(job_id);
        }
        info!(
            %job_id,
            engine = engine_name,
            gpu,
            queue_position,
            "Accepted job"
        );

        let driver = JobDriver {
            job_id,
            engine,
            config,
            input: request.path,
            deadline,
            budget: self.config.job_timeout,
            queue: self.queue.clone(),
            jobs: self.jobs.clone(),
        };
        tokio::spawn(driver.run(admission));

        Ok(SubmitReceipt {
            job_id,
            queue_position,
        })
    }

    /// Current status of a job.
    pub fn get_status(&self, job_id: JobId) -> Result<JobView, JobLookupError> {
        self.jobs.view(job_id)
    }

    /// The hOCR output of a finished job.
    pub fn get_result(&self, job_id: JobId) -> Result<Arc<str>, ResultError> {
        self.jobs.result(job_id)
    }

    /// Wait up to `timeout` for a job to finish.
    pub async fn await_result(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobView, AwaitError> {
        self.jobs.wait_for_terminal(job_id, timeout).await
    }

    /// Give up on a job. Returns `false` if it had already finished.
    ///
    /// The job is recorded as failed right away. Its driver then stops the
    /// engine and gives back any GPU slot.
    #[instrument(level = "debug", skip(self))]
    pub fn cancel(&self, job_id: JobId) -> Result<bool, JobLookupError> {
        self.jobs.view(job_id)?;
        let cancelled = self
            .jobs
            .fail(job_id, JobErrorKind::Cancelled, "cancelled by client");
        if cancelled {
            info!(%job_id, "Cancelled job");
        }
        Ok(cancelled)
    }

    /// Submit a job and wait up to `timeout` for it to finish.
    ///
    /// If this future is dropped before the wait ends, the job is cancelled.
    /// If the wait times out, the job keeps running and can be polled.
    pub async fn process_sync(
        &self,
        request: SubmitRequest,
        timeout: Duration,
    ) -> Result<JobView, ProcessError> {
        let receipt = self.submit(request)?;
        let mut guard = CancelOnDrop {
            orchestrator: self,
            job_id: receipt.job_id,
            armed: true,
        };
        let result = self.await_result(receipt.job_id, timeout).await;
        guard.armed = false;
        Ok(result?)
    }

    /// Remove every job whose retention window ended before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let purged = self.jobs.purge_expired(now);
        if purged > 0 {
            info!(purged, remaining = self.jobs.len(), "Purged expired jobs");
        }
        purged
    }

    /// Purge expired jobs every `reaper_interval`, until the returned task is
    /// aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let interval = self.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                orchestrator.purge_expired(Utc::now());
            }
        })
    }
}

/// Cancels a job if dropped while armed.
struct CancelOnDrop<'a> {
    orchestrator: &'a Orchestrator,
    job_id: JobId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(job_id = %self.job_id, "Caller went away, cancelling job");
            let _ = self.orchestrator.cancel(self.job_id);
        }
    }
}

/// Everything one job's background task needs.
struct JobDriver {
    job_id: JobId,
    engine: Arc<dyn OcrEngine>,
    config: EngineConfig,
    input: PathBuf,
    deadline: Instant,
    budget: Duration,
    queue: AdmissionQueue,
    jobs: Arc<JobStore>,
}

impl JobDriver {
    #[instrument(
        level = "debug",
        name = "job",
        skip_all,
        fields(job_id = %self.job_id, engine = self.engine.descriptor().name)
    )]
    async fn run(self, admission: Option<Admission>) {
        let mut status_rx = match self.jobs.subscribe(self.job_id) {
            Ok(rx) => rx,
            Err(err) => {
                warn!("Job vanished before it started: {err}");
                return;
            }
        };

        let slot = match self.admit(admission, &mut status_rx).await {
            Some(slot) => slot,
            None => return,
        };

        if !self.jobs.mark_processing(self.job_id) {
            // Cancelled in between.
            return;
        }

        let engine = self.engine.clone();
        let config = self.config.clone();
        let input = self.input.clone();
        let task = tokio::spawn(async move {
            let raw = engine.process(&input, &config).await?;
            Ok::<_, EngineError>(engine.to_standard_format(&raw))
        });
        let abort = task.abort_handle();

        let outcome = tokio::select! {
            outcome = timeout_at(self.deadline, task) => outcome,
            _ = wait_until_finished(&mut status_rx) => {
                debug!("Job finished elsewhere, stopping engine");
                abort.abort();
                return;
            }
        };

        // Record the outcome while we still hold the slot, so the next GPU job
        // can't reach `Processing` before this one has left it.
        match outcome {
            Ok(Ok(Ok(hocr))) => {
                if self.jobs.complete(self.job_id, hocr) {
                    info!("Job completed");
                }
            }
            Ok(Ok(Err(EngineError::Unavailable(reason)))) => {
                self.record_failure(JobErrorKind::MidFlightUnavailable, reason);
            }
            Ok(Ok(Err(EngineError::Failed(err)))) => {
                self.record_failure(JobErrorKind::EngineCrash, format!("{err:#}"));
            }
            Ok(Err(join_err)) => {
                self.record_failure(
                    JobErrorKind::EngineCrash,
                    format!("engine task failed: {join_err}"),
                );
            }
            Err(_elapsed) => {
                // Aborting drops the engine future, which kills any child
                // process.
                abort.abort();
                self.record_failure(
                    JobErrorKind::ExecutionTimeout,
                    format!(
                        "engine did not finish within the {:?} job budget; for long documents, submit asynchronously and poll for the result",
                        self.budget
                    ),
                );
            }
        }
        drop(slot);
    }

    /// Get whatever the job needs to start. `Some(None)` means no GPU slot is
    /// needed. Returns `None` if the job ended while waiting.
    async fn admit(
        &self,
        admission: Option<Admission>,
        status_rx: &mut watch::Receiver<JobStatus>,
    ) -> Option<Option<AdmissionSlot>> {
        let mut ticket = match admission {
            None => return Some(None),
            Some(Admission::Granted(slot)) => return Some(Some(slot)),
            Some(Admission::Queued { ticket, .. }) => ticket,
        };

        // A slot that arrives after the deadline is no use to us, so check the
        // deadline first.
        tokio::select! {
            biased;

            _ = wait_until_finished(status_rx) => {
                debug!("Job finished while queued");
                None
            }
            _ = sleep_until(self.deadline) => {
                self.queue.cancel_if_waiting_too_long(self.job_id, self.deadline);
                // If a slot reached us just now, dropping the ticket passes it
                // on.
                drop(ticket);
                self.record_queue_timeout();
                None
            }
            slot = ticket.wait() => match slot {
                // If we were cancelled meanwhile, dropping the slot passes it
                // on.
                Some(slot) if self.jobs.mark_admitted(self.job_id) => {
                    debug!("Admitted from queue");
                    Some(Some(slot))
                }
                Some(_) => None,
                None => {
                    self.record_queue_timeout();
                    None
                }
            },
        }
    }

    fn record_queue_timeout(&self) {
        self.record_failure(
            JobErrorKind::QueueTimeout,
            format!(
                "no GPU slot became free within the {:?} job budget; try again later, or submit asynchronously and poll for the result",
                self.budget
            ),
        );
    }

    fn record_failure(&self, kind: JobErrorKind, message: String) {
        warn!(%kind, "Job failed: {message}");
        self.jobs.fail(self.job_id, kind, message);
    }
}

/// Resolve once the job reaches a terminal state, or disappears.
async fn wait_until_finished(status_rx: &mut watch::Receiver<JobStatus>) {
    // Drop the borrowed status at once; holding it blocks status updates.
    status_rx.wait_for(|status| status.is_terminal()).await.ok();
}
