//! Job records and their lifecycle.
//!
//! Every job moves along one path:
//!
//! ```text
//! Pending -> Admitted -> Processing -> Completed
//!    |          |            |
//!    +----------+------------+------> Failed | TimedOut
//! ```
//!
//! Each job has its own lock, so transitions on one job never wait on another.
//! The map lock is only held long enough to insert, look up, or remove an
//! entry. Once a job is terminal, the only thing that can happen to it is
//! expiry.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    error::{AwaitError, JobErrorKind, JobLookupError, ResultError},
    params::EngineConfig,
    prelude::*,
};

/// A unique, non-guessable job identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s).with_context(|| format!("invalid job ID {s:?}"))?;
        Ok(Self(uuid))
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for admission.
    Pending,
    /// Holds whatever it needs to run.
    Admitted,
    /// The engine is running.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Ran out of time, either in the queue or in the engine.
    TimedOut,
}

impl JobStatus {
    /// Is this a final state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Is `next` a legal successor of `self`?
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Admitted) | (Admitted, Processing) | (Processing, Completed) => {
                true
            }
            (Pending | Admitted | Processing, Failed | TimedOut) => true,
            _ => false,
        }
    }

    /// Snake-case name, as used in serialized records.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Admitted => "admitted",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error recorded on a failed job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

/// The full record for one job.
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub engine: String,
    pub config: EngineConfig,
    pub gpu: bool,
    pub input_path: PathBuf,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Only set once `completed_at` is set.
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<Arc<str>>,
    pub error: Option<JobError>,
}

impl JobRecord {
    /// Has this record outlived its retention window?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// A serializable snapshot of this record, without the result body.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            engine: self.engine.clone(),
            gpu: self.gpu,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            error_kind: self.error.as_ref().map(|e| e.kind),
            error_message: self.error.as_ref().map(|e| e.message.clone()),
            has_result: self.result.is_some(),
        }
    }
}

/// What status polling returns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub engine: String,
    pub gpu: bool,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<JobErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub has_result: bool,
}

/// Everything needed to create a job.
pub struct NewJob {
    pub engine: String,
    pub config: EngineConfig,
    pub gpu: bool,
    pub input_path: PathBuf,
}

/// One job, plus a channel that announces its status changes.
struct JobEntry {
    record: Mutex<JobRecord>,
    status_tx: watch::Sender<JobStatus>,
}

impl JobEntry {
    /// Apply a compare-and-set transition. Returns `false` (and leaves the
    /// record alone) if `next` is not a legal successor of the current status.
    fn transition(&self, next: JobStatus, update: impl FnOnce(&mut JobRecord)) -> bool {
        let mut record = self.record.lock().expect("lock poisoned");
        let current = record.status;
        if current.is_terminal() {
            warn!(
                job_id = %record.id,
                %current,
                %next,
                "Ignoring transition on a job that has already finished"
            );
            return false;
        }
        if !current.can_transition_to(next) {
            warn!(
                job_id = %record.id,
                %current,
                %next,
                "Ignoring out-of-order job transition"
            );
            return false;
        }
        record.status = next;
        update(&mut record);
        debug!(job_id = %record.id, from = %current, to = %next, "Job transition");
        // Publish while still holding the lock, so watchers see transitions in
        // the order they were applied.
        self.status_tx.send_replace(next);
        true
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.record.lock().expect("lock poisoned").is_expired(now)
    }

    fn snapshot(&self) -> JobRecord {
        self.record.lock().expect("lock poisoned").clone()
    }
}

/// In-memory store of all live jobs.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    retention: TimeDelta,
}

impl JobStore {
    /// Create a store that keeps finished jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Create a new job in [`JobStatus::Pending`].
    pub fn create(&self, new_job: NewJob) -> JobId {
        let id = JobId::new();
        let record = JobRecord {
            id,
            engine: new_job.engine,
            config: new_job.config,
            gpu: new_job.gpu,
            input_path: new_job.input_path,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
            result: None,
            error: None,
        };
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        let entry = Arc::new(JobEntry {
            record: Mutex::new(record),
            status_tx,
        });
        self.jobs
            .write()
            .expect("lock poisoned")
            .insert(id, entry);
        id
    }

    /// Move a job to [`JobStatus::Admitted`].
    pub fn mark_admitted(&self, id: JobId) -> bool {
        self.with_entry(id, |entry| entry.transition(JobStatus::Admitted, |_| {}))
    }

    /// Move a job to [`JobStatus::Processing`] and stamp `started_at`.
    pub fn mark_processing(&self, id: JobId) -> bool {
        self.with_entry(id, |entry| {
            entry.transition(JobStatus::Processing, |record| {
                record.started_at = Some(Utc::now());
            })
        })
    }

    /// Record a successful result.
    pub fn complete(&self, id: JobId, result: String) -> bool {
        let retention = self.retention;
        self.with_entry(id, |entry| {
            entry.transition(JobStatus::Completed, |record| {
                stamp_completion(record, retention);
                record.result = Some(Arc::from(result));
            })
        })
    }

    /// Record a failure. The terminal status is chosen by `kind`.
    pub fn fail(&self, id: JobId, kind: JobErrorKind, message: impl Into<String>) -> bool {
        let retention = self.retention;
        let message = message.into();
        self.with_entry(id, |entry| {
            entry.transition(kind.terminal_status(), |record| {
                stamp_completion(record, retention);
                record.error = Some(JobError { kind, message });
            })
        })
    }

    /// Look up a job's current state.
    pub fn view(&self, id: JobId) -> Result<JobView, JobLookupError> {
        self.view_at(id, Utc::now())
    }

    /// Look up a job's state as of `now`.
    pub fn view_at(&self, id: JobId, now: DateTime<Utc>) -> Result<JobView, JobLookupError> {
        Ok(self.live_entry(id, now)?.snapshot().view())
    }

    /// Fetch a finished job's standardized output.
    pub fn result(&self, id: JobId) -> Result<Arc<str>, ResultError> {
        self.result_at(id, Utc::now())
    }

    /// Fetch a finished job's standardized output as of `now`.
    pub fn result_at(&self, id: JobId, now: DateTime<Utc>) -> Result<Arc<str>, ResultError> {
        let record = self.live_entry(id, now)?.snapshot();
        match (record.status, record.result, record.error) {
            (JobStatus::Completed, Some(result), _) => Ok(result),
            (_, _, Some(JobError { kind, message })) => Err(ResultError::JobFailed {
                job_id: id,
                kind,
                message,
            }),
            (status, _, _) => Err(ResultError::NotReady { job_id: id, status }),
        }
    }

    /// Subscribe to a job's status changes.
    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<JobStatus>, JobLookupError> {
        Ok(self.live_entry(id, Utc::now())?.status_tx.subscribe())
    }

    /// Wait until a job reaches a terminal state, or `timeout` elapses.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<JobView, AwaitError> {
        // Hold the entry itself, so the sender outlives our wait even if the
        // job is purged meanwhile.
        let entry = self.live_entry(id, Utc::now())?;
        let mut rx = entry.status_tx.subscribe();
        // Drop the borrowed status before leaving this block.
        let waited = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal()))
            .await
            .map(|res| res.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(entry.snapshot().view()),
            Ok(Err(_)) => Err(JobLookupError::NotFound(id).into()),
            Err(_) => Err(AwaitError::StillRunning {
                job_id: id,
                waited: timeout,
            }),
        }
    }

    /// Remove every job whose retention window has passed. Returns how many
    /// were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().expect("lock poisoned");
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.is_expired(now));
        before - jobs.len()
    }

    /// How many jobs are currently stored?
    pub fn len(&self) -> usize {
        self.jobs.read().expect("lock poisoned").len()
    }

    /// Are there no stored jobs?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find an entry, treating expired entries as gone (and removing them).
    fn live_entry(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Arc<JobEntry>, JobLookupError> {
        let entry = self
            .jobs
            .read()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(JobLookupError::NotFound(id))?;
        if entry.is_expired(now) {
            self.jobs.write().expect("lock poisoned").remove(&id);
            return Err(JobLookupError::Expired(id));
        }
        Ok(entry)
    }

    /// Run `f` against an entry, if it exists. Missing jobs count as a failed
    /// transition.
    fn with_entry(&self, id: JobId, f: impl FnOnce(&JobEntry) -> bool) -> bool {
        let entry = self.jobs.read().expect("lock poisoned").get(&id).cloned();
        match entry {
            Some(entry) => f(&entry),
            None => {
                warn!(job_id = %id, "Ignoring transition on unknown job");
                false
            }
        }
    }
}

fn stamp_completion(record: &mut JobRecord, retention: TimeDelta) {
    let now = Utc::now();
    record.completed_at = Some(now);
    record.expires_at = Some(
        now.checked_add_signed(retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::tesseract::TesseractConfig;

    fn new_job() -> NewJob {
        NewJob {
            engine: "tesseract".to_owned(),
            config: EngineConfig::Tesseract(TesseractConfig::default()),
            gpu: false,
            input_path: PathBuf::from("page.png"),
        }
    }

    #[test]
    fn test_legal_path_to_completion() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        assert!(store.mark_admitted(id));
        assert!(store.mark_processing(id));
        assert!(store.complete(id, "<html/>".to_owned()));

        let view = store.view(id).unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.started_at.is_some());
        assert!(view.completed_at.is_some());
        assert!(view.expires_at.unwrap() > view.completed_at.unwrap());
        assert_eq!(&*store.result(id).unwrap(), "<html/>");
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        store.mark_admitted(id);
        store.mark_processing(id);
        assert!(store.fail(id, JobErrorKind::ExecutionTimeout, "too slow"));

        // A late completion must not resurrect the job.
        assert!(!store.complete(id, "late".to_owned()));
        assert!(!store.fail(id, JobErrorKind::EngineCrash, "late crash"));

        let view = store.view(id).unwrap();
        assert_eq!(view.status, JobStatus::TimedOut);
        assert_eq!(view.error_kind, Some(JobErrorKind::ExecutionTimeout));
        assert!(!view.has_result);
    }

    #[test]
    fn test_out_of_order_transitions_are_ignored() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        assert!(!store.mark_processing(id), "must be admitted first");
        assert!(!store.complete(id, "early".to_owned()));
        assert!(store.mark_admitted(id));
        assert!(!store.mark_admitted(id));
        assert_eq!(store.view(id).unwrap().status, JobStatus::Admitted);
    }

    #[test]
    fn test_queue_timeout_skips_processing() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        assert!(store.fail(id, JobErrorKind::QueueTimeout, "no slot"));
        let view = store.view(id).unwrap();
        assert_eq!(view.status, JobStatus::TimedOut);
        assert!(view.started_at.is_none());
    }

    #[test]
    fn test_result_errors() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        assert!(matches!(
            store.result(id),
            Err(ResultError::NotReady {
                status: JobStatus::Pending,
                ..
            })
        ));

        store.fail(id, JobErrorKind::Cancelled, "client went away");
        assert!(matches!(
            store.result(id),
            Err(ResultError::JobFailed {
                kind: JobErrorKind::Cancelled,
                ..
            })
        ));

        let missing = JobId::new();
        assert_eq!(
            store.result(missing),
            Err(ResultError::Lookup(JobLookupError::NotFound(missing)))
        );
    }

    #[test]
    fn test_expired_jobs_are_unreachable() {
        let store = JobStore::new(Duration::from_secs(60));
        let id = store.create(new_job());
        store.mark_admitted(id);
        store.mark_processing(id);
        store.complete(id, "text".to_owned());
        let expires_at = store.view(id).unwrap().expires_at.unwrap();

        // Still visible right up to the instant of expiry.
        let just_before = expires_at - TimeDelta::milliseconds(1);
        assert!(store.view_at(id, just_before).is_ok());
        assert!(store.result_at(id, just_before).is_ok());

        assert_eq!(
            store.result_at(id, expires_at),
            Err(ResultError::Lookup(JobLookupError::Expired(id)))
        );
        // Once noticed, the record is gone for good.
        assert_eq!(
            store.view_at(id, expires_at),
            Err(JobLookupError::NotFound(id))
        );
    }

    #[test]
    fn test_purge_expired_keeps_running_jobs() {
        let store = JobStore::new(Duration::from_secs(1));
        let running = store.create(new_job());
        let done = store.create(new_job());
        store.fail(done, JobErrorKind::EngineCrash, "boom");

        let later = Utc::now() + TimeDelta::seconds(5);
        assert_eq!(store.purge_expired(later), 1);
        assert_eq!(store.len(), 1);
        assert!(store.view(running).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let store = Arc::new(JobStore::new(Duration::from_secs(60)));
        let id = store.create(new_job());

        let err = store
            .wait_for_terminal(id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AwaitError::StillRunning { .. }));
        assert!(err.to_string().contains("poll"));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store.wait_for_terminal(id, Duration::from_secs(10)).await
            })
        };
        store.mark_admitted(id);
        store.mark_processing(id);
        store.complete(id, "done".to_owned());
        let view = waiter.await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[test]
    fn test_job_ids_round_trip_through_strings() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
