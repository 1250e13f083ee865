//! Job tracking for asynchronous management operations.
//!
//! Every mutating method on the service answers with a return code and,
//! when the work continues in the background, the path of a job object.
//! [`JobTracker`] turns that pair into a single awaited outcome:
//!
//! - return code 0: the method already finished, nothing is fetched
//! - return code 4096: the job is polled until it leaves the
//!   new/starting/running states, with capped exponential backoff
//! - anything else: the method failed outright
//!
//! Polling has no deadline of its own. [`JobTracker::await_job_with_deadline`]
//! (or a tracker built with [`JobTracker::with_deadline`]) bounds it.
//! Dropping the future stops polling but does not cancel the remote job.

use crate::config::PollConfig;
use crate::constants::{RETURN_COMPLETED, RETURN_JOB_STARTED};
use crate::error::{Error, JobFailure, Result, ResultExt};
use crate::location::resolve_location;
use halyard_wmi::{OutParams, Resource, Session};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// `JobState` of a job object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    New,
    Starting,
    Running,
    Suspended,
    ShuttingDown,
    Completed,
    Terminated,
    Killed,
    Exception,
    Service,
    Other(u16),
}

impl JobState {
    pub fn code(&self) -> u16 {
        match self {
            JobState::New => 2,
            JobState::Starting => 3,
            JobState::Running => 4,
            JobState::Suspended => 5,
            JobState::ShuttingDown => 6,
            JobState::Completed => 7,
            JobState::Terminated => 8,
            JobState::Killed => 9,
            JobState::Exception => 10,
            JobState::Service => 11,
            JobState::Other(code) => *code,
        }
    }

    /// The job has not reached a terminal state yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::New | JobState::Starting | JobState::Running)
    }
}

impl From<u16> for JobState {
    fn from(code: u16) -> Self {
        match code {
            2 => JobState::New,
            3 => JobState::Starting,
            4 => JobState::Running,
            5 => JobState::Suspended,
            6 => JobState::ShuttingDown,
            7 => JobState::Completed,
            8 => JobState::Terminated,
            9 => JobState::Killed,
            10 => JobState::Exception,
            11 => JobState::Service,
            other => JobState::Other(other),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::New => write!(f, "new"),
            JobState::Starting => write!(f, "starting"),
            JobState::Running => write!(f, "running"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::ShuttingDown => write!(f, "shutting down"),
            JobState::Completed => write!(f, "completed"),
            JobState::Terminated => write!(f, "terminated"),
            JobState::Killed => write!(f, "killed"),
            JobState::Exception => write!(f, "exception"),
            JobState::Service => write!(f, "service"),
            JobState::Other(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// Awaits jobs spawned on one session.
#[derive(Debug, Clone)]
pub struct JobTracker {
    session: Session,
    poll: PollConfig,
    deadline: Option<Duration>,
}

impl JobTracker {
    pub fn new(session: Session, poll: PollConfig) -> Self {
        Self {
            session,
            poll,
            deadline: None,
        }
    }

    /// Bound every wait made through [`complete`](Self::complete).
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Await the outcome of a method call from its out-parameters
    /// (`ReturnValue` and, when a job was started, `Job`).
    pub async fn complete(&self, out: &OutParams) -> Result<()> {
        let return_code = out.return_value().context("reading ReturnValue")?;
        let job = out
            .get_opt("Job")
            .map(|v| v.as_str().map(str::to_string))
            .transpose()
            .context("reading Job")?;

        match self.deadline {
            Some(deadline) => {
                self.await_job_with_deadline(return_code, job.as_deref(), deadline)
                    .await
            }
            None => self.await_job(return_code, job.as_deref()).await,
        }
    }

    /// Await a job given the method's initial return code.
    ///
    /// No polling happens for an already-completed call, so `job_path` is
    /// not even resolved in that case.
    pub async fn await_job(&self, return_code: u32, job_path: Option<&str>) -> Result<()> {
        match return_code {
            RETURN_COMPLETED => {
                tracing::trace!("Method completed synchronously");
                Ok(())
            }
            RETURN_JOB_STARTED => {
                let path = job_path.ok_or_else(|| {
                    Error::InconsistentResource(
                        "method reported a started job but returned no job path".into(),
                    )
                })?;
                self.poll_job(path).await
            }
            code => Err(Error::JobFailed {
                job: job_path.unwrap_or("<none>").to_string(),
                reason: JobFailure::ReturnCode(code),
            }),
        }
    }

    /// [`await_job`](Self::await_job) bounded by `deadline`.
    pub async fn await_job_with_deadline(
        &self,
        return_code: u32,
        job_path: Option<&str>,
        deadline: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(deadline, self.await_job(return_code, job_path)).await {
            Ok(result) => result,
            Err(_) => {
                let job = job_path.unwrap_or("<none>").to_string();
                tracing::warn!(
                    job = %job,
                    timeout_ms = deadline.as_millis() as u64,
                    "Job wait timed out"
                );
                Err(Error::JobTimeout {
                    job,
                    timeout: deadline,
                })
            }
        }
    }

    async fn poll_job(&self, path: &str) -> Result<()> {
        let start = Instant::now();
        let job = resolve_location(&self.session, path)
            .await
            .context("resolving job")?;

        let mut interval = self.poll.initial_interval;
        let mut polls = 0u32;
        loop {
            polls += 1;
            let state = JobState::from(
                job.get("JobState")
                    .await
                    .and_then(|v| v.as_u16())
                    .context("reading JobState")?,
            );
            tracing::trace!(job = %path, %state, polls, "Polled job");

            if state.is_pending() {
                tokio::time::sleep(interval).await;
                interval = self.poll.next_interval(interval);
                continue;
            }

            if state == JobState::Completed {
                tracing::debug!(
                    job = %path,
                    polls,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                return Ok(());
            }

            let reason = failure_reason(&job, state).await;
            tracing::warn!(job = %path, %state, %reason, "Job failed");
            return Err(Error::JobFailed {
                job: path.to_string(),
                reason,
            });
        }
    }
}

/// Prefer the job's own description, then its error code.
async fn failure_reason(job: &Resource, state: JobState) -> JobFailure {
    if let Ok(value) = job.get("ErrorDescription").await {
        if let Ok(text) = value.as_str() {
            if !text.trim().is_empty() {
                return JobFailure::Description(text.to_string());
            }
        }
    }
    let error_code = match job.get("ErrorCode").await {
        Ok(value) => value.as_u32().ok(),
        Err(_) => None,
    };
    JobFailure::State { state, error_code }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_wmi::memory::{MemoryBackend, MEMORY_NAMESPACE};
    use halyard_wmi::{ObjectPath, Value};

    async fn tracker(backend: &MemoryBackend) -> JobTracker {
        let session = Session::open(backend, ".", MEMORY_NAMESPACE).await.unwrap();
        JobTracker::new(session, PollConfig::default())
    }

    #[test]
    fn test_job_state_codes() {
        for code in 2..=11u16 {
            assert_eq!(JobState::from(code).code(), code);
        }
        assert_eq!(JobState::from(42), JobState::Other(42));
        assert!(JobState::Running.is_pending());
        assert!(JobState::New.is_pending());
        assert!(!JobState::Completed.is_pending());
        assert!(!JobState::Exception.is_pending());
    }

    #[tokio::test]
    async fn test_completed_return_code_skips_polling() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend).await;
        // The job does not exist: any attempt to poll would fail.
        let ghost = ObjectPath::new("Msvm_ConcreteJob").with_key("InstanceID", "ghost");

        tracker
            .await_job(RETURN_COMPLETED, Some(&ghost.to_string()))
            .await
            .unwrap();
        tracker.await_job(RETURN_COMPLETED, None).await.unwrap();
        assert_eq!(backend.reads(&ghost, "JobState"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_job_polls_until_completed() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| ns.add_job([3, 4, 4, 4, 7]));
        let tracker = tracker(&backend).await;

        tracker
            .await_job(RETURN_JOB_STARTED, Some(&job.to_string()))
            .await
            .unwrap();
        assert_eq!(backend.reads(&job, "JobState"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_states_are_errors() {
        for code in [5u16, 6, 8, 9, 10, 11, 99] {
            let backend = MemoryBackend::new();
            let job = backend.with_namespace(|ns| ns.add_job([4, code]));
            let tracker = tracker(&backend).await;

            let err = tracker
                .await_job(RETURN_JOB_STARTED, Some(&job.to_string()))
                .await
                .unwrap_err();
            match err {
                Error::JobFailed {
                    reason: JobFailure::State { state, .. },
                    ..
                } => assert_eq!(state.code(), code),
                other => panic!("unexpected error for state {code}: {other}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_prefers_error_description() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| {
            let job = ns.add_job([4, 10]);
            ns.set_property(&job, "ErrorDescription", "Insufficient system resources")
                .unwrap();
            ns.set_property(&job, "ErrorCode", Value::UInt16(32778))
                .unwrap();
            job
        });
        let tracker = tracker(&backend).await;

        let err = tracker
            .await_job(RETURN_JOB_STARTED, Some(&job.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::JobFailed { reason: JobFailure::Description(ref d), .. }
                if d == "Insufficient system resources"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_error_code() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| {
            let job = ns.add_job([9]);
            ns.set_property(&job, "ErrorCode", Value::UInt16(32768)).unwrap();
            job
        });
        let tracker = tracker(&backend).await;

        let err = tracker
            .await_job(RETURN_JOB_STARTED, Some(&job.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::JobFailed {
                reason: JobFailure::State {
                    state: JobState::Killed,
                    error_code: Some(32768)
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unexpected_return_code_fails_without_polling() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| ns.add_job([7]));
        let tracker = tracker(&backend).await;

        let err = tracker
            .await_job(32773, Some(&job.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::JobFailed {
                reason: JobFailure::ReturnCode(32773),
                ..
            }
        ));
        assert_eq!(backend.reads(&job, "JobState"), 0);
    }

    #[tokio::test]
    async fn test_started_without_job_path_is_inconsistent() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend).await;
        let err = tracker.await_job(RETURN_JOB_STARTED, None).await.unwrap_err();
        assert!(err.is_inconsistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_a_job_that_never_finishes() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| ns.add_job([4]));
        let tracker = tracker(&backend).await;

        let err = tracker
            .await_job_with_deadline(
                RETURN_JOB_STARTED,
                Some(&job.to_string()),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobTimeout { timeout, .. } if timeout == Duration::from_secs(5)));
        // 50 + 100 + 200 + 400 + 800 ms, then one poll per second.
        let polls = backend.reads(&job, "JobState");
        assert!((6..=10).contains(&polls), "unexpected poll count {polls}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_reads_out_params() {
        let backend = MemoryBackend::new();
        let job = backend.with_namespace(|ns| ns.add_job([4, 7]));
        let tracker = tracker(&backend).await;

        let out = OutParams::new()
            .with("ReturnValue", RETURN_JOB_STARTED)
            .with("Job", job.to_string());
        tracker.complete(&out).await.unwrap();

        let missing = OutParams::new();
        let err = tracker.complete(&missing).await.unwrap_err();
        assert!(matches!(err.root(), Error::Transport(_)));
    }
}
