pub mod error;
pub mod job;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use error::{ClientError, Result};
pub use job::{JobHandle, JobProgress, JobState, PollSchedule, RemoteStatus, ResearchJob};
pub use transport::{HttpTransport, ResearchTransport, DEFAULT_AGENT, DEFAULT_BASE_URL};
pub use types::{RawResult, TokenUsage};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Default wall-clock budget for one job.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Submission attempts before a transport error is surfaced.
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive transport failures tolerated while polling. The remote job keeps
/// running regardless of our connectivity.
const MAX_POLL_TRANSPORT_ERRORS: u32 = 3;

pub struct ResearchClient {
    transport: Arc<dyn ResearchTransport>,
    schedule: PollSchedule,
    timeout: Duration,
}

impl ResearchClient {
    pub fn new(api_key: String) -> Self {
        Self::with_transport(Arc::new(HttpTransport::new(api_key)))
    }

    pub fn with_transport(transport: Arc<dyn ResearchTransport>) -> Self {
        Self {
            transport,
            schedule: PollSchedule::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit a research query. Returns as soon as the agent has queued it.
    ///
    /// Transport errors are retried with exponential backoff; a rejection or a
    /// response without a job id is final.
    pub async fn start_research(
        &self,
        query: &str,
        output_schema: Option<&serde_json::Value>,
    ) -> Result<JobHandle> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.submit(query, output_schema).await {
                Ok(interaction) => {
                    let handle = JobHandle::parse(interaction.id.as_deref().unwrap_or_default())?;
                    info!(job = %handle, "Research job started");
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() && attempt < SUBMIT_ATTEMPTS => {
                    let delay = SUBMIT_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Research submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll a job until it reaches a terminal state or the budget runs out.
    ///
    /// Suspends only the calling task between polls. `on_tick` runs before every
    /// sleep, which is where callers keep other long-lived resources warm.
    pub async fn poll_research<F, Fut>(&self, handle: &JobHandle, mut on_tick: F) -> Result<RawResult>
    where
        F: FnMut(JobProgress) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut job = ResearchJob::started(handle.clone());
        let mut interval = self.schedule.initial;
        let mut transport_failures = 0u32;

        loop {
            let elapsed = job.elapsed();
            if elapsed >= self.timeout {
                job.transition(JobState::TimedOut);
                warn!(
                    job = %handle,
                    elapsed_secs = elapsed.as_secs(),
                    polls = job.progress().polls,
                    "Research job timed out"
                );
                return Err(ClientError::Timeout {
                    elapsed_secs: elapsed.as_secs(),
                    budget_secs: self.timeout.as_secs(),
                });
            }

            match self.transport.fetch(handle).await {
                Ok(interaction) => {
                    transport_failures = 0;
                    job.record_poll();

                    let status = RemoteStatus::parse(interaction.status.as_deref().unwrap_or(""));
                    job.transition(status.job_state());
                    match status {
                        RemoteStatus::Completed => {
                            let result = RawResult::from_interaction(handle.clone(), &interaction);
                            info!(
                                job = %handle,
                                elapsed_secs = job.elapsed().as_secs(),
                                total_tokens = result.usage.total_tokens,
                                "Research job completed"
                            );
                            return Ok(result);
                        }
                        RemoteStatus::Failed | RemoteStatus::Cancelled => {
                            let cause = interaction.error_message();
                            warn!(job = %handle, status = ?status, cause = %cause, "Research job failed");
                            return Err(ClientError::RemoteFailed(cause));
                        }
                        RemoteStatus::Unknown(ref raw) => {
                            warn!(job = %handle, status = %raw, "Unknown research status, treating as in progress");
                        }
                        RemoteStatus::Pending | RemoteStatus::InProgress => {
                            debug!(
                                job = %handle,
                                status = ?status,
                                elapsed_secs = job.elapsed().as_secs(),
                                "Research job still running"
                            );
                        }
                    }
                }
                Err(e) if e.is_retryable() && transport_failures < MAX_POLL_TRANSPORT_ERRORS => {
                    transport_failures += 1;
                    warn!(job = %handle, transport_failures, error = %e, "Poll failed, will retry");
                }
                Err(e) => {
                    job.transition(JobState::Failed);
                    return Err(e);
                }
            }

            on_tick(job.progress()).await;

            let remaining = self.timeout.saturating_sub(job.elapsed());
            tokio::time::sleep(interval.min(remaining)).await;
            interval = self.schedule.next(interval);
        }
    }
}
