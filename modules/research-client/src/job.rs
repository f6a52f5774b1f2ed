// Research job lifecycle: handle validation, remote status mapping, and the
// local state machine the poller drives.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// Opaque id of a job on the research agent. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ClientError::InvalidHandle(
                "submission response carried an empty `id`".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status string reported by the agent, matched exactly against a closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// Anything else. Treated as still running.
    Unknown(String),
}

impl RemoteStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => RemoteStatus::Pending,
            "in_progress" => RemoteStatus::InProgress,
            "completed" => RemoteStatus::Completed,
            "failed" => RemoteStatus::Failed,
            "cancelled" => RemoteStatus::Cancelled,
            other => RemoteStatus::Unknown(other.to_string()),
        }
    }

    /// The local state this status moves a job into.
    pub fn job_state(&self) -> JobState {
        match self {
            RemoteStatus::Completed => JobState::Completed,
            RemoteStatus::Failed | RemoteStatus::Cancelled => JobState::Failed,
            RemoteStatus::Pending | RemoteStatus::InProgress | RemoteStatus::Unknown(_) => {
                JobState::InProgress
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Started,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (NotStarted, Started) => true,
            (Started | InProgress, InProgress | Completed | Failed | TimedOut) => true,
            _ => false,
        }
    }
}

/// Snapshot handed to the poller's tick callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub state: JobState,
    pub polls: u32,
    pub elapsed: Duration,
}

/// One in-flight remote job. Lives only as long as the poll loop.
#[derive(Debug, Clone)]
pub struct ResearchJob {
    handle: JobHandle,
    state: JobState,
    started_at: Instant,
    last_poll_at: Option<Instant>,
    polls: u32,
}

impl ResearchJob {
    pub fn started(handle: JobHandle) -> Self {
        let mut job = Self {
            handle,
            state: JobState::NotStarted,
            started_at: Instant::now(),
            last_poll_at: None,
            polls: 0,
        };
        job.transition(JobState::Started);
        job
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_poll_at(&self) -> Option<Instant> {
        self.last_poll_at
    }

    pub fn record_poll(&mut self) {
        self.polls += 1;
        self.last_poll_at = Some(Instant::now());
    }

    /// Move to `next`. Invalid transitions (anything out of a terminal state)
    /// are ignored and logged.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                job = %self.handle,
                from = ?self.state,
                to = ?next,
                "Ignoring invalid research job transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            state: self.state,
            polls: self.polls,
            elapsed: self.elapsed(),
        }
    }
}

/// Poll interval growth: starts at `initial`, grows by `step` after each poll,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            step: Duration::from_secs(5),
            max: Duration::from_secs(30),
        }
    }
}

impl PollSchedule {
    pub fn next(&self, current: Duration) -> Duration {
        (current + self.step).min(self.max)
    }
}
