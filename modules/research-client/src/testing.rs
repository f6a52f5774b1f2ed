// Scripted research agent for tests. No network.
//
// Submissions are answered from `route()` matches first (query substring →
// job id), then from the `submit_*` queue. Polls are answered from the
// per-handle script, then the shared script, then the sticky `poll_forever`
// response.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ClientError, Result};
use crate::job::JobHandle;
use crate::transport::ResearchTransport;
use crate::types::Interaction;

/// One scripted poll response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(String),
    Completed { text: String, tokens: u64 },
    Failed(String),
    Error(ClientError),
}

impl Scripted {
    pub fn status(s: &str) -> Self {
        Scripted::Status(s.to_string())
    }

    pub fn completed(text: &str) -> Self {
        Scripted::Completed {
            text: text.to_string(),
            tokens: 0,
        }
    }

    pub fn completed_with_tokens(text: &str, tokens: u64) -> Self {
        Scripted::Completed {
            text: text.to_string(),
            tokens,
        }
    }

    pub fn failed(cause: &str) -> Self {
        Scripted::Failed(cause.to_string())
    }

    fn into_response(self, handle: &JobHandle) -> Result<Interaction> {
        let json = match self {
            Scripted::Error(e) => return Err(e),
            Scripted::Status(s) => serde_json::json!({ "id": handle.as_str(), "status": s }),
            Scripted::Completed { text, tokens } => serde_json::json!({
                "id": handle.as_str(),
                "status": "completed",
                "output": { "parts": [{ "text": text }] },
                "usage": {
                    "inputTokenCount": tokens / 2,
                    "outputTokenCount": tokens - tokens / 2,
                    "totalTokenCount": tokens
                }
            }),
            Scripted::Failed(cause) => serde_json::json!({
                "id": handle.as_str(),
                "status": "failed",
                "error": { "message": cause }
            }),
        };
        Ok(serde_json::from_value(json)?)
    }
}

#[derive(Default)]
pub struct MockTransport {
    routes: Vec<(String, String)>,
    submits: Mutex<VecDeque<Result<String>>>,
    handle_polls: Mutex<HashMap<String, VecDeque<Scripted>>>,
    shared_polls: Mutex<VecDeque<Scripted>>,
    sticky_poll: Option<Scripted>,
    submissions: Mutex<Vec<String>>,
    poll_count: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any query containing `pattern` is accepted as job `id`.
    pub fn route(mut self, pattern: &str, id: &str) -> Self {
        self.routes.push((pattern.to_string(), id.to_string()));
        self
    }

    pub fn submit_ok(self, id: &str) -> Self {
        self.lock_submits().push_back(Ok(id.to_string()));
        self
    }

    pub fn submit_err(self, err: ClientError) -> Self {
        self.lock_submits().push_back(Err(err));
        self
    }

    pub fn poll(self, response: Scripted) -> Self {
        lock(&self.shared_polls).push_back(response);
        self
    }

    pub fn poll_for(self, id: &str, response: Scripted) -> Self {
        lock(&self.handle_polls)
            .entry(id.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn poll_forever(mut self, response: Scripted) -> Self {
        self.sticky_poll = Some(response);
        self
    }

    /// Every query text submitted so far, in order.
    pub fn submissions(&self) -> Vec<String> {
        lock(&self.submissions).clone()
    }

    pub fn polls(&self) -> u32 {
        self.poll_count.load(Ordering::SeqCst)
    }

    fn lock_submits(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        lock(&self.submits)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ResearchTransport for MockTransport {
    async fn submit(
        &self,
        query: &str,
        _output_schema: Option<&serde_json::Value>,
    ) -> Result<Interaction> {
        lock(&self.submissions).push(query.to_string());

        let routed = self
            .routes
            .iter()
            .find(|(pattern, _)| query.contains(pattern.as_str()))
            .map(|(_, id)| Ok(id.clone()));
        let next = routed.or_else(|| self.lock_submits().pop_front());

        match next {
            Some(Ok(id)) => Ok(serde_json::from_value(
                serde_json::json!({ "id": id, "status": "in_progress" }),
            )?),
            Some(Err(e)) => Err(e),
            None => Err(ClientError::SubmissionRejected {
                status: 500,
                message: "mock: no scripted submission".to_string(),
            }),
        }
    }

    async fn fetch(&self, handle: &JobHandle) -> Result<Interaction> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);

        let scripted = lock(&self.handle_polls)
            .get_mut(handle.as_str())
            .and_then(|q| q.pop_front())
            .or_else(|| lock(&self.shared_polls).pop_front())
            .or_else(|| self.sticky_poll.clone());

        match scripted {
            Some(s) => s.into_response(handle),
            None => Err(ClientError::RemoteFailed(format!(
                "mock: no scripted poll for {handle}"
            ))),
        }
    }
}
