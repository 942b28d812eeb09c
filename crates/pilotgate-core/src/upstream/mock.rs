//! Scripted transport for testing

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::{UpstreamError, UpstreamResult};
use super::traits::{LineStream, Upstream, UpstreamRequest};

/// One canned reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// SSE data payloads, delivered in order
    Stream(Vec<String>),
    /// A JSON body for one-shot calls
    Json(Value),
    /// A non-success status with a raw body
    Reject { status: u16, body: String },
}

impl ScriptedReply {
    pub fn stream<I, S>(payloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedReply::Stream(payloads.into_iter().map(Into::into).collect())
    }

    pub fn reject(status: u16, body: impl Into<String>) -> Self {
        ScriptedReply::Reject {
            status,
            body: body.into(),
        }
    }
}

/// A recorded outbound request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub request: UpstreamRequest,
}

#[derive(Default)]
struct ScriptState {
    replies: HashMap<String, VecDeque<ScriptedReply>>,
    requests: Vec<RecordedRequest>,
}

/// Transport that replays scripted replies keyed by URL suffix.
///
/// Replies for a suffix are consumed in order; the last one repeats.
/// A request with no matching script is rejected with 404.
#[derive(Default)]
pub struct ScriptedUpstream {
    state: Mutex<ScriptState>,
    chunk_delay: Option<Duration>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between streamed payloads
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Queue a reply for requests whose URL ends with `suffix`
    pub fn push(&self, suffix: impl Into<String>, reply: ScriptedReply) -> &Self {
        self.state.lock().replies.entry(suffix.into()).or_default().push_back(reply);
        self
    }

    /// All requests seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests whose URL ends with `suffix`
    pub fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .cloned()
            .collect()
    }

    fn next_reply(&self, request: &UpstreamRequest) -> UpstreamResult<ScriptedReply> {
        let mut state = self.state.lock();
        state.requests.push(RecordedRequest {
            url: request.url.clone(),
            request: request.clone(),
        });

        // Longest matching suffix wins
        let key = state
            .replies
            .keys()
            .filter(|suffix| request.url.ends_with(suffix.as_str()))
            .max_by_key(|suffix| suffix.len())
            .cloned();
        let Some(queue) = key.and_then(|k| state.replies.get_mut(&k)) else {
            return Err(UpstreamError::rejected(404, format!("no script for {}", request.url)));
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.ok_or_else(|| UpstreamError::rejected(404, format!("no script for {}", request.url)))
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn call(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<Value> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        match self.next_reply(&request)? {
            ScriptedReply::Json(value) => Ok(value),
            ScriptedReply::Reject { status, body } => Err(UpstreamError::rejected(status, body)),
            ScriptedReply::Stream(_) => Err(UpstreamError::Stream("scripted stream used for a call".into())),
        }
    }

    async fn stream(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<LineStream> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        let payloads = match self.next_reply(&request)? {
            ScriptedReply::Stream(payloads) => payloads,
            ScriptedReply::Reject { status, body } => return Err(UpstreamError::rejected(status, body)),
            ScriptedReply::Json(_) => return Err(UpstreamError::Stream("scripted JSON used for a stream".into())),
        };

        let delay = self.chunk_delay;
        let cancel = cancel.clone();
        let stream = futures::stream::unfold(payloads.into_iter(), move |mut iter| {
            let cancel = cancel.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
                if cancel.is_cancelled() {
                    return None;
                }
                iter.next().map(|payload| (Ok(payload), iter))
            }
        });
        Ok(Box::pin(stream))
    }
}
