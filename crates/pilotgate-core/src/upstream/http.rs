//! reqwest-backed transport

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::{UpstreamError, UpstreamResult};
use super::sse::{data_payload, SseLineBuffer};
use super::traits::{Authorization, HttpMethod, LineStream, RequestBody, Upstream, UpstreamRequest};

/// HTTP transport used for every outbound call: completions, model catalog,
/// token exchange and device flow.
pub struct HttpUpstream {
    client: reqwest::Client,
    default_headers: Vec<(String, String)>,
}

impl HttpUpstream {
    /// Create a transport whose requests time out after `timeout`
    /// (covering the whole streamed body, so keep it long).
    pub fn new(timeout: Duration) -> UpstreamResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            default_headers: Vec::new(),
        })
    }

    /// Headers added to every request (editor/version identification etc.)
    pub fn with_default_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.default_headers = headers;
        self
    }

    fn build(&self, request: &UpstreamRequest, accept: &str) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        builder = builder.header("Accept", accept);
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.auth {
            Some(Authorization::Bearer(token)) => builder.bearer_auth(token),
            Some(Authorization::Token(token)) => builder.header("Authorization", format!("token {}", token)),
            None => builder,
        };
        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        }
    }

    async fn send(
        &self,
        request: &UpstreamRequest,
        accept: &str,
        cancel: &CancellationToken,
    ) -> UpstreamResult<reqwest::Response> {
        tracing::debug!("upstream {:?} {}", request.method, request.url);
        let response = tokio::select! {
            result = self.build(request, accept).send() => result?,
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("upstream {} returned {}", request.url, status);
            return Err(UpstreamError::rejected(status.as_u16(), body));
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<Value> {
        let response = self.send(&request, "application/json", cancel).await?;
        let text = tokio::select! {
            text = response.text() => text?,
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
        };
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn stream(&self, request: UpstreamRequest, cancel: &CancellationToken) -> UpstreamResult<LineStream> {
        let response = self.send(&request, "text/event-stream", cancel).await?;
        let bytes = response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(Box::pin(payload_stream(bytes).take_until(cancel.clone().cancelled_owned())))
    }
}

struct PayloadState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: SseLineBuffer,
    ready: VecDeque<String>,
    finished: bool,
}

fn payload_stream(
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
) -> impl futures::Stream<Item = UpstreamResult<String>> + Send {
    let state = PayloadState {
        bytes,
        buffer: SseLineBuffer::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(payload) = st.ready.pop_front() {
                return Some((Ok(payload), st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = st.buffer.push(&chunk);
                    st.ready.extend(lines.iter().filter_map(|l| data_payload(l)).map(str::to_string));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(UpstreamError::Http(e)), st));
                }
                None => {
                    st.finished = true;
                    let lines = st.buffer.finish();
                    st.ready.extend(lines.iter().filter_map(|l| data_payload(l)).map(str::to_string));
                }
            }
        }
    })
}
