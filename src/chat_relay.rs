//! Streams chat completions from the provider to the client fragment by
//! fragment.
//!
//! Each request gets its own relay task. Fragments travel through a small
//! bounded channel; the response body owns the receiving end, so when the
//! client goes away the channel closes and the task drops the upstream
//! connection.

use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::history::SharedHistoryStore;
use crate::io_struct::{ChatCompletionChunk, ChatCompletionRequest, ChatTurn, Role};

pub const SYSTEM_PREAMBLE: &str =
    "You are a playful cat-girl assistant. You love to end your sentences with \"meow\".";

const FRAGMENT_CHANNEL_SIZE: usize = 16;

/// Connection settings for the OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct ChatProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
    timeout: Duration,
}

/// How a relay ended when no error occurred.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The provider finished; carries the assembled reply.
    Completed(String),
    /// The client stopped listening before the provider finished.
    Disconnected,
}

impl ChatProvider {
    pub fn new(client: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.chat_base_url.trim_end_matches('/')
            ),
            model: config.chat_model.clone(),
            temperature: config.chat_temperature,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: config.chat_timeout(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens one streaming completion for `history` and forwards each content
    /// delta into `tx` as soon as it is decoded.
    pub async fn stream_reply(
        &self,
        history: &[ChatTurn],
        tx: &mpsc::Sender<String>,
    ) -> Result<RelayOutcome> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(RelayError::ProviderUnconfigured)?;

        let messages = with_preamble(history);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
            stream: true,
        };
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send();

        let resp = tokio::select! {
            _ = tx.closed() => return Ok(RelayOutcome::Disconnected),
            resp = tokio::time::timeout(self.timeout, request) => resp,
        };
        let resp = resp
            .map_err(|_| RelayError::UpstreamTimeout {
                url: self.endpoint.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| RelayError::from_reqwest(&self.endpoint, self.timeout, e))?;

        let status = resp.status();
        if !status.is_success() {
            // the error body read shares the chat deadline
            let detail = tokio::select! {
                _ = tx.closed() => return Ok(RelayOutcome::Disconnected),
                body = tokio::time::timeout(self.timeout, resp.text()) => match body {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => format!("<unreadable body: {}>", e),
                    Err(_) => format!("<body not received within {}s>", self.timeout.as_secs()),
                },
            };
            return Err(RelayError::unavailable(
                &self.endpoint,
                format!("status {}: {}", status, detail.trim()),
            ));
        }

        let mut upstream = resp.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut reply = String::new();

        loop {
            let next = tokio::select! {
                _ = tx.closed() => return Ok(RelayOutcome::Disconnected),
                next = tokio::time::timeout(self.timeout, upstream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(RelayError::StreamInterrupted(format!(
                        "no data from provider for {}s",
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(RelayError::StreamInterrupted(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            match forward(decoder.push(&chunk), &mut reply, tx).await? {
                Flow::Continue => {}
                Flow::Done => return Ok(RelayOutcome::Completed(reply)),
                Flow::Disconnected => return Ok(RelayOutcome::Disconnected),
            }
        }

        match forward(decoder.finish(), &mut reply, tx).await? {
            Flow::Disconnected => Ok(RelayOutcome::Disconnected),
            Flow::Continue | Flow::Done => Ok(RelayOutcome::Completed(reply)),
        }
    }
}

/// Starts a relay task for one `/chat` request and returns the fragment
/// stream that feeds the response body.
pub fn relay_chat(
    provider: ChatProvider,
    store: SharedHistoryStore,
    history: Vec<ChatTurn>,
) -> ReceiverStream<String> {
    let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_SIZE);
    tokio::spawn(run_relay(provider, store, history, tx));
    ReceiverStream::new(rx)
}

async fn run_relay(
    provider: ChatProvider,
    store: SharedHistoryStore,
    history: Vec<ChatTurn>,
    tx: mpsc::Sender<String>,
) {
    let last_turn = history
        .last()
        .filter(|t| t.role != Role::System)
        .cloned();

    match provider.stream_reply(&history, &tx).await {
        Ok(RelayOutcome::Completed(reply)) => {
            // end the client's body before touching the store
            drop(tx);
            persist_exchange(&store, last_turn, &reply).await;
        }
        Ok(RelayOutcome::Disconnected) => {
            log::info!("chat client disconnected, upstream released");
        }
        Err(e) => {
            log::warn!("chat relay failed: {}", e);
            let _ = tx.send(diagnostic_fragment(&e)).await;
        }
    }
}

async fn persist_exchange(store: &SharedHistoryStore, last_turn: Option<ChatTurn>, reply: &str) {
    if let Some(turn) = last_turn {
        if let Err(e) = store.append(turn.role.clone(), &turn.content).await {
            log::warn!("failed to persist {} turn: {}", turn.role, e);
        }
    }
    if !reply.is_empty() {
        if let Err(e) = store.append(Role::Assistant, reply).await {
            log::warn!("failed to persist assistant reply: {}", e);
        }
    }
}

pub fn diagnostic_fragment(err: &RelayError) -> String {
    match err {
        RelayError::ProviderUnconfigured => {
            "Error: the backend has no chat API key configured".to_string()
        }
        other => format!("Something went wrong, meow: {}", other),
    }
}

fn with_preamble(history: &[ChatTurn]) -> Vec<ChatTurn> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatTurn::new(Role::System, SYSTEM_PREAMBLE));
    messages.extend_from_slice(history);
    messages
}

enum Flow {
    Continue,
    Done,
    Disconnected,
}

async fn forward(
    events: Vec<SseEvent>,
    reply: &mut String,
    tx: &mpsc::Sender<String>,
) -> Result<Flow> {
    for event in events {
        let data = match event {
            SseEvent::Done => return Ok(Flow::Done),
            SseEvent::Data(data) => data,
        };
        let Some(text) = parse_delta(&data)? else {
            continue;
        };
        reply.push_str(&text);
        if tx.send(text).await.is_err() {
            return Ok(Flow::Disconnected);
        }
    }
    Ok(Flow::Continue)
}

fn parse_delta(data: &str) -> Result<Option<String>> {
    let mut chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            log::debug!("skipping unparseable stream frame: {}", e);
            return Ok(None);
        }
    };
    if let Some(err) = chunk.error.take() {
        return Err(RelayError::StreamInterrupted(err.to_string()));
    }
    Ok(chunk.delta_text())
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Incremental server-sent-events framer. Bytes are buffered only until a
/// frame is complete, so multi-byte characters split across network chunks
/// decode correctly.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&frame[..end]) {
                events.push(event);
            }
        }
        events
    }

    fn finish(mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest).into_iter().collect()
    }
}

fn parse_frame(frame: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(frame);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    let data = data.join("\n");
    if data.trim() == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data))
    }
}
