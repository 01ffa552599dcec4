//! Pass-through observer for NDJSON response streams
//!
//! [`ObservedStream`] yields the backend's chunks unchanged and as soon as
//! they arrive. Alongside, [`StreamObserver`] splits the bytes into lines,
//! parses them, and calls its finalizer exactly once: at end of stream, on a
//! stream error, or when the body is dropped early (client disconnect).

use super::extract::{TerminalStats, is_done, response_text};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Cap on buffered, not yet newline-terminated bytes
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Cap on accumulated response text
pub const MAX_RESPONSE_TEXT_BYTES: usize = 1024 * 1024;

/// What was observed over the lifetime of one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub duration: Duration,
    pub response_text: String,
    pub time_to_first_token: Option<Duration>,
    /// Counters from the `done: true` line, if one arrived
    pub terminal: Option<TerminalStats>,
    pub error: Option<String>,
    /// End of stream reached (as opposed to dropped or failed)
    pub reached_eof: bool,
    pub bytes: u64,
}

impl StreamSummary {
    pub fn completed(&self) -> bool {
        self.terminal.is_some()
    }
}

type Finalizer = Box<dyn FnOnce(StreamSummary) + Send>;

/// Line-splitting parser plus the one-shot finalizer
pub struct StreamObserver {
    started: Instant,
    pending: Vec<u8>,
    /// Set when a line outgrew [`MAX_PENDING_BYTES`]; cleared at the next newline
    discarding: bool,
    response_text: String,
    time_to_first_token: Option<Duration>,
    terminal: Option<TerminalStats>,
    error: Option<String>,
    bytes: u64,
    finalizer: Option<Finalizer>,
}

impl StreamObserver {
    /// `started` is the request start; TTFT is measured from it
    pub fn new<F>(started: Instant, finalizer: F) -> Self
    where
        F: FnOnce(StreamSummary) + Send + 'static,
    {
        Self {
            started,
            pending: Vec::new(),
            discarding: false,
            response_text: String::new(),
            time_to_first_token: None,
            terminal: None,
            error: None,
            bytes: 0,
            finalizer: Some(Box::new(finalizer)),
        }
    }

    /// Feed a chunk exactly as it was delivered to the client
    pub fn observe_chunk(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            if self.discarding {
                self.discarding = false;
            } else if self.pending.is_empty() {
                self.parse_line(head);
            } else {
                self.pending.extend_from_slice(head);
                let line = std::mem::take(&mut self.pending);
                self.parse_line(&line);
            }
            rest = &tail[1..];
        }

        if rest.is_empty() || self.discarding {
            return;
        }
        if self.pending.len() + rest.len() > MAX_PENDING_BYTES {
            tracing::debug!(
                pending = self.pending.len(),
                chunk = rest.len(),
                "Stream line exceeds buffer cap, skipping it"
            );
            self.pending.clear();
            self.discarding = true;
        } else {
            self.pending.extend_from_slice(rest);
        }
    }

    fn parse_line(&mut self, line: &[u8]) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        let Ok(value) = serde_json::from_slice::<Value>(line) else {
            return;
        };

        if let Some(text) = response_text(&value).filter(|t| !t.is_empty()) {
            if self.time_to_first_token.is_none() {
                self.time_to_first_token = Some(self.started.elapsed());
            }
            if self.response_text.len() + text.len() <= MAX_RESPONSE_TEXT_BYTES {
                self.response_text.push_str(text);
            }
        }

        if is_done(&value) {
            self.terminal = Some(TerminalStats::from_value(&value));
        }
    }

    /// Record a stream error; the message ends up in the analytics record
    pub fn fail(&mut self, error: impl Display) {
        self.error.get_or_insert_with(|| error.to_string());
        self.finish(false);
    }

    /// Run the finalizer if it has not run yet
    pub fn finish(&mut self, reached_eof: bool) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };

        if !self.discarding && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.parse_line(&line);
        }

        finalizer(StreamSummary {
            duration: self.started.elapsed(),
            response_text: std::mem::take(&mut self.response_text),
            time_to_first_token: self.time_to_first_token,
            terminal: self.terminal,
            error: self.error.clone(),
            reached_eof,
            bytes: self.bytes,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.finalizer.is_none()
    }
}

impl Drop for StreamObserver {
    fn drop(&mut self) {
        if self.finalizer.is_some() {
            tracing::debug!(bytes = self.bytes, "Stream closed before end of stream");
        }
        self.finish(false);
    }
}

pin_project! {
    /// Stream wrapper that observes every chunk on its way to the client
    pub struct ObservedStream<S> {
        #[pin]
        inner: S,
        observer: StreamObserver,
    }
}

impl<S> ObservedStream<S> {
    pub fn new(inner: S, observer: StreamObserver) -> Self {
        Self { inner, observer }
    }
}

impl<S, E> Stream for ObservedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.observer.observe_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.observer.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.observer.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
