//! Producer/consumer streaming shared by chat and terminal.
//!
//! A [`Producer`] runs on its own task and pushes text chunks into a bounded
//! channel. The consumer side is a [`MultiplexedStream`] bound to exactly one
//! HTTP response. When the response is dropped the channel closes and the
//! producer future is dropped with it, which is how cancellation reaches the
//! upstream request or child process.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use console_gateway_error::{GatewayError, ProblemDetails};

use crate::config::DEFAULT_STREAM_BUFFER;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    End(StreamEnd),
}

/// Terminal event of a stream. Exactly one is delivered per stream.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Completed { exit_code: Option<i32> },
    Truncated { limit_bytes: usize },
    Failed(GatewayError),
}

impl StreamEnd {
    pub fn status(&self) -> &'static str {
        match self {
            StreamEnd::Completed { .. } => "completed",
            StreamEnd::Truncated { .. } => "truncated",
            StreamEnd::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<GatewayError> {
        match self {
            StreamEnd::Completed { .. } => None,
            StreamEnd::Truncated { limit_bytes } => Some(GatewayError::OutputTruncated {
                limit_bytes: *limit_bytes,
            }),
            StreamEnd::Failed(err) => Some(err.clone()),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StreamEnd::Completed { exit_code } => *exit_code,
            _ => None,
        }
    }

    pub fn payload(&self) -> EndPayload {
        EndPayload {
            status: self.status(),
            exit_code: self.exit_code(),
            error: self.error().map(|err| err.to_problem_details()),
        }
    }
}

/// JSON body of the `end` server-sent event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
}

/// JSON body of a `chunk` server-sent event.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPayload<'a> {
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, Error)]
#[error("stream consumer disconnected")]
pub struct StreamClosed;

/// Write half handed to a producer.
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSink {
    /// Waits for channel capacity, then enqueues one chunk. Empty chunks are
    /// skipped.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), StreamClosed> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        self.tx
            .send(StreamEvent::Chunk(text))
            .await
            .map_err(|_| StreamClosed)
    }
}

pub type ProducerFuture = Pin<Box<dyn Future<Output = StreamEnd> + Send>>;

/// A finite source of text chunks.
pub trait Producer: Send + 'static {
    fn run(self: Box<Self>, sink: StreamSink) -> ProducerFuture;
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct Multiplexer {
    buffer: usize,
    active: Arc<AtomicUsize>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

impl Multiplexer {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of producers currently running.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn spawn(&self, producer: Box<dyn Producer>) -> MultiplexedStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let guard = ActiveGuard::new(self.active.clone());
        let sink = StreamSink { tx: tx.clone() };

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                end = producer.run(sink) => {
                    tracing::debug!(status = end.status(), "stream producer finished");
                    let _ = tx.send(StreamEvent::End(end)).await;
                }
                _ = tx.closed() => {
                    tracing::debug!("stream consumer disconnected, producer cancelled");
                }
            }
        });

        MultiplexedStream {
            rx,
            finished: false,
        }
    }
}

/// Read half bound to one client connection.
#[derive(Debug)]
pub struct MultiplexedStream {
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

/// Whole output of a stream, for endpoints that reply with one JSON body.
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub output: String,
    pub end: StreamEnd,
}

impl MultiplexedStream {
    pub async fn collect_output(mut self) -> CollectedOutput {
        use futures::StreamExt;

        let mut output = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Chunk(text) => output.push_str(&text),
                StreamEvent::End(end) => return CollectedOutput { output, end },
            }
        }
        CollectedOutput {
            output,
            end: StreamEnd::Failed(vanished()),
        }
    }
}

impl Stream for MultiplexedStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, StreamEvent::End(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(StreamEvent::End(StreamEnd::Failed(vanished()))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn vanished() -> GatewayError {
    GatewayError::StreamError {
        message: "producer ended without a terminal event".to_string(),
    }
}
