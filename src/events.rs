//! Progress reporting.
//!
//! The orchestrator reports [`ProgressEvent`]s to a [`ProgressSink`]. The
//! sink decides transport: [`progress_channel`] gives an MPSC queue whose
//! producer never blocks, [`FnSink`] wraps a closure. Every emit goes through
//! [`Reporter`], which logs and drops events the sink refuses so a slow or
//! vanished consumer never fails a run.

use crate::error::ErrorInfo;
use crate::registry::StageRegistry;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle phase of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stage changed phase.
    Status {
        stage_id: u32,
        stage_name: String,
        phase: Phase,
        message: String,
        progress_pct: u8,
        /// Size of the stage output, on `Completed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_chars: Option<usize>,
        /// Cause of failure, on `Error`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    /// Free-form diagnostic line.
    Log { level: LogLevel, message: String },
    /// Liveness signal while a long provider call is in flight.
    Heartbeat {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_id: Option<u32>,
    },
    /// A one-sentence takeaway extracted after a stage completed.
    Insight {
        stage_id: u32,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl ProgressEvent {
    pub fn stage_id(&self) -> Option<u32> {
        match self {
            ProgressEvent::Status { stage_id, .. } | ProgressEvent::Insight { stage_id, .. } => {
                Some(*stage_id)
            }
            ProgressEvent::Heartbeat { stage_id, .. } => *stage_id,
            ProgressEvent::Log { .. } => None,
        }
    }

    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Status {
                phase: Phase::Error,
                ..
            }
        )
    }
}

/// Why a sink refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("progress consumer has gone away")]
    Closed,
    #[error("progress queue is full")]
    Full,
}

/// Destination for progress events.
///
/// Implementations must not block: return [`SinkError::Full`] instead.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::events::{ProgressEvent, ProgressSink, SinkError};
///
/// struct PrintSink;
///
/// impl ProgressSink for PrintSink {
///     fn send(&self, event: ProgressEvent) -> Result<(), SinkError> {
///         if let ProgressEvent::Status { stage_id, message, .. } = event {
///             println!("[{stage_id}] {message}");
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait ProgressSink: Send + Sync {
    fn send(&self, event: ProgressEvent) -> Result<(), SinkError>;
}

/// A [`ProgressSink`] backed by a closure.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::events::{FnSink, ProgressEvent};
/// use std::sync::Arc;
///
/// let sink = Arc::new(FnSink(|event: ProgressEvent| {
///     println!("{:?}", event);
/// }));
/// ```
pub struct FnSink<F: Fn(ProgressEvent) + Send + Sync>(pub F);

impl<F: Fn(ProgressEvent) + Send + Sync> ProgressSink for FnSink<F> {
    fn send(&self, event: ProgressEvent) -> Result<(), SinkError> {
        (self.0)(event);
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn send(&self, _event: ProgressEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Producer half of [`progress_channel`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
    fn send(&self, event: ProgressEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Outcome of [`ProgressReceiver::recv_timeout`].
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Event(ProgressEvent),
    /// Nothing arrived within the timeout; the producer is still alive.
    Idle,
    /// Every producer has been dropped and the queue is drained.
    Closed,
}

/// Consumer half of [`progress_channel`].
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Wait up to `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Received::Event(event),
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ProgressReceiver {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Bounded progress queue. Pushes never wait; overflow is dropped and logged.
pub fn progress_channel(capacity: usize) -> (ChannelSink, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx }, ProgressReceiver { rx })
}

/// The only path from the pipeline to a [`ProgressSink`].
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ProgressSink>,
    request_id: Uuid,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    pub fn new(sink: Arc<dyn ProgressSink>, request_id: Uuid) -> Self {
        Self { sink, request_id }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Deliver `event`. Refusals are logged, never returned.
    pub fn emit(&self, event: ProgressEvent) {
        match self.sink.send(event) {
            Ok(()) => {}
            Err(SinkError::Closed) => {
                debug!(request_id = %self.request_id, "progress consumer closed; event dropped")
            }
            Err(SinkError::Full) => {
                warn!(request_id = %self.request_id, "progress queue full; event dropped")
            }
        }
    }

    pub fn status(
        &self,
        stage_id: u32,
        stage_name: &str,
        phase: Phase,
        message: impl Into<String>,
        progress_pct: u8,
    ) {
        self.emit(ProgressEvent::Status {
            stage_id,
            stage_name: stage_name.to_string(),
            phase,
            message: message.into(),
            progress_pct,
            output_chars: None,
            error: None,
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(ProgressEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn heartbeat(&self, stage_id: Option<u32>) {
        self.emit(ProgressEvent::Heartbeat {
            timestamp: Utc::now(),
            stage_id,
        });
    }
}

/// Consumer-side hang detection.
///
/// Any event resets the clock. A stage counts as stalled once nothing has
/// arrived for longer than its provider timeout plus `grace`, so heavier
/// stages are given more time.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    thresholds: Vec<Duration>,
    fallback: Duration,
    current_stage: Option<u32>,
    last_event: Instant,
}

impl StallMonitor {
    pub fn new(registry: &StageRegistry, default_timeout: Duration, grace: Duration) -> Self {
        let thresholds = registry
            .stages()
            .iter()
            .map(|s| s.timeout.unwrap_or(default_timeout) + grace)
            .collect();
        Self {
            thresholds,
            fallback: default_timeout + grace,
            current_stage: None,
            last_event: Instant::now(),
        }
    }

    pub fn observe(&mut self, event: &ProgressEvent) {
        if let Some(id) = event.stage_id() {
            self.current_stage = Some(id);
        }
        self.last_event = Instant::now();
    }

    /// Silence allowed for the stage currently running.
    pub fn threshold(&self) -> Duration {
        self.current_stage
            .and_then(|id| id.checked_sub(1))
            .and_then(|idx| self.thresholds.get(idx as usize).copied())
            .unwrap_or(self.fallback)
    }

    pub fn silent_for(&self) -> Duration {
        self.last_event.elapsed()
    }

    pub fn is_stalled(&self) -> bool {
        self.silent_for() > self.threshold()
    }
}

/// Frame an event for a `text/event-stream` response.
pub fn sse_frame(event: &ProgressEvent) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// SSE comment line that keeps idle HTTP connections open.
pub const SSE_KEEPALIVE: &str = ": keepalive\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    fn log(message: &str) -> ProgressEvent {
        ProgressEvent::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    #[test]
    fn test_status_serializes_tagged() {
        let event = ProgressEvent::Status {
            stage_id: 2,
            stage_name: "Problem Validation Research".into(),
            phase: Phase::Completed,
            message: "done".into(),
            progress_pct: 20,
            output_chars: Some(1200),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["phase"], "completed");
        assert_eq!(json["output_chars"], 1200);
        assert!(json.get("error").is_none());

        let back: ProgressEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_sse_frame() {
        let frame = sse_frame(&log("hi")).unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains("\"type\":\"log\""));
    }

    #[test]
    fn test_fn_sink_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let reporter = Reporter::new(
            Arc::new(FnSink(move |e: ProgressEvent| sink_seen.lock().unwrap().push(e))),
            Uuid::nil(),
        );
        reporter.log(LogLevel::Info, "one");
        reporter.heartbeat(Some(3));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].stage_id(), Some(3));
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (sink, mut rx) = progress_channel(1);
        let reporter = Reporter::new(Arc::new(sink), Uuid::nil());
        reporter.emit(log("kept"));
        reporter.emit(log("dropped"));
        assert_eq!(rx.try_recv(), Some(log("kept")));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_channel_is_ignored() {
        let (sink, rx) = progress_channel(4);
        drop(rx);
        assert_eq!(sink.send(log("x")), Err(SinkError::Closed));
        Reporter::new(Arc::new(sink), Uuid::nil()).emit(log("still fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_reports_idle_then_closed() {
        let (sink, mut rx) = progress_channel(4);
        assert_eq!(rx.recv_timeout(Duration::from_secs(60)).await, Received::Idle);
        sink.send(log("a")).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(60)).await,
            Received::Event(log("a"))
        );
        drop(sink);
        assert_eq!(rx.recv_timeout(Duration::from_secs(60)).await, Received::Closed);
    }

    #[tokio::test]
    async fn test_receiver_is_a_stream() {
        let (sink, rx) = progress_channel(4);
        sink.send(log("a")).unwrap();
        sink.send(log("b")).unwrap();
        drop(sink);
        let all: Vec<ProgressEvent> = rx.collect().await;
        assert_eq!(all, vec![log("a"), log("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_monitor_uses_stage_timeout() {
        let registry = StageRegistry::working_backwards().unwrap();
        let mut monitor = StallMonitor::new(&registry, Duration::from_secs(180), Duration::from_secs(30));
        monitor.observe(&ProgressEvent::Heartbeat {
            timestamp: Utc::now(),
            stage_id: Some(1),
        });
        assert_eq!(monitor.threshold(), Duration::from_secs(150));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(!monitor.is_stalled());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(monitor.is_stalled());

        monitor.observe(&ProgressEvent::Heartbeat {
            timestamp: Utc::now(),
            stage_id: Some(9),
        });
        assert!(!monitor.is_stalled());
        assert_eq!(monitor.threshold(), Duration::from_secs(330));
    }
}
