//! Session recording hooks.
//!
//! A [`SessionRecorder`] receives a copy of everything a run produces so it
//! can be stored for reporting. Recorder failures are logged and never
//! affect the run.

use crate::error::ErrorInfo;
use crate::types::Insight;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Upper bound on a single recorder call.
const RECORDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStart {
    pub request_id: Uuid,
    pub idea: String,
    pub stage_count: usize,
    pub started_at: DateTime<Utc>,
}

/// One stage execution, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub request_id: Uuid,
    pub stage_id: u32,
    pub name: String,
    pub persona: String,
    /// Rendered user prompt.
    pub input: String,
    pub output: String,
    pub model: String,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub request_id: Uuid,
    pub status: SessionStatus,
    pub total_duration_ms: u64,
    pub failed_stage: Option<u32>,
    pub error: Option<String>,
}

/// Storage for run history.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn start_session(&self, session: &SessionStart) -> anyhow::Result<()>;

    async fn save_step_output(&self, record: &StepRecord) -> anyhow::Result<()>;

    async fn save_insight(&self, request_id: Uuid, insight: &Insight) -> anyhow::Result<()>;

    async fn finish_session(&self, summary: &SessionSummary) -> anyhow::Result<()>;
}

/// Records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl SessionRecorder for NoopRecorder {
    async fn start_session(&self, _session: &SessionStart) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_step_output(&self, _record: &StepRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_insight(&self, _request_id: Uuid, _insight: &Insight) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finish_session(&self, _summary: &SessionSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every record in memory. Useful in tests and demos.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    sessions: Mutex<Vec<SessionStart>>,
    steps: Mutex<Vec<StepRecord>>,
    insights: Mutex<Vec<(Uuid, Insight)>>,
    summaries: Mutex<Vec<SessionSummary>>,
}

fn snapshot<T: Clone>(m: &Mutex<Vec<T>>) -> Vec<T> {
    m.lock().map(|v| v.clone()).unwrap_or_default()
}

fn push<T>(m: &Mutex<Vec<T>>, item: T) -> anyhow::Result<()> {
    m.lock()
        .map_err(|_| anyhow::anyhow!("recorder lock poisoned"))?
        .push(item);
    Ok(())
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<SessionStart> {
        snapshot(&self.sessions)
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        snapshot(&self.steps)
    }

    pub fn insights(&self) -> Vec<(Uuid, Insight)> {
        snapshot(&self.insights)
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        snapshot(&self.summaries)
    }
}

#[async_trait]
impl SessionRecorder for MemoryRecorder {
    async fn start_session(&self, session: &SessionStart) -> anyhow::Result<()> {
        push(&self.sessions, session.clone())
    }

    async fn save_step_output(&self, record: &StepRecord) -> anyhow::Result<()> {
        push(&self.steps, record.clone())
    }

    async fn save_insight(&self, request_id: Uuid, insight: &Insight) -> anyhow::Result<()> {
        push(&self.insights, (request_id, insight.clone()))
    }

    async fn finish_session(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        push(&self.summaries, summary.clone())
    }
}

/// Await a recorder call, logging failure or timeout instead of returning it.
pub(crate) async fn best_effort<F>(what: &'static str, request_id: Uuid, call: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(RECORDER_TIMEOUT, call).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%request_id, error = %e, "session recorder failed to {}", what),
        Err(_) => warn!(%request_id, "session recorder timed out trying to {}", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenRecorder;

    #[async_trait]
    impl SessionRecorder for BrokenRecorder {
        async fn start_session(&self, _: &SessionStart) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
        async fn save_step_output(&self, _: &StepRecord) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
        async fn save_insight(&self, _: Uuid, _: &Insight) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
        async fn finish_session(&self, _: &SessionSummary) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    #[tokio::test]
    async fn test_memory_recorder_keeps_records() {
        let recorder = MemoryRecorder::new();
        let id = Uuid::new_v4();
        let insight = Insight {
            stage_id: 2,
            text: "The problem is real.".into(),
            label: Some("problem".into()),
        };
        recorder.save_insight(id, &insight).await.unwrap();
        recorder
            .finish_session(&SessionSummary {
                request_id: id,
                status: SessionStatus::Completed,
                total_duration_ms: 5,
                failed_stage: None,
                error: None,
            })
            .await
            .unwrap();

        assert_eq!(recorder.insights(), vec![(id, insight)]);
        assert_eq!(recorder.summaries()[0].status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let recorder = BrokenRecorder;
        let start = SessionStart {
            request_id: Uuid::nil(),
            idea: "idea".into(),
            stage_count: 10,
            started_at: Utc::now(),
        };
        best_effort("start session", Uuid::nil(), recorder.start_session(&start)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_times_out() {
        best_effort("hang", Uuid::nil(), std::future::pending()).await;
    }
}
