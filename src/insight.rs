//! Background insight extraction.
//!
//! After a stage completes, [`InsightExtractor::spawn`] asks a cheap model for
//! a one-sentence takeaway and reports it as a
//! [`ProgressEvent::Insight`](crate::events::ProgressEvent::Insight). The run
//! never waits for it, and failures only reach the log.

use crate::events::{ProgressEvent, Reporter};
use crate::hooks::{best_effort, SessionRecorder};
use crate::parsing;
use crate::prompt;
use crate::provider::{InvokeOptions, Provider};
use crate::templates as t;
use crate::types::Insight;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Characters of stage output sent to the insight model.
const SUMMARY_INPUT_CHARS: usize = 4000;
const COMPARE_INPUT_CHARS: usize = 3000;

/// Longest insight kept; anything longer is cut at a word boundary.
const MAX_INSIGHT_CHARS: usize = 280;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsightSource {
    Summary { output: String },
    Compare { before: String, after: String },
}

/// Everything needed to extract one insight.
#[derive(Debug, Clone)]
pub struct InsightJob {
    pub request_id: Uuid,
    pub stage_id: u32,
    pub stage_name: String,
    pub label: Option<String>,
    pub source: InsightSource,
}

impl InsightJob {
    fn prompt(&self) -> Option<String> {
        let mut vars = BTreeMap::new();
        vars.insert("stage_name".to_string(), self.stage_name.clone());
        let template = match &self.source {
            InsightSource::Summary { output } => {
                vars.insert("output".into(), parsing::excerpt(output, SUMMARY_INPUT_CHARS));
                t::INSIGHT_SUMMARY
            }
            InsightSource::Compare { before, after } => {
                vars.insert("before".into(), parsing::excerpt(before, COMPARE_INPUT_CHARS));
                vars.insert("after".into(), parsing::excerpt(after, COMPARE_INPUT_CHARS));
                t::INSIGHT_COMPARE
            }
        };
        prompt::render(template, &vars).ok()
    }
}

/// Spawns and tracks insight tasks.
///
/// Concurrency is capped by a semaphore. Tasks live in a [`JoinSet`] so a
/// server can [`drain`](Self::drain) them on graceful shutdown or
/// [`shutdown`](Self::shutdown) to abort them.
pub struct InsightExtractor {
    provider: Arc<Provider>,
    timeout: Duration,
    limit: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for InsightExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightExtractor")
            .field("model", &self.provider.model())
            .field("timeout", &self.timeout)
            .field("pending", &self.pending())
            .finish()
    }
}

impl InsightExtractor {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self {
            provider,
            timeout: DEFAULT_TIMEOUT,
            limit: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Per-attempt timeout for insight calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.limit = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Extract an insight inline. `None` on any failure.
    pub async fn extract(&self, job: &InsightJob) -> Option<Insight> {
        extract_with(&self.provider, self.timeout, job).await
    }

    /// Extract in the background, then record and report the result.
    pub fn spawn(&self, job: InsightJob, reporter: Reporter, recorder: Arc<dyn SessionRecorder>) {
        let provider = self.provider.clone();
        let limit = self.limit.clone();
        let timeout = self.timeout;

        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(stage_id = job.stage_id, "insight task set poisoned; skipping insight");
            return;
        };
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return;
            };
            let Some(insight) = extract_with(&provider, timeout, &job).await else {
                return;
            };
            best_effort(
                "save insight",
                job.request_id,
                recorder.save_insight(job.request_id, &insight),
            )
            .await;
            reporter.emit(ProgressEvent::Insight {
                stage_id: insight.stage_id,
                text: insight.text,
                label: insight.label,
            });
        });
    }

    /// Tasks spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait up to `timeout` for outstanding tasks, then abort the rest.
    /// Returns `true` when every task finished on its own.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return false,
        };
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            debug!(remaining = tasks.len(), "aborting unfinished insight tasks");
            tasks.shutdown().await;
        }
        drained
    }

    /// Abort every outstanding task.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
    }
}

async fn extract_with(provider: &Provider, timeout: Duration, job: &InsightJob) -> Option<Insight> {
    let user = job.prompt()?;
    let result = provider
        .invoke(
            t::INSIGHT_SYSTEM,
            &user,
            InvokeOptions {
                timeout: Some(timeout),
                ..Default::default()
            },
        )
        .await;

    match result {
        Ok(completion) => {
            let text = clean_insight(&completion.text)?;
            debug!(request_id = %job.request_id, stage_id = job.stage_id, insight = %text, "insight extracted");
            Some(Insight {
                stage_id: job.stage_id,
                text,
                label: job.label.clone(),
            })
        }
        Err(e) => {
            warn!(
                request_id = %job.request_id,
                stage_id = job.stage_id,
                error = %e,
                "insight extraction failed"
            );
            None
        }
    }
}

/// First non-empty line, unquoted and bounded.
fn clean_insight(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(['-', '*', ' '])
        .trim_matches(|c: char| c == '"' || c == '\u{201c}' || c == '\u{201d}')
        .trim();
    if line.is_empty() {
        return None;
    }
    if line.chars().count() <= MAX_INSIGHT_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(MAX_INSIGHT_CHARS).collect();
    let cut = match cut.rfind(' ') {
        Some(idx) => &cut[..idx],
        None => cut.as_str(),
    };
    Some(format!("{}...", cut.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackoffConfig, MockBackend, MockReply};
    use crate::events::progress_channel;
    use crate::hooks::MemoryRecorder;
    use crate::stage::ProviderKind;

    fn extractor(mock: Arc<MockBackend>) -> InsightExtractor {
        let provider = Provider::builder(ProviderKind::Chat, "http://unused")
            .backend(mock)
            .backoff(BackoffConfig::none())
            .build()
            .unwrap();
        InsightExtractor::new(Arc::new(provider))
    }

    fn summary_job(output: &str) -> InsightJob {
        InsightJob {
            request_id: Uuid::nil(),
            stage_id: 2,
            stage_name: "Problem Validation Research".into(),
            label: Some("problem".into()),
            source: InsightSource::Summary {
                output: output.into(),
            },
        }
    }

    #[test]
    fn test_clean_insight() {
        assert_eq!(
            clean_insight("\n  \"Hydration tracking is a crowded market.\"\nmore").as_deref(),
            Some("Hydration tracking is a crowded market.")
        );
        assert_eq!(clean_insight("- Bulleted takeaway").as_deref(), Some("Bulleted takeaway"));
        assert_eq!(clean_insight("  \n "), None);

        let long = "word ".repeat(100);
        let cleaned = clean_insight(&long).unwrap();
        assert!(cleaned.ends_with("..."));
        assert!(cleaned.chars().count() <= MAX_INSIGHT_CHARS + 3);
    }

    #[tokio::test]
    async fn test_summary_prompt_includes_output() {
        let mock = Arc::new(MockBackend::fixed("Customers feel the pain daily."));
        let insight = extractor(mock.clone())
            .extract(&summary_job("People forget to drink water."))
            .await
            .unwrap();

        assert_eq!(insight.text, "Customers feel the pain daily.");
        assert_eq!(insight.label.as_deref(), Some("problem"));
        let req = &mock.requests()[0];
        assert!(req.prompt.contains("People forget to drink water."));
        assert!(req.prompt.contains("Problem Validation Research"));
        assert_eq!(req.system_prompt.as_deref(), Some(t::INSIGHT_SYSTEM));
    }

    #[tokio::test]
    async fn test_compare_prompt_includes_both_sides() {
        let mock = Arc::new(MockBackend::fixed("The headline now leads with the benefit."));
        let job = InsightJob {
            source: InsightSource::Compare {
                before: "DRAFT TEXT".into(),
                after: "REFINED TEXT".into(),
            },
            ..summary_job("")
        };
        extractor(mock.clone()).extract(&job).await.unwrap();
        let prompt = &mock.requests()[0].prompt;
        assert!(prompt.contains("DRAFT TEXT"));
        assert!(prompt.contains("REFINED TEXT"));
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::http(401, "bad key")]));
        assert!(extractor(mock).extract(&summary_job("x")).await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_records_and_reports() {
        let mock = Arc::new(MockBackend::fixed("Key takeaway."));
        let extractor = extractor(mock);
        let recorder = Arc::new(MemoryRecorder::new());
        let (sink, mut rx) = progress_channel(8);

        extractor.spawn(
            summary_job("output"),
            Reporter::new(Arc::new(sink), Uuid::nil()),
            recorder.clone(),
        );
        assert!(extractor.drain(Duration::from_secs(5)).await);

        assert_eq!(
            rx.try_recv(),
            Some(ProgressEvent::Insight {
                stage_id: 2,
                text: "Key takeaway.".into(),
                label: Some("problem".into()),
            })
        );
        assert_eq!(recorder.insights().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_hung_tasks() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let extractor = extractor(mock).with_timeout(Duration::from_secs(3600));
        let (sink, _rx) = progress_channel(8);
        extractor.spawn(
            summary_job("output"),
            Reporter::new(Arc::new(sink), Uuid::nil()),
            Arc::new(MemoryRecorder::new()),
        );
        assert_eq!(extractor.pending(), 1);
        assert!(!extractor.drain(Duration::from_secs(1)).await);
        assert_eq!(extractor.pending(), 0);
    }
}
