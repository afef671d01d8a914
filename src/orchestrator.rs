//! Sequential stage execution.
//!
//! [`Orchestrator::run`] walks the registry in id order. For each stage it
//! renders the prompt from the run's [`RunContext`], invokes the bound
//! provider, records the output and reports progress. The first failing
//! stage ends the run; later stages are never invoked.

use crate::cache::RawOutputCache;
use crate::error::Result;
use crate::events::{progress_channel, LogLevel, NullSink, Phase, ProgressEvent, ProgressReceiver, ProgressSink, Reporter};
use crate::hooks::{best_effort, NoopRecorder, SessionRecorder, SessionStart, SessionStatus, SessionSummary, StepRecord};
use crate::insight::{InsightExtractor, InsightJob, InsightSource};
use crate::provider::{Completion, InvokeOptions, Provider};
use crate::registry::StageRegistry;
use crate::stage::{InsightMode, ProviderKind, StageDefinition};
use crate::types::{RunContext, RunOutput, StageResult};
use crate::PipelineError;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Run-level tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum idea length in characters, after trimming.
    pub min_idea_chars: usize,
    /// Interval between heartbeats while a provider call is in flight.
    pub heartbeat_interval: Duration,
    /// Cap on heartbeats emitted for a single stage.
    pub max_heartbeats_per_stage: u32,
    /// Queue size for [`Orchestrator::spawn`] progress channels.
    pub channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_idea_chars: 10,
            heartbeat_interval: Duration::from_secs(15),
            max_heartbeats_per_stage: 40,
            channel_capacity: 256,
        }
    }
}

/// Trim `idea` and enforce the minimum length.
pub fn validate_idea(idea: &str, min_chars: usize) -> Result<String> {
    let trimmed = idea.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Validation("Product idea is required".into()));
    }
    let len = trimmed.chars().count();
    if len < min_chars {
        return Err(PipelineError::Validation(format!(
            "Product idea must be at least {} characters (got {})",
            min_chars, len
        )));
    }
    Ok(trimmed.to_string())
}

/// Runs the staged pipeline. Build once and share; runs are independent.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    chat: Arc<Provider>,
    research: Arc<Provider>,
    insights: Option<Arc<InsightExtractor>>,
    recorder: Arc<dyn SessionRecorder>,
    cache: Option<Arc<RawOutputCache>>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.len())
            .field("chat", &self.chat)
            .field("research", &self.research)
            .field("insights", &self.insights.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct StageSuccess {
    completion: Completion,
    input: String,
    elapsed: Duration,
}

struct StageFailure {
    error: PipelineError,
    input: String,
    elapsed: Duration,
}

impl Orchestrator {
    pub fn builder(registry: StageRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            chat: None,
            research: None,
            insights: None,
            recorder: None,
            cache: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn insights(&self) -> Option<&Arc<InsightExtractor>> {
        self.insights.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<RawOutputCache>> {
        self.cache.as_ref()
    }

    /// Run every stage without progress reporting.
    pub async fn process_all(&self, idea: &str) -> Result<RunOutput> {
        self.run(idea, Arc::new(NullSink), CancellationToken::new()).await
    }

    /// Run every stage, reporting to `sink`, until done, failed or cancelled.
    ///
    /// The idea is validated before any provider call. A stage failure is
    /// returned as [`PipelineError::StageFailed`] carrying the stage id.
    pub async fn run(
        &self,
        idea: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<RunOutput> {
        self.run_with_id(Uuid::new_v4(), idea, sink, cancel).await
    }

    async fn run_with_id(
        &self,
        request_id: Uuid,
        idea: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<RunOutput> {
        let reporter = Reporter::new(sink, request_id);
        let idea = match validate_idea(idea, self.config.min_idea_chars) {
            Ok(idea) => idea,
            Err(e) => {
                reporter.log(LogLevel::Error, e.to_string());
                return Err(e);
            }
        };

        let span = info_span!("pipeline_run", %request_id);
        self.run_stages(RunContext::with_request_id(request_id, idea), reporter, cancel)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        mut ctx: RunContext,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Result<RunOutput> {
        let request_id = ctx.request_id;
        let started = Instant::now();
        let total = self.registry.len();

        info!(stages = total, idea_chars = ctx.original_idea.chars().count(), "run started");
        reporter.log(LogLevel::Info, format!("Run started: {} steps", total));
        best_effort(
            "start session",
            request_id,
            self.recorder.start_session(&SessionStart {
                request_id,
                idea: ctx.original_idea.clone(),
                stage_count: total,
                started_at: Utc::now(),
            }),
        )
        .await;

        let mut per_stage = Vec::with_capacity(total);
        for stage in self.registry.stages() {
            let outcome = self.execute_stage(stage, &ctx, &reporter, &cancel).await;
            match outcome {
                Ok(done) => {
                    let result = self.complete_stage(stage, &mut ctx, &reporter, done).await;
                    per_stage.push(result);
                }
                Err(failure) => {
                    return Err(self.fail_stage(stage, &reporter, failure, started).await);
                }
            }
        }

        let final_id = self.registry.final_document_stage();
        let plan_id = self.registry.plan_stage();
        let final_document = ctx
            .output(final_id)
            .ok_or_else(|| PipelineError::Other(format!("stage {} produced no output", final_id)))?
            .to_string();
        let plan_document = ctx
            .output(plan_id)
            .ok_or_else(|| PipelineError::Other(format!("stage {} produced no output", plan_id)))?
            .to_string();
        let total_duration_ms = started.elapsed().as_millis() as u64;

        best_effort(
            "finish session",
            request_id,
            self.recorder.finish_session(&SessionSummary {
                request_id,
                status: SessionStatus::Completed,
                total_duration_ms,
                failed_stage: None,
                error: None,
            }),
        )
        .await;
        info!(total_duration_ms, "run complete");
        reporter.log(
            LogLevel::Info,
            format!("Run complete in {:.1}s", total_duration_ms as f64 / 1000.0),
        );

        Ok(RunOutput {
            request_id,
            final_document,
            plan_document,
            per_stage,
            total_duration_ms,
        })
    }

    async fn execute_stage(
        &self,
        stage: &StageDefinition,
        ctx: &RunContext,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageSuccess, StageFailure> {
        let started = Instant::now();
        let total = self.registry.len();
        let done = stage.id - 1;
        let (pct_start, pct_end) = (self.registry.progress_pct(done), self.registry.progress_pct(stage.id));

        reporter.status(
            stage.id,
            &stage.name,
            Phase::Starting,
            format!("Step {}/{}: {}", stage.id, total, stage.name),
            pct_start,
        );

        let fail = |error: PipelineError, input: String| StageFailure {
            error,
            input,
            elapsed: started.elapsed(),
        };

        if cancel.is_cancelled() {
            return Err(fail(PipelineError::Cancelled, String::new()));
        }
        let rendered = stage.render(ctx).map_err(|e| fail(e, String::new()))?;

        let activity = if stage.activity.is_empty() {
            format!("Running {}...", stage.name)
        } else {
            stage.activity.clone()
        };
        reporter.status(
            stage.id,
            &stage.name,
            Phase::Processing,
            activity,
            pct_start + (pct_end - pct_start) / 2,
        );

        let provider = match stage.provider {
            ProviderKind::Chat => &self.chat,
            ProviderKind::Research => &self.research,
        };
        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            reporter.log(
                LogLevel::Warn,
                format!(
                    "Step {}: attempt {} failed ({}); retrying in {:.1}s",
                    stage.id,
                    attempt,
                    crate::parsing::preview(reason, 120),
                    delay.as_secs_f64()
                ),
            );
        };
        let call = provider.invoke(
            &rendered.system,
            &rendered.user,
            InvokeOptions {
                timeout: stage.timeout,
                cancel: Some(cancel),
                on_retry: Some(&mut on_retry),
            },
        );

        let outcome = self.with_heartbeats(call, stage.id, reporter).await;
        match outcome {
            Ok(completion) => Ok(StageSuccess {
                completion,
                input: rendered.user,
                elapsed: started.elapsed(),
            }),
            Err(e) => Err(fail(e, rendered.user)),
        }
    }

    /// Drive `call` to completion, emitting bounded heartbeats meanwhile.
    async fn with_heartbeats<F: Future>(&self, call: F, stage_id: u32, reporter: &Reporter) -> F::Output {
        tokio::pin!(call);
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sent = 0u32;
        loop {
            tokio::select! {
                out = &mut call => return out,
                _ = ticker.tick(), if sent < self.config.max_heartbeats_per_stage => {
                    sent += 1;
                    reporter.heartbeat(Some(stage_id));
                }
            }
        }
    }

    async fn complete_stage(
        &self,
        stage: &StageDefinition,
        ctx: &mut RunContext,
        reporter: &Reporter,
        done: StageSuccess,
    ) -> StageResult {
        let request_id = ctx.request_id;
        let StageSuccess {
            completion,
            input,
            elapsed,
        } = done;
        let duration_ms = elapsed.as_millis() as u64;
        let chars = completion.text.chars().count();

        info!(stage_id = stage.id, attempts = completion.attempts, chars, duration_ms, "stage complete");
        reporter.emit(ProgressEvent::Status {
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            phase: Phase::Completed,
            message: format!("Step {} complete ({} chars)", stage.id, chars),
            progress_pct: self.registry.progress_pct(stage.id),
            output_chars: Some(chars),
            error: None,
        });

        if let Some(cache) = &self.cache {
            cache.append(request_id, stage.id, &completion.text, &completion.model);
        }
        best_effort(
            "save step output",
            request_id,
            self.recorder.save_step_output(&StepRecord {
                request_id,
                stage_id: stage.id,
                name: stage.name.clone(),
                persona: stage.persona.clone(),
                input,
                output: completion.text.clone(),
                model: completion.model.clone(),
                duration_ms,
                attempts: completion.attempts,
                error: None,
            }),
        )
        .await;

        if let Some(extractor) = &self.insights {
            let source = match stage.insight {
                InsightMode::None => None,
                InsightMode::Summary => Some(InsightSource::Summary {
                    output: completion.text.clone(),
                }),
                InsightMode::Compare { before } => ctx.output(before).map(|b| InsightSource::Compare {
                    before: b.to_string(),
                    after: completion.text.clone(),
                }),
            };
            if let Some(source) = source {
                extractor.spawn(
                    InsightJob {
                        request_id,
                        stage_id: stage.id,
                        stage_name: stage.name.clone(),
                        label: stage.insight_label.clone(),
                        source,
                    },
                    reporter.clone(),
                    self.recorder.clone(),
                );
            }
        }

        ctx.record(stage.id, completion.text.clone());
        StageResult {
            stage_id: stage.id,
            name: stage.name.clone(),
            persona: stage.persona.clone(),
            output: completion.text,
            duration_ms,
            attempts: completion.attempts,
            error: None,
        }
    }

    async fn fail_stage(
        &self,
        stage: &StageDefinition,
        reporter: &Reporter,
        failure: StageFailure,
        run_started: Instant,
    ) -> PipelineError {
        let request_id = reporter.request_id();
        let StageFailure { error, input, elapsed } = failure;
        let info = error.info();
        let status = if matches!(error, PipelineError::Cancelled) {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Failed
        };

        error!(stage_id = stage.id, kind = ?info.kind, error = %error, "stage failed");
        reporter.emit(ProgressEvent::Status {
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            phase: Phase::Error,
            message: format!("Step {} failed: {}", stage.id, error),
            progress_pct: self.registry.progress_pct(stage.id - 1),
            output_chars: None,
            error: Some(info.clone()),
        });

        let attempts = match &error {
            PipelineError::RetriesExhausted { attempts, .. } => *attempts,
            PipelineError::Cancelled | PipelineError::MissingInput { .. } | PipelineError::InvalidConfig(_) => 0,
            _ => 1,
        };
        best_effort(
            "save step output",
            request_id,
            self.recorder.save_step_output(&StepRecord {
                request_id,
                stage_id: stage.id,
                name: stage.name.clone(),
                persona: stage.persona.clone(),
                input,
                output: String::new(),
                model: match stage.provider {
                    ProviderKind::Chat => self.chat.model().to_string(),
                    ProviderKind::Research => self.research.model().to_string(),
                },
                duration_ms: elapsed.as_millis() as u64,
                attempts,
                error: Some(info.clone()),
            }),
        )
        .await;
        best_effort(
            "finish session",
            request_id,
            self.recorder.finish_session(&SessionSummary {
                request_id,
                status,
                total_duration_ms: run_started.elapsed().as_millis() as u64,
                failed_stage: Some(stage.id),
                error: Some(info.message),
            }),
        )
        .await;

        PipelineError::StageFailed {
            stage_id: stage.id,
            stage: stage.name.clone(),
            source: Box::new(error),
        }
    }

    /// Start a run on a background task and hand back its progress stream.
    ///
    /// Dropping the returned [`RunHandle`] cancels the run, aborting any
    /// in-flight provider call.
    pub fn spawn(self: &Arc<Self>, idea: impl Into<String>) -> RunHandle {
        let request_id = Uuid::new_v4();
        let (sink, events) = progress_channel(self.config.channel_capacity);
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let idea = idea.into();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            this.run_with_id(request_id, &idea, Arc::new(sink), token).await
        });
        RunHandle {
            request_id,
            events,
            join,
            guard: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

/// A run started with [`Orchestrator::spawn`].
#[derive(Debug)]
pub struct RunHandle {
    request_id: Uuid,
    events: ProgressReceiver,
    join: JoinHandle<Result<RunOutput>>,
    cancel: CancellationToken,
    guard: DropGuard,
}

impl RunHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn events(&mut self) -> &mut ProgressReceiver {
        &mut self.events
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Abort the run. It ends with a `Cancelled` stage failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<RunOutput> {
        let RunHandle { join, guard, .. } = self;
        let out = join.await;
        guard.disarm();
        match out {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::Other(format!("pipeline task failed: {}", e))),
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: StageRegistry,
    chat: Option<Arc<Provider>>,
    research: Option<Arc<Provider>>,
    insights: Option<Arc<InsightExtractor>>,
    recorder: Option<Arc<dyn SessionRecorder>>,
    cache: Option<Arc<RawOutputCache>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn chat(mut self, provider: Arc<Provider>) -> Self {
        self.chat = Some(provider);
        self
    }

    pub fn research(mut self, provider: Arc<Provider>) -> Self {
        self.research = Some(provider);
        self
    }

    pub fn insights(mut self, extractor: Arc<InsightExtractor>) -> Self {
        self.insights = Some(extractor);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn SessionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn cache(mut self, cache: Arc<RawOutputCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails unless a provider is bound for every kind the registry uses.
    pub fn build(self) -> Result<Orchestrator> {
        let uses = |kind: ProviderKind| self.registry.stages().iter().any(|s| s.provider == kind);
        let chat = match (self.chat, uses(ProviderKind::Chat)) {
            (Some(p), _) => p,
            (None, true) => return Err(PipelineError::InvalidConfig("no chat provider configured".into())),
            (None, false) => match &self.research {
                Some(p) => p.clone(),
                None => return Err(PipelineError::InvalidConfig("no provider configured".into())),
            },
        };
        let research = match (self.research, uses(ProviderKind::Research)) {
            (Some(p), _) => p,
            (None, true) => {
                return Err(PipelineError::InvalidConfig("no research provider configured".into()))
            }
            (None, false) => chat.clone(),
        };
        if self.config.min_idea_chars == 0 {
            return Err(PipelineError::InvalidConfig("min_idea_chars must be at least 1".into()));
        }

        Ok(Orchestrator {
            registry: Arc::new(self.registry),
            chat,
            research,
            insights: self.insights,
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NoopRecorder)),
            cache: self.cache,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackoffConfig, LlmRequest, MockBackend, MockReply};
    use crate::error::ErrorKind;
    use crate::events::{FnSink, Received};
    use crate::hooks::MemoryRecorder;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const IDEA: &str = "A smart water bottle that tracks hydration";
    const MARKET: &str = "Market is $2B, growing 8%/yr";

    fn provider(kind: ProviderKind, mock: Arc<MockBackend>) -> Arc<Provider> {
        Arc::new(
            Provider::builder(kind, "http://unused")
                .backend(mock)
                .backoff(BackoffConfig::immediate(3))
                .build()
                .unwrap(),
        )
    }

    /// Chat mock that answers with the stage it was asked for, keyed on the
    /// system prompt.
    fn chat_mock() -> Arc<MockBackend> {
        Arc::new(MockBackend::with_responder(|req: &LlmRequest| {
            let registry = StageRegistry::working_backwards().unwrap();
            let id = registry
                .stages()
                .iter()
                .find(|s| req.system_prompt.as_deref() == Some(s.system_prompt.as_str()))
                .map(|s| s.id)
                .unwrap_or(0);
            MockReply::text(format!("OUTPUT OF STAGE {id}"))
        }))
    }

    fn orchestrator(chat: Arc<MockBackend>, research: Arc<MockBackend>) -> Orchestrator {
        Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat))
            .research(provider(ProviderKind::Research, research))
            .build()
            .unwrap()
    }

    fn collecting_sink() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<ProgressEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = Arc::new(FnSink(move |e: ProgressEvent| sink_seen.lock().unwrap().push(e)));
        (sink, seen)
    }

    #[tokio::test]
    async fn test_research_output_flows_into_stage_two() {
        let chat = chat_mock();
        let research = Arc::new(MockBackend::fixed(MARKET));
        let out = orchestrator(chat.clone(), research.clone()).process_all(IDEA).await.unwrap();

        let research_reqs = research.requests();
        assert_eq!(research_reqs.len(), 1);
        assert!(research_reqs[0].prompt.contains(IDEA));
        assert!(!research_reqs[0].prompt.contains('{'));

        let chat_reqs = chat.requests();
        assert_eq!(chat_reqs.len(), 9);
        assert!(chat_reqs[0].prompt.contains(MARKET));

        assert_eq!(out.final_document, "OUTPUT OF STAGE 9");
        assert_eq!(out.plan_document, "OUTPUT OF STAGE 10");
        assert_eq!(out.per_stage.len(), 10);
        assert!(out.per_stage.iter().all(StageResult::is_success));
    }

    #[tokio::test]
    async fn test_short_idea_is_rejected_before_any_call() {
        let chat = chat_mock();
        let research = Arc::new(MockBackend::fixed(MARKET));
        let err = orchestrator(chat.clone(), research.clone()).process_all("ok").await.unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(chat.call_count() + research.call_count(), 0);
        assert_err!(validate_idea("   ", 10));
        assert_ok!(validate_idea("  ten chars!  ", 10));
    }

    #[tokio::test]
    async fn test_rate_limited_stage_succeeds_after_retries() {
        let calls = Arc::new(Mutex::new(0u32));
        let stage3_calls = calls.clone();
        let chat = Arc::new(MockBackend::with_responder(move |req: &LlmRequest| {
            if req.system_prompt.as_deref() == Some(crate::templates::DRAFT_PRESS_RELEASE_SYSTEM) {
                let mut n = stage3_calls.lock().unwrap();
                *n += 1;
                if *n <= 2 {
                    return MockReply::http(429, "rate limited");
                }
            }
            MockReply::text("fine")
        }));
        let (sink, seen) = collecting_sink();
        let out = orchestrator(chat, Arc::new(MockBackend::fixed(MARKET)))
            .run(IDEA, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.stage(3).unwrap().attempts, 3);
        assert_eq!(out.stage(2).unwrap().attempts, 1);
        let warnings = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Log { level: LogLevel::Warn, .. }))
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_auth_failure_stops_the_run() {
        let chat = Arc::new(MockBackend::with_responder(|req: &LlmRequest| {
            if req.system_prompt.as_deref() == Some(crate::templates::INTERNAL_FAQ_SYSTEM) {
                MockReply::http(401, r#"{"error":{"message":"invalid API key"}}"#)
            } else {
                MockReply::text("fine")
            }
        }));
        let recorder = Arc::new(MemoryRecorder::new());
        let (sink, seen) = collecting_sink();
        let orch = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat.clone()))
            .research(provider(ProviderKind::Research, Arc::new(MockBackend::fixed(MARKET))))
            .recorder(recorder.clone())
            .build()
            .unwrap();

        let err = orch.run(IDEA, sink, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.failed_stage_id(), Some(5));
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.to_string().starts_with("Step 5 (Internal FAQ) failed"));
        // stages 2, 3, 4 and one attempt at 5
        assert_eq!(chat.call_count(), 4);

        let events = seen.lock().unwrap();
        let last = events
            .iter()
            .rev()
            .find(|e| matches!(e, ProgressEvent::Status { .. }))
            .unwrap();
        assert!(last.is_terminal_error());
        assert!(!events.iter().any(|e| e.stage_id().is_some_and(|id| id > 5)));

        let steps = recorder.steps();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[4].error.as_ref().unwrap().kind, ErrorKind::Authentication);
        assert_eq!(recorder.summaries()[0].status, SessionStatus::Failed);
        assert_eq!(recorder.summaries()[0].failed_stage, Some(5));
    }

    #[tokio::test]
    async fn test_prompts_only_see_earlier_outputs() {
        let chat = chat_mock();
        orchestrator(chat.clone(), Arc::new(MockBackend::fixed("OUTPUT OF STAGE 1")))
            .process_all(IDEA)
            .await
            .unwrap();

        let registry = StageRegistry::working_backwards().unwrap();
        for req in chat.requests() {
            let stage = registry
                .stages()
                .iter()
                .find(|s| req.system_prompt.as_deref() == Some(s.system_prompt.as_str()))
                .unwrap();
            for later in stage.id..=10 {
                assert!(
                    !req.prompt.contains(&format!("OUTPUT OF STAGE {later}")),
                    "stage {} saw output of stage {}",
                    stage.id,
                    later
                );
            }
        }
    }

    #[tokio::test]
    async fn test_status_events_are_ordered() {
        let (sink, seen) = collecting_sink();
        orchestrator(chat_mock(), Arc::new(MockBackend::fixed(MARKET)))
            .run(IDEA, sink, CancellationToken::new())
            .await
            .unwrap();

        let statuses: Vec<(u32, Phase, u8)> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Status {
                    stage_id,
                    phase,
                    progress_pct,
                    ..
                } => Some((*stage_id, *phase, *progress_pct)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 30);
        assert_eq!(statuses[0], (1, Phase::Starting, 0));
        assert_eq!(statuses[2], (1, Phase::Completed, 10));
        assert_eq!(statuses[29], (10, Phase::Completed, 100));
        assert!(statuses.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].2 <= w[1].2));
    }

    #[tokio::test]
    async fn test_hanging_insights_do_not_block_the_run() {
        let insight_mock = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let extractor = Arc::new(InsightExtractor::new(provider(ProviderKind::Chat, insight_mock.clone())));
        let orch = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat_mock()))
            .research(provider(ProviderKind::Research, Arc::new(MockBackend::fixed(MARKET))))
            .insights(extractor.clone())
            .build()
            .unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), orch.process_all(IDEA))
            .await
            .expect("run must not wait for insights")
            .unwrap();
        assert_eq!(out.per_stage.len(), 10);
        extractor.shutdown();
    }

    #[tokio::test]
    async fn test_insights_are_reported_and_cached_outputs_kept() {
        let insight_mock = Arc::new(MockBackend::fixed("One key takeaway."));
        let extractor = Arc::new(InsightExtractor::new(provider(ProviderKind::Chat, insight_mock.clone())));
        let cache = Arc::new(RawOutputCache::default());
        let recorder = Arc::new(MemoryRecorder::new());
        let orch = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat_mock()))
            .research(provider(ProviderKind::Research, Arc::new(MockBackend::fixed(MARKET))))
            .insights(extractor.clone())
            .cache(cache.clone())
            .recorder(recorder.clone())
            .build()
            .unwrap();

        let out = orch.process_all(IDEA).await.unwrap();
        assert!(extractor.drain(Duration::from_secs(5)).await);

        assert_eq!(insight_mock.call_count(), 10);
        assert_eq!(recorder.insights().len(), 10);
        let compare = insight_mock
            .requests()
            .into_iter()
            .find(|r| r.prompt.contains("Stage: Refine Press Release"))
            .unwrap();
        assert!(compare.prompt.contains("Before:\nOUTPUT OF STAGE 3"));

        let raw = cache.get(out.request_id).unwrap();
        assert_eq!(raw.len(), 10);
        assert_eq!(raw[0].output, MARKET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_while_waiting_are_bounded() {
        let research = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let orch = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat_mock()))
            .research(Arc::new(
                Provider::builder(ProviderKind::Research, "http://unused")
                    .backend(research)
                    .backoff(BackoffConfig::none())
                    .build()
                    .unwrap(),
            ))
            .config(OrchestratorConfig {
                heartbeat_interval: Duration::from_secs(10),
                max_heartbeats_per_stage: 5,
                ..Default::default()
            })
            .build()
            .unwrap();

        let (sink, seen) = collecting_sink();
        let err = orch.run(IDEA, sink, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.failed_stage_id(), Some(1));
        assert!(matches!(err.root_cause(), PipelineError::Timeout { .. }));

        let beats = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Heartbeat { stage_id: Some(1), .. }))
            .count();
        assert_eq!(beats, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_timeout_bounds_each_attempt() {
        let research = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let mut registry = StageRegistry::working_backwards().unwrap();
        registry.set_timeout(ProviderKind::Research, Duration::from_secs(1));
        let orch = Orchestrator::builder(registry)
            .chat(provider(ProviderKind::Chat, chat_mock()))
            .research(provider(ProviderKind::Research, research.clone()))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = orch.process_all(IDEA).await.unwrap_err();

        assert_eq!(err.failed_stage_id(), Some(1));
        assert!(matches!(
            err.root_cause(),
            PipelineError::Timeout { after } if *after == Duration::from_secs(1)
        ));
        assert_eq!(research.call_count(), 4);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_dropping_the_handle_cancels_the_run() {
        let research = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let recorder = Arc::new(MemoryRecorder::new());
        let orch = Arc::new(
            Orchestrator::builder(StageRegistry::working_backwards().unwrap())
                .chat(provider(ProviderKind::Chat, chat_mock()))
                .research(provider(ProviderKind::Research, research))
                .recorder(recorder.clone())
                .build()
                .unwrap(),
        );

        let mut handle = orch.spawn(IDEA);
        loop {
            match handle.events().recv_timeout(Duration::from_secs(5)).await {
                Received::Event(ProgressEvent::Status {
                    phase: Phase::Processing,
                    ..
                }) => break,
                Received::Event(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        drop(handle);

        for _ in 0..100 {
            if !recorder.summaries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let summaries = recorder.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_spawned_run_streams_until_done() {
        let orch = Arc::new(orchestrator(chat_mock(), Arc::new(MockBackend::fixed(MARKET))));
        let mut handle = orch.spawn(IDEA);
        let request_id = handle.request_id();

        let mut completed = 0;
        while let Some(event) = handle.events().recv().await {
            if let ProgressEvent::Status {
                phase: Phase::Completed,
                ..
            } = event
            {
                completed += 1;
            }
        }
        assert_eq!(completed, 10);
        let out = handle.join().await.unwrap();
        assert_eq!(out.request_id, request_id);
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled_stage() {
        let research = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let orch = Arc::new(orchestrator(chat_mock(), research));
        let handle = orch.spawn(IDEA);
        handle.cancel();
        let err = handle.join().await.unwrap_err();
        assert_eq!(err.failed_stage_id(), Some(1));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_builder_requires_providers() {
        let err = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
            .chat(provider(ProviderKind::Chat, chat_mock()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("research"));
    }
}
