//! # PRFAQ Pipeline
//!
//! Turns a one-line product idea into an Amazon-style Working Backwards
//! PRFAQ document and a minimum lovable product plan by running a fixed
//! sequence of LLM stages.
//!
//! Stage 1 performs web-grounded market research; every later stage drafts,
//! refines or critiques using the original idea and earlier stage outputs.
//! Progress streams to the caller while the run is in flight, and each
//! completed stage can trigger a background insight that never slows the
//! run down.
//!
//! ## Core Concepts
//!
//! - **[`StageRegistry`]**: the ordered, validated stage table. Each
//!   [`StageDefinition`] declares which placeholders it fills and where
//!   each value comes from.
//! - **[`Provider`]**: a backend (Anthropic for chat, an OpenAI-compatible
//!   endpoint such as Perplexity for research) plus model, retry policy and
//!   per-attempt timeout.
//! - **[`Orchestrator`]**: runs stages strictly in order, reports
//!   [`ProgressEvent`]s and stops at the first failing stage.
//! - **[`InsightExtractor`]**: fire-and-forget one-sentence takeaways.
//! - **[`SessionRecorder`]** and **[`RawOutputCache`]**: best-effort
//!   persistence of what a run produced.
//!
//! ## Quick Start
//!
//! ```no_run
//! use prfaq_pipeline::config::Settings;
//! use prfaq_pipeline::events::ProgressEvent;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Arc::new(Settings::from_env()?.build_orchestrator()?);
//!
//!     let mut run = orchestrator.spawn("A smart water bottle that tracks hydration");
//!     while let Some(event) = run.events().recv().await {
//!         if let ProgressEvent::Status { stage_id, message, .. } = event {
//!             println!("[{stage_id}] {message}");
//!         }
//!     }
//!
//!     let output = run.join().await?;
//!     println!("{}", output.final_document);
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without network
//!
//! ```
//! use prfaq_pipeline::backend::MockBackend;
//! use prfaq_pipeline::{Orchestrator, Provider, ProviderKind, StageRegistry};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let chat = Provider::builder(ProviderKind::Chat, "http://unused")
//!     .backend(Arc::new(MockBackend::fixed("drafted")))
//!     .build()
//!     .unwrap();
//! let research = Provider::builder(ProviderKind::Research, "http://unused")
//!     .backend(Arc::new(MockBackend::fixed("Market is $2B, growing 8%/yr")))
//!     .build()
//!     .unwrap();
//!
//! let orchestrator = Orchestrator::builder(StageRegistry::working_backwards().unwrap())
//!     .chat(Arc::new(chat))
//!     .research(Arc::new(research))
//!     .build()
//!     .unwrap();
//!
//! let output = orchestrator
//!     .process_all("A smart water bottle that tracks hydration")
//!     .await
//!     .unwrap();
//! assert_eq!(output.per_stage.len(), 10);
//! # });
//! ```

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod insight;
pub mod logging;
pub mod orchestrator;
pub mod parsing;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod stage;
pub mod templates;
pub mod types;

pub use analysis::{enriched_brief, AnalysisFeedback, ProductAnalysis, ProductAnalyzer};
pub use backend::{AnthropicBackend, BackoffConfig, MockBackend, OpenAiBackend};
pub use cache::RawOutputCache;
pub use client::LlmConfig;
pub use config::Settings;
pub use error::{ErrorInfo, ErrorKind, PipelineError, Result};
pub use events::{
    progress_channel, FnSink, Phase, ProgressEvent, ProgressReceiver, ProgressSink, StallMonitor,
};
pub use hooks::{MemoryRecorder, NoopRecorder, SessionRecorder};
pub use insight::InsightExtractor;
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunHandle};
pub use provider::Provider;
pub use registry::StageRegistry;
pub use stage::{InputBinding, ProviderKind, StageDefinition};
pub use types::{Insight, RunOutput, StageResult};
