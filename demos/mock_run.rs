//! Example: a full ten-stage run against mock providers.
//!
//! Run with: `cargo run --example mock_run`

use prfaq_pipeline::backend::{LlmRequest, MockBackend, MockReply};
use prfaq_pipeline::events::{Phase, ProgressEvent};
use prfaq_pipeline::{
    InsightExtractor, MemoryRecorder, Orchestrator, Provider, ProviderKind, StageRegistry,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    prfaq_pipeline::logging::init_tracing(false)?;

    // Chat mock echoes the first line of each prompt so the flow is visible.
    let chat = MockBackend::with_responder(|req: &LlmRequest| {
        let first = req.prompt.lines().next().unwrap_or_default();
        MockReply::text(format!("Draft responding to '{}'", first))
    });
    let research = MockBackend::fixed("Market is $2B, growing 8%/yr. Main competitors: HidrateSpark, WaterH.");
    let insights = MockBackend::fixed("Customers want reminders, not data.");

    let provider = |kind, mock: MockBackend| {
        Provider::builder(kind, "http://unused")
            .backend(Arc::new(mock))
            .build()
            .map(Arc::new)
    };

    let recorder = Arc::new(MemoryRecorder::new());
    let extractor = Arc::new(InsightExtractor::new(provider(ProviderKind::Chat, insights)?));
    let orchestrator = Arc::new(
        Orchestrator::builder(StageRegistry::working_backwards()?)
            .chat(provider(ProviderKind::Chat, chat)?)
            .research(provider(ProviderKind::Research, research)?)
            .insights(extractor.clone())
            .recorder(recorder.clone())
            .build()?,
    );

    let mut run = orchestrator.spawn("A smart water bottle that tracks hydration");
    while let Some(event) = run.events().recv().await {
        match event {
            ProgressEvent::Status {
                stage_id,
                phase: Phase::Completed,
                progress_pct,
                output_chars,
                ..
            } => println!(
                "[{:>3}%] step {} done ({} chars)",
                progress_pct,
                stage_id,
                output_chars.unwrap_or(0)
            ),
            ProgressEvent::Insight { stage_id, text, .. } => println!("        insight {}: {}", stage_id, text),
            ProgressEvent::Log { message, .. } => println!("        {}", message),
            _ => {}
        }
    }

    let output = run.join().await?;
    extractor.drain(Duration::from_secs(5)).await;

    println!("\nFinal document:\n{}", output.final_document);
    println!("\nPlan:\n{}", output.plan_document);
    println!(
        "\nRecorded {} steps and {} insights in {}ms",
        recorder.steps().len(),
        recorder.insights().len(),
        output.total_duration_ms
    );
    Ok(())
}
