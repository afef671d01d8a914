//! Example: a live run against Anthropic and Perplexity.
//!
//! Requires `ANTHROPIC_API_KEY` and `PERPLEXITY_API_KEY`.
//!
//! Run with: `cargo run --example live_run -- "your product idea"`

use prfaq_pipeline::config::Settings;
use prfaq_pipeline::events::{ProgressEvent, Received, StallMonitor};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    prfaq_pipeline::logging::init_tracing(true)?;

    let idea = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "A smart water bottle that tracks hydration".to_string());

    let settings = Settings::from_env()?;
    let orchestrator = Arc::new(settings.build_orchestrator()?);
    let mut monitor = StallMonitor::new(
        orchestrator.registry(),
        Duration::from_secs(180),
        Duration::from_secs(30),
    );

    let mut run = orchestrator.spawn(idea);
    println!("Request {}", run.request_id());

    // Ctrl-C drops the handle, which cancels the in-flight provider call.
    loop {
        let received = tokio::select! {
            r = run.events().recv_timeout(Duration::from_secs(5)) => r,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted; cancelling");
                return Ok(());
            }
        };
        match received {
            Received::Event(event) => {
                monitor.observe(&event);
                match &event {
                    ProgressEvent::Status { stage_id, message, progress_pct, .. } => {
                        println!("[{:>3}%] {}: {}", progress_pct, stage_id, message)
                    }
                    ProgressEvent::Insight { text, .. } => println!("  * {}", text),
                    ProgressEvent::Log { message, .. } => println!("  {}", message),
                    ProgressEvent::Heartbeat { .. } => {}
                }
            }
            Received::Idle if run.is_finished() => break,
            Received::Idle if monitor.is_stalled() => {
                eprintln!("No progress for {:?}; giving up", monitor.silent_for());
                run.cancel();
                break;
            }
            Received::Idle => {}
            Received::Closed => break,
        }
    }

    match run.join().await {
        Ok(output) => {
            println!("\n{}\n\n{}", output.final_document, output.plan_document);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
