//! Example: analyze an idea, apply feedback, then build the pipeline brief.
//!
//! Requires `ANTHROPIC_API_KEY`.
//!
//! Run with: `cargo run --example product_analysis`

use prfaq_pipeline::config::Settings;
use prfaq_pipeline::{enriched_brief, AnalysisFeedback};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    prfaq_pipeline::logging::init_tracing(false)?;

    let idea = "A smart water bottle that tracks hydration";
    let analyzer = Settings::from_env()?.build_analyzer()?;

    let analysis = analyzer.analyze(idea).await?;
    println!("{}\n", analysis.text);

    let feedback = AnalysisFeedback {
        scope: Some("Focus on office workers; skip the companion app for v1".into()),
        ..Default::default()
    };
    let refined = analyzer.refine(idea, &analysis.text, &feedback).await?;
    println!("Refined scope: {}\n", refined.product_scope.as_deref().unwrap_or("(none)"));

    println!("{}", enriched_brief(idea, &refined.text));
    Ok(())
}
