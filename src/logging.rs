//! Tracing setup for binaries and demos embedding the pipeline.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. `RUST_LOG` overrides the default filter.

use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default filter for `verbose`.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "prfaq_pipeline=debug,info"
    } else {
        "prfaq_pipeline=info,warn"
    }
}

/// Install a global compact `fmt` subscriber.
///
/// Verbose mode adds targets and logs span close times, which shows how long
/// each `pipeline_run` took. Fails if a global subscriber is already set.
pub fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(verbose)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_target(verbose)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_span_events(if verbose { FmtSpan::CLOSE } else { FmtSpan::NONE })
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;
    Ok(())
}
