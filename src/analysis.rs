//! Product analysis ahead of a pipeline run.
//!
//! The analyzer turns a rough idea into three short sections (target
//! customer, customer problem, product scope), lets the user correct them
//! section by section, and folds the result into the brief that the
//! pipeline runs on.

use crate::error::Result;
use crate::orchestrator::validate_idea;
use crate::prompt;
use crate::provider::{InvokeOptions, Provider};
use crate::templates as t;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const NO_CHANGES: &str = "No changes requested";

/// Analysis text plus its parsed sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAnalysis {
    pub text: String,
    pub target_customer: Option<String>,
    pub customer_problem: Option<String>,
    pub product_scope: Option<String>,
}

impl ProductAnalysis {
    /// Split a `## Heading` formatted response into its three sections.
    /// Sections that are missing stay `None`; `text` always holds the full response.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut sections: BTreeMap<&'static str, String> = BTreeMap::new();
        let mut current: Option<&'static str> = None;

        for line in text.lines() {
            let heading = line.trim_start().strip_prefix('#').map(|h| {
                h.trim_start_matches('#')
                    .trim()
                    .trim_matches('*')
                    .trim_end_matches(':')
                    .to_ascii_lowercase()
            });
            if let Some(heading) = heading {
                current = match heading.as_str() {
                    h if h.contains("customer") && h.contains("problem") => Some("problem"),
                    h if h.contains("target") || h.contains("customer") => Some("customer"),
                    h if h.contains("scope") => Some("scope"),
                    _ => None,
                };
                continue;
            }
            if let Some(key) = current {
                let body = sections.entry(key).or_default();
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
            }
        }

        let mut take = |key: &str| {
            sections
                .remove(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            target_customer: take("customer"),
            customer_problem: take("problem"),
            product_scope: take("scope"),
            text,
        }
    }
}

/// Per-section corrections for [`ProductAnalyzer::refine`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisFeedback {
    pub customer: Option<String>,
    pub problem: Option<String>,
    pub scope: Option<String>,
}

impl AnalysisFeedback {
    fn or_default(value: &Option<String>) -> String {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(NO_CHANGES)
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ProductAnalyzer {
    provider: Arc<Provider>,
    min_idea_chars: usize,
}

impl ProductAnalyzer {
    pub fn new(provider: Arc<Provider>, min_idea_chars: usize) -> Self {
        Self {
            provider,
            min_idea_chars,
        }
    }

    pub async fn analyze(&self, idea: &str) -> Result<ProductAnalysis> {
        let idea = validate_idea(idea, self.min_idea_chars)?;
        info!(idea_chars = idea.chars().count(), "analyzing product idea");
        let vars = BTreeMap::from([("input".to_string(), idea)]);
        self.ask(t::PRODUCT_ANALYSIS, &vars).await
    }

    /// Revise `current` using per-section feedback. Sections without
    /// feedback are asked to stay unchanged.
    pub async fn refine(
        &self,
        original: &str,
        current: &str,
        feedback: &AnalysisFeedback,
    ) -> Result<ProductAnalysis> {
        let original = validate_idea(original, self.min_idea_chars)?;
        info!("refining product analysis");
        let vars = BTreeMap::from([
            ("original_input".to_string(), original),
            ("current_analysis".to_string(), current.to_string()),
            ("customer_feedback".to_string(), AnalysisFeedback::or_default(&feedback.customer)),
            ("problem_feedback".to_string(), AnalysisFeedback::or_default(&feedback.problem)),
            ("scope_feedback".to_string(), AnalysisFeedback::or_default(&feedback.scope)),
        ]);
        self.ask(t::PRODUCT_ANALYSIS_REFINE, &vars).await
    }

    async fn ask(&self, template: &str, vars: &BTreeMap<String, String>) -> Result<ProductAnalysis> {
        let user = prompt::render(template, vars).map_err(|unbound| {
            crate::PipelineError::MissingInput {
                stage_id: 0,
                placeholder: unbound.0,
            }
        })?;
        let completion = self
            .provider
            .invoke(t::PRODUCT_ANALYSIS_SYSTEM, &user, InvokeOptions::default())
            .await?;
        Ok(ProductAnalysis::parse(completion.text))
    }
}

/// Combine the idea and its analysis into the pipeline input.
pub fn enriched_brief(idea: &str, analysis: &str) -> String {
    format!(
        "Product Concept: {}\n\nStrategic Analysis:\n{}\n\n\
         This brief combines the original product idea with strategic analysis to guide the Working Backwards process.",
        idea.trim(),
        analysis.trim()
    )
}
