//! Ordered stage table.
//!
//! [`StageRegistry::new`] is the single place pipeline wiring is checked:
//! stage ids must run 1..N without gaps, and every binding must read from
//! the original idea or a strictly earlier stage. A registry that builds
//! cannot hit a missing input at run time.

use crate::error::Result;
use crate::stage::{InputBinding, InputSource, InsightMode, ProviderKind, StageDefinition};
use crate::templates as t;
use crate::PipelineError;
use std::time::Duration;

const RESEARCH_TIMEOUT: Duration = Duration::from_secs(120);
const DRAFTING_TIMEOUT: Duration = Duration::from_secs(180);
const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(300);

/// Excerpt length for earlier research folded into later prompts.
const SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// Validate and wrap `stages`. Pipeline order is id order.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self> {
        if stages.len() < 2 {
            return Err(PipelineError::InvalidConfig(
                "A pipeline needs at least two stages: a final document and a plan".into(),
            ));
        }

        for (idx, stage) in stages.iter().enumerate() {
            let expected = idx as u32 + 1;
            if stage.id != expected {
                return Err(PipelineError::InvalidConfig(format!(
                    "Stage ids must be contiguous from 1: expected {}, found {} ('{}')",
                    expected, stage.id, stage.name
                )));
            }
            for binding in &stage.bindings {
                if let InputSource::Stage(src) = binding.source {
                    if src == 0 || src >= stage.id {
                        return Err(PipelineError::InvalidConfig(format!(
                            "Stage {} binds '{{{}}}' to stage {}, which does not run before it",
                            stage.id, binding.placeholder, src
                        )));
                    }
                }
            }
            if let InsightMode::Compare { before } = stage.insight {
                if before == 0 || before >= stage.id {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Stage {} compares against stage {}, which does not run before it",
                        stage.id, before
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    /// The ten-stage Working Backwards flow.
    pub fn working_backwards() -> Result<Self> {
        let stages = vec![
            StageDefinition::builder(1, "Market Research & Analysis")
                .persona("Expert Market Research Analyst")
                .description("Market sizing and competitive analysis from real-time web data")
                .activity("Researching the market...")
                .research()
                .system_prompt(t::MARKET_RESEARCH_SYSTEM)
                .prompt(t::MARKET_RESEARCH)
                .input(InputBinding::original("input"))
                .timeout(RESEARCH_TIMEOUT)
                .insight_label("market")
                .build()?,
            StageDefinition::builder(2, "Problem Validation Research")
                .persona("Customer Research Lead")
                .description("Test whether the customer problem is real and painful")
                .activity("Validating the customer problem...")
                .system_prompt(t::PROBLEM_VALIDATION_SYSTEM)
                .prompt(t::PROBLEM_VALIDATION)
                .input(InputBinding::original("product_idea"))
                .input(InputBinding::stage("market_research", 1))
                .timeout(DRAFTING_TIMEOUT)
                .insight_label("problem")
                .build()?,
            StageDefinition::builder(3, "Draft Press Release")
                .persona("Principal Product Manager")
                .description("Initial press release from the customer's perspective")
                .activity("Drafting the press release...")
                .system_prompt(t::DRAFT_PRESS_RELEASE_SYSTEM)
                .prompt(t::DRAFT_PRESS_RELEASE)
                .input(InputBinding::original("product_idea"))
                .input(InputBinding::stage("market_research", 1))
                .input(InputBinding::stage("problem_validation", 2))
                .timeout(DRAFTING_TIMEOUT)
                .insight_label("press_release")
                .build()?,
            StageDefinition::builder(4, "Refine Press Release")
                .persona("VP Product")
                .description("Refine the press release to executive-review quality")
                .activity("Refining the press release...")
                .system_prompt(t::REFINE_PRESS_RELEASE_SYSTEM)
                .prompt(t::REFINE_PRESS_RELEASE)
                .input(InputBinding::stage("market_research", 1))
                .input(InputBinding::stage("press_release_draft", 3))
                .timeout(DRAFTING_TIMEOUT)
                .insight(InsightMode::Compare { before: 3 })
                .insight_label("refinement")
                .build()?,
            StageDefinition::builder(5, "Internal FAQ")
                .persona("VP Business Lead & Principal Engineer")
                .description("Address internal strategic and technical challenges")
                .activity("Writing the internal FAQ...")
                .system_prompt(t::INTERNAL_FAQ_SYSTEM)
                .prompt(t::INTERNAL_FAQ)
                .input(InputBinding::stage("market_research", 1))
                .input(InputBinding::stage("press_release", 4))
                .timeout(DRAFTING_TIMEOUT)
                .insight_label("internal_faq")
                .build()?,
            StageDefinition::builder(6, "Concept Validation Research")
                .persona("User Researcher")
                .description("Simulated customer reactions to the concept")
                .activity("Validating the concept with target customers...")
                .system_prompt(t::CONCEPT_VALIDATION_SYSTEM)
                .prompt(t::CONCEPT_VALIDATION)
                .input(InputBinding::stage("press_release", 4))
                .input(InputBinding::stage("market_research", 1))
                .input(InputBinding::stage("problem_validation_summary", 2).excerpt(SUMMARY_CHARS))
                .timeout(DRAFTING_TIMEOUT)
                .insight_label("concept")
                .build()?,
            StageDefinition::builder(7, "Solution Refinement")
                .persona("Principal Product Manager")
                .description("Revise the solution using concept feedback")
                .activity("Refining the solution from customer feedback...")
                .system_prompt(t::SOLUTION_REFINEMENT_SYSTEM)
                .prompt(t::SOLUTION_REFINEMENT)
                .input(InputBinding::stage("refined_press_release", 4))
                .input(InputBinding::stage("concept_validation_feedback", 6))
                .input(InputBinding::stage("internal_faq", 5))
                .timeout(DRAFTING_TIMEOUT)
                .insight(InsightMode::Compare { before: 4 })
                .insight_label("solution")
                .build()?,
            StageDefinition::builder(8, "External FAQ")
                .persona("User Research & Behavior Expert")
                .description("Customer-facing FAQ addressing adoption concerns")
                .activity("Writing the external FAQ...")
                .system_prompt(t::EXTERNAL_FAQ_SYSTEM)
                .prompt(t::EXTERNAL_FAQ)
                .input(InputBinding::stage("solution_refined_press_release", 7))
                .input(InputBinding::stage("concept_validation_feedback", 6))
                .timeout(DRAFTING_TIMEOUT)
                .insight_label("external_faq")
                .build()?,
            StageDefinition::builder(9, "Synthesize PRFAQ Document")
                .persona("Senior Editor")
                .description("Combine every element into one PRFAQ document")
                .activity("Synthesizing the PRFAQ document...")
                .system_prompt(t::PRFAQ_SYNTHESIS_SYSTEM)
                .prompt(t::PRFAQ_SYNTHESIS)
                .input(InputBinding::stage("market_research", 1))
                .input(InputBinding::stage("refined_press_release", 7))
                .input(InputBinding::stage("external_faq", 8))
                .input(InputBinding::stage("internal_faq", 5))
                .input(InputBinding::stage("problem_validation", 2).excerpt(SUMMARY_CHARS))
                .input(InputBinding::stage("concept_validation", 6).excerpt(SUMMARY_CHARS))
                .timeout(SYNTHESIS_TIMEOUT)
                .insight_label("prfaq")
                .build()?,
            StageDefinition::builder(10, "Define MLP Plan")
                .persona("SVP Product & VP Engineering")
                .description("Minimum lovable product implementation plan")
                .activity("Defining the MLP plan...")
                .system_prompt(t::MLP_PLAN_SYSTEM)
                .prompt(t::MLP_PLAN)
                .input(InputBinding::stage("input", 9))
                .timeout(SYNTHESIS_TIMEOUT)
                .insight_label("mlp")
                .build()?,
        ];
        Self::new(stages)
    }

    /// Replace the per-attempt timeout of every stage bound to `provider`.
    pub fn set_timeout(&mut self, provider: ProviderKind, timeout: Duration) {
        for stage in self.stages.iter_mut().filter(|s| s.provider == provider) {
            stage.timeout = Some(timeout);
        }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, id: u32) -> Result<&StageDefinition> {
        id.checked_sub(1)
            .and_then(|idx| self.stages.get(idx as usize))
            .ok_or(PipelineError::UnknownStage(id))
    }

    /// Id of the stage whose output is the final document.
    pub fn final_document_stage(&self) -> u32 {
        self.stages.len() as u32 - 1
    }

    /// Id of the stage whose output is the delivery plan.
    pub fn plan_stage(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Progress percentage once `completed` stages have finished.
    pub fn progress_pct(&self, completed: u32) -> u8 {
        let total = self.stages.len().max(1) as u32;
        ((completed.min(total) * 100) / total) as u8
    }
}
