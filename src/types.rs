use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-run accumulator of stage outputs.
///
/// Created at the start of a run and dropped when it returns. Outputs are
/// only ever appended, in ascending stage order, and only for stages that
/// succeeded.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub request_id: Uuid,
    pub original_idea: String,
    outputs: BTreeMap<u32, String>,
}

impl RunContext {
    pub fn new(original_idea: impl Into<String>) -> Self {
        Self::with_request_id(Uuid::new_v4(), original_idea)
    }

    pub fn with_request_id(request_id: Uuid, original_idea: impl Into<String>) -> Self {
        Self {
            request_id,
            original_idea: original_idea.into(),
            outputs: BTreeMap::new(),
        }
    }

    /// Output of a completed stage.
    pub fn output(&self, stage_id: u32) -> Option<&str> {
        self.outputs.get(&stage_id).map(|s| s.as_str())
    }

    /// Id of the most recently completed stage.
    pub fn last_completed(&self) -> Option<u32> {
        self.outputs.keys().next_back().copied()
    }

    pub fn completed(&self) -> usize {
        self.outputs.len()
    }

    /// Record a stage output. Ignored unless `stage_id` is past every
    /// stage already recorded, keeping the context append-only.
    pub(crate) fn record(&mut self, stage_id: u32, output: String) -> bool {
        if self.last_completed().is_some_and(|last| stage_id <= last) {
            return false;
        }
        self.outputs.insert(stage_id, output);
        true
    }
}

/// Result of executing a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: u32,
    pub name: String,
    pub persona: String,
    pub output: String,
    pub duration_ms: u64,
    /// Provider attempts spent, retries included.
    pub attempts: u32,
    pub error: Option<ErrorInfo>,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub request_id: Uuid,
    /// Synthesized PRFAQ document (second-to-last stage).
    pub final_document: String,
    /// Delivery plan (last stage).
    pub plan_document: String,
    pub per_stage: Vec<StageResult>,
    pub total_duration_ms: u64,
}

impl RunOutput {
    pub fn stage(&self, stage_id: u32) -> Option<&StageResult> {
        self.per_stage.iter().find(|r| r.stage_id == stage_id)
    }
}

/// One-sentence takeaway extracted from a completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub stage_id: u32,
    pub text: String,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_append_only() {
        let mut ctx = RunContext::new("idea");
        assert!(ctx.record(1, "one".into()));
        assert!(ctx.record(2, "two".into()));
        assert!(!ctx.record(2, "again".into()));
        assert!(!ctx.record(1, "rewrite".into()));
        assert_eq!(ctx.output(1), Some("one"));
        assert_eq!(ctx.output(2), Some("two"));
        assert_eq!(ctx.last_completed(), Some(2));
        assert_eq!(ctx.completed(), 2);
    }

    #[test]
    fn test_run_output_lookup() {
        let out = RunOutput {
            request_id: Uuid::nil(),
            final_document: "doc".into(),
            plan_document: "plan".into(),
            per_stage: vec![StageResult {
                stage_id: 4,
                name: "Refine Press Release".into(),
                persona: "Editor".into(),
                output: "pr".into(),
                duration_ms: 10,
                attempts: 1,
                error: None,
            }],
            total_duration_ms: 10,
        };
        assert!(out.stage(4).is_some_and(StageResult::is_success));
        assert!(out.stage(5).is_none());
    }
}
