use crate::{
    error::Result,
    parsing,
    prompt,
    types::RunContext,
    PipelineError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Which provider adapter a stage calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// General LLM chat completion.
    Chat,
    /// Web-grounded research.
    Research,
}

/// Where a placeholder's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The caller's original idea.
    Original,
    /// Output of an earlier stage.
    Stage(u32),
}

/// One `{placeholder}` and the value bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub placeholder: String,
    pub source: InputSource,
    /// Cut the value to this many characters (plus `...`).
    pub max_chars: Option<usize>,
}

impl InputBinding {
    pub fn original(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            source: InputSource::Original,
            max_chars: None,
        }
    }

    pub fn stage(placeholder: impl Into<String>, stage_id: u32) -> Self {
        Self {
            placeholder: placeholder.into(),
            source: InputSource::Stage(stage_id),
            max_chars: None,
        }
    }

    pub fn excerpt(mut self, max_chars: usize) -> Self {
        self.max_chars = Some(max_chars);
        self
    }
}

/// What the insight extractor does after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightMode {
    None,
    /// Summarize this stage's output.
    Summary,
    /// Summarize how this stage's output changed an earlier stage's output.
    Compare { before: u32 },
}

/// A stage's filled-in prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// A single stage in the pipeline. Immutable once built.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub id: u32,
    pub name: String,
    /// Role the model plays (e.g. "Market Analyst").
    pub persona: String,
    pub description: String,
    /// Status message shown while the provider call is in flight.
    pub activity: String,
    pub system_prompt: String,
    /// User prompt with `{placeholder}` slots, one per binding.
    pub prompt_template: String,
    pub bindings: Vec<InputBinding>,
    pub provider: ProviderKind,
    /// Per-attempt timeout. `None` uses the provider's default.
    pub timeout: Option<Duration>,
    pub insight: InsightMode,
    pub insight_label: Option<String>,
}

impl StageDefinition {
    pub fn builder(id: u32, name: impl Into<String>) -> StageBuilder {
        StageBuilder::new(id, name)
    }

    /// Earlier stage ids this stage reads from, ascending and distinct.
    pub fn dependencies(&self) -> Vec<u32> {
        let mut deps: Vec<u32> = self
            .bindings
            .iter()
            .filter_map(|b| match b.source {
                InputSource::Stage(id) => Some(id),
                InputSource::Original => None,
            })
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Resolve every binding against `ctx`.
    pub fn inputs(&self, ctx: &RunContext) -> Result<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        for binding in &self.bindings {
            let value = match binding.source {
                InputSource::Original => ctx.original_idea.as_str(),
                InputSource::Stage(id) if id < self.id => {
                    ctx.output(id).ok_or_else(|| PipelineError::MissingInput {
                        stage_id: self.id,
                        placeholder: binding.placeholder.clone(),
                    })?
                }
                InputSource::Stage(id) => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "stage {} reads from stage {} which does not run before it",
                        self.id, id
                    )))
                }
            };
            let value = match binding.max_chars {
                Some(n) => parsing::excerpt(value, n),
                None => value.to_string(),
            };
            vars.insert(binding.placeholder.clone(), value);
        }
        Ok(vars)
    }

    /// Fill the user prompt from `ctx`. Same template and context always
    /// produce the same prompt.
    pub fn render(&self, ctx: &RunContext) -> Result<RenderedPrompt> {
        let vars = self.inputs(ctx)?;
        let user = prompt::render(&self.prompt_template, &vars).map_err(|unbound| {
            PipelineError::MissingInput {
                stage_id: self.id,
                placeholder: unbound.0,
            }
        })?;
        Ok(RenderedPrompt {
            system: self.system_prompt.clone(),
            user,
        })
    }
}

/// Builder for creating stages with validation.
pub struct StageBuilder {
    stage: StageDefinition,
}

impl StageBuilder {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            stage: StageDefinition {
                id,
                name: name.into(),
                persona: String::new(),
                description: String::new(),
                activity: String::new(),
                system_prompt: String::new(),
                prompt_template: String::new(),
                bindings: Vec::new(),
                provider: ProviderKind::Chat,
                timeout: None,
                insight: InsightMode::Summary,
                insight_label: None,
            },
        }
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.stage.persona = persona.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.stage.description = description.into();
        self
    }

    pub fn activity(mut self, activity: impl Into<String>) -> Self {
        self.stage.activity = activity.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.stage.system_prompt = prompt.into();
        self
    }

    pub fn prompt(mut self, template: impl Into<String>) -> Self {
        self.stage.prompt_template = template.into();
        self
    }

    pub fn input(mut self, binding: InputBinding) -> Self {
        self.stage.bindings.push(binding);
        self
    }

    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.stage.provider = provider;
        self
    }

    pub fn research(self) -> Self {
        self.provider(ProviderKind::Research)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.stage.timeout = Some(timeout);
        self
    }

    pub fn insight(mut self, mode: InsightMode) -> Self {
        self.stage.insight = mode;
        self
    }

    pub fn insight_label(mut self, label: impl Into<String>) -> Self {
        self.stage.insight_label = Some(label.into());
        self
    }

    /// Validate the stage on its own. Cross-stage checks live in
    /// [`StageRegistry::new`](crate::registry::StageRegistry::new).
    pub fn build(self) -> Result<StageDefinition> {
        let stage = self.stage;
        if stage.id == 0 {
            return Err(PipelineError::InvalidConfig(
                "Stage ids start at 1".to_string(),
            ));
        }
        if stage.prompt_template.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "Stage {} prompt template cannot be empty",
                stage.id
            )));
        }

        let mut declared: Vec<&str> = Vec::new();
        for binding in &stage.bindings {
            if declared.contains(&binding.placeholder.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Stage {} binds '{{{}}}' twice",
                    stage.id, binding.placeholder
                )));
            }
            declared.push(&binding.placeholder);
        }

        let used = prompt::placeholders(&stage.prompt_template);
        if let Some(missing) = used.iter().find(|p| !declared.contains(&p.as_str())) {
            return Err(PipelineError::MissingInput {
                stage_id: stage.id,
                placeholder: missing.clone(),
            });
        }
        if let Some(unused) = declared.iter().find(|d| !used.iter().any(|u| u == *d)) {
            return Err(PipelineError::InvalidConfig(format!(
                "Stage {} declares '{{{}}}' but its template never uses it",
                stage.id, unused
            )));
        }

        if let InsightMode::Compare { before } = stage.insight {
            if before >= stage.id {
                return Err(PipelineError::InvalidConfig(format!(
                    "Stage {} compares against stage {} which does not run before it",
                    stage.id, before
                )));
            }
        }

        Ok(stage)
    }
}
