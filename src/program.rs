//! # Classifier program
//!
//! A [ClassifierProgram] is the unit under optimization: an instruction, a list of demonstrations
//! and the invocation logic that turns a text into a [Prediction] whose label is guaranteed to be a
//! member of the program's [LabelSet].
//!
//! The program asks the model for its reasoning first and the label second, in one JSON object.
//! Replies are checked against the closed vocabulary; anything outside of it is a
//! [Error::MalformedOutput], never a prediction.

use std::fmt;

use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::example::{Example, LabelSet, Prediction};
use crate::filler::{Fill, FillPlaceholders, FillWith};
use crate::lm::{CompletionRequest, SharedModel};
use crate::prompt::{PartialPrompt, PromptTemplate};
use crate::utils::postprocess::json::{filter_to_json, str_field};

pub const DEFAULT_INSTRUCTION: &str =
    "Classify the customer's banking query into the single intent label that best describes what they need.";

/// Input and output fields of the program, in the order the model produces them.
pub const SIGNATURE: &str = "text -> reasoning, label";

const SYSTEM_TEMPLATE: &str = r#"{[instruction]}

Input: `text`, a message a customer sent to their bank.
Outputs: `reasoning`, where you think step by step about what the customer needs, then `label`.

`label` must be exactly one of these values:
{[labels]}
{[demos]}
Reply with a single JSON object and nothing else:
{"reasoning": "...", "label": "..."}"#;

const PROGRAM_PLACEHOLDERS: [&str; 3] = ["instruction", "labels", "demos"];

lazy_static! {
    static ref SYSTEM_PROMPT: PromptTemplate = PromptTemplate::new(SYSTEM_TEMPLATE);
}

/// Capability of exposing the configuration that shapes a program's prompt.
pub trait Describe {
    fn signature(&self) -> &str {
        SIGNATURE
    }
    fn instruction(&self) -> &str;
    fn demonstrations(&self) -> &[Example];
    fn label_set(&self) -> &LabelSet;
}

/// The persisted part of a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramState {
    pub instruction: String,
    #[serde(default)]
    pub demos: Vec<Example>,
}

#[derive(Clone)]
pub struct ClassifierProgram {
    labels: LabelSet,
    lm: SharedModel,
    instruction: String,
    demos: Vec<Example>,
}

impl ClassifierProgram {
    /// A base program: default instruction, no demonstrations.
    pub fn new(labels: LabelSet, lm: SharedModel) -> Self {
        Self {
            labels,
            lm,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            demos: Vec::new(),
        }
    }

    /// A new program sharing this one's labels and backend, with another configuration.
    pub fn with_configuration(&self, instruction: impl Into<String>, demos: Vec<Example>) -> Self {
        Self {
            labels: self.labels.clone(),
            lm: self.lm.clone(),
            instruction: instruction.into(),
            demos,
        }
    }

    /// The same configuration run by another backend.
    pub fn with_model(&self, lm: SharedModel) -> Self {
        Self { lm, ..self.clone() }
    }

    pub fn state(&self) -> ProgramState {
        ProgramState {
            instruction: self.instruction.clone(),
            demos: self.demos.clone(),
        }
    }

    /// Overlay a persisted configuration. Demonstrations must use labels of this program's vocabulary.
    pub fn with_state(&self, state: ProgramState) -> Result<Self> {
        if state.instruction.trim().is_empty() {
            return Err(Error::Prompt("program instruction is empty".to_string()));
        }
        if let Some(demo) = state.demos.iter().find(|d| !self.labels.contains(&d.label)) {
            return Err(Error::UnknownLabel(demo.label.clone()));
        }
        Ok(self.with_configuration(state.instruction, state.demos))
    }

    pub fn model(&self) -> &SharedModel {
        &self.lm
    }

    /// Classify one text. Every call reaches the backend.
    pub async fn classify(&self, text: &str) -> Result<Prediction> {
        let request = self.request_for(text)?;
        let reply = self.lm.complete(&request).await?;
        debug!("raw reply from {}: {}", self.lm.model_name(), reply);
        self.parse_reply(&reply)
    }

    /// The chat request sent for `text`.
    pub fn request_for(&self, text: &str) -> Result<CompletionRequest> {
        let mut prompt = SYSTEM_PROMPT.construct_prompt();
        self.fill(&mut prompt).map_err(|e| Error::Prompt(e.to_string()))?;
        let system = prompt.complete()?;
        Ok(CompletionRequest::new(system, format!("text: {}", text.trim())))
    }

    /// Turn a reply into a prediction whose label belongs to the label set.
    pub fn parse_reply(&self, reply: &str) -> Result<Prediction> {
        let malformed = |reason: String| Error::MalformedOutput {
            reason,
            reply: reply.to_string(),
        };
        // a bare label is acceptable output too
        if let Some(label) = self.labels.canonicalize(reply) {
            return Ok(Prediction {
                label: label.to_string(),
                reasoning: String::new(),
            });
        }
        let value = filter_to_json(reply).map_err(|e| malformed(e.to_string()))?;
        let raw_label = str_field(&value, "label").ok_or_else(|| malformed("no `label` field".to_string()))?;
        let label = self
            .labels
            .canonicalize(raw_label)
            .ok_or_else(|| malformed(format!("`{}` is not one of the allowed labels", raw_label)))?;
        Ok(Prediction {
            label: label.to_string(),
            reasoning: str_field(&value, "reasoning").unwrap_or_default().trim().to_string(),
        })
    }

    fn render_labels(&self) -> String {
        self.labels
            .iter()
            .map(|label| format!("- {}", label))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_demos(&self) -> String {
        if self.demos.is_empty() {
            return String::new();
        }
        let mut rendered = String::from("\nExamples:\n");
        for demo in &self.demos {
            let answer = match &demo.reasoning {
                Some(reasoning) => json!({"reasoning": reasoning, "label": demo.label}),
                None => json!({"label": demo.label}),
            };
            rendered.push_str(&format!("\ntext: {}\n{}\n", demo.text, answer));
        }
        rendered
    }
}

impl Describe for ClassifierProgram {
    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn demonstrations(&self) -> &[Example] {
        &self.demos
    }

    fn label_set(&self) -> &LabelSet {
        &self.labels
    }
}

impl FillPlaceholders for ClassifierProgram {
    fn placeholders_to_fill(&self) -> &[&'static str] {
        &PROGRAM_PLACEHOLDERS
    }
}

impl FillWith<()> for ClassifierProgram {
    fn fill_with(&self, partial_prompt: &mut PartialPrompt, context: ()) -> anyhow::Result<()> {
        partial_prompt
            .try_fill("instruction", self.instruction.as_str())?
            .try_fill("labels", self.render_labels())?
            .try_fill("demos", self.render_demos())?;
        Ok(context)
    }
}

impl fmt::Debug for ClassifierProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierProgram")
            .field("model", &self.lm.model_name())
            .field("labels", &self.labels.len())
            .field("instruction", &self.instruction)
            .field("demos", &self.demos.len())
            .finish()
    }
}
