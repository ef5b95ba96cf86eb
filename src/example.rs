//! # Examples and labels
//!
//! [LabelSet] is the closed classification vocabulary. [Example] is a labeled text, used both as
//! training/evaluation data and as a feedback record. [Prediction] is what a program returns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An ordered, immutable set of labels. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Arc<Vec<String>>,
    index: Arc<HashMap<String, usize>>,
}

impl LabelSet {
    /// Build a label set, dropping duplicates while keeping the first occurrence order.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut index = HashMap::new();
        for label in labels {
            let label = label.into();
            if !index.contains_key(&label) {
                index.insert(label.clone(), ordered.len());
                ordered.push(label);
            }
        }
        Self {
            labels: Arc::new(ordered),
            index: Arc::new(index),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// Label for a class index, as used by corpora that store labels as integers.
    pub fn name(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }

    /// Map a free-form label onto the vocabulary.
    ///
    /// Exact matches win. Otherwise surrounding quotes, backticks and whitespace are stripped and the
    /// comparison ignores ASCII case and treats spaces/dashes as underscores.
    pub fn canonicalize(&self, raw: &str) -> Option<&str> {
        if let Some(&idx) = self.index.get(raw) {
            return self.name(idx);
        }
        let wanted = normalize(raw);
        if wanted.is_empty() {
            return None;
        }
        self.labels
            .iter()
            .find(|label| normalize(label) == wanted)
            .map(String::as_str)
    }

    /// Like [LabelSet::canonicalize] but fails with [Error::UnknownLabel].
    pub fn require(&self, raw: &str) -> Result<&str> {
        self.canonicalize(raw)
            .ok_or_else(|| Error::UnknownLabel(raw.to_string()))
    }
}

fn normalize(label: &str) -> String {
    label
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// A labeled text. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[readonly::make]
pub struct Example {
    pub text: String,
    pub label: String,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Example {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
            reasoning: None,
        }
    }

    /// Attach a justification. Blank reasoning is stored as `None`.
    pub fn with_reasoning(mut self, reasoning: Option<impl Into<String>>) -> Self {
        self.reasoning = reasoning
            .map(Into::into)
            .filter(|r: &String| !r.trim().is_empty());
        self
    }
}

/// The output of a program on one text. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub reasoning: String,
}
