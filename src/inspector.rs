//! # Prompt inspector
//!
//! Renders what a program will tell the model, and compares two programs line by line.

use lazy_static::lazy_static;
use log::warn;
use similar::{capture_diff_slices, Algorithm, DiffOp};

use crate::filler::{Fill, FillPlaceholders, FillWith};
use crate::program::Describe;
use crate::prompt::{PartialPrompt, PromptTemplate};
use crate::utils::token::CountToken;

const DESCRIPTION_TEMPLATE: &str = "Signature: {[signature]}

Instruction:
{[instruction]}

Labels ({[label_count]}):
{[labels]}

Demonstrations ({[demo_count]}):
{[demos]}";

const DESCRIPTION_PLACEHOLDERS: [&str; 6] = ["signature", "instruction", "label_count", "labels", "demo_count", "demos"];

lazy_static! {
    static ref DESCRIPTION: PromptTemplate = PromptTemplate::new(DESCRIPTION_TEMPLATE);
}

/// Fills the description template from anything that can [Describe] itself.
struct DescriptionFiller<'a, D: Describe + ?Sized>(&'a D);

impl<D: Describe + ?Sized> FillPlaceholders for DescriptionFiller<'_, D> {
    fn placeholders_to_fill(&self) -> &[&'static str] {
        &DESCRIPTION_PLACEHOLDERS
    }
}

impl<D: Describe + ?Sized> FillWith<()> for DescriptionFiller<'_, D> {
    fn fill_with(&self, partial_prompt: &mut PartialPrompt, context: ()) -> anyhow::Result<()> {
        let program = self.0;
        let labels = program.label_set().iter().collect::<Vec<_>>().join(", ");
        let demos = if program.demonstrations().is_empty() {
            "(none)".to_string()
        } else {
            program
                .demonstrations()
                .iter()
                .enumerate()
                .map(|(i, demo)| match &demo.reasoning {
                    Some(reasoning) => format!("{}. {} -> {}\n   reasoning: {}", i + 1, demo.text, demo.label, reasoning),
                    None => format!("{}. {} -> {}", i + 1, demo.text, demo.label),
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        partial_prompt
            .try_fill("signature", program.signature())?
            .try_fill("instruction", program.instruction())?
            .try_fill("label_count", program.label_set().len().to_string())?
            .try_fill("labels", labels)?
            .try_fill("demo_count", program.demonstrations().len().to_string())?
            .try_fill("demos", demos)?;
        Ok(context)
    }
}

/// Human-readable rendering of a program's configuration.
///
/// Never fails: a rendering problem comes back as an `Error extracting prompt: ...` text.
pub fn extract_prompt<D: Describe + ?Sized>(program: &D) -> String {
    let mut prompt = DESCRIPTION.construct_prompt();
    let rendered = DescriptionFiller(program)
        .fill(&mut prompt)
        .and_then(|_| Ok(prompt.complete()?));
    match rendered {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to render program description: {}", e);
            format!("Error extracting prompt: {}", e)
        }
    }
}

/// Tokens of the rendered description of `program`.
pub fn token_count<D: Describe + ?Sized>(program: &D, counter: &impl CountToken) -> usize {
    counter.count_token(&extract_prompt(program))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Equal,
    /// Only in the second text.
    Inserted,
    /// Only in the first text.
    Deleted,
    /// Replaced: the first text's line on the left, the second's on the right.
    Changed,
}

impl DiffKind {
    pub fn marker(&self) -> &'static str {
        match self {
            DiffKind::Equal => "  ",
            DiffKind::Inserted => "+ ",
            DiffKind::Deleted => "- ",
            DiffKind::Changed => "~ ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub kind: DiffKind,
    pub left: Option<String>,
    pub right: Option<String>,
}

impl DiffRow {
    fn new(kind: DiffKind, left: Option<&str>, right: Option<&str>) -> Self {
        Self {
            kind,
            left: left.map(String::from),
            right: right.map(String::from),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptDiff {
    pub rows: Vec<DiffRow>,
}

impl PromptDiff {
    pub fn is_identical(&self) -> bool {
        self.rows.iter().all(|row| row.kind == DiffKind::Equal)
    }

    /// Rows of one kind.
    pub fn rows_of(&self, kind: DiffKind) -> impl Iterator<Item = &DiffRow> {
        self.rows.iter().filter(move |row| row.kind == kind)
    }

    /// One line per row, prefixed with its marker. A changed row shows both versions.
    pub fn render_inline(&self) -> String {
        let mut out = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let marker = row.kind.marker();
            match row.kind {
                DiffKind::Equal | DiffKind::Deleted => out.push(format!("{}{}", marker, row.left.as_deref().unwrap_or(""))),
                DiffKind::Inserted => out.push(format!("{}{}", marker, row.right.as_deref().unwrap_or(""))),
                DiffKind::Changed => {
                    out.push(format!("{}{}", marker, row.left.as_deref().unwrap_or("")));
                    out.push(format!("{}{}", marker, row.right.as_deref().unwrap_or("")));
                }
            }
        }
        out.join("\n")
    }

    /// Two columns, the first text on the left.
    pub fn render_side_by_side(&self) -> String {
        let width = self
            .rows
            .iter()
            .filter_map(|row| row.left.as_deref())
            .map(|line| line.chars().count())
            .max()
            .unwrap_or(0);
        self.rows
            .iter()
            .map(|row| {
                let left = row.left.as_deref().unwrap_or("");
                let right = row.right.as_deref().unwrap_or("");
                format!("{}{:<width$} | {}", row.kind.marker(), left, right, width = width)
                    .trim_end()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Line diff of `a` against `b`.
pub fn diff(a: &str, b: &str) -> PromptDiff {
    let old: Vec<&str> = a.lines().collect();
    let new: Vec<&str> = b.lines().collect();
    let mut rows = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &old, &new) {
        match op {
            DiffOp::Equal { old_index, len, .. } => {
                rows.extend(old[old_index..old_index + len].iter().map(|l| DiffRow::new(DiffKind::Equal, Some(l), Some(l))));
            }
            DiffOp::Delete { old_index, old_len, .. } => {
                rows.extend(old[old_index..old_index + old_len].iter().map(|l| DiffRow::new(DiffKind::Deleted, Some(l), None)));
            }
            DiffOp::Insert { new_index, new_len, .. } => {
                rows.extend(new[new_index..new_index + new_len].iter().map(|l| DiffRow::new(DiffKind::Inserted, None, Some(l))));
            }
            DiffOp::Replace { old_index, old_len, new_index, new_len } => {
                let old_lines = &old[old_index..old_index + old_len];
                let new_lines = &new[new_index..new_index + new_len];
                let paired = old_len.min(new_len);
                for i in 0..paired {
                    rows.push(DiffRow::new(DiffKind::Changed, Some(old_lines[i]), Some(new_lines[i])));
                }
                rows.extend(old_lines[paired..].iter().map(|l| DiffRow::new(DiffKind::Deleted, Some(l), None)));
                rows.extend(new_lines[paired..].iter().map(|l| DiffRow::new(DiffKind::Inserted, None, Some(l))));
            }
        }
    }
    PromptDiff { rows }
}

/// Diff of the rendered descriptions of two programs.
pub fn compare<A: Describe + ?Sized, B: Describe + ?Sized>(a: &A, b: &B) -> PromptDiff {
    diff(&extract_prompt(a), &extract_prompt(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::{Example, LabelSet};

    struct Fixed {
        instruction: &'static str,
        demos: Vec<Example>,
        labels: LabelSet,
    }

    impl Describe for Fixed {
        fn instruction(&self) -> &str {
            self.instruction
        }

        fn demonstrations(&self) -> &[Example] {
            &self.demos
        }

        fn label_set(&self) -> &LabelSet {
            &self.labels
        }
    }

    fn fixed(instruction: &'static str, demos: Vec<Example>) -> Fixed {
        Fixed {
            instruction,
            demos,
            labels: LabelSet::new(["card_arrival", "card_swallowed"]),
        }
    }

    #[test]
    fn test_extract_prompt() {
        let program = fixed(
            "Pick the intent.",
            vec![Example::new("ATM kept my card", "card_swallowed").with_reasoning(Some("machine"))],
        );
        let text = extract_prompt(&program);
        assert!(text.starts_with("Signature: text -> reasoning, label"));
        assert!(text.contains("Pick the intent."));
        assert!(text.contains("Labels (2):\ncard_arrival, card_swallowed"));
        assert!(text.contains("1. ATM kept my card -> card_swallowed\n   reasoning: machine"));

        let empty = extract_prompt(&fixed("Pick.", Vec::new()));
        assert!(empty.contains("Demonstrations (0):\n(none)"));
    }

    #[test]
    fn test_placeholder_text_in_configuration_is_kept() {
        let text = extract_prompt(&fixed("Reply with {[labels]} only.", Vec::new()));
        assert!(text.contains("Reply with {[labels]} only."));
    }

    #[test]
    fn test_lines_only_in_first_program_are_deleted() {
        let a = fixed("Pick the intent.", vec![Example::new("ATM kept my card", "card_swallowed")]);
        let b = fixed("Pick the intent.", Vec::new());
        let diff = compare(&a, &b);
        assert!(!diff.is_identical());
        assert!(diff
            .rows_of(DiffKind::Deleted)
            .chain(diff.rows_of(DiffKind::Changed))
            .any(|row| row.left.as_deref() == Some("1. ATM kept my card -> card_swallowed")));
        assert!(diff.render_inline().contains("1. ATM kept my card -> card_swallowed"));
    }

    #[test]
    fn test_diff_kinds_and_rendering() {
        let diff = diff("same\nold line\ngone\nsame again", "same\nnew line\nsame again\nadded");
        let kinds: Vec<DiffKind> = diff.rows.iter().map(|r| r.kind).collect();
        assert_eq!(
            vec![DiffKind::Equal, DiffKind::Changed, DiffKind::Deleted, DiffKind::Equal, DiffKind::Inserted],
            kinds
        );
        assert_eq!(
            "  same\n~ old line\n~ new line\n- gone\n  same again\n+ added",
            diff.render_inline()
        );
        let side = diff.render_side_by_side();
        assert_eq!("  same       | same", side.lines().next().unwrap());
        assert_eq!("+            | added", side.lines().last().unwrap());
    }

    #[test]
    fn test_identical() {
        assert!(diff("a\nb", "a\nb").is_identical());
    }

    #[test]
    fn test_token_count() {
        let program = fixed("Pick the intent.", Vec::new());
        assert_eq!(
            extract_prompt(&program).split_whitespace().count(),
            token_count(&program, &crate::utils::token::count_tokens_by_words)
        );
    }
}
