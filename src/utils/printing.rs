//! Markdown rendering of predictions, programs and diffs for a terminal.

use std::io::{stdout, Write};

use termimad::crossterm::style::Color;
use termimad::{FmtText, MadSkin};

use crate::example::Prediction;
use crate::inspector::{DiffKind, PromptDiff};

/// Renders markdown with a skin that marks insertions green, deletions red and changes yellow.
pub struct MarkdownPrinter {
    pub skin: MadSkin,
    pub wrap_width: Option<usize>,
}

impl Default for MarkdownPrinter {
    fn default() -> Self {
        let mut skin = MadSkin::default();
        skin.bold.set_fg(Color::Green);
        skin.strikeout.set_fg(Color::Red);
        skin.italic.set_fg(Color::Yellow);
        skin.inline_code.set_fg(Color::Cyan);
        Self {
            skin,
            wrap_width: None,
        }
    }
}

impl MarkdownPrinter {
    pub fn render(&self, markdown: &str) -> String {
        format!("{}", FmtText::from(&self.skin, markdown, self.wrap_width))
    }

    pub fn print(&self, markdown: &str) -> std::io::Result<()> {
        let mut out = stdout();
        write!(out, "{}", self.render(markdown))?;
        out.flush()
    }

    pub fn print_prediction(&self, prediction: &Prediction) -> std::io::Result<()> {
        self.print(&prediction_markdown(prediction))
    }

    pub fn print_diff(&self, diff: &PromptDiff) -> std::io::Result<()> {
        self.print(&diff_markdown(diff))
    }
}

pub fn prediction_markdown(prediction: &Prediction) -> String {
    let mut markdown = format!("**Predicted Intent:** `{}`\n", prediction.label);
    if !prediction.reasoning.is_empty() {
        markdown.push_str(&format!("\n**Reasoning:** {}\n", escape(&prediction.reasoning)));
    }
    markdown
}

/// Inline diff, one markdown line per row.
pub fn diff_markdown(diff: &PromptDiff) -> String {
    let mut lines = Vec::with_capacity(diff.rows.len());
    for row in &diff.rows {
        let left = row.left.as_deref().map(escape).unwrap_or_default();
        let right = row.right.as_deref().map(escape).unwrap_or_default();
        let line = match row.kind {
            DiffKind::Equal => format!("`  ` {}", left),
            DiffKind::Deleted => format!("`- ` ~~{}~~", left),
            DiffKind::Inserted => format!("`+ ` **{}**", right),
            DiffKind::Changed => format!("`~ ` ~~{}~~ *{}*", left, right),
        };
        lines.push(line);
    }
    lines.join("\n") + "\n"
}

fn escape(text: &str) -> String {
    text.chars()
        .fold(String::with_capacity(text.len()), |mut out, c| {
            if matches!(c, '*' | '~' | '`' | '_' | '|' | '#') {
                out.push('\\');
            }
            out.push(c);
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::diff;

    #[test]
    fn test_prediction_markdown() {
        let prediction = Prediction {
            label: "card_swallowed".to_string(),
            reasoning: "The ATM kept it".to_string(),
        };
        let markdown = prediction_markdown(&prediction);
        assert!(markdown.starts_with("**Predicted Intent:** `card_swallowed`"));
        assert!(markdown.contains("The ATM kept it"));
    }

    #[test]
    fn test_diff_markdown_escapes() {
        let markdown = diff_markdown(&diff("a_b\nsame", "same\n*new*"));
        assert!(markdown.contains("~~a\\_b~~"));
        assert!(markdown.contains("**\\*new\\***"));
    }

    #[test]
    fn test_render_keeps_text() {
        let printer = MarkdownPrinter::default();
        assert!(printer.render("**Predicted Intent:** `card_arrival`").contains("card_arrival"));
    }
}
