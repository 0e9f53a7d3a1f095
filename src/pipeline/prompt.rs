//! Prompt assembly for one work item

use crate::config::PromptConfig;
use crate::worldbook::Worldbook;

const OUTPUT_FORMAT: &str = "Respond with a single JSON object and nothing else, shaped as \
{\"<category>\": {\"<entry name>\": {\"keywords\": [\"...\"], \"content\": \"...\"}}}. \
Entry names must be unique within a category.";

/// What the builder needs to know about the item being prompted.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    /// Zero-based position in the queue
    pub index: usize,
    /// Queue length at dispatch time
    pub total: usize,
    pub title: &'a str,
    pub content: &'a str,
    /// Accepted result of the nearest preceding done item
    pub previous: Option<&'a Worldbook>,
}

/// Builds prompts from global instructions, prior context and item content.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    config: PromptConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, input: &PromptInput<'_>) -> String {
        let mut prompt = String::with_capacity(input.content.len() + 1024);

        prompt.push_str(self.config.instructions.trim());
        prompt.push_str("\n\n");
        prompt.push_str(OUTPUT_FORMAT);
        prompt.push_str("\n\n");

        if self.config.include_previous_context {
            if let Some(previous) = input.previous.filter(|wb| !wb.is_empty()) {
                prompt.push_str("## Entries from the previous section\n");
                prompt.push_str(&self.summarize(previous));
                prompt.push_str(
                    "Reuse these entry names when the same subject appears again.\n\n",
                );
            }
        }

        if self.config.force_chapter_marker {
            let ordinal = input.index + 1;
            prompt.push_str(&format!(
                "## Chapter\nThis text is part {} of {} (\"{}\"). Attribute events in it to chapter {}.\n\n",
                ordinal, input.total, input.title, ordinal
            ));
        }

        prompt.push_str("## Text\n");
        prompt.push_str(input.content);
        prompt
    }

    /// One line per entry: category, name, keywords and a truncated content preview.
    pub fn summarize(&self, wb: &Worldbook) -> String {
        let mut out = String::new();
        let mut listed = 0;
        for (category, name, entry) in wb.entries() {
            if listed == self.config.max_summary_entries {
                let rest = wb.entry_count() - listed;
                out.push_str(&format!("- … and {} more\n", rest));
                break;
            }
            let preview: String = entry
                .content
                .chars()
                .take(self.config.summary_chars_per_entry)
                .collect();
            let ellipsis = if entry.content.chars().count() > self.config.summary_chars_per_entry {
                "…"
            } else {
                ""
            };
            let preview = preview.replace('\n', " ");
            if entry.keywords.is_empty() {
                out.push_str(&format!("- [{}] {}: {}{}\n", category, name, preview, ellipsis));
            } else {
                out.push_str(&format!(
                    "- [{}] {} ({}): {}{}\n",
                    category,
                    name,
                    entry.keywords.join(", "),
                    preview,
                    ellipsis
                ));
            }
            listed += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldbook::Entry;

    fn input<'a>(content: &'a str, previous: Option<&'a Worldbook>) -> PromptInput<'a> {
        PromptInput {
            index: 2,
            total: 5,
            title: "chunk3",
            content,
            previous,
        }
    }

    #[test]
    fn prompt_contains_instructions_and_content() {
        let builder = PromptBuilder::default();
        let prompt = builder.build(&input("Once upon a time", None));
        assert!(prompt.starts_with("Read the text below"));
        assert!(prompt.ends_with("## Text\nOnce upon a time"));
        assert!(!prompt.contains("previous section"));
        assert!(!prompt.contains("## Chapter"));
    }

    #[test]
    fn prompt_summarizes_previous_result() {
        let previous = Worldbook::new().with_entry(
            "Characters",
            "Alice",
            Entry::new(["Alice"], "x".repeat(300)),
        );
        let builder = PromptBuilder::default();
        let prompt = builder.build(&input("text", Some(&previous)));
        assert!(prompt.contains("- [Characters] Alice (Alice): "));
        assert!(prompt.contains('…'));
        assert!(!prompt.contains(&"x".repeat(121)));
    }

    #[test]
    fn chapter_marker_uses_one_based_ordinal() {
        let builder = PromptBuilder::new(PromptConfig {
            force_chapter_marker: true,
            ..PromptConfig::default()
        });
        let prompt = builder.build(&input("text", None));
        assert!(prompt.contains("part 3 of 5 (\"chunk3\")"));
        assert!(prompt.contains("chapter 3"));
    }

    #[test]
    fn summary_is_capped() {
        let mut wb = Worldbook::new();
        for i in 0..5 {
            wb.insert("C", format!("e{}", i), Entry::new([format!("e{}", i)], "c"));
        }
        let builder = PromptBuilder::new(PromptConfig {
            max_summary_entries: 2,
            ..PromptConfig::default()
        });
        let summary = builder.summarize(&wb);
        assert_eq!(summary.lines().count(), 3);
        assert!(summary.ends_with("- … and 3 more\n"));
    }
}
