//! Token-budgeted extraction context.
//!
//! Token counts are approximated from whitespace-separated words
//! (~4 tokens per 3 words); nothing here needs a real tokenizer.

use crate::app::config::PipelineConfig;
use crate::domain::{Claim, Entity, Proposition};

/// Rough token estimate for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 4).div_ceil(3)
}

fn words_for_tokens(tokens: usize) -> usize {
    tokens * 3 / 4
}

/// Keep at most `max_words` trailing words of `text`. The tail is kept because
/// the most recent part of a session summary matters most.
pub fn truncate_to_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return words.join(" ");
    }
    words[words.len() - max_words..].join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    pub total_tokens: usize,
    pub summary_fraction: f64,
    pub max_claims: usize,
    pub max_entities: usize,
    pub max_propositions: usize,
}

impl From<&PipelineConfig> for ContextBudget {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            total_tokens: config.context_budget_tokens,
            summary_fraction: config.summary_fraction,
            max_claims: config.max_recent_claims,
            max_entities: config.max_entities,
            max_propositions: config.max_recent_propositions,
        }
    }
}

/// Recent context handed to the extractor alongside the unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionContext {
    pub summary: Option<String>,
    pub claims: Vec<Claim>,
    pub entities: Vec<Entity>,
    pub propositions: Vec<Proposition>,
}

impl ContextBudget {
    /// Tokens the summary may use once the unit text is accounted for.
    pub fn summary_allowance(&self, unit_text: &str) -> usize {
        let fixed = (self.total_tokens as f64 * self.summary_fraction.clamp(0.0, 1.0)) as usize;
        let remaining = self.total_tokens.saturating_sub(estimate_tokens(unit_text));
        fixed.min(remaining)
    }

    pub fn assemble(
        &self,
        unit_text: &str,
        summary: Option<String>,
        mut claims: Vec<Claim>,
        mut entities: Vec<Entity>,
        mut propositions: Vec<Proposition>,
    ) -> ExtractionContext {
        let max_words = words_for_tokens(self.summary_allowance(unit_text));
        let summary = summary
            .map(|s| truncate_to_words(&s, max_words))
            .filter(|s| !s.is_empty());

        claims.truncate(self.max_claims);
        // Most-referenced entities are the likeliest to be mentioned again.
        entities.sort_by(|a, b| {
            b.mention_count
                .cmp(&a.mention_count)
                .then(b.last_referenced_at.cmp(&a.last_referenced_at))
        });
        entities.truncate(self.max_entities);
        propositions.truncate(self.max_propositions);

        ExtractionContext {
            summary,
            claims,
            entities,
            propositions,
        }
    }
}

impl ExtractionContext {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.claims.is_empty()
            && self.entities.is_empty()
            && self.propositions.is_empty()
    }

    /// Plain-text rendering for the prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.summary {
            out.push_str("Summary so far:\n");
            out.push_str(summary);
            out.push_str("\n\n");
        }
        if !self.entities.is_empty() {
            out.push_str("Known entities:\n");
            for e in &self.entities {
                out.push_str(&format!("- {} ({:?})", e.canonical_name, e.entity_type));
                if !e.aliases.is_empty() {
                    let aliases: Vec<&str> = e.aliases.iter().map(String::as_str).collect();
                    out.push_str(&format!(" aka {}", aliases.join(", ")));
                }
                out.push('\n');
            }
            out.push('\n');
        }
        if !self.claims.is_empty() {
            out.push_str("Recent claims:\n");
            for c in &self.claims {
                out.push_str(&format!("- [{:?}] {}: {}\n", c.stance, c.subject, c.statement));
            }
            out.push('\n');
        }
        if !self.propositions.is_empty() {
            out.push_str("Recent propositions:\n");
            for p in &self.propositions {
                out.push_str(&format!("- {}: {}\n", p.subject, p.statement));
            }
            out.push('\n');
        }
        out
    }
}
