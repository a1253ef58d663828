//! Deterministic span detection. No model call is involved.

use regex::{Regex, RegexBuilder};

use crate::domain::{Span, SpanId, SpanKind, UnitId};

const WEEKDAY: &str = "monday|tuesday|wednesday|thursday|friday|saturday|sunday";
const MONTH: &str =
    "january|february|march|april|may|june|july|august|september|october|november|december";

fn patterns() -> Vec<(SpanKind, String)> {
    vec![
        (
            SpanKind::Deadline,
            format!(
                r"\b(?:by|before|until|due(?:\s+on)?|no later than)\s+(?:(?:next|this)\s+)?(?:{WEEKDAY}|{MONTH}\s+\d{{1,2}}(?:st|nd|rd|th)?|tomorrow|tonight|today|end of (?:the\s+)?(?:day|week|month|quarter|year)|eod|eow|noon|midnight|\d{{1,2}}(?::\d{{2}})?\s*(?:am|pm)|\d{{1,2}}/\d{{1,2}}(?:/\d{{2,4}})?|\d{{4}}-\d{{2}}-\d{{2}})\b"
            ),
        ),
        (
            SpanKind::Commitment,
            r"\b(?:i|we)(?:'ll|\s+will|\s+need to|\s+have to|\s+must|\s+am going to|\s+are going to|\s+promise to|\s+plan to|\s+should)\b"
                .to_string(),
        ),
        (SpanKind::Question, r"[^.!?]*\?".to_string()),
        (
            SpanKind::Negation,
            r"\b(?:not|never|no|nobody|nothing|don't|doesn't|didn't|won't|can't|cannot|isn't|aren't|wasn't|weren't|shouldn't)\b"
                .to_string(),
        ),
        (
            SpanKind::Temporal,
            format!(
                r"\b(?:yesterday|today|tomorrow|tonight|(?:next|last|this)\s+(?:week|month|year|{WEEKDAY})|{WEEKDAY}|{MONTH}|\d{{4}}-\d{{2}}-\d{{2}})\b"
            ),
        ),
        (
            SpanKind::Money,
            r"(?:[$€£]\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:k|m|bn|million|billion)\b)?|\b\d[\d,]*(?:\.\d+)?\s?(?:dollars|euros|pounds|usd|eur|gbp)\b)"
                .to_string(),
        ),
        (
            SpanKind::Emotion,
            r"\b(?:happy|sad|angry|frustrated|excited|worried|anxious|stressed|afraid|scared|love|hate|glad|upset|nervous|thrilled|disappointed)\b"
                .to_string(),
        ),
        (
            SpanKind::Uncertainty,
            r"\b(?:maybe|perhaps|probably|possibly|might|not sure|unsure|i think|i guess)\b"
                .to_string(),
        ),
    ]
}

/// Trim and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compiled rule set.
pub struct SpanDetector {
    rules: Vec<(SpanKind, Regex)>,
}

impl SpanDetector {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = patterns()
            .into_iter()
            .map(|(kind, pattern)| {
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (kind, re))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Spans over `text`, which should already be normalized. Offsets are in
    /// chars. Sorted by start offset.
    pub fn detect(&self, unit_id: UnitId, text: &str) -> Vec<Span> {
        let mut spans = Vec::new();
        for (kind, re) in &self.rules {
            for m in re.find_iter(text) {
                let matched = m.as_str().trim();
                if matched.is_empty() {
                    continue;
                }
                // Leading whitespace of the match (question sentences) is not part of the span.
                let lead = m.as_str().len() - m.as_str().trim_start().len();
                let start = text[..m.start() + lead].chars().count();
                spans.push(Span {
                    id: SpanId::new(),
                    unit_id,
                    kind: *kind,
                    start,
                    end: start + matched.chars().count(),
                    text: matched.to_string(),
                });
            }
        }
        spans.sort_by_key(|s| (s.start, s.end));
        spans
    }
}
