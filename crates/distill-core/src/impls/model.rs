//! Model clients that need no network.
//!
//! - `ScriptedModelClient` replays queued replies and records every call.
//! - `RuleBasedModelClient` answers extraction prompts with simple
//!   heuristics, enough to drive the pipeline offline.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::domain::{ModelError, TokenUsage};
use crate::pipeline::context::estimate_tokens;
use crate::pipeline::extraction::{UNIT_CLOSE, UNIT_OPEN};
use crate::ports::{CallOptions, ModelClient, ModelResponse, Tier};

fn usage(prompt: &str, system: Option<&str>, content: &str) -> TokenUsage {
    let prompt_tokens = estimate_tokens(prompt) + system.map(estimate_tokens).unwrap_or(0);
    let completion = estimate_tokens(content);
    TokenUsage {
        prompt: prompt_tokens as u32,
        completion: completion as u32,
        total: (prompt_tokens + completion) as u32,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub tier: Tier,
    pub prompt: String,
    pub system_prompt: Option<String>,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<String, ModelError>>,
    fallback: Option<String>,
    calls: Vec<RecordedCall>,
}

#[derive(Default)]
pub struct ScriptedModelClient {
    script: Mutex<Script>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply used once the queue is empty. Without one, an empty queue is a
    /// transport error.
    pub fn with_fallback(self, reply: impl Into<String>) -> Self {
        self.lock().fallback = Some(reply.into());
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock().replies.push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: ModelError) {
        self.lock().replies.push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn call(
        &self,
        tier: Tier,
        prompt: &str,
        system_prompt: Option<&str>,
        _options: &CallOptions,
    ) -> Result<ModelResponse, ModelError> {
        let next = {
            let mut script = self.lock();
            script.calls.push(RecordedCall {
                tier,
                prompt: prompt.to_string(),
                system_prompt: system_prompt.map(str::to_string),
            });
            match script.replies.pop_front() {
                Some(next) => next,
                None => script
                    .fallback
                    .clone()
                    .ok_or_else(|| ModelError::Transport("script exhausted".into())),
            }
        };
        let content = next?;
        Ok(ModelResponse {
            tokens_used: usage(prompt, system_prompt, &content),
            content,
            processing_time_ms: 0,
        })
    }
}

/// Heuristic extractor: one proposition per sentence, a stance from cue
/// phrases, capitalized non-initial words as entity mentions.
pub struct RuleBasedModelClient {
    sentence: Regex,
    name: Regex,
    person_cue: Regex,
}

const NOT_NAMES: &[&str] = &[
    "I", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday", "January",
    "February", "March", "April", "May", "June", "July", "August", "September", "October",
    "November", "December", "Today", "Tomorrow", "Yesterday",
];

impl RuleBasedModelClient {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            sentence: Regex::new(r"[^.!?]+[.!?]?")?,
            name: Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b")?,
            person_cue: Regex::new(
                r"(?i)\b(?:manager|boss|colleague|friend|wife|husband|partner|mom|dad|sister|brother|mr\.?|ms\.?|mrs\.?|dr\.?)\s+$",
            )?,
        })
    }

    fn unit_text(prompt: &str) -> &str {
        let start = prompt.find(UNIT_OPEN).map(|i| i + UNIT_OPEN.len());
        let end = prompt.rfind(UNIT_CLOSE);
        match (start, end) {
            (Some(s), Some(e)) if e >= s => &prompt[s..e],
            _ => prompt,
        }
    }

    fn stance_of(sentence: &str) -> (&'static str, f32, &'static str) {
        let lower = sentence.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));
        if sentence.trim_end().ends_with('?') {
            ("question", 0.9, "current")
        } else if has(&["need to", "have to", "will ", "i'll", "going to", "must ", "promise"]) {
            ("commitment", 0.9, "future")
        } else if has(&["want", "wish", "hope", "would like"]) {
            ("desire", 0.8, "future")
        } else if has(&["prefer", "rather"]) {
            ("preference", 0.8, "current")
        } else if has(&["not sure", "doubt", "maybe", "might"]) {
            ("doubt", 0.6, "current")
        } else if has(&["i think", "i believe", "probably"]) {
            ("belief", 0.7, "current")
        } else if has(&["feel", "happy", "sad", "angry", "stressed", "worried"]) {
            ("emotion", 0.8, "current")
        } else {
            ("assertion", 0.8, "current")
        }
    }

    fn extract(&self, text: &str) -> serde_json::Value {
        let mut propositions = Vec::new();
        let mut stances = Vec::new();
        let mut entities: Vec<serde_json::Value> = Vec::new();
        let mut seen_names: Vec<String> = Vec::new();

        for (i, m) in self.sentence.find_iter(text).enumerate() {
            let sentence = m.as_str().trim();
            if sentence.is_empty() {
                continue;
            }
            let local = format!("p{}", i + 1);
            let starts_with_i = sentence.starts_with("I ") || sentence.starts_with("I'");
            let subject = if starts_with_i { "user" } else { "unknown" };
            let statement = sentence.trim_end_matches(['.', '!']).to_string();
            let (kind, confidence, temporality) = Self::stance_of(sentence);
            propositions.push(json!({
                "id": local,
                "subject": subject,
                "statement": statement,
                "temporality": temporality,
            }));
            stances.push(json!({ "proposition": local, "kind": kind, "confidence": confidence }));

            for name in self.name.find_iter(sentence) {
                // The first word of a sentence is capitalized anyway.
                if name.start() == 0 || NOT_NAMES.contains(&name.as_str()) {
                    continue;
                }
                let text = name.as_str().to_string();
                if seen_names.contains(&text) {
                    continue;
                }
                let kind = if self.person_cue.is_match(&sentence[..name.start()]) {
                    "person"
                } else {
                    "other"
                };
                seen_names.push(text.clone());
                entities.push(json!({ "text": text, "type": kind }));
            }
        }

        json!({
            "propositions": propositions,
            "stances": stances,
            "relations": [],
            "entities": entities,
        })
    }
}

#[async_trait]
impl ModelClient for RuleBasedModelClient {
    async fn call(
        &self,
        _tier: Tier,
        prompt: &str,
        system_prompt: Option<&str>,
        _options: &CallOptions,
    ) -> Result<ModelResponse, ModelError> {
        let content = self.extract(Self::unit_text(prompt)).to_string();
        Ok(ModelResponse {
            tokens_used: usage(prompt, system_prompt, &content),
            content,
            processing_time_ms: 0,
        })
    }
}
