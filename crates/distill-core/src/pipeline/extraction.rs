//! Unified extraction: one model call per unit yields every primitive kind.
//!
//! The model is asked for a JSON object of this shape:
//!
//! ```json
//! {
//!   "propositions": [{"id": "p1", "subject": "user", "statement": "...", "temporality": "future"}],
//!   "stances":      [{"proposition": "p1", "kind": "commitment", "confidence": 0.9}],
//!   "relations":    [{"from": "p1", "to": "p2", "kind": "causes"}],
//!   "entities":     [{"text": "Sarah", "type": "person"}]
//! }
//! ```
//!
//! Every list is optional. Items that do not fit are dropped individually.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, warn};

use super::context::ExtractionContext;
use crate::domain::{
    ConversationalUnit, EntityMention, EntityType, MentionId, ModelError, Primitives, Proposition,
    PropositionId, Relation, RelationId, Span, Stance, StanceId, StanceKind, Temporality,
    TokenUsage, UnitId,
};
use crate::ports::{CallOptions, ModelClient, Tier};

pub const UNIT_OPEN: &str = "<unit>";
pub const UNIT_CLOSE: &str = "</unit>";

pub const SYSTEM_PROMPT: &str = "You extract structured knowledge from one conversational \
unit. Reply with a single JSON object with the keys propositions, stances, relations and \
entities. Each proposition has an id, a subject and a self-contained statement. Each stance \
refers to a proposition id and has a kind (assertion, belief, commitment, desire, doubt, \
preference, question, emotion) and a confidence between 0 and 1. Entities are named people, \
organizations, places, projects, artifacts or events. Do not add commentary.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawExtraction {
    pub propositions: Vec<RawProposition>,
    pub stances: Vec<RawStance>,
    pub relations: Vec<RawRelation>,
    #[serde(alias = "mentions")]
    pub entities: Vec<RawMention>,
}

#[derive(Debug, Deserialize)]
pub struct RawProposition {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    pub statement: String,
    #[serde(default)]
    pub temporality: Temporality,
}

#[derive(Debug, Deserialize)]
pub struct RawStance {
    #[serde(alias = "proposition_id")]
    pub proposition: String,
    pub kind: StanceKind,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
pub struct RawRelation {
    pub from: String,
    pub to: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct RawMention {
    pub text: String,
    #[serde(default, rename = "type", alias = "entity_type")]
    pub entity_type: EntityType,
}

fn default_confidence() -> f32 {
    0.5
}

/// Pull the JSON object out of a model reply that may wrap it in code fences
/// or prose.
pub fn parse_response(content: &str) -> Result<RawExtraction, ModelError> {
    let start = content
        .find('{')
        .ok_or_else(|| ModelError::Malformed("no JSON object in response".into()))?;
    let end = content
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ModelError::Malformed("unterminated JSON object".into()))?;
    serde_json::from_str(&content[start..=end]).map_err(|e| ModelError::Malformed(e.to_string()))
}

impl RawExtraction {
    /// Assign ids and resolve the model's local proposition references.
    pub fn into_primitives(self, unit_id: UnitId) -> Primitives {
        let mut by_local: HashMap<String, PropositionId> = HashMap::new();
        let mut propositions = Vec::with_capacity(self.propositions.len());
        for raw in self.propositions {
            let statement = raw.statement.trim().to_string();
            if statement.is_empty() || by_local.contains_key(&raw.id) {
                warn!(unit_id = %unit_id, local_id = %raw.id, "dropping empty or duplicate proposition");
                continue;
            }
            let id = PropositionId::new();
            by_local.insert(raw.id.clone(), id);
            propositions.push(Proposition {
                id,
                unit_id,
                local_id: raw.id,
                subject: raw.subject.trim().to_string(),
                statement,
                temporality: raw.temporality,
            });
        }

        let stances = self
            .stances
            .into_iter()
            .filter_map(|raw| match by_local.get(&raw.proposition) {
                Some(&proposition_id) => Some(Stance {
                    id: StanceId::new(),
                    unit_id,
                    proposition_id,
                    kind: raw.kind,
                    confidence: raw.confidence.clamp(0.0, 1.0),
                }),
                None => {
                    warn!(unit_id = %unit_id, proposition = %raw.proposition, "stance refers to unknown proposition");
                    None
                }
            })
            .collect();

        let relations = self
            .relations
            .into_iter()
            .filter_map(|raw| {
                let from = by_local.get(&raw.from)?;
                let to = by_local.get(&raw.to)?;
                Some(Relation {
                    id: RelationId::new(),
                    unit_id,
                    from: *from,
                    to: *to,
                    kind: raw.kind,
                })
            })
            .collect();

        let mentions = self
            .entities
            .into_iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|raw| EntityMention {
                id: MentionId::new(),
                unit_id,
                text: raw.text.trim().to_string(),
                entity_type: raw.entity_type,
            })
            .collect();

        Primitives {
            propositions,
            stances,
            relations,
            mentions,
        }
    }
}

pub fn build_prompt(unit: &ConversationalUnit, text: &str, spans: &[Span], context: &ExtractionContext) -> String {
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str("Context:\n");
        prompt.push_str(&context.render());
    }
    if !spans.is_empty() {
        prompt.push_str("Detected cues:\n");
        for s in spans {
            prompt.push_str(&format!("- {:?}: \"{}\"\n", s.kind, s.text));
        }
        prompt.push('\n');
    }
    if let Some(speaker) = &unit.speaker {
        prompt.push_str(&format!("Speaker: {speaker}\n"));
    }
    prompt.push_str(UNIT_OPEN);
    prompt.push_str(text);
    prompt.push_str(UNIT_CLOSE);
    prompt.push('\n');
    prompt
}

/// What one extraction produced. `error` is set when the call or the parse
/// failed; the primitives are then empty.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub primitives: Primitives,
    pub tokens: TokenUsage,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

pub struct UnifiedExtractor {
    model: Arc<dyn ModelClient>,
    tier: Tier,
    options: CallOptions,
}

impl UnifiedExtractor {
    pub fn new(model: Arc<dyn ModelClient>, tier: Tier) -> Self {
        Self {
            model,
            tier,
            options: CallOptions {
                max_tokens: Some(1_024),
                temperature: Some(0.0),
                json: true,
            },
        }
    }

    /// Never fails: a transport or parse failure contributes nothing.
    pub async fn extract(
        &self,
        unit: &ConversationalUnit,
        text: &str,
        spans: &[Span],
        context: &ExtractionContext,
    ) -> ExtractionOutcome {
        let prompt = build_prompt(unit, text, spans, context);
        let started = Instant::now();
        let response = self
            .model
            .call(self.tier, &prompt, Some(SYSTEM_PROMPT), &self.options)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(unit_id = %unit.id, tier = %self.tier, error = %e, "extraction call failed");
                return ExtractionOutcome {
                    elapsed_ms,
                    error: Some(e.to_string()),
                    ..ExtractionOutcome::default()
                };
            }
        };

        match parse_response(&response.content) {
            Ok(raw) => {
                let primitives = raw.into_primitives(unit.id);
                debug!(
                    unit_id = %unit.id,
                    propositions = primitives.propositions.len(),
                    stances = primitives.stances.len(),
                    mentions = primitives.mentions.len(),
                    tokens = response.tokens_used.total,
                    "extraction parsed"
                );
                ExtractionOutcome {
                    primitives,
                    tokens: response.tokens_used,
                    elapsed_ms: response.processing_time_ms.max(elapsed_ms),
                    error: None,
                }
            }
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "extraction output malformed");
                ExtractionOutcome {
                    tokens: response.tokens_used,
                    elapsed_ms,
                    error: Some(e.to_string()),
                    ..ExtractionOutcome::default()
                }
            }
        }
    }
}
