//! Stage handlers: one per task type.
//!
//! Each handler reads the unit and earlier artifacts from the knowledge store,
//! writes its own artifacts, records the unit's stage and emits the event that
//! wires up the next stage. Re-running a handler for the same unit is safe.
//! Spans and primitives are overwritten rather than appended. Checkpoints
//! guard the non-idempotent steps within a task, and a unit whose claims
//! already exist is never resolved or derived again.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::context::ContextBudget;
use super::dedup::dedup_mentions;
use super::derive::derive_claims;
use super::extraction::UnifiedExtractor;
use super::observers::{DormancyObserver, Observer, ObserverReport, SupersessionObserver};
use super::resolve::{apply_resolution, resolve_mentions};
use super::spans::{SpanDetector, normalize_text};
use crate::app::config::PipelineConfig;
use crate::domain::{
    Checkpoint, ConversationalUnit, EventData, HandlerError, PipelineEvent, PipelineStage,
    Primitives, TaskType, TokenUsage, UnitId, UnitSummary,
};
use crate::ports::ModelClient;
use crate::typed::{Handler, TaskContext, TaskHandler, TaskPayload, TypedHandler};

macro_rules! unit_task {
    ($(#[$meta:meta])* $name:ident => $task_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub unit_id: UnitId,
            pub session_id: String,
            /// Data of the event that created this task, if any.
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub trigger: Option<EventData>,
        }

        impl $name {
            pub fn new(unit_id: UnitId, session_id: impl Into<String>) -> Self {
                Self {
                    unit_id,
                    session_id: session_id.into(),
                    trigger: None,
                }
            }
        }

        impl TaskPayload for $name {
            const TYPE: TaskType = $task_type;
        }
    };
}

unit_task!(PreprocessTask => TaskType::Preprocess);
unit_task!(ExtractTask => TaskType::Extract);
unit_task!(ResolveAndDeriveTask => TaskType::ResolveAndDerive);
unit_task!(
    /// Final stage; marks the unit processed.
    RunObserversTask => TaskType::RunObservers
);

const STEP_PRIMITIVES: &str = "primitives_stored";
const STEP_ENTITIES: &str = "entities_resolved";
const STEP_CLAIMS: &str = "claims_stored";

fn reached(checkpoint: Option<&Checkpoint>, step: &str) -> bool {
    checkpoint.is_some_and(|c| c.step == step || c.is_done(step))
}

async fn load_unit(ctx: &TaskContext, id: UnitId) -> Result<ConversationalUnit, HandlerError> {
    ctx.knowledge()
        .get_unit(id)
        .await?
        .ok_or_else(|| HandlerError::other(format!("unit {id} not found")))
}

pub struct PreprocessHandler {
    detector: SpanDetector,
}

impl PreprocessHandler {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            detector: SpanDetector::new()?,
        })
    }

    #[instrument(name = "preprocess", skip_all, fields(unit_id = %task.unit_id, task_id = %ctx.task_id()))]
    async fn run(&self, task: PreprocessTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        let unit = load_unit(ctx, task.unit_id).await?;
        let store = ctx.knowledge();

        let count = if store.has_spans(unit.id).await? {
            store.spans_for_unit(unit.id).await?.len()
        } else {
            let spans = self.detector.detect(unit.id, &normalize_text(&unit.text));
            let n = spans.len();
            store.put_spans(unit.id, spans).await?;
            n
        };
        store.set_unit_stage(unit.id, PipelineStage::Preprocessed).await?;

        info!(spans = count, "spans computed");
        ctx.emit(PipelineEvent::new(
            unit.id,
            unit.session_id,
            EventData::SpansComputed { spans: count },
        ));
        Ok(())
    }
}

#[async_trait]
impl Handler<PreprocessTask> for PreprocessHandler {
    async fn handle(&self, task: PreprocessTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        self.run(task, ctx).await
    }
}

pub struct ExtractHandler {
    extractor: UnifiedExtractor,
    budget: ContextBudget,
}

impl ExtractHandler {
    pub fn new(model: Arc<dyn ModelClient>, config: &PipelineConfig) -> Self {
        Self {
            extractor: UnifiedExtractor::new(model, config.extraction_tier),
            budget: ContextBudget::from(config),
        }
    }

    #[instrument(name = "extract", skip_all, fields(unit_id = %task.unit_id, task_id = %ctx.task_id()))]
    async fn run(&self, task: ExtractTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        let unit = load_unit(ctx, task.unit_id).await?;

        // A previous attempt may have stored primitives and then failed to
        // finish; reuse them instead of paying for another model call.
        let reused = if reached(ctx.previous_checkpoint(), STEP_PRIMITIVES) {
            ctx.knowledge().primitives_for_unit(unit.id).await?
        } else {
            None
        };

        let (primitives, tokens, elapsed_ms) = match reused {
            Some(primitives) => {
                info!("reusing stored primitives");
                (primitives, TokenUsage::default(), 0)
            }
            None => {
                let store = ctx.knowledge();
                let text = normalize_text(&unit.text);
                let spans = store.spans_for_unit(unit.id).await?;
                let propositions = store
                    .recent_propositions(&unit.session_id, self.budget.max_propositions)
                    .await?
                    .into_iter()
                    .filter(|p| p.unit_id != unit.id)
                    .collect();
                let context = self.budget.assemble(
                    &text,
                    store.session_summary(&unit.session_id).await?,
                    store
                        .recent_claims(&unit.session_id, self.budget.max_claims)
                        .await?,
                    store.all_entities().await?,
                    propositions,
                );

                let outcome = self.extractor.extract(&unit, &text, &spans, &context).await;
                if let Some(error) = &outcome.error {
                    warn!(%error, "extraction contributed nothing");
                }
                store.put_primitives(unit.id, outcome.primitives.clone()).await?;
                ctx.checkpoint(
                    STEP_PRIMITIVES,
                    json!({ "tokens": outcome.tokens.total, "elapsed_ms": outcome.elapsed_ms }),
                )
                .await?;
                (outcome.primitives, outcome.tokens, outcome.elapsed_ms)
            }
        };

        ctx.knowledge()
            .set_unit_stage(unit.id, PipelineStage::Extracted)
            .await?;
        info!(
            propositions = primitives.propositions.len(),
            stances = primitives.stances.len(),
            mentions = primitives.mentions.len(),
            tokens = tokens.total,
            "primitives extracted"
        );
        ctx.emit(PipelineEvent::new(
            unit.id,
            unit.session_id,
            EventData::PrimitivesExtracted {
                propositions: primitives.propositions.len(),
                stances: primitives.stances.len(),
                relations: primitives.relations.len(),
                mentions: primitives.mentions.len(),
                tokens,
                elapsed_ms,
            },
        ));
        Ok(())
    }
}

#[async_trait]
impl Handler<ExtractTask> for ExtractHandler {
    async fn handle(&self, task: ExtractTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        self.run(task, ctx).await
    }
}

/// Number of claims already stored for `unit`, when it was derived before.
///
/// A unit counts as derived once its recorded stage reaches `Derived`, or
/// once the store holds a claim sourced from one of its current propositions.
async fn already_derived(
    ctx: &TaskContext,
    unit: &ConversationalUnit,
    primitives: &Primitives,
) -> Result<Option<usize>, HandlerError> {
    let claims: Vec<_> = ctx
        .knowledge()
        .claims_for_unit(unit.id)
        .await?
        .into_iter()
        .filter(|c| c.unit_id == unit.id)
        .collect();
    let sources: HashSet<_> = primitives.propositions.iter().map(|p| p.id).collect();
    let derived = unit.stage.is_some_and(|s| s >= PipelineStage::Derived)
        || claims.iter().any(|c| sources.contains(&c.source_proposition));
    Ok(derived.then_some(claims.len()))
}

pub struct ResolveAndDeriveHandler;

impl ResolveAndDeriveHandler {
    #[instrument(name = "resolve_and_derive", skip_all, fields(unit_id = %task.unit_id, task_id = %ctx.task_id()))]
    async fn run(&self, task: ResolveAndDeriveTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        let unit = load_unit(ctx, task.unit_id).await?;
        let primitives = match ctx.knowledge().primitives_for_unit(unit.id).await? {
            Some(p) => p,
            None => {
                warn!("no primitives stored; deriving nothing");
                Default::default()
            }
        };
        let now = ctx.now();

        // A fresh task for a unit that was already derived (a repeated
        // PrimitivesExtracted after the first task completed) has no
        // checkpoint to go on, so look at what the store already holds.
        if let Some(existing) = already_derived(ctx, &unit, &primitives).await? {
            info!(claims = existing, "unit already derived; skipping resolution");
            if !unit.processed {
                ctx.emit(PipelineEvent::new(
                    unit.id,
                    unit.session_id,
                    EventData::ClaimsDerived {
                        claims: existing,
                        entities_created: 0,
                        entities_merged: 0,
                    },
                ));
            }
            return Ok(());
        }

        // Entity resolution bumps mention counts, so it must not run twice.
        let resumed = ctx
            .previous_checkpoint()
            .filter(|cp| reached(Some(*cp), STEP_ENTITIES))
            .map(|cp| {
                let entities = cp.data.get("entities").unwrap_or(&cp.data);
                (
                    entities["created"].as_u64().unwrap_or(0) as usize,
                    entities["merged"].as_u64().unwrap_or(0) as usize,
                )
            });
        let (created, merged) = match resumed {
            Some(counts) => counts,
            None => {
                let store = ctx.knowledge();
                let groups = dedup_mentions(&primitives.mentions);
                let resolution = resolve_mentions(&groups, &store.all_entities().await?, now);
                let counts = (resolution.created, resolution.merged);
                apply_resolution(store, resolution).await?;
                ctx.checkpoint(
                    STEP_ENTITIES,
                    json!({ "created": counts.0, "merged": counts.1 }),
                )
                .await?;
                counts
            }
        };

        let claims = if reached(ctx.previous_checkpoint(), STEP_CLAIMS) {
            ctx.knowledge()
                .claims_for_unit(unit.id)
                .await?
                .into_iter()
                .filter(|c| c.unit_id == unit.id)
                .count()
        } else {
            let store = ctx.knowledge();
            let claims = derive_claims(&unit, &primitives, now);
            let ids: Vec<_> = claims.iter().map(|c| c.id).collect();
            store.put_claims(claims).await?;
            for id in &ids {
                store.link_claim_to_unit(*id, unit.id).await?;
            }
            ctx.checkpoint(
                STEP_CLAIMS,
                json!({
                    "claims": ids.len(),
                    "entities": { "created": created, "merged": merged },
                }),
            )
            .await?;
            ids.len()
        };

        ctx.knowledge()
            .set_unit_stage(unit.id, PipelineStage::Derived)
            .await?;
        info!(claims, entities_created = created, entities_merged = merged, "claims derived");
        ctx.emit(PipelineEvent::new(
            unit.id,
            unit.session_id,
            EventData::ClaimsDerived {
                claims,
                entities_created: created,
                entities_merged: merged,
            },
        ));
        Ok(())
    }
}

#[async_trait]
impl Handler<ResolveAndDeriveTask> for ResolveAndDeriveHandler {
    async fn handle(&self, task: ResolveAndDeriveTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        self.run(task, ctx).await
    }
}

pub struct RunObserversHandler {
    observers: Vec<Box<dyn Observer>>,
}

impl RunObserversHandler {
    pub fn new(observers: Vec<Box<dyn Observer>>) -> Self {
        Self { observers }
    }

    /// Supersession, then dormancy.
    pub fn standard(config: &PipelineConfig) -> Self {
        Self::new(vec![
            Box::new(SupersessionObserver),
            Box::new(DormancyObserver {
                window: config.dormancy_window(),
            }),
        ])
    }

    #[instrument(name = "run_observers", skip_all, fields(unit_id = %task.unit_id, task_id = %ctx.task_id()))]
    async fn run(&self, task: RunObserversTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        let unit = load_unit(ctx, task.unit_id).await?;
        let now = ctx.now();
        let store = ctx.knowledge();

        let mut report = ObserverReport::default();
        for observer in &self.observers {
            let r = observer.observe(&unit, store, now).await?;
            debug!(observer = observer.name(), superseded = r.superseded, dormant = r.dormant, "observer ran");
            report.add(r);
        }

        store.set_unit_stage(unit.id, PipelineStage::Observed).await?;
        if !store.mark_unit_processed(unit.id).await? {
            // A duplicate run must not announce completion twice.
            warn!("unit already processed; not emitting completion again");
            return Ok(());
        }

        let (entities_created, entities_merged) = match task.trigger {
            Some(EventData::ClaimsDerived {
                entities_created,
                entities_merged,
                ..
            }) => (entities_created, entities_merged),
            _ => (0, 0),
        };
        let primitives = store.primitives_for_unit(unit.id).await?.unwrap_or_default();
        let summary = UnitSummary {
            spans: store.spans_for_unit(unit.id).await?.len(),
            propositions: primitives.propositions.len(),
            stances: primitives.stances.len(),
            relations: primitives.relations.len(),
            mentions: primitives.mentions.len(),
            entities_created,
            entities_merged,
            claims: store
                .claims_for_unit(unit.id)
                .await?
                .iter()
                .filter(|c| c.unit_id == unit.id)
                .count(),
            claims_superseded: report.superseded,
            claims_dormant: report.dormant,
        };
        let elapsed_ms = (now - unit.timestamp).num_milliseconds().max(0) as u64;

        info!(?summary, elapsed_ms, "unit completed");
        ctx.emit(PipelineEvent::new(
            unit.id,
            unit.session_id,
            EventData::UnitCompleted { summary, elapsed_ms },
        ));
        Ok(())
    }
}

#[async_trait]
impl Handler<RunObserversTask> for RunObserversHandler {
    async fn handle(&self, task: RunObserversTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
        self.run(task, ctx).await
    }
}

/// The four stage handlers, type-erased and ready to register.
pub fn stage_handlers(
    model: Arc<dyn ModelClient>,
    config: &PipelineConfig,
) -> Result<Vec<Arc<dyn TaskHandler>>, regex::Error> {
    Ok(vec![
        Arc::new(TypedHandler::<PreprocessTask, _>::new(PreprocessHandler::new()?)),
        Arc::new(TypedHandler::<ExtractTask, _>::new(ExtractHandler::new(model, config))),
        Arc::new(TypedHandler::<ResolveAndDeriveTask, _>::new(ResolveAndDeriveHandler)),
        Arc::new(TypedHandler::<RunObserversTask, _>::new(RunObserversHandler::standard(config))),
    ])
}
