mod common;

use std::sync::Arc;
use std::time::Duration;

use distill_core::app::{OrchestratorConfig, PipelineConfig};
use distill_core::domain::{
    ConversationalUnit, EntityType, EventData, EventName, PipelineEvent, SpanKind, StanceKind,
    TaskStatus, TaskType, TokenUsage,
};
use distill_core::impls::{RuleBasedModelClient, ScriptedModelClient};
use distill_core::pipeline::stage_handlers;
use distill_core::ports::{KnowledgeStore, ModelClient, TaskStore};

use common::{REPORT, REPORT_EXTRACTION, harness, next_event, settle, start_time, watch};

fn live_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 10,
        ..common::manual_config()
    }
}

fn pipeline(model: Arc<dyn ModelClient>) -> common::Harness {
    harness(live_config(), |b| {
        b.handlers(stage_handlers(model, &PipelineConfig::default()).unwrap())
            .unwrap()
            .expect_tasks(&TaskType::ALL)
    })
}

#[tokio::test]
async fn report_unit_flows_through_every_stage() {
    let model = Arc::new(ScriptedModelClient::new());
    model.push_reply(REPORT_EXTRACTION);
    let h = pipeline(model.clone());
    let (_sub, mut completed) = watch(h.orch.bus(), EventName::UnitCompleted);

    h.orch.initialize().await.unwrap();
    h.orch.start();
    let unit_id = h
        .orch
        .submit_unit(ConversationalUnit::new(REPORT, "s1", start_time()))
        .await
        .unwrap();

    let event = next_event(&mut completed).await;
    assert_eq!(event.unit_id, unit_id);
    let EventData::UnitCompleted { summary, .. } = event.data else {
        panic!("unexpected event {:?}", event.data);
    };
    assert!(summary.spans >= 1);
    assert_eq!(summary.propositions, 1);
    assert_eq!(summary.claims, 1);
    assert_eq!(summary.entities_created, 1);

    let spans = h.knowledge.spans_for_unit(unit_id).await.unwrap();
    assert!(
        spans
            .iter()
            .any(|s| s.kind == SpanKind::Deadline && s.text.contains("Friday"))
    );

    assert_eq!(model.calls().len(), 1);
    let primitives = h.knowledge.primitives_for_unit(unit_id).await.unwrap().unwrap();
    assert!(primitives.propositions[0].statement.contains("report"));
    assert_eq!(primitives.stances[0].kind, StanceKind::Commitment);
    assert_eq!(primitives.mentions[0].text, "Sarah");

    let entities = h.knowledge.all_entities().await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].canonical_name, "Sarah");
    assert_eq!(entities[0].entity_type, EntityType::Person);

    let claims = h.knowledge.claims_for_unit(unit_id).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].stance, StanceKind::Commitment);

    assert!(h.knowledge.get_unit(unit_id).await.unwrap().unwrap().processed);

    // completion is announced once
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(completed.try_recv().is_err());

    h.orch.shutdown().await;
    let tasks = h.tasks.get_all().await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn offline_client_handles_the_report_unit() {
    let h = pipeline(Arc::new(RuleBasedModelClient::new().unwrap()));
    let (_sub, mut completed) = watch(h.orch.bus(), EventName::UnitCompleted);
    h.orch.initialize().await.unwrap();
    h.orch.start();

    let unit_id = h
        .orch
        .submit_unit(ConversationalUnit::new(REPORT, "s1", start_time()))
        .await
        .unwrap();
    assert_eq!(next_event(&mut completed).await.unit_id, unit_id);

    let entities = h.knowledge.all_entities().await.unwrap();
    assert!(
        entities
            .iter()
            .any(|e| e.canonical_name == "Sarah" && e.entity_type == EntityType::Person)
    );
    let claims = h.knowledge.claims_for_unit(unit_id).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].subject, "user");
    h.orch.shutdown().await;
}

#[tokio::test]
async fn units_in_one_session_share_entities() {
    let h = pipeline(Arc::new(RuleBasedModelClient::new().unwrap()));
    let (_sub, mut completed) = watch(h.orch.bus(), EventName::UnitCompleted);
    h.orch.initialize().await.unwrap();
    h.orch.start();

    h.orch
        .submit_unit(ConversationalUnit::new(REPORT, "s1", start_time()))
        .await
        .unwrap();
    next_event(&mut completed).await;
    h.orch
        .submit_unit(ConversationalUnit::new(
            "I will send Sarah the draft tomorrow.",
            "s1",
            start_time(),
        ))
        .await
        .unwrap();
    next_event(&mut completed).await;

    let entities = h.knowledge.all_entities().await.unwrap();
    let sarah: Vec<_> = entities
        .iter()
        .filter(|e| e.canonical_name == "Sarah")
        .collect();
    assert_eq!(sarah.len(), 1);
    assert_eq!(sarah[0].mention_count, 2);
    assert!(h.knowledge.unprocessed_units().await.unwrap().is_empty());
    h.orch.shutdown().await;
}

#[tokio::test]
async fn repeated_extraction_event_does_not_duplicate_claims() {
    let model = Arc::new(ScriptedModelClient::new());
    model.push_reply(REPORT_EXTRACTION);
    let h = pipeline(model.clone());
    let (_sub, mut completed) = watch(h.orch.bus(), EventName::UnitCompleted);
    h.orch.initialize().await.unwrap();
    h.orch.start();

    let unit_id = h
        .orch
        .submit_unit(ConversationalUnit::new(REPORT, "s1", start_time()))
        .await
        .unwrap();
    next_event(&mut completed).await;

    // as if Extract had emitted and then died before recording completion
    h.orch.bus().emit(PipelineEvent::new(
        unit_id,
        "s1",
        EventData::PrimitivesExtracted {
            propositions: 1,
            stances: 1,
            relations: 0,
            mentions: 1,
            tokens: TokenUsage::default(),
            elapsed_ms: 0,
        },
    ));
    for _ in 0..200 {
        let tasks = h.tasks.get_all().await.unwrap();
        if tasks.len() == 5 && tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    settle(&h.orch).await;

    let rerun = h
        .tasks
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == TaskType::ResolveAndDerive)
        .count();
    assert_eq!(rerun, 2);
    assert_eq!(h.knowledge.claims_for_unit(unit_id).await.unwrap().len(), 1);
    let entities = h.knowledge.all_entities().await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].mention_count, 1);
    assert!(completed.try_recv().is_err());
    h.orch.shutdown().await;
}
