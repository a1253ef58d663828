#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use distill_core::app::{EventBus, OrchestratorConfig, Subscription};
use distill_core::domain::{BackoffConfig, EventName, PipelineEvent};
use distill_core::impls::{InMemoryKnowledgeStore, InMemoryTaskStore};
use distill_core::ports::ManualClock;
use distill_core::{Orchestrator, OrchestratorBuilder};

pub const REPORT: &str = "I need to finish the report by Friday for my manager Sarah.";

pub const REPORT_EXTRACTION: &str = r#"{
  "propositions": [
    {"id": "p1", "subject": "user", "statement": "finish the report by Friday", "temporality": "future"}
  ],
  "stances": [
    {"proposition": "p1", "kind": "commitment", "confidence": 0.9}
  ],
  "relations": [],
  "entities": [
    {"text": "Sarah", "type": "person"}
  ]
}"#;

pub struct Harness {
    pub orch: Orchestrator,
    pub tasks: Arc<InMemoryTaskStore>,
    pub knowledge: Arc<InMemoryKnowledgeStore>,
    pub clock: Arc<ManualClock>,
}

/// Config for tests driven by `poll_now`: no poller, no jitter.
pub fn manual_config() -> OrchestratorConfig {
    OrchestratorConfig {
        auto_start: false,
        backoff: BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn harness(
    config: OrchestratorConfig,
    build: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
) -> Harness {
    let tasks = Arc::new(InMemoryTaskStore::new());
    let knowledge = Arc::new(InMemoryKnowledgeStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let builder = OrchestratorBuilder::new()
        .config(config)
        .task_store(tasks.clone())
        .knowledge_store(knowledge.clone())
        .clock(clock.clone());
    let orch = build(builder).build().unwrap();
    Harness {
        orch,
        tasks,
        knowledge,
        clock,
    }
}

/// Wait until no task is executing.
pub async fn settle(orch: &Orchestrator) {
    for _ in 0..400 {
        if orch.get_status().await.unwrap().active_tasks == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("tasks did not settle");
}

pub fn watch(bus: &EventBus, name: EventName) -> (Subscription, mpsc::UnboundedReceiver<PipelineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = bus.on(name, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });
    (sub, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}
