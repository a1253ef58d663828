//! Startup reconciliation helpers.
//!
//! Two gaps can be left behind by a process that died mid-flight:
//! - tasks stuck in `Processing` that nobody is executing any more;
//! - units that never reached `processed` and have no live task to move
//!   them forward.
//!
//! `Orchestrator::recover` drives these helpers once per process.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::domain::{
    ConversationalUnit, PipelineStage, StoreError, TaskPatch, TaskRecord, TaskStatus, TaskType,
    UnitId, resume_task,
};
use crate::ports::KnowledgeStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphans put back to `Pending`.
    pub stale_reset: usize,
    /// Orphans that had no attempts left and were marked `Failed`.
    pub stale_failed: usize,
    /// Units for which a resume task was created.
    pub units_resumed: usize,
    /// Units that already had a task for their next stage.
    pub units_in_flight: usize,
}

/// Is a `Processing` task older than `threshold`? A task with no
/// `started_at` cannot prove it is alive and counts as stale.
pub fn is_stale(task: &TaskRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
    task.status == TaskStatus::Processing
        && task.started_at.is_none_or(|started| now - started > threshold)
}

/// Patch for an orphaned task: back to `Pending` with a backoff delay, or
/// `Failed` if it already used its last attempt.
pub fn stale_patch(task: &TaskRecord, now: DateTime<Utc>) -> TaskPatch {
    let started = task
        .started_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    if task.has_attempts_left() {
        let delay = task.backoff.next_delay(task.attempts);
        let next = now + Duration::milliseconds(delay.as_millis() as i64);
        TaskPatch::retry(
            format!("recovered stale task (processing since {started})"),
            now,
            next,
        )
    } else {
        TaskPatch::fail(
            format!("stale task with no attempts left (processing since {started})"),
            now,
        )
    }
}

/// Units targeted by a Pending or Processing task. Records whose payload
/// does not name a unit are skipped.
pub fn units_with_live_tasks(tasks: &[TaskRecord]) -> HashSet<UnitId> {
    let mut live = HashSet::new();
    for task in tasks {
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) {
            continue;
        }
        match task.unit_id() {
            Some(unit) => {
                live.insert(unit);
            }
            None => warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "skipping task with malformed payload during recovery"
            ),
        }
    }
    live
}

/// Last completed stage of `unit`. The explicit `stage` field wins; units
/// without one are classified by probing for artifacts, latest stage first.
pub async fn completed_stage(
    store: &dyn KnowledgeStore,
    unit: &ConversationalUnit,
) -> Result<Option<PipelineStage>, StoreError> {
    if unit.stage.is_some() {
        return Ok(unit.stage);
    }
    if !store.claims_for_unit(unit.id).await?.is_empty() {
        return Ok(Some(PipelineStage::Derived));
    }
    if store.primitives_for_unit(unit.id).await?.is_some() {
        return Ok(Some(PipelineStage::Extracted));
    }
    if store.has_spans(unit.id).await? {
        return Ok(Some(PipelineStage::Preprocessed));
    }
    Ok(None)
}

/// Task that moves an unprocessed `unit` forward.
///
/// A unit whose observers already ran but whose `processed` flag never
/// landed goes back through `RunObservers`, so that flipping the flag and
/// announcing `UnitCompleted` still happen together.
pub async fn resume_point(
    store: &dyn KnowledgeStore,
    unit: &ConversationalUnit,
) -> Result<TaskType, StoreError> {
    Ok(resume_task(completed_stage(store, unit).await?).unwrap_or(TaskType::RunObservers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffConfig, NewTask, Primitives, TaskId};
    use crate::impls::InMemoryKnowledgeStore;
    use serde_json::json;

    fn processing(started_ago: Option<i64>, attempts: u32, now: DateTime<Utc>) -> TaskRecord {
        let mut r = NewTask::new(TaskType::Extract, json!({ "unit_id": UnitId::new() }))
            .with_backoff(BackoffConfig {
                jitter: false,
                ..BackoffConfig::default()
            })
            .into_record(TaskId::new(), now - Duration::hours(1), 3, &BackoffConfig::default());
        r.status = TaskStatus::Processing;
        r.attempts = attempts;
        r.started_at = started_ago.map(|m| now - Duration::minutes(m));
        r
    }

    #[test]
    fn staleness_uses_threshold() {
        let now = Utc::now();
        let threshold = Duration::minutes(5);
        assert!(is_stale(&processing(Some(10), 1, now), now, threshold));
        assert!(!is_stale(&processing(Some(1), 1, now), now, threshold));
        assert!(is_stale(&processing(None, 1, now), now, threshold));

        let mut done = processing(Some(10), 1, now);
        done.status = TaskStatus::Completed;
        assert!(!is_stale(&done, now, threshold));
    }

    #[test]
    fn stale_task_with_attempts_left_goes_back_to_pending() {
        let now = Utc::now();
        let mut task = processing(Some(10), 2, now);
        stale_patch(&task, now).apply(&mut task);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.next_retry_at, Some(now + Duration::seconds(2)));
        assert!(task.last_error.unwrap().contains("stale"));
    }

    #[test]
    fn stale_task_without_attempts_left_fails() {
        let now = Utc::now();
        let mut task = processing(Some(10), 3, now);
        stale_patch(&task, now).apply(&mut task);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.next_retry_at, None);
        assert!(task.attempts >= task.max_attempts);
    }

    #[test]
    fn live_units_skip_malformed_and_finished() {
        let now = Utc::now();
        let live = processing(Some(1), 1, now);
        let mut finished = processing(Some(1), 1, now);
        finished.status = TaskStatus::Completed;
        let mut malformed = processing(Some(1), 1, now);
        malformed.payload = json!({ "unit_id": 17 });

        let units = units_with_live_tasks(&[live.clone(), finished, malformed]);
        assert_eq!(units.len(), 1);
        assert!(units.contains(&live.unit_id().unwrap()));
    }

    #[tokio::test]
    async fn explicit_stage_wins_over_artifacts() {
        let store = InMemoryKnowledgeStore::new();
        let mut unit = ConversationalUnit::new("x", "s1", Utc::now());
        unit.stage = Some(PipelineStage::Preprocessed);
        store.put_primitives(unit.id, Primitives::default()).await.unwrap();
        assert_eq!(resume_point(&store, &unit).await.unwrap(), TaskType::Extract);
    }

    #[tokio::test]
    async fn probing_walks_backwards_through_artifacts() {
        let store = InMemoryKnowledgeStore::new();
        let unit = ConversationalUnit::new("x", "s1", Utc::now());
        assert_eq!(resume_point(&store, &unit).await.unwrap(), TaskType::Preprocess);

        store.put_spans(unit.id, Vec::new()).await.unwrap();
        assert_eq!(resume_point(&store, &unit).await.unwrap(), TaskType::Extract);

        store.put_primitives(unit.id, Primitives::default()).await.unwrap();
        assert_eq!(
            resume_point(&store, &unit).await.unwrap(),
            TaskType::ResolveAndDerive
        );
    }

    #[tokio::test]
    async fn observed_but_unprocessed_unit_reruns_observers() {
        let store = InMemoryKnowledgeStore::new();
        let mut unit = ConversationalUnit::new("x", "s1", Utc::now());
        unit.stage = Some(PipelineStage::Observed);
        assert_eq!(resume_point(&store, &unit).await.unwrap(), TaskType::RunObservers);
    }
}
