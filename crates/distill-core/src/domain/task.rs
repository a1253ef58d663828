//! Task record: the persisted shape of a unit of work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backoff::BackoffConfig;
use super::ids::{TaskId, UnitId};
use super::state::TaskStatus;

/// Closed set of task kinds, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Preprocess,
    Extract,
    ResolveAndDerive,
    RunObservers,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Preprocess,
        TaskType::Extract,
        TaskType::ResolveAndDerive,
        TaskType::RunObservers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Preprocess => "preprocess",
            TaskType::Extract => "extract",
            TaskType::ResolveAndDerive => "resolve_and_derive",
            TaskType::RunObservers => "run_observers",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task type '{0}'")]
pub struct UnknownTaskType(String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// Scheduling priority. Higher `value()` runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn value(self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }
}

/// Mid-execution progress marker, so a handler can resume partway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: String,
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub completed_steps: Vec<String>,
}

impl Checkpoint {
    /// Has `step` already been recorded as completed?
    pub fn is_done(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Record `step` as reached, carrying forward previously completed steps.
    pub fn advance(previous: Option<&Checkpoint>, step: &str, data: serde_json::Value) -> Self {
        let mut completed_steps = previous
            .map(|c| c.completed_steps.clone())
            .unwrap_or_default();
        if let Some(prev) = previous
            && !completed_steps.contains(&prev.step)
            && prev.step != step
        {
            completed_steps.push(prev.step.clone());
        }
        let step_index = previous.map(|c| c.step_index + 1).unwrap_or(0);
        Self {
            step: step.to_string(),
            step_index,
            total_steps: previous.and_then(|c| c.total_steps),
            data,
            completed_steps,
        }
    }
}

/// Metadata + payload for one schedulable task.
///
/// This is the single source of truth for task state; the orchestrator keeps
/// only the ids of tasks it is currently executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: Priority,

    /// Number of executions started, including the current one while Processing.
    pub attempts: u32,
    pub max_attempts: u32,

    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff: BackoffConfig,
    pub checkpoint: Option<Checkpoint>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Deferred work is not eligible before this instant.
    pub execute_at: DateTime<Utc>,

    pub group_id: Option<String>,
    pub depends_on: Option<TaskId>,
    pub session_id: Option<String>,
}

impl TaskRecord {
    /// The unit this task operates on, if the payload names one.
    pub fn unit_id(&self) -> Option<UnitId> {
        unit_id_of(&self.payload)
    }

    /// Eligible to start at `now`: deferral and retry delay both elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at <= now && self.next_retry_at.is_none_or(|t| t <= now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Extract the dedup key (`unit_id`) from a task payload.
pub fn unit_id_of(payload: &serde_json::Value) -> Option<UnitId> {
    payload
        .get("unit_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

/// Input for creating a task. Fields left `None` take the orchestrator's defaults.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffConfig>,
    pub execute_at: Option<DateTime<Utc>>,
    pub group_id: Option<String>,
    pub depends_on: Option<TaskId>,
    pub session_id: Option<String>,
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_type,
            payload,
            priority: Priority::Normal,
            max_attempts: None,
            backoff: None,
            execute_at: None,
            group_id: None,
            depends_on: None,
            session_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn deferred_until(mut self, at: DateTime<Utc>) -> Self {
        self.execute_at = Some(at);
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn after(mut self, depends_on: TaskId) -> Self {
        self.depends_on = Some(depends_on);
        self
    }

    /// Materialize into a Pending record.
    pub fn into_record(
        self,
        id: TaskId,
        now: DateTime<Utc>,
        default_max_attempts: u32,
        default_backoff: &BackoffConfig,
    ) -> TaskRecord {
        let session_id = self.session_id.or_else(|| {
            self.payload
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        TaskRecord {
            id,
            task_type: self.task_type,
            payload: self.payload,
            status: TaskStatus::Pending,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            last_error_at: None,
            next_retry_at: None,
            backoff: self.backoff.unwrap_or_else(|| default_backoff.clone()),
            checkpoint: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            execute_at: self.execute_at.unwrap_or(now),
            group_id: self.group_id,
            depends_on: self.depends_on,
            session_id,
        }
    }
}

/// Partial update (`update(partial)`).
///
/// `None` leaves a field untouched. Nullable fields use `Option<Option<T>>`
/// so a patch can clear them with `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub checkpoint: Option<Option<Checkpoint>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub execute_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    /// Apply onto a record in place.
    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(v) = &self.last_error {
            record.last_error = v.clone();
        }
        if let Some(v) = self.last_error_at {
            record.last_error_at = v;
        }
        if let Some(v) = self.next_retry_at {
            record.next_retry_at = v;
        }
        if let Some(v) = &self.checkpoint {
            record.checkpoint = v.clone();
        }
        if let Some(v) = self.started_at {
            record.started_at = v;
        }
        if let Some(v) = self.completed_at {
            record.completed_at = v;
        }
        if let Some(v) = self.execute_at {
            record.execute_at = v;
        }
    }

    /// Pending -> Processing.
    pub fn start(attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Processing),
            attempts: Some(attempts),
            started_at: Some(Some(now)),
            ..Self::default()
        }
    }

    /// Processing -> Completed.
    pub fn complete(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            completed_at: Some(Some(now)),
            next_retry_at: Some(None),
            checkpoint: Some(None),
            ..Self::default()
        }
    }

    /// Processing -> Pending with a retry delay.
    pub fn retry(error: String, now: DateTime<Utc>, next_retry_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            last_error: Some(Some(error)),
            last_error_at: Some(Some(now)),
            next_retry_at: Some(Some(next_retry_at)),
            ..Self::default()
        }
    }

    /// Processing -> Failed (permanent).
    pub fn fail(error: String, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            last_error: Some(Some(error)),
            last_error_at: Some(Some(now)),
            next_retry_at: Some(None),
            completed_at: Some(Some(now)),
            ..Self::default()
        }
    }

    pub fn checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Some(Some(checkpoint)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        let unit = UnitId::new();
        NewTask::new(TaskType::Extract, json!({ "unit_id": unit, "session_id": "s1" }))
            .into_record(TaskId::new(), now, 3, &BackoffConfig::default())
    }

    #[test]
    fn new_record_is_pending_and_due() {
        let now = Utc::now();
        let r = record(now);
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.attempts, 0);
        assert_eq!(r.max_attempts, 3);
        assert!(r.is_due(now));
        assert_eq!(r.session_id.as_deref(), Some("s1"));
        assert!(r.unit_id().is_some());
    }

    #[test]
    fn retry_delay_defers_eligibility() {
        let now = Utc::now();
        let mut r = record(now);
        TaskPatch::retry("boom".into(), now, now + Duration::seconds(5)).apply(&mut r);
        assert!(!r.is_due(now));
        assert!(r.is_due(now + Duration::seconds(5)));
        assert_eq!(r.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn complete_clears_checkpoint_and_retry() {
        let now = Utc::now();
        let mut r = record(now);
        TaskPatch::checkpoint(Checkpoint::advance(None, "spans", json!({}))).apply(&mut r);
        assert!(r.checkpoint.is_some());
        TaskPatch::complete(now).apply(&mut r);
        assert!(r.checkpoint.is_none());
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.completed_at, Some(now));
    }

    #[test]
    fn payload_without_unit_id_has_no_dedup_key() {
        assert!(unit_id_of(&json!({ "other": 1 })).is_none());
        assert!(unit_id_of(&json!({ "unit_id": "garbage" })).is_none());
    }

    #[test]
    fn checkpoint_advance_accumulates_completed_steps() {
        let first = Checkpoint::advance(None, "a", json!(1));
        let second = Checkpoint::advance(Some(&first), "b", json!(2));
        let third = Checkpoint::advance(Some(&second), "c", json!(3));
        assert_eq!(third.step_index, 2);
        assert_eq!(third.completed_steps, vec!["a".to_string(), "b".to_string()]);
        assert!(third.is_done("a"));
        assert!(!third.is_done("c"));
    }

    #[test]
    fn task_type_parses_from_str() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert!("nope".parse::<TaskType>().is_err());
    }

    #[test]
    fn record_roundtrips_through_json() {
        let r = record(Utc::now());
        let s = serde_json::to_string(&r).unwrap();
        let back: TaskRecord = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }
}
