//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（Pending / Processing / Completed / Failed）
//! - 試行回数、最後のエラー、次回リトライ時刻
//! - checkpoint（中断された実行の途中経過）
//!
//! # 前提
//! - 読み出しは呼び出し時点で確定した最新の状態を返す
//! - 呼び出しをまたぐトランザクションはない
//! - そのため Orchestrator は一意制約ではなく、ロック下での再スキャンで
//!   `(task_type, unit_id)` の重複を防ぐ
//!
//! 実装は `impls::InMemoryTaskStore` を参照してください。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{StoreError, TaskId, TaskPatch, TaskRecord, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, record: TaskRecord) -> Result<TaskId, StoreError>;

    /// Apply a partial update and return the updated record.
    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<TaskRecord, StoreError>;

    async fn get_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn get_all(&self) -> Result<Vec<TaskRecord>, StoreError>;

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;

    /// Pending tasks with `execute_at <= now`, priority desc then created_at asc.
    async fn get_pending(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Failed tasks with attempts left whose retry time has come (or is unset).
    async fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError>;

    async fn get_by_session(&self, session_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Remove a record. Only used by opt-in retention pruning.
    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;
}
