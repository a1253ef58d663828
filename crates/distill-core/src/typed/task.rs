//! TaskPayload - 型付き payload と TaskType の対応付け
//!
//! `TaskRecord::payload` は JSON のまま保存されます。Handler 側では
//! `TaskPayload` を実装した構造体として受け取るので、フィールド名の
//! 取り違えはデコード時の `HandlerError::InvalidPayload` として表面化します。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// TaskPayload は TaskType と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ExtractTask { unit_id: UnitId, session_id: String }
///
/// impl TaskPayload for ExtractTask {
///     const TYPE: TaskType = TaskType::Extract;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: `TaskRecord::payload` への書き込み
/// - `DeserializeOwned`: record を借用せずに payload を復元する
/// - `Send + Sync + 'static`: spawn されたタスクの中で Handler に渡す
///
/// 重複排除のキーは payload の `unit_id` です。ユニット単位のタスクは
/// 必ずこのフィールドを持たせてください。
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: TaskType;

    /// Encode for `TaskRecord::payload`.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
