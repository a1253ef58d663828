//! Domain identifiers (strongly-typed IDs).
//!
//! すべての ID は ULID を `Id<T>` で包んだものです。`T` はサイズ 0 の
//! マーカー型で、実行時には何も持ちません。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 先頭が timestamp なので、生成順に並ぶ
//! - **調整なしで生成可能**: 採番用のカウンタやストアを必要としない
//! - TaskStore は `created_at` が同じタスクの並び順にこの順序を使う
//!
//! ## Phantom Type パターン
//! `TaskId` と `UnitId` は同じ `Id<T>` の実装を共有しますが、
//! マーカーが違うので互いに代入できません。`unit_id` を渡すべき場所に
//! `TaskId` を渡すとコンパイルエラーになります。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 種別のマーカー trait
///
/// Display とシリアライズで使うプレフィックスを提供します。
pub trait IdMarker: Send + Sync + 'static {
    /// プレフィックス（例: "task-", "unit-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// # 例
/// ```ignore
/// let id = TaskId::new();
/// let s = id.to_string();          // "task-01J..."
/// let back: TaskId = s.parse()?;   // プレフィックス付きでも
/// let bare: TaskId = id.as_ulid().to_string().parse()?; // ULID のみでも可
/// assert_eq!(back, bare);
/// ```
///
/// # シリアライズ
/// - JSON ではプレフィックス付き文字列（`"task-01J..."`）として書き出す
/// - 読み込みはプレフィックスなしの ULID も受け付ける
/// - 不正な文字列は `ParseIdError` になる（payload の検査で使われる）
#[repr(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual impls: derives would put bounds on `T`, which is uninhabited.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error returned when a string is not a valid id.
#[derive(Debug, thiserror::Error)]
#[error("invalid id '{0}'")]
pub struct ParseIdError(String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! id_kind {
    ($(#[$doc:meta])* $marker:ident, $alias:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }

        $(#[$doc])*
        pub type $alias = Id<$marker>;
    };
}

id_kind!(
    /// Identifier of a schedulable task.
    Task, TaskId, "task-"
);
id_kind!(
    /// Identifier of a conversational unit (the pipeline's input datum).
    Unit, UnitId, "unit-"
);
id_kind!(SpanMarker, SpanId, "span-");
id_kind!(PropositionMarker, PropositionId, "prop-");
id_kind!(StanceMarker, StanceId, "stance-");
id_kind!(RelationMarker, RelationId, "rel-");
id_kind!(MentionMarker, MentionId, "mention-");
id_kind!(EntityMarker, EntityId, "entity-");
id_kind!(ClaimMarker, ClaimId, "claim-");
