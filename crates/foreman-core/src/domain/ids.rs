//! Domain identifiers (strongly-typed IDs).
//!
//! すべての ID は ULID をラップした `Id<T>` です。
//! `T` は PhantomData のマーカー型で、TaskId と AttemptId などを
//! コンパイル時に区別します。
//!
//! ## ULID を使う理由
//! - 時刻でソート可能（dequeue の `(scheduled_at, id)` 順序に使える）
//! - 調整なしで複数ワーカーから生成できる
//! - payload (JSON) にそのまま文字列として埋め込める

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "attempt-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// Serializes transparently as the bare ULID string, so ids can travel inside
/// task payloads and round-trip through `serde_json::Value`.
#[repr(transparent)]
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
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

// derive だと T にも境界が付いてしまうので手書きする
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

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
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

/// Parses the bare ULID form (the one stored in payloads and SQL columns).
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self::from_ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

macro_rules! id_marker {
    ($marker:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(Task, "task-");
id_marker!(Lease, "lease-");
id_marker!(Attempt, "attempt-");
id_marker!(Root, "root-");
id_marker!(Webhook, "webhook-");

/// Identifier of a Task (one schedulable unit of work).
pub type TaskId = Id<Task>;

/// Identifier of a Lease row (one claim on a Task).
pub type LeaseId = Id<Lease>;

/// Identifier of an Attempt (one scheduling cycle of a supervisor).
pub type AttemptId = Id<Attempt>;

/// Identifier of a workflow root (one logical business process).
pub type RootId = Id<Root>;

/// Identifier of a stored webhook response.
pub type WebhookId = Id<Webhook>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid = Ulid::new();

        let task = TaskId::from_ulid(ulid);
        let attempt = AttemptId::from_ulid(ulid);

        assert_eq!(task.as_ulid(), attempt.as_ulid());
        assert!(task.to_string().starts_with("task-"));
        assert!(attempt.to_string().starts_with("attempt-"));
        // let _: TaskId = attempt; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let ulid = Ulid::new();
        let root = RootId::from_ulid(ulid);

        let value = serde_json::to_value(root).unwrap();
        assert_eq!(value, serde_json::Value::String(ulid.to_string()));

        let back: RootId = serde_json::from_value(value).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn ids_parse_from_bare_ulid() {
        let ulid = Ulid::new();
        let parsed: TaskId = ulid.to_string().parse().unwrap();
        assert_eq!(parsed.as_ulid(), ulid);

        assert!("not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<AttemptId>(), 16);
    }
}
