//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//! UlidGenerator は Clock から timestamp を取るので、FixedClock を使えば
//! timestamp 部分は決定的になります（ランダム部分は毎回異なる）。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{AttemptId, Id, LeaseId, RootId, TaskId, WebhookId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;

    fn task_id(&self) -> TaskId {
        Id::from_ulid(self.next_ulid())
    }

    fn lease_id(&self) -> LeaseId {
        Id::from_ulid(self.next_ulid())
    }

    fn attempt_id(&self) -> AttemptId {
        Id::from_ulid(self.next_ulid())
    }

    fn root_id(&self) -> RootId {
        Id::from_ulid(self.next_ulid())
    }

    fn webhook_id(&self) -> WebhookId {
        Id::from_ulid(self.next_ulid())
    }
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdGenerator for UlidGenerator {
    fn next_ulid(&self) -> Ulid {
        // epoch より前の時刻は 0 に丸める
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        let id3 = id_gen.task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let id1 = id_gen.attempt_id();
        let id2 = id_gen.attempt_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);
        // timestamp 部分は同じ
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn pre_epoch_clock_saturates_to_zero() {
        let before_epoch = Utc.with_ymd_and_hms(1960, 6, 1, 0, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(before_epoch)));

        assert_eq!(id_gen.root_id().as_ulid().timestamp_ms(), 0);
    }
}
