//! IdGenerator port - task id generation.
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator hands out globally unique task ids.
///
/// # Thread Safety
/// - `Send + Sync` を要求（API とワーカーの両方から使う）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID ids whose timestamp part comes from the injected clock.
///
/// The random part keeps ids unique even under a frozen test clock.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));
        let ids: HashSet<TaskId> = (0..1000).map(|_| id_gen.generate_task_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        // FixedClock を使っても、ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
    }
}
