//! Per-device allocator statistics
//!
//! Every counter is a [`Stat`]: current value, peak, and the accumulated
//! amounts added and removed. Most families are tracked for all blocks and
//! separately for the small and large pools ([`StatArray`]).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::allocator::block::BlockPool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub current: i64,
    pub peak: i64,
    pub allocated: i64,
    pub freed: i64,
}

impl Stat {
    /// Apply a signed change.
    pub fn update(&mut self, amount: i64) {
        self.current += amount;
        self.peak = self.peak.max(self.current);
        if amount > 0 {
            self.allocated += amount;
        } else {
            self.freed += -amount;
        }
    }

    pub fn increase(&mut self, amount: usize) {
        self.update(amount as i64);
    }

    pub fn decrease(&mut self, amount: usize) {
        self.update(-(amount as i64));
    }

    pub fn reset_accumulated(&mut self) {
        self.allocated = 0;
        self.freed = 0;
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.current;
    }
}

/// Which slice of a [`StatArray`] to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Aggregate,
    SmallPool,
    LargePool,
}

impl StatType {
    pub fn key(&self) -> &'static str {
        match self {
            StatType::Aggregate => "all",
            StatType::SmallPool => "small_pool",
            StatType::LargePool => "large_pool",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatArray {
    pub all: Stat,
    pub small_pool: Stat,
    pub large_pool: Stat,
}

impl StatArray {
    /// Apply a change to the aggregate and to `pool`'s slice.
    pub fn update(&mut self, pool: BlockPool, amount: i64) {
        self.all.update(amount);
        match pool {
            BlockPool::Small => self.small_pool.update(amount),
            BlockPool::Large => self.large_pool.update(amount),
        }
    }

    pub fn get(&self, stat_type: StatType) -> &Stat {
        match stat_type {
            StatType::Aggregate => &self.all,
            StatType::SmallPool => &self.small_pool,
            StatType::LargePool => &self.large_pool,
        }
    }

    fn each_mut(&mut self) -> [&mut Stat; 3] {
        [&mut self.all, &mut self.small_pool, &mut self.large_pool]
    }

    pub fn reset_accumulated(&mut self) {
        self.each_mut().into_iter().for_each(Stat::reset_accumulated);
    }

    pub fn reset_peak(&mut self) {
        self.each_mut().into_iter().for_each(Stat::reset_peak);
    }
}

/// Statistics of one device's caching allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Blocks handed out to callers.
    pub allocation: StatArray,
    /// Native allocations held by the cache.
    pub segment: StatArray,
    /// Blocks allocated or awaiting stream completion.
    pub active: StatArray,
    /// Free blocks that are part of a split segment.
    pub inactive_split: StatArray,
    pub allocated_bytes: StatArray,
    pub reserved_bytes: StatArray,
    pub active_bytes: StatArray,
    pub inactive_split_bytes: StatArray,
    /// Bytes callers asked for, before rounding.
    pub requested_bytes: StatArray,
    pub num_alloc_retries: u64,
    pub num_ooms: u64,
    pub oversize_allocations: Stat,
    pub oversize_segments: Stat,
    pub max_split_size: usize,
}

impl DeviceStats {
    fn arrays_mut(&mut self) -> [&mut StatArray; 9] {
        [
            &mut self.allocation,
            &mut self.segment,
            &mut self.active,
            &mut self.inactive_split,
            &mut self.allocated_bytes,
            &mut self.reserved_bytes,
            &mut self.active_bytes,
            &mut self.inactive_split_bytes,
            &mut self.requested_bytes,
        ]
    }

    /// Zero the allocated/freed totals and the retry/OOM counters.
    pub fn reset_accumulated(&mut self) {
        self.arrays_mut()
            .into_iter()
            .for_each(StatArray::reset_accumulated);
        self.oversize_allocations.reset_accumulated();
        self.oversize_segments.reset_accumulated();
        self.num_alloc_retries = 0;
        self.num_ooms = 0;
    }

    /// Set every peak to its current value.
    pub fn reset_peak(&mut self) {
        self.arrays_mut().into_iter().for_each(StatArray::reset_peak);
        self.oversize_allocations.reset_peak();
        self.oversize_segments.reset_peak();
    }

    /// Flatten into `family.pool.metric` keys, e.g. `allocated_bytes.all.current`.
    pub fn to_flat_map(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        let families: [(&str, &StatArray); 9] = [
            ("allocation", &self.allocation),
            ("segment", &self.segment),
            ("active", &self.active),
            ("inactive_split", &self.inactive_split),
            ("allocated_bytes", &self.allocated_bytes),
            ("reserved_bytes", &self.reserved_bytes),
            ("active_bytes", &self.active_bytes),
            ("inactive_split_bytes", &self.inactive_split_bytes),
            ("requested_bytes", &self.requested_bytes),
        ];
        for (family, array) in families {
            for stat_type in [StatType::Aggregate, StatType::SmallPool, StatType::LargePool] {
                insert_stat(&mut out, &format!("{}.{}", family, stat_type.key()), array.get(stat_type));
            }
        }
        insert_stat(&mut out, "oversize_allocations", &self.oversize_allocations);
        insert_stat(&mut out, "oversize_segments", &self.oversize_segments);
        out.insert("num_alloc_retries".to_string(), self.num_alloc_retries as i64);
        out.insert("num_ooms".to_string(), self.num_ooms as i64);
        out.insert(
            "max_split_size".to_string(),
            i64::try_from(self.max_split_size).unwrap_or(-1),
        );
        out
    }
}

fn insert_stat(out: &mut BTreeMap<String, i64>, prefix: &str, stat: &Stat) {
    out.insert(format!("{}.current", prefix), stat.current);
    out.insert(format!("{}.peak", prefix), stat.peak);
    out.insert(format!("{}.allocated", prefix), stat.allocated);
    out.insert(format!("{}.freed", prefix), stat.freed);
}
