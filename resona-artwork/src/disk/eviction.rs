//! Pure eviction planning for the disk tier.
//!
//! Separated from the filesystem so the age sweep, the LRU sweep, and the
//! hysteresis low-water mark can be tested without touching disk.

use chrono::{DateTime, TimeDelta, Utc};

use super::manifest::DiskRecord;

/// Evict down to this fraction of the byte budget once the budget is
/// exceeded, so a single new write cannot immediately re-trigger a sweep.
const LOW_WATER_NUMERATOR: u64 = 8;
const LOW_WATER_DENOMINATOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    AgeExpired,
    OverSizeBudget,
}

#[derive(Debug, Clone)]
pub struct PlannedEviction {
    pub key_hash: String,
    pub filename: String,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

#[derive(Debug, Default)]
pub struct EvictionPlan {
    pub planned: Vec<PlannedEviction>,
    pub total_bytes_before: u64,
    pub total_bytes_after: u64,
    pub removed_age: usize,
    pub removed_size: usize,
}

pub fn low_water_bytes(max_bytes: u64) -> u64 {
    max_bytes / LOW_WATER_DENOMINATOR * LOW_WATER_NUMERATOR
}

pub fn plan_evictions(
    mut records: Vec<DiskRecord>,
    now: DateTime<Utc>,
    max_age: TimeDelta,
    max_bytes: u64,
) -> EvictionPlan {
    let mut plan = EvictionPlan::default();

    let mut total_bytes: u64 = records
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.size_bytes));
    plan.total_bytes_before = total_bytes;

    // Age sweep first, regardless of size pressure.
    let mut kept: Vec<DiskRecord> = Vec::with_capacity(records.len());
    for record in records.drain(..) {
        let age = now.signed_duration_since(record.created_at);
        if max_age > TimeDelta::zero() && age > max_age {
            total_bytes = total_bytes.saturating_sub(record.size_bytes);
            plan.planned.push(PlannedEviction {
                key_hash: record.key_hash,
                filename: record.filename,
                size_bytes: record.size_bytes,
                reason: EvictionReason::AgeExpired,
            });
            plan.removed_age += 1;
        } else {
            kept.push(record);
        }
    }

    // Size sweep next: LRU by last_accessed, down to the low-water mark.
    if max_bytes > 0 && total_bytes > max_bytes {
        let low_water = low_water_bytes(max_bytes);
        kept.sort_by_key(|r| r.last_accessed);
        for record in kept {
            if total_bytes <= low_water {
                break;
            }
            total_bytes = total_bytes.saturating_sub(record.size_bytes);
            plan.planned.push(PlannedEviction {
                key_hash: record.key_hash,
                filename: record.filename,
                size_bytes: record.size_bytes,
                reason: EvictionReason::OverSizeBudget,
            });
            plan.removed_size += 1;
        }
    }

    plan.total_bytes_after = total_bytes;
    plan
}
