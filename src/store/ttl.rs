//! TTL to physical-table routing
//!
//! Metrics with similar lifetimes are grouped into the same table so that
//! date-tiered compaction keeps the number of SSTables intersecting any
//! query bounded (roughly 20-41 worst case with the default window factor).
//! The bucket is the largest power of two at or below the TTL in hours; the
//! compaction window is that pre-factor divided by the window factor, plus
//! one.

use std::collections::HashMap;

/// Table name template; the pre-factor replaces the `{}`.
pub const TABLE_NAME_FORMAT: &str = "metric_{}";

/// One routed table: its name and its compaction window in hours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTable {
    pub name: String,
    pub window_size: u32,
}

/// Routing map from each configured TTL to its table.
pub type TtlTables = HashMap<u32, TtlTable>;

fn pre_factor(ttl: u32) -> u32 {
    let hours = ttl / 3600;
    if hours == 0 {
        1
    } else {
        // largest power of two <= hours
        1 << (31 - hours.leading_zeros())
    }
}

/// Routes one TTL (seconds) to its table.
pub fn ttl_table(ttl: u32, window_factor: u32, name_format: &str) -> TtlTable {
    let factor = pre_factor(ttl);
    TtlTable {
        name: name_format.replace("{}", &factor.to_string()),
        window_size: factor / window_factor + 1,
    }
}

/// Routes every configured TTL. TTLs that land in the same power-of-two
/// bucket share a table.
pub fn ttl_tables(ttls: &[u32], window_factor: u32, name_format: &str) -> TtlTables {
    ttls.iter()
        .map(|ttl| (*ttl, ttl_table(*ttl, window_factor, name_format)))
        .collect()
}
