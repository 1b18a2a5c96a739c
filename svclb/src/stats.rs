use crate::info::InfoTable;
use std::sync::atomic::{AtomicU64, Ordering};
use svclb_common::stats;

static STATS_NAMES: [&str; stats::MAX as usize] = [
    "packets",
    "forward",
    "skip_xlate",
    "punt_proxy",
    "not_service",
    "drop_no_service",
    "drop_unknown_ct",
    "drop_csum_proto",
    "drop_write_fault",
    "drop_unsupported_l4",
    "drop_ct_create",
    "drop_rate_limited",
    "drop_src_range",
    "drop_invalid",
    "affinity_hit",
    "affinity_stale",
    "backend_reselect",
    "rev_nat",
    "icmp_no_service",
];

/// Datapath counters shared by all workers.
pub struct Stats {
    counters: [AtomicU64; stats::MAX as usize],
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Stats {
    pub fn inc(&self, stat_idx: u32) {
        match self.counters.get(stat_idx as usize) {
            Some(c) => {
                c.fetch_add(1, Ordering::Relaxed);
            }
            None => log::error!("Unknown stat index {}", stat_idx),
        }
    }

    pub fn get(&self, stat_idx: u32) -> u64 {
        self.counters
            .get(stat_idx as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn as_str(stat_idx: u32) -> &'static str {
        STATS_NAMES.get(stat_idx as usize).copied().unwrap_or("unknown")
    }

    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn print_all(&self, title: &str) {
        let mut sinfo = InfoTable::new(vec!["stat", "count"]);
        for idx in 0..stats::MAX {
            let count = self.get(idx);
            if count == 0 {
                continue;
            }
            sinfo.push_row(vec![Self::as_str(idx).to_string(), count.to_string()]);
        }
        sinfo.print(title);
    }
}
