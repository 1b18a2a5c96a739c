use crate::{helpers, stats::Stats};
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use svclb_common::InetAddr;
use svclb_dp::Env;

/// Datapath environment backed by the host clock and thread local random
/// numbers. The clock can be moved forward to replay timeouts.
pub struct HostEnv {
    locals: HashSet<IpAddr>,
    stats: Arc<Stats>,
    skew_ns: AtomicU64,
}

impl HostEnv {
    pub fn new(locals: impl IntoIterator<Item = IpAddr>, stats: Arc<Stats>) -> Self {
        Self {
            locals: locals.into_iter().collect(),
            stats,
            skew_ns: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn advance(&self, secs: u64) {
        self.skew_ns
            .fetch_add(secs * 1_000_000_000, Ordering::Relaxed);
    }

    fn now_ns(&self) -> u64 {
        helpers::get_monotonic_clock_ns() + self.skew_ns.load(Ordering::Relaxed)
    }
}

impl<A: InetAddr + Into<IpAddr>> Env<A> for HostEnv {
    fn mono_now(&self) -> u64 {
        self.now_ns() / 1_000_000_000
    }

    fn ktime_ns(&self) -> u64 {
        self.now_ns()
    }

    fn prandom_u32(&self) -> u32 {
        rand::random::<u32>()
    }

    fn is_local_endpoint(&self, addr: &A) -> bool {
        self.locals.contains(&(*addr).into())
    }

    fn stats_inc(&self, idx: u32) {
        self.stats.inc(idx)
    }
}
