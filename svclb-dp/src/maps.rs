//! Table and environment contracts used by the datapath. Implementations
//! provide interior mutability, concurrent invocations share them by
//! reference.

use crate::{buffer::PacketBuffer, error::DropReason};
use svclb_common::{
    AffinityKey, AffinityMatch, AffinityValue, Backend, CtState, CtStatus, FlowTuple, InetAddr,
    RateLimitKey, RateLimitValue, RevNat, Service, SkipKey, SrcRangeKey, SvcKey,
};

/// Read-only service tables populated by the control plane.
pub trait ServiceMaps<A: InetAddr> {
    /// Exact match on the service key, including the backend slot.
    fn service_entry(&self, key: &SvcKey<A>) -> Option<Service>;

    fn backend_entry(&self, id: u32) -> Option<Backend<A>>;

    fn rev_nat_entry(&self, index: u16) -> Option<RevNat<A>>;

    /// Reads one bucket of the service Maglev table, `None` if the service
    /// has no table.
    fn maglev_entry(&self, rev_nat_index: u16, bucket: u32) -> Option<u32>;

    /// Longest prefix match of `key` against the configured source ranges.
    fn source_range_entry(&self, key: &SrcRangeKey<A>) -> bool;

    fn skip_entry(&self, key: &SkipKey<A>) -> bool;
}

/// Session affinity tables, written from the datapath. Entries may be
/// evicted at any time.
pub trait AffinityMaps<A: InetAddr> {
    fn affinity_entry(&self, key: &AffinityKey<A>) -> Option<AffinityValue>;

    fn upsert_affinity(&self, key: &AffinityKey<A>, value: &AffinityValue);

    fn delete_affinity(&self, key: &AffinityKey<A>);

    fn affinity_match_entry(&self, key: &AffinityMatch) -> bool;
}

pub trait Directory<A: InetAddr>: ServiceMaps<A> + AffinityMaps<A> {}

impl<A: InetAddr, T: ServiceMaps<A> + AffinityMaps<A>> Directory<A> for T {}

/// Connection tracking for service flows.
pub trait ConnTrack<A: InetAddr> {
    /// Looks up the service entry of `tuple` and fills `state` from it.
    /// The packet is used to inspect transport flags, the tuple flags may
    /// be changed.
    fn lookup_service<P: PacketBuffer>(
        &self,
        pkt: &P,
        l4_off: usize,
        tuple: &mut FlowTuple<A>,
        state: &mut CtState,
    ) -> Result<CtStatus, DropReason>;

    fn create_service(&self, tuple: &FlowTuple<A>, state: &CtState) -> Result<(), DropReason>;

    fn update_service_backend(&self, tuple: &FlowTuple<A>, backend_id: u32, rev_nat_index: u16);
}

pub trait RateLimitMaps {
    fn ratelimit_entry(&self, key: &RateLimitKey) -> Option<RateLimitValue>;

    fn upsert_ratelimit(&self, key: &RateLimitKey, value: &RateLimitValue);
}

/// Execution environment of one invocation.
pub trait Env<A: InetAddr> {
    /// Monotonic time in seconds
    fn mono_now(&self) -> u64;

    /// Monotonic time in nanoseconds
    fn ktime_ns(&self) -> u64;

    fn prandom_u32(&self) -> u32;

    fn is_local_endpoint(&self, addr: &A) -> bool;

    fn stats_inc(&self, _idx: u32) {}
}
