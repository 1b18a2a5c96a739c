//! In-memory service directory shared by all datapath workers. Lookups
//! never block writers for longer than one shard lock.

use dashmap::{DashMap, DashSet};
use moka::sync::Cache;
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};
use svclb_common::{
    AffinityKey, AffinityMatch, AffinityValue, Backend, InetAddr, RateLimitKey, RateLimitValue,
    RevNat, Service, SkipKey, SrcRangeKey, SvcKey, MAX_AFFINITY,
};
use svclb_dp::{AffinityMaps, L3Family, RateLimitMaps, ServiceMaps};

pub struct ServiceTables<A: InetAddr> {
    pub(crate) services: DashMap<SvcKey<A>, Service>,
    pub(crate) backends: DashMap<u32, Backend<A>>,
    pub(crate) rev_nat: DashMap<u16, RevNat<A>>,
    pub(crate) maglev: DashMap<u16, Arc<Vec<u32>>>,
    src_ranges: DashSet<SrcRangeKey<A>>,
    /// Prefix lengths present per reverse NAT index
    src_prefixes: DashMap<u16, BTreeSet<u8>>,
    pub(crate) skip: DashSet<SkipKey<A>>,
    affinity: Cache<AffinityKey<A>, AffinityValue>,
    affinity_match: DashSet<AffinityMatch>,
    ratelimit: DashMap<RateLimitKey, RateLimitValue>,
}

impl<A: InetAddr> Default for ServiceTables<A> {
    fn default() -> Self {
        Self::with_affinity_capacity(MAX_AFFINITY as u64)
    }
}

impl<A: InetAddr> ServiceTables<A> {
    pub fn with_affinity_capacity(capacity: u64) -> Self {
        Self {
            services: DashMap::new(),
            backends: DashMap::new(),
            rev_nat: DashMap::new(),
            maglev: DashMap::new(),
            src_ranges: DashSet::new(),
            src_prefixes: DashMap::new(),
            skip: DashSet::new(),
            affinity: Cache::new(capacity),
            affinity_match: DashSet::new(),
            ratelimit: DashMap::new(),
        }
    }

    pub fn insert_service(&self, key: SvcKey<A>, svc: Service) {
        self.services.insert(key, svc);
    }

    pub fn insert_backend(&self, id: u32, backend: Backend<A>) {
        self.backends.insert(id, backend);
    }

    /// Applies `f` to a backend in place, returns false if it is missing.
    pub fn update_backend(&self, id: u32, f: impl FnOnce(&mut Backend<A>)) -> bool {
        match self.backends.get_mut(&id) {
            Some(mut be) => {
                f(be.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn insert_rev_nat(&self, index: u16, nat: RevNat<A>) {
        self.rev_nat.insert(index, nat);
    }

    pub fn set_maglev(&self, rev_nat_index: u16, table: Vec<u32>) {
        self.maglev.insert(rev_nat_index, Arc::new(table));
    }

    pub fn maglev_table(&self, rev_nat_index: u16) -> Option<Arc<Vec<u32>>> {
        self.maglev.get(&rev_nat_index).map(|t| t.value().clone())
    }

    pub fn insert_src_range(&self, rev_nat_id: u16, address: A, prefix_len: u8) {
        let key = SrcRangeKey::prefix(rev_nat_id, address, prefix_len);
        self.src_prefixes
            .entry(rev_nat_id)
            .or_default()
            .insert(key.prefix_len);
        self.src_ranges.insert(key);
    }

    pub fn insert_skip(&self, key: SkipKey<A>) {
        self.skip.insert(key);
    }

    pub fn insert_affinity_match(&self, rev_nat_id: u16, backend_id: u32) {
        self.affinity_match.insert(AffinityMatch {
            rev_nat_id,
            backend_id,
        });
    }

    /// Frontend entries, slot 0 only.
    pub fn frontends(&self) -> Vec<(SvcKey<A>, Service)> {
        let mut list = self
            .services
            .iter()
            .filter(|e| e.key().backend_slot == 0)
            .map(|e| (*e.key(), *e.value()))
            .collect::<Vec<_>>();
        list.sort_by_key(|(k, s)| (s.rev_nat_index, k.scope));
        list
    }

    /// Backend ids of a frontend in slot order.
    pub fn slots(&self, key: &SvcKey<A>, count: u16) -> Vec<u32> {
        (1..=count)
            .filter_map(|slot| self.services.get(&key.with_slot(slot)).map(|s| s.backend_id))
            .collect()
    }

    pub fn affinity_len(&self) -> u64 {
        self.affinity.run_pending_tasks();
        self.affinity.entry_count()
    }
}

impl<A: InetAddr> ServiceMaps<A> for ServiceTables<A> {
    fn service_entry(&self, key: &SvcKey<A>) -> Option<Service> {
        self.services.get(key).map(|s| *s.value())
    }

    fn backend_entry(&self, id: u32) -> Option<Backend<A>> {
        self.backends.get(&id).map(|b| *b.value())
    }

    fn rev_nat_entry(&self, index: u16) -> Option<RevNat<A>> {
        self.rev_nat.get(&index).map(|n| *n.value())
    }

    fn maglev_entry(&self, rev_nat_index: u16, bucket: u32) -> Option<u32> {
        self.maglev
            .get(&rev_nat_index)
            .and_then(|t| t.get(bucket as usize).copied())
    }

    fn source_range_entry(&self, key: &SrcRangeKey<A>) -> bool {
        let Some(prefixes) = self.src_prefixes.get(&key.rev_nat_id) else {
            return false;
        };
        prefixes
            .iter()
            .rev()
            .filter(|len| **len <= key.prefix_len)
            .any(|len| {
                self.src_ranges
                    .contains(&SrcRangeKey::prefix(key.rev_nat_id, key.address, *len))
            })
    }

    fn skip_entry(&self, key: &SkipKey<A>) -> bool {
        self.skip.contains(key)
    }
}

impl<A: InetAddr> AffinityMaps<A> for ServiceTables<A> {
    fn affinity_entry(&self, key: &AffinityKey<A>) -> Option<AffinityValue> {
        self.affinity.get(key)
    }

    fn upsert_affinity(&self, key: &AffinityKey<A>, value: &AffinityValue) {
        self.affinity.insert(*key, *value);
    }

    fn delete_affinity(&self, key: &AffinityKey<A>) {
        self.affinity.invalidate(key);
    }

    fn affinity_match_entry(&self, key: &AffinityMatch) -> bool {
        self.affinity_match.contains(key)
    }
}

impl<A: InetAddr> RateLimitMaps for ServiceTables<A> {
    fn ratelimit_entry(&self, key: &RateLimitKey) -> Option<RateLimitValue> {
        self.ratelimit.get(key).map(|v| *v.value())
    }

    fn upsert_ratelimit(&self, key: &RateLimitKey, value: &RateLimitValue) {
        self.ratelimit.insert(*key, *value);
    }
}

/// Tables of both address families.
#[derive(Default)]
pub struct Directory {
    pub v4: ServiceTables<Ipv4Addr>,
    pub v6: ServiceTables<Ipv6Addr>,
}

/// Selects the tables of an address family.
pub trait FamilyTables: L3Family + Into<IpAddr> {
    fn tables(dir: &Directory) -> &ServiceTables<Self>;

    fn from_ip(ip: &IpAddr) -> Option<Self>;
}

impl FamilyTables for Ipv4Addr {
    fn tables(dir: &Directory) -> &ServiceTables<Self> {
        &dir.v4
    }

    fn from_ip(ip: &IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V4(ip) => Some(*ip),
            IpAddr::V6(_) => None,
        }
    }
}

impl FamilyTables for Ipv6Addr {
    fn tables(dir: &Directory) -> &ServiceTables<Self> {
        &dir.v6
    }

    fn from_ip(ip: &IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V6(ip) => Some(*ip),
            IpAddr::V4(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_match() {
        let t = ServiceTables::<Ipv4Addr>::default();
        t.insert_src_range(1, Ipv4Addr::new(10, 0, 0, 0), 8);
        t.insert_src_range(1, Ipv4Addr::new(192, 168, 1, 77), 24);
        t.insert_src_range(2, Ipv4Addr::new(172, 16, 0, 0), 12);

        let hit = |id, ip| t.source_range_entry(&SrcRangeKey::lookup(id, ip));
        assert!(hit(1, Ipv4Addr::new(10, 200, 3, 4)));
        assert!(hit(1, Ipv4Addr::new(192, 168, 1, 5)));
        assert!(!hit(1, Ipv4Addr::new(192, 168, 2, 5)));
        assert!(!hit(1, Ipv4Addr::new(172, 16, 0, 1)));
        assert!(hit(2, Ipv4Addr::new(172, 31, 255, 1)));
        assert!(!hit(3, Ipv4Addr::new(10, 0, 0, 1)));

    }

    #[test]
    fn test_affinity_capacity_is_bounded() {
        let t = ServiceTables::<Ipv6Addr>::with_affinity_capacity(16);
        for i in 0..256u32 {
            let key = AffinityKey::by_netns(1, i as u64);
            t.upsert_affinity(
                &key,
                &AffinityValue {
                    backend_id: i,
                    last_used: 0,
                },
            );
        }
        assert!(t.affinity_len() <= 16);
    }

    #[test]
    fn test_slots_and_frontends() {
        let t = ServiceTables::<Ipv4Addr>::default();
        let key = SvcKey::new(Ipv4Addr::new(1, 1, 1, 1), 80, 6);
        t.insert_service(key, Service::frontend(2, 5, Default::default()));
        t.insert_service(key.with_slot(1), Service::slot(11, 5));
        t.insert_service(key.with_slot(2), Service::slot(12, 5));
        assert_eq!(t.frontends().len(), 1);
        assert_eq!(t.slots(&key, 2), vec![11, 12]);
        assert!(!t.update_backend(11, |_| {}));
    }
}
