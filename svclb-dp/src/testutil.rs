//! In-memory tables, connection tracking and packet fixtures for tests.
#![allow(dead_code)]

use crate::{
    buffer::PacketBuffer,
    error::DropReason,
    family::L3Family,
    maps::{AffinityMaps, ConnTrack, Env, RateLimitMaps, ServiceMaps},
};
use core::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use svclb_common::{
    csum, stats, AffinityKey, AffinityMatch, AffinityValue, Backend, CtState, CtStatus, FlowTuple,
    InetAddr, RateLimitKey, RateLimitValue, RevNat, Service, SkipKey, SrcRangeKey, SvcFlags,
    SvcKey, TupleFlags, IPPROTO_TCP, IPPROTO_UDP,
};

pub const ETH_HLEN: usize = 14;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_ACK: u8 = 0x10;

pub fn svc_key<A: InetAddr>(address: A, dport: u16, proto: u8) -> SvcKey<A> {
    SvcKey::new(address, dport, proto)
}

pub struct Tables<A> {
    pub services: RefCell<HashMap<SvcKey<A>, Service>>,
    pub backends: RefCell<HashMap<u32, Backend<A>>>,
    pub rev_nat: RefCell<HashMap<u16, RevNat<A>>>,
    pub maglev: RefCell<HashMap<u16, Vec<u32>>>,
    pub src_ranges: RefCell<HashSet<SrcRangeKey<A>>>,
    pub skip: RefCell<HashSet<SkipKey<A>>>,
    pub affinity: RefCell<HashMap<AffinityKey<A>, AffinityValue>>,
    pub affinity_match: RefCell<HashSet<AffinityMatch>>,
    pub ratelimit: RefCell<HashMap<RateLimitKey, RateLimitValue>>,
}

impl<A> Default for Tables<A> {
    fn default() -> Self {
        Self {
            services: RefCell::default(),
            backends: RefCell::default(),
            rev_nat: RefCell::default(),
            maglev: RefCell::default(),
            src_ranges: RefCell::default(),
            skip: RefCell::default(),
            affinity: RefCell::default(),
            affinity_match: RefCell::default(),
            ratelimit: RefCell::default(),
        }
    }
}

impl<A: InetAddr> Tables<A> {
    /// Adds a frontend, its slots, reverse NAT and affinity match entries.
    pub fn add_service(
        &self,
        key: SvcKey<A>,
        rev_nat_index: u16,
        backends: &[u32],
        flags: SvcFlags,
    ) -> Service {
        let svc = Service::frontend(backends.len() as u16, rev_nat_index, flags);
        let mut services = self.services.borrow_mut();
        services.insert(key, svc);
        for (i, id) in backends.iter().enumerate() {
            services.insert(key.with_slot(i as u16 + 1), Service::slot(*id, rev_nat_index));
            self.affinity_match.borrow_mut().insert(AffinityMatch {
                rev_nat_id: rev_nat_index,
                backend_id: *id,
            });
        }
        self.rev_nat.borrow_mut().insert(
            rev_nat_index,
            RevNat {
                address: key.address,
                port: key.dport,
            },
        );
        svc
    }

    pub fn update_service(&self, key: SvcKey<A>, f: impl FnOnce(&mut Service)) -> Service {
        let mut services = self.services.borrow_mut();
        let svc = services.get_mut(&key).unwrap();
        f(svc);
        *svc
    }

    pub fn add_backend(&self, id: u32, address: A, port: u16) {
        self.backends
            .borrow_mut()
            .insert(id, Backend::new(address, port, 0));
    }

    pub fn update_backend(&self, id: u32, f: impl FnOnce(&mut Backend<A>)) {
        f(self.backends.borrow_mut().get_mut(&id).unwrap());
    }

    pub fn add_src_range(&self, rev_nat_id: u16, address: A, prefix_len: u8) {
        self.src_ranges
            .borrow_mut()
            .insert(SrcRangeKey::prefix(rev_nat_id, address, prefix_len));
    }

    pub fn set_maglev(&self, rev_nat_index: u16, table: Vec<u32>) {
        self.maglev.borrow_mut().insert(rev_nat_index, table);
    }
}

impl<A: InetAddr> ServiceMaps<A> for Tables<A> {
    fn service_entry(&self, key: &SvcKey<A>) -> Option<Service> {
        self.services.borrow().get(key).copied()
    }

    fn backend_entry(&self, id: u32) -> Option<Backend<A>> {
        self.backends.borrow().get(&id).copied()
    }

    fn rev_nat_entry(&self, index: u16) -> Option<RevNat<A>> {
        self.rev_nat.borrow().get(&index).copied()
    }

    fn maglev_entry(&self, rev_nat_index: u16, bucket: u32) -> Option<u32> {
        self.maglev
            .borrow()
            .get(&rev_nat_index)
            .and_then(|t| t.get(bucket as usize).copied())
    }

    fn source_range_entry(&self, key: &SrcRangeKey<A>) -> bool {
        let ranges = self.src_ranges.borrow();
        (0..=key.prefix_len)
            .rev()
            .any(|len| ranges.contains(&SrcRangeKey::prefix(key.rev_nat_id, key.address, len)))
    }

    fn skip_entry(&self, key: &SkipKey<A>) -> bool {
        self.skip.borrow().contains(key)
    }
}

impl<A: InetAddr> AffinityMaps<A> for Tables<A> {
    fn affinity_entry(&self, key: &AffinityKey<A>) -> Option<AffinityValue> {
        self.affinity.borrow().get(key).copied()
    }

    fn upsert_affinity(&self, key: &AffinityKey<A>, value: &AffinityValue) {
        self.affinity.borrow_mut().insert(*key, *value);
    }

    fn delete_affinity(&self, key: &AffinityKey<A>) {
        self.affinity.borrow_mut().remove(key);
    }

    fn affinity_match_entry(&self, key: &AffinityMatch) -> bool {
        self.affinity_match.borrow().contains(key)
    }
}

impl<A> RateLimitMaps for Tables<A> {
    fn ratelimit_entry(&self, key: &RateLimitKey) -> Option<RateLimitValue> {
        self.ratelimit.borrow().get(key).copied()
    }

    fn upsert_ratelimit(&self, key: &RateLimitKey, value: &RateLimitValue) {
        self.ratelimit.borrow_mut().insert(*key, *value);
    }
}

pub struct TestCt<A> {
    pub entries: RefCell<HashMap<FlowTuple<A>, CtState>>,
    pub fail_create: Cell<bool>,
    pub status_override: Cell<Option<CtStatus>>,
}

impl<A> Default for TestCt<A> {
    fn default() -> Self {
        Self {
            entries: RefCell::default(),
            fail_create: Cell::new(false),
            status_override: Cell::new(None),
        }
    }
}

impl<A: InetAddr> TestCt<A> {
    fn service_tuple(tuple: &FlowTuple<A>) -> FlowTuple<A> {
        FlowTuple {
            flags: TupleFlags::SERVICE,
            ..*tuple
        }
    }

    pub fn backend_of(&self, tuple: &FlowTuple<A>) -> Option<u32> {
        self.entries
            .borrow()
            .get(&Self::service_tuple(tuple))
            .map(|s| s.backend_id)
    }
}

impl<A: InetAddr> ConnTrack<A> for TestCt<A> {
    fn lookup_service<P: PacketBuffer>(
        &self,
        pkt: &P,
        l4_off: usize,
        tuple: &mut FlowTuple<A>,
        state: &mut CtState,
    ) -> Result<CtStatus, DropReason> {
        tuple.flags = TupleFlags::SERVICE;
        if let Some(status) = self.status_override.get() {
            return Ok(status);
        }

        let mut syn = false;
        if tuple.nexthdr == IPPROTO_TCP {
            let flags = pkt.load_u8(l4_off + 13)?;
            syn = flags & TCP_SYN != 0 && flags & TCP_ACK == 0;
        }

        match self.entries.borrow().get(tuple) {
            Some(entry) => {
                *state = CtState { syn, ..*entry };
                Ok(CtStatus::Reply)
            }
            None => {
                *state = CtState {
                    syn,
                    ..Default::default()
                };
                Ok(CtStatus::New)
            }
        }
    }

    fn create_service(&self, tuple: &FlowTuple<A>, state: &CtState) -> Result<(), DropReason> {
        if self.fail_create.get() {
            return Err(DropReason::ConnectionCreateFailed);
        }
        self.entries
            .borrow_mut()
            .insert(Self::service_tuple(tuple), *state);
        Ok(())
    }

    fn update_service_backend(&self, tuple: &FlowTuple<A>, backend_id: u32, rev_nat_index: u16) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(&Self::service_tuple(tuple)) {
            entry.backend_id = backend_id;
            entry.rev_nat_index = rev_nat_index;
        }
    }
}

pub struct TestEnv<A> {
    pub now: Cell<u64>,
    pub now_ns: Cell<u64>,
    pub rand: Cell<u32>,
    pub locals: RefCell<Vec<A>>,
    pub stats: RefCell<[u64; stats::MAX as usize]>,
}

impl<A> Default for TestEnv<A> {
    fn default() -> Self {
        Self {
            now: Cell::new(1000),
            now_ns: Cell::new(1_000_000_000),
            rand: Cell::new(0),
            locals: RefCell::default(),
            stats: RefCell::new([0; stats::MAX as usize]),
        }
    }
}

impl<A> TestEnv<A> {
    pub fn stat(&self, idx: u32) -> u64 {
        self.stats.borrow()[idx as usize]
    }
}

impl<A: InetAddr> Env<A> for TestEnv<A> {
    fn mono_now(&self) -> u64 {
        self.now.get()
    }

    fn ktime_ns(&self) -> u64 {
        self.now_ns.get()
    }

    fn prandom_u32(&self) -> u32 {
        // xorshift, seeded by the test
        let mut x = self.rand.get().wrapping_add(0x9e37_79b9);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rand.set(x);
        x
    }

    fn is_local_endpoint(&self, addr: &A) -> bool {
        self.locals.borrow().contains(addr)
    }

    fn stats_inc(&self, idx: u32) {
        self.stats.borrow_mut()[idx as usize] += 1;
    }
}

pub fn l4_off<A: L3Family>() -> usize {
    ETH_HLEN + A::HDR_LEN
}

/// Builds an Ethernet framed TCP or UDP packet with valid checksums.
pub fn build_packet<A: L3Family>(
    saddr: A,
    daddr: A,
    proto: u8,
    sport: u16,
    dport: u16,
    tcp_flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let l4_hlen = if proto == IPPROTO_TCP { 20 } else { 8 };
    let l4_len = l4_hlen + payload.len();

    let mut pkt = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
    if A::LEN == 4 {
        pkt.extend_from_slice(&[0x08, 0x00]);
        let tot_len = (20 + l4_len) as u16;
        pkt.extend_from_slice(&[0x45, 0x10]);
        pkt.extend_from_slice(&tot_len.to_be_bytes());
        pkt.extend_from_slice(&[0x12, 0x34, 0x40, 0x00, 64, proto, 0, 0]);
    } else {
        pkt.extend_from_slice(&[0x86, 0xdd]);
        pkt.extend_from_slice(&[0x60, 0, 0, 0]);
        pkt.extend_from_slice(&(l4_len as u16).to_be_bytes());
        pkt.extend_from_slice(&[proto, 64]);
    }
    pkt.extend_from_slice(saddr.to_octets().as_ref());
    pkt.extend_from_slice(daddr.to_octets().as_ref());
    if A::LEN == 4 {
        let check = csum::ipv4_header_csum(&pkt[ETH_HLEN..ETH_HLEN + 20]);
        pkt[ETH_HLEN + 10..ETH_HLEN + 12].copy_from_slice(&check.to_be_bytes());
    }

    let l4 = pkt.len();
    pkt.extend_from_slice(&sport.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    let check_off = if proto == IPPROTO_TCP {
        pkt.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, tcp_flags, 0xff, 0xff, 0, 0, 0, 0]);
        16
    } else {
        pkt.extend_from_slice(&(l4_len as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        6
    };
    pkt.extend_from_slice(payload);

    let check = csum::l4_csum(&saddr, &daddr, proto, &pkt[l4..]);
    pkt[l4 + check_off..l4 + check_off + 2].copy_from_slice(&check.to_be_bytes());
    pkt
}

pub fn addrs<A: L3Family>(pkt: &[u8]) -> (A, A) {
    let saddr = A::from_slice(&pkt[ETH_HLEN + A::SADDR_OFF..ETH_HLEN + A::SADDR_OFF + A::LEN]);
    let daddr = A::from_slice(&pkt[ETH_HLEN + A::DADDR_OFF..ETH_HLEN + A::DADDR_OFF + A::LEN]);
    (saddr.unwrap(), daddr.unwrap())
}

pub fn ports<A: L3Family>(pkt: &[u8]) -> (u16, u16) {
    let l4 = l4_off::<A>();
    (
        u16::from_be_bytes([pkt[l4], pkt[l4 + 1]]),
        u16::from_be_bytes([pkt[l4 + 2], pkt[l4 + 3]]),
    )
}

/// Asserts the IPv4 header checksum and the transport checksum stored in
/// `pkt` equal a full recompute over the final bytes.
pub fn assert_checksums<A: L3Family>(pkt: &[u8], proto: u8) {
    let l4 = l4_off::<A>();
    if A::LEN == 4 {
        let mut hdr = pkt[ETH_HLEN..l4].to_vec();
        let stored = u16::from_be_bytes([hdr[10], hdr[11]]);
        hdr[10] = 0;
        hdr[11] = 0;
        assert_eq!(stored, csum::ipv4_header_csum(&hdr), "ipv4 header checksum");
    }

    let check_off = match proto {
        IPPROTO_TCP => 16,
        IPPROTO_UDP => 6,
        _ => 2,
    };
    let mut segment = pkt[l4..].to_vec();
    let stored = u16::from_be_bytes([segment[check_off], segment[check_off + 1]]);
    segment[check_off] = 0;
    segment[check_off + 1] = 0;
    let (saddr, daddr) = addrs::<A>(pkt);
    assert_eq!(
        stored,
        csum::l4_csum(&saddr, &daddr, proto, &segment),
        "l4 checksum"
    );
}
