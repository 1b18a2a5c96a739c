#![cfg_attr(not(test), no_std)]

pub mod csum;

use core::{
    fmt,
    hash::Hash,
    net::{Ipv4Addr, Ipv6Addr},
};

pub const VERSION: u32 = 0x00000001;

/// Max number of service frontends per address family
pub const MAX_SERVICES: u32 = 65536;

/// Max number of backends shared by all services
pub const MAX_BACKENDS: u32 = 65536;

/// Max number of affinity entries before the least used are evicted
pub const MAX_AFFINITY: u32 = 65536;

/// Default Maglev lookup table size. Must be a prime number.
pub const MAGLEV_LUT_SIZE: u32 = 16381;

/// Wildcard protocol used by services that match any L4 protocol
pub const IPPROTO_ANY: u8 = 0;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

/// Address used as source for IPv4 flows where the client is also the
/// selected backend.
pub const DEFAULT_LOOPBACK_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 42, 1);

/// Common operations over IPv4 and IPv6 addresses so that tables and
/// datapath code can be written once for both families.
pub trait InetAddr:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Address length in bytes
    const LEN: usize;
    /// Address length in bits, also the longest prefix
    const BITS: u8;
    const UNSPECIFIED: Self;

    type Octets: AsRef<[u8]> + AsMut<[u8]> + Copy + Default;

    fn to_octets(&self) -> Self::Octets;

    fn from_octets(octets: Self::Octets) -> Self;

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut octets = Self::Octets::default();
        octets.as_mut().copy_from_slice(bytes);
        Some(Self::from_octets(octets))
    }

    /// Clears all bits past `prefix_len`.
    fn masked(&self, prefix_len: u8) -> Self {
        let mut octets = self.to_octets();
        let mut bits = prefix_len.min(Self::BITS) as usize;
        for b in octets.as_mut().iter_mut() {
            if bits >= 8 {
                bits -= 8;
                continue;
            }
            let keep = if bits == 0 { 0 } else { 0xffu8 << (8 - bits) };
            *b &= keep;
            bits = 0;
        }
        Self::from_octets(octets)
    }
}

impl InetAddr for Ipv4Addr {
    const LEN: usize = 4;
    const BITS: u8 = 32;
    const UNSPECIFIED: Self = Ipv4Addr::UNSPECIFIED;

    type Octets = [u8; 4];

    fn to_octets(&self) -> [u8; 4] {
        self.octets()
    }

    fn from_octets(octets: [u8; 4]) -> Self {
        Ipv4Addr::from(octets)
    }
}

impl InetAddr for Ipv6Addr {
    const LEN: usize = 16;
    const BITS: u8 = 128;
    const UNSPECIFIED: Self = Ipv6Addr::UNSPECIFIED;

    type Octets = [u8; 16];

    fn to_octets(&self) -> [u8; 16] {
        self.octets()
    }

    fn from_octets(octets: [u8; 16]) -> Self {
        Ipv6Addr::from(octets)
    }
}

bitflags::bitflags! {
    /// Service capability flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SvcFlags: u16 {
        const NODEPORT = 1 << 0;
        const EXTERNAL_IP = 1 << 1;
        const HOSTPORT = 1 << 2;
        /// Clients may also be backends of this service
        const LOOPBACK = 1 << 3;
        /// Service has distinct external and internal backend sets
        const TWO_SCOPES = 1 << 4;
        const AFFINITY = 1 << 5;
        /// Service has a source range list
        const SOURCE_RANGE = 1 << 6;
        /// Source range list is a deny list
        const SOURCE_RANGE_DENY = 1 << 7;
        const LOCAL_REDIRECT = 1 << 8;
        /// Traffic to local backends is delegated to the local L7 proxy
        const L7_DELEGATE = 1 << 9;
        /// Traffic is redirected to an L7 load balancer on `l7_proxy_port`
        const L7_LOADBALANCER = 1 << 10;
        const ROUTABLE = 1 << 11;
        const LOADBALANCER = 1 << 12;
    }
}

bitflags::bitflags! {
    /// Datapath features toggled by the node configuration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Features: u32 {
        const SESSION_AFFINITY = 1 << 0;
        const SRC_RANGE_CHECK = 1 << 1;
        const LOCAL_REDIRECT = 1 << 2;
        const LOOPBACK_LB = 1 << 3;
        const L7_LB = 1 << 4;
        const NO_BACKEND_RESPONSE = 1 << 5;
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::all()
    }
}

bitflags::bitflags! {
    /// Flow tuple flags, an empty set means the egress direction.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TupleFlags: u8 {
        const IN = 1 << 0;
        const RELATED = 1 << 1;
        /// Tuple is used for a service lookup
        const SERVICE = 1 << 2;
    }
}

/// Service lookup scope for services with split backend sets.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    #[default]
    External = 0,
    Internal = 1,
}

/// Backend selection algorithm.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    #[default]
    Random = 1,
    Maglev = 2,
    /// Always picks the first backend, for testing only
    First = 3,
}

/// Where the selection algorithm comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    Fixed(Algorithm),
    PerService,
}

impl Default for Selection {
    fn default() -> Self {
        Self::Fixed(Algorithm::Random)
    }
}

/// Datapath configuration shared by all invocations.
#[derive(Clone, Copy, Debug)]
pub struct LbConfig {
    pub features: Features,
    pub selection: Selection,
    /// Maglev lookup table size, must match the size the tables were built with
    pub maglev_lut_size: u32,
    pub loopback_ipv4: Ipv4Addr,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            features: Features::default(),
            selection: Selection::default(),
            maglev_lut_size: MAGLEV_LUT_SIZE,
            loopback_ipv4: DEFAULT_LOOPBACK_IPV4,
        }
    }
}

impl LbConfig {
    #[inline(always)]
    pub fn has(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }

    /// Resolves the algorithm for a service honoring the selection mode.
    pub fn algorithm(&self, svc: &Service) -> Algorithm {
        match self.selection {
            Selection::Fixed(alg) => alg,
            Selection::PerService => svc.algorithm,
        }
    }
}

/// Service frontend key. A non-zero `backend_slot` selects one backend of
/// the service instead of the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SvcKey<A> {
    pub address: A,
    pub dport: u16,
    pub backend_slot: u16,
    pub proto: u8,
    pub scope: Scope,
}

impl<A: InetAddr> SvcKey<A> {
    pub fn new(address: A, dport: u16, proto: u8) -> Self {
        Self {
            address,
            dport,
            backend_slot: 0,
            proto,
            scope: Scope::External,
        }
    }

    pub fn with_slot(&self, slot: u16) -> Self {
        Self {
            backend_slot: slot,
            ..*self
        }
    }

    pub fn with_scope(&self, scope: Scope) -> Self {
        Self { scope, ..*self }
    }
}

/// Service value. For frontend entries (slot 0) `count` holds the number
/// of backends, for slot entries `backend_id` holds the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub backend_id: u32,
    pub count: u16,
    pub rev_nat_index: u16,
    pub flags: SvcFlags,
    /// Affinity timeout in seconds
    pub affinity_timeout: u32,
    pub algorithm: Algorithm,
    /// Local L7 load balancer port, zero if not set
    pub l7_proxy_port: u16,
}

impl Service {
    pub fn frontend(count: u16, rev_nat_index: u16, flags: SvcFlags) -> Self {
        Self {
            count,
            rev_nat_index,
            flags,
            ..Default::default()
        }
    }

    pub fn slot(backend_id: u32, rev_nat_index: u16) -> Self {
        Self {
            backend_id,
            rev_nat_index,
            ..Default::default()
        }
    }

    pub fn is_nodeport(&self) -> bool {
        self.flags.contains(SvcFlags::NODEPORT)
    }

    pub fn is_external_ip(&self) -> bool {
        self.flags.contains(SvcFlags::EXTERNAL_IP)
    }

    pub fn is_hostport(&self) -> bool {
        self.flags.contains(SvcFlags::HOSTPORT)
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(SvcFlags::LOOPBACK)
    }

    pub fn is_two_scopes(&self) -> bool {
        self.flags.contains(SvcFlags::TWO_SCOPES)
    }

    pub fn is_affinity(&self) -> bool {
        self.flags.contains(SvcFlags::AFFINITY)
    }

    pub fn has_source_range(&self) -> bool {
        self.flags.contains(SvcFlags::SOURCE_RANGE)
    }

    pub fn is_source_range_deny(&self) -> bool {
        self.flags.contains(SvcFlags::SOURCE_RANGE_DENY)
    }

    pub fn is_local_redirect(&self) -> bool {
        self.flags.contains(SvcFlags::LOCAL_REDIRECT)
    }

    /// Traffic for this service is punted to the local proxy when the
    /// backend is local. Host port services never delegate.
    pub fn is_l7_punt_proxy(&self) -> bool {
        !self.is_hostport() && self.flags.contains(SvcFlags::L7_DELEGATE)
    }

    pub fn is_l7_loadbalancer(&self) -> bool {
        self.flags.contains(SvcFlags::L7_LOADBALANCER) && self.l7_proxy_port > 0
    }

    pub fn is_routable(&self) -> bool {
        self.flags.contains(SvcFlags::ROUTABLE)
    }

    pub fn is_loadbalancer(&self) -> bool {
        self.flags.contains(SvcFlags::LOADBALANCER)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendState {
    #[default]
    Active = 0,
    Terminating = 1,
    Quarantined = 2,
    Maintenance = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backend<A> {
    pub address: A,
    /// Zero keeps the service port
    pub port: u16,
    pub proto: u8,
    pub state: BackendState,
    /// Locality tag for connection accounting
    pub zone: u8,
    pub cluster_id: u32,
}

impl<A: InetAddr> Backend<A> {
    pub fn new(address: A, port: u16, proto: u8) -> Self {
        Self {
            address,
            port,
            proto,
            state: BackendState::Active,
            zone: 0,
            cluster_id: 0,
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.state == BackendState::Active
    }
}

/// Reverse NAT entry, restores the service frontend on replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevNat<A> {
    pub address: A,
    pub port: u16,
}

/// Client identity used for session affinity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AffinityClient<A> {
    Addr(A),
    NetnsCookie(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AffinityKey<A> {
    pub rev_nat_id: u16,
    pub client: AffinityClient<A>,
}

impl<A: InetAddr> AffinityKey<A> {
    pub fn by_addr(rev_nat_id: u16, addr: A) -> Self {
        Self {
            rev_nat_id,
            client: AffinityClient::Addr(addr),
        }
    }

    pub fn by_netns(rev_nat_id: u16, cookie: u64) -> Self {
        Self {
            rev_nat_id,
            client: AffinityClient::NetnsCookie(cookie),
        }
    }

    pub fn is_netns_cookie(&self) -> bool {
        matches!(self.client, AffinityClient::NetnsCookie(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AffinityValue {
    pub backend_id: u32,
    /// Monotonic time in seconds
    pub last_used: u64,
}

/// Existence of this key means the backend is still part of the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AffinityMatch {
    pub rev_nat_id: u16,
    pub backend_id: u32,
}

/// Longest prefix match key for the source range table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SrcRangeKey<A> {
    pub rev_nat_id: u16,
    pub prefix_len: u8,
    pub address: A,
}

impl<A: InetAddr> SrcRangeKey<A> {
    /// Full length key used for lookups.
    pub fn lookup(rev_nat_id: u16, address: A) -> Self {
        Self {
            rev_nat_id,
            prefix_len: A::BITS,
            address,
        }
    }

    pub fn prefix(rev_nat_id: u16, address: A, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(A::BITS);
        Self {
            rev_nat_id,
            prefix_len,
            address: address.masked(prefix_len),
        }
    }
}

/// Local redirect skip entry: a namespace that must reach the frontend
/// untranslated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SkipKey<A> {
    pub netns_cookie: u64,
    pub address: A,
    pub port: u16,
}

/// Flow tuple in connection tracking order: for a packet directed at a
/// service `dport` holds the packet source port and `sport` the
/// destination (service) port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowTuple<A> {
    pub daddr: A,
    pub saddr: A,
    pub dport: u16,
    pub sport: u16,
    pub nexthdr: u8,
    pub flags: TupleFlags,
}

impl<A: InetAddr> FlowTuple<A> {
    /// Builds a tuple from packet ordered fields.
    pub fn from_packet(saddr: A, daddr: A, src_port: u16, dst_port: u16, nexthdr: u8) -> Self {
        Self {
            daddr,
            saddr,
            dport: src_port,
            sport: dst_port,
            nexthdr,
            flags: TupleFlags::empty(),
        }
    }
}

/// Per flow connection state owned by connection tracking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtState {
    pub rev_nat_index: u16,
    pub backend_id: u32,
    pub syn: bool,
    pub closing: bool,
    pub loopback: bool,
}

/// Connection tracking lookup verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtStatus {
    New,
    Established,
    Reply,
    Related,
}

/// State handed over from the service stage to the next packet
/// processing stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LbContinuation {
    pub rev_nat_index: u16,
    pub loopback: bool,
    pub proxy_port: u16,
    pub cluster_id: u32,
}

impl LbContinuation {
    pub fn new(state: &CtState, proxy_port: u16, cluster_id: u32) -> Self {
        Self {
            rev_nat_index: state.rev_nat_index,
            loopback: state.loopback,
            proxy_port,
            cluster_id,
        }
    }

    /// Packs the context into three metadata words.
    pub fn to_meta(&self) -> [u32; 3] {
        [
            (self.rev_nat_index as u32) << 16 | self.loopback as u32,
            self.proxy_port as u32,
            self.cluster_id,
        ]
    }

    pub fn from_meta(meta: [u32; 3]) -> Self {
        Self {
            rev_nat_index: (meta[0] >> 16) as u16,
            loopback: meta[0] & 1 != 0,
            proxy_port: meta[1] as u16,
            cluster_id: meta[2],
        }
    }

    /// Restores the fields carried over into the connection state.
    pub fn restore(&self, state: &mut CtState) {
        state.rev_nat_index = self.rev_nat_index;
        state.loopback = self.loopback;
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitUsage {
    Icmpv6NoBackend = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub usage: RateLimitUsage,
    pub netdev_idx: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitValue {
    /// Nanoseconds
    pub last_topup: u64,
    pub tokens: u64,
}

pub mod stats {
    pub const PACKETS: u32 = 0;
    pub const FORWARD: u32 = 1;
    pub const SKIP_XLATE: u32 = 2;
    pub const PUNT_PROXY: u32 = 3;
    pub const NOT_SERVICE: u32 = 4;
    pub const DROP_NO_SERVICE: u32 = 5;
    pub const DROP_UNKNOWN_CT: u32 = 6;
    pub const DROP_CSUM_PROTO: u32 = 7;
    pub const DROP_WRITE_FAULT: u32 = 8;
    pub const DROP_UNSUPPORTED_L4: u32 = 9;
    pub const DROP_CT_CREATE: u32 = 10;
    pub const DROP_RATE_LIMITED: u32 = 11;
    pub const DROP_SRC_RANGE: u32 = 12;
    pub const DROP_INVALID: u32 = 13;
    pub const AFFINITY_HIT: u32 = 14;
    pub const AFFINITY_STALE: u32 = 15;
    pub const BACKEND_RESELECT: u32 = 16;
    pub const REV_NAT: u32 = 17;
    pub const ICMP_NO_SERVICE: u32 = 18;
    pub const MAX: u32 = 19;
}
