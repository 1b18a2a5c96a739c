use crate::{
    backends::EndPoint,
    env::HostEnv,
    helpers::PrintTimeStatus,
    info::InfoTable,
};
use dashmap::DashMap;
use log::{debug, info};
use std::{net::IpAddr, sync::Arc};
use svclb_common::{CtState, CtStatus, FlowTuple, InetAddr, TupleFlags, IPPROTO_TCP};
use svclb_dp::{ConnTrack, DropReason, Env, PacketBuffer};

/// Established TCP flows
pub const CT_LIFETIME_TCP: u64 = 6 * 3600;
/// TCP flows that only saw a SYN
pub const CT_SYN_TIMEOUT: u64 = 60;
pub const CT_LIFETIME_NONTCP: u64 = 60;
/// Flows that saw a FIN or RST
pub const CT_CLOSE_TIMEOUT: u64 = 10;

pub const CT_DEFAULT_CAPACITY: usize = 1 << 18;

const TCP_FLAGS_OFF: usize = 13;
const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_ACK: u8 = 0x10;

#[derive(Clone, Copy, Debug)]
struct CtEntry {
    state: CtState,
    /// Monotonic seconds
    expires: u64,
    packets: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SeenFlags {
    syn: bool,
    closing: bool,
}

fn lifetime(nexthdr: u8, seen: SeenFlags, closing: bool) -> u64 {
    if closing {
        CT_CLOSE_TIMEOUT
    } else if nexthdr != IPPROTO_TCP {
        CT_LIFETIME_NONTCP
    } else if seen.syn {
        CT_SYN_TIMEOUT
    } else {
        CT_LIFETIME_TCP
    }
}

/// Connection tracker for service flows, keyed by the service tuple.
pub struct ConnTracker<A: InetAddr> {
    entries: DashMap<FlowTuple<A>, CtEntry>,
    capacity: usize,
    env: Arc<HostEnv>,
}

impl<A: InetAddr + Into<IpAddr>> ConnTracker<A> {
    pub fn new(env: Arc<HostEnv>, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            env,
        }
    }

    fn now(&self) -> u64 {
        Env::<A>::mono_now(self.env.as_ref())
    }

    fn service_tuple(tuple: &FlowTuple<A>) -> FlowTuple<A> {
        FlowTuple {
            flags: TupleFlags::SERVICE,
            ..*tuple
        }
    }

    fn seen_flags<P: PacketBuffer>(pkt: &P, l4_off: usize, nexthdr: u8) -> SeenFlags {
        if nexthdr != IPPROTO_TCP {
            return SeenFlags::default();
        }
        match pkt.load_u8(l4_off + TCP_FLAGS_OFF) {
            Ok(flags) => SeenFlags {
                syn: flags & TCP_SYN != 0 && flags & TCP_ACK == 0,
                closing: flags & (TCP_FIN | TCP_RST) != 0,
            },
            Err(_) => SeenFlags::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Connection state of a service flow, if tracked and not expired.
    pub fn state_of(&self, tuple: &FlowTuple<A>) -> Option<CtState> {
        let now = self.now();
        self.entries
            .get(&Self::service_tuple(tuple))
            .filter(|e| e.expires > now)
            .map(|e| e.state)
    }

    /// Removes expired entries, returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = self.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!("[ct] Removed {} expired entries", removed);
        }
        removed
    }

    pub fn remove_all(&self) {
        let count = self.entries.len();
        self.entries.clear();
        info!("[ct] Remove summary, count: {}", count);
    }

    pub fn list(&self, title: &str) {
        let status = PrintTimeStatus::new(self.now());
        let mut tab = InfoTable::new(vec![
            "client", "frontend", "backend", "rev_nat", "flags", "packets", "expiry",
        ]);
        let mut rows = self
            .entries
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect::<Vec<_>>();
        rows.sort_by_key(|(k, _)| (k.daddr, k.sport, k.saddr, k.dport));
        for (key, entry) in rows {
            let client = EndPoint::new(key.saddr, key.nexthdr, key.dport);
            let frontend = EndPoint::new(key.daddr, key.nexthdr, key.sport);
            let mut flags = vec![];
            if entry.state.syn {
                flags.push("syn");
            }
            if entry.state.closing {
                flags.push("closing");
            }
            if entry.state.loopback {
                flags.push("loopback");
            }
            tab.push_row(vec![
                client.to_string(),
                frontend.to_string(),
                entry.state.backend_id.to_string(),
                entry.state.rev_nat_index.to_string(),
                flags.join(","),
                entry.packets.to_string(),
                status.status(entry.expires),
            ]);
        }
        tab.print(title);
    }
}

impl<A: InetAddr + Into<IpAddr>> ConnTrack<A> for ConnTracker<A> {
    fn lookup_service<P: PacketBuffer>(
        &self,
        pkt: &P,
        l4_off: usize,
        tuple: &mut FlowTuple<A>,
        state: &mut CtState,
    ) -> Result<CtStatus, DropReason> {
        tuple.flags = TupleFlags::SERVICE;
        let seen = Self::seen_flags(pkt, l4_off, tuple.nexthdr);
        let now = self.now();

        if let Some(mut entry) = self.entries.get_mut(tuple) {
            if entry.expires > now {
                entry.state.closing |= seen.closing;
                entry.expires = now + lifetime(tuple.nexthdr, seen, entry.state.closing);
                entry.packets += 1;
                *state = CtState {
                    syn: seen.syn,
                    ..entry.state
                };
                return Ok(CtStatus::Reply);
            }
        }
        // expired entries are replaced on create
        self.entries.remove_if(tuple, |_, e| e.expires <= now);

        *state = CtState {
            syn: seen.syn,
            closing: seen.closing,
            ..Default::default()
        };
        Ok(CtStatus::New)
    }

    fn create_service(&self, tuple: &FlowTuple<A>, state: &CtState) -> Result<(), DropReason> {
        let key = Self::service_tuple(tuple);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            debug!("[ct] table full, {} entries", self.entries.len());
            return Err(DropReason::ConnectionCreateFailed);
        }

        let seen = SeenFlags {
            syn: state.syn,
            closing: state.closing,
        };
        let entry = CtEntry {
            state: *state,
            expires: self.now() + lifetime(key.nexthdr, seen, state.closing),
            packets: 1,
        };
        self.entries.insert(key, entry);
        Ok(())
    }

    fn update_service_backend(&self, tuple: &FlowTuple<A>, backend_id: u32, rev_nat_index: u16) {
        if let Some(mut entry) = self.entries.get_mut(&Self::service_tuple(tuple)) {
            entry.state.backend_id = backend_id;
            entry.state.rev_nat_index = rev_nat_index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use std::net::Ipv4Addr;
    use svclb_common::IPPROTO_UDP;

    fn tracker(capacity: usize) -> (Arc<HostEnv>, ConnTracker<Ipv4Addr>) {
        let env = Arc::new(HostEnv::new(vec![], Arc::new(Stats::default())));
        (env.clone(), ConnTracker::new(env, capacity))
    }

    fn tuple(client_port: u16, proto: u8) -> FlowTuple<Ipv4Addr> {
        FlowTuple::from_packet(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(192, 168, 0, 1),
            client_port,
            80,
            proto,
        )
    }

    /// Bytes up to and including the TCP flags of a segment at offset 0.
    fn segment(flags: u8) -> Vec<u8> {
        let mut seg = vec![0u8; 20];
        seg[TCP_FLAGS_OFF] = flags;
        seg
    }

    #[test]
    fn test_new_create_reply() {
        let (_, ct) = tracker(16);
        let mut t = tuple(40000, IPPROTO_TCP);
        let mut state = CtState::default();

        let syn = segment(TCP_SYN);
        assert_eq!(ct.lookup_service(&syn, 0, &mut t, &mut state), Ok(CtStatus::New));
        assert_eq!(t.flags, TupleFlags::SERVICE);
        assert!(state.syn);

        state.backend_id = 3;
        state.rev_nat_index = 1;
        ct.create_service(&t, &state).unwrap();

        let ack = segment(TCP_ACK);
        let mut state = CtState::default();
        assert_eq!(ct.lookup_service(&ack, 0, &mut t, &mut state), Ok(CtStatus::Reply));
        assert_eq!(state.backend_id, 3);
        assert!(!state.syn);

        ct.update_service_backend(&t, 4, 1);
        assert_eq!(ct.state_of(&t).map(|s| s.backend_id), Some(4));
    }

    #[test]
    fn test_lifetimes() {
        let (env, ct) = tracker(16);
        let mut t = tuple(40001, IPPROTO_TCP);
        let mut state = CtState::default();
        ct.lookup_service(&segment(TCP_SYN), 0, &mut t, &mut state)
            .unwrap();
        ct.create_service(&t, &state).unwrap();

        env.advance(CT_SYN_TIMEOUT + 1);
        assert_eq!(ct.state_of(&t), None);
        assert_eq!(ct.gc(), 1);
        assert!(ct.is_empty());

        // established flows live for hours, udp for a minute
        let mut t = tuple(40002, IPPROTO_TCP);
        ct.lookup_service(&segment(TCP_ACK), 0, &mut t, &mut state)
            .unwrap();
        ct.create_service(&t, &state).unwrap();
        let mut u = tuple(40003, IPPROTO_UDP);
        ct.lookup_service(&segment(0), 0, &mut u, &mut state).unwrap();
        ct.create_service(&u, &state).unwrap();

        env.advance(CT_LIFETIME_NONTCP + 1);
        assert!(ct.state_of(&t).is_some());
        assert!(ct.state_of(&u).is_none());
    }

    #[test]
    fn test_fin_shortens_lifetime() {
        let (env, ct) = tracker(16);
        let mut t = tuple(40004, IPPROTO_TCP);
        let mut state = CtState::default();
        ct.lookup_service(&segment(TCP_ACK), 0, &mut t, &mut state)
            .unwrap();
        ct.create_service(&t, &state).unwrap();

        let st = ct.lookup_service(&segment(TCP_FIN | TCP_ACK), 0, &mut t, &mut state);
        assert_eq!(st, Ok(CtStatus::Reply));
        assert!(state.closing);

        env.advance(CT_CLOSE_TIMEOUT + 1);
        assert!(ct.state_of(&t).is_none());
        assert_eq!(ct.lookup_service(&segment(TCP_SYN), 0, &mut t, &mut state), Ok(CtStatus::New));
    }

    #[test]
    fn test_capacity() {
        let (_, ct) = tracker(2);
        let state = CtState::default();
        ct.create_service(&tuple(1, IPPROTO_UDP), &state).unwrap();
        ct.create_service(&tuple(2, IPPROTO_UDP), &state).unwrap();
        assert_eq!(
            ct.create_service(&tuple(3, IPPROTO_UDP), &state),
            Err(DropReason::ConnectionCreateFailed)
        );
        // existing flows can be refreshed when full
        ct.create_service(&tuple(2, IPPROTO_UDP), &state).unwrap();
        assert_eq!(ct.len(), 2);
        ct.remove_all();
        assert!(ct.is_empty());
    }
}
