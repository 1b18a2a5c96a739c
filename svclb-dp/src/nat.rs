//! In place address and port translation with incremental checksum
//! updates.

use crate::{buffer::PacketBuffer, error::DropReason, family::L3Family};
use core::mem::offset_of;
use log::debug;
use network_types::{icmp::IcmpHdr, tcp::TcpHdr, udp::UdpHdr};
use svclb_common::{
    csum, Backend, FlowTuple, InetAddr, RevNat, SvcKey, IPPROTO_ICMP, IPPROTO_ICMPV6,
    IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
};

// NOTE: TCP, UDP and SCTP share the port layout
pub const SPORT_OFF: usize = offset_of!(TcpHdr, source);
pub const DPORT_OFF: usize = offset_of!(TcpHdr, dest);

/// Location of the transport checksum relative to the L4 header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CsumOffset {
    /// Zero if there is no pseudo header checksum to patch
    pub offset: usize,
    /// A zero checksum means none was computed and must stay zero
    pub mangled_0: bool,
}

impl CsumOffset {
    pub fn for_proto(nexthdr: u8) -> Self {
        match nexthdr {
            IPPROTO_TCP => Self {
                offset: offset_of!(TcpHdr, check),
                mangled_0: false,
            },
            IPPROTO_UDP => Self {
                offset: offset_of!(UdpHdr, check),
                mangled_0: true,
            },
            IPPROTO_ICMPV6 => Self {
                offset: offset_of!(IcmpHdr, checksum),
                mangled_0: false,
            },
            // ICMP has no pseudo header and SCTP uses crc32c
            _ => Self::default(),
        }
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.offset != 0
    }
}

/// Adds the difference sum `diff` to the transport checksum.
pub fn csum_l4_replace<P: PacketBuffer>(
    pkt: &mut P,
    l4_off: usize,
    csum_off: &CsumOffset,
    diff: u32,
) -> Result<(), DropReason> {
    let off = l4_off + csum_off.offset;
    let check = pkt.load_u16(off).map_err(|_| DropReason::WriteFault)?;
    if csum_off.mangled_0 && check == 0 {
        return Ok(());
    }

    let mut check = csum::csum_replace_by_diff(check, diff);
    if csum_off.mangled_0 && check == 0 {
        check = 0xffff;
    }
    pkt.store_u16(off, check)
}

/// Adds the difference sum `diff` to the IP header checksum, if the family
/// has one.
pub fn l3_csum_update_by_diff<A: L3Family, P: PacketBuffer>(
    pkt: &mut P,
    l3_off: usize,
    diff: u32,
) -> Result<(), DropReason> {
    let Some(check_off) = A::CHECK_OFF else {
        return Ok(());
    };
    let off = l3_off + check_off;
    let check = pkt.load_u16(off).map_err(|_| DropReason::WriteFault)?;
    pkt.store_u16(off, csum::csum_replace_by_diff(check, diff))
}

#[inline(always)]
fn addr_diff<A: InetAddr>(from: &A, to: &A, seed: u32) -> u32 {
    csum::csum_diff(from.to_octets().as_ref(), to.to_octets().as_ref(), seed)
}

/// Rewrites the port at `port_off` and patches the transport checksum.
pub fn l4_modify_port<P: PacketBuffer>(
    pkt: &mut P,
    l4_off: usize,
    port_off: usize,
    csum_off: &CsumOffset,
    port: u16,
    old_port: u16,
) -> Result<(), DropReason> {
    if csum_off.is_set() {
        let diff = csum::csum_diff(&old_port.to_be_bytes(), &port.to_be_bytes(), 0);
        csum_l4_replace(pkt, l4_off, csum_off, diff)?;
    }
    pkt.store_u16(l4_off + port_off, port)
}

/// Rewrites the destination port to the backend port unless the backend
/// keeps the service port.
pub fn lb_l4_xlate<P: PacketBuffer>(
    pkt: &mut P,
    nexthdr: u8,
    l4_off: usize,
    csum_off: &CsumOffset,
    dport: u16,
    backend_port: u16,
) -> Result<(), DropReason> {
    if backend_port == 0 || dport == backend_port {
        return Ok(());
    }
    if nexthdr == IPPROTO_SCTP {
        return Err(DropReason::ChecksumIncompatibleProtocol(nexthdr));
    }
    l4_modify_port(pkt, l4_off, DPORT_OFF, csum_off, backend_port, dport)
}

/// Forward translation from the service frontend `key` to `backend`. When
/// `new_saddr` is set the source address is replaced as well, both changes
/// are folded into one checksum difference.
#[allow(clippy::too_many_arguments)]
pub fn lb_xlate<A: L3Family, P: PacketBuffer>(
    pkt: &mut P,
    new_saddr: Option<&A>,
    old_saddr: &A,
    nexthdr: u8,
    l3_off: usize,
    l4_off: usize,
    key: &SvcKey<A>,
    backend: &Backend<A>,
    has_l4_header: bool,
) -> Result<(), DropReason> {
    let csum_off = if has_l4_header {
        CsumOffset::for_proto(nexthdr)
    } else {
        CsumOffset::default()
    };

    pkt.store_addr(l3_off + A::DADDR_OFF, &backend.address)?;
    let mut sum = addr_diff(&key.address, &backend.address, 0);

    if let Some(new_saddr) = new_saddr {
        pkt.store_addr(l3_off + A::SADDR_OFF, new_saddr)?;
        sum = addr_diff(old_saddr, new_saddr, sum);
    }

    l3_csum_update_by_diff::<A, P>(pkt, l3_off, sum)?;

    if csum_off.is_set() {
        csum_l4_replace(pkt, l4_off, &csum_off, sum)?;
    }

    if has_l4_header {
        lb_l4_xlate(pkt, nexthdr, l4_off, &csum_off, key.dport, backend.port)
    } else {
        Ok(())
    }
}

/// Restores the service port as the reply source port.
pub fn reverse_map_l4_port<P: PacketBuffer>(
    pkt: &mut P,
    nexthdr: u8,
    old_port: u16,
    port: u16,
    l4_off: usize,
    csum_off: &CsumOffset,
) -> Result<(), DropReason> {
    match nexthdr {
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP => {
            if port == 0 || port == old_port {
                return Ok(());
            }
            if nexthdr == IPPROTO_SCTP {
                return Err(DropReason::ChecksumIncompatibleProtocol(nexthdr));
            }
            l4_modify_port(pkt, l4_off, SPORT_OFF, csum_off, port, old_port)
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => Ok(()),
        _ => Err(DropReason::UnsupportedL4(nexthdr)),
    }
}

/// Reverse translation of a reply: the source becomes the service
/// frontend again. For looped back flows the reply destination is the
/// loopback address and is restored to the client, which is the reply
/// source. `tuple` is in connection tracking order and is updated to the
/// translated addresses.
pub fn lb_rev_nat<A: L3Family, P: PacketBuffer>(
    pkt: &mut P,
    l3_off: usize,
    l4_off: usize,
    nat: &RevNat<A>,
    loopback: bool,
    tuple: &mut FlowTuple<A>,
    has_l4_header: bool,
) -> Result<(), DropReason> {
    let old_sip = tuple.saddr;
    let mut sum = 0;

    debug!("[xlate] rev nat {} -> {}:{}", old_sip, nat.address, nat.port);

    tuple.saddr = nat.address;

    if loopback {
        let old_dip = tuple.daddr;
        pkt.store_addr(l3_off + A::DADDR_OFF, &old_sip)?;
        sum = addr_diff(&old_dip, &old_sip, sum);
        tuple.saddr = old_sip;
    }

    pkt.store_addr(l3_off + A::SADDR_OFF, &nat.address)?;
    sum = addr_diff(&old_sip, &nat.address, sum);
    l3_csum_update_by_diff::<A, P>(pkt, l3_off, sum)?;

    if !has_l4_header {
        return Ok(());
    }

    let csum_off = CsumOffset::for_proto(tuple.nexthdr);
    if nat.port != 0 {
        // replies carry the packet source port in .dport
        reverse_map_l4_port(pkt, tuple.nexthdr, tuple.dport, nat.port, l4_off, &csum_off)?;
    }

    if csum_off.is_set() {
        csum_l4_replace(pkt, l4_off, &csum_off, sum)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{addrs, assert_checksums, build_packet, l4_off, ports, ETH_HLEN};
    use core::net::{Ipv4Addr, Ipv6Addr};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn forward_and_back<A: L3Family>(client: A, vip: A, backend: A, proto: u8, ports_: (u16, u16, u16)) {
        let (cport, vport, bport) = ports_;
        let mut pkt = build_packet(client, vip, proto, cport, vport, 0x02, b"hello");
        let key = SvcKey::new(vip, vport, proto);
        let be = Backend::new(backend, bport, proto);

        lb_xlate(&mut pkt, None, &client, proto, ETH_HLEN, l4_off::<A>(), &key, &be, true).unwrap();

        assert_eq!(addrs::<A>(&pkt), (client, backend));
        let expected_port = if bport == 0 { vport } else { bport };
        assert_eq!(ports::<A>(&pkt), (cport, expected_port));
        assert_checksums::<A>(&pkt, proto);

        let mut reply = build_packet(backend, client, proto, expected_port, cport, 0x12, b"world!");
        let mut tuple = FlowTuple::from_packet(backend, client, expected_port, cport, proto);
        let nat = RevNat {
            address: vip,
            port: vport,
        };
        lb_rev_nat(&mut reply, ETH_HLEN, l4_off::<A>(), &nat, false, &mut tuple, true).unwrap();

        assert_eq!(addrs::<A>(&reply), (vip, client));
        assert_eq!(ports::<A>(&reply), (vport, cport));
        assert_eq!(tuple.saddr, vip);
        assert_checksums::<A>(&reply, proto);
    }

    #[test]
    fn test_randomized_v4() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for i in 0..400 {
            let proto = if i % 2 == 0 { IPPROTO_TCP } else { IPPROTO_UDP };
            forward_and_back(
                Ipv4Addr::from(rng.gen::<[u8; 4]>()),
                Ipv4Addr::from(rng.gen::<[u8; 4]>()),
                Ipv4Addr::from(rng.gen::<[u8; 4]>()),
                proto,
                (rng.gen_range(1..=u16::MAX), rng.gen_range(1..=u16::MAX), rng.gen()),
            );
        }
    }

    #[test]
    fn test_randomized_v6() {
        let mut rng = StdRng::seed_from_u64(0x6eed);
        for i in 0..400 {
            let proto = if i % 2 == 0 { IPPROTO_TCP } else { IPPROTO_UDP };
            forward_and_back(
                Ipv6Addr::from(rng.gen::<[u8; 16]>()),
                Ipv6Addr::from(rng.gen::<[u8; 16]>()),
                Ipv6Addr::from(rng.gen::<[u8; 16]>()),
                proto,
                (rng.gen_range(1..=u16::MAX), rng.gen_range(1..=u16::MAX), rng.gen()),
            );
        }
    }

    #[test]
    fn test_edge_addresses() {
        let zero4 = Ipv4Addr::UNSPECIFIED;
        let ones4 = Ipv4Addr::BROADCAST;
        let some4 = Ipv4Addr::new(10, 0, 0, 1);
        let cases4 = [
            (some4, zero4, ones4),
            (some4, ones4, zero4),
            (some4, some4, some4),
            (zero4, zero4, zero4),
            (ones4, ones4, ones4),
        ];
        for (client, vip, backend) in cases4 {
            for proto in [IPPROTO_TCP, IPPROTO_UDP] {
                forward_and_back(client, vip, backend, proto, (1234, 80, 80));
                forward_and_back(client, vip, backend, proto, (0xffff, 0xffff, 0));
                forward_and_back(client, vip, backend, proto, (1, 0xffff, 1));
            }
        }

        let zero6 = Ipv6Addr::UNSPECIFIED;
        let ones6 = Ipv6Addr::from([0xff; 16]);
        let some6 = "fd00::1".parse::<Ipv6Addr>().unwrap();
        for (client, vip, backend) in [(some6, zero6, ones6), (some6, ones6, zero6), (some6, some6, some6)] {
            forward_and_back(client, vip, backend, IPPROTO_TCP, (1234, 443, 8443));
            forward_and_back(client, vip, backend, IPPROTO_UDP, (1234, 53, 53));
        }
    }

    #[test]
    fn test_loopback_snat() {
        let client = Ipv4Addr::new(10, 0, 0, 5);
        let vip = Ipv4Addr::new(172, 16, 0, 10);
        let lo = Ipv4Addr::new(169, 254, 42, 1);
        let mut pkt = build_packet(client, vip, IPPROTO_TCP, 40000, 80, 0x02, &[]);
        let key = SvcKey::new(vip, 80, IPPROTO_TCP);
        let be = Backend::new(client, 8080, IPPROTO_TCP);

        let l4 = l4_off::<Ipv4Addr>();
        lb_xlate(&mut pkt, Some(&lo), &client, IPPROTO_TCP, ETH_HLEN, l4, &key, &be, true).unwrap();
        assert_eq!(addrs::<Ipv4Addr>(&pkt), (lo, client));
        assert_checksums::<Ipv4Addr>(&pkt, IPPROTO_TCP);

        // the client answers itself at the loopback address
        let mut reply = build_packet(client, lo, IPPROTO_TCP, 8080, 40000, 0x12, &[]);
        let mut tuple = FlowTuple::from_packet(client, lo, 8080, 40000, IPPROTO_TCP);
        let nat = RevNat { address: vip, port: 80 };
        lb_rev_nat(&mut reply, ETH_HLEN, l4, &nat, true, &mut tuple, true).unwrap();
        assert_eq!(addrs::<Ipv4Addr>(&reply), (vip, client));
        assert_eq!(ports::<Ipv4Addr>(&reply), (80, 40000));
        assert_eq!(tuple.saddr, client);
        assert_checksums::<Ipv4Addr>(&reply, IPPROTO_TCP);
    }

    #[test]
    fn test_fragment_keeps_ports() {
        let client = Ipv4Addr::new(10, 0, 0, 5);
        let vip = Ipv4Addr::new(172, 16, 0, 10);
        let backend = Ipv4Addr::new(10, 0, 1, 9);
        let mut pkt = build_packet(client, vip, IPPROTO_UDP, 5000, 53, 0, b"frag");
        let segment = pkt[l4_off::<Ipv4Addr>()..].to_vec();
        let key = SvcKey::new(vip, 53, IPPROTO_UDP);
        let be = Backend::new(backend, 5353, IPPROTO_UDP);

        let l4 = l4_off::<Ipv4Addr>();
        lb_xlate(&mut pkt, None, &client, IPPROTO_UDP, ETH_HLEN, l4, &key, &be, false).unwrap();
        assert_eq!(addrs::<Ipv4Addr>(&pkt), (client, backend));
        assert_eq!(&pkt[l4..], segment.as_slice());
    }

    #[test]
    fn test_udp_zero_checksum_stays_zero() {
        let client = Ipv4Addr::new(10, 0, 0, 5);
        let vip = Ipv4Addr::new(172, 16, 0, 10);
        let mut pkt = build_packet(client, vip, IPPROTO_UDP, 5000, 53, 0, b"x");
        let l4 = l4_off::<Ipv4Addr>();
        pkt[l4 + 6] = 0;
        pkt[l4 + 7] = 0;
        let key = SvcKey::new(vip, 53, IPPROTO_UDP);
        let be = Backend::new(Ipv4Addr::new(10, 9, 9, 9), 5353, IPPROTO_UDP);
        lb_xlate(&mut pkt, None, &client, IPPROTO_UDP, ETH_HLEN, l4, &key, &be, true).unwrap();
        assert_eq!(&pkt[l4 + 6..l4 + 8], &[0, 0]);
        assert_eq!(ports::<Ipv4Addr>(&pkt), (5000, 5353));
    }

    #[test]
    fn test_sctp_port_rewrite_fails() {
        let mut pkt = build_packet(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 16, 0, 10),
            IPPROTO_UDP,
            5000,
            80,
            0,
            &[],
        );
        let l4 = l4_off::<Ipv4Addr>();
        let csum_off = CsumOffset::for_proto(IPPROTO_SCTP);
        assert_eq!(
            lb_l4_xlate(&mut pkt, IPPROTO_SCTP, l4, &csum_off, 80, 8080),
            Err(DropReason::ChecksumIncompatibleProtocol(IPPROTO_SCTP))
        );
        assert_eq!(lb_l4_xlate(&mut pkt, IPPROTO_SCTP, l4, &csum_off, 80, 80), Ok(()));
        assert_eq!(
            reverse_map_l4_port(&mut pkt, 47, 80, 8080, l4, &csum_off),
            Err(DropReason::UnsupportedL4(47))
        );
        assert_eq!(
            reverse_map_l4_port(&mut pkt, IPPROTO_ICMP, 80, 8080, l4, &csum_off),
            Ok(())
        );
    }

    #[test]
    fn test_write_fault_on_short_packet() {
        let mut pkt = vec![0u8; ETH_HLEN + 10];
        let vip = Ipv4Addr::new(172, 16, 0, 10);
        let key = SvcKey::new(vip, 80, IPPROTO_TCP);
        let be = Backend::new(Ipv4Addr::new(10, 0, 0, 1), 0, IPPROTO_TCP);
        assert_eq!(
            lb_xlate(&mut pkt, None, &vip, IPPROTO_TCP, ETH_HLEN, 34, &key, &be, true),
            Err(DropReason::WriteFault)
        );
    }
}
