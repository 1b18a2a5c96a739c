//! Destination unreachable replies for packets addressed to a service
//! without backends. The reply is built in place over the original frame:
//! the frame is cut down to a sample, new IP and ICMP headers are pushed in
//! front of it and the Ethernet header is reversed.

use crate::{
    buffer::PacketBuffer,
    error::DropReason,
    family::L3Family,
    maps::{Env, RateLimitMaps},
    ratelimit::{check_and_take, ICMPV6_NO_BACKEND},
};
use core::{
    mem::offset_of,
    net::{Ipv4Addr, Ipv6Addr},
};
use log::debug;
use network_types::{
    eth::EthHdr,
    icmp::IcmpHdr,
    ip::{Ipv4Hdr, Ipv6Hdr},
};
use svclb_common::{csum, RateLimitKey, RateLimitUsage, IPPROTO_ICMP, IPPROTO_ICMPV6};

pub const ICMP_PACKET_MAX_SAMPLE_SIZE: usize = 64;
/// Minimum IPv6 MTU without the reply headers
pub const ICMPV6_PACKET_MAX_SAMPLE_SIZE: usize = 1280 - Ipv6Hdr::LEN - ICMP_HDR_LEN;

const ICMP_HDR_LEN: usize = 8;
const ICMP_DEST_UNREACH: u8 = 3;
const ICMP_PORT_UNREACH: u8 = 3;
const ICMPV6_DEST_UNREACH: u8 = 1;
const ICMPV6_PORT_UNREACH: u8 = 4;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86dd;
const IPDEFTTL: u8 = 64;

const ICMP_CSUM_OFF: usize = offset_of!(IcmpHdr, checksum);

/// Original frame fields kept across the head adjustment.
struct Sample<A> {
    smac: [u8; 6],
    dmac: [u8; 6],
    saddr: A,
    daddr: A,
    /// Partial sum of the sampled bytes
    csum: u32,
    len: usize,
}

/// Cuts the frame down to the Ethernet header plus at most `cap` bytes and
/// makes room for the reply IP and ICMP headers.
fn take_sample<A: L3Family, P: PacketBuffer>(
    pkt: &mut P,
    cap: usize,
) -> Result<Sample<A>, DropReason> {
    if pkt.len() < EthHdr::LEN + A::HDR_LEN {
        return Err(DropReason::InvalidPacket);
    }

    let dmac = pkt.load::<6>(0)?;
    let smac = pkt.load::<6>(6)?;
    let saddr = pkt.load_addr::<A>(EthHdr::LEN + A::SADDR_OFF)?;
    let daddr = pkt.load_addr::<A>(EthHdr::LEN + A::DADDR_OFF)?;

    let len = (pkt.len() - EthHdr::LEN).min(cap);
    pkt.trim(EthHdr::LEN + len)?;
    let csum = csum::csum_partial(&pkt.data()[EthHdr::LEN..], 0);

    pkt.adjust_head(-((A::HDR_LEN + ICMP_HDR_LEN) as isize))?;

    Ok(Sample {
        smac,
        dmac,
        saddr,
        daddr,
        csum,
        len,
    })
}

fn store_reversed_eth<A, P: PacketBuffer>(
    pkt: &mut P,
    sample: &Sample<A>,
    ether_type: u16,
) -> Result<(), DropReason> {
    pkt.store(0, &sample.smac)?;
    pkt.store(6, &sample.dmac)?;
    pkt.store_u16(12, ether_type)
}

/// Rewrites an IPv4 frame into an ICMP port unreachable reply to its
/// sender, quoting up to 64 bytes of the original datagram.
pub fn no_service_ipv4<P: PacketBuffer>(pkt: &mut P) -> Result<(), DropReason> {
    let tos = pkt.load_u8(EthHdr::LEN + offset_of!(Ipv4Hdr, tos))?;
    let sample = take_sample::<Ipv4Addr, P>(pkt, ICMP_PACKET_MAX_SAMPLE_SIZE)?;

    store_reversed_eth(pkt, &sample, ETH_P_IP)?;

    let tot_len = (Ipv4Addr::HDR_LEN + ICMP_HDR_LEN + sample.len) as u16;
    let mut ip = [0u8; Ipv4Addr::HDR_LEN];
    ip[0] = 0x45;
    ip[1] = tos;
    ip[2..4].copy_from_slice(&tot_len.to_be_bytes());
    ip[8] = IPDEFTTL;
    ip[9] = IPPROTO_ICMP;
    ip[12..16].copy_from_slice(&sample.daddr.octets());
    ip[16..20].copy_from_slice(&sample.saddr.octets());
    let check = csum::ipv4_header_csum(&ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());
    pkt.store(EthHdr::LEN, &ip)?;

    let icmp = [ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, 0, 0, 0, 0, 0, 0];
    let sum = csum::csum_partial(&icmp, sample.csum);
    let icmp_off = EthHdr::LEN + Ipv4Addr::HDR_LEN;
    pkt.store(icmp_off, &icmp)?;
    pkt.store_u16(icmp_off + ICMP_CSUM_OFF, csum::csum_fold(sum))?;

    debug!(
        "[icmp] port unreachable {} -> {}, sample {}",
        sample.daddr, sample.saddr, sample.len
    );
    Ok(())
}

/// Rewrites an IPv6 frame into an ICMPv6 port unreachable reply to its
/// sender, quoting as much of the original datagram as fits the minimum
/// MTU. Replies are rate limited per receiving interface.
pub fn no_service_ipv6<P, M, E>(
    pkt: &mut P,
    maps: &M,
    env: &E,
    ifindex: u32,
) -> Result<(), DropReason>
where
    P: PacketBuffer,
    M: RateLimitMaps,
    E: Env<Ipv6Addr>,
{
    let key = RateLimitKey {
        usage: RateLimitUsage::Icmpv6NoBackend,
        netdev_idx: ifindex,
    };
    if !check_and_take(maps, &key, &ICMPV6_NO_BACKEND, env.ktime_ns()) {
        debug!("[icmp] rate limited on if#{}", ifindex);
        return Err(DropReason::RateLimited);
    }

    let sample = take_sample::<Ipv6Addr, P>(pkt, ICMPV6_PACKET_MAX_SAMPLE_SIZE)?;

    store_reversed_eth(pkt, &sample, ETH_P_IPV6)?;

    let payload_len = (ICMP_HDR_LEN + sample.len) as u16;
    let mut ip = [0u8; Ipv6Addr::HDR_LEN];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&payload_len.to_be_bytes());
    ip[6] = IPPROTO_ICMPV6;
    ip[7] = IPDEFTTL;
    ip[8..24].copy_from_slice(&sample.daddr.octets());
    ip[24..40].copy_from_slice(&sample.saddr.octets());
    pkt.store(EthHdr::LEN, &ip)?;

    let icmp = [ICMPV6_DEST_UNREACH, ICMPV6_PORT_UNREACH, 0, 0, 0, 0, 0, 0];
    let sum = csum::csum_partial(&icmp, sample.csum);
    let sum = csum::csum_add(
        sum,
        csum::pseudo_header_sum(
            &sample.daddr,
            &sample.saddr,
            IPPROTO_ICMPV6,
            payload_len as u32,
        ),
    );
    let icmp_off = EthHdr::LEN + Ipv6Addr::HDR_LEN;
    pkt.store(icmp_off, &icmp)?;
    pkt.store_u16(icmp_off + ICMP_CSUM_OFF, csum::csum_fold(sum))?;

    debug!(
        "[icmp] v6 port unreachable {} -> {}, sample {}",
        sample.daddr, sample.saddr, sample.len
    );
    Ok(())
}

/// Family dispatch for the unreachable reply.
pub trait NoBackendReply: L3Family {
    fn no_service<P, M, E>(pkt: &mut P, maps: &M, env: &E, ifindex: u32) -> Result<(), DropReason>
    where
        P: PacketBuffer,
        M: RateLimitMaps,
        E: Env<Self>;
}

impl NoBackendReply for Ipv4Addr {
    fn no_service<P, M, E>(pkt: &mut P, _maps: &M, _env: &E, _ifindex: u32) -> Result<(), DropReason>
    where
        P: PacketBuffer,
        M: RateLimitMaps,
        E: Env<Self>,
    {
        no_service_ipv4(pkt)
    }
}

impl NoBackendReply for Ipv6Addr {
    fn no_service<P, M, E>(pkt: &mut P, maps: &M, env: &E, ifindex: u32) -> Result<(), DropReason>
    where
        P: PacketBuffer,
        M: RateLimitMaps,
        E: Env<Self>,
    {
        no_service_ipv6(pkt, maps, env, ifindex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::FrameBuf,
        testutil::{addrs, build_packet, Tables, TestEnv, ETH_HLEN},
    };
    use svclb_common::{IPPROTO_TCP, IPPROTO_UDP};

    fn check_reply<A: L3Family>(orig: &[u8], reply: &[u8], cap: usize) {
        let sample = (orig.len() - ETH_HLEN).min(cap);
        let icmp_off = ETH_HLEN + A::HDR_LEN;
        assert_eq!(reply.len(), icmp_off + ICMP_HDR_LEN + sample);

        assert_eq!(&reply[0..6], &orig[6..12]);
        assert_eq!(&reply[6..12], &orig[0..6]);

        let (osrc, odst) = addrs::<A>(orig);
        assert_eq!(addrs::<A>(reply), (odst, osrc));

        assert_eq!(&reply[icmp_off + ICMP_HDR_LEN..], &orig[ETH_HLEN..ETH_HLEN + sample]);

        let msg = &reply[icmp_off..];
        let sum = if A::LEN == 4 {
            let hdr = &reply[ETH_HLEN..icmp_off];
            assert_eq!(csum::csum_fold(csum::csum_partial(hdr, 0)), 0, "ipv4 header");
            assert_eq!(u16::from_be_bytes([hdr[2], hdr[3]]) as usize, reply.len() - ETH_HLEN);
            assert_eq!(hdr[9], IPPROTO_ICMP);
            assert_eq!(&msg[..2], &[3, 3]);
            csum::csum_partial(msg, 0)
        } else {
            let hdr = &reply[ETH_HLEN..icmp_off];
            assert_eq!(u16::from_be_bytes([hdr[4], hdr[5]]) as usize, msg.len());
            assert_eq!(hdr[6], IPPROTO_ICMPV6);
            assert_eq!(&msg[..2], &[1, 4]);
            let pseudo = csum::pseudo_header_sum(&odst, &osrc, IPPROTO_ICMPV6, msg.len() as u32);
            csum::csum_partial(msg, pseudo)
        };
        assert_eq!(csum::csum_fold(sum), 0, "icmp checksum");
    }

    #[test]
    fn test_ipv4_sample_sizes() {
        let client = Ipv4Addr::new(10, 0, 0, 5);
        let vip = Ipv4Addr::new(172, 16, 0, 10);
        // datagram sizes 49, 64 and 140 around the 64 byte cap
        for (proto, payload) in [(IPPROTO_UDP, 21), (IPPROTO_TCP, 24), (IPPROTO_TCP, 100)] {
            let orig = build_packet(client, vip, proto, 4000, 80, 0x02, &vec![0xa5; payload]);
            let mut pkt = orig.clone();
            no_service_ipv4(&mut pkt).unwrap();
            check_reply::<Ipv4Addr>(&orig, &pkt, ICMP_PACKET_MAX_SAMPLE_SIZE);
            assert_eq!(pkt[ETH_HLEN + 1], 0x10, "tos is kept");
        }
    }

    #[test]
    fn test_ipv6_sample_sizes() {
        let tables = Tables::<Ipv6Addr>::default();
        let env = TestEnv::<Ipv6Addr>::default();
        let client: Ipv6Addr = "fd00::5".parse().unwrap();
        let vip: Ipv6Addr = "fd00:10::10".parse().unwrap();
        // datagram sizes 61, 1232 and 2060 around the cap
        for (proto, payload) in [(IPPROTO_UDP, 13), (IPPROTO_TCP, 1172), (IPPROTO_TCP, 2000)] {
            let orig = build_packet(client, vip, proto, 4000, 80, 0x02, &vec![0x5a; payload]);
            let mut pkt = orig.clone();
            no_service_ipv6(&mut pkt, &tables, &env, 2).unwrap();
            check_reply::<Ipv6Addr>(&orig, &pkt, ICMPV6_PACKET_MAX_SAMPLE_SIZE);
        }
    }

    #[test]
    fn test_ipv6_rate_limited() {
        let tables = Tables::<Ipv6Addr>::default();
        let env = TestEnv::<Ipv6Addr>::default();
        let orig = build_packet(
            "fd00::5".parse::<Ipv6Addr>().unwrap(),
            "fd00:10::10".parse::<Ipv6Addr>().unwrap(),
            IPPROTO_UDP,
            4000,
            53,
            0,
            b"q",
        );
        for _ in 0..1000 {
            let mut pkt = orig.clone();
            no_service_ipv6(&mut pkt, &tables, &env, 7).unwrap();
        }
        let mut pkt = orig.clone();
        assert_eq!(
            no_service_ipv6(&mut pkt, &tables, &env, 7),
            Err(DropReason::RateLimited)
        );
        assert_eq!(pkt, orig);

        env.now_ns.set(env.now_ns.get() + 1_000_000_000);
        no_service_ipv6(&mut pkt, &tables, &env, 7).unwrap();
    }

    #[test]
    fn test_frame_without_headroom() {
        let orig = build_packet(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 16, 0, 10),
            IPPROTO_UDP,
            4000,
            53,
            0,
            b"q",
        );
        let mut buf = orig.clone();
        let len = buf.len();
        let mut frame = FrameBuf::new(&mut buf, 0, len).unwrap();
        assert_eq!(no_service_ipv4(&mut frame), Err(DropReason::WriteFault));

        let mut buf = vec![0u8; 128];
        buf[128 - len..].copy_from_slice(&orig);
        let mut frame = FrameBuf::new(&mut buf, 128 - len, len).unwrap();
        no_service_ipv4(&mut frame).unwrap();
        check_reply::<Ipv4Addr>(&orig, frame.data(), ICMP_PACKET_MAX_SAMPLE_SIZE);
    }

    #[test]
    fn test_truncated_frame() {
        let mut pkt = vec![0u8; ETH_HLEN + 10];
        assert_eq!(no_service_ipv4(&mut pkt), Err(DropReason::InvalidPacket));
    }
}
