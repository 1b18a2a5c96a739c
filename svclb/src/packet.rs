//! Ethernet framed TCP/UDP packets for driving the datapath.

use svclb_common::{csum, InetAddr, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP};
use svclb_dp::L3Family;

pub const ETH_HLEN: usize = 14;
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_ACK: u8 = 0x10;

const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const NODE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

fn l4_hdr_len(proto: u8) -> usize {
    match proto {
        IPPROTO_TCP => 20,
        IPPROTO_SCTP => 12,
        _ => 8,
    }
}

fn check_off(proto: u8) -> Option<usize> {
    match proto {
        IPPROTO_TCP => Some(16),
        IPPROTO_UDP => Some(6),
        _ => None,
    }
}

pub fn l4_off<A: L3Family>() -> usize {
    ETH_HLEN + A::HDR_LEN
}

/// Builds a frame with valid IPv4 and transport checksums.
pub fn build<A: L3Family>(
    saddr: A,
    daddr: A,
    proto: u8,
    sport: u16,
    dport: u16,
    tcp_flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let l4_len = l4_hdr_len(proto) + payload.len();
    let mut pkt = Vec::with_capacity(l4_off::<A>() + l4_len);
    pkt.extend_from_slice(&NODE_MAC);
    pkt.extend_from_slice(&CLIENT_MAC);

    if A::LEN == 4 {
        pkt.extend_from_slice(&0x0800u16.to_be_bytes());
        let tot_len = (A::HDR_LEN + l4_len) as u16;
        pkt.extend_from_slice(&[0x45, 0x00]);
        pkt.extend_from_slice(&tot_len.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, proto, 0, 0]);
    } else {
        pkt.extend_from_slice(&0x86ddu16.to_be_bytes());
        pkt.extend_from_slice(&[0x60, 0, 0, 0]);
        pkt.extend_from_slice(&(l4_len as u16).to_be_bytes());
        pkt.extend_from_slice(&[proto, 64]);
    }
    pkt.extend_from_slice(saddr.to_octets().as_ref());
    pkt.extend_from_slice(daddr.to_octets().as_ref());
    if let Some(off) = A::CHECK_OFF {
        let check = csum::ipv4_header_csum(&pkt[ETH_HLEN..ETH_HLEN + A::HDR_LEN]);
        pkt[ETH_HLEN + off..ETH_HLEN + off + 2].copy_from_slice(&check.to_be_bytes());
    }

    let l4 = pkt.len();
    pkt.extend_from_slice(&sport.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    match proto {
        IPPROTO_TCP => {
            pkt.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, tcp_flags, 0xff, 0xff, 0, 0, 0, 0])
        }
        IPPROTO_UDP => {
            pkt.extend_from_slice(&(l4_len as u16).to_be_bytes());
            pkt.extend_from_slice(&[0, 0]);
        }
        _ => pkt.extend_from_slice(&[0u8; 8][..l4_hdr_len(proto) - 4]),
    }
    pkt.extend_from_slice(payload);

    if let Some(off) = check_off(proto) {
        let check = csum::l4_csum(&saddr, &daddr, proto, &pkt[l4..]);
        pkt[l4 + off..l4 + off + 2].copy_from_slice(&check.to_be_bytes());
    }
    pkt
}

/// Source and destination addresses of a frame.
pub fn addrs<A: L3Family>(pkt: &[u8]) -> Option<(A, A)> {
    let s = ETH_HLEN + A::SADDR_OFF;
    let d = ETH_HLEN + A::DADDR_OFF;
    Some((
        A::from_slice(pkt.get(s..s + A::LEN)?)?,
        A::from_slice(pkt.get(d..d + A::LEN)?)?,
    ))
}

/// Source and destination ports of a frame.
pub fn ports<A: L3Family>(pkt: &[u8]) -> Option<(u16, u16)> {
    let l4 = l4_off::<A>();
    let p = pkt.get(l4..l4 + 4)?;
    Some((
        u16::from_be_bytes([p[0], p[1]]),
        u16::from_be_bytes([p[2], p[3]]),
    ))
}

/// True if the IPv4 header checksum and the TCP/UDP checksum match a full
/// recompute. A zero UDP checksum is accepted.
pub fn checksums_ok<A: L3Family>(pkt: &[u8], proto: u8) -> bool {
    let l4 = l4_off::<A>();
    if pkt.len() < l4 {
        return false;
    }
    if A::CHECK_OFF.is_some() && csum::csum_fold(csum::csum_partial(&pkt[ETH_HLEN..l4], 0)) != 0 {
        return false;
    }
    let Some(off) = check_off(proto) else {
        return true;
    };
    let Some((saddr, daddr)) = addrs::<A>(pkt) else {
        return false;
    };
    let mut segment = pkt[l4..].to_vec();
    if segment.len() < off + 2 {
        return false;
    }
    let stored = u16::from_be_bytes([segment[off], segment[off + 1]]);
    if proto == IPPROTO_UDP && stored == 0 {
        return true;
    }
    segment[off] = 0;
    segment[off + 1] = 0;
    stored == csum::l4_csum(&saddr, &daddr, proto, &segment)
}
