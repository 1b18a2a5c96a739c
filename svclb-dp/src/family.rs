use core::{
    mem::{self, offset_of},
    net::{Ipv4Addr, Ipv6Addr},
};
use network_types::ip::{Ipv4Hdr, Ipv6Hdr};
use svclb_common::{Features, InetAddr, LbConfig, IPPROTO_ICMP, IPPROTO_ICMPV6};

/// Per address family header layout used by the translation code.
pub trait L3Family: InetAddr {
    const HDR_LEN: usize;
    const SADDR_OFF: usize;
    const DADDR_OFF: usize;
    /// Offset of the transport protocol number
    const PROTO_OFF: usize;
    /// Offset of the header checksum, IPv6 has none
    const CHECK_OFF: Option<usize>;
    const ICMP_PROTO: u8;

    /// Source address substituted when a client reaches itself through a
    /// service, only IPv4 supports it.
    fn loopback_source(config: &LbConfig) -> Option<Self>;
}

impl L3Family for Ipv4Addr {
    const HDR_LEN: usize = mem::size_of::<Ipv4Hdr>();
    const SADDR_OFF: usize = offset_of!(Ipv4Hdr, src_addr);
    const DADDR_OFF: usize = offset_of!(Ipv4Hdr, dst_addr);
    const PROTO_OFF: usize = offset_of!(Ipv4Hdr, proto);
    const CHECK_OFF: Option<usize> = Some(offset_of!(Ipv4Hdr, check));
    const ICMP_PROTO: u8 = IPPROTO_ICMP;

    fn loopback_source(config: &LbConfig) -> Option<Self> {
        config
            .has(Features::LOOPBACK_LB)
            .then_some(config.loopback_ipv4)
    }
}

impl L3Family for Ipv6Addr {
    const HDR_LEN: usize = Ipv6Hdr::LEN;
    const SADDR_OFF: usize = offset_of!(Ipv6Hdr, src_addr);
    const DADDR_OFF: usize = offset_of!(Ipv6Hdr, dst_addr);
    const PROTO_OFF: usize = offset_of!(Ipv6Hdr, next_hdr);
    const CHECK_OFF: Option<usize> = None;
    const ICMP_PROTO: u8 = IPPROTO_ICMPV6;

    fn loopback_source(_config: &LbConfig) -> Option<Self> {
        None
    }
}
