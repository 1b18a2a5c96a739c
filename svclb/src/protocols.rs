use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocols a service frontend can be bound to, numbered as in
/// /etc/protocols.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Matches any protocol
    #[default]
    Any = 0,
    /// Icmp 1 ICMP # internet control message protocol
    Icmp = 1,
    /// Tcp 6 TCP # transmission control protocol
    Tcp = 6,
    /// Udp 17 UDP # user datagram protocol
    Udp = 17,
    /// Ipv6-icmp 58 IPv6-ICMP # ICMP for IPv6
    Ipv6Icmp = 58,
    /// Sctp 132 SCTP # Stream Control Transmission Protocol
    Sctp = 132,
}

impl From<u8> for Protocol {
    fn from(v: u8) -> Self {
        for e in Self::value_variants() {
            if *e as u8 == v {
                return *e;
            }
        }
        Self::Any
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ipv6Icmp => "ipv6-icmp",
            Self::Sctp => "sctp",
        };
        f.write_str(name)
    }
}

impl Protocol {
    /// Protocols that carry ports and can be load balanced.
    pub fn is_balanced(&self) -> bool {
        matches!(self, Self::Any | Self::Tcp | Self::Udp | Self::Sctp)
    }
}
