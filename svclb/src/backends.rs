use crate::protocols::Protocol;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};
use svclb_common::{Backend, InetAddr, RevNat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndPoint {
    pub ipaddr: IpAddr,
    pub proto: Protocol,
    pub port: u16,
}

impl Default for EndPoint {
    fn default() -> Self {
        Self {
            ipaddr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proto: Protocol::Any,
            port: 0,
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}: {}", &self.proto, &self.ipaddr)
        } else {
            write!(f, "{}: [{}]:{}", &self.proto, &self.ipaddr, &self.port)
        }
    }
}

impl EndPoint {
    pub fn new<A: InetAddr + Into<IpAddr>>(address: A, proto: u8, port: u16) -> Self {
        Self {
            ipaddr: address.into(),
            proto: Protocol::from(proto),
            port,
        }
    }
}

pub trait ToEndPoint {
    fn as_endpoint(&self) -> EndPoint;
}

impl<A: InetAddr + Into<IpAddr>> ToEndPoint for Backend<A> {
    fn as_endpoint(&self) -> EndPoint {
        EndPoint::new(self.address, self.proto, self.port)
    }
}

impl<A: InetAddr + Into<IpAddr>> ToEndPoint for RevNat<A> {
    fn as_endpoint(&self) -> EndPoint {
        EndPoint::new(self.address, 0, self.port)
    }
}
