#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

pub mod affinity;
pub mod buffer;
pub mod error;
pub mod family;
pub mod hash;
pub mod icmp;
pub mod lb;
pub mod lookup;
pub mod maps;
pub mod nat;
pub mod ratelimit;
pub mod select;
pub mod sock;

#[cfg(test)]
mod testutil;

pub use buffer::{FrameBuf, PacketBuffer};
pub use error::DropReason;
pub use family::L3Family;
pub use lb::{Balancer, Disposition, Fragment};
pub use maps::{AffinityMaps, ConnTrack, Directory, Env, RateLimitMaps, ServiceMaps};
