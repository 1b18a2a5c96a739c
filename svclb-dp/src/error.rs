use svclb_common::stats;
use thiserror::Error;

/// Reason a packet is dropped by the service datapath.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DropReason {
    /// Service absent or without backends
    #[error("no service")]
    NoService,
    #[error("unknown connection tracking state")]
    UnknownConnectionState,
    #[error("can't patch the checksum of protocol {0}")]
    ChecksumIncompatibleProtocol(u8),
    #[error("packet write out of bounds")]
    WriteFault,
    #[error("unsupported L4 protocol {0}")]
    UnsupportedL4(u8),
    #[error("unsupported service protocol {0}")]
    UnsupportedServiceProto(u8),
    #[error("failed to create connection tracking entry")]
    ConnectionCreateFailed,
    #[error("rate limited")]
    RateLimited,
    #[error("source not allowed by service source ranges")]
    NotInSourceRange,
    #[error("invalid packet")]
    InvalidPacket,
}

impl DropReason {
    /// Stats counter incremented for this drop.
    pub fn stat(&self) -> u32 {
        match self {
            Self::NoService => stats::DROP_NO_SERVICE,
            Self::UnknownConnectionState => stats::DROP_UNKNOWN_CT,
            Self::ChecksumIncompatibleProtocol(_) => stats::DROP_CSUM_PROTO,
            Self::WriteFault => stats::DROP_WRITE_FAULT,
            Self::UnsupportedL4(_) | Self::UnsupportedServiceProto(_) => {
                stats::DROP_UNSUPPORTED_L4
            }
            Self::ConnectionCreateFailed => stats::DROP_CT_CREATE,
            Self::RateLimited => stats::DROP_RATE_LIMITED,
            Self::NotInSourceRange => stats::DROP_SRC_RANGE,
            Self::InvalidPacket => stats::DROP_INVALID,
        }
    }
}
