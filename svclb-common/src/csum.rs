//! Internet checksum helpers (RFC 1071, RFC 1624).
//!
//! Partial sums are kept as unfolded 32-bit values and words are read in
//! network byte order.

use crate::InetAddr;

#[inline(always)]
fn csum_fold_64_to_32(sum: u64) -> u32 {
    let sum = (sum & 0xffff_ffff) + (sum >> 32);
    let sum = (sum & 0xffff_ffff) + (sum >> 32);
    sum as u32
}

/// Folds a 32-bit partial sum into 16 bits with end-around carry.
#[inline(always)]
pub fn csum_fold_32_to_16(csum: u32) -> u16 {
    let csum = (csum & 0xffff) + (csum >> 16);
    let csum = (csum & 0xffff) + (csum >> 16);
    csum as u16
}

/// Folds and complements a partial sum, the value stored in headers.
#[inline(always)]
pub fn csum_fold(csum: u32) -> u16 {
    !csum_fold_32_to_16(csum)
}

/// One's complement addition of two partial sums.
#[inline(always)]
pub fn csum_add(csum: u32, addend: u32) -> u32 {
    let (sum, carry) = csum.overflowing_add(addend);
    sum + carry as u32
}

#[inline(always)]
pub fn csum_add_u32(value: u32, csum: u32) -> u32 {
    csum_add(csum, value)
}

/// Replaces `from` by `to` in a partial sum.
#[inline(always)]
pub fn csum_update_u32(from: u32, to: u32, csum: u32) -> u32 {
    csum_add(csum_add(csum, !from), to)
}

#[inline(always)]
pub fn csum_update_u16(from: u16, to: u16, csum: u32) -> u32 {
    csum_add(csum_add(csum, (!from) as u32), to as u32)
}

/// Partial sum over `data` as 16-bit words. An odd trailing byte is
/// padded with a zero byte.
pub fn csum_partial(data: &[u8], csum: u32) -> u32 {
    let mut sum = csum as u64;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u16::from_be_bytes([w[0], w[1]]) as u64;
    }
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }
    csum_fold_64_to_32(sum)
}

/// Difference sum of replacing `from` with `to`, seeded with `seed`.
/// Both slices must have an even length.
pub fn csum_diff(from: &[u8], to: &[u8], seed: u32) -> u32 {
    let mut sum = seed as u64;
    for w in from.chunks_exact(2) {
        sum += (!u16::from_be_bytes([w[0], w[1]])) as u64;
    }
    for w in to.chunks_exact(2) {
        sum += u16::from_be_bytes([w[0], w[1]]) as u64;
    }
    csum_fold_64_to_32(sum)
}

/// Applies a difference sum to a stored checksum.
#[inline(always)]
pub fn csum_replace_by_diff(check: u16, diff: u32) -> u16 {
    csum_fold(csum_add(diff, (!check) as u32))
}

/// Partial sum of the transport pseudo-header. For IPv4 the length is a
/// 16-bit field, for IPv6 a 32-bit one; both fold to the same sum.
pub fn pseudo_header_sum<A: InetAddr>(saddr: &A, daddr: &A, proto: u8, len: u32) -> u32 {
    let sum = csum_partial(saddr.to_octets().as_ref(), 0);
    let sum = csum_partial(daddr.to_octets().as_ref(), sum);
    let sum = csum_add(sum, proto as u32);
    csum_add(sum, (len >> 16) + (len & 0xffff))
}

/// Full IPv4 header checksum. The checksum field must be zeroed.
pub fn ipv4_header_csum(hdr: &[u8]) -> u16 {
    csum_fold(csum_partial(hdr, 0))
}

/// Full transport checksum over the pseudo-header and `segment`, whose
/// checksum field must be zeroed. UDP never yields a zero checksum.
pub fn l4_csum<A: InetAddr>(saddr: &A, daddr: &A, proto: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(saddr, daddr, proto, segment.len() as u32);
    let check = csum_fold(csum_partial(segment, sum));
    if proto == crate::IPPROTO_UDP && check == 0 {
        0xffff
    } else {
        check
    }
}
