use crate::error::DropReason;
use svclb_common::InetAddr;

/// Access to the packet data. Every read and write is bounds checked,
/// reads past the end classify the packet as invalid and writes past the
/// end as a write fault.
pub trait PacketBuffer {
    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Moves the packet start by `delta` bytes, a negative value prepends
    /// room for new headers.
    fn adjust_head(&mut self, delta: isize) -> Result<(), DropReason>;

    /// Trims the packet to `len` bytes.
    fn trim(&mut self, len: usize) -> Result<(), DropReason>;

    #[inline(always)]
    fn len(&self) -> usize {
        self.data().len()
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], DropReason> {
        let end = offset.checked_add(N).ok_or(DropReason::InvalidPacket)?;
        let bytes = self
            .data()
            .get(offset..end)
            .ok_or(DropReason::InvalidPacket)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Result<u8, DropReason> {
        self.load::<1>(offset).map(|b| b[0])
    }

    /// Loads a network order 16-bit value.
    #[inline(always)]
    fn load_u16(&self, offset: usize) -> Result<u16, DropReason> {
        self.load::<2>(offset).map(u16::from_be_bytes)
    }

    fn load_addr<A: InetAddr>(&self, offset: usize) -> Result<A, DropReason> {
        let end = offset.checked_add(A::LEN).ok_or(DropReason::InvalidPacket)?;
        self.data()
            .get(offset..end)
            .and_then(A::from_slice)
            .ok_or(DropReason::InvalidPacket)
    }

    #[inline(always)]
    fn store(&mut self, offset: usize, bytes: &[u8]) -> Result<(), DropReason> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(DropReason::WriteFault)?;
        self.data_mut()
            .get_mut(offset..end)
            .ok_or(DropReason::WriteFault)?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Stores a 16-bit value in network order.
    #[inline(always)]
    fn store_u16(&mut self, offset: usize, value: u16) -> Result<(), DropReason> {
        self.store(offset, &value.to_be_bytes())
    }

    fn store_addr<A: InetAddr>(&mut self, offset: usize, addr: &A) -> Result<(), DropReason> {
        self.store(offset, addr.to_octets().as_ref())
    }
}

/// Packet window over a fixed buffer with head room, the packet occupies
/// `buf[start..end]`.
pub struct FrameBuf<'a> {
    buf: &'a mut [u8],
    start: usize,
    end: usize,
}

impl<'a> FrameBuf<'a> {
    /// Places a `len` bytes packet after `headroom` bytes of `buf`.
    pub fn new(buf: &'a mut [u8], headroom: usize, len: usize) -> Result<Self, DropReason> {
        let end = headroom.checked_add(len).ok_or(DropReason::InvalidPacket)?;
        if end > buf.len() {
            return Err(DropReason::InvalidPacket);
        }
        Ok(Self {
            buf,
            start: headroom,
            end,
        })
    }

    pub fn headroom(&self) -> usize {
        self.start
    }
}

impl PacketBuffer for FrameBuf<'_> {
    fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    fn adjust_head(&mut self, delta: isize) -> Result<(), DropReason> {
        let start = self
            .start
            .checked_add_signed(delta)
            .ok_or(DropReason::WriteFault)?;
        if start > self.end {
            return Err(DropReason::WriteFault);
        }
        self.start = start;
        Ok(())
    }

    fn trim(&mut self, len: usize) -> Result<(), DropReason> {
        if len > self.end - self.start {
            return Err(DropReason::WriteFault);
        }
        self.end = self.start + len;
        Ok(())
    }
}

#[cfg(any(test, feature = "alloc"))]
impl PacketBuffer for alloc::vec::Vec<u8> {
    fn data(&self) -> &[u8] {
        self.as_slice()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }

    fn adjust_head(&mut self, delta: isize) -> Result<(), DropReason> {
        if delta < 0 {
            let room = delta.unsigned_abs();
            self.splice(0..0, core::iter::repeat(0u8).take(room));
        } else {
            let cut = delta as usize;
            if cut > self.len() {
                return Err(DropReason::WriteFault);
            }
            self.drain(..cut);
        }
        Ok(())
    }

    fn trim(&mut self, len: usize) -> Result<(), DropReason> {
        if len > self.len() {
            return Err(DropReason::WriteFault);
        }
        self.truncate(len);
        Ok(())
    }
}
