//! Non-contiguous packet data and a cursor over it
//!
//! Packet bytes live in a chain of guest frames (receive buffers, caller
//! segments on transmit). The header classifier and the checksum engine only
//! see them through `Payload` and `PayloadCursor`.

use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

use crate::memory::{MemorySegment, PacketBuffer};
use crate::protocol::PAGE_SIZE;

const CHUNK: usize = 1024;

/// Random-access view of packet bytes.
pub trait Payload {
    fn len(&self) -> usize;

    /// Fill `buf` from `offset`; fails if the range is out of bounds.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), GuestMemoryError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn out_of_range(expected: usize, completed: usize) -> GuestMemoryError {
    GuestMemoryError::PartialBuffer {
        expected,
        completed,
    }
}

impl Payload for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        let end = offset.checked_add(buf.len()).filter(|&end| end <= self.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self[offset..end]);
                Ok(())
            }
            None => Err(out_of_range(buf.len(), self.len().saturating_sub(offset))),
        }
    }
}

impl Payload for [PacketBuffer] {
    fn len(&self) -> usize {
        self.iter().map(|b| b.length).sum()
    }

    fn read_at(&self, mut offset: usize, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mut done = 0;
        for buffer in self {
            if done == buf.len() {
                break;
            }
            if offset >= buffer.length {
                offset -= buffer.length;
                continue;
            }
            let n = (buffer.length - offset).min(buf.len() - done);
            buffer
                .page
                .read(buffer.offset + offset, &mut buf[done..done + n])?;
            done += n;
            offset = 0;
        }
        if done == buf.len() {
            Ok(())
        } else {
            Err(out_of_range(buf.len(), done))
        }
    }
}

/// Caller-owned packet data in guest memory.
pub struct GuestPayload<'a> {
    mem: &'a GuestMemoryMmap,
    segments: &'a [MemorySegment],
    len: usize,
}

impl<'a> GuestPayload<'a> {
    pub fn new(mem: &'a GuestMemoryMmap, segments: &'a [MemorySegment]) -> Self {
        let len = segments.iter().map(|s| s.len).sum();
        Self {
            mem,
            segments,
            len,
        }
    }

    /// Guest ranges covering `[offset, offset + len)`, split at frame boundaries.
    pub fn ranges(&self, mut offset: usize, mut len: usize) -> Vec<MemorySegment> {
        let mut out = Vec::new();
        for segment in self.segments {
            if len == 0 {
                break;
            }
            if offset >= segment.len {
                offset -= segment.len;
                continue;
            }

            let mut addr = segment.addr.0 + offset as u64;
            let mut left = (segment.len - offset).min(len);
            len -= left;
            offset = 0;

            while left > 0 {
                let in_page = PAGE_SIZE - (addr as usize % PAGE_SIZE);
                let n = in_page.min(left);
                out.push(MemorySegment::new(GuestAddress(addr), n));
                addr += n as u64;
                left -= n;
            }
        }
        out
    }
}

impl Payload for GuestPayload<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, mut offset: usize, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mut done = 0;
        for segment in self.segments {
            if done == buf.len() {
                break;
            }
            if offset >= segment.len {
                offset -= segment.len;
                continue;
            }
            let n = (segment.len - offset).min(buf.len() - done);
            self.mem.read_slice(
                &mut buf[done..done + n],
                GuestAddress(segment.addr.0 + offset as u64),
            )?;
            done += n;
            offset = 0;
        }
        if done == buf.len() {
            Ok(())
        } else {
            Err(out_of_range(buf.len(), done))
        }
    }
}

/// Position and remaining length within a `Payload`.
pub struct PayloadCursor<'a, P: Payload + ?Sized> {
    payload: &'a P,
    offset: usize,
    remaining: usize,
}

impl<'a, P: Payload + ?Sized> PayloadCursor<'a, P> {
    pub fn new(payload: &'a P) -> Self {
        Self {
            payload,
            offset: 0,
            remaining: payload.len(),
        }
    }

    /// Cursor over `len` bytes starting at `offset`, clamped to the payload.
    pub fn with_range(payload: &'a P, offset: usize, len: usize) -> Self {
        let offset = offset.min(payload.len());
        Self {
            payload,
            offset,
            remaining: len.min(payload.len() - offset),
        }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn payload(&self) -> &'a P {
        self.payload
    }

    /// Append up to `want` bytes to `header`; returns how many were pulled.
    pub fn pull(&mut self, header: &mut Vec<u8>, want: usize) -> Result<usize, GuestMemoryError> {
        let n = want.min(self.remaining);
        let start = header.len();
        header.resize(start + n, 0);
        self.payload.read_at(self.offset, &mut header[start..])?;
        self.advance(n);
        Ok(n)
    }

    /// Fill `buf` completely.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        if buf.len() > self.remaining {
            return Err(out_of_range(buf.len(), self.remaining));
        }
        self.payload.read_at(self.offset, buf)?;
        self.advance(buf.len());
        Ok(())
    }

    /// Everything left, as one vector
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, GuestMemoryError> {
        let mut data = vec![0u8; self.remaining];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn skip(&mut self, n: usize) {
        self.advance(n.min(self.remaining));
    }

    /// Split off a cursor over the next `n` bytes and step past them.
    pub fn take(&mut self, n: usize) -> PayloadCursor<'a, P> {
        let n = n.min(self.remaining);
        let sub = PayloadCursor {
            payload: self.payload,
            offset: self.offset,
            remaining: n,
        };
        self.advance(n);
        sub
    }

    /// Feed the remaining bytes to `f` in order, chunk by chunk.
    pub fn for_each_chunk(&mut self, mut f: impl FnMut(&[u8])) -> Result<(), GuestMemoryError> {
        let mut chunk = [0u8; CHUNK];
        while self.remaining > 0 {
            let n = self.remaining.min(CHUNK);
            self.payload.read_at(self.offset, &mut chunk[..n])?;
            f(&chunk[..n]);
            self.advance(n);
        }
        Ok(())
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
        self.remaining -= n;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{FramePool, create_guest_memory};

    #[test]
    fn test_cursor_pull_and_take() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut cursor = PayloadCursor::new(data.as_slice());

        let mut header = Vec::new();
        assert_eq!(cursor.pull(&mut header, 14).expect("pull"), 14);
        assert_eq!(header, (0..14u8).collect::<Vec<_>>());
        assert_eq!(cursor.position(), 14);

        let mut sub = cursor.take(10);
        assert_eq!(sub.remaining(), 10);
        assert_eq!(cursor.remaining(), 76);

        let bytes = sub.read_remaining().expect("read");
        assert_eq!(bytes, (14..24u8).collect::<Vec<_>>());

        // Pulling past the end is short, not an error
        let mut rest = Vec::new();
        assert_eq!(cursor.pull(&mut rest, 1000).expect("pull"), 76);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_cursor_chunks() {
        let data = vec![7u8; 3000];
        let mut cursor = PayloadCursor::new(data.as_slice());
        let mut total = 0;
        let mut chunks = 0;
        cursor
            .for_each_chunk(|c| {
                total += c.len();
                chunks += 1;
            })
            .expect("chunks");
        assert_eq!(total, 3000);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_buffer_chain_payload() {
        let mem = Arc::new(create_guest_memory(4 * PAGE_SIZE).expect("memory"));
        let pool = FramePool::new(mem, 0, 4);

        let first = pool.alloc().expect("page");
        first.write(100, b"hello ").expect("write");
        let second = pool.alloc().expect("page");
        second.write(0, b"world").expect("write");

        let chain = vec![
            PacketBuffer::new(first, 100, 6),
            PacketBuffer::new(second, 0, 5),
        ];
        assert_eq!(Payload::len(chain.as_slice()), 11);

        let mut cursor = PayloadCursor::new(chain.as_slice());
        cursor.skip(4);
        let mut buf = [0u8; 4];
        cursor.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"o wo");
    }

    #[test]
    fn test_guest_payload_ranges_split_at_pages() {
        let mem = create_guest_memory(4 * PAGE_SIZE).expect("memory");
        let segments = [
            MemorySegment::new(GuestAddress(PAGE_SIZE as u64 - 10), 30),
            MemorySegment::new(GuestAddress(3 * PAGE_SIZE as u64), 100),
        ];
        let payload = GuestPayload::new(&mem, &segments);
        assert_eq!(payload.len(), 130);

        let ranges = payload.ranges(0, 130);
        assert_eq!(
            ranges,
            vec![
                MemorySegment::new(GuestAddress(PAGE_SIZE as u64 - 10), 10),
                MemorySegment::new(GuestAddress(PAGE_SIZE as u64), 20),
                MemorySegment::new(GuestAddress(3 * PAGE_SIZE as u64), 100),
            ]
        );

        let tail = payload.ranges(35, 10);
        assert_eq!(
            tail,
            vec![MemorySegment::new(GuestAddress(3 * PAGE_SIZE as u64 + 5), 10)]
        );
    }
}
