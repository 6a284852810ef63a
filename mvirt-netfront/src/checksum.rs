//! Internet checksum (RFC 1071)
//!
//! All functions take the contiguous header buffer and `HeaderInfo` from
//! `headers::classify` plus a cursor over whatever payload follows the
//! headers. Values are returned in host order, ready for `put_be16`.

use vm_memory::GuestMemoryError;

use crate::headers::{HeaderInfo, IPPROTO_TCP, IPPROTO_UDP, IpVersion, be16};
use crate::payload::{Payload, PayloadCursor};

/// Offset of the checksum field inside the IPv4 header
pub const IPV4_CHECKSUM_OFFSET: usize = 10;
/// Offset of the checksum field inside the TCP header
pub const TCP_CHECKSUM_OFFSET: usize = 16;
/// Offset of the checksum field inside the UDP header
pub const UDP_CHECKSUM_OFFSET: usize = 6;

/// Ones'-complement sum that may be fed in arbitrary chunks.
///
/// An odd trailing byte is held over and paired with the first byte of the
/// next chunk, so chunk boundaries do not affect the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    sum: u64,
    odd: Option<u8>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(high) = self.odd.take() {
            self.sum += u16::from_be_bytes([high, data[0]]) as u64;
            data = &data[1..];
        }

        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u16::from_be_bytes([word[0], word[1]]) as u64;
        }
        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
    }

    pub fn add_u16(&mut self, value: u16) {
        self.add(&value.to_be_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.add(&value.to_be_bytes());
    }

    /// Sum everything left in `cursor`.
    pub fn add_cursor<P: Payload + ?Sized>(
        &mut self,
        cursor: &mut PayloadCursor<'_, P>,
    ) -> Result<(), GuestMemoryError> {
        cursor.for_each_chunk(|chunk| self.add(chunk))
    }

    /// Folded 16-bit sum, not complemented
    pub fn fold(self) -> u16 {
        let mut sum = self.sum;
        if let Some(high) = self.odd {
            sum += (high as u64) << 8;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Final checksum value (complement of the folded sum)
    pub fn finish(self) -> u16 {
        !self.fold()
    }
}

/// Checksum of `data` in one call
pub fn checksum(data: &[u8]) -> u16 {
    let mut acc = Accumulator::new();
    acc.add(data);
    acc.finish()
}

/// IPv4 header checksum over header and options, ignoring the embedded value.
pub fn ipv4_header_checksum(header: &[u8], info: &HeaderInfo) -> u16 {
    let Some(ip) = info.ip.filter(|_| info.is_ipv4()) else {
        return 0;
    };
    let start = ip.offset;
    let end = start + info.ip_header_length();

    let mut acc = Accumulator::new();
    acc.add(&header[start..start + IPV4_CHECKSUM_OFFSET]);
    acc.add(&header[start + IPV4_CHECKSUM_OFFSET + 2..end]);
    acc.finish()
}

/// Pseudo-header sum for an L4 segment of `l4_length` bytes.
///
/// Returned folded but not complemented: the form placed in a TCP/UDP
/// checksum field when the backend is asked to finish the checksum.
pub fn pseudo_header_checksum(
    header: &[u8],
    info: &HeaderInfo,
    protocol: u8,
    l4_length: usize,
) -> u16 {
    let mut acc = Accumulator::new();
    add_pseudo_header(&mut acc, header, info, protocol, l4_length);
    acc.fold()
}

fn add_pseudo_header(
    acc: &mut Accumulator,
    header: &[u8],
    info: &HeaderInfo,
    protocol: u8,
    l4_length: usize,
) {
    let Some(ip) = info.ip else {
        return;
    };
    match info.ip_version {
        Some(IpVersion::V4) => {
            acc.add(&header[ip.offset + 12..ip.offset + 20]);
            acc.add_u16(protocol as u16);
            acc.add_u16(l4_length as u16);
        }
        Some(IpVersion::V6) => {
            acc.add(&header[ip.offset + 8..ip.offset + 40]);
            acc.add_u32(l4_length as u32);
            acc.add_u32(protocol as u32);
        }
        None => {}
    }
}

/// L4 checksum with the embedded field treated as zero.
///
/// Payload bytes come from `payload`, limited to what the IP header
/// declares so Ethernet padding is not summed.
fn l4_checksum<P: Payload + ?Sized>(
    header: &[u8],
    info: &HeaderInfo,
    protocol: u8,
    checksum_offset: usize,
    payload: &mut PayloadCursor<'_, P>,
) -> Result<u16, GuestMemoryError> {
    let Some(l4) = info.l4_header() else {
        return Ok(0);
    };

    let available = l4.length + payload.remaining();
    let l4_length = info
        .declared_l4_length(header)
        .map_or(available, |declared| declared.min(available));
    let payload_length = l4_length.saturating_sub(l4.length);

    let mut acc = Accumulator::new();
    add_pseudo_header(&mut acc, header, info, protocol, l4_length);
    acc.add(&header[l4.offset..l4.offset + checksum_offset]);
    acc.add(&header[l4.offset + checksum_offset + 2..l4.end()]);
    acc.add_cursor(&mut payload.take(payload_length))?;
    Ok(acc.finish())
}

pub fn tcp_checksum<P: Payload + ?Sized>(
    header: &[u8],
    info: &HeaderInfo,
    payload: &mut PayloadCursor<'_, P>,
) -> Result<u16, GuestMemoryError> {
    l4_checksum(header, info, IPPROTO_TCP, TCP_CHECKSUM_OFFSET, payload)
}

/// UDP checksum; a computed zero is sent as 0xffff.
pub fn udp_checksum<P: Payload + ?Sized>(
    header: &[u8],
    info: &HeaderInfo,
    payload: &mut PayloadCursor<'_, P>,
) -> Result<u16, GuestMemoryError> {
    let value = l4_checksum(header, info, IPPROTO_UDP, UDP_CHECKSUM_OFFSET, payload)?;
    Ok(if value == 0 { 0xffff } else { value })
}

/// Ones'-complement equality: 0x0000 and 0xffff both denote zero.
pub fn verify(calculated: u16, embedded: u16) -> bool {
    let normalise = |v: u16| if v == 0xffff { 0 } else { v };
    normalise(calculated) == normalise(embedded)
}

/// Embedded IPv4 header checksum
pub fn embedded_ipv4_checksum(header: &[u8], info: &HeaderInfo) -> Option<u16> {
    info.ip
        .filter(|_| info.is_ipv4())
        .map(|ip| be16(header, ip.offset + IPV4_CHECKSUM_OFFSET))
}

/// Embedded TCP or UDP checksum
pub fn embedded_l4_checksum(header: &[u8], info: &HeaderInfo) -> Option<u16> {
    if let Some(tcp) = info.tcp {
        return Some(be16(header, tcp.offset + TCP_CHECKSUM_OFFSET));
    }
    info.udp
        .map(|udp| be16(header, udp.offset + UDP_CHECKSUM_OFFSET))
}
