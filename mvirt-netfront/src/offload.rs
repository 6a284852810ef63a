//! Offload flag sets, VLAN tag handling and TCP segmentation

use bitflags::bitflags;

use crate::checksum::{IPV4_CHECKSUM_OFFSET, TCP_CHECKSUM_OFFSET, ipv4_header_checksum, tcp_checksum};
use crate::error::HeaderError;
use crate::headers::{
    ETHERNET_HEADER_SIZE, ETHERTYPE_VLAN, HeaderInfo, IpVersion, TCP_FIN, TCP_PSH, VLAN_TAG_SIZE,
    be16, be32, classify, put_be16, put_be32,
};
use crate::payload::PayloadCursor;

bitflags! {
    /// Advisory checksum results attached to a received packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChecksumFlags: u16 {
        const IP_CHECKSUM_SUCCEEDED = 1 << 0;
        const IP_CHECKSUM_FAILED = 1 << 1;
        const IP_CHECKSUM_NOT_VALIDATED = 1 << 2;
        const TCP_CHECKSUM_SUCCEEDED = 1 << 3;
        const TCP_CHECKSUM_FAILED = 1 << 4;
        const TCP_CHECKSUM_NOT_VALIDATED = 1 << 5;
        const UDP_CHECKSUM_SUCCEEDED = 1 << 6;
        const UDP_CHECKSUM_FAILED = 1 << 7;
        const UDP_CHECKSUM_NOT_VALIDATED = 1 << 8;
    }
}

bitflags! {
    /// Offloads requested for one transmit packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OffloadFlags: u16 {
        const IPV4_HEADER_CHECKSUM = 1 << 0;
        const IPV4_TCP_CHECKSUM = 1 << 1;
        const IPV4_UDP_CHECKSUM = 1 << 2;
        const IPV6_TCP_CHECKSUM = 1 << 3;
        const IPV6_UDP_CHECKSUM = 1 << 4;
        const IPV4_LARGE_PACKET = 1 << 5;
        const IPV6_LARGE_PACKET = 1 << 6;
        const TAG = 1 << 7;
    }
}

impl OffloadFlags {
    pub fn large_packet(self) -> bool {
        self.intersects(Self::IPV4_LARGE_PACKET | Self::IPV6_LARGE_PACKET)
    }

    pub fn l4_checksum(self) -> bool {
        self.intersects(
            Self::IPV4_TCP_CHECKSUM
                | Self::IPV4_UDP_CHECKSUM
                | Self::IPV6_TCP_CHECKSUM
                | Self::IPV6_UDP_CHECKSUM,
        )
    }

    /// Anything that needs parsed headers to honour
    pub fn needs_headers(self) -> bool {
        self.intersects(!Self::TAG)
    }
}

bitflags! {
    /// What the consumer of received packets can handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReceiveOffload: u16 {
        /// Strip 802.1Q tags into packet metadata
        const TAG_MANIPULATION = 1 << 0;
        const IPV4_HEADER_CHECKSUM = 1 << 1;
        const IPV4_TCP_CHECKSUM = 1 << 2;
        const IPV4_UDP_CHECKSUM = 1 << 3;
        const IPV6_TCP_CHECKSUM = 1 << 4;
        const IPV6_UDP_CHECKSUM = 1 << 5;
        /// Consumer accepts frames larger than one MSS
        const IPV4_LARGE_PACKET = 1 << 6;
        const IPV6_LARGE_PACKET = 1 << 7;
        /// Checksum fields left blank by the backend must be filled in
        const NEED_CHECKSUM_VALUE = 1 << 8;
        /// Oversized frames must have their first segment split off
        const NEED_LARGE_PACKET_SPLIT = 1 << 9;
    }
}

impl ReceiveOffload {
    pub fn accepts_large(self, version: IpVersion) -> bool {
        match version {
            IpVersion::V4 => self.contains(Self::IPV4_LARGE_PACKET),
            IpVersion::V6 => self.contains(Self::IPV6_LARGE_PACKET),
        }
    }
}

/// Insert an 802.1Q tag carrying `tci` after the MAC addresses.
///
/// Every region after the Ethernet addresses moves 4 bytes up.
pub fn insert_vlan_tag(header: &mut Vec<u8>, info: &mut HeaderInfo, tci: u16) {
    let mut tag = [0u8; VLAN_TAG_SIZE];
    tag[..2].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    tag[2..].copy_from_slice(&tci.to_be_bytes());
    header.splice(12..12, tag);

    info.shift_after(12, VLAN_TAG_SIZE as isize);
    info.vlan = true;
    info.ethernet.length = ETHERNET_HEADER_SIZE + VLAN_TAG_SIZE;
}

/// Remove the 802.1Q tag from a tagged header, returning its TCI.
///
/// Every region after the tag moves 4 bytes down.
pub fn excise_vlan_tag(header: &mut Vec<u8>, info: &mut HeaderInfo) -> Option<u16> {
    if !info.vlan {
        return None;
    }
    let tci = be16(header, 14);
    header.drain(12..12 + VLAN_TAG_SIZE);

    info.shift_after(12 + VLAN_TAG_SIZE, -(VLAN_TAG_SIZE as isize));
    info.vlan = false;
    info.ethernet.length = ETHERNET_HEADER_SIZE;
    Some(tci)
}

/// Set the IP length fields for an L4 segment of `l4_length` bytes.
///
/// The IPv4 header checksum is recomputed.
pub fn fixup_ip_length(header: &mut [u8], info: &HeaderInfo, l4_length: usize) {
    let Some(ip) = info.ip else {
        return;
    };
    match info.ip_version {
        Some(IpVersion::V4) => {
            let total = (info.ip_header_length() + l4_length).min(u16::MAX as usize);
            put_be16(header, ip.offset + 2, total as u16);
            refresh_ipv4_checksum(header, info);
        }
        Some(IpVersion::V6) => {
            let extensions = info.ip_options.map_or(0, |r| r.length);
            let payload = (extensions + l4_length).min(u16::MAX as usize);
            put_be16(header, ip.offset + 4, payload as u16);
        }
        None => {}
    }
}

/// Recompute the IPv4 header checksum in place
pub fn refresh_ipv4_checksum(header: &mut [u8], info: &HeaderInfo) {
    if let Some(ip) = info.ip.filter(|_| info.is_ipv4()) {
        let value = ipv4_header_checksum(header, info);
        put_be16(header, ip.offset + IPV4_CHECKSUM_OFFSET, value);
    }
}

/// Per-segment placement within a large TCP send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    /// Offset of the segment's payload within the original payload
    pub offset: usize,
    pub length: usize,
    pub last: bool,
}

/// Cut `payload_length` bytes into `mss`-sized segments.
pub fn segments(payload_length: usize, mss: usize) -> Vec<Segment> {
    let mss = mss.max(1);
    let count = payload_length.div_ceil(mss).max(1);
    (0..count)
        .map(|index| {
            let offset = index * mss;
            Segment {
                index,
                offset,
                length: mss.min(payload_length - offset),
                last: index + 1 == count,
            }
        })
        .collect()
}

/// Headers for one segment of a large TCP send.
///
/// Starts from the original headers: IP length (and IPv4 ID + index) are
/// adjusted, the sequence number advanced by the segment offset, FIN and PSH
/// kept only on the last segment, and both checksums recomputed over
/// `payload`, the segment's own payload bytes.
pub fn segment_header(
    header: &[u8],
    info: &HeaderInfo,
    segment: &Segment,
    payload: &[u8],
) -> Result<Vec<u8>, HeaderError> {
    let mut out = header[..info.length].to_vec();
    let Some(tcp) = info.tcp else {
        return Ok(out);
    };
    let tcp_header_length = info.l4_header().map_or(0, |r| r.length);

    if let Some(ip) = info.ip.filter(|_| info.is_ipv4()) {
        let ident = be16(&out, ip.offset + 4).wrapping_add(segment.index as u16);
        put_be16(&mut out, ip.offset + 4, ident);
    }
    fixup_ip_length(&mut out, info, tcp_header_length + payload.len());

    let seq = be32(&out, tcp.offset + 4).wrapping_add(segment.offset as u32);
    put_be32(&mut out, tcp.offset + 4, seq);
    if !segment.last {
        out[tcp.offset + 13] &= !(TCP_FIN | TCP_PSH);
    }

    let value = tcp_checksum(&out, info, &mut PayloadCursor::new(payload))?;
    put_be16(&mut out, tcp.offset + TCP_CHECKSUM_OFFSET, value);
    Ok(out)
}

/// Split one contiguous TCP frame into frames carrying at most `mss` bytes.
///
/// Frames that are not TCP, or already fit, come back unchanged.
pub fn segment_tcp(frame: &[u8], mss: usize) -> Result<Vec<Vec<u8>>, HeaderError> {
    let mut header = Vec::new();
    let mut cursor = PayloadCursor::new(frame);
    let info = classify(&mut header, &mut cursor)?;

    let payload = &frame[info.length..];
    if info.tcp.is_none() || payload.len() <= mss {
        return Ok(vec![frame.to_vec()]);
    }

    segments(payload.len(), mss)
        .iter()
        .map(|segment| {
            let data = &payload[segment.offset..segment.offset + segment.length];
            let mut out = segment_header(&header, &info, segment, data)?;
            out.extend_from_slice(data);
            Ok(out)
        })
        .collect()
}
