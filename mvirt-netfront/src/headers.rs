//! Header classifier
//!
//! Walks Ethernet (optionally 802.1Q tagged), 802.2 LLC / SNAP, IPv4 or
//! IPv6 with options and extension headers, and TCP or UDP, recording where
//! each header sits relative to the start of the frame. Bytes are pulled from
//! a `PayloadCursor` into a contiguous header buffer only as far as the
//! parse needs them.

use crate::error::HeaderError;
use crate::payload::{Payload, PayloadCursor};

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const VLAN_TAG_SIZE: usize = 4;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const TCP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// TCP flag bits in byte 13
pub const TCP_FIN: u8 = 0x01;
pub const TCP_PSH: u8 = 0x08;

const ETHERTYPE_MIN: u16 = 0x0600;
const LLC_SIZE: usize = 3;
const SNAP_SIZE: usize = 8;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DESTINATION: u8 = 60;

pub(crate) fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn put_be32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Byte range of one header within the frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderRegion {
    pub offset: usize,
    pub length: usize,
}

impl HeaderRegion {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    fn shift(&mut self, delta: isize) {
        self.offset = self.offset.wrapping_add_signed(delta);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Result of `classify`.
///
/// `ip_options` holds IPv4 options or the IPv6 extension header chain.
/// Regions after a detected IP fragment are not parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    pub ethernet: HeaderRegion,
    pub vlan: bool,
    pub llc: Option<HeaderRegion>,
    pub snap: bool,
    pub ip_version: Option<IpVersion>,
    pub ip: Option<HeaderRegion>,
    pub ip_options: Option<HeaderRegion>,
    pub tcp: Option<HeaderRegion>,
    pub tcp_options: Option<HeaderRegion>,
    pub udp: Option<HeaderRegion>,
    pub fragment: bool,
    /// Total header length
    pub length: usize,
}

impl HeaderInfo {
    pub fn is_ipv4(&self) -> bool {
        self.ip_version == Some(IpVersion::V4)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip_version == Some(IpVersion::V6)
    }

    /// IP header plus options / extension headers
    pub fn ip_header_length(&self) -> usize {
        self.ip.map_or(0, |r| r.length) + self.ip_options.map_or(0, |r| r.length)
    }

    /// TCP or UDP header including options
    pub fn l4_header(&self) -> Option<HeaderRegion> {
        if let Some(tcp) = self.tcp {
            let options = self.tcp_options.map_or(0, |r| r.length);
            return Some(HeaderRegion::new(tcp.offset, tcp.length + options));
        }
        self.udp
    }

    /// Where the IP payload (L4 header) starts
    pub fn l4_offset(&self) -> Option<usize> {
        self.ip.map(|ip| ip.offset + self.ip_header_length())
    }

    /// L4 length as declared by the IP header
    pub fn declared_l4_length(&self, header: &[u8]) -> Option<usize> {
        let ip = self.ip?;
        match self.ip_version? {
            IpVersion::V4 => {
                let total = be16(header, ip.offset + 2) as usize;
                total.checked_sub(self.ip_header_length())
            }
            IpVersion::V6 => {
                let payload = be16(header, ip.offset + 4) as usize;
                payload.checked_sub(self.ip_options.map_or(0, |r| r.length))
            }
        }
    }

    /// Move every region starting at or after `at` by `delta` bytes.
    pub fn shift_after(&mut self, at: usize, delta: isize) {
        for region in [
            self.llc.as_mut(),
            self.ip.as_mut(),
            self.ip_options.as_mut(),
            self.tcp.as_mut(),
            self.tcp_options.as_mut(),
            self.udp.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if region.offset >= at {
                region.shift(delta);
            }
        }
        self.length = self.length.wrapping_add_signed(delta);
    }
}

/// Make sure `header` holds at least `need` bytes.
fn ensure<P: Payload + ?Sized>(
    header: &mut Vec<u8>,
    cursor: &mut PayloadCursor<'_, P>,
    need: usize,
    layer: &'static str,
) -> Result<(), HeaderError> {
    if header.len() < need {
        let want = need - header.len();
        cursor.pull(header, want)?;
    }
    if header.len() < need {
        return Err(HeaderError::Truncated {
            layer,
            needed: need,
            available: header.len(),
        });
    }
    Ok(())
}

/// Classify the frame whose first bytes are in `header`.
///
/// `header` may start empty; bytes are pulled from `cursor` as the walk
/// needs them. On success `header` holds exactly the headers (`info.length`
/// bytes) unless it already held more on entry.
pub fn classify<P: Payload + ?Sized>(
    header: &mut Vec<u8>,
    cursor: &mut PayloadCursor<'_, P>,
) -> Result<HeaderInfo, HeaderError> {
    let mut info = HeaderInfo::default();

    ensure(header, cursor, ETHERNET_HEADER_SIZE, "Ethernet")?;
    let mut ethertype = be16(header, 12);
    let mut offset = ETHERNET_HEADER_SIZE;

    if ethertype == ETHERTYPE_VLAN {
        ensure(header, cursor, ETHERNET_HEADER_SIZE + VLAN_TAG_SIZE, "802.1Q")?;
        info.vlan = true;
        ethertype = be16(header, 16);
        offset += VLAN_TAG_SIZE;
    }
    info.ethernet = HeaderRegion::new(0, offset);

    if ethertype < ETHERTYPE_MIN {
        ensure(header, cursor, offset + LLC_SIZE, "LLC")?;
        if header[offset..offset + LLC_SIZE] == [0xAA, 0xAA, 0x03] {
            ensure(header, cursor, offset + SNAP_SIZE, "SNAP")?;
            info.llc = Some(HeaderRegion::new(offset, SNAP_SIZE));
            info.snap = true;
            ethertype = be16(header, offset + 6);
            offset += SNAP_SIZE;
        } else {
            info.llc = Some(HeaderRegion::new(offset, LLC_SIZE));
            info.length = offset + LLC_SIZE;
            return Ok(info);
        }
    }

    let protocol = match ethertype {
        ETHERTYPE_IPV4 => classify_ipv4(header, cursor, &mut info, &mut offset)?,
        ETHERTYPE_IPV6 => classify_ipv6(header, cursor, &mut info, &mut offset)?,
        _ => {
            info.length = offset;
            return Ok(info);
        }
    };

    if !info.fragment {
        match protocol {
            IPPROTO_TCP => {
                ensure(header, cursor, offset + TCP_HEADER_SIZE, "TCP")?;
                let data_offset = (header[offset + 12] >> 4) as usize * 4;
                if data_offset < TCP_HEADER_SIZE {
                    return Err(HeaderError::InvalidLength {
                        layer: "TCP",
                        length: data_offset,
                    });
                }
                ensure(header, cursor, offset + data_offset, "TCP options")?;
                info.tcp = Some(HeaderRegion::new(offset, TCP_HEADER_SIZE));
                if data_offset > TCP_HEADER_SIZE {
                    info.tcp_options = Some(HeaderRegion::new(
                        offset + TCP_HEADER_SIZE,
                        data_offset - TCP_HEADER_SIZE,
                    ));
                }
                offset += data_offset;
            }
            IPPROTO_UDP => {
                ensure(header, cursor, offset + UDP_HEADER_SIZE, "UDP")?;
                info.udp = Some(HeaderRegion::new(offset, UDP_HEADER_SIZE));
                offset += UDP_HEADER_SIZE;
            }
            _ => {}
        }
    }

    info.length = offset;
    Ok(info)
}

fn classify_ipv4<P: Payload + ?Sized>(
    header: &mut Vec<u8>,
    cursor: &mut PayloadCursor<'_, P>,
    info: &mut HeaderInfo,
    offset: &mut usize,
) -> Result<u8, HeaderError> {
    let start = *offset;
    ensure(header, cursor, start + IPV4_HEADER_SIZE, "IPv4")?;

    let version = header[start] >> 4;
    if version != 4 {
        return Err(HeaderError::InvalidVersion(version));
    }
    let ihl = (header[start] & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_SIZE {
        return Err(HeaderError::InvalidLength {
            layer: "IPv4",
            length: ihl,
        });
    }
    // Zero is left for the segmenting end to fill in
    let total = be16(header, start + 2) as usize;
    if total != 0 && total < ihl {
        return Err(HeaderError::InvalidLength {
            layer: "IPv4",
            length: total,
        });
    }
    ensure(header, cursor, start + ihl, "IPv4 options")?;

    info.ip_version = Some(IpVersion::V4);
    info.ip = Some(HeaderRegion::new(start, IPV4_HEADER_SIZE));
    if ihl > IPV4_HEADER_SIZE {
        info.ip_options = Some(HeaderRegion::new(
            start + IPV4_HEADER_SIZE,
            ihl - IPV4_HEADER_SIZE,
        ));
    }

    let frag = be16(header, start + 6);
    // More-fragments bit or non-zero offset
    info.fragment = frag & 0x2000 != 0 || frag & 0x1fff != 0;

    *offset = start + ihl;
    Ok(header[start + 9])
}

fn classify_ipv6<P: Payload + ?Sized>(
    header: &mut Vec<u8>,
    cursor: &mut PayloadCursor<'_, P>,
    info: &mut HeaderInfo,
    offset: &mut usize,
) -> Result<u8, HeaderError> {
    let start = *offset;
    ensure(header, cursor, start + IPV6_HEADER_SIZE, "IPv6")?;

    let version = header[start] >> 4;
    if version != 6 {
        return Err(HeaderError::InvalidVersion(version));
    }

    info.ip_version = Some(IpVersion::V6);
    info.ip = Some(HeaderRegion::new(start, IPV6_HEADER_SIZE));

    let mut next = header[start + 6];
    let ext_start = start + IPV6_HEADER_SIZE;
    let mut pos = ext_start;

    loop {
        match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DESTINATION => {
                ensure(header, cursor, pos + 2, "IPv6 extension")?;
                let len = (header[pos + 1] as usize + 1) * 8;
                ensure(header, cursor, pos + len, "IPv6 extension")?;
                next = header[pos];
                pos += len;
            }
            IPV6_FRAGMENT => {
                ensure(header, cursor, pos + 8, "IPv6 fragment")?;
                let frag = be16(header, pos + 2);
                if frag & 0xfff8 != 0 || frag & 0x0001 != 0 {
                    info.fragment = true;
                }
                next = header[pos];
                pos += 8;
            }
            IPV6_AUTH => {
                ensure(header, cursor, pos + 2, "IPv6 AH")?;
                let len = (header[pos + 1] as usize + 2) * 4;
                ensure(header, cursor, pos + len, "IPv6 AH")?;
                next = header[pos];
                pos += len;
            }
            _ => break,
        }
    }

    if pos > ext_start {
        info.ip_options = Some(HeaderRegion::new(ext_start, pos - ext_start));
    }

    *offset = pos;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::packets;

    fn classify_frame(frame: &[u8]) -> Result<(HeaderInfo, Vec<u8>), HeaderError> {
        let mut cursor = PayloadCursor::new(frame);
        let mut header = Vec::new();
        let info = classify(&mut header, &mut cursor)?;
        Ok((info, header))
    }

    #[test]
    fn test_classify_tcp_ipv4() {
        let frame = packets::tcp_ipv4_frame(&[0xab; 100], 1000, 7);
        let (info, header) = classify_frame(&frame).expect("classify");

        assert_eq!(info.ethernet, HeaderRegion::new(0, 14));
        assert!(!info.vlan);
        assert!(info.is_ipv4());
        assert_eq!(info.ip, Some(HeaderRegion::new(14, 20)));
        assert_eq!(info.ip_options, None);
        assert_eq!(info.tcp, Some(HeaderRegion::new(34, 20)));
        assert_eq!(info.udp, None);
        assert!(!info.fragment);
        assert_eq!(info.length, 54);
        assert_eq!(header.len(), 54);
        assert_eq!(info.declared_l4_length(&header), Some(120));
    }

    #[test]
    fn test_classify_vlan_udp_ipv6() {
        let frame = packets::with_vlan(&packets::udp_ipv6_frame(&[1; 32]), 100);
        let (info, _) = classify_frame(&frame).expect("classify");

        assert!(info.vlan);
        assert_eq!(info.ethernet, HeaderRegion::new(0, 18));
        assert!(info.is_ipv6());
        assert_eq!(info.ip, Some(HeaderRegion::new(18, 40)));
        assert_eq!(info.udp, Some(HeaderRegion::new(58, 8)));
        assert_eq!(info.length, 66);
    }

    #[test]
    fn test_classify_ipv4_options() {
        let mut frame = packets::udp_ipv4_frame(&[0; 16]);
        // Insert 4 bytes of NOP options and bump IHL / total length
        frame.splice(34..34, [1u8, 1, 1, 1]);
        frame[14] = 0x46;
        let total = be16(&frame, 16) + 4;
        put_be16(&mut frame, 16, total);

        let (info, _) = classify_frame(&frame).expect("classify");
        assert_eq!(info.ip_options, Some(HeaderRegion::new(34, 4)));
        assert_eq!(info.udp, Some(HeaderRegion::new(38, 8)));
        assert_eq!(info.ip_header_length(), 24);
    }

    #[test]
    fn test_classify_ipv4_fragment_stops_at_ip() {
        let mut frame = packets::tcp_ipv4_frame(&[0; 64], 1, 1);
        // More fragments
        frame[20] |= 0x20;
        let (info, _) = classify_frame(&frame).expect("classify");
        assert!(info.fragment);
        assert_eq!(info.tcp, None);
        assert_eq!(info.length, 34);
    }

    #[test]
    fn test_classify_ipv6_extension_headers() {
        let mut frame = packets::tcp_ipv6_frame(&[0; 10], 5);
        // Hop-by-hop header (8 bytes) in front of TCP
        let hop_by_hop = [IPPROTO_TCP, 0, 0, 0, 0, 0, 0, 0];
        frame.splice(54..54, hop_by_hop);
        frame[20] = IPV6_HOP_BY_HOP;
        let payload = be16(&frame, 18) + 8;
        put_be16(&mut frame, 18, payload);

        let (info, _) = classify_frame(&frame).expect("classify");
        assert_eq!(info.ip_options, Some(HeaderRegion::new(54, 8)));
        assert_eq!(info.tcp, Some(HeaderRegion::new(62, 20)));
        assert_eq!(info.length, 82);
    }

    #[test]
    fn test_classify_llc_snap() {
        let ipv4 = packets::udp_ipv4_frame(&[0; 8]);
        let mut frame = ipv4[..12].to_vec();
        let length = (ipv4.len() - 14 + SNAP_SIZE) as u16;
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&[0xAA, 0xAA, 0x03, 0, 0, 0, 0x08, 0x00]);
        frame.extend_from_slice(&ipv4[14..]);

        let (info, _) = classify_frame(&frame).expect("classify");
        assert!(info.snap);
        assert_eq!(info.llc, Some(HeaderRegion::new(14, 8)));
        assert_eq!(info.ip, Some(HeaderRegion::new(22, 20)));
        assert_eq!(info.udp, Some(HeaderRegion::new(42, 8)));
    }

    #[test]
    fn test_classify_plain_llc() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&46u16.to_be_bytes());
        frame.extend_from_slice(&[0x42, 0x42, 0x03]);
        frame.resize(60, 0);

        let (info, _) = classify_frame(&frame).expect("classify");
        assert_eq!(info.llc, Some(HeaderRegion::new(14, 3)));
        assert!(!info.snap);
        assert_eq!(info.ip, None);
        assert_eq!(info.length, 17);
    }

    #[test]
    fn test_classify_arp_is_ethernet_only() {
        let frame = packets::gratuitous_arp_request();
        let (info, _) = classify_frame(&frame).expect("classify");
        assert_eq!(info.ip, None);
        assert_eq!(info.length, 14);
    }

    #[test]
    fn test_classify_truncated() {
        let frame = packets::tcp_ipv4_frame(&[], 0, 0);
        let err = classify_frame(&frame[..40]).expect_err("truncated");
        assert!(matches!(err, HeaderError::Truncated { layer: "TCP", .. }));

        let err = classify_frame(&frame[..10]).expect_err("truncated");
        assert!(matches!(
            err,
            HeaderError::Truncated {
                layer: "Ethernet",
                ..
            }
        ));
    }

    #[test]
    fn test_classify_bad_ihl() {
        let mut frame = packets::udp_ipv4_frame(&[0; 8]);
        frame[14] = 0x43;
        let err = classify_frame(&frame).expect_err("bad ihl");
        assert!(matches!(err, HeaderError::InvalidLength { layer: "IPv4", .. }));
    }

    #[test]
    fn test_classify_ipv4_total_length() {
        let mut frame = packets::tcp_ipv4_frame(&[0; 1000], 0, 0);
        frame[16] = 0;
        frame[17] = 0;
        let (info, header) = classify_frame(&frame).expect("unset length");
        assert_eq!(info.tcp, Some(HeaderRegion::new(34, 20)));
        assert_eq!(info.declared_l4_length(&header), None);

        frame[17] = 12;
        let err = classify_frame(&frame).expect_err("shorter than header");
        assert!(matches!(err, HeaderError::InvalidLength { layer: "IPv4", length: 12 }));
    }

    #[test]
    fn test_shift_after() {
        let frame = packets::tcp_ipv4_frame(&[0; 4], 0, 0);
        let (mut info, _) = classify_frame(&frame).expect("classify");
        info.shift_after(12, 4);
        assert_eq!(info.ip, Some(HeaderRegion::new(18, 20)));
        assert_eq!(info.tcp, Some(HeaderRegion::new(38, 20)));
        assert_eq!(info.length, 58);
        info.shift_after(12, -4);
        assert_eq!(info.tcp, Some(HeaderRegion::new(34, 20)));
    }
}
