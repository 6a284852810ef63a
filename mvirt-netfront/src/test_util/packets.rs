//! Frame builders and checkers for tests
//!
//! Uses smoltcp for packet construction and verification, independent of the
//! crate's own checksum engine.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address,
    Ipv6Packet, Ipv6Repr, TcpPacket, TcpSeqNumber, UdpPacket, UdpRepr,
};

// ============================================================================
// Constants
// ============================================================================

pub const ETHERNET_HDR_SIZE: usize = 14;
pub const IPV4_HDR_SIZE: usize = 20;
pub const IPV6_HDR_SIZE: usize = 40;
pub const TCP_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;

/// Header length of an untagged TCP/IPv4 frame
pub const TCP_IPV4_HEADERS: usize = ETHERNET_HDR_SIZE + IPV4_HDR_SIZE + TCP_HDR_SIZE;
/// Header length of an untagged TCP/IPv6 frame
pub const TCP_IPV6_HEADERS: usize = ETHERNET_HDR_SIZE + IPV6_HDR_SIZE + TCP_HDR_SIZE;

pub const GUEST_MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x12, 0x34, 0x56];
pub const PEER_MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x65, 0x43, 0x21];
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

pub const GUEST_IPV4: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
pub const PEER_IPV4: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
pub const GUEST_IPV6: Ipv6Address = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
pub const PEER_IPV6: Ipv6Address = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

pub const TCP_SRC_PORT: u16 = 40000;
pub const TCP_DST_PORT: u16 = 5001;

// ============================================================================
// Builders
// ============================================================================

fn ethernet(buffer: &mut [u8], ethertype: EthernetProtocol) -> EthernetFrame<&mut [u8]> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(GUEST_MAC),
        dst_addr: EthernetAddress(PEER_MAC),
        ethertype,
    };
    let mut frame = EthernetFrame::new_unchecked(buffer);
    eth_repr.emit(&mut frame);
    frame
}

fn fill_tcp(buffer: &mut [u8], payload: &[u8], seq: u32, src: IpAddress, dst: IpAddress) {
    let mut tcp = TcpPacket::new_unchecked(buffer);
    tcp.set_src_port(TCP_SRC_PORT);
    tcp.set_dst_port(TCP_DST_PORT);
    tcp.set_seq_number(TcpSeqNumber(seq as i32));
    tcp.set_ack_number(TcpSeqNumber(1));
    tcp.set_header_len(TCP_HDR_SIZE as u8);
    tcp.clear_flags();
    tcp.set_ack(true);
    tcp.set_psh(true);
    tcp.set_window_len(0xffff);
    tcp.set_urgent_at(0);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(&src, &dst);
}

/// TCP/IPv4 frame with valid checksums
pub fn tcp_ipv4_frame(payload: &[u8], seq: u32, ident: u16) -> Vec<u8> {
    let tcp_len = TCP_HDR_SIZE + payload.len();
    let mut buffer = vec![0u8; ETHERNET_HDR_SIZE + IPV4_HDR_SIZE + tcp_len];

    let mut frame = ethernet(&mut buffer, EthernetProtocol::Ipv4);
    let ip_repr = Ipv4Repr {
        src_addr: GUEST_IPV4,
        dst_addr: PEER_IPV4,
        next_header: IpProtocol::Tcp,
        payload_len: tcp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    ip_packet.set_ident(ident);
    ip_packet.fill_checksum();

    fill_tcp(
        ip_packet.payload_mut(),
        payload,
        seq,
        GUEST_IPV4.into(),
        PEER_IPV4.into(),
    );
    buffer
}

/// TCP/IPv6 frame with a valid checksum
pub fn tcp_ipv6_frame(payload: &[u8], seq: u32) -> Vec<u8> {
    let tcp_len = TCP_HDR_SIZE + payload.len();
    let mut buffer = vec![0u8; ETHERNET_HDR_SIZE + IPV6_HDR_SIZE + tcp_len];

    let mut frame = ethernet(&mut buffer, EthernetProtocol::Ipv6);
    let ip_repr = Ipv6Repr {
        src_addr: GUEST_IPV6,
        dst_addr: PEER_IPV6,
        next_header: IpProtocol::Tcp,
        payload_len: tcp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip_packet);

    fill_tcp(
        ip_packet.payload_mut(),
        payload,
        seq,
        GUEST_IPV6.into(),
        PEER_IPV6.into(),
    );
    buffer
}

/// UDP/IPv4 frame with valid checksums
pub fn udp_ipv4_frame(payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut buffer = vec![0u8; ETHERNET_HDR_SIZE + IPV4_HDR_SIZE + udp_len];

    let mut frame = ethernet(&mut buffer, EthernetProtocol::Ipv4);
    let ip_repr = Ipv4Repr {
        src_addr: GUEST_IPV4,
        dst_addr: PEER_IPV4,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr {
        src_port: 5353,
        dst_port: 5353,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    buffer
}

/// UDP/IPv6 frame with a valid checksum
pub fn udp_ipv6_frame(payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut buffer = vec![0u8; ETHERNET_HDR_SIZE + IPV6_HDR_SIZE + udp_len];

    let mut frame = ethernet(&mut buffer, EthernetProtocol::Ipv6);
    let ip_repr = Ipv6Repr {
        src_addr: GUEST_IPV6,
        dst_addr: PEER_IPV6,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip_packet);

    let udp_repr = UdpRepr {
        src_port: 546,
        dst_port: 547,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    buffer
}

/// Gratuitous ARP request for the guest address
pub fn gratuitous_arp_request() -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(GUEST_MAC),
        source_protocol_addr: GUEST_IPV4,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: GUEST_IPV4,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(GUEST_MAC),
        dst_addr: EthernetAddress(BROADCAST_MAC),
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);
    buffer
}

/// Insert an 802.1Q tag after the MAC addresses
pub fn with_vlan(frame: &[u8], tci: u16) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(frame.len() + 4);
    tagged.extend_from_slice(&frame[..12]);
    tagged.extend_from_slice(&[0x81, 0x00]);
    tagged.extend_from_slice(&tci.to_be_bytes());
    tagged.extend_from_slice(&frame[12..]);
    tagged
}

/// Deterministic payload bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ============================================================================
// Checkers
// ============================================================================

/// Summary of a TCP frame, parsed with smoltcp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub ipv6: bool,
    pub ident: Option<u16>,
    pub ip_length: usize,
    pub seq: u32,
    pub fin: bool,
    pub psh: bool,
    pub payload: Vec<u8>,
    pub checksums_valid: bool,
}

/// Parse an untagged TCP frame, checking IP and TCP checksums.
pub fn parse_tcp_frame(data: &[u8]) -> Option<TcpFrame> {
    let frame = EthernetFrame::new_checked(data).ok()?;
    match frame.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            let valid = ip.verify_checksum()
                && tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into());
            Some(TcpFrame {
                ipv6: false,
                ident: Some(ip.ident()),
                ip_length: ip.total_len() as usize,
                seq: tcp.seq_number().0 as u32,
                fin: tcp.fin(),
                psh: tcp.psh(),
                payload: tcp.payload().to_vec(),
                checksums_valid: valid,
            })
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(frame.payload()).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            let valid = tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into());
            Some(TcpFrame {
                ipv6: true,
                ident: None,
                ip_length: ip.payload_len() as usize,
                seq: tcp.seq_number().0 as u32,
                fin: tcp.fin(),
                psh: tcp.psh(),
                payload: tcp.payload().to_vec(),
                checksums_valid: valid,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_frames_parse() {
        let frame = tcp_ipv4_frame(&pattern(100, 1), 1234, 77);
        let tcp = parse_tcp_frame(&frame).expect("tcp");
        assert!(tcp.checksums_valid);
        assert_eq!(tcp.seq, 1234);
        assert_eq!(tcp.ident, Some(77));
        assert_eq!(tcp.payload, pattern(100, 1));

        let frame = tcp_ipv6_frame(&pattern(10, 2), 99);
        let tcp = parse_tcp_frame(&frame).expect("tcp");
        assert!(tcp.checksums_valid);
        assert!(tcp.ipv6);
        assert_eq!(tcp.ip_length, TCP_HDR_SIZE + 10);
    }

    #[test]
    fn test_with_vlan() {
        let frame = udp_ipv4_frame(&[0; 4]);
        let tagged = with_vlan(&frame, 0x0064);
        assert_eq!(tagged.len(), frame.len() + 4);
        assert_eq!(&tagged[12..16], &[0x81, 0x00, 0x00, 0x64]);
        assert_eq!(&tagged[16..], &frame[12..]);
    }
}
