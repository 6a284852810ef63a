//! Frames the front-end sends on its own behalf
//!
//! Announcements after (re)connecting so switches and neighbours learn the
//! guest's MAC: a gratuitous ARP request per IPv4 address and an unsolicited
//! neighbour advertisement per IPv6 address.

use std::net::{Ipv4Addr, Ipv6Addr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
    NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};
use tracing::trace;

/// IPv6 all-nodes multicast address
pub const ALL_NODES_MULTICAST: Ipv6Address = Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Ethernet address for the all-nodes group (33:33 + low 32 bits)
const ALL_NODES_MAC: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];

/// Gratuitous ARP request announcing `ip` at `mac`.
pub fn gratuitous_arp(mac: [u8; 6], ip: Ipv4Addr) -> Vec<u8> {
    let source = EthernetAddress(mac);
    let eth_repr = EthernetRepr {
        src_addr: source,
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: source,
        source_protocol_addr: ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: ip,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    trace!(ip = %ip, "Gratuitous ARP built");
    buffer
}

/// Unsolicited neighbour advertisement for `ip` sent to all nodes.
pub fn neighbour_advertisement(mac: [u8; 6], ip: Ipv6Addr) -> Vec<u8> {
    let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::OVERRIDE,
        target_addr: ip,
        lladdr: Some(RawHardwareAddress::from_bytes(&mac)),
    });
    let ipv6_repr = Ipv6Repr {
        src_addr: ip,
        dst_addr: ALL_NODES_MULTICAST,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 255,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(mac),
        dst_addr: EthernetAddress(ALL_NODES_MAC),
        ethertype: EthernetProtocol::Ipv6,
    };

    let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buffer = vec![0u8; total_len];

    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);
    let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
    icmp_repr.emit(
        &ip,
        &ALL_NODES_MULTICAST,
        &mut icmp_packet,
        &ChecksumCapabilities::default(),
    );

    trace!(ip = %ip, "Neighbour advertisement built");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::packets::GUEST_MAC;

    #[test]
    fn test_gratuitous_arp() {
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        let buffer = gratuitous_arp(GUEST_MAC, ip);

        let frame = EthernetFrame::new_checked(&buffer[..]).expect("ethernet");
        assert_eq!(frame.dst_addr(), EthernetAddress::BROADCAST);
        assert_eq!(frame.ethertype(), EthernetProtocol::Arp);

        let arp = ArpPacket::new_checked(frame.payload()).expect("arp");
        let repr = ArpRepr::parse(&arp).expect("repr");
        assert_eq!(
            repr,
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Request,
                source_hardware_addr: EthernetAddress(GUEST_MAC),
                source_protocol_addr: ip,
                target_hardware_addr: EthernetAddress([0; 6]),
                target_protocol_addr: ip,
            }
        );
    }

    #[test]
    fn test_neighbour_advertisement() {
        let ip = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
        let buffer = neighbour_advertisement(GUEST_MAC, ip);

        let frame = EthernetFrame::new_checked(&buffer[..]).expect("ethernet");
        assert_eq!(frame.dst_addr(), EthernetAddress(ALL_NODES_MAC));
        let ipv6 = Ipv6Packet::new_checked(frame.payload()).expect("ipv6");
        assert_eq!(ipv6.dst_addr(), ALL_NODES_MULTICAST);
        assert_eq!(ipv6.hop_limit(), 255);

        let icmp = Icmpv6Packet::new_checked(ipv6.payload()).expect("icmpv6");
        assert!(icmp.verify_checksum(&ip, &ALL_NODES_MULTICAST));
        let repr = Icmpv6Repr::parse(
            &ip,
            &ALL_NODES_MULTICAST,
            &icmp,
            &ChecksumCapabilities::default(),
        )
        .expect("repr");
        match repr {
            Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
                flags, target_addr, ..
            }) => {
                assert_eq!(target_addr, ip);
                assert!(flags.contains(NdiscNeighborFlags::OVERRIDE));
                assert!(!flags.contains(NdiscNeighborFlags::SOLICITED));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
