//! Per-ring statistics

use serde::Serialize;

/// How a frame is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast,
    Multicast,
    Broadcast,
}

impl Destination {
    /// Classify by destination MAC (first six bytes of the frame).
    pub fn of(frame: &[u8]) -> Self {
        match frame.get(..6) {
            Some(mac) if mac == [0xff; 6] => Destination::Broadcast,
            Some(mac) if mac[0] & 0x01 != 0 => Destination::Multicast,
            _ => Destination::Unicast,
        }
    }
}

/// Packet and octet counters split by destination kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    pub unicast_packets: u64,
    pub unicast_octets: u64,
    pub multicast_packets: u64,
    pub multicast_octets: u64,
    pub broadcast_packets: u64,
    pub broadcast_octets: u64,
}

impl TrafficCounters {
    pub fn record(&mut self, destination: Destination, octets: usize) {
        let octets = octets as u64;
        match destination {
            Destination::Unicast => {
                self.unicast_packets += 1;
                self.unicast_octets += octets;
            }
            Destination::Multicast => {
                self.multicast_packets += 1;
                self.multicast_octets += octets;
            }
            Destination::Broadcast => {
                self.broadcast_packets += 1;
                self.broadcast_octets += octets;
            }
        }
    }

    pub fn packets(&self) -> u64 {
        self.unicast_packets + self.multicast_packets + self.broadcast_packets
    }
}

/// Protocol mix of completed packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolCounters {
    pub ipv4: u64,
    pub ipv6: u64,
    pub tcp: u64,
    pub udp: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxStatistics {
    pub traffic: TrafficCounters,
    pub protocols: ProtocolCounters,
    /// Packets the backend flagged with an error status
    pub backend_errors: u64,
    /// Packets forwarded without offload because headers did not parse
    pub malformed_headers: u64,
    pub ip_checksum_failed: u64,
    pub tcp_checksum_failed: u64,
    pub udp_checksum_failed: u64,
    /// Checksums filled in for csum_blank packets
    pub checksums_calculated: u64,
    pub vlan_tags_stripped: u64,
    pub gso_packets: u64,
    pub segments_split: u64,
    /// Splits cut short by buffer exhaustion
    pub split_fallbacks: u64,
    pub unknown_extras: u64,
    /// Times the ring went to Stopped
    pub stops: u64,
    pub requests_posted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxStatistics {
    pub traffic: TrafficCounters,
    pub protocols: ProtocolCounters,
    pub completed_ok: u64,
    pub completed_dropped: u64,
    pub completed_error: u64,
    pub lso_packets: u64,
    pub lso_demoted: u64,
    pub payload_granted: u64,
    pub payload_copied: u64,
    pub checksum_offloaded: u64,
    pub checksum_calculated: u64,
    pub malformed_headers: u64,
    /// Posts deferred for lack of ring slots or buffers
    pub busy: u64,
    pub fake_responses: u64,
    pub control_requests: u64,
    pub stalls: u64,
    pub requests_posted: u64,
    /// Caller pages left granted after a failed revoke
    pub grants_stranded: u64,
}
