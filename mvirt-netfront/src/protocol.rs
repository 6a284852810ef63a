//! netif wire format
//!
//! Slot layouts and flag values shared with the backend. Every struct here is
//! written into or read out of a shared ring page byte-for-byte, so field order
//! and widths must not change.

use vm_memory::ByteValued;

/// Grant reference handed to the backend.
pub type GrantRef = u32;

/// Free-running ring index (wraps at 2^32).
pub type RingIdx = u32;

/// Page size of the guest and of every granted frame.
pub const PAGE_SIZE: usize = 4096;

/// Shared ring header: req_prod, req_event, rsp_prod, rsp_event + 48 bytes pad.
pub const SRING_HEADER_SIZE: usize = 64;

/// Offsets of the index words inside the shared ring header
pub const SRING_REQ_PROD: u64 = 0;
pub const SRING_REQ_EVENT: u64 = 4;
pub const SRING_RSP_PROD: u64 = 8;
pub const SRING_RSP_EVENT: u64 = 12;

/// Minimum number of slots a backend must accept for one packet.
pub const XEN_NETIF_NR_SLOTS_MIN: usize = 18;

/// Highest transmit request id.
pub const MAX_FRAGMENT_ID: u16 = 0x03FF;

/// Minimum Ethernet frame length without FCS.
pub const ETHERNET_MIN: usize = 60;

/// Maximum length of a (possibly LSO) frame
pub const MAXIMUM_FRAME_SIZE: usize = 65535;

// Transmit request flags
pub const NETTXF_CSUM_BLANK: u16 = 1 << 0;
pub const NETTXF_DATA_VALIDATED: u16 = 1 << 1;
pub const NETTXF_MORE_DATA: u16 = 1 << 2;
pub const NETTXF_EXTRA_INFO: u16 = 1 << 3;

// Receive response flags
pub const NETRXF_DATA_VALIDATED: u16 = 1 << 0;
pub const NETRXF_CSUM_BLANK: u16 = 1 << 1;
pub const NETRXF_MORE_DATA: u16 = 1 << 2;
pub const NETRXF_EXTRA_INFO: u16 = 1 << 3;
pub const NETRXF_GSO_PREFIX: u16 = 1 << 4;

// Response status
pub const NETIF_RSP_DROPPED: i16 = -2;
pub const NETIF_RSP_ERROR: i16 = -1;
pub const NETIF_RSP_OKAY: i16 = 0;
pub const NETIF_RSP_NULL: i16 = 1;

// Extra info types
pub const XEN_NETIF_EXTRA_TYPE_NONE: u8 = 0;
pub const XEN_NETIF_EXTRA_TYPE_GSO: u8 = 1;
pub const XEN_NETIF_EXTRA_TYPE_MCAST_ADD: u8 = 2;
pub const XEN_NETIF_EXTRA_TYPE_MCAST_DEL: u8 = 3;
pub const XEN_NETIF_EXTRA_TYPE_HASH: u8 = 4;

pub const XEN_NETIF_EXTRA_FLAG_MORE: u8 = 1 << 0;

// GSO types
pub const XEN_NETIF_GSO_TYPE_NONE: u8 = 0;
pub const XEN_NETIF_GSO_TYPE_TCPV4: u8 = 1;
pub const XEN_NETIF_GSO_TYPE_TCPV6: u8 = 2;

// Hash types (bit numbers) and algorithm
pub const XEN_NETIF_CTRL_HASH_TYPE_IPV4: u8 = 0;
pub const XEN_NETIF_CTRL_HASH_TYPE_IPV4_TCP: u8 = 1;
pub const XEN_NETIF_CTRL_HASH_TYPE_IPV6: u8 = 2;
pub const XEN_NETIF_CTRL_HASH_TYPE_IPV6_TCP: u8 = 3;
pub const XEN_NETIF_CTRL_HASH_ALGORITHM_TOEPLITZ: u8 = 1;

/// Transmit request slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxRequest {
    pub gref: GrantRef,
    pub offset: u16,
    pub flags: u16,
    pub id: u16,
    pub size: u16,
}

// SAFETY: TxRequest contains only POD types
unsafe impl ByteValued for TxRequest {}

/// Transmit response slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxResponse {
    pub id: u16,
    pub status: i16,
}

// SAFETY: TxResponse contains only POD types
unsafe impl ByteValued for TxResponse {}

/// Receive request slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxRequest {
    pub id: u16,
    pub pad: u16,
    pub gref: GrantRef,
}

// SAFETY: RxRequest contains only POD types
unsafe impl ByteValued for RxRequest {}

/// Receive response slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: u16,
    pub status: i16,
}

// SAFETY: RxResponse contains only POD types
unsafe impl ByteValued for RxResponse {}

/// Extra info record overlaying a request or response slot.
///
/// The six payload bytes are interpreted according to `kind`:
/// - GSO: size (u16), type (u8), pad (u8), features (u16)
/// - MCAST_ADD/DEL: MAC address
/// - HASH: type (u8), algorithm (u8), value (u32)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub kind: u8,
    pub flags: u8,
    pub data: [u8; 6],
}

// SAFETY: ExtraInfo contains only POD types
unsafe impl ByteValued for ExtraInfo {}

impl ExtraInfo {
    pub fn gso(size: u16, gso_type: u8) -> Self {
        let mut data = [0u8; 6];
        data[0..2].copy_from_slice(&size.to_le_bytes());
        data[2] = gso_type;
        Self {
            kind: XEN_NETIF_EXTRA_TYPE_GSO,
            flags: 0,
            data,
        }
    }

    pub fn multicast(add: bool, addr: [u8; 6]) -> Self {
        Self {
            kind: if add {
                XEN_NETIF_EXTRA_TYPE_MCAST_ADD
            } else {
                XEN_NETIF_EXTRA_TYPE_MCAST_DEL
            },
            flags: 0,
            data: addr,
        }
    }

    pub fn hash(hash_type: u8, value: u32) -> Self {
        let mut data = [0u8; 6];
        data[0] = hash_type;
        data[1] = XEN_NETIF_CTRL_HASH_ALGORITHM_TOEPLITZ;
        data[2..6].copy_from_slice(&value.to_le_bytes());
        Self {
            kind: XEN_NETIF_EXTRA_TYPE_HASH,
            flags: 0,
            data,
        }
    }

    pub fn more(&self) -> bool {
        self.flags & XEN_NETIF_EXTRA_FLAG_MORE != 0
    }

    pub fn gso_size(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    pub fn gso_type(&self) -> u8 {
        self.data[2]
    }

    pub fn hash_type(&self) -> u8 {
        self.data[0]
    }

    pub fn hash_value(&self) -> u32 {
        u32::from_le_bytes([self.data[2], self.data[3], self.data[4], self.data[5]])
    }

    pub fn multicast_addr(&self) -> [u8; 6] {
        self.data
    }
}

/// Receive-side hash reported by, or sent to, the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHash {
    /// One of the `XEN_NETIF_CTRL_HASH_TYPE_*` values
    pub hash_type: u8,
    pub value: u32,
}

impl From<&ExtraInfo> for PacketHash {
    fn from(extra: &ExtraInfo) -> Self {
        Self {
            hash_type: extra.hash_type(),
            value: extra.hash_value(),
        }
    }
}

/// Size of one transmit ring slot (union of request and response)
pub const TX_SLOT_SIZE: usize = max(
    std::mem::size_of::<TxRequest>(),
    std::mem::size_of::<TxResponse>(),
);

/// Size of one receive ring slot (union of request and response)
pub const RX_SLOT_SIZE: usize = max(
    std::mem::size_of::<RxRequest>(),
    std::mem::size_of::<RxResponse>(),
);

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Number of slots in a one-page shared ring with slots of `slot_size` bytes.
///
/// The slot count is rounded down to a power of two so that indices can be
/// masked instead of divided.
pub const fn ring_size(slot_size: usize) -> u32 {
    let slots = (PAGE_SIZE - SRING_HEADER_SIZE) / slot_size;
    let mut size = 1u32;
    while (size as usize) * 2 <= slots {
        size *= 2;
    }
    size
}

pub const TX_RING_SIZE: u32 = ring_size(TX_SLOT_SIZE);
pub const RX_RING_SIZE: u32 = ring_size(RX_SLOT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_sizes() {
        assert_eq!(std::mem::size_of::<TxRequest>(), 12);
        assert_eq!(std::mem::size_of::<TxResponse>(), 4);
        assert_eq!(std::mem::size_of::<RxRequest>(), 8);
        assert_eq!(std::mem::size_of::<RxResponse>(), 8);
        assert_eq!(std::mem::size_of::<ExtraInfo>(), 8);
        assert_eq!(TX_SLOT_SIZE, 12);
        assert_eq!(RX_SLOT_SIZE, 8);
    }

    #[test]
    fn test_ring_sizes() {
        // (4096 - 64) / 12 = 336 -> 256, (4096 - 64) / 8 = 504 -> 256
        assert_eq!(TX_RING_SIZE, 256);
        assert_eq!(RX_RING_SIZE, 256);
    }

    #[test]
    fn test_extra_info_encoding() {
        let gso = ExtraInfo::gso(1460, XEN_NETIF_GSO_TYPE_TCPV4);
        assert_eq!(gso.as_slice(), &[1, 0, 0xb4, 0x05, 1, 0, 0, 0]);
        assert_eq!(gso.gso_size(), 1460);
        assert_eq!(gso.gso_type(), XEN_NETIF_GSO_TYPE_TCPV4);

        let hash = ExtraInfo::hash(XEN_NETIF_CTRL_HASH_TYPE_IPV4_TCP, 0xdeadbeef);
        assert_eq!(hash.hash_type(), XEN_NETIF_CTRL_HASH_TYPE_IPV4_TCP);
        assert_eq!(hash.hash_value(), 0xdeadbeef);

        let mcast = ExtraInfo::multicast(false, [0x01, 0x00, 0x5e, 0, 0, 1]);
        assert_eq!(mcast.kind, XEN_NETIF_EXTRA_TYPE_MCAST_DEL);
        assert_eq!(mcast.multicast_addr(), [0x01, 0x00, 0x5e, 0, 0, 1]);
    }
}
