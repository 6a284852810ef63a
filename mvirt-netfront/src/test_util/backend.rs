//! Backend side of the shared rings
//!
//! Plays the backend domain: consumes requests, reads and writes granted
//! frames, produces responses in ring order.

use std::sync::Arc;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::SimGrantTable;
use crate::checksum::{TCP_CHECKSUM_OFFSET, UDP_CHECKSUM_OFFSET, tcp_checksum, udp_checksum};
use crate::headers::{classify, put_be16};
use crate::offload::segment_tcp;
use crate::payload::PayloadCursor;
use crate::protocol::{
    ExtraInfo, GrantRef, NETIF_RSP_ERROR, NETIF_RSP_NULL, NETRXF_EXTRA_INFO, NETRXF_MORE_DATA,
    NETTXF_CSUM_BLANK, NETTXF_EXTRA_INFO, NETTXF_MORE_DATA, PAGE_SIZE, PacketHash, RxRequest,
    RxResponse, TxRequest, TxResponse, XEN_NETIF_EXTRA_TYPE_GSO, XEN_NETIF_EXTRA_TYPE_HASH,
    XEN_NETIF_EXTRA_FLAG_MORE, XEN_NETIF_EXTRA_TYPE_MCAST_ADD, XEN_NETIF_EXTRA_TYPE_MCAST_DEL,
};
use crate::ring::BackRing;

fn frame_address(grants: &SimGrantTable, gref: GrantRef, offset: u16) -> GuestAddress {
    let grant = grants.lookup(gref).expect("request carries an active grant");
    GuestAddress(grant.pfn * PAGE_SIZE as u64 + offset as u64)
}

/// Fill in the TCP/UDP checksum of a frame sent with `csum_blank`.
fn complete_checksum(data: &mut [u8]) {
    let mut header = Vec::new();
    let (info, value) = {
        let mut cursor = PayloadCursor::new(&*data);
        let Ok(info) = classify(&mut header, &mut cursor) else {
            return;
        };
        let value = if info.tcp.is_some() {
            tcp_checksum(&header, &info, &mut cursor)
        } else if info.udp.is_some() {
            udp_checksum(&header, &info, &mut cursor)
        } else {
            return;
        };
        (info, value.expect("frame readable"))
    };
    let Some(l4) = info.l4_header() else {
        return;
    };
    let field = if info.tcp.is_some() {
        TCP_CHECKSUM_OFFSET
    } else {
        UDP_CHECKSUM_OFFSET
    };
    put_be16(data, l4.offset + field, value);
}

// ============================================================================
// Receive
// ============================================================================

/// Backend end of a receive ring: fills posted buffers with frames.
pub struct RxBackend {
    ring: BackRing,
    mem: Arc<GuestMemoryMmap>,
    grants: Arc<SimGrantTable>,
}

impl RxBackend {
    pub fn new(ring: BackRing, mem: Arc<GuestMemoryMmap>, grants: Arc<SimGrantTable>) -> Self {
        Self { ring, mem, grants }
    }

    /// Buffers posted by the front-end and not yet used
    pub fn posted(&self) -> u32 {
        self.ring.unconsumed_requests().expect("ring readable")
    }

    /// Deliver `frame`; false if not enough buffers are posted.
    pub fn send_frame(&mut self, frame: &[u8], flags: u16) -> bool {
        self.send(frame, flags, Vec::new())
    }

    /// Deliver an oversized TCP frame with a GSO extra slot.
    pub fn send_gso(&mut self, frame: &[u8], mss: u16, gso_type: u8, flags: u16) -> bool {
        self.send(frame, flags, vec![ExtraInfo::gso(mss, gso_type)])
    }

    /// Deliver `frame` with arbitrary extra slots
    pub fn send_with_extras(&mut self, frame: &[u8], flags: u16, extras: Vec<ExtraInfo>) -> bool {
        self.send(frame, flags, extras)
    }

    /// Consume one buffer and report an error for it.
    pub fn send_error(&mut self) -> bool {
        if self.posted() == 0 {
            return false;
        }
        let request: RxRequest = self.ring.read_request().expect("request");
        self.ring
            .write_response(RxResponse {
                id: request.id,
                offset: 0,
                flags: 0,
                status: NETIF_RSP_ERROR,
            })
            .expect("response");
        true
    }

    /// Write a response without consuming a request.
    pub fn respond_raw(&mut self, response: RxResponse) {
        self.ring.write_response(response).expect("response");
    }

    /// Publish responses; true if the front-end asked for an event.
    pub fn push(&mut self) -> bool {
        self.ring.push_responses().expect("push")
    }

    fn send(&mut self, frame: &[u8], flags: u16, mut extras: Vec<ExtraInfo>) -> bool {
        let chunks: Vec<&[u8]> = frame.chunks(PAGE_SIZE).collect();
        if (self.posted() as usize) < chunks.len() + extras.len() {
            return false;
        }
        let count = extras.len();
        for (i, extra) in extras.iter_mut().enumerate() {
            if i + 1 < count {
                extra.flags |= XEN_NETIF_EXTRA_FLAG_MORE;
            }
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let request: RxRequest = self.ring.read_request().expect("request");
            let grant = self.grants.lookup(request.gref).expect("buffer granted");
            assert!(!grant.read_only, "receive buffer granted read-only");
            self.mem
                .write_slice(chunk, frame_address(&self.grants, request.gref, 0))
                .expect("write buffer");

            let mut response_flags = if i == 0 { flags } else { 0 };
            if i + 1 < chunks.len() {
                response_flags |= NETRXF_MORE_DATA;
            }
            if i == 0 && !extras.is_empty() {
                response_flags |= NETRXF_EXTRA_INFO;
            }
            self.ring
                .write_response(RxResponse {
                    id: request.id,
                    offset: 0,
                    flags: response_flags,
                    status: chunk.len() as i16,
                })
                .expect("response");

            if i == 0 {
                for extra in &extras {
                    // Each extra slot uses up one posted request
                    let _: RxRequest = self.ring.read_request().expect("request");
                    self.ring.write_response(*extra).expect("extra");
                }
            }
        }
        true
    }
}

// ============================================================================
// Transmit
// ============================================================================

/// A frame as the backend received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub data: Vec<u8>,
    /// `(mss, type)` from a GSO extra slot
    pub gso: Option<(u16, u8)>,
    /// Flags of the first request
    pub flags: u16,
    pub hash: Option<PacketHash>,
    /// Data requests the frame arrived in
    pub fragments: usize,
}

impl TxFrame {
    /// The frames a backend would put on the wire.
    pub fn segments(&self) -> Vec<Vec<u8>> {
        match self.gso {
            Some((mss, _)) => segment_tcp(&self.data, mss as usize).expect("segmentable frame"),
            None => vec![self.data.clone()],
        }
    }
}

/// Backend end of a transmit ring.
pub struct TxBackend {
    ring: BackRing,
    mem: Arc<GuestMemoryMmap>,
    grants: Arc<SimGrantTable>,
    /// Multicast control requests seen, as `(extra type, address)`
    pub multicast: Vec<(u8, [u8; 6])>,
}

impl TxBackend {
    pub fn new(ring: BackRing, mem: Arc<GuestMemoryMmap>, grants: Arc<SimGrantTable>) -> Self {
        Self {
            ring,
            mem,
            grants,
            multicast: Vec::new(),
        }
    }

    pub fn pending(&self) -> u32 {
        self.ring.unconsumed_requests().expect("ring readable")
    }

    /// Consume every published request, answer each data request with
    /// `status`, and publish the responses.
    pub fn service(&mut self, status: i16) -> Vec<TxFrame> {
        let mut frames = Vec::new();
        while self.pending() > 0 {
            if let Some(frame) = self.receive_one(status) {
                frames.push(frame);
            }
        }
        self.push();
        frames
    }

    /// Write a response without consuming a request.
    pub fn respond_raw(&mut self, response: TxResponse) {
        self.ring.write_response(response).expect("response");
    }

    pub fn push(&mut self) -> bool {
        self.ring.push_responses().expect("push")
    }

    fn respond(&mut self, id: u16, status: i16) {
        self.ring
            .write_response(TxResponse { id, status })
            .expect("response");
    }

    fn receive_one(&mut self, status: i16) -> Option<TxFrame> {
        let first: TxRequest = self.ring.read_request().expect("request");
        self.respond(first.id, status);

        let mut gso = None;
        let mut hash = None;
        let mut multicast = None;
        if first.flags & NETTXF_EXTRA_INFO != 0 {
            loop {
                let extra: ExtraInfo = self.ring.read_request().expect("extra");
                self.respond(0, NETIF_RSP_NULL);
                match extra.kind {
                    XEN_NETIF_EXTRA_TYPE_GSO => gso = Some((extra.gso_size(), extra.gso_type())),
                    XEN_NETIF_EXTRA_TYPE_HASH => hash = Some(PacketHash::from(&extra)),
                    XEN_NETIF_EXTRA_TYPE_MCAST_ADD | XEN_NETIF_EXTRA_TYPE_MCAST_DEL => {
                        multicast = Some((extra.kind, extra.multicast_addr()));
                    }
                    _ => {}
                }
                if !extra.more() {
                    break;
                }
            }
        }

        let mut requests = vec![first];
        let mut flags = first.flags;
        while flags & NETTXF_MORE_DATA != 0 {
            let next: TxRequest = self.ring.read_request().expect("request");
            self.respond(next.id, status);
            flags = next.flags;
            requests.push(next);
        }

        if first.size == 0 && first.gref == 0 {
            if let Some(entry) = multicast {
                self.multicast.push(entry);
            }
            return None;
        }

        let rest: usize = requests[1..].iter().map(|r| r.size as usize).sum();
        let first_len = first.size as usize - rest;
        let mut data = Vec::with_capacity(first.size as usize);
        for (i, request) in requests.iter().enumerate() {
            let len = if i == 0 { first_len } else { request.size as usize };
            let grant = self.grants.lookup(request.gref).expect("fragment granted");
            assert!(grant.read_only, "transmit fragment granted writable");
            let mut chunk = vec![0u8; len];
            self.mem
                .read_slice(&mut chunk, frame_address(&self.grants, request.gref, request.offset))
                .expect("read fragment");
            data.extend_from_slice(&chunk);
        }
        if first.flags & NETTXF_CSUM_BLANK != 0 {
            complete_checksum(&mut data);
        }

        Some(TxFrame {
            data,
            gso,
            flags: first.flags,
            hash,
            fragments: requests.len(),
        })
    }
}
