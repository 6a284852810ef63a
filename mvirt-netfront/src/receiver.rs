//! Receive ring engine
//!
//! Keeps the receive ring stocked with empty guest frames granted to the
//! backend, reassembles responses into packets and applies the consumer's
//! offload options: checksum validation, VLAN tag removal and splitting of
//! large TCP packets the consumer cannot take whole.
//!
//! Request ids are the ring slot index, so `pending[id]` is occupied exactly
//! while slot `id` has a request outstanding.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace, warn};
use vm_memory::GuestMemoryError;

use crate::cache::Cache;
use crate::checksum::{
    TCP_CHECKSUM_OFFSET, UDP_CHECKSUM_OFFSET, embedded_ipv4_checksum, embedded_l4_checksum,
    ipv4_header_checksum, tcp_checksum, udp_checksum, verify,
};
use crate::error::{GrantError, HeaderError, Result, RingError};
use crate::grant::GrantEntry;
use crate::headers::{
    ETHERNET_HEADER_SIZE, HeaderInfo, IpVersion, VLAN_TAG_SIZE, classify, put_be16,
};
use crate::host::{DomainId, EventChannel, GrantTable, Upstream};
use crate::lock;
use crate::memory::{PacketBuffer, Page};
use crate::offload::{
    ChecksumFlags, ReceiveOffload, Segment, excise_vlan_tag, segment_header, segments,
};
use crate::payload::{Payload, PayloadCursor};
use crate::protocol::{
    ExtraInfo, GrantRef, NETRXF_CSUM_BLANK, NETRXF_DATA_VALIDATED, NETRXF_EXTRA_INFO,
    NETRXF_MORE_DATA, PAGE_SIZE, PacketHash, RX_RING_SIZE, RX_SLOT_SIZE, RxRequest, RxResponse,
    XEN_NETIF_EXTRA_TYPE_GSO, XEN_NETIF_EXTRA_TYPE_HASH, XEN_NETIF_GSO_TYPE_NONE,
};
use crate::ring::{FrontRing, RingState};
use crate::stats::{Destination, RxStatistics};

/// A received packet handed to `Upstream::deliver`.
///
/// Owns its buffers until given back through `Netfront::return_packet`.
#[derive(Debug)]
pub struct RxPacket {
    pub buffers: Vec<PacketBuffer>,
    /// `None` if the headers did not parse
    pub info: Option<HeaderInfo>,
    pub checksum: ChecksumFlags,
    /// Segment size of an oversized TCP packet, 0 otherwise
    pub mss: u16,
    /// 802.1Q TCI removed from the frame
    pub tag: Option<u16>,
    pub hash: Option<PacketHash>,
}

impl RxPacket {
    pub fn len(&self) -> usize {
        Payload::len(self.buffers.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the frame out of its buffers.
    pub fn to_vec(&self) -> std::result::Result<Vec<u8>, GuestMemoryError> {
        PayloadCursor::new(self.buffers.as_slice()).read_remaining()
    }
}

struct RxFragment {
    page: Page,
    grant: GrantEntry,
}

#[derive(Debug, Clone, Copy)]
struct Gso {
    size: u16,
    kind: u8,
}

/// Packet being put together from consecutive responses
struct Assembly {
    buffers: Vec<PacketBuffer>,
    /// Flags of the first data response
    flags: u16,
    more_data: bool,
    extras_pending: bool,
    error: bool,
    gso: Option<Gso>,
    hash: Option<PacketHash>,
}

impl Assembly {
    fn new(flags: u16) -> Self {
        Self {
            buffers: Vec::new(),
            flags,
            more_data: false,
            extras_pending: false,
            error: false,
            gso: None,
            hash: None,
        }
    }

    fn complete(&self) -> bool {
        !self.more_data && !self.extras_pending
    }
}

struct RxState {
    ring_state: RingState,
    ring: Option<FrontRing>,
    ring_grant: Option<GrantEntry>,
    backend_domain: DomainId,
    pending: Vec<Option<RxFragment>>,
    assembly: Option<Assembly>,
    offload: ReceiveOffload,
    stats: RxStatistics,
    /// Frames whose grant could not be revoked; never reused
    quarantine: Vec<Page>,
}

/// Receive side of one queue.
pub struct Receiver {
    name: String,
    queue: usize,
    state: Mutex<RxState>,
    buffers: Arc<Cache<Page>>,
    grants: Arc<dyn GrantTable>,
    events: Arc<dyn EventChannel>,
    upstream: Arc<dyn Upstream>,
}

impl Receiver {
    pub fn new(
        queue: usize,
        buffers: Arc<Cache<Page>>,
        grants: Arc<dyn GrantTable>,
        events: Arc<dyn EventChannel>,
        upstream: Arc<dyn Upstream>,
        offload: ReceiveOffload,
    ) -> Self {
        Self {
            name: format!("queue-{queue}/rx"),
            queue,
            state: Mutex::new(RxState {
                ring_state: RingState::Disconnected,
                ring: None,
                ring_grant: None,
                backend_domain: 0,
                pending: (0..RX_RING_SIZE).map(|_| None).collect(),
                assembly: None,
                offload,
                stats: RxStatistics::default(),
                quarantine: Vec::new(),
            }),
            buffers,
            grants,
            events,
            upstream,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RingState {
        lock(&self.state).ring_state
    }

    pub fn statistics(&self) -> RxStatistics {
        lock(&self.state).stats
    }

    pub fn offload_options(&self) -> ReceiveOffload {
        lock(&self.state).offload
    }

    /// Change what the consumer accepts; applies to packets completed from now on.
    pub fn set_offload_options(&self, offload: ReceiveOffload) {
        debug!(ring = %self.name, ?offload, "Receive offload options set");
        lock(&self.state).offload = offload;
    }

    /// Requests posted and not yet answered
    pub fn outstanding(&self) -> u32 {
        lock(&self.state).ring.as_ref().map_or(0, FrontRing::outstanding)
    }

    /// Number of occupied `pending` slots
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .pending
            .iter()
            .filter(|p| p.is_some())
            .count()
    }

    /// True if exactly the slots with an outstanding request are pending.
    pub fn pending_consistent(&self) -> bool {
        let st = lock(&self.state);
        let Some(ring) = st.ring.as_ref() else {
            return st.pending.iter().all(Option::is_none);
        };
        let mask = ring.size() - 1;
        st.pending.iter().enumerate().all(|(id, fragment)| {
            let distance = (id as u32).wrapping_sub(ring.rsp_cons()) & mask;
            let in_flight = distance < ring.outstanding();
            fragment.is_some() == in_flight
        })
    }

    /// Set up the shared ring on `page` and grant it to the backend.
    ///
    /// Returns the grant reference to publish as `rx-ring-ref`.
    pub fn connect(&self, page: Page, backend_domain: DomainId) -> Result<GrantRef> {
        let mut st = lock(&self.state);
        if st.ring_state != RingState::Disconnected {
            return Err(self.invalid_state(st.ring_state));
        }

        let ring = FrontRing::new(page, RX_SLOT_SIZE)?;
        let grant = GrantEntry::permit(&self.grants, backend_domain, ring.page().pfn(), false)?;
        let gref = grant.gref();

        st.ring = Some(ring);
        st.ring_grant = Some(grant);
        st.backend_domain = backend_domain;
        st.ring_state = RingState::Connected;
        debug!(ring = %self.name, gref, "Receive ring connected");
        Ok(gref)
    }

    /// Start posting buffers.
    pub fn enable(&self) -> Result<()> {
        let mut st = lock(&self.state);
        match st.ring_state {
            RingState::Connected | RingState::Disabled => {}
            state => return Err(self.invalid_state(state)),
        }
        st.ring_state = RingState::Enabled;
        debug!(ring = %self.name, "Receive ring enabled");

        if let Err(e) = self.fill(&mut st) {
            return Err(self.fail(&mut st, e));
        }
        Ok(())
    }

    /// Stop posting buffers. Responses to requests already posted are still
    /// consumed by `poll`.
    pub fn disable(&self) -> Result<()> {
        let mut st = lock(&self.state);
        match st.ring_state {
            RingState::Enabled | RingState::Stopped => {
                st.ring_state = RingState::Disabled;
                debug!(ring = %self.name, outstanding = st.ring.as_ref().map_or(0, FrontRing::outstanding), "Receive ring disabled");
                Ok(())
            }
            RingState::Disabled | RingState::Failed => Ok(()),
            state => Err(self.invalid_state(state)),
        }
    }

    /// Reclaim every posted buffer and the ring page.
    ///
    /// Only valid once the backend has stopped using the ring.
    pub fn disconnect(&self) -> Result<()> {
        let mut st = lock(&self.state);
        match st.ring_state {
            RingState::Disconnected => return Ok(()),
            RingState::Connected | RingState::Disabled | RingState::Failed => {}
            state => return Err(self.invalid_state(state)),
        }

        let mut result = Ok(());
        let mut reclaimed = 0;
        for id in 0..st.pending.len() {
            let Some(fragment) = st.pending[id].take() else {
                continue;
            };
            match fragment.grant.revoke(&self.grants) {
                Ok(()) => self.buffers.put(fragment.page, false),
                Err(e) => {
                    error!(ring = %self.name, id, error = %e, "Receive buffer grant not revoked");
                    st.quarantine.push(fragment.page);
                    result = Err(e.into());
                }
            }
            reclaimed += 1;
        }

        if let Some(assembly) = st.assembly.take() {
            self.recycle(assembly.buffers);
        }
        if let Some(grant) = st.ring_grant.take() {
            if let Err(e) = grant.revoke(&self.grants) {
                error!(ring = %self.name, error = %e, "Receive ring grant not revoked");
                result = Err(e.into());
            }
        }
        st.ring = None;
        st.ring_state = RingState::Disconnected;
        debug!(ring = %self.name, reclaimed, "Receive ring disconnected");
        result
    }

    /// Consume responses, deliver completed packets and refill the ring.
    pub fn poll(&self) -> Result<()> {
        let mut packets = Vec::new();
        let result = {
            let mut st = lock(&self.state);
            if !st.ring_state.is_polling() {
                return Ok(());
            }

            let mut result = self.poll_responses(&mut st, &mut packets);
            if result.is_ok() {
                // Buffers recycled from extras or dropped packets
                if st.ring_state == RingState::Stopped && self.buffers.stats().free > 0 {
                    st.ring_state = RingState::Enabled;
                    debug!(ring = %self.name, "Receive ring restarted");
                }
                result = self.fill(&mut st);
            }
            result.map_err(|e| self.fail(&mut st, e))
        };

        if !packets.is_empty() {
            trace!(ring = %self.name, count = packets.len(), "Delivering packets");
            self.upstream.deliver(self.queue, packets);
        }
        result
    }

    /// Give a delivered packet's buffers back.
    ///
    /// A ring stopped for lack of buffers is restarted and the local event
    /// channel triggered so the next poll refills it.
    pub fn return_packet(&self, packet: RxPacket) {
        self.recycle(packet.buffers);

        let restarted = {
            let mut st = lock(&self.state);
            if st.ring_state == RingState::Stopped {
                st.ring_state = RingState::Enabled;
                true
            } else {
                false
            }
        };
        if restarted {
            debug!(ring = %self.name, "Receive ring restarted");
            self.events.trigger();
        }
    }

    fn recycle(&self, buffers: Vec<PacketBuffer>) {
        for buffer in buffers {
            self.buffers.put(buffer.page, false);
        }
    }

    fn invalid_state(&self, state: RingState) -> RingError {
        RingError::InvalidState {
            ring: self.name.clone(),
            state: state.name(),
        }
    }

    fn violation(&self, reason: String) -> RingError {
        RingError::ProtocolViolation {
            ring: self.name.clone(),
            reason,
        }
    }

    fn fail(&self, st: &mut RxState, err: RingError) -> RingError {
        error!(ring = %self.name, error = %err, "Receive ring failed");
        st.ring_state = RingState::Failed;
        err
    }

    fn fill(&self, st: &mut RxState) -> Result<()> {
        if st.ring_state != RingState::Enabled {
            return Ok(());
        }
        let RxState {
            ring_state,
            ring,
            backend_domain,
            pending,
            stats,
            quarantine,
            ..
        } = st;
        let Some(ring) = ring.as_mut() else {
            return Err(self.invalid_state(*ring_state));
        };

        let mut posted = 0u64;
        while ring.free_requests() > 0 {
            let id = ring.next_request_slot() as usize;
            if pending[id].is_some() {
                return Err(self.violation(format!("slot {id} posted twice")));
            }

            let Some(page) = self.buffers.get(false) else {
                *ring_state = RingState::Stopped;
                stats.stops += 1;
                warn!(ring = %self.name, free = ring.free_requests(), "Receive buffers exhausted, ring stopped");
                break;
            };
            let grant = match GrantEntry::permit(&self.grants, *backend_domain, page.pfn(), false) {
                Ok(grant) => grant,
                Err(GrantError::Exhausted) => {
                    self.buffers.put(page, false);
                    *ring_state = RingState::Stopped;
                    stats.stops += 1;
                    warn!(ring = %self.name, "Grant references exhausted, ring stopped");
                    break;
                }
                Err(e) => {
                    self.buffers.put(page, false);
                    return Err(e.into());
                }
            };

            let request = RxRequest {
                id: id as u16,
                pad: 0,
                gref: grant.gref(),
            };
            if let Err(e) = ring.write_request(request) {
                match grant.revoke(&self.grants) {
                    Ok(()) => self.buffers.put(page, false),
                    Err(revoke) => {
                        error!(ring = %self.name, error = %revoke, "Unposted receive grant not revoked");
                        quarantine.push(page);
                    }
                }
                return Err(e.into());
            }
            pending[id] = Some(RxFragment { page, grant });
            posted += 1;
        }

        if posted > 0 {
            stats.requests_posted += posted;
            let notify = ring.push_requests()?;
            if notify {
                self.events.send();
            }
            trace!(ring = %self.name, posted, notify, "Receive requests posted");
        }
        Ok(())
    }

    fn poll_responses(&self, st: &mut RxState, packets: &mut Vec<RxPacket>) -> Result<()> {
        loop {
            let ring = st
                .ring
                .as_ref()
                .ok_or_else(|| self.invalid_state(st.ring_state))?;
            let rsp_prod = ring.rsp_prod()?;
            let available = rsp_prod.wrapping_sub(ring.rsp_cons());
            let outstanding = ring.outstanding();
            if available > outstanding {
                return Err(self.violation(format!(
                    "{available} responses for {outstanding} outstanding requests"
                )));
            }

            for _ in 0..available {
                self.consume_response(st, packets)?;
            }

            let more = match st.ring.as_mut() {
                Some(ring) => ring.final_check_for_responses()?,
                None => false,
            };
            if !more {
                return Ok(());
            }
        }
    }

    fn consume_response(&self, st: &mut RxState, packets: &mut Vec<RxPacket>) -> Result<()> {
        let extra_slot = st.assembly.as_ref().is_some_and(|a| a.extras_pending);
        let ring = st
            .ring
            .as_mut()
            .ok_or_else(|| self.invalid_state(st.ring_state))?;
        let id = (ring.rsp_cons() & (ring.size() - 1)) as usize;

        if extra_slot {
            let extra: ExtraInfo = ring.read_response()?;
            let page = self.take_pending(st, id)?;
            self.buffers.put(page, false);

            let unknown = match st.assembly.as_mut() {
                Some(assembly) => {
                    assembly.extras_pending = extra.more();
                    match extra.kind {
                        XEN_NETIF_EXTRA_TYPE_GSO => {
                            assembly.gso = Some(Gso {
                                size: extra.gso_size(),
                                kind: extra.gso_type(),
                            });
                            false
                        }
                        XEN_NETIF_EXTRA_TYPE_HASH => {
                            assembly.hash = Some(PacketHash::from(&extra));
                            false
                        }
                        _ => true,
                    }
                }
                None => true,
            };
            if unknown {
                st.stats.unknown_extras += 1;
                debug!(ring = %self.name, kind = extra.kind, "Unknown extra info ignored");
            }
        } else {
            let response: RxResponse = ring.read_response()?;
            if response.id as usize != id {
                return Err(self.violation(format!(
                    "response id {} in slot {id}",
                    response.id
                )));
            }
            let page = self.take_pending(st, id)?;

            let assembly = st
                .assembly
                .get_or_insert_with(|| Assembly::new(response.flags));
            let offset = response.offset as usize;
            if response.status < 0 {
                assembly.error = true;
                self.buffers.put(page, false);
            } else {
                let length = response.status as usize;
                if offset + length > PAGE_SIZE {
                    // Malformed wire data: drop the packet, keep the ring
                    assembly.error = true;
                    self.buffers.put(page, false);
                } else if length == 0 {
                    self.buffers.put(page, false);
                } else {
                    assembly
                        .buffers
                        .push(PacketBuffer::new(page, offset, length));
                }
            }
            assembly.more_data = response.flags & NETRXF_MORE_DATA != 0;
            if response.flags & NETRXF_EXTRA_INFO != 0 {
                assembly.extras_pending = true;
            }
        }

        if st.assembly.as_ref().is_some_and(Assembly::complete) {
            if let Some(assembly) = st.assembly.take() {
                self.complete_packet(st, assembly, packets);
            }
        }
        Ok(())
    }

    fn take_pending(&self, st: &mut RxState, id: usize) -> Result<Page> {
        let fragment = st.pending[id]
            .take()
            .ok_or_else(|| self.violation(format!("no request pending for id {id}")))?;
        if let Err(e) = fragment.grant.revoke(&self.grants) {
            st.quarantine.push(fragment.page);
            return Err(e.into());
        }
        Ok(fragment.page)
    }

    fn complete_packet(&self, st: &mut RxState, assembly: Assembly, out: &mut Vec<RxPacket>) {
        if assembly.error || assembly.buffers.is_empty() {
            st.stats.backend_errors += 1;
            debug!(ring = %self.name, fragments = assembly.buffers.len(), "Backend reported a bad packet, dropped");
            self.recycle(assembly.buffers);
            return;
        }

        let packet = RxPacket {
            buffers: assembly.buffers,
            info: None,
            checksum: ChecksumFlags::empty(),
            mss: 0,
            tag: None,
            hash: assembly.hash,
        };
        let gso = assembly
            .gso
            .filter(|gso| gso.kind != XEN_NETIF_GSO_TYPE_NONE && gso.size > 0);
        self.process(st, packet, assembly.flags, gso, out);
    }

    fn process(
        &self,
        st: &mut RxState,
        mut packet: RxPacket,
        flags: u16,
        gso: Option<Gso>,
        out: &mut Vec<RxPacket>,
    ) {
        let mut header = Vec::new();
        let classified = {
            let mut cursor = PayloadCursor::new(packet.buffers.as_slice());
            classify(&mut header, &mut cursor)
        };
        let mut info = match classified {
            Ok(info) => info,
            Err(e) => {
                st.stats.malformed_headers += 1;
                debug!(ring = %self.name, error = %e, "Malformed headers, forwarding without offload");
                account(&mut st.stats, &header, None, packet.len());
                out.push(packet);
                return;
            }
        };

        if info.vlan && st.offload.contains(ReceiveOffload::TAG_MANIPULATION) {
            match strip_tag(&mut packet.buffers) {
                Ok(true) => {
                    packet.tag = excise_vlan_tag(&mut header, &mut info);
                    st.stats.vlan_tags_stripped += 1;
                }
                Ok(false) => {}
                Err(e) => debug!(ring = %self.name, error = %e, "VLAN tag left in place"),
            }
        }

        if let Some(gso) = gso {
            st.stats.gso_packets += 1;
            let payload_length = packet.len().saturating_sub(info.length);
            if let (Some(version), true) = (
                info.ip_version,
                info.tcp.is_some() && payload_length > gso.size as usize,
            ) {
                let accepts = st.offload.accepts_large(version);
                if !accepts || st.offload.contains(ReceiveOffload::NEED_LARGE_PACKET_SPLIT) {
                    self.split(st, packet, header, info, gso.size as usize, !accepts, out);
                    return;
                }
                packet.mss = gso.size;
            }
        }

        packet.checksum = self.validate(st, &mut packet, &mut header, &info, flags);
        account(&mut st.stats, &header, Some(&info), packet.len());
        packet.info = Some(info);
        out.push(packet);
    }

    /// Advisory checksum flags; fills in blank checksums when asked to.
    fn validate(
        &self,
        st: &mut RxState,
        packet: &mut RxPacket,
        header: &mut [u8],
        info: &HeaderInfo,
        flags: u16,
    ) -> ChecksumFlags {
        let offload = st.offload;
        let mut result = ChecksumFlags::empty();

        if info.is_ipv4() && offload.contains(ReceiveOffload::IPV4_HEADER_CHECKSUM) {
            match embedded_ipv4_checksum(header, info) {
                Some(0) => result |= ChecksumFlags::IP_CHECKSUM_SUCCEEDED,
                Some(embedded) => {
                    if verify(ipv4_header_checksum(header, info), embedded) {
                        result |= ChecksumFlags::IP_CHECKSUM_SUCCEEDED;
                    } else {
                        result |= ChecksumFlags::IP_CHECKSUM_FAILED;
                        st.stats.ip_checksum_failed += 1;
                    }
                }
                None => {}
            }
        }
        if info.fragment {
            return result;
        }

        let tcp = info.tcp.is_some();
        let wanted = match (info.ip_version, tcp, info.udp.is_some()) {
            (Some(IpVersion::V4), true, _) => ReceiveOffload::IPV4_TCP_CHECKSUM,
            (Some(IpVersion::V4), false, true) => ReceiveOffload::IPV4_UDP_CHECKSUM,
            (Some(IpVersion::V6), true, _) => ReceiveOffload::IPV6_TCP_CHECKSUM,
            (Some(IpVersion::V6), false, true) => ReceiveOffload::IPV6_UDP_CHECKSUM,
            _ => return result,
        };
        if !offload.contains(wanted) {
            return result;
        }
        let (succeeded, failed, not_validated) = if tcp {
            (
                ChecksumFlags::TCP_CHECKSUM_SUCCEEDED,
                ChecksumFlags::TCP_CHECKSUM_FAILED,
                ChecksumFlags::TCP_CHECKSUM_NOT_VALIDATED,
            )
        } else {
            (
                ChecksumFlags::UDP_CHECKSUM_SUCCEEDED,
                ChecksumFlags::UDP_CHECKSUM_FAILED,
                ChecksumFlags::UDP_CHECKSUM_NOT_VALIDATED,
            )
        };

        if flags & NETRXF_CSUM_BLANK != 0 {
            if offload.contains(ReceiveOffload::NEED_CHECKSUM_VALUE) {
                if let Err(e) = fill_l4_checksum(packet, header, info) {
                    debug!(ring = %self.name, error = %e, "Blank checksum not filled");
                    return result | not_validated;
                }
                st.stats.checksums_calculated += 1;
            }
            return result | succeeded;
        }
        if flags & NETRXF_DATA_VALIDATED != 0 {
            return result | succeeded;
        }

        let embedded = embedded_l4_checksum(header, info).unwrap_or(0);
        if !tcp && embedded == 0 {
            // UDP sender did not compute one
            return result | succeeded;
        }
        match compute_l4_checksum(packet, header, info) {
            Ok(calculated) if verify(calculated, embedded) => result | succeeded,
            Ok(_) => {
                if tcp {
                    st.stats.tcp_checksum_failed += 1;
                } else {
                    st.stats.udp_checksum_failed += 1;
                }
                result | failed
            }
            Err(e) => {
                debug!(ring = %self.name, error = %e, "Checksum not validated");
                result | not_validated
            }
        }
    }

    /// Cut a large TCP packet into `mss` sized packets.
    ///
    /// With `split_all` every segment becomes its own packet, otherwise only
    /// the first one is split off. What is left is rewritten into the
    /// original buffers. Running out of buffers part way delivers the rest
    /// unsplit.
    #[allow(clippy::too_many_arguments)]
    fn split(
        &self,
        st: &mut RxState,
        mut packet: RxPacket,
        header: Vec<u8>,
        info: HeaderInfo,
        mss: usize,
        split_all: bool,
        out: &mut Vec<RxPacket>,
    ) {
        let payload = match PayloadCursor::with_range(
            packet.buffers.as_slice(),
            info.length,
            usize::MAX,
        )
        .read_remaining()
        {
            Ok(payload) => payload,
            Err(e) => {
                debug!(ring = %self.name, error = %e, "Large packet not split");
                account(&mut st.stats, &header, Some(&info), packet.len());
                packet.mss = mss as u16;
                packet.info = Some(info);
                out.push(packet);
                return;
            }
        };

        let mut checksum = ChecksumFlags::TCP_CHECKSUM_SUCCEEDED;
        if info.is_ipv4() {
            checksum |= ChecksumFlags::IP_CHECKSUM_SUCCEEDED;
        }

        let all = segments(payload.len(), mss);
        let wanted = if split_all { all.len() - 1 } else { 1 };
        let mut next = 0;
        for segment in &all[..wanted] {
            let data = &payload[segment.offset..segment.offset + segment.length];
            let seg_header = match segment_header(&header, &info, segment, data) {
                Ok(h) => h,
                Err(e) => {
                    debug!(ring = %self.name, error = %e, "Segment header not built");
                    break;
                }
            };
            let Some(buffers) = self.build_buffers(&seg_header, data) else {
                st.stats.split_fallbacks += 1;
                warn!(ring = %self.name, split = next, total = all.len(), "Buffers exhausted, delivering remainder unsplit");
                break;
            };
            account(&mut st.stats, &seg_header, Some(&info), seg_header.len() + data.len());
            st.stats.segments_split += 1;
            out.push(RxPacket {
                buffers,
                info: Some(info.clone()),
                checksum,
                mss: 0,
                tag: packet.tag,
                hash: packet.hash,
            });
            next += 1;
        }

        let offset = all[next].offset;
        let tail = Segment {
            index: next,
            offset,
            length: payload.len() - offset,
            last: true,
        };
        let data = &payload[offset..];
        let rewritten = segment_header(&header, &info, &tail, data).and_then(|tail_header| {
            self.rewrite(&mut packet.buffers, &tail_header, data)?;
            Ok(tail_header)
        });
        match rewritten {
            Ok(tail_header) => {
                account(&mut st.stats, &tail_header, Some(&info), packet.len());
                packet.checksum = checksum;
            }
            Err(e) => {
                st.stats.malformed_headers += 1;
                debug!(ring = %self.name, error = %e, "Remainder not rewritten");
            }
        }
        if data.len() > mss {
            packet.mss = mss as u16;
        }
        packet.info = Some(info);
        out.push(packet);
    }

    /// Copy `header` + `data` into freshly allocated buffers.
    fn build_buffers(&self, header: &[u8], data: &[u8]) -> Option<Vec<PacketBuffer>> {
        let frame = [header, data].concat();
        let mut buffers = Vec::new();
        for chunk in frame.chunks(PAGE_SIZE) {
            let page = match self.buffers.get(false) {
                Some(page) => page,
                None => {
                    self.recycle(buffers);
                    return None;
                }
            };
            if page.write(0, chunk).is_err() {
                self.buffers.put(page, false);
                self.recycle(buffers);
                return None;
            }
            buffers.push(PacketBuffer::new(page, 0, chunk.len()));
        }
        Some(buffers)
    }

    /// Replace a packet's contents with a shorter frame, in place.
    fn rewrite(
        &self,
        buffers: &mut Vec<PacketBuffer>,
        header: &[u8],
        data: &[u8],
    ) -> std::result::Result<(), HeaderError> {
        let frame = [header, data].concat();
        let mut written = 0;
        let mut used = 0;
        for buffer in buffers.iter_mut() {
            if written == frame.len() {
                break;
            }
            let n = buffer.length.min(frame.len() - written);
            buffer
                .page
                .write(buffer.offset, &frame[written..written + n])?;
            buffer.length = n;
            written += n;
            used += 1;
        }
        if written < frame.len() {
            return Err(HeaderError::InvalidLength {
                layer: "TCP segment",
                length: frame.len(),
            });
        }
        let unused = buffers.split_off(used);
        self.recycle(unused);
        Ok(())
    }
}

fn account(stats: &mut RxStatistics, header: &[u8], info: Option<&HeaderInfo>, length: usize) {
    stats.traffic.record(Destination::of(header), length);
    let protocols = &mut stats.protocols;
    match info.and_then(|i| i.ip_version) {
        Some(IpVersion::V4) => protocols.ipv4 += 1,
        Some(IpVersion::V6) => protocols.ipv6 += 1,
        None => protocols.other += 1,
    }
    if let Some(info) = info {
        if info.tcp.is_some() {
            protocols.tcp += 1;
        } else if info.udp.is_some() {
            protocols.udp += 1;
        }
    }
}

/// Move the MAC addresses over the 802.1Q tag in the first buffer.
fn strip_tag(buffers: &mut [PacketBuffer]) -> std::result::Result<bool, GuestMemoryError> {
    let Some(first) = buffers
        .first_mut()
        .filter(|b| b.length >= ETHERNET_HEADER_SIZE + VLAN_TAG_SIZE)
    else {
        return Ok(false);
    };
    let mut macs = [0u8; 12];
    first.page.read(first.offset, &mut macs)?;
    first.page.write(first.offset + VLAN_TAG_SIZE, &macs)?;
    first.offset += VLAN_TAG_SIZE;
    first.length -= VLAN_TAG_SIZE;
    Ok(true)
}

fn compute_l4_checksum(
    packet: &RxPacket,
    header: &[u8],
    info: &HeaderInfo,
) -> std::result::Result<u16, GuestMemoryError> {
    let mut cursor =
        PayloadCursor::with_range(packet.buffers.as_slice(), info.length, usize::MAX);
    if info.tcp.is_some() {
        tcp_checksum(header, info, &mut cursor)
    } else {
        udp_checksum(header, info, &mut cursor)
    }
}

fn fill_l4_checksum(
    packet: &mut RxPacket,
    header: &mut [u8],
    info: &HeaderInfo,
) -> std::result::Result<(), GuestMemoryError> {
    let (l4, field) = match (info.tcp, info.udp) {
        (Some(tcp), _) => (tcp, TCP_CHECKSUM_OFFSET),
        (None, Some(udp)) => (udp, UDP_CHECKSUM_OFFSET),
        (None, None) => return Ok(()),
    };
    let value = compute_l4_checksum(packet, header, info)?;
    let at = l4.offset + field;
    put_be16(header, at, value);
    write_at(&packet.buffers, at, &value.to_be_bytes())
}

/// Overwrite frame bytes at `offset` across a buffer chain.
fn write_at(
    buffers: &[PacketBuffer],
    mut offset: usize,
    mut data: &[u8],
) -> std::result::Result<(), GuestMemoryError> {
    for buffer in buffers {
        if data.is_empty() {
            break;
        }
        if offset >= buffer.length {
            offset -= buffer.length;
            continue;
        }
        let n = (buffer.length - offset).min(data.len());
        buffer.page.write(buffer.offset + offset, &data[..n])?;
        data = &data[n..];
        offset = 0;
    }
    if data.is_empty() {
        Ok(())
    } else {
        Err(GuestMemoryError::PartialBuffer {
            expected: data.len(),
            completed: 0,
        })
    }
}
