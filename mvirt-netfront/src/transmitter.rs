//! Transmit ring engine
//!
//! Submitters push onto a lock-free `PacketQueue` and leave. Whoever takes
//! the queue's owner bit runs the ring: swizzles submissions into the owner
//! FIFO, consumes responses, prepares packets (header page, VLAN tag, LSO,
//! checksums, grant or copy of the payload) and posts them. Auxiliary
//! requests (announcements, multicast control) are served ahead of data.
//!
//! Transmit ids are allocated from `[0, MAX_FRAGMENT_ID]`; `pending[id]` holds
//! the fragment while its request is outstanding.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, trace, warn};
use vm_memory::{GuestMemoryError, GuestMemoryMmap};

use crate::cache::{Cache, NoLock, RangeSet};
use crate::checksum::{
    TCP_CHECKSUM_OFFSET, UDP_CHECKSUM_OFFSET, pseudo_header_checksum, tcp_checksum, udp_checksum,
};
use crate::control;
use crate::error::{GrantError, Result, RingError};
use crate::grant::GrantEntry;
use crate::headers::{
    ETHERNET_HEADER_SIZE, HeaderInfo, IPPROTO_TCP, IPPROTO_UDP, IpVersion, classify, put_be16,
};
use crate::host::{BackendState, DomainId, EventChannel, GrantTable, Upstream};
use crate::lock;
use crate::memory::{MemorySegment, Page, pfn_of};
use crate::offload::{OffloadFlags, fixup_ip_length, insert_vlan_tag, refresh_ipv4_checksum};
use crate::payload::{GuestPayload, Payload, PayloadCursor};
use crate::protocol::{
    ETHERNET_MIN, ExtraInfo, GrantRef, MAX_FRAGMENT_ID, MAXIMUM_FRAME_SIZE, NETIF_RSP_DROPPED,
    NETIF_RSP_NULL, NETIF_RSP_OKAY, NETTXF_CSUM_BLANK, NETTXF_DATA_VALIDATED, NETTXF_EXTRA_INFO,
    NETTXF_MORE_DATA, PAGE_SIZE, PacketHash, TX_SLOT_SIZE, TxRequest, TxResponse,
    XEN_NETIF_EXTRA_FLAG_MORE, XEN_NETIF_GSO_TYPE_TCPV4, XEN_NETIF_GSO_TYPE_TCPV6,
    XEN_NETIF_NR_SLOTS_MIN,
};
use crate::queue::PacketQueue;
use crate::ring::{FrontRing, RingState};
use crate::stats::{Destination, TxStatistics};
use crate::watchdog::StallDetector;

/// Offloads requested for one packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOffload {
    pub flags: OffloadFlags,
    /// Segment size for a large send
    pub mss: u16,
    /// 802.1Q TCI inserted when `OffloadFlags::TAG` is set
    pub tag: u16,
}

/// A packet handed to `queue_packet`.
///
/// `segments` stay owned by the caller until the matching `TxCompletion`.
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub cookie: u64,
    pub segments: Vec<MemorySegment>,
    pub offload: TxOffload,
    pub hash: Option<PacketHash>,
}

impl TxPacket {
    pub fn new(cookie: u64, segments: Vec<MemorySegment>) -> Self {
        Self {
            cookie,
            segments,
            offload: TxOffload::default(),
            hash: None,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    Dropped,
    Error,
}

impl TxStatus {
    fn from_response(status: i16) -> Self {
        match status {
            NETIF_RSP_OKAY => TxStatus::Ok,
            NETIF_RSP_DROPPED => TxStatus::Dropped,
            _ => TxStatus::Error,
        }
    }
}

/// Terminal status of one queued packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub cookie: u64,
    pub status: TxStatus,
    /// Frame length as sent (after tagging and padding)
    pub length: usize,
}

/// Auxiliary requests served ahead of data packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Arp(Ipv4Addr),
    NeighbourAdvertisement(Ipv6Addr),
    Multicast { add: bool, mac: [u8; 6] },
}

/// Negotiated transmit behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub backend_domain: DomainId,
    /// Compute every checksum locally
    pub calculate_checksums: bool,
    /// Never grant caller pages
    pub always_copy: bool,
    pub ipv4_csum_offload: bool,
    pub ipv6_csum_offload: bool,
    pub gso_tcpv4: bool,
    pub gso_tcpv6: bool,
    pub multicast_control: bool,
    /// Send hash extra slots
    pub hash: bool,
    pub mac: [u8; 6],
}

enum Submission {
    Packet(TxPacket),
    Control(ControlRequest),
}

#[derive(Debug, Default, Clone, Copy)]
struct MulticastControl {
    add: bool,
    mac: [u8; 6],
}

enum FragmentContext {
    /// Caller page granted directly
    Packet(usize),
    /// Header or copy page owned by the ring
    Buffer { page: Page, packet: usize },
    MulticastControl(MulticastControl),
}

struct Fragment {
    grant: Option<GrantEntry>,
    context: FragmentContext,
    offset: usize,
    length: usize,
}

/// Packet waiting for its fragments' responses
struct InFlight {
    cookie: Option<u64>,
    references: usize,
    status: TxStatus,
    length: usize,
    destination: Destination,
    ip_version: Option<IpVersion>,
    tcp: bool,
    udp: bool,
}

/// Index arena for in-flight packets
#[derive(Default)]
struct Arena {
    slots: Vec<Option<InFlight>>,
    free: Vec<usize>,
}

impl Arena {
    fn insert(&mut self, value: InFlight) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(value);
                idx
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut InFlight> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn remove(&mut self, idx: usize) -> Option<InFlight> {
        let value = self.slots.get_mut(idx)?.take();
        if value.is_some() {
            self.free.push(idx);
        }
        value
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// A packet ready to post
struct Prepared {
    fragments: Vec<Fragment>,
    extras: Vec<ExtraInfo>,
    /// Flags for the first request
    flags: u16,
    length: usize,
}

enum Prepare {
    Ready(Prepared),
    /// Out of buffers or grants; retry later
    Busy(Submission),
    Completed,
}

enum Built {
    Ready(Prepared),
    Busy,
    Failed,
    /// A caller page is still granted; the packet is never completed
    Stranded,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: RingState,
    stats: TxStatistics,
    outstanding: u32,
}

struct TxState {
    ring_state: RingState,
    ring: Option<FrontRing>,
    ring_grant: Option<GrantEntry>,
    options: TxOptions,
    ids: RangeSet,
    pending: Vec<Option<Fragment>>,
    /// Extra-info slots posted and not yet answered
    extras_in_flight: u32,
    packets: Arena,
    fifo: VecDeque<TxPacket>,
    requests: VecDeque<ControlRequest>,
    prepared: Option<Prepared>,
    completions: Vec<TxCompletion>,
    stats: TxStatistics,
    stall: StallDetector,
    quarantine: Vec<Page>,
}

impl TxState {
    fn accept(&mut self, submissions: Vec<Submission>) {
        for submission in submissions {
            match submission {
                Submission::Packet(packet) => self.fifo.push_back(packet),
                Submission::Control(request) => self.requests.push_back(request),
            }
        }
    }

    fn complete_unsent(&mut self, cookie: u64, status: TxStatus, length: usize) {
        match status {
            TxStatus::Ok => self.stats.completed_ok += 1,
            TxStatus::Dropped => self.stats.completed_dropped += 1,
            TxStatus::Error => self.stats.completed_error += 1,
        }
        self.completions.push(TxCompletion {
            cookie,
            status,
            length,
        });
    }

    /// Drop one fragment reference; completes the packet on the last one.
    fn release_reference(&mut self, idx: usize, status: TxStatus) {
        let Some(entry) = self.packets.get_mut(idx) else {
            return;
        };
        if entry.status == TxStatus::Ok {
            entry.status = status;
        }
        entry.references -= 1;
        if entry.references > 0 {
            return;
        }

        let Some(entry) = self.packets.remove(idx) else {
            return;
        };
        let stats = &mut self.stats;
        match entry.status {
            TxStatus::Ok => {
                stats.completed_ok += 1;
                stats.traffic.record(entry.destination, entry.length);
                match entry.ip_version {
                    Some(IpVersion::V4) => stats.protocols.ipv4 += 1,
                    Some(IpVersion::V6) => stats.protocols.ipv6 += 1,
                    None => stats.protocols.other += 1,
                }
                if entry.tcp {
                    stats.protocols.tcp += 1;
                } else if entry.udp {
                    stats.protocols.udp += 1;
                }
            }
            TxStatus::Dropped => stats.completed_dropped += 1,
            TxStatus::Error => stats.completed_error += 1,
        }
        if let Some(cookie) = entry.cookie {
            self.completions.push(TxCompletion {
                cookie,
                status: entry.status,
                length: entry.length,
            });
        }
    }
}

/// Transmit side of one queue.
pub struct Transmitter {
    name: String,
    queue: usize,
    submissions: PacketQueue<Submission>,
    /// Only locked by the holder of the queue's owner bit
    state: Mutex<TxState>,
    published: Mutex<Snapshot>,
    mem: Arc<GuestMemoryMmap>,
    buffers: Arc<Cache<Page>>,
    controls: Cache<MulticastControl>,
    grants: Arc<dyn GrantTable>,
    events: Arc<dyn EventChannel>,
    upstream: Arc<dyn Upstream>,
}

impl Transmitter {
    pub fn new(
        queue: usize,
        mem: Arc<GuestMemoryMmap>,
        buffers: Arc<Cache<Page>>,
        grants: Arc<dyn GrantTable>,
        events: Arc<dyn EventChannel>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let name = format!("queue-{queue}/tx");
        let controls = Cache::new(
            format!("{name}/multicast"),
            XEN_NETIF_NR_SLOTS_MIN,
            || Some(MulticastControl::default()),
            drop,
            Arc::new(NoLock),
        );
        Self {
            queue,
            submissions: PacketQueue::new(),
            state: Mutex::new(TxState {
                ring_state: RingState::Disconnected,
                ring: None,
                ring_grant: None,
                options: TxOptions::default(),
                ids: RangeSet::new(0, MAX_FRAGMENT_ID),
                pending: (0..=MAX_FRAGMENT_ID).map(|_| None).collect(),
                extras_in_flight: 0,
                packets: Arena::default(),
                fifo: VecDeque::new(),
                requests: VecDeque::new(),
                prepared: None,
                completions: Vec::new(),
                stats: TxStatistics::default(),
                stall: StallDetector::new(),
                quarantine: Vec::new(),
            }),
            published: Mutex::new(Snapshot {
                state: RingState::Disconnected,
                stats: TxStatistics::default(),
                outstanding: 0,
            }),
            name,
            mem,
            buffers,
            controls,
            grants,
            events,
            upstream,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of the end of the last owner cycle
    pub fn state(&self) -> RingState {
        lock(&self.published).state
    }

    pub fn statistics(&self) -> TxStatistics {
        lock(&self.published).stats
    }

    /// Requests posted and not yet answered, as of the last owner cycle
    pub fn outstanding(&self) -> u32 {
        lock(&self.published).outstanding
    }

    /// Check the id and slot bookkeeping: every outstanding request is
    /// either a pending fragment or an extra-info slot, and every id is
    /// either free or pending.
    pub fn accounting_consistent(&self) -> bool {
        let st = lock(&self.state);
        let pending = st.pending.iter().filter(|p| p.is_some()).count();
        let outstanding = st.ring.as_ref().map_or(0, FrontRing::outstanding);
        let ids_balance = st.ids.len() + pending == MAX_FRAGMENT_ID as usize + 1;
        ids_balance && outstanding as usize == pending + st.extras_in_flight as usize
    }

    /// Queue a packet. Never blocks; the ring runs now if nobody else owns it.
    pub fn queue_packet(&self, packet: TxPacket) -> Result<()> {
        trace!(ring = %self.name, cookie = packet.cookie, len = packet.len(), "Packet queued");
        self.submissions.push(Submission::Packet(packet));
        self.service()
    }

    /// Queue an auxiliary request.
    pub fn queue_control(&self, request: ControlRequest) -> Result<()> {
        debug!(ring = %self.name, ?request, "Control request queued");
        self.submissions.push(Submission::Control(request));
        self.service()
    }

    /// Run the ring if no other thread owns it.
    pub fn service(&self) -> Result<()> {
        if !self.submissions.try_acquire() {
            trace!(ring = %self.name, "Ring owned elsewhere");
            return Ok(());
        }
        self.run_owned(|st| self.run(st).map_err(|e| self.fail(st, e)))
    }

    /// Set up the shared ring on `page` and grant it to the backend.
    pub fn connect(&self, page: Page, options: TxOptions) -> Result<GrantRef> {
        self.owned(|st| {
            if st.ring_state != RingState::Disconnected {
                return Err(self.invalid_state(st.ring_state));
            }
            let ring = FrontRing::new(page, TX_SLOT_SIZE)?;
            let grant =
                GrantEntry::permit(&self.grants, options.backend_domain, ring.page().pfn(), false)?;
            let gref = grant.gref();

            debug!(ring = %self.name, gref, ?options, "Transmit ring connected");
            st.ring = Some(ring);
            st.ring_grant = Some(grant);
            st.options = options;
            st.stall.reset();
            st.ring_state = RingState::Connected;
            Ok(gref)
        })
    }

    pub fn enable(&self) -> Result<()> {
        self.owned(|st| {
            match st.ring_state {
                RingState::Connected | RingState::Disabled => {}
                state => return Err(self.invalid_state(state)),
            }
            st.ring_state = RingState::Enabled;
            debug!(ring = %self.name, "Transmit ring enabled");
            self.run(st).map_err(|e| self.fail(st, e))
        })
    }

    /// Stop posting. Queued packets wait; responses are still consumed.
    pub fn disable(&self) -> Result<()> {
        self.owned(|st| match st.ring_state {
            RingState::Enabled | RingState::Stopped => {
                st.ring_state = RingState::Disabled;
                debug!(ring = %self.name, queued = st.fifo.len(), "Transmit ring disabled");
                Ok(())
            }
            RingState::Disabled | RingState::Failed => Ok(()),
            state => Err(self.invalid_state(state)),
        })
    }

    /// Complete everything and release the ring.
    ///
    /// Outstanding requests are waited for while the backend is still
    /// connected (`InvalidState` "draining" is returned); once it has gone
    /// they are answered with fabricated `Dropped` responses.
    pub fn disconnect(&self, backend: BackendState) -> Result<()> {
        self.owned(|st| {
            match st.ring_state {
                RingState::Disconnected => return Ok(()),
                RingState::Enabled | RingState::Stopped => st.ring_state = RingState::Disabled,
                _ => {}
            }

            if st.ring_state == RingState::Failed {
                if backend == BackendState::Connected && !self.idle(st) {
                    return Err(self.draining());
                }
                self.reclaim(st)?;
            } else {
                self.poll_responses(st).map_err(|e| self.fail(st, e))?;
                if !self.idle(st) {
                    if backend == BackendState::Connected {
                        return Err(self.draining());
                    }
                    self.fake_responses(st).map_err(|e| self.fail(st, e))?;
                    self.poll_responses(st).map_err(|e| self.fail(st, e))?;
                }
            }

            self.drop_queued(st);
            let mut result = Ok(());
            if let Some(grant) = st.ring_grant.take() {
                if let Err(e) = grant.revoke(&self.grants) {
                    error!(ring = %self.name, error = %e, "Transmit ring grant not revoked");
                    result = Err(e.into());
                }
            }
            st.ring = None;
            st.ring_state = RingState::Disconnected;
            debug!(ring = %self.name, "Transmit ring disconnected");
            result
        })
    }

    /// One watchdog tick. Returns true if the ring looked stalled and was
    /// kicked.
    pub fn watchdog_tick(&self) -> bool {
        if !self.submissions.try_acquire() {
            // An owner is running, so the ring is not stuck
            return false;
        }
        self.run_owned(|st| {
            if !st.ring_state.is_polling() {
                st.stall.reset();
                return false;
            }
            let Some(ring) = st.ring.as_ref() else {
                return false;
            };
            let Ok(rsp_prod) = ring.rsp_prod() else {
                return false;
            };
            let outstanding = ring.outstanding();
            if !st.stall.check(outstanding, rsp_prod) {
                return false;
            }
            warn!(ring = %self.name, outstanding, rsp_prod, "Transmit ring stalled, kicking");
            st.stats.stalls += 1;
            self.events.trigger();
            true
        })
    }

    fn invalid_state(&self, state: RingState) -> RingError {
        RingError::InvalidState {
            ring: self.name.clone(),
            state: state.name(),
        }
    }

    fn draining(&self) -> RingError {
        RingError::InvalidState {
            ring: self.name.clone(),
            state: "draining",
        }
    }

    fn violation(&self, reason: String) -> RingError {
        RingError::ProtocolViolation {
            ring: self.name.clone(),
            reason,
        }
    }

    fn fail(&self, st: &mut TxState, err: RingError) -> RingError {
        error!(ring = %self.name, error = %err, "Transmit ring failed");
        st.ring_state = RingState::Failed;
        err
    }

    fn idle(&self, st: &TxState) -> bool {
        st.ring.as_ref().is_none_or(|ring| ring.outstanding() == 0)
    }

    /// Take the owner bit, waiting for a running owner to finish.
    fn owned<R>(&self, op: impl FnOnce(&mut TxState) -> R) -> R {
        while !self.submissions.try_acquire() {
            thread::yield_now();
        }
        self.run_owned(op)
    }

    /// Body of an ownership period. The caller holds the owner bit.
    ///
    /// `op` runs once; further rounds run the ring until the queue can be
    /// released with nothing new in it.
    fn run_owned<R>(&self, op: impl FnOnce(&mut TxState) -> R) -> R {
        let (output, completions) = {
            let mut guard = lock(&self.state);
            let st = &mut *guard;
            st.accept(self.submissions.swizzle());
            let output = op(st);
            self.publish(st);
            (output, std::mem::take(&mut st.completions))
        };
        self.complete(completions);

        while !self.submissions.try_release() {
            let completions = {
                let mut guard = lock(&self.state);
                let st = &mut *guard;
                st.accept(self.submissions.swizzle());
                if let Err(e) = self.run(st) {
                    self.fail(st, e);
                }
                self.publish(st);
                std::mem::take(&mut st.completions)
            };
            self.complete(completions);
        }
        output
    }

    fn publish(&self, st: &TxState) {
        *lock(&self.published) = Snapshot {
            state: st.ring_state,
            stats: st.stats,
            outstanding: st.ring.as_ref().map_or(0, FrontRing::outstanding),
        };
    }

    fn complete(&self, completions: Vec<TxCompletion>) {
        if !completions.is_empty() {
            trace!(ring = %self.name, count = completions.len(), "Completing packets");
            self.upstream.complete(self.queue, completions);
        }
    }

    fn run(&self, st: &mut TxState) -> Result<()> {
        match st.ring_state {
            RingState::Failed | RingState::Disconnected => {
                self.drop_queued(st);
                return Ok(());
            }
            RingState::Connected => return Ok(()),
            _ => {}
        }
        self.poll_responses(st)?;
        if matches!(st.ring_state, RingState::Enabled | RingState::Stopped) {
            self.post_queued(st)?;
        }
        Ok(())
    }

    /// Complete everything not yet posted as `Dropped`.
    fn drop_queued(&self, st: &mut TxState) {
        if let Some(prepared) = st.prepared.take() {
            for fragment in prepared.fragments {
                // Failures are logged and quarantined inside
                let _ = self.release_fragment(st, fragment, TxStatus::Dropped);
            }
        }
        let dropped = st.fifo.len();
        while let Some(packet) = st.fifo.pop_front() {
            st.complete_unsent(packet.cookie, TxStatus::Dropped, packet.len());
        }
        st.requests.clear();
        if dropped > 0 {
            debug!(ring = %self.name, dropped, "Queued packets dropped");
        }
    }

    fn post_queued(&self, st: &mut TxState) -> Result<()> {
        if st.ring_state == RingState::Stopped {
            trace!(ring = %self.name, "Transmit ring resuming");
            st.ring_state = RingState::Enabled;
        }
        let mut posted = 0u32;
        loop {
            let prepared = match st.prepared.take() {
                Some(prepared) => prepared,
                None => {
                    let outcome = if let Some(request) = st.requests.pop_front() {
                        self.prepare_control(st, request)
                    } else if let Some(packet) = st.fifo.pop_front() {
                        self.prepare(st, packet)
                    } else {
                        break;
                    };
                    match outcome {
                        Prepare::Ready(prepared) => prepared,
                        Prepare::Completed => continue,
                        Prepare::Busy(submission) => {
                            match submission {
                                Submission::Packet(packet) => st.fifo.push_front(packet),
                                Submission::Control(request) => st.requests.push_front(request),
                            }
                            self.stop(st, "buffers");
                            break;
                        }
                    }
                }
            };

            match self.post(st, prepared)? {
                None => posted += 1,
                Some(prepared) => {
                    st.prepared = Some(prepared);
                    self.stop(st, "ring slots");
                    break;
                }
            }
        }

        if posted > 0 {
            let ring = st
                .ring
                .as_mut()
                .ok_or_else(|| self.invalid_state(st.ring_state))?;
            let notify = ring.push_requests()?;
            if notify {
                self.events.send();
            }
            trace!(ring = %self.name, posted, notify, "Transmit requests posted");
        }
        Ok(())
    }

    fn stop(&self, st: &mut TxState, short_of: &str) {
        trace!(ring = %self.name, short_of, "Transmit ring busy");
        st.ring_state = RingState::Stopped;
        st.stats.busy += 1;
    }

    /// Write a prepared packet's requests. Hands it back if it does not fit.
    fn post(&self, st: &mut TxState, prepared: Prepared) -> Result<Option<Prepared>> {
        let TxState {
            ring_state,
            ring,
            ids,
            pending,
            extras_in_flight,
            stats,
            ..
        } = st;
        let Some(ring) = ring.as_mut() else {
            return Err(self.invalid_state(*ring_state));
        };

        let count = prepared.fragments.len();
        let needed = count + prepared.extras.len();
        if (ring.free_requests() as usize) < needed || ids.len() < count {
            return Ok(Some(prepared));
        }

        let Prepared {
            fragments,
            extras,
            flags,
            length,
        } = prepared;
        let mut wire = Vec::with_capacity(count);
        for (i, fragment) in fragments.iter().enumerate() {
            let size = if i == 0 { length } else { fragment.length };
            match (u16::try_from(size), u16::try_from(fragment.offset)) {
                (Ok(size), Ok(offset)) => wire.push((size, offset)),
                _ => {
                    return Err(self.violation(format!(
                        "request of {size} bytes at offset {} does not fit the wire",
                        fragment.offset
                    )));
                }
            }
        }
        for (i, (fragment, (size, offset))) in fragments.into_iter().zip(wire).enumerate() {
            let Some(id) = ids.pop() else {
                return Err(self.violation("transmit ids exhausted".to_string()));
            };
            if pending[id as usize].is_some() {
                return Err(self.violation(format!("id {id} allocated twice")));
            }

            let mut request_flags = 0;
            if i == 0 {
                request_flags |= flags;
                if !extras.is_empty() {
                    request_flags |= NETTXF_EXTRA_INFO;
                }
            }
            if i + 1 < count {
                request_flags |= NETTXF_MORE_DATA;
            }

            ring.write_request(TxRequest {
                gref: fragment.grant.as_ref().map_or(0, GrantEntry::gref),
                offset,
                flags: request_flags,
                id,
                size,
            })?;
            if i == 0 {
                for (j, extra) in extras.iter().enumerate() {
                    let mut extra = *extra;
                    if j + 1 < extras.len() {
                        extra.flags |= XEN_NETIF_EXTRA_FLAG_MORE;
                    }
                    ring.write_request(extra)?;
                    *extras_in_flight += 1;
                }
            }
            pending[id as usize] = Some(fragment);
        }
        stats.requests_posted += needed as u64;
        Ok(None)
    }

    fn poll_responses(&self, st: &mut TxState) -> Result<()> {
        loop {
            let Some(ring) = st.ring.as_mut() else {
                return Ok(());
            };
            let rsp_prod = ring.rsp_prod()?;
            let available = rsp_prod.wrapping_sub(ring.rsp_cons());
            let outstanding = ring.outstanding();
            if available > outstanding {
                return Err(self.violation(format!(
                    "{available} responses for {outstanding} outstanding requests"
                )));
            }

            let mut completed = 0;
            for _ in 0..available {
                let Some(ring) = st.ring.as_mut() else {
                    break;
                };
                let response: TxResponse = ring.read_response()?;
                if response.status == NETIF_RSP_NULL {
                    st.extras_in_flight = st
                        .extras_in_flight
                        .checked_sub(1)
                        .ok_or_else(|| self.violation("unexpected null response".to_string()))?;
                    continue;
                }

                let id = response.id;
                let fragment = st
                    .pending
                    .get_mut(id as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| self.violation(format!("response for unknown id {id}")))?;
                if !st.ids.push(id) {
                    return Err(self.violation(format!("id {id} freed twice")));
                }
                self.release_fragment(st, fragment, TxStatus::from_response(response.status))?;
                completed += 1;
            }
            if completed > 0 {
                trace!(ring = %self.name, completed, "Transmit responses consumed");
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

    /// Return a fragment's resources and drop its packet reference.
    ///
    /// A caller page whose grant cannot be revoked is still mapped by the
    /// backend, so its packet is never completed. Ring-owned pages in that
    /// state are quarantined.
    fn release_fragment(
        &self,
        st: &mut TxState,
        fragment: Fragment,
        status: TxStatus,
    ) -> std::result::Result<(), GrantError> {
        let Fragment { grant, context, .. } = fragment;
        let revoked = grant.map_or(Ok(()), |grant| grant.revoke(&self.grants));
        if let Err(e) = &revoked {
            error!(ring = %self.name, error = %e, "Fragment grant not revoked");
        }

        match context {
            FragmentContext::Packet(packet) => {
                if revoked.is_ok() {
                    st.release_reference(packet, status);
                } else {
                    st.stats.grants_stranded += 1;
                }
            }
            FragmentContext::Buffer { page, packet } => {
                if revoked.is_ok() {
                    self.buffers.put(page, false);
                } else {
                    st.quarantine.push(page);
                }
                st.release_reference(packet, status);
            }
            FragmentContext::MulticastControl(record) => {
                trace!(ring = %self.name, add = record.add, mac = ?record.mac, ?status, "Multicast control completed");
                self.controls.put(record, true);
            }
        }
        revoked
    }

    /// Answer every outstanding request locally: `Dropped` for each pending
    /// id and a null response for each extra-info slot.
    ///
    /// Only valid once the backend no longer writes the ring.
    fn fake_responses(&self, st: &mut TxState) -> Result<u32> {
        let ring = st
            .ring
            .as_ref()
            .ok_or_else(|| self.invalid_state(st.ring_state))?;

        let mut idx = ring.rsp_prod()?;
        let mut count = 0u32;
        for (id, fragment) in st.pending.iter().enumerate() {
            if fragment.is_some() {
                ring.write_response_at(
                    idx,
                    TxResponse {
                        id: id as u16,
                        status: NETIF_RSP_DROPPED,
                    },
                )?;
                idx = idx.wrapping_add(1);
                count += 1;
            }
        }
        for _ in 0..st.extras_in_flight {
            ring.write_response_at(
                idx,
                TxResponse {
                    id: 0,
                    status: NETIF_RSP_NULL,
                },
            )?;
            idx = idx.wrapping_add(1);
            count += 1;
        }

        let outstanding = ring.outstanding();
        if count != outstanding {
            return Err(self.violation(format!(
                "{count} fabricated responses for {outstanding} outstanding requests"
            )));
        }
        ring.publish_responses(idx)?;
        st.stats.fake_responses += count as u64;
        warn!(ring = %self.name, count, "Fabricated responses for outstanding requests");
        Ok(count)
    }

    /// Release everything pending on a failed ring without touching it.
    fn reclaim(&self, st: &mut TxState) -> Result<()> {
        for id in 0..st.pending.len() {
            if let Some(fragment) = st.pending[id].take() {
                st.ids.push(id as u16);
                let _ = self.release_fragment(st, fragment, TxStatus::Dropped);
            }
        }
        st.extras_in_flight = 0;
        if let Some(ring) = st.ring.as_mut() {
            ring.reset()?;
        }
        Ok(())
    }

    fn prepare(&self, st: &mut TxState, packet: TxPacket) -> Prepare {
        match self.build(st, &packet) {
            Built::Ready(prepared) => Prepare::Ready(prepared),
            Built::Busy => Prepare::Busy(Submission::Packet(packet)),
            Built::Failed => {
                st.complete_unsent(packet.cookie, TxStatus::Error, packet.len());
                Prepare::Completed
            }
            Built::Stranded => {
                error!(ring = %self.name, cookie = packet.cookie, "Packet pages still granted, not completed");
                Prepare::Completed
            }
        }
    }

    fn build(&self, st: &mut TxState, packet: &TxPacket) -> Built {
        let payload = GuestPayload::new(&self.mem, &packet.segments);
        let total = payload.len();
        if !(ETHERNET_HEADER_SIZE..=MAXIMUM_FRAME_SIZE).contains(&total) {
            debug!(ring = %self.name, cookie = packet.cookie, total, "Bad frame length");
            return Built::Failed;
        }

        let mut flags = packet.offload.flags;
        let mut header = Vec::new();
        let classified = {
            let mut cursor = PayloadCursor::new(&payload);
            classify(&mut header, &mut cursor)
        };
        let mut info = match classified {
            Ok(info) => Some(info),
            Err(e) => {
                st.stats.malformed_headers += 1;
                if flags.needs_headers() {
                    debug!(ring = %self.name, cookie = packet.cookie, error = %e, "Offload requested on malformed headers");
                    return Built::Failed;
                }
                debug!(ring = %self.name, cookie = packet.cookie, error = %e, "Malformed headers, sending as is");
                None
            }
        };
        // Bytes of the caller's frame now in `header`
        let consumed = header.len();

        if flags.contains(OffloadFlags::TAG) {
            match info.as_mut() {
                Some(info) => insert_vlan_tag(&mut header, info, packet.offload.tag),
                None if header.len() >= 12 => {
                    insert_vlan_tag(&mut header, &mut HeaderInfo::default(), packet.offload.tag)
                }
                None => {}
            }
        }

        let data_length = total - consumed;
        let mut request_flags = 0;
        let mut extras = Vec::new();
        if let Some(info) = info.as_ref() {
            let mut large = false;
            if flags.large_packet() {
                let gso_type = match (info.ip_version, info.tcp.is_some()) {
                    (Some(IpVersion::V4), true)
                        if flags.contains(OffloadFlags::IPV4_LARGE_PACKET)
                            && st.options.gso_tcpv4 =>
                    {
                        Some(XEN_NETIF_GSO_TYPE_TCPV4)
                    }
                    (Some(IpVersion::V6), true)
                        if flags.contains(OffloadFlags::IPV6_LARGE_PACKET)
                            && st.options.gso_tcpv6 =>
                    {
                        Some(XEN_NETIF_GSO_TYPE_TCPV6)
                    }
                    _ => None,
                };
                let mss = packet.offload.mss;
                let Some(gso_type) = gso_type.filter(|_| mss > 0) else {
                    debug!(ring = %self.name, cookie = packet.cookie, mss, "Large send refused");
                    return Built::Failed;
                };

                let l4_header = info.l4_header().map_or(0, |r| r.length);
                fixup_ip_length(&mut header, info, l4_header + data_length);
                if data_length <= mss as usize {
                    // Goes out as one frame, so its checksums are due here
                    st.stats.lso_demoted += 1;
                    flags |= OffloadFlags::IPV4_HEADER_CHECKSUM
                        | OffloadFlags::IPV4_TCP_CHECKSUM
                        | OffloadFlags::IPV6_TCP_CHECKSUM;
                } else {
                    large = true;
                    st.stats.lso_packets += 1;
                    extras.push(ExtraInfo::gso(mss, gso_type));
                }
            }

            if info.is_ipv4() && (large || flags.contains(OffloadFlags::IPV4_HEADER_CHECKSUM)) {
                refresh_ipv4_checksum(&mut header, info);
            }
            match self.l4_checksum(st, &mut header, info, &payload, consumed, flags, large) {
                Ok(l4_flags) => request_flags |= l4_flags,
                Err(e) => {
                    debug!(ring = %self.name, cookie = packet.cookie, error = %e, "Checksum not calculated");
                    return Built::Failed;
                }
            }
        }

        if st.options.hash
            && let Some(hash) = packet.hash
        {
            extras.push(ExtraInfo::hash(hash.hash_type, hash.value));
        }

        // Short frames are pulled up whole and padded
        let mut tail = consumed;
        if header.len() + data_length < ETHERNET_MIN {
            match PayloadCursor::with_range(&payload, consumed, usize::MAX).read_remaining() {
                Ok(rest) => header.extend_from_slice(&rest),
                Err(e) => {
                    debug!(ring = %self.name, cookie = packet.cookie, error = %e, "Payload unreadable");
                    return Built::Failed;
                }
            }
            header.resize(ETHERNET_MIN, 0);
            tail = total;
        }
        if header.len() > PAGE_SIZE {
            st.stats.malformed_headers += 1;
            return Built::Failed;
        }
        let length = header.len() + (total - tail);
        if length > MAXIMUM_FRAME_SIZE {
            debug!(ring = %self.name, cookie = packet.cookie, length, "Frame too long once tagged");
            return Built::Failed;
        }

        let idx = st.packets.insert(InFlight {
            cookie: Some(packet.cookie),
            references: 0,
            status: TxStatus::Ok,
            length,
            destination: Destination::of(&header),
            ip_version: info.as_ref().and_then(|i| i.ip_version),
            tcp: info.as_ref().is_some_and(|i| i.tcp.is_some()),
            udp: info.as_ref().is_some_and(|i| i.udp.is_some()),
        });

        let mut fragments = Vec::new();
        let result = self
            .buffer_fragment(st, idx, &header)
            .and_then(|fragment| {
                fragments.push(fragment);
                if tail < total {
                    self.payload_fragments(st, idx, &payload, tail, &mut fragments)
                } else {
                    Ok(())
                }
            });
        if let Err(outcome) = result {
            if !self.rollback(st, idx, fragments) {
                return Built::Stranded;
            }
            return outcome;
        }

        if let Some(entry) = st.packets.get_mut(idx) {
            entry.references = fragments.len();
        }
        Built::Ready(Prepared {
            fragments,
            extras,
            flags: request_flags,
            length,
        })
    }

    /// Fill or offload the TCP/UDP checksum; returns request flags.
    #[allow(clippy::too_many_arguments)]
    fn l4_checksum(
        &self,
        st: &mut TxState,
        header: &mut [u8],
        info: &HeaderInfo,
        payload: &GuestPayload<'_>,
        consumed: usize,
        flags: OffloadFlags,
        large: bool,
    ) -> std::result::Result<u16, GuestMemoryError> {
        if info.fragment {
            return Ok(0);
        }
        let tcp = info.tcp.is_some();
        let (wanted, protocol, field) = match (info.ip_version, tcp, info.udp.is_some()) {
            (Some(IpVersion::V4), true, _) => {
                (OffloadFlags::IPV4_TCP_CHECKSUM, IPPROTO_TCP, TCP_CHECKSUM_OFFSET)
            }
            (Some(IpVersion::V4), false, true) => {
                (OffloadFlags::IPV4_UDP_CHECKSUM, IPPROTO_UDP, UDP_CHECKSUM_OFFSET)
            }
            (Some(IpVersion::V6), true, _) => {
                (OffloadFlags::IPV6_TCP_CHECKSUM, IPPROTO_TCP, TCP_CHECKSUM_OFFSET)
            }
            (Some(IpVersion::V6), false, true) => {
                (OffloadFlags::IPV6_UDP_CHECKSUM, IPPROTO_UDP, UDP_CHECKSUM_OFFSET)
            }
            _ => return Ok(0),
        };
        let Some(l4) = info.l4_header() else {
            return Ok(0);
        };
        if !large && !flags.contains(wanted) {
            return Ok(0);
        }

        let offload_allowed = match info.ip_version {
            Some(IpVersion::V4) => st.options.ipv4_csum_offload,
            _ => st.options.ipv6_csum_offload,
        };
        if large || (offload_allowed && !st.options.calculate_checksums) {
            let data_length = payload.len() - consumed;
            let l4_length = info
                .declared_l4_length(header)
                .unwrap_or(l4.length + data_length);
            let partial = pseudo_header_checksum(header, info, protocol, l4_length);
            put_be16(header, l4.offset + field, partial);
            st.stats.checksum_offloaded += 1;
            return Ok(NETTXF_CSUM_BLANK | NETTXF_DATA_VALIDATED);
        }

        let mut cursor = PayloadCursor::with_range(payload, consumed, usize::MAX);
        let value = if tcp {
            tcp_checksum(header, info, &mut cursor)?
        } else {
            udp_checksum(header, info, &mut cursor)?
        };
        put_be16(header, l4.offset + field, value);
        st.stats.checksum_calculated += 1;
        Ok(0)
    }

    fn grant(&self, st: &TxState, pfn: u64) -> std::result::Result<GrantEntry, Built> {
        match GrantEntry::permit(&self.grants, st.options.backend_domain, pfn, true) {
            Ok(grant) => Ok(grant),
            Err(GrantError::Exhausted) => Err(Built::Busy),
            Err(e) => {
                error!(ring = %self.name, pfn, error = %e, "Grant failed");
                Err(Built::Failed)
            }
        }
    }

    /// Copy `data` into a ring-owned page and grant it.
    fn buffer_fragment(
        &self,
        st: &TxState,
        packet: usize,
        data: &[u8],
    ) -> std::result::Result<Fragment, Built> {
        let page = self.buffers.get(false).ok_or(Built::Busy)?;
        if page.write(0, data).is_err() {
            self.buffers.put(page, false);
            return Err(Built::Failed);
        }
        let grant = match self.grant(st, page.pfn()) {
            Ok(grant) => grant,
            Err(outcome) => {
                self.buffers.put(page, false);
                return Err(outcome);
            }
        };
        Ok(Fragment {
            grant: Some(grant),
            context: FragmentContext::Buffer { page, packet },
            offset: 0,
            length: data.len(),
        })
    }

    /// Grant the caller's pages, or copy when that takes too many slots.
    fn payload_fragments(
        &self,
        st: &mut TxState,
        packet: usize,
        payload: &GuestPayload<'_>,
        from: usize,
        fragments: &mut Vec<Fragment>,
    ) -> std::result::Result<(), Built> {
        let ranges = payload.ranges(from, payload.len() - from);
        if !st.options.always_copy && ranges.len() < XEN_NETIF_NR_SLOTS_MIN {
            for range in ranges {
                let grant = self.grant(st, pfn_of(range.addr))?;
                fragments.push(Fragment {
                    grant: Some(grant),
                    context: FragmentContext::Packet(packet),
                    offset: range.addr.0 as usize % PAGE_SIZE,
                    length: range.len,
                });
            }
            st.stats.payload_granted += 1;
            return Ok(());
        }

        let data = PayloadCursor::with_range(payload, from, usize::MAX)
            .read_remaining()
            .map_err(|_| Built::Failed)?;
        for chunk in data.chunks(PAGE_SIZE) {
            fragments.push(self.buffer_fragment(st, packet, chunk)?);
        }
        st.stats.payload_copied += 1;
        Ok(())
    }

    /// Undo a partly built packet; nothing has been posted.
    ///
    /// Returns false if a caller page is still granted, in which case the
    /// packet must not go back to its caller.
    fn rollback(&self, st: &mut TxState, packet: usize, fragments: Vec<Fragment>) -> bool {
        let mut released = true;
        for fragment in fragments {
            let revoked = match fragment.grant {
                Some(grant) => match grant.revoke(&self.grants) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(ring = %self.name, error = %e, "Unposted grant not revoked");
                        false
                    }
                },
                None => true,
            };
            match fragment.context {
                FragmentContext::Buffer { page, .. } if revoked => self.buffers.put(page, false),
                FragmentContext::Buffer { page, .. } => st.quarantine.push(page),
                FragmentContext::MulticastControl(record) => self.controls.put(record, true),
                FragmentContext::Packet(_) if revoked => {}
                FragmentContext::Packet(_) => {
                    st.stats.grants_stranded += 1;
                    released = false;
                }
            }
        }
        st.packets.remove(packet);
        released
    }

    fn prepare_control(&self, st: &mut TxState, request: ControlRequest) -> Prepare {
        let frame = match request {
            ControlRequest::Arp(ip) => control::gratuitous_arp(st.options.mac, ip),
            ControlRequest::NeighbourAdvertisement(ip) => {
                control::neighbour_advertisement(st.options.mac, ip)
            }
            ControlRequest::Multicast { add, mac } => {
                return self.prepare_multicast(st, request, add, mac);
            }
        };

        let mut frame = frame;
        if frame.len() < ETHERNET_MIN {
            frame.resize(ETHERNET_MIN, 0);
        }
        let idx = st.packets.insert(InFlight {
            cookie: None,
            references: 1,
            status: TxStatus::Ok,
            length: frame.len(),
            destination: Destination::of(&frame),
            ip_version: None,
            tcp: false,
            udp: false,
        });
        match self.buffer_fragment(st, idx, &frame) {
            Ok(fragment) => {
                st.stats.control_requests += 1;
                Prepare::Ready(Prepared {
                    fragments: vec![fragment],
                    extras: Vec::new(),
                    flags: 0,
                    length: frame.len(),
                })
            }
            Err(Built::Busy) => {
                st.packets.remove(idx);
                Prepare::Busy(Submission::Control(request))
            }
            Err(_) => {
                st.packets.remove(idx);
                Prepare::Completed
            }
        }
    }

    /// A zero-length request carrying only a multicast extra slot.
    fn prepare_multicast(
        &self,
        st: &mut TxState,
        request: ControlRequest,
        add: bool,
        mac: [u8; 6],
    ) -> Prepare {
        if !st.options.multicast_control {
            debug!(ring = %self.name, add, mac = ?mac, "Multicast control not negotiated, ignored");
            return Prepare::Completed;
        }
        let Some(mut record) = self.controls.get(true) else {
            return Prepare::Busy(Submission::Control(request));
        };
        record.add = add;
        record.mac = mac;
        st.stats.control_requests += 1;
        Prepare::Ready(Prepared {
            fragments: vec![Fragment {
                grant: None,
                context: FragmentContext::MulticastControl(record),
                offset: 0,
                length: 0,
            }],
            extras: vec![ExtraInfo::multicast(add, mac)],
            flags: 0,
            length: 0,
        })
    }

    /// Ring-owned frames held back because their grant outlived a revoke
    pub fn quarantined(&self) -> usize {
        lock(&self.state).quarantine.len()
    }

    /// Packets waiting in the owner FIFO plus those in flight
    pub fn queued(&self) -> usize {
        let st = lock(&self.state);
        st.fifo.len() + st.packets.len() + usize::from(st.prepared.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::VLAN_TAG_SIZE;
    use crate::protocol::{NETIF_RSP_ERROR, TX_RING_SIZE, XEN_NETIF_EXTRA_TYPE_MCAST_ADD};
    use crate::test_util::TxHarness;
    use crate::test_util::packets::{self, TCP_IPV4_HEADERS};

    fn options() -> TxOptions {
        TxOptions {
            ipv4_csum_offload: true,
            ipv6_csum_offload: true,
            gso_tcpv4: true,
            gso_tcpv6: true,
            multicast_control: true,
            mac: packets::GUEST_MAC,
            ..TxOptions::default()
        }
    }

    #[test]
    fn test_simple_send_and_complete() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(200, 3));
        harness
            .transmitter
            .queue_packet(harness.packet(1, &frame))
            .expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, frame);

        harness.transmitter.service().expect("service");
        let completions = harness.upstream.take_completions();
        assert_eq!(
            completions,
            vec![TxCompletion {
                cookie: 1,
                status: TxStatus::Ok,
                length: frame.len(),
            }]
        );
        let stats = harness.transmitter.statistics();
        assert_eq!(stats.completed_ok, 1);
        assert_eq!(stats.protocols.udp, 1);
        assert_eq!(harness.transmitter.outstanding(), 0);
        assert!(harness.transmitter.accounting_consistent());
        assert_eq!(harness.grants.active(), 1);
    }

    #[test]
    fn test_short_frame_padded() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::gratuitous_arp_request();
        assert!(frame.len() < ETHERNET_MIN);
        harness
            .transmitter
            .queue_packet(harness.packet(2, &frame))
            .expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data.len(), ETHERNET_MIN);
        assert_eq!(&sent[0].data[..frame.len()], &frame[..]);
        assert!(sent[0].data[frame.len()..].iter().all(|&b| b == 0));
        // Header only, no payload fragment
        assert_eq!(sent[0].fragments, 1);
    }

    #[test]
    fn test_checksum_offload_sets_blank() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::tcp_ipv4_frame(&packets::pattern(500, 1), 10, 1);
        let mut packet = harness.packet(3, &frame);
        packet.offload.flags = OffloadFlags::IPV4_TCP_CHECKSUM;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_ne!(sent[0].flags & NETTXF_CSUM_BLANK, 0);
        // The backend finished the checksum
        assert_eq!(sent[0].data, frame);
        assert_eq!(harness.transmitter.statistics().checksum_offloaded, 1);
    }

    #[test]
    fn test_checksum_calculated_when_configured() {
        let harness = TxHarness::new(TxOptions {
            calculate_checksums: true,
            ..options()
        });
        let mut backend = harness.backend();
        let frame = packets::tcp_ipv4_frame(&packets::pattern(500, 1), 10, 1);
        let mut broken = frame.clone();
        broken[TCP_IPV4_HEADERS - 4] = 0;
        broken[TCP_IPV4_HEADERS - 3] = 0;
        let mut packet = harness.packet(4, &broken);
        packet.offload.flags = OffloadFlags::IPV4_TCP_CHECKSUM;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].flags & NETTXF_CSUM_BLANK, 0);
        assert_eq!(sent[0].data, frame);
        assert_eq!(harness.transmitter.statistics().checksum_calculated, 1);
    }

    #[test]
    fn test_vlan_tag_inserted() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(100, 7));
        let mut packet = harness.packet(5, &frame);
        packet.offload.flags = OffloadFlags::TAG;
        packet.offload.tag = 0x0123;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data, packets::with_vlan(&frame, 0x0123));
        harness.transmitter.service().expect("service");
        assert_eq!(harness.upstream.take_completions()[0].length, frame.len() + 4);
    }

    #[test]
    fn test_large_send_carries_gso_extra() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let payload = packets::pattern(8600, 2);
        let frame = packets::tcp_ipv4_frame(&payload, 1000, 9);
        let mut packet = harness.packet(6, &frame);
        packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
        packet.offload.mss = 1460;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].gso, Some((1460, XEN_NETIF_GSO_TYPE_TCPV4)));
        let segments = sent[0].segments();
        assert_eq!(segments.len(), 6);
        let mut reassembled = Vec::new();
        for segment in &segments {
            let parsed = packets::parse_tcp_frame(segment).expect("tcp");
            assert!(parsed.checksums_valid);
            reassembled.extend_from_slice(&parsed.payload);
        }
        assert_eq!(reassembled, payload);
        assert_eq!(harness.transmitter.statistics().lso_packets, 1);
    }

    #[test]
    fn test_small_large_send_demoted() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::tcp_ipv4_frame(&packets::pattern(1000, 2), 0, 0);
        let mut packet = harness.packet(7, &frame);
        packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
        packet.offload.mss = 1460;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].gso, None);
        assert_eq!(sent[0].data, frame);
        assert_eq!(harness.transmitter.statistics().lso_demoted, 1);
    }

    #[test]
    fn test_demoted_large_send_fixes_blank_headers() {
        let frame = packets::tcp_ipv4_frame(&packets::pattern(1000, 2), 0, 0);
        let mut blank = frame.clone();
        // IPv4 total length and header checksum, TCP checksum
        for at in [16, 17, 24, 25, TCP_IPV4_HEADERS - 4, TCP_IPV4_HEADERS - 3] {
            blank[at] = 0;
        }

        for calculate_checksums in [false, true] {
            let harness = TxHarness::new(TxOptions {
                calculate_checksums,
                ..options()
            });
            let mut backend = harness.backend();
            let mut packet = harness.packet(7, &blank);
            packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
            packet.offload.mss = 1460;
            harness.transmitter.queue_packet(packet).expect("queue");

            let sent = backend.service(NETIF_RSP_OKAY);
            assert_eq!(sent[0].gso, None);
            assert_eq!(sent[0].flags & NETTXF_CSUM_BLANK != 0, !calculate_checksums);
            assert_eq!(sent[0].data, frame);
            let parsed = packets::parse_tcp_frame(&sent[0].data).expect("tcp");
            assert!(parsed.checksums_valid);

            harness.transmitter.service().expect("service");
            assert_eq!(harness.upstream.take_completions()[0].status, TxStatus::Ok);
            assert_eq!(harness.transmitter.statistics().lso_demoted, 1);
        }
    }

    #[test]
    fn test_large_send_with_unset_ip_length() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let payload = packets::pattern(4000, 6);
        let mut frame = packets::tcp_ipv4_frame(&payload, 77, 3);
        frame[16] = 0;
        frame[17] = 0;
        let mut packet = harness.packet(8, &frame);
        packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
        packet.offload.mss = 1460;
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gso, Some((1460, XEN_NETIF_GSO_TYPE_TCPV4)));
        let mut reassembled = Vec::new();
        for segment in sent[0].segments() {
            let parsed = packets::parse_tcp_frame(&segment).expect("tcp");
            assert!(parsed.checksums_valid);
            reassembled.extend_from_slice(&parsed.payload);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_tagged_frame_over_maximum_fails() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let large = |cookie, payload_length| {
            let frame = packets::tcp_ipv4_frame(&packets::pattern(payload_length, 1), 0, 0);
            let mut packet = harness.packet(cookie, &frame);
            packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET | OffloadFlags::TAG;
            packet.offload.mss = 1460;
            packet.offload.tag = 5;
            (frame, packet)
        };

        let (frame, packet) = large(1, MAXIMUM_FRAME_SIZE - TCP_IPV4_HEADERS);
        assert_eq!(frame.len(), MAXIMUM_FRAME_SIZE);
        harness.transmitter.queue_packet(packet).expect("queue");
        let completions = harness.upstream.take_completions();
        assert_eq!(completions[0].status, TxStatus::Error);
        assert_eq!(backend.pending(), 0);
        assert_eq!(harness.grants.active(), 1);

        // Fits exactly once tagged
        let (frame, packet) = large(2, MAXIMUM_FRAME_SIZE - TCP_IPV4_HEADERS - VLAN_TAG_SIZE);
        harness.transmitter.queue_packet(packet).expect("queue");
        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data.len(), MAXIMUM_FRAME_SIZE);
        assert_eq!(sent[0].data, packets::with_vlan(&frame, 5));
    }

    #[test]
    fn test_large_send_refused_without_backend_support() {
        let harness = TxHarness::new(TxOptions {
            gso_tcpv4: false,
            ..options()
        });
        let frame = packets::tcp_ipv4_frame(&packets::pattern(4000, 2), 0, 0);
        let mut packet = harness.packet(8, &frame);
        packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
        packet.offload.mss = 1460;
        harness.transmitter.queue_packet(packet).expect("queue");

        let completions = harness.upstream.take_completions();
        assert_eq!(completions[0].status, TxStatus::Error);
        assert_eq!(harness.transmitter.outstanding(), 0);
    }

    #[test]
    fn test_malformed_headers_with_offload_fail() {
        let harness = TxHarness::new(options());
        let mut frame = packets::tcp_ipv4_frame(&packets::pattern(100, 2), 0, 0);
        // IHL of 2 words
        frame[14] = 0x42;
        let mut packet = harness.packet(9, &frame);
        packet.offload.flags = OffloadFlags::IPV4_TCP_CHECKSUM;
        harness.transmitter.queue_packet(packet).expect("queue");

        let completions = harness.upstream.take_completions();
        assert_eq!(completions[0].status, TxStatus::Error);
        assert_eq!(harness.transmitter.statistics().malformed_headers, 1);
    }

    #[test]
    fn test_malformed_headers_without_offload_sent() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let mut frame = packets::tcp_ipv4_frame(&packets::pattern(100, 2), 0, 0);
        frame[14] = 0x42;
        harness
            .transmitter
            .queue_packet(harness.packet(10, &frame))
            .expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data, frame);
    }

    #[test]
    fn test_payload_granted_or_copied() {
        let frame = packets::udp_ipv4_frame(&packets::pattern(3000, 5));

        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        harness
            .transmitter
            .queue_packet(harness.packet(11, &frame))
            .expect("queue");
        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data, frame);
        assert_eq!(harness.transmitter.statistics().payload_granted, 1);

        let harness = TxHarness::new(TxOptions {
            always_copy: true,
            ..options()
        });
        let mut backend = harness.backend();
        harness
            .transmitter
            .queue_packet(harness.packet(12, &frame))
            .expect("queue");
        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data, frame);
        assert_eq!(harness.transmitter.statistics().payload_copied, 1);
    }

    #[test]
    fn test_fragmented_caller_buffer_copied() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(1200, 5));
        // 20 pieces exceed the slot limit once the header is added
        let packet = harness.scattered_packet(13, &frame, 20);
        harness.transmitter.queue_packet(packet).expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent[0].data, frame);
        assert!(sent[0].fragments <= XEN_NETIF_NR_SLOTS_MIN);
        assert_eq!(harness.transmitter.statistics().payload_copied, 1);
    }

    #[test]
    fn test_error_status_first_error_wins() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(3000, 1));
        harness
            .transmitter
            .queue_packet(harness.packet(14, &frame))
            .expect("queue");

        backend.service(NETIF_RSP_ERROR);
        harness.transmitter.service().expect("service");
        let completions = harness.upstream.take_completions();
        assert_eq!(completions[0].status, TxStatus::Error);
        assert_eq!(harness.transmitter.statistics().completed_error, 1);
    }

    #[test]
    fn test_ring_full_is_busy_then_recovers() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(3000, 1));
        // Two slots each
        let count = TX_RING_SIZE as u64 / 2 + 4;
        for cookie in 0..count {
            harness
                .transmitter
                .queue_packet(harness.packet(cookie, &frame))
                .expect("queue");
        }
        assert_eq!(harness.transmitter.state(), RingState::Stopped);
        assert_eq!(harness.transmitter.outstanding(), TX_RING_SIZE);
        assert!(harness.transmitter.statistics().busy > 0);

        let mut sent = backend.service(NETIF_RSP_OKAY).len();
        harness.transmitter.service().expect("service");
        assert_eq!(harness.transmitter.state(), RingState::Enabled);
        sent += backend.service(NETIF_RSP_OKAY).len();
        harness.transmitter.service().expect("service");

        assert_eq!(sent as u64, count);
        let completions = harness.upstream.take_completions();
        assert_eq!(completions.len() as u64, count);
        // Completion order follows queue order
        assert!(completions.windows(2).all(|w| w[0].cookie < w[1].cookie));
        assert!(harness.transmitter.accounting_consistent());
    }

    #[test]
    fn test_fake_responses_on_backend_loss() {
        let harness = TxHarness::new(options());
        let frame = packets::udp_ipv4_frame(&packets::pattern(100, 1));
        for cookie in 0..4 {
            harness
                .transmitter
                .queue_packet(harness.packet(cookie, &frame))
                .expect("queue");
        }
        // 4 packets, header + payload each
        assert_eq!(harness.transmitter.outstanding(), 8);

        let err = harness
            .transmitter
            .disconnect(BackendState::Connected)
            .expect_err("still draining");
        assert!(matches!(err, RingError::InvalidState { state: "draining", .. }));

        harness
            .transmitter
            .disconnect(BackendState::Closing)
            .expect("disconnect");
        let completions = harness.upstream.take_completions();
        assert_eq!(completions.len(), 4);
        assert!(completions.iter().all(|c| c.status == TxStatus::Dropped));
        assert_eq!(harness.transmitter.statistics().fake_responses, 8);
        assert_eq!(harness.transmitter.state(), RingState::Disconnected);
        assert_eq!(harness.grants.active(), 0);
    }

    #[test]
    fn test_fake_responses_cover_extra_slots() {
        let harness = TxHarness::new(options());
        let frame = packets::tcp_ipv4_frame(&packets::pattern(8600, 2), 0, 0);
        for cookie in 0..4 {
            let mut packet = harness.packet(cookie, &frame);
            packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
            packet.offload.mss = 1460;
            harness.transmitter.queue_packet(packet).expect("queue");
        }
        harness
            .transmitter
            .queue_control(ControlRequest::Multicast {
                add: true,
                mac: [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01],
            })
            .expect("queue");
        // Header, three payload pieces and a GSO slot per packet, then the
        // multicast request and its extra slot
        assert_eq!(harness.transmitter.outstanding(), 4 * 5 + 2);
        assert!(harness.transmitter.accounting_consistent());

        harness
            .transmitter
            .disconnect(BackendState::Closing)
            .expect("disconnect");
        assert_eq!(harness.transmitter.statistics().fake_responses, 22);
        let completions = harness.upstream.take_completions();
        assert_eq!(completions.len(), 4);
        assert!(completions.iter().all(|c| c.status == TxStatus::Dropped));
        assert_eq!(harness.transmitter.state(), RingState::Disconnected);
        assert_eq!(harness.grants.active(), 0);
    }

    #[test]
    fn test_unrevoked_buffer_page_never_reused() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(3000, 4));
        // The header grant stays mapped and the payload grant runs out
        let header_ref = harness.ring_ref + 1;
        harness.grants.map(header_ref);
        harness.grants.set_limit(harness.grants.active() + 1);
        harness
            .transmitter
            .queue_packet(harness.packet(1, &frame))
            .expect("queue");

        assert_eq!(harness.transmitter.state(), RingState::Stopped);
        assert_eq!(harness.transmitter.quarantined(), 1);
        let stuck = harness.grants.lookup(header_ref).expect("still granted");

        harness.grants.set_limit(4096);
        harness.transmitter.service().expect("service");
        assert_eq!(harness.grants.grants_of(stuck.pfn), vec![header_ref]);

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, frame);
        harness.transmitter.service().expect("service");
        assert_eq!(harness.upstream.take_completions()[0].status, TxStatus::Ok);
    }

    #[test]
    fn test_unrevoked_caller_page_not_completed() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(3000, 4));
        // Header and first payload piece granted, the second runs out
        let piece_ref = harness.ring_ref + 2;
        harness.grants.map(piece_ref);
        harness.grants.set_limit(harness.grants.active() + 2);
        harness
            .transmitter
            .queue_packet(harness.scattered_packet(1, &frame, 3))
            .expect("queue");

        assert!(harness.upstream.take_completions().is_empty());
        assert_eq!(harness.transmitter.queued(), 0);
        assert_eq!(harness.transmitter.statistics().grants_stranded, 1);
        assert!(harness.grants.lookup(piece_ref).is_some());
        assert_eq!(harness.transmitter.quarantined(), 0);

        // Later packets still go out
        harness.grants.set_limit(4096);
        harness
            .transmitter
            .queue_packet(harness.packet(2, &frame))
            .expect("queue");
        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent.len(), 1);
        harness.transmitter.service().expect("service");
        let completions = harness.upstream.take_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].cookie, 2);
    }

    #[test]
    fn test_multicast_control_request() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let group = [0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb];
        harness
            .transmitter
            .queue_control(ControlRequest::Multicast {
                add: true,
                mac: group,
            })
            .expect("queue");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert!(sent.is_empty());
        assert_eq!(backend.multicast, vec![(XEN_NETIF_EXTRA_TYPE_MCAST_ADD, group)]);
        harness.transmitter.service().expect("service");
        assert!(harness.transmitter.accounting_consistent());
        assert_eq!(harness.transmitter.outstanding(), 0);
    }

    #[test]
    fn test_control_requests_served_first() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        harness.transmitter.disable().expect("disable");
        let frame = packets::udp_ipv4_frame(&packets::pattern(100, 1));
        harness
            .transmitter
            .queue_packet(harness.packet(1, &frame))
            .expect("queue");
        harness
            .transmitter
            .queue_control(ControlRequest::Arp(Ipv4Addr::new(10, 0, 0, 2)))
            .expect("queue");
        harness.transmitter.enable().expect("enable");

        let sent = backend.service(NETIF_RSP_OKAY);
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0].data[12..14], &[0x08, 0x06]);
        assert_eq!(sent[1].data, frame);

        harness.transmitter.service().expect("service");
        // Only the caller's packet has a completion
        assert_eq!(harness.upstream.take_completions().len(), 1);
    }

    #[test]
    fn test_unknown_response_id_fails_ring() {
        let harness = TxHarness::new(options());
        let mut backend = harness.backend();
        let frame = packets::udp_ipv4_frame(&packets::pattern(100, 1));
        harness
            .transmitter
            .queue_packet(harness.packet(1, &frame))
            .expect("queue");

        backend.respond_raw(TxResponse {
            id: 999,
            status: NETIF_RSP_OKAY,
        });
        backend.push();
        let err = harness.transmitter.service().expect_err("violation");
        assert!(matches!(err, RingError::ProtocolViolation { .. }));
        assert_eq!(harness.transmitter.state(), RingState::Failed);

        // Later submissions complete as dropped
        harness
            .transmitter
            .queue_packet(harness.packet(2, &frame))
            .expect("queue");
        let completions = harness.upstream.take_completions();
        assert_eq!(completions.last().map(|c| c.status), Some(TxStatus::Dropped));
    }

    #[test]
    fn test_watchdog_detects_stall() {
        let harness = TxHarness::new(options());
        let frame = packets::udp_ipv4_frame(&packets::pattern(100, 1));
        harness
            .transmitter
            .queue_packet(harness.packet(1, &frame))
            .expect("queue");

        let triggers = harness.events.triggers();
        assert!(!harness.transmitter.watchdog_tick());
        assert!(harness.transmitter.watchdog_tick());
        assert_eq!(harness.events.triggers(), triggers + 1);
        assert_eq!(harness.transmitter.statistics().stalls, 1);
    }
}
