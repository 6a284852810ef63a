//! Simulated backend domain for tests
//!
//! A grant table, event channels and a control-plane store living in the
//! same process as the front-end, plus backend-side ring servicing in
//! `backend`. Guest memory is shared directly, so the "backend" reads and
//! writes granted frames at their guest addresses.

#![allow(dead_code)]

pub mod packets;

mod backend;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

pub use backend::{RxBackend, TxBackend, TxFrame};

use crate::cache::{Cache, SpinLock};
use crate::config::ReceiveOffloadConfig;
use crate::error::{GrantError, StoreError};
use crate::host::{BackendState, DomainId, EventChannel, GrantTable, Store, Upstream};
use crate::lock;
use crate::memory::{FramePool, MemorySegment, Page, create_guest_memory};
use crate::protocol::{GrantRef, PAGE_SIZE, RX_SLOT_SIZE, TX_SLOT_SIZE};
use crate::receiver::{Receiver, RxPacket};
use crate::ring::BackRing;
use crate::transmitter::{TxCompletion, TxOptions, TxPacket, Transmitter};

/// First reference handed out; lower ones are reserved by convention
const FIRST_GREF: GrantRef = 8;

// ============================================================================
// Store
// ============================================================================

/// In-memory control-plane store with a writable backend directory.
#[derive(Debug)]
pub struct MemoryStore {
    frontend: Mutex<HashMap<String, String>>,
    backend: Mutex<HashMap<String, String>>,
    state: Mutex<BackendState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            frontend: Mutex::new(HashMap::new()),
            backend: Mutex::new(HashMap::new()),
            state: Mutex::new(BackendState::InitWait),
        }
    }

    /// Store preloaded with a typical backend's feature keys
    pub fn with_backend_features(max_queues: usize) -> Self {
        let store = Self::new();
        for key in [
            "feature-sg",
            "feature-gso-tcpv4",
            "feature-gso-tcpv6",
            "feature-ipv6-csum-offload",
            "feature-multicast-control",
        ] {
            store.set_backend(key, "1");
        }
        store.set_backend("multi-queue-max-queues", &max_queues.to_string());
        store.set_backend("mac", "00:16:3e:12:34:56");
        store
    }

    pub fn set_backend(&self, key: &str, value: &str) {
        lock(&self.backend).insert(key.to_string(), value.to_string());
    }

    pub fn set_backend_state(&self, state: BackendState) {
        *lock(&self.state) = state;
    }

    /// Front-end key as written, if any
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.frontend).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.frontend).keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> Result<String, StoreError> {
        self.get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.frontend).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.frontend).remove(key);
        Ok(())
    }

    fn read_backend(&self, key: &str) -> Result<String, StoreError> {
        lock(&self.backend)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn backend_state(&self) -> BackendState {
        *lock(&self.state)
    }
}

// ============================================================================
// Grant table
// ============================================================================

/// One active grant as seen by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub domain: DomainId,
    pub pfn: u64,
    pub read_only: bool,
}

#[derive(Debug, Default)]
struct GrantState {
    entries: HashMap<GrantRef, Grant>,
    /// References the backend still has mapped
    mapped: Vec<GrantRef>,
    next: GrantRef,
    limit: usize,
    permits: usize,
    revokes: usize,
}

/// Grant table with a bounded number of active entries.
#[derive(Debug)]
pub struct SimGrantTable {
    state: Mutex<GrantState>,
}

impl SimGrantTable {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GrantState {
                next: FIRST_GREF,
                limit,
                ..GrantState::default()
            }),
        }
    }

    pub fn lookup(&self, gref: GrantRef) -> Option<Grant> {
        lock(&self.state).entries.get(&gref).copied()
    }

    /// Active grants
    pub fn active(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn permits(&self) -> usize {
        lock(&self.state).permits
    }

    pub fn revokes(&self) -> usize {
        lock(&self.state).revokes
    }

    /// Active references to `pfn`, lowest first
    pub fn grants_of(&self, pfn: u64) -> Vec<GrantRef> {
        let st = lock(&self.state);
        let mut grefs: Vec<GrantRef> = st
            .entries
            .iter()
            .filter(|(_, grant)| grant.pfn == pfn)
            .map(|(&gref, _)| gref)
            .collect();
        grefs.sort_unstable();
        grefs
    }

    pub fn set_limit(&self, limit: usize) {
        lock(&self.state).limit = limit;
    }

    /// Keep `gref` mapped so revoking it fails until `unmap`.
    pub fn map(&self, gref: GrantRef) {
        lock(&self.state).mapped.push(gref);
    }

    pub fn unmap(&self, gref: GrantRef) {
        lock(&self.state).mapped.retain(|&g| g != gref);
    }
}

impl GrantTable for SimGrantTable {
    fn permit_foreign_access(
        &self,
        domain: DomainId,
        pfn: u64,
        read_only: bool,
    ) -> Result<GrantRef, GrantError> {
        let mut st = lock(&self.state);
        if st.entries.len() >= st.limit {
            return Err(GrantError::Exhausted);
        }
        let mut gref = st.next;
        while st.entries.contains_key(&gref) || gref < FIRST_GREF {
            gref = gref.wrapping_add(1);
        }
        st.next = gref.wrapping_add(1);
        st.entries.insert(
            gref,
            Grant {
                domain,
                pfn,
                read_only,
            },
        );
        st.permits += 1;
        Ok(gref)
    }

    fn revoke_foreign_access(&self, gref: GrantRef) -> Result<(), GrantError> {
        let mut st = lock(&self.state);
        if st.mapped.contains(&gref) {
            return Err(GrantError::InUse(gref));
        }
        st.entries.remove(&gref).ok_or(GrantError::NotActive(gref))?;
        st.revokes += 1;
        Ok(())
    }
}

// ============================================================================
// Event channel
// ============================================================================

/// Event channel backed by an eventfd for the local end.
pub struct SimEventChannel {
    port: u32,
    local: EventFd,
    sends: AtomicUsize,
    triggers: AtomicUsize,
}

impl SimEventChannel {
    pub fn new(port: u32) -> std::io::Result<Self> {
        Ok(Self {
            port,
            local: EventFd::new(EFD_NONBLOCK)?,
            sends: AtomicUsize::new(0),
            triggers: AtomicUsize::new(0),
        })
    }

    /// Notifications sent to the backend
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Local raises
    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    /// The local end, for a thread that waits on it
    pub fn fd(&self) -> &EventFd {
        &self.local
    }

    /// Raise the local end as the backend would.
    pub fn notify_local(&self) {
        let _ = self.local.write(1);
    }
}

impl EventChannel for SimEventChannel {
    fn port(&self) -> u32 {
        self.port
    }

    fn send(&self) {
        self.sends.fetch_add(1, Ordering::SeqCst);
    }

    fn trigger(&self) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        self.notify_local();
    }

    fn unmask(&self) -> bool {
        // A non-blocking read succeeds only if an event is pending
        self.local.read().is_ok()
    }
}

// ============================================================================
// Upstream
// ============================================================================

/// Upstream that keeps everything it is given.
#[derive(Default)]
pub struct RecordingUpstream {
    packets: Mutex<Vec<(usize, RxPacket)>>,
    completions: Mutex<Vec<(usize, TxCompletion)>>,
}

impl RecordingUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_packets(&self) -> Vec<RxPacket> {
        std::mem::take(&mut *lock(&self.packets))
            .into_iter()
            .map(|(_, packet)| packet)
            .collect()
    }

    /// Received packets with their queue index
    pub fn take_queued_packets(&self) -> Vec<(usize, RxPacket)> {
        std::mem::take(&mut *lock(&self.packets))
    }

    pub fn take_completions(&self) -> Vec<TxCompletion> {
        std::mem::take(&mut *lock(&self.completions))
            .into_iter()
            .map(|(_, completion)| completion)
            .collect()
    }

    pub fn completion_count(&self) -> usize {
        lock(&self.completions).len()
    }
}

impl Upstream for RecordingUpstream {
    fn deliver(&self, queue: usize, packets: Vec<RxPacket>) {
        lock(&self.packets).extend(packets.into_iter().map(|p| (queue, p)));
    }

    fn complete(&self, queue: usize, completions: Vec<TxCompletion>) {
        lock(&self.completions).extend(completions.into_iter().map(|c| (queue, c)));
    }
}

// ============================================================================
// Harnesses
// ============================================================================

/// Page cache over `count` frames of `pool`
pub fn page_cache(name: &str, pool: Arc<FramePool>, count: usize) -> Arc<Cache<Page>> {
    Arc::new(Cache::new(
        name,
        count,
        move || pool.alloc(),
        drop,
        Arc::new(SpinLock::new()),
    ))
}

/// Guest address of the frame behind `gref`
fn granted_address(grants: &SimGrantTable, gref: GrantRef) -> GuestAddress {
    let grant = grants.lookup(gref).expect("ring grant active");
    GuestAddress(grant.pfn * PAGE_SIZE as u64)
}

/// A connected receiver over its own guest memory.
pub struct RxHarness {
    pub receiver: Receiver,
    pub mem: Arc<GuestMemoryMmap>,
    pub grants: Arc<SimGrantTable>,
    pub events: Arc<SimEventChannel>,
    pub upstream: Arc<RecordingUpstream>,
    pub ring_ref: GrantRef,
}

impl RxHarness {
    /// Receiver with `buffers` receive frames, connected but not enabled.
    pub fn new(buffers: usize) -> Self {
        let mem = Arc::new(create_guest_memory((buffers + 1) * PAGE_SIZE).expect("guest memory"));
        let ring_pool = FramePool::new(mem.clone(), 0, 1);
        let buffer_pool = FramePool::new(mem.clone(), 1, buffers);

        let grants = Arc::new(SimGrantTable::new(4096));
        let events = Arc::new(SimEventChannel::new(1).expect("eventfd"));
        let upstream = Arc::new(RecordingUpstream::new());
        let receiver = Receiver::new(
            0,
            page_cache("rx", buffer_pool, buffers),
            grants.clone(),
            events.clone(),
            upstream.clone(),
            ReceiveOffloadConfig::default().flags(),
        );
        let page = ring_pool.alloc().expect("ring page");
        let ring_ref = receiver.connect(page, 0).expect("connect");

        Self {
            receiver,
            mem,
            grants,
            events,
            upstream,
            ring_ref,
        }
    }

    /// Backend end of the receive ring. Call once per test.
    pub fn backend(&self) -> RxBackend {
        let ring = BackRing::attach(
            self.mem.clone(),
            granted_address(&self.grants, self.ring_ref),
            RX_SLOT_SIZE,
        );
        RxBackend::new(ring, self.mem.clone(), self.grants.clone())
    }
}

/// Backend ends of one queue's rings, located through the ring references
/// the front-end published in the store.
pub struct SimQueue {
    pub tx: TxBackend,
    pub rx: RxBackend,
}

impl SimQueue {
    /// `None` until the front-end has written the queue's keys.
    pub fn attach(
        mem: &Arc<GuestMemoryMmap>,
        grants: &Arc<SimGrantTable>,
        store: &MemoryStore,
        queue: usize,
        queues: usize,
    ) -> Option<Self> {
        let key = |name: &str| {
            if queues > 1 {
                format!("queue-{queue}/{name}")
            } else {
                name.to_string()
            }
        };
        let tx_ref: GrantRef = store.get(&key("tx-ring-ref"))?.parse().ok()?;
        let rx_ref: GrantRef = store.get(&key("rx-ring-ref"))?.parse().ok()?;
        let tx_ring = BackRing::attach(
            mem.clone(),
            GuestAddress(grants.lookup(tx_ref)?.pfn * PAGE_SIZE as u64),
            TX_SLOT_SIZE,
        );
        let rx_ring = BackRing::attach(
            mem.clone(),
            GuestAddress(grants.lookup(rx_ref)?.pfn * PAGE_SIZE as u64),
            RX_SLOT_SIZE,
        );
        Some(Self {
            tx: TxBackend::new(tx_ring, mem.clone(), grants.clone()),
            rx: RxBackend::new(rx_ring, mem.clone(), grants.clone()),
        })
    }
}

/// Frames of caller memory a `TxHarness` hands out for packets
const CALLER_FRAMES: usize = 1024;
const TX_BUFFERS: usize = 256;

/// A connected, enabled transmitter plus caller memory to send from.
pub struct TxHarness {
    pub transmitter: Transmitter,
    pub mem: Arc<GuestMemoryMmap>,
    pub grants: Arc<SimGrantTable>,
    pub events: Arc<SimEventChannel>,
    pub upstream: Arc<RecordingUpstream>,
    pub ring_ref: GrantRef,
    caller: CallerMemory,
}

impl TxHarness {
    pub fn new(options: TxOptions) -> Self {
        let frames = 1 + TX_BUFFERS + CALLER_FRAMES;
        let mem = Arc::new(create_guest_memory(frames * PAGE_SIZE).expect("guest memory"));
        let ring_pool = FramePool::new(mem.clone(), 0, 1);
        let buffer_pool = FramePool::new(mem.clone(), 1, TX_BUFFERS);
        let caller = CallerMemory::new(mem.clone(), (1 + TX_BUFFERS) as u64, CALLER_FRAMES);

        let grants = Arc::new(SimGrantTable::new(4096));
        let events = Arc::new(SimEventChannel::new(2).expect("eventfd"));
        let upstream = Arc::new(RecordingUpstream::new());
        let transmitter = Transmitter::new(
            0,
            mem.clone(),
            page_cache("tx", buffer_pool, TX_BUFFERS),
            grants.clone(),
            events.clone(),
            upstream.clone(),
        );
        let page = ring_pool.alloc().expect("ring page");
        let ring_ref = transmitter.connect(page, options).expect("connect");
        transmitter.enable().expect("enable");

        Self {
            transmitter,
            mem,
            grants,
            events,
            upstream,
            ring_ref,
            caller,
        }
    }

    /// Packet whose frame sits contiguously in caller memory
    pub fn packet(&self, cookie: u64, frame: &[u8]) -> TxPacket {
        TxPacket::new(cookie, vec![self.caller.place(frame)])
    }

    /// Packet whose frame is cut into `pieces` segments on separate frames
    pub fn scattered_packet(&self, cookie: u64, frame: &[u8], pieces: usize) -> TxPacket {
        TxPacket::new(cookie, self.caller.scatter(frame, pieces))
    }

    pub fn backend(&self) -> TxBackend {
        let ring = BackRing::attach(
            self.mem.clone(),
            granted_address(&self.grants, self.ring_ref),
            TX_SLOT_SIZE,
        );
        TxBackend::new(ring, self.mem.clone(), self.grants.clone())
    }
}

/// Bump allocator over frames of guest memory owned by the "caller" of the
/// transmit path. Wraps around when exhausted.
pub struct CallerMemory {
    mem: Arc<GuestMemoryMmap>,
    base_pfn: u64,
    frames: usize,
    next: Mutex<usize>,
}

impl CallerMemory {
    pub fn new(mem: Arc<GuestMemoryMmap>, base_pfn: u64, frames: usize) -> Self {
        Self {
            mem,
            base_pfn,
            frames,
            next: Mutex::new(0),
        }
    }

    fn reserve(&self, len: usize) -> GuestAddress {
        let needed = len.div_ceil(PAGE_SIZE).max(1);
        let mut next = lock(&self.next);
        if *next + needed > self.frames {
            *next = 0;
        }
        let pfn = self.base_pfn + *next as u64;
        *next += needed;
        GuestAddress(pfn * PAGE_SIZE as u64)
    }

    /// Copy `data` to fresh page-aligned memory.
    pub fn place(&self, data: &[u8]) -> MemorySegment {
        let addr = self.reserve(data.len());
        self.mem.write_slice(data, addr).expect("write caller memory");
        MemorySegment::new(addr, data.len())
    }

    /// Copy `data` in `pieces` runs, each starting on its own frame.
    pub fn scatter(&self, data: &[u8], pieces: usize) -> Vec<MemorySegment> {
        let size = data.len().div_ceil(pieces.max(1)).max(1);
        data.chunks(size).map(|chunk| self.place(chunk)).collect()
    }
}
