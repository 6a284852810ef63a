//! Multi-queue network front-end
//!
//! Owns one receiver and one transmitter per queue, negotiates features with
//! the backend through the control-plane store, and drives the rings from
//! interrupts (deferred polls) and the per-queue watchdog.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::cache::{Cache, CacheStats, SpinLock};
use crate::config::{BackendFeatures, NetfrontConfig, format_mac};
use crate::dpc::{Dpc, PollWorker};
use crate::error::{Result, RingError, StoreError};
use crate::host::{BackendState, EventChannel, GrantTable, Store, Upstream};
use crate::lock;
use crate::memory::{FramePool, Page};
use crate::offload::ReceiveOffload;
use crate::protocol::PAGE_SIZE;
use crate::receiver::{Receiver, RxPacket};
use crate::ring::RingState;
use crate::stats::{RxStatistics, TxStatistics};
use crate::transmitter::{ControlRequest, TxOptions, TxPacket, Transmitter};
use crate::watchdog::Watchdog;

/// Collaborators supplied by the host environment
#[derive(Clone)]
pub struct HostServices {
    pub grants: Arc<dyn GrantTable>,
    /// One channel per configured queue
    pub events: Vec<Arc<dyn EventChannel>>,
    pub store: Arc<dyn Store>,
    pub upstream: Arc<dyn Upstream>,
}

/// Statistics for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    pub queue: usize,
    pub rx: RxStatistics,
    pub tx: TxStatistics,
    pub rx_buffers: CacheStatsView,
    pub tx_buffers: CacheStatsView,
}

/// Serializable copy of `CacheStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsView {
    pub population: usize,
    pub allocated: usize,
    pub free: usize,
}

impl From<CacheStats> for CacheStatsView {
    fn from(stats: CacheStats) -> Self {
        Self {
            population: stats.population,
            allocated: stats.allocated,
            free: stats.free,
        }
    }
}

struct Queue {
    index: usize,
    rx: Receiver,
    tx: Transmitter,
    dpc: Dpc,
    events: Arc<dyn EventChannel>,
    /// Two frames for the shared rings
    ring_pool: Arc<FramePool>,
    rx_buffers: Arc<Cache<Page>>,
    tx_buffers: Arc<Cache<Page>>,
}

impl Queue {
    /// Store key for this queue, prefixed when several queues are in use
    fn key(&self, active: usize, name: &str) -> String {
        if active > 1 {
            format!("queue-{}/{name}", self.index)
        } else {
            name.to_string()
        }
    }

    fn ring_page(&self) -> Result<Page> {
        self.ring_pool
            .alloc()
            .ok_or_else(|| RingError::OutOfFrames(format!("queue-{} ring pages", self.index)))
    }
}

#[derive(Default)]
struct Negotiated {
    active: usize,
    features: Option<BackendFeatures>,
    mac: [u8; 6],
    poll_worker: Option<PollWorker>,
    watchdogs: Vec<Watchdog>,
}

/// A network front-end instance.
pub struct Netfront {
    name: String,
    config: NetfrontConfig,
    queues: Vec<Queue>,
    store: Arc<dyn Store>,
    state: Mutex<Negotiated>,
}

fn cache(name: String, pool: Arc<FramePool>, count: usize) -> Arc<Cache<Page>> {
    Arc::new(Cache::new(
        name,
        count,
        move || pool.alloc(),
        drop,
        Arc::new(SpinLock::new()),
    ))
}

impl Netfront {
    /// Build the queues over guest frames starting at `base_pfn`.
    ///
    /// Each queue takes two ring frames plus `rx_buffers + tx_buffers`
    /// buffer frames.
    pub fn new(
        config: NetfrontConfig,
        mem: Arc<GuestMemoryMmap>,
        base_pfn: u64,
        host: HostServices,
    ) -> Result<Self> {
        config.validate()?;
        let name = "netfront".to_string();
        if host.events.len() < config.num_queues {
            return Err(RingError::NoSuchQueue(host.events.len()));
        }

        let per_queue = (2 + config.rx_buffers + config.tx_buffers) as u64;
        let frames = per_queue * config.num_queues as u64;
        let last = GuestAddress((base_pfn + frames) * PAGE_SIZE as u64 - 1);
        if !mem.address_in_range(last) {
            return Err(RingError::OutOfFrames(format!(
                "{name}: {frames} frames from pfn {base_pfn}"
            )));
        }

        let mut queues = Vec::with_capacity(config.num_queues);
        for index in 0..config.num_queues {
            let base = base_pfn + per_queue * index as u64;
            let ring_pool = FramePool::new(mem.clone(), base, 2);
            let rx_pool = FramePool::new(mem.clone(), base + 2, config.rx_buffers);
            let tx_pool = FramePool::new(
                mem.clone(),
                base + 2 + config.rx_buffers as u64,
                config.tx_buffers,
            );
            let rx_buffers = cache(format!("queue-{index}/rx-buffers"), rx_pool, config.rx_buffers);
            let tx_buffers = cache(format!("queue-{index}/tx-buffers"), tx_pool, config.tx_buffers);
            let events = host.events[index].clone();

            queues.push(Queue {
                index,
                rx: Receiver::new(
                    index,
                    rx_buffers.clone(),
                    host.grants.clone(),
                    events.clone(),
                    host.upstream.clone(),
                    config.receive_offload.flags(),
                ),
                tx: Transmitter::new(
                    index,
                    mem.clone(),
                    tx_buffers.clone(),
                    host.grants.clone(),
                    events.clone(),
                    host.upstream.clone(),
                ),
                dpc: Dpc::new(index),
                events,
                ring_pool,
                rx_buffers,
                tx_buffers,
            });
        }

        debug!(netfront = %name, queues = queues.len(), frames, "Front-end created");
        Ok(Self {
            name,
            config,
            queues,
            store: host.store,
            state: Mutex::new(Negotiated::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues in use after negotiation (0 before `connect`)
    pub fn active_queues(&self) -> usize {
        lock(&self.state).active
    }

    pub fn mac(&self) -> [u8; 6] {
        lock(&self.state).mac
    }

    pub fn features(&self) -> Option<BackendFeatures> {
        lock(&self.state).features
    }

    /// `(rx, tx)` ring states of queue `q`
    pub fn ring_states(&self, q: usize) -> Result<(RingState, RingState)> {
        let queue = self.queue(q)?;
        Ok((queue.rx.state(), queue.tx.state()))
    }

    fn queue(&self, q: usize) -> Result<&Queue> {
        self.queues.get(q).ok_or(RingError::NoSuchQueue(q))
    }

    fn active(&self) -> &[Queue] {
        let active = self.active_queues();
        &self.queues[..active.min(self.queues.len())]
    }

    /// Negotiate with the backend, set up every ring and publish the
    /// front-end's keys.
    pub fn connect(&self) -> Result<()> {
        let features = BackendFeatures::read(self.store.as_ref())?;
        let active = self.config.num_queues.min(features.max_queues).max(1);
        let mac = match self.config.mac_address()? {
            Some(mac) => mac,
            None => features
                .mac
                .ok_or_else(|| StoreError::NotFound("mac".to_string()))?,
        };

        let options = TxOptions {
            backend_domain: self.config.backend_domain,
            calculate_checksums: self.config.calculate_checksums || features.no_csum_offload,
            always_copy: self.config.always_copy,
            ipv4_csum_offload: !features.no_csum_offload,
            ipv6_csum_offload: features.ipv6_csum_offload,
            gso_tcpv4: features.sg && features.gso_tcpv4 && !self.config.disable_ipv4_gso,
            gso_tcpv6: features.sg && features.gso_tcpv6 && !self.config.disable_ipv6_gso,
            multicast_control: features.multicast_control
                && !self.config.disable_multicast_control,
            hash: self.config.transmit_hash && features.ctrl_ring,
            mac,
        };

        for queue in &self.queues[..active] {
            let tx_ref = queue.tx.connect(queue.ring_page()?, options.clone())?;
            let rx_ref = queue.rx.connect(queue.ring_page()?, self.config.backend_domain)?;
            self.write(&queue.key(active, "tx-ring-ref"), &tx_ref.to_string())?;
            self.write(&queue.key(active, "rx-ring-ref"), &rx_ref.to_string())?;
            self.write(
                &queue.key(active, "event-channel"),
                &queue.events.port().to_string(),
            )?;
        }

        let flag = |on: bool| if on { "1" } else { "0" };
        self.write("request-rx-copy", "1")?;
        self.write("feature-rx-notify", "1")?;
        self.write("feature-sg", "1")?;
        self.write("feature-gso-tcpv4", flag(!self.config.disable_ipv4_gso))?;
        self.write("feature-gso-tcpv6", flag(!self.config.disable_ipv6_gso))?;
        self.write("feature-no-csum-offload", "0")?;
        self.write("feature-ipv6-csum-offload", "1")?;
        self.write("request-multicast-control", flag(options.multicast_control))?;
        self.write("multi-queue-num-queues", &active.to_string())?;

        let mut st = lock(&self.state);
        st.active = active;
        st.features = Some(features);
        st.mac = mac;
        info!(
            netfront = %self.name,
            queues = active,
            mac = %format_mac(&mac),
            gso_tcpv4 = options.gso_tcpv4,
            gso_tcpv6 = options.gso_tcpv6,
            "Front-end connected"
        );
        Ok(())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.store.write(key, value)?;
        Ok(())
    }

    /// Start both rings of every active queue and unmask their events.
    pub fn enable(&self) -> Result<()> {
        for queue in self.active() {
            queue.rx.enable()?;
            queue.tx.enable()?;
            if queue.events.unmask() {
                queue.dpc.schedule();
            }
        }
        debug!(netfront = %self.name, "Front-end enabled");
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        for queue in self.active() {
            queue.rx.disable()?;
            queue.tx.disable()?;
        }
        debug!(netfront = %self.name, "Front-end disabled");
        Ok(())
    }

    /// Reclaim everything shared with the backend and remove the keys.
    ///
    /// The backend must have left `Connected`; outstanding transmit requests
    /// are then answered with fabricated `Dropped` responses. Running rings
    /// are disabled first.
    pub fn disconnect(&self) -> Result<()> {
        let backend = self.store.backend_state();
        if backend == BackendState::Connected {
            return Err(RingError::InvalidState {
                ring: self.name.clone(),
                state: "backend connected",
            });
        }

        let active = self.active_queues();
        let mut result = Ok(());
        for queue in &self.queues[..active] {
            if matches!(queue.rx.state(), RingState::Enabled | RingState::Stopped) {
                queue.rx.disable()?;
            }
            for ring_result in [queue.tx.disconnect(backend), queue.rx.disconnect()] {
                if let Err(e) = ring_result {
                    error!(netfront = %self.name, queue = queue.index, error = %e, "Ring not disconnected cleanly");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            for name in ["tx-ring-ref", "rx-ring-ref", "event-channel"] {
                self.store.remove(&queue.key(active, name))?;
            }
        }
        self.store.remove("multi-queue-num-queues")?;

        lock(&self.state).active = 0;
        debug!(netfront = %self.name, %backend, "Front-end disconnected");
        result
    }

    /// Stop the workers, disconnect and release every cached buffer.
    pub fn teardown(&self) -> Result<()> {
        self.stop();
        let result = if self.active_queues() > 0 {
            if let Err(e) = self.disable() {
                warn!(netfront = %self.name, error = %e, "Disable before teardown failed");
            }
            self.disconnect()
        } else {
            Ok(())
        };

        let mut released = 0;
        for queue in &self.queues {
            released += queue.rx_buffers.drain(false);
            released += queue.tx_buffers.drain(false);
        }
        debug!(netfront = %self.name, released, "Front-end torn down");
        result
    }

    /// Event channel upcall for queue `q`.
    pub fn interrupt(&self, q: usize) -> Result<bool> {
        Ok(self.queue(q)?.dpc.schedule())
    }

    /// Service both rings of queue `q`.
    pub fn poll(&self, q: usize) -> Result<()> {
        let queue = self.queue(q)?;
        let rx = queue.rx.poll();
        let tx = queue.tx.service();
        rx.and(tx)
    }

    /// Run every scheduled poll on the calling thread; returns how many ran.
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        for queue in self.active() {
            if queue.dpc.take() {
                if let Err(e) = self.poll(queue.index) {
                    warn!(netfront = %self.name, queue = queue.index, error = %e, "Deferred poll failed");
                }
                ran += 1;
            }
        }
        ran
    }

    /// Start the poll worker and one watchdog per active queue.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let worker = PollWorker::spawn(&self.name, move |q| {
            let Some(netfront) = weak.upgrade() else {
                return;
            };
            if netfront.queues.get(q).is_some_and(|queue| queue.dpc.take()) {
                if let Err(e) = netfront.poll(q) {
                    warn!(netfront = %netfront.name, queue = q, error = %e, "Poll failed");
                }
            }
        })?;

        let interval = Duration::from_millis(self.config.watchdog_interval_ms);
        let mut watchdogs = Vec::new();
        for queue in self.active() {
            queue.dpc.attach(worker.sender());
            let weak = Arc::downgrade(self);
            let q = queue.index;
            watchdogs.push(Watchdog::spawn(
                &format!("{}-q{q}", self.name),
                interval,
                move || {
                    let Some(netfront) = weak.upgrade() else {
                        return;
                    };
                    if let Some(queue) = netfront.queues.get(q) {
                        if queue.tx.watchdog_tick() {
                            queue.dpc.schedule();
                        }
                    }
                },
            )?);
        }

        let mut st = lock(&self.state);
        st.poll_worker = Some(worker);
        st.watchdogs = watchdogs;
        Ok(())
    }

    /// Stop the poll worker and watchdogs. Scheduled polls stay pending for
    /// `run_deferred`.
    pub fn stop(&self) {
        for queue in &self.queues {
            queue.dpc.detach();
        }
        let (worker, watchdogs) = {
            let mut st = lock(&self.state);
            (st.poll_worker.take(), std::mem::take(&mut st.watchdogs))
        };
        for watchdog in watchdogs {
            if let Err(e) = watchdog.join() {
                error!(netfront = %self.name, error = %e, "Watchdog join failed");
            }
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.join() {
                error!(netfront = %self.name, error = %e, "Poll worker join failed");
            }
        }
    }

    /// Submit a packet on queue `q`. Never blocks.
    pub fn queue_packet(&self, q: usize, packet: TxPacket) -> Result<()> {
        self.queue(q)?.tx.queue_packet(packet)
    }

    /// Announce `ip` with a gratuitous ARP on the first queue.
    pub fn queue_arp(&self, ip: Ipv4Addr) -> Result<()> {
        self.queue(0)?.tx.queue_control(ControlRequest::Arp(ip))
    }

    /// Announce `ip` with an unsolicited neighbour advertisement.
    pub fn queue_neighbour_advertisement(&self, ip: Ipv6Addr) -> Result<()> {
        self.queue(0)?
            .tx
            .queue_control(ControlRequest::NeighbourAdvertisement(ip))
    }

    /// Ask the backend to add or remove a multicast address filter.
    pub fn queue_multicast_control(&self, add: bool, mac: [u8; 6]) -> Result<()> {
        self.queue(0)?
            .tx
            .queue_control(ControlRequest::Multicast { add, mac })
    }

    /// Give a delivered packet back to queue `q`.
    pub fn return_packet(&self, q: usize, packet: RxPacket) -> Result<()> {
        self.queue(q)?.rx.return_packet(packet);
        Ok(())
    }

    pub fn set_receive_offload(&self, offload: ReceiveOffload) {
        for queue in &self.queues {
            queue.rx.set_offload_options(offload);
        }
    }

    pub fn statistics(&self) -> Vec<QueueStatistics> {
        self.queues
            .iter()
            .map(|queue| QueueStatistics {
                queue: queue.index,
                rx: queue.rx.statistics(),
                tx: queue.tx.statistics(),
                rx_buffers: queue.rx_buffers.stats().into(),
                tx_buffers: queue.tx_buffers.stats().into(),
            })
            .collect()
    }
}

impl Drop for Netfront {
    fn drop(&mut self) {
        let st = lock(&self.state);
        if st.active > 0 {
            warn!(netfront = %self.name, "Front-end dropped while connected");
        }
    }
}
