//! Front-end under test plus its simulated backend
//!
//! Configuration goes through a JSON file in a temporary directory so the
//! file loading path is exercised as well.

use std::sync::Arc;

use tempfile::TempDir;
use vm_memory::GuestMemoryMmap;

use mvirt_netfront::host::{BackendState, EventChannel};
use mvirt_netfront::memory::create_guest_memory;
use mvirt_netfront::protocol::{NETIF_RSP_OKAY, PAGE_SIZE};
use mvirt_netfront::test_util::{
    CallerMemory, MemoryStore, RecordingUpstream, SimEventChannel, SimGrantTable, SimQueue,
    TxFrame,
};
use mvirt_netfront::{HostServices, Netfront, NetfrontConfig, RxPacket, TxPacket};

/// Caller frames available to tests for transmit payloads
const CALLER_FRAMES: usize = 512;

pub struct TestFrontend {
    pub netfront: Arc<Netfront>,
    pub mem: Arc<GuestMemoryMmap>,
    pub store: Arc<MemoryStore>,
    pub grants: Arc<SimGrantTable>,
    pub events: Vec<Arc<SimEventChannel>>,
    pub upstream: Arc<RecordingUpstream>,
    caller: CallerMemory,
    _config_dir: TempDir,
}

impl TestFrontend {
    /// Front-end configured from `json` against a backend offering
    /// `backend_queues` queues.
    pub fn new(json: &str, backend_queues: usize) -> Self {
        Self::with_store(json, MemoryStore::with_backend_features(backend_queues))
    }

    pub fn with_store(json: &str, store: MemoryStore) -> Self {
        let config_dir = TempDir::new().expect("Failed to create temp dir");
        let path = config_dir.path().join("netfront.json");
        std::fs::write(&path, json).expect("write config");
        let config = NetfrontConfig::from_file(&path).expect("load config");

        let frontend_frames = config.num_queues * (2 + config.rx_buffers + config.tx_buffers);
        let mem = Arc::new(
            create_guest_memory((frontend_frames + CALLER_FRAMES) * PAGE_SIZE)
                .expect("guest memory"),
        );
        let caller = CallerMemory::new(mem.clone(), frontend_frames as u64, CALLER_FRAMES);

        let store = Arc::new(store);
        let grants = Arc::new(SimGrantTable::new(65536));
        let upstream = Arc::new(RecordingUpstream::new());
        let events: Vec<Arc<SimEventChannel>> = (0..config.num_queues)
            .map(|q| Arc::new(SimEventChannel::new(20 + q as u32).expect("eventfd")))
            .collect();

        let host = HostServices {
            grants: grants.clone(),
            events: events
                .iter()
                .map(|e| e.clone() as Arc<dyn EventChannel>)
                .collect(),
            store: store.clone(),
            upstream: upstream.clone(),
        };
        let netfront = Arc::new(Netfront::new(config, mem.clone(), 0, host).expect("netfront"));

        Self {
            netfront,
            mem,
            store,
            grants,
            events,
            upstream,
            caller,
            _config_dir: config_dir,
        }
    }

    /// Connect and enable, then attach the backend to every active queue.
    pub fn connect(&self) -> Vec<SimQueue> {
        self.netfront.connect().expect("connect");
        self.store.set_backend_state(BackendState::Connected);
        self.netfront.enable().expect("enable");

        let queues = self.netfront.active_queues();
        (0..queues)
            .map(|q| {
                SimQueue::attach(&self.mem, &self.grants, &self.store, q, queues)
                    .expect("queue keys published")
            })
            .collect()
    }

    /// Packet whose frame sits in caller memory
    pub fn packet(&self, cookie: u64, frame: &[u8]) -> TxPacket {
        TxPacket::new(cookie, vec![self.caller.place(frame)])
    }

    pub fn scattered_packet(&self, cookie: u64, frame: &[u8], pieces: usize) -> TxPacket {
        TxPacket::new(cookie, self.caller.scatter(frame, pieces))
    }

    /// Let the backend consume queue `q`'s transmit ring, then poll so the
    /// front-end sees the responses.
    pub fn transmit(&self, q: usize, backend: &mut SimQueue) -> Vec<TxFrame> {
        self.netfront.poll(q).expect("poll");
        let frames = backend.tx.service(NETIF_RSP_OKAY);
        self.netfront.poll(q).expect("poll");
        frames
    }

    /// Deliver `frames` on queue `q`'s receive ring and collect what the
    /// front-end hands upstream.
    pub fn receive(&self, q: usize, backend: &mut SimQueue, frames: &[Vec<u8>]) -> Vec<RxPacket> {
        for frame in frames {
            assert!(backend.rx.send_frame(frame, 0), "receive buffers posted");
        }
        backend.rx.push();
        self.netfront.poll(q).expect("poll");
        self.upstream.take_packets()
    }

    /// Give packets back to queue `q`.
    pub fn give_back(&self, q: usize, packets: Vec<RxPacket>) {
        for packet in packets {
            self.netfront.return_packet(q, packet).expect("return");
        }
    }

    /// Close the backend and tear the front-end down.
    pub fn close(&self) {
        self.store.set_backend_state(BackendState::Closing);
        self.netfront.teardown().expect("teardown");
    }
}
