use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use mvirt_netfront::host::{BackendState, EventChannel};
use mvirt_netfront::memory::create_guest_memory;
use mvirt_netfront::offload::OffloadFlags;
use mvirt_netfront::protocol::{NETIF_RSP_OKAY, NETRXF_DATA_VALIDATED, PAGE_SIZE};
use mvirt_netfront::test_util::packets::{self, TCP_IPV4_HEADERS};
use mvirt_netfront::test_util::{
    CallerMemory, MemoryStore, RecordingUpstream, SimEventChannel, SimGrantTable, SimQueue,
};
use mvirt_netfront::transmitter::TxStatus;
use mvirt_netfront::{HostServices, Netfront, NetfrontConfig, TxPacket};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Packets in flight per round
const BATCH: usize = 32;

/// Frames of caller memory the self-test sends from: a full batch of
/// maximum-size frames
const CALLER_FRAMES: usize = BATCH * 17;

const GRANT_LIMIT: usize = 65536;

/// Largest TCP payload that fits a 64 KiB frame
const MAX_PAYLOAD: usize = 65535 - TCP_IPV4_HEADERS;

#[derive(Parser)]
#[command(name = "mvirt-netfront")]
#[command(about = "Paravirtual network front-end loopback self-test")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queues to request (overrides the configuration)
    #[arg(short, long)]
    queues: Option<usize>,

    /// Packets to send per queue
    #[arg(short = 'n', long, default_value_t = 256)]
    packets: usize,

    /// TCP payload bytes per packet
    #[arg(short, long, default_value_t = 1024)]
    payload: usize,

    /// Request segmentation offload with this MSS
    #[arg(long)]
    mss: Option<u16>,

    /// Print per-queue statistics as JSON when done
    #[arg(long)]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mvirt_netfront=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NetfrontConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NetfrontConfig::default(),
    };
    if let Some(queues) = args.queues {
        config.num_queues = queues;
    }
    config.validate()?;
    if args.payload > MAX_PAYLOAD {
        bail!("payload must be at most {MAX_PAYLOAD} bytes");
    }

    let frontend_frames = config.num_queues * (2 + config.rx_buffers + config.tx_buffers);
    let mem = Arc::new(create_guest_memory(
        (frontend_frames + CALLER_FRAMES) * PAGE_SIZE,
    )?);
    let caller = CallerMemory::new(mem.clone(), frontend_frames as u64, CALLER_FRAMES);

    let store = Arc::new(MemoryStore::with_backend_features(config.num_queues));
    let grants = Arc::new(SimGrantTable::new(GRANT_LIMIT));
    let upstream = Arc::new(RecordingUpstream::new());
    let mut events: Vec<Arc<dyn EventChannel>> = Vec::new();
    for q in 0..config.num_queues {
        events.push(Arc::new(SimEventChannel::new(q as u32 + 1)?));
    }

    let host = HostServices {
        grants: grants.clone(),
        events,
        store: store.clone(),
        upstream: upstream.clone(),
    };
    let netfront = Netfront::new(config, mem.clone(), 0, host)?;
    netfront.connect()?;
    store.set_backend_state(BackendState::Connected);
    netfront.enable()?;

    let queues = netfront.active_queues();
    info!(queues, packets = args.packets, payload = args.payload, mss = ?args.mss, "Running loopback");

    let mut cookie = 0u64;
    for q in 0..queues {
        let mut backend = SimQueue::attach(&mem, &grants, &store, q, queues)
            .with_context(|| format!("queue {q} keys not published"))?;
        let mut sent = 0;
        let mut received = 0;

        while sent < args.packets {
            let batch = BATCH.min(args.packets - sent);
            for i in 0..batch {
                let payload = packets::pattern(args.payload, (sent + i) as u8);
                let frame = packets::tcp_ipv4_frame(&payload, (sent + i) as u32, cookie as u16);
                let mut packet = TxPacket::new(cookie, vec![caller.place(&frame)]);
                if let Some(mss) = args.mss
                    && args.payload > mss as usize
                {
                    packet.offload.flags = OffloadFlags::IPV4_LARGE_PACKET;
                    packet.offload.mss = mss;
                }
                netfront.queue_packet(q, packet)?;
                cookie += 1;
            }
            netfront.poll(q)?;

            let mut frames = 0;
            let mut looped = 0;
            // Packets beyond the ring's capacity are posted as responses free slots
            while backend.tx.pending() > 0 {
                for frame in backend.tx.service(NETIF_RSP_OKAY) {
                    frames += 1;
                    for segment in frame.segments() {
                        if !backend.rx.send_frame(&segment, NETRXF_DATA_VALIDATED) {
                            backend.rx.push();
                            received += receive(&netfront, &upstream, q)?;
                            if !backend.rx.send_frame(&segment, NETRXF_DATA_VALIDATED) {
                                bail!("queue {q}: receive ring ran out of buffers");
                            }
                        }
                        looped += 1;
                    }
                }
                backend.rx.push();
                received += receive(&netfront, &upstream, q)?;
            }

            let completions = upstream.take_completions();
            if completions.len() != batch {
                bail!("queue {q}: {} of {batch} packets completed", completions.len());
            }
            if let Some(failed) = completions.iter().find(|c| c.status != TxStatus::Ok) {
                bail!("queue {q}: packet {} completed with {:?}", failed.cookie, failed.status);
            }
            debug!(queue = q, frames, looped, "Round done");
            sent += batch;
        }
        info!(queue = q, sent, received, "Queue done");
    }

    if args.stats {
        println!("{}", serde_json::to_string_pretty(&netfront.statistics())?);
    }

    store.set_backend_state(BackendState::Closing);
    netfront.teardown()?;
    if grants.active() != 0 {
        bail!("{} grants still active after teardown", grants.active());
    }
    info!("Loopback complete");
    Ok(())
}

/// Poll queue `q` and hand every delivered packet straight back.
fn receive(netfront: &Netfront, upstream: &RecordingUpstream, q: usize) -> anyhow::Result<usize> {
    netfront.poll(q)?;
    let mut received = 0;
    for packet in upstream.take_packets() {
        if packet.is_empty() {
            bail!("queue {q}: empty packet delivered");
        }
        received += 1;
        netfront.return_packet(q, packet)?;
    }
    if received > 0 {
        // Repost the returned buffers
        netfront.poll(q)?;
    }
    Ok(received)
}
