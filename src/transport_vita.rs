use crate::buffer_pool::{VitaBufferPool, BUF_POOL_SIZE};
use crate::stats::Stats;
use crate::vita::{self, VitaPacket, VITA_DATA_HEADER_SIZE};
use anyhow::bail;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Depth of the outbound packet queue between the DSP tail and the wire.
pub const SEND_QUEUE_DEPTH: usize = 10;

/// A pool pair in flight toward the socket.
pub type VitaSendItem = (VitaPacket, Vec<u8>);

/// Per-stream packet consumer, invoked by the receive loop. The callback
/// takes over the release obligation for the pair it is handed.
pub type StreamSubscriber = Box<dyn FnMut(VitaPacket, Vec<u8>, &VitaBufferPool) + Send>;

/// UDP side of the radio link: one connected socket carrying VITA IF-data
/// both ways, demultiplexed inbound by stream id, serialized outbound with
/// per-stream packet counters.
pub struct VitaInterface {
    socket: Arc<UdpSocket>,
    pool: Arc<VitaBufferPool>,
    send_tx: mpsc::Sender<VitaSendItem>,
    send_rx: mpsc::Receiver<VitaSendItem>,
    subscribers: HashMap<u32, StreamSubscriber>,
}

impl VitaInterface {
    /// Bind the local VITA endpoint (`SO_REUSEADDR`, non-blocking) and
    /// connect it to the radio's data port.
    pub async fn open(local: SocketAddr, radio: SocketAddr) -> anyhow::Result<Self> {
        let socket = bind_reuseaddr(local)?;
        socket.connect(radio).await?;
        info!(local = %local, radio = %radio, "VITA data socket connected");

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        Ok(Self {
            socket: Arc::new(socket),
            pool: Arc::new(VitaBufferPool::new(BUF_POOL_SIZE)),
            send_tx,
            send_rx,
            subscribers: HashMap::new(),
        })
    }

    /// Shared buffer pool handle for adapters that acquire or release pairs.
    pub fn pool(&self) -> Arc<VitaBufferPool> {
        self.pool.clone()
    }

    /// The bound local endpoint (useful when binding port 0).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Queue feeding the send loop.
    pub fn send_queue(&self) -> mpsc::Sender<VitaSendItem> {
        self.send_tx.clone()
    }

    /// Register the consumer for one stream id. Startup-only; the registry
    /// is moved into the receive loop when `start` is called.
    pub fn subscribe(&mut self, stream_id: u32, subscriber: StreamSubscriber) {
        self.subscribers.insert(stream_id, subscriber);
    }

    /// Spawn the receive and send loops, consuming the interface.
    ///
    /// A receive-side socket error is fatal and lands on `err_tx`; the send
    /// loop terminates on its own errors.
    pub fn start(
        self,
        stats: Arc<Stats>,
        err_tx: mpsc::Sender<anyhow::Error>,
    ) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let VitaInterface {
            socket,
            pool,
            send_tx,
            send_rx,
            subscribers,
            ..
        } = self;
        drop(send_tx);

        let recv_handle = {
            let socket = socket.clone();
            let pool = pool.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                if let Err(e) = vita_recv_loop(socket, pool, subscribers, stats).await {
                    error!(error = %e, "VITA receive loop failed");
                    let _ = err_tx.try_send(e);
                }
            })
        };

        let send_handle = tokio::spawn(async move {
            if let Err(e) = vita_send_loop(socket, pool, send_rx, stats).await {
                error!(error = %e, "VITA send loop failed");
            }
        });

        (recv_handle, send_handle)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Receive loop — demultiplex by stream id
// ═══════════════════════════════════════════════════════════════════════

async fn vita_recv_loop(
    socket: Arc<UdpSocket>,
    pool: Arc<VitaBufferPool>,
    mut subscribers: HashMap<u32, StreamSubscriber>,
    stats: Arc<Stats>,
) -> anyhow::Result<()> {
    debug!("VITA receive loop started");

    let (mut buf, mut pkt) = pool.acquire().await;
    loop {
        let n = socket.recv(&mut buf).await?;
        stats.record_vita_recv(n);

        let parsed = match vita::read_header_stream(&buf[..n]) {
            Some((header, payload_words, header_words))
                if (header_words + payload_words) * 4 <= n =>
            {
                Some((header, payload_words, header_words))
            }
            _ => None,
        };

        let Some((header, payload_words, header_words)) = parsed else {
            // Malformed datagram: keep the pair and read the next one.
            stats.record_parse_error();
            continue;
        };

        match subscribers.get_mut(&header.stream_id) {
            Some(subscriber) => {
                pkt.header = header;
                pkt.payload_off = header_words * 4;
                pkt.payload_len = payload_words * 4;
                // Pair ownership moves to the subscriber; restock.
                subscriber(pkt, buf, &pool);
                let fresh = pool.acquire().await;
                buf = fresh.0;
                pkt = fresh.1;
            }
            None => {
                stats.record_unroutable();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Send loop — per-stream counters, release after transmit
// ═══════════════════════════════════════════════════════════════════════

async fn vita_send_loop(
    socket: Arc<UdpSocket>,
    pool: Arc<VitaBufferPool>,
    mut send_rx: mpsc::Receiver<VitaSendItem>,
    stats: Arc<Stats>,
) -> anyhow::Result<()> {
    debug!("VITA send loop started");

    // 64-bit per stream; only the low nibble reaches the wire.
    let mut counters: HashMap<u32, u64> = HashMap::new();

    while let Some((pkt, mut buf)) = send_rx.recv().await {
        let counter = counters.entry(pkt.header.stream_id).or_insert(0);
        *counter += 1;
        vita::write_header(&pkt.header, *counter, pkt.payload_len / 4, &mut buf);

        let total = VITA_DATA_HEADER_SIZE + pkt.payload_len;
        let sent = socket.send(&buf[..total]).await?;
        if sent != total {
            bail!("short VITA send: {sent} of {total} bytes");
        }
        stats.record_vita_sent(total);
        pool.release(buf, pkt);
    }
    Ok(())
}

/// Bind a UDP socket with `SO_REUSEADDR`, non-blocking, at `addr`.
pub fn bind_reuseaddr(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
