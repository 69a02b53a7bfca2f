use crate::vita::{VitaPacket, MAX_PACKET_LEN};
use tokio::sync::{mpsc, Mutex};
use tracing::error;

/// Pool size used by the VITA transport.
pub const BUF_POOL_SIZE: usize = 100;

/// Fixed pool of paired raw buffers and packet descriptors.
///
/// The two halves live in independent bounded queues so the send path can
/// rewrap a buffer under a different descriptor's header, but a checkout
/// always takes one of each and a release returns one of each. At any
/// moment a lent pair has exactly one owner; handing the pair to a queue
/// transfers ownership, and a pair that is never released shrinks the pool
/// permanently.
pub struct VitaBufferPool {
    buf_tx: mpsc::Sender<Vec<u8>>,
    buf_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    pkt_tx: mpsc::Sender<VitaPacket>,
    pkt_rx: Mutex<mpsc::Receiver<VitaPacket>>,
}

impl VitaBufferPool {
    /// Create a pool seeded with `nbufs` pairs. Queue capacity is 1.5× the
    /// seed count so a release can never block a correct owner.
    pub fn new(nbufs: usize) -> Self {
        let nchancap = nbufs * 3 / 2;
        let (buf_tx, buf_rx) = mpsc::channel(nchancap.max(1));
        let (pkt_tx, pkt_rx) = mpsc::channel(nchancap.max(1));
        for _ in 0..nbufs {
            buf_tx
                .try_send(vec![0u8; MAX_PACKET_LEN])
                .expect("seed fits below queue capacity");
            pkt_tx
                .try_send(VitaPacket::default())
                .expect("seed fits below queue capacity");
        }
        Self {
            buf_tx,
            buf_rx: Mutex::new(buf_rx),
            pkt_tx,
            pkt_rx: Mutex::new(pkt_rx),
        }
    }

    /// Check out a pair, waiting until both a buffer and a descriptor are
    /// free. The caller (or whoever it hands the pair to) must `release`.
    pub async fn acquire(&self) -> (Vec<u8>, VitaPacket) {
        let buf = {
            let mut rx = self.buf_rx.lock().await;
            rx.recv().await.expect("pool keeps its own sender alive")
        };
        let pkt = {
            let mut rx = self.pkt_rx.lock().await;
            rx.recv().await.expect("pool keeps its own sender alive")
        };
        (buf, pkt)
    }

    /// Return a pair to the pool. Never blocks: queue capacity exceeds the
    /// seeded pair count, so Full here means a double release somewhere.
    pub fn release(&self, buf: Vec<u8>, pkt: VitaPacket) {
        if self.buf_tx.try_send(buf).is_err() {
            error!("buffer pool overfull on release, dropping buffer");
        }
        if self.pkt_tx.try_send(pkt).is_err() {
            error!("buffer pool overfull on release, dropping descriptor");
        }
    }
}
