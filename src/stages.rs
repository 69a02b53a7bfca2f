/// Stream-processing stages.
///
/// A stage is a task that consumes a bounded channel of f32 chunks and
/// produces into another. Channel closure is the shutdown token: when a
/// stage reads `None` it drops its own sender, which walks the shutdown
/// down the rest of the chain. Between the channels and the buffer pool
/// there is no shared mutable state.
use crate::buffer_pool::VitaBufferPool;
use crate::stats::Stats;
use crate::transport_vita::{StreamSubscriber, VitaSendItem};
use crate::vita::{self, VitaHeader};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Capacity of the chunk channels linking stages.
pub const STAGE_QUEUE_DEPTH: usize = 2;

// ═══════════════════════════════════════════════════════════════════════
//  VITA adapters — pipeline head and tail
// ═══════════════════════════════════════════════════════════════════════

/// Build the subscriber that heads a receive chain: decode float samples,
/// release the pool pair, forward the chunk. The forward is non-blocking
/// so a stalled chain sheds load here instead of wedging the receive loop.
pub fn vita_input_subscriber(
    chunk_tx: mpsc::Sender<Vec<f32>>,
    stats: Arc<Stats>,
) -> StreamSubscriber {
    Box::new(move |pkt: vita::VitaPacket, buf: Vec<u8>, pool: &VitaBufferPool| {
        let samps = vita::vita_to_float(pkt.payload(&buf));
        pool.release(buf, pkt);
        if chunk_tx.try_send(samps).is_err() {
            stats.record_channel_drop();
        }
    })
}

/// Tail stage: frame chunks into outbound VITA packets under a fixed
/// header template (stream id and class ids decided at wiring time) and
/// feed them to the send loop, which releases each pair after transmit.
pub async fn vita_output_stage(
    mut rx: mpsc::Receiver<Vec<f32>>,
    send_tx: mpsc::Sender<VitaSendItem>,
    pool: Arc<VitaBufferPool>,
    template: VitaHeader,
) {
    while let Some(chunk) = rx.recv().await {
        let mut off = 0;
        while off < chunk.len() {
            let (mut buf, mut pkt) = pool.acquire().await;
            pkt.header = template;
            off += vita::float_to_vita_frame(&mut pkt, &mut buf, &chunk[off..]);
            if let Err(mpsc::error::SendError((pkt, buf))) = send_tx.send((pkt, buf)).await {
                pool.release(buf, pkt);
                return;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Rebucketing and observability
// ═══════════════════════════════════════════════════════════════════════

/// Repackage arbitrary-size chunks into exactly-`naccum` buckets. Excess
/// input spans into the next bucket; a partial bucket at shutdown is
/// dropped with the stage.
pub async fn accumulator_stage(
    mut rx: mpsc::Receiver<Vec<f32>>,
    tx: mpsc::Sender<Vec<f32>>,
    naccum: usize,
) {
    let mut accumulator = vec![0.0f32; naccum];
    let mut fill = 0;
    while let Some(chunk) = rx.recv().await {
        let mut input = &chunk[..];
        while !input.is_empty() {
            let n = (naccum - fill).min(input.len());
            accumulator[fill..fill + n].copy_from_slice(&input[..n]);
            fill += n;
            input = &input[n..];
            if fill == naccum {
                let full = std::mem::replace(&mut accumulator, vec![0.0f32; naccum]);
                if tx.send(full).await.is_err() {
                    return;
                }
                fill = 0;
            }
        }
    }
}

/// Pass-through sample counter. Logs `<name>: <count> samples, <rate>
/// samples/s` every `interval` and resets; never alters the data.
pub async fn rate_counter_stage(
    mut rx: mpsc::Receiver<Vec<f32>>,
    tx: mpsc::Sender<Vec<f32>>,
    name: String,
    interval: Duration,
) {
    let mut count: u64 = 0;
    let mut start = Instant::now();
    let mut last_print = Instant::now();
    while let Some(chunk) = rx.recv().await {
        count += chunk.len() as u64;
        if tx.send(chunk).await.is_err() {
            return;
        }
        if interval > Duration::ZERO && last_print.elapsed() > interval {
            let rate = count as f64 / start.elapsed().as_secs_f64();
            info!("{}: {} samples, {:.1} samples/s", name, count, rate);
            last_print = Instant::now();
            start = last_print;
            count = 0;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Delatentizer — zero-pad the return leg to absorb rate drift
// ═══════════════════════════════════════════════════════════════════════

/// Spawn the paired drift-correction stages.
///
/// The input track (`i1 → o1`) forwards chunks untouched and posts each
/// chunk's length on a private count queue. The output track (`i2 → o2`)
/// accumulates those counts into a running displacement and subtracts
/// every chunk it forwards; once the displacement exceeds `maxdisp`
/// samples it emits one zero-filled chunk of that size so the downstream
/// consumer catches back up.
pub fn spawn_delatentizer(
    mut i1: mpsc::Receiver<Vec<f32>>,
    o1: mpsc::Sender<Vec<f32>>,
    mut i2: mpsc::Receiver<Vec<f32>>,
    o2: mpsc::Sender<Vec<f32>>,
    maxdisp: usize,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let (disp_tx, mut disp_rx) = mpsc::channel::<usize>(10);

    let input_track = tokio::spawn(async move {
        while let Some(chunk) = i1.recv().await {
            if disp_tx.send(chunk.len()).await.is_err() {
                return;
            }
            if o1.send(chunk).await.is_err() {
                return;
            }
        }
    });

    let output_track = tokio::spawn(async move {
        let mut rundisp: i64 = 0;
        let mut drift_log = tokio::time::interval(Duration::from_secs(1));
        drift_log.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(count) = disp_rx.recv() => {
                    rundisp += count as i64;
                    if rundisp > maxdisp as i64 {
                        info!(samples = rundisp, "correcting displacement with zero fill");
                        if o2.send(vec![0.0f32; rundisp as usize]).await.is_err() {
                            return;
                        }
                        rundisp = 0;
                    }
                }
                chunk = i2.recv() => {
                    match chunk {
                        Some(chunk) => {
                            rundisp -= chunk.len() as i64;
                            if o2.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = drift_log.tick() => {
                    debug!(displacement = rundisp, "delatentizer drift");
                }
            }
        }
    });

    (input_track, output_track)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
