use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Lock-free transport counters
#[derive(Debug)]
pub struct Stats {
    pub vita_packets_received: AtomicU64,
    pub vita_bytes_received: AtomicU64,
    pub vita_packets_sent: AtomicU64,
    pub vita_bytes_sent: AtomicU64,
    pub parse_errors: AtomicU64,
    pub unroutable_packets: AtomicU64,
    pub channel_drops: AtomicU64,
    pub cmd_timeouts: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vita_packets_received: AtomicU64::new(0),
            vita_bytes_received: AtomicU64::new(0),
            vita_packets_sent: AtomicU64::new(0),
            vita_bytes_sent: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            unroutable_packets: AtomicU64::new(0),
            channel_drops: AtomicU64::new(0),
            cmd_timeouts: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_vita_recv(&self, bytes: usize) {
        self.vita_packets_received.fetch_add(1, Ordering::Relaxed);
        self.vita_bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_vita_sent(&self, bytes: usize) {
        self.vita_packets_sent.fetch_add(1, Ordering::Relaxed);
        self.vita_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_unroutable(&self) {
        self.unroutable_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_channel_drop(&self) {
        self.channel_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_cmd_timeout(&self) {
        self.cmd_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let rx_pkts = self.vita_packets_received.swap(0, Ordering::Relaxed);
        let rx_bytes = self.vita_bytes_received.swap(0, Ordering::Relaxed);
        let tx_pkts = self.vita_packets_sent.swap(0, Ordering::Relaxed);
        let tx_bytes = self.vita_bytes_sent.swap(0, Ordering::Relaxed);
        let parse_err = self.parse_errors.swap(0, Ordering::Relaxed);
        let unroutable = self.unroutable_packets.swap(0, Ordering::Relaxed);
        let drops = self.channel_drops.swap(0, Ordering::Relaxed);
        let timeouts = self.cmd_timeouts.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            rx_pps: (rx_pkts as f64) / secs,
            rx_kbps: ((rx_bytes as f64) * 8.0) / (secs * 1000.0),
            tx_pps: (tx_pkts as f64) / secs,
            tx_kbps: ((tx_bytes as f64) * 8.0) / (secs * 1000.0),
            parse_errors: parse_err,
            unroutable_packets: unroutable,
            channel_drops: drops,
            cmd_timeouts: timeouts,
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub rx_pps: f64,
    pub rx_kbps: f64,
    pub tx_pps: f64,
    pub tx_kbps: f64,
    pub parse_errors: u64,
    pub unroutable_packets: u64,
    pub channel_drops: u64,
    pub cmd_timeouts: u64,
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled — park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        info!(
            "[STATS] VITA rx: {:.0} pps, {:.1} kbps | tx: {:.0} pps, {:.1} kbps | errors: parse={} unroutable={} drops={} cmd_timeouts={}",
            snap.rx_pps,
            snap.rx_kbps,
            snap.tx_pps,
            snap.tx_kbps,
            snap.parse_errors,
            snap.unroutable_packets,
            snap.channel_drops,
            snap.cmd_timeouts
        );
    }
}
