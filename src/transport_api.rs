/// SmartSDR TCP command/status engine.
///
/// The radio speaks LF-terminated ASCII lines on port 4992; the first
/// character selects the line kind:
///
/// ```text
/// ┌────────┬──────────────────────────────┬─────────────────────────────┐
/// │ Prefix │ Payload                      │ Meaning                     │
/// │ V      │ maj.min.devA.devB            │ radio software version      │
/// │ H      │ hex u32                      │ our session handle          │
/// │ R      │ seq|hex-status[|text]        │ response to our command     │
/// │ C      │ seq|cmd args...              │ command from the radio      │
/// │ S      │ hex-handle|text              │ status broadcast            │
/// └────────┴──────────────────────────────┴─────────────────────────────┘
/// ```
///
/// A single driver loop multiplexes reader lines, outbound submissions
/// and quit; it is the only owner of the sequence counter and the
/// in-flight map, so neither needs a lock. Outbound commands go out as
/// `C<seq>|<cmd>\n` and the matching `R<seq>|…` completes the waiter's
/// oneshot slot; a waiter that timed out simply dropped its receiver and
/// the late delivery falls on the floor.
use crate::stats::Stats;
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, error};

/// Status the radio expects for a command nobody registered.
pub const STATUS_UNKNOWN_COMMAND: u32 = 0x5000_0015;

/// Interval between liveness pings.
const PING_INTERVAL: Duration = Duration::from_secs(2);
/// Soft deadline on a ping response; late ones are discarded anyway.
const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Radio software version, sent once as a `V` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlexVersion {
    pub major: u32,
    pub minor: u32,
    pub dev_a: u32,
    pub dev_b: u32,
}

impl fmt::Display for FlexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.dev_a, self.dev_b)
    }
}

/// Handler for a command the radio sends us; returns `(response, status)`.
pub type CommandHandler = Box<dyn FnMut(&[&str]) -> (String, u32) + Send>;

/// Handler for status broadcasts; receives the originating handle and text.
pub type StatusHandler = Box<dyn FnMut(u32, &str) + Send>;

/// An outbound command waiting for its sequence-matched response.
struct InflightCmd {
    text: String,
    resp_tx: oneshot::Sender<(String, u32)>,
}

/// Pre-session configuration: handler registries are append-only here and
/// move into the driver loop at `start`.
pub struct ApiInterface {
    cmd_handlers: HashMap<String, CommandHandler>,
    status_handlers: Vec<(String, StatusHandler)>,
}

impl Default for ApiInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiInterface {
    pub fn new() -> Self {
        Self {
            cmd_handlers: HashMap::new(),
            status_handlers: Vec::new(),
        }
    }

    /// Register the handler for one inbound command name (exact match on
    /// the first whitespace token).
    pub fn register_command_handler(&mut self, cmd: impl Into<String>, handler: CommandHandler) {
        self.cmd_handlers.insert(cmd.into(), handler);
    }

    /// Register a status handler. Handlers run in registration order for
    /// every status line whose text starts with `prefix` (the empty prefix
    /// matches everything).
    pub fn register_status_handler(&mut self, prefix: impl Into<String>, handler: StatusHandler) {
        self.status_handlers.push((prefix.into(), handler));
    }

    /// Spawn the reader task and driver loop over `stream`. Loop-fatal
    /// errors are reported once on `err_tx`.
    pub fn start<S>(
        self,
        stream: S,
        stats: Arc<Stats>,
        err_tx: mpsc::Sender<anyhow::Error>,
    ) -> ApiHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (line_tx, line_rx) = mpsc::channel::<anyhow::Result<String>>(8);
        let (cmd_tx, cmd_rx) = mpsc::channel::<InflightCmd>(1);
        let (quit_tx, quit_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = line_tx.send(Err(anyhow!("TCP socket closed"))).await;
                        return;
                    }
                    Ok(_) => {
                        let stripped = line.strip_suffix('\n').unwrap_or(&line).to_string();
                        if line_tx.send(Ok(stripped)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = line_tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });

        let version = Arc::new(RwLock::new(FlexVersion::default()));
        let handle = Arc::new(RwLock::new(0u32));

        {
            let version = version.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut driver = Driver {
                    writer,
                    cmd_seq: 10,
                    inflight: HashMap::new(),
                    cmd_handlers: self.cmd_handlers,
                    status_handlers: self.status_handlers,
                    version,
                    handle,
                };
                if let Err(e) = driver.run(line_rx, cmd_rx, quit_rx).await {
                    error!(error = %e, "command engine terminated");
                    let _ = err_tx.try_send(e);
                }
            });
        }

        ApiHandle {
            cmd_tx,
            quit_tx,
            version,
            handle,
            stats,
        }
    }
}

/// Cloneable submission surface for a running engine.
#[derive(Clone)]
pub struct ApiHandle {
    cmd_tx: mpsc::Sender<InflightCmd>,
    quit_tx: mpsc::Sender<()>,
    version: Arc<RwLock<FlexVersion>>,
    handle: Arc<RwLock<u32>>,
    stats: Arc<Stats>,
}

impl ApiHandle {
    /// Submit a command and await `(response, status)` or the timeout.
    /// A late response is dropped by the engine once the wait is over.
    pub async fn do_command(&self, command: &str, timeout: Duration) -> anyhow::Result<(String, u32)> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .try_send(InflightCmd {
                text: command.to_string(),
                resp_tx,
            })
            .map_err(|_| anyhow!("do_command: engine loop not running"))?;
        match tokio::time::timeout(timeout, resp_rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => bail!("do_command: engine closed before responding"),
            Err(_) => {
                self.stats.record_cmd_timeout();
                bail!("do_command: timeout waiting for response to {command:?}")
            }
        }
    }

    /// Fire-and-callback variant: the callback runs on response arrival,
    /// or never if the timeout wins first.
    pub fn send_command<F>(&self, command: &str, timeout: Duration, callback: F)
    where
        F: FnOnce(String, u32) + Send + 'static,
    {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .try_send(InflightCmd {
                text: command.to_string(),
                resp_tx,
            })
            .is_err()
        {
            return;
        }
        let stats = self.stats.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, resp_rx).await {
                Ok(Ok((text, status))) => callback(text, status),
                Ok(Err(_)) => {}
                Err(_) => stats.record_cmd_timeout(),
            }
        });
    }

    /// Latest `V`-line version; zero until the radio sends one.
    pub async fn version(&self) -> FlexVersion {
        *self.version.read().await
    }

    /// Latest `H`-line session handle; zero until the radio sends one.
    pub async fn radio_handle(&self) -> u32 {
        *self.handle.read().await
    }

    /// True once the driver loop has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Ask the driver loop to exit. Non-blocking; idempotent.
    pub fn close(&self) {
        let _ = self.quit_tx.try_send(());
    }
}

/// Periodic liveness ping; responses are discarded. Exits once the engine
/// is gone.
pub fn spawn_ping(api: ApiHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        loop {
            if api.is_closed() {
                return;
            }
            let ms = start.elapsed().as_secs_f64() * 1000.0;
            api.send_command(&format!("ping ms_timestamp={ms:.3}"), PING_TIMEOUT, |_, _| {});
            tokio::time::sleep(PING_INTERVAL).await;
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver loop
// ═══════════════════════════════════════════════════════════════════════

struct Driver<W> {
    writer: W,
    cmd_seq: u32,
    inflight: HashMap<u32, InflightCmd>,
    cmd_handlers: HashMap<String, CommandHandler>,
    status_handlers: Vec<(String, StatusHandler)>,
    version: Arc<RwLock<FlexVersion>>,
    handle: Arc<RwLock<u32>>,
}

impl<W: AsyncWrite + Unpin> Driver<W> {
    async fn run(
        &mut self,
        mut line_rx: mpsc::Receiver<anyhow::Result<String>>,
        mut cmd_rx: mpsc::Receiver<InflightCmd>,
        mut quit_rx: mpsc::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = quit_rx.recv() => return Ok(()),
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    self.cmd_seq += 1;
                    let wire = format!("C{}|{}\n", self.cmd_seq, cmd.text);
                    self.writer.write_all(wire.as_bytes()).await?;
                    self.inflight.insert(self.cmd_seq, cmd);
                }
                line = line_rx.recv() => {
                    match line {
                        Some(Ok(line)) => self.handle_line(&line).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(kind) = line.bytes().next() else {
            return Ok(());
        };
        let rest = line.get(1..).unwrap_or("");
        match kind {
            b'V' => {
                let segs: Vec<&str> = rest.split('.').collect();
                if segs.len() >= 4 {
                    *self.version.write().await = FlexVersion {
                        major: segs[0].parse().unwrap_or(0),
                        minor: segs[1].parse().unwrap_or(0),
                        dev_a: segs[2].parse().unwrap_or(0),
                        dev_b: segs[3].parse().unwrap_or(0),
                    };
                }
            }
            b'H' => {
                if let Ok(handle) = u32::from_str_radix(rest, 16) {
                    *self.handle.write().await = handle;
                }
            }
            b'R' => self.handle_response(rest),
            b'C' => self.handle_command(rest).await?,
            b'S' => self.handle_status(rest),
            other => debug!(kind = %(other as char), "unhandled line kind"),
        }
        Ok(())
    }

    /// `R<seq>|<hex-status>[|<text>]` — complete the matching in-flight
    /// command. Delivery into the oneshot is non-blocking; if the waiter
    /// already timed out the response is dropped.
    fn handle_response(&mut self, rest: &str) {
        let mut segs = rest.splitn(3, '|');
        let (Some(seq_str), Some(status_str)) = (segs.next(), segs.next()) else {
            return;
        };
        let Ok(seq) = seq_str.parse::<u32>() else {
            return;
        };
        let status = u32::from_str_radix(status_str, 16).unwrap_or(0);
        let text = segs.next().unwrap_or("").to_string();
        if let Some(cmd) = self.inflight.remove(&seq) {
            let _ = cmd.resp_tx.send((text, status));
        }
    }

    /// `C<seq>|<cmd> <args...>` — dispatch on the first token and reply on
    /// the wire. A command nobody registered gets `STATUS_UNKNOWN_COMMAND`
    /// and empty text.
    async fn handle_command(&mut self, rest: &str) -> anyhow::Result<()> {
        let mut segs = rest.splitn(2, '|');
        let (Some(seq_str), Some(full_cmd)) = (segs.next(), segs.next()) else {
            return Ok(());
        };
        let Ok(seq) = seq_str.parse::<u32>() else {
            return Ok(());
        };
        let argv: Vec<&str> = full_cmd.split(' ').collect();
        let name = argv.first().copied().unwrap_or("");
        let (resp_str, resp_val) = match self.cmd_handlers.get_mut(name) {
            Some(handler) => handler(&argv),
            None => (String::new(), STATUS_UNKNOWN_COMMAND),
        };
        let wire = format!("R{}|{:x}|{}\n", seq, resp_val, resp_str);
        self.writer.write_all(wire.as_bytes()).await?;
        Ok(())
    }

    /// `S<hex-handle>|<text>` — run every prefix-matched status handler in
    /// registration order.
    fn handle_status(&mut self, rest: &str) {
        let mut segs = rest.splitn(2, '|');
        let (Some(handle_str), Some(text)) = (segs.next(), segs.next()) else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let Ok(handle) = u32::from_str_radix(handle_str, 16) else {
            return;
        };
        for (prefix, handler) in self.status_handlers.iter_mut() {
            if text.starts_with(prefix.as_str()) {
                handler(handle, text);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Start an engine over an in-memory stream; returns the handle, the
    /// error channel, and the radio-side reader/writer halves.
    fn start_engine(
        iface: ApiInterface,
    ) -> (
        ApiHandle,
        mpsc::Receiver<anyhow::Error>,
        tokio::io::ReadHalf<DuplexStream>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (client, radio) = tokio::io::duplex(4096);
        let (err_tx, err_rx) = mpsc::channel(1);
        let api = iface.start(client, Stats::new(), err_tx);
        let (radio_rx, radio_tx) = tokio::io::split(radio);
        (api, err_rx, radio_rx, radio_tx)
    }

    async fn read_line(rx: &mut tokio::io::ReadHalf<DuplexStream>) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            rx.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let (api, _err, mut radio_rx, mut radio_tx) = start_engine(ApiInterface::new());

        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.do_command("info", Duration::from_secs(1)).await })
        };
        // Sequence numbers pre-increment from 10.
        assert_eq!(read_line(&mut radio_rx).await, "C11|info");

        radio_tx.write_all(b"R11|0|ver=2.4.9\n").await.unwrap();
        let (text, status) = waiter.await.unwrap().unwrap();
        assert_eq!(text, "ver=2.4.9");
        assert_eq!(status, 0);

        // In-flight entry is gone: the next command takes the next seq and
        // a stray duplicate response for 11 is ignored.
        radio_tx.write_all(b"R11|0|stale\n").await.unwrap();
        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.do_command("version", Duration::from_secs(1)).await })
        };
        assert_eq!(read_line(&mut radio_rx).await, "C12|version");
        radio_tx.write_all(b"R12|5|\n").await.unwrap();
        let (text, status) = waiter.await.unwrap().unwrap();
        assert_eq!(text, "");
        assert_eq!(status, 5);
    }

    #[tokio::test]
    async fn test_command_timeout_then_late_response() {
        let (api, _err, mut radio_rx, mut radio_tx) = start_engine(ApiInterface::new());

        let result = api.do_command("slow", Duration::from_millis(30)).await;
        assert!(result.is_err(), "timeout surfaces to the caller");
        assert_eq!(read_line(&mut radio_rx).await, "C11|slow");

        // The late response frees the in-flight slot without a waiter.
        radio_tx.write_all(b"R11|0|late\n").await.unwrap();
        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.do_command("next", Duration::from_secs(1)).await })
        };
        assert_eq!(read_line(&mut radio_rx).await, "C12|next");
        radio_tx.write_all(b"R12|0|ok\n").await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().0, "ok");
    }

    #[tokio::test]
    async fn test_inbound_command_dispatch() {
        let mut iface = ApiInterface::new();
        iface.register_command_handler("ping", Box::new(|_argv: &[&str]| (String::new(), 0)));
        let (_api, _err, mut radio_rx, mut radio_tx) = start_engine(iface);

        radio_tx.write_all(b"C42|ping ms_timestamp=5.0\n").await.unwrap();
        assert_eq!(read_line(&mut radio_rx).await, "R42|0|");

        // No handler registered for this one.
        radio_tx.write_all(b"C43|frobnicate now\n").await.unwrap();
        assert_eq!(read_line(&mut radio_rx).await, "R43|50000015|");
    }

    #[tokio::test]
    async fn test_status_prefix_routing_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut iface = ApiInterface::new();
        for (tag, prefix) in [("slice", "slice "), ("all", "")] {
            let seen = seen.clone();
            iface.register_status_handler(
                prefix,
                Box::new(move |handle: u32, text: &str| {
                    seen.lock().unwrap().push((tag, handle, text.to_string()));
                }),
            );
        }
        let (api, _err, _radio_rx, mut radio_tx) = start_engine(iface);

        radio_tx.write_all(b"S3B|slice 0 freq=14.2\n").await.unwrap();
        radio_tx.write_all(b"S3B|radio ack\n").await.unwrap();
        // Flush the driver loop: a command round trip orders after the lines.
        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.do_command("nop", Duration::from_millis(200)).await })
        };
        let _ = waiter.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("slice", 0x3b, "slice 0 freq=14.2".to_string()));
        assert_eq!(seen[1], ("all", 0x3b, "slice 0 freq=14.2".to_string()));
        assert_eq!(seen[2], ("all", 0x3b, "radio ack".to_string()));
    }

    #[tokio::test]
    async fn test_version_and_handle_capture() {
        let (api, _err, _radio_rx, mut radio_tx) = start_engine(ApiInterface::new());
        assert_eq!(api.version().await, FlexVersion::default());

        radio_tx.write_all(b"V2.4.9.1\nH1234ABCD\n").await.unwrap();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if api.radio_handle().await != 0 {
                break;
            }
        }
        let version = api.version().await;
        assert_eq!(version.to_string(), "2.4.9.1");
        assert_eq!(api.radio_handle().await, 0x1234_abcd);
    }

    #[tokio::test]
    async fn test_reader_error_reaches_error_channel() {
        let (api, mut err_rx, radio_rx, radio_tx) = start_engine(ApiInterface::new());
        // EOF on the engine side needs both radio halves gone.
        drop(radio_rx);
        drop(radio_tx);
        let err = tokio::time::timeout(Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap();
        assert!(err.is_some(), "socket close surfaces exactly one error");
        for _ in 0..50 {
            if api.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("driver loop should exit after a reader error");
    }
}
