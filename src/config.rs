use clap::Parser;
use std::time::Duration;

/// Host-side SmartSDR waveform agent: discovers a FlexRadio on the LAN,
/// registers a waveform, and runs a bidirectional VITA-49 audio pipeline.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Radio command endpoint as ip:port (skips LAN discovery)
    #[arg(long)]
    pub radio_addr: Option<String>,

    /// Discovery wait before giving up, in seconds
    #[arg(long, default_value_t = 30)]
    pub discovery_timeout_secs: u64,

    /// Local UDP port for VITA IF data
    #[arg(long, default_value_t = 4999)]
    pub local_vita_port: u16,

    /// Radio UDP port for VITA IF data
    #[arg(long, default_value_t = 4991)]
    pub radio_vita_port: u16,

    /// Waveform registration file
    #[arg(long, default_value = "waveform.cfg")]
    pub cfg_file: String,

    /// Stream ID (hex) of the slice audio stream we subscribe to
    #[arg(long, default_value = "4000001")]
    pub rx_stream_id: String,

    /// Stream ID (hex) stamped on the audio we send back
    #[arg(long, default_value = "84000001")]
    pub tx_stream_id: String,

    /// Samples accumulated per DSP block at 24 kHz (rounded down to a
    /// multiple of 3)
    #[arg(long, default_value_t = 720)]
    pub naccum: usize,

    /// Displacement threshold, in samples, before the delatentizer
    /// zero-fills the return leg
    #[arg(long, default_value_t = 2400)]
    pub maxdisp: usize,

    /// Rate-counter logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 10)]
    pub rate_log_interval_secs: u64,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn rate_log_interval(&self) -> Duration {
        Duration::from_secs(self.rate_log_interval_secs)
    }

    pub fn rx_stream_id(&self) -> anyhow::Result<u32> {
        parse_stream_id(&self.rx_stream_id)
    }

    pub fn tx_stream_id(&self) -> anyhow::Result<u32> {
        parse_stream_id(&self.tx_stream_id)
    }
}

fn parse_stream_id(s: &str) -> anyhow::Result<u32> {
    let trimmed = s.trim_start_matches("0x");
    Ok(u32::from_str_radix(trimmed, 16)?)
}
