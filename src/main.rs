mod buffer_pool;
mod config;
mod discovery;
mod pipeline;
mod resampler;
mod stages;
mod stats;
mod transport_api;
mod transport_vita;
mod vita;
mod waveform_cfg;

use clap::Parser;
use config::Config;
use pipeline::PipelineParams;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use transport_api::ApiInterface;
use transport_vita::VitaInterface;
use vita::{VitaHeader, FLEX_OUI, SL_VITA_SLICE_AUDIO_CLASS};

/// Radio-side TCP command port.
const SMARTSDR_API_PORT: u16 = 4992;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();
    let rx_stream_id = config.rx_stream_id()?;
    let tx_stream_id = config.tx_stream_id()?;

    info!(
        cfg_file = %config.cfg_file,
        local_vita_port = config.local_vita_port,
        "🚀 waveform-bridge starting"
    );

    let stats = stats::Stats::new();
    {
        let stats = stats.clone();
        let interval = config.stats_interval_secs;
        tokio::spawn(async move {
            stats::stats_reporter(stats, interval).await;
        });
    }

    // ── Find the radio ─────────────────────────────────────────────────
    let (radio_ip, api_port) = match &config.radio_addr {
        Some(addr) => {
            let parsed: SocketAddr = addr.parse()?;
            (parsed.ip(), parsed.port())
        }
        None => {
            info!(
                timeout_secs = config.discovery_timeout_secs,
                "listening for radio discovery broadcasts"
            );
            let radio = discovery::discover_radio(config.discovery_timeout()).await?;
            info!(radio = %radio, "found radio");
            let ip: IpAddr = radio.ip.parse()?;
            let port = radio.port.parse().unwrap_or(SMARTSDR_API_PORT);
            (ip, port)
        }
    };

    // ── Command session ────────────────────────────────────────────────
    let stream = TcpStream::connect(SocketAddr::new(radio_ip, api_port)).await?;
    info!(radio = %radio_ip, port = api_port, "✅ command channel connected");

    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);

    let mut iface = ApiInterface::new();
    iface.register_command_handler("ping", Box::new(|_argv: &[&str]| (String::new(), 0)));
    iface.register_status_handler(
        "slice ",
        Box::new(|handle: u32, text: &str| {
            info!(handle = format!("{handle:#x}"), "{}", text);
        }),
    );
    let api = iface.start(stream, stats.clone(), err_tx.clone());
    let _ping = transport_api::spawn_ping(api.clone());

    // ── Waveform registration ──────────────────────────────────────────
    let contents = tokio::fs::read_to_string(&config.cfg_file).await?;
    let cfg = waveform_cfg::parse_waveform_cfg(&contents)?;
    waveform_cfg::register_waveform(&api, &cfg).await?;
    info!(
        version = %api.version().await,
        handle = format!("{:#x}", api.radio_handle().await),
        "radio session established"
    );

    // ── VITA data plane ────────────────────────────────────────────────
    let local = SocketAddr::from(([0, 0, 0, 0], config.local_vita_port));
    let radio_vita = SocketAddr::new(radio_ip, config.radio_vita_port);
    let mut vif = VitaInterface::open(local, radio_vita).await?;

    let template = VitaHeader {
        stream_id: tx_stream_id,
        class_id_h: FLEX_OUI,
        class_id_l: SL_VITA_SLICE_AUDIO_CLASS,
        ..Default::default()
    };
    let params = PipelineParams {
        naccum: config.naccum,
        maxdisp: config.maxdisp,
        rate_log_interval: config.rate_log_interval(),
    };
    pipeline::wire_waveform(&mut vif, rx_stream_id, template, &params, stats.clone());
    vif.start(stats.clone(), err_tx);

    info!("✅ waveform pipeline running");

    // ── Park on the error channel ──────────────────────────────────────
    match err_rx.recv().await {
        Some(e) => {
            error!(error = %e, "fatal transport error, shutting down");
            api.close();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(e)
        }
        None => {
            warn!("error channel closed, shutting down");
            api.close();
            Ok(())
        }
    }
}
