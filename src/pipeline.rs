/// Assembly of the waveform's stream chains.
///
/// ```text
///          radio ──UDP──▶ VitaInterface recv loop
///                               │ subscriber(rx id)
///                               ▼
///                    rate counter ─ accumulator ─ 24→8 kHz
///                               │
///                     delatentizer in  (8 kHz modem seam)
///                               │
///                     delatentizer out
///                               │
///                    8→24 kHz ─ rate counter ─ float→VITA
///                               │
///          radio ◀──UDP── VitaInterface send loop
/// ```
///
/// The 8 kHz leg between the two delatentizer stages is where a vocoder
/// or modem would slot in; wired bare it loops slice audio straight back
/// to the radio at the corrected rate.
use crate::stages::{
    accumulator_stage, rate_counter_stage, spawn_delatentizer, vita_input_subscriber,
    vita_output_stage, STAGE_QUEUE_DEPTH,
};
use crate::resampler::{resamp_24_to_8_stage, resamp_8_to_24_stage, RS_RATIO};
use crate::stats::Stats;
use crate::transport_vita::VitaInterface;
use crate::vita::VitaHeader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Knobs for one waveform chain.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    /// Samples per DSP block at the radio rate; rounded down to a
    /// multiple of 3 by the resamplers.
    pub naccum: usize,
    /// Delatentizer displacement threshold, in samples.
    pub maxdisp: usize,
    /// Rate-counter log cadence (zero disables the logs).
    pub rate_log_interval: Duration,
}

/// Wire the full receive→process→send chain onto `vif` and return the
/// spawned stage tasks. Must run before `VitaInterface::start` consumes
/// the subscriber registry.
pub fn wire_waveform(
    vif: &mut VitaInterface,
    rx_stream_id: u32,
    tx_template: VitaHeader,
    params: &PipelineParams,
    stats: Arc<Stats>,
) -> Vec<JoinHandle<()>> {
    let naccum = (params.naccum - params.naccum % RS_RATIO).max(RS_RATIO);
    info!(
        rx_stream_id = format!("{rx_stream_id:#010x}"),
        tx_stream_id = format!("{:#010x}", tx_template.stream_id),
        naccum,
        maxdisp = params.maxdisp,
        "wiring waveform pipeline"
    );

    let pool = vif.pool();
    let send_tx = vif.send_queue();
    let chan = || mpsc::channel::<Vec<f32>>(STAGE_QUEUE_DEPTH);
    let mut tasks = Vec::new();

    // Radio → host leg.
    let (in_tx, in_rx) = chan();
    vif.subscribe(rx_stream_id, vita_input_subscriber(in_tx, stats));

    let (rate_rx_tx, rate_rx_rx) = chan();
    tasks.push(tokio::spawn(rate_counter_stage(
        in_rx,
        rate_rx_tx,
        "slice rx".into(),
        params.rate_log_interval,
    )));

    let (acc_tx, acc_rx) = chan();
    tasks.push(tokio::spawn(accumulator_stage(rate_rx_rx, acc_tx, naccum)));

    let (down_tx, down_rx) = chan();
    tasks.push(tokio::spawn(resamp_24_to_8_stage(acc_rx, down_tx, naccum)));

    // 8 kHz modem seam: delatentizer input feeds the seam, the seam feeds
    // the delatentizer output. Bare wiring loops them directly.
    let (seam_tx, seam_rx) = chan();
    let (out8k_tx, out8k_rx) = chan();
    let (dl_in, dl_out) = spawn_delatentizer(down_rx, seam_tx, seam_rx, out8k_tx, params.maxdisp);
    tasks.push(dl_in);
    tasks.push(dl_out);

    // Host → radio leg.
    let (up_tx, up_rx) = chan();
    tasks.push(tokio::spawn(resamp_8_to_24_stage(
        out8k_rx,
        up_tx,
        naccum / RS_RATIO,
    )));

    let (rate_tx_tx, rate_tx_rx) = chan();
    tasks.push(tokio::spawn(rate_counter_stage(
        up_rx,
        rate_tx_tx,
        "slice tx".into(),
        params.rate_log_interval,
    )));

    tasks.push(tokio::spawn(vita_output_stage(
        rate_tx_rx,
        send_tx,
        pool,
        tx_template,
    )));

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vita::{
        self, VitaPacket, FLEX_OUI, SL_VITA_SLICE_AUDIO_CLASS, VITA_DATA_HEADER_SIZE,
        VITA_HEADER_PACKET_COUNT_MASK, VITA_HEADER_PACKET_TYPE_MASK,
        VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID,
    };
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    const RX_ID: u32 = 0x0400_0001;
    const TX_ID: u32 = 0x8400_0001;

    fn audio_frame(stream_id: u32, seq: u64, samples: &[f32]) -> Vec<u8> {
        let mut buf = vec![0u8; VITA_DATA_HEADER_SIZE + samples.len() * 8];
        let mut pkt = VitaPacket {
            header: VitaHeader {
                stream_id,
                class_id_h: FLEX_OUI,
                class_id_l: SL_VITA_SLICE_AUDIO_CLASS,
                ..Default::default()
            },
            ..Default::default()
        };
        let n = vita::float_to_vita_frame(&mut pkt, &mut buf, samples);
        assert_eq!(n, samples.len());
        // Two big-endian words per sample.
        vita::write_header(&pkt.header, seq, pkt.payload_len / 4, &mut buf);
        buf
    }

    /// Frames in on the rx stream come back out on the tx stream, 3:1:3
    /// resampled, framed under the template header with a monotonic
    /// packet count.
    #[tokio::test]
    async fn test_end_to_end_audio_loop() {
        let radio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut vif = VitaInterface::open(
            "127.0.0.1:0".parse().unwrap(),
            radio.local_addr().unwrap(),
        )
        .await
        .unwrap();
        let agent_addr = vif.local_addr().unwrap();

        let stats = Stats::new();
        let params = PipelineParams {
            naccum: 144,
            maxdisp: 100_000,
            rate_log_interval: Duration::ZERO,
        };
        let template = VitaHeader {
            stream_id: TX_ID,
            class_id_h: FLEX_OUI,
            class_id_l: SL_VITA_SLICE_AUDIO_CLASS,
            ..Default::default()
        };
        wire_waveform(&mut vif, RX_ID, template, &params, stats.clone());
        let (err_tx, _err_rx) = mpsc::channel(1);
        vif.start(stats, err_tx);

        // Two 128-sample frames and one 32-sample frame: two full 144-
        // sample DSP blocks in, so 288 samples come back out.
        let tone: Vec<f32> = (0..288)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        for (seq, chunk) in tone.chunks(128).enumerate() {
            radio
                .send_to(&audio_frame(RX_ID, seq as u64, chunk), agent_addr)
                .await
                .unwrap();
            // Pace the bursts so the bounded stage queues never shed.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut got_samples = 0usize;
        let mut last_count: Option<u32> = None;
        let mut buf = vec![0u8; 1500];
        while got_samples < 288 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), radio.recv_from(&mut buf))
                .await
                .expect("pipeline should emit audio frames")
                .unwrap();
            let (header, payload_words, header_words) =
                vita::read_header_stream(&buf[..n]).expect("well-formed outbound frame");
            assert_eq!(
                header.header & VITA_HEADER_PACKET_TYPE_MASK,
                VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID
            );
            assert_eq!(header.stream_id, TX_ID);
            assert_eq!(header.class_id_l, SL_VITA_SLICE_AUDIO_CLASS);
            assert_eq!(header_words, 7);

            let count = (header.header & VITA_HEADER_PACKET_COUNT_MASK) >> 16;
            if let Some(prev) = last_count {
                assert_eq!(count, (prev + 1) & 0xf, "packet count is monotonic mod 16");
            }
            last_count = Some(count);
            got_samples += payload_words * 4 / 8;
        }
        assert_eq!(got_samples, 288);
    }
}
