/// VITA-49 IF-data packet codec (the SmartSDR subset).
///
/// Packet layout on the wire (all words u32 big-endian; trailing words
/// conditional on word-0 flags):
/// ```text
/// ┌──────────┬───────────┬───────────┬───────────┬───────────┬────────────┬────────────┬─────────┐
/// │ Word 0   │ Word 1    │ Word 2    │ Word 3    │ Word 4    │ Word 5     │ Word 6     │ Payload │
/// │ type/    │ Stream ID │ ClassID-H │ ClassID-L │ Timestamp │ Frac TS-H  │ Frac TS-L  │ ...     │
/// │ flags/   │ (if SID   │ (if C     │ (if C     │ (if TSI   │ (if TSF    │ (if TSF    │         │
/// │ count/   │  type)    │  flag)    │  flag)    │  ≠ none)  │  ≠ none)   │  ≠ none)   │         │
/// │ size     │           │           │           │           │            │            │         │
/// └──────────┴───────────┴───────────┴───────────┴───────────┴────────────┴────────────┴─────────┘
/// ```
///
/// Audio payload: each sample is two big-endian f32 words (8 bytes). Float
/// streams carry the value in the second word of the pair; complex streams
/// carry re in the first and im in the second.
use bytes::{Buf, BufMut};
use num_complex::Complex;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Largest datagram the radio sends; also the pool buffer length.
pub const MAX_PACKET_LEN: usize = 1500;

/// Samples per outbound audio frame cap (1024 payload bytes).
pub const MAX_SAMP_PER_FRAME: usize = 128;

/// Fully-populated header extent: seven u32 words.
pub const VITA_DATA_HEADER_SIZE: usize = 28;

// ── Word-0 fields ──────────────────────────────────────────────────────

pub const VITA_HEADER_PACKET_TYPE_MASK: u32 = 0xf000_0000;
pub const VITA_PACKET_TYPE_IF_DATA: u32 = 0x0000_0000;
pub const VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID: u32 = 0x1000_0000;
pub const VITA_PACKET_TYPE_EXT_DATA: u32 = 0x2000_0000;
pub const VITA_PACKET_TYPE_EXT_DATA_WITH_STREAM_ID: u32 = 0x3000_0000;

/// Class-ID-present flag (two class words follow the stream id).
pub const VITA_HEADER_CLASS_ID_PRESENT: u32 = 0x0800_0000;
/// Trailer-present flag (one word after the payload, never parsed here).
pub const VITA_HEADER_TRAILER_PRESENT: u32 = 0x0400_0000;

pub const VITA_HEADER_TSI_MASK: u32 = 0x00c0_0000;
pub const VITA_TSI_NONE: u32 = 0x0000_0000;
pub const VITA_TSI_UTC: u32 = 0x0040_0000;
pub const VITA_TSI_OTHER: u32 = 0x00c0_0000;

pub const VITA_HEADER_TSF_MASK: u32 = 0x0030_0000;
pub const VITA_TSF_NONE: u32 = 0x0000_0000;
pub const VITA_TSF_SAMPLE_COUNT: u32 = 0x0010_0000;
pub const VITA_TSF_REAL_TIME: u32 = 0x0020_0000;

pub const VITA_HEADER_PACKET_COUNT_MASK: u32 = 0x000f_0000;
pub const VITA_HEADER_PACKET_SIZE_MASK: u32 = 0x0000_ffff;

/// Packet-class bits of the low class-ID word.
pub const VITA_CLASS_ID_PACKET_CLASS_MASK: u32 = 0x0000_ffff;

/// FlexRadio OUI — high class-ID word of every packet this agent accepts.
pub const FLEX_OUI: u32 = 0x0000_1c2d;

/// Low class-ID word of the slice audio stream.
pub const SL_VITA_SLICE_AUDIO_CLASS: u32 = (0x534c << 16) | 0x03 | (3 << 5) | (0x3 << 7) | (0x1 << 9);

// ═══════════════════════════════════════════════════════════════════════
//  Header
// ═══════════════════════════════════════════════════════════════════════

/// Fully-populated logical view of a VITA IF-data header.
///
/// Fields a given packet does not carry on the wire are left zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VitaHeader {
    pub header: u32,
    pub stream_id: u32,
    pub class_id_h: u32,
    pub class_id_l: u32,
    pub timestamp_int: u32,
    pub timestamp_frac_h: u32,
    pub timestamp_frac_l: u32,
}

/// Packet descriptor lent out by the buffer pool. Travels next to the raw
/// buffer it indexes into; the pair must be released together.
#[derive(Debug, Clone, Copy, Default)]
pub struct VitaPacket {
    pub header: VitaHeader,
    pub payload_off: usize,
    pub payload_len: usize,
}

impl VitaPacket {
    /// The payload byte range inside the packet's raw buffer.
    #[inline]
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload_off..self.payload_off + self.payload_len]
    }
}

/// Parse the fixed seven-word layout this radio family emits.
///
/// Returns `None` if the buffer can't hold all seven words.
pub fn read_header(buf: &[u8]) -> Option<VitaHeader> {
    if buf.len() < VITA_DATA_HEADER_SIZE {
        return None;
    }
    let mut b = buf;
    Some(VitaHeader {
        header: b.get_u32(),
        stream_id: b.get_u32(),
        class_id_h: b.get_u32(),
        class_id_l: b.get_u32(),
        timestamp_int: b.get_u32(),
        timestamp_frac_h: b.get_u32(),
        timestamp_frac_l: b.get_u32(),
    })
}

/// Parse a variable-layout header, driven by the word-0 flags.
///
/// Both stream-id-bearing packet types consume a stream-id word; class-id
/// adds two words, TSI ≠ none one word, TSF ≠ none two words, and the
/// trailer flag accounts for one word after the payload. Unknown packet
/// types leave the header at word 0 only.
///
/// Returns `(header, payload_words, header_words)` where `payload_words`
/// is the word-0 total minus header and trailer words. `None` if the
/// buffer is shorter than the computed header extent.
pub fn read_header_stream(buf: &[u8]) -> Option<(VitaHeader, usize, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let word0 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let total_words = (word0 & VITA_HEADER_PACKET_SIZE_MASK) as usize;

    let has_sid = matches!(
        word0 & VITA_HEADER_PACKET_TYPE_MASK,
        VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID | VITA_PACKET_TYPE_EXT_DATA_WITH_STREAM_ID
    );
    let has_cid = word0 & VITA_HEADER_CLASS_ID_PRESENT != 0;
    let has_tsi = word0 & VITA_HEADER_TSI_MASK != VITA_TSI_NONE;
    let has_tsf = word0 & VITA_HEADER_TSF_MASK != VITA_TSF_NONE;
    let trailer_words = if word0 & VITA_HEADER_TRAILER_PRESENT != 0 { 1 } else { 0 };

    let mut header_words = 1;
    if has_sid {
        header_words += 1;
    }
    if has_cid {
        header_words += 2;
    }
    if has_tsi {
        header_words += 1;
    }
    if has_tsf {
        header_words += 2;
    }

    if buf.len() < header_words * 4 {
        return None;
    }

    let mut header = VitaHeader {
        header: word0,
        ..Default::default()
    };
    let mut b = &buf[4..];
    if has_sid {
        header.stream_id = b.get_u32();
    }
    if has_cid {
        header.class_id_h = b.get_u32();
        header.class_id_l = b.get_u32();
    }
    if has_tsi {
        header.timestamp_int = b.get_u32();
    }
    if has_tsf {
        header.timestamp_frac_h = b.get_u32();
        header.timestamp_frac_l = b.get_u32();
    }

    let payload_words = total_words.saturating_sub(header_words + trailer_words);
    Some((header, payload_words, header_words))
}

/// Pack an outbound IF-data-with-stream-id header into `buf[..28]`.
///
/// Word 0 carries class-id-present, TSI=other, TSF=sample-count, the low
/// four bits of the per-stream counter in bits 16–19 and the total word
/// count (7 header words + payload) in bits 0–15.
pub fn write_header(hdr: &VitaHeader, count: u64, payload_words: usize, buf: &mut [u8]) {
    let word0 = VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID
        | VITA_HEADER_CLASS_ID_PRESENT
        | VITA_TSI_OTHER
        | VITA_TSF_SAMPLE_COUNT
        | ((count as u32 & 0xf) << 16)
        | ((7 + payload_words) as u32 & VITA_HEADER_PACKET_SIZE_MASK);
    let mut b = &mut buf[..VITA_DATA_HEADER_SIZE];
    b.put_u32(word0);
    b.put_u32(hdr.stream_id);
    b.put_u32(hdr.class_id_h);
    b.put_u32(hdr.class_id_l);
    b.put_u32(hdr.timestamp_int);
    b.put_u32(hdr.timestamp_frac_h);
    b.put_u32(hdr.timestamp_frac_l);
}

// ═══════════════════════════════════════════════════════════════════════
//  Payload conversions
// ═══════════════════════════════════════════════════════════════════════

/// Decode a float-stream payload: one sample per 8-byte pair, value in
/// the second big-endian f32 word.
pub fn vita_to_float(payload: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(payload.len() / 8);
    let mut b = payload;
    while b.len() >= 8 {
        b.advance(4);
        out.push(f32::from_bits(b.get_u32()));
    }
    out
}

/// Encode float samples into `buf` after the header, duplicating each
/// value into both words of its pair (the radio plays the second word but
/// mirrors mono audio across both).
///
/// Caps at [`MAX_SAMP_PER_FRAME`], sets the packet's payload range, and
/// returns the number of samples consumed.
pub fn float_to_vita_frame(pkt: &mut VitaPacket, buf: &mut [u8], samples: &[f32]) -> usize {
    let n = samples.len().min(MAX_SAMP_PER_FRAME);
    let mut b = &mut buf[VITA_DATA_HEADER_SIZE..VITA_DATA_HEADER_SIZE + n * 8];
    for &s in &samples[..n] {
        b.put_u32(s.to_bits());
        b.put_u32(s.to_bits());
    }
    pkt.payload_off = VITA_DATA_HEADER_SIZE;
    pkt.payload_len = n * 8;
    n
}

/// Decode a complex-stream payload: re in the first word of each pair,
/// im in the second.
pub fn vita_to_complex(payload: &[u8]) -> Vec<Complex<f32>> {
    let mut out = Vec::with_capacity(payload.len() / 8);
    let mut b = payload;
    while b.len() >= 8 {
        let re = f32::from_bits(b.get_u32());
        let im = f32::from_bits(b.get_u32());
        out.push(Complex::new(re, im));
    }
    out
}

/// Encode complex samples after the header; same frame cap and payload
/// bookkeeping as [`float_to_vita_frame`].
pub fn complex_to_vita_frame(pkt: &mut VitaPacket, buf: &mut [u8], samples: &[Complex<f32>]) -> usize {
    let n = samples.len().min(MAX_SAMP_PER_FRAME);
    let mut b = &mut buf[VITA_DATA_HEADER_SIZE..VITA_DATA_HEADER_SIZE + n * 8];
    for s in &samples[..n] {
        b.put_u32(s.re.to_bits());
        b.put_u32(s.im.to_bits());
    }
    pkt.payload_off = VITA_DATA_HEADER_SIZE;
    pkt.payload_len = n * 8;
    n
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(words.len() * 4);
        for w in words {
            buf.extend_from_slice(&w.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_fixed_parse_too_short() {
        assert!(read_header(&[0u8; 27]).is_none());
    }

    #[test]
    fn test_fixed_parse_reads_all_words() {
        let buf = words_to_bytes(&[1, 2, 3, 4, 5, 6, 7]);
        let h = read_header(&buf).unwrap();
        assert_eq!(h.stream_id, 2);
        assert_eq!(h.class_id_l, 4);
        assert_eq!(h.timestamp_frac_l, 7);
    }

    #[test]
    fn test_stream_parse_bare_if_data() {
        // IF_DATA, no flags: header is word 0 only.
        let buf = words_to_bytes(&[VITA_PACKET_TYPE_IF_DATA | 5, 0, 0, 0, 0]);
        let (h, payload, hwords) = read_header_stream(&buf).unwrap();
        assert_eq!(hwords, 1);
        assert_eq!(payload, 4);
        assert_eq!(h.stream_id, 0);
    }

    #[test]
    fn test_stream_parse_ext_data_with_stream_id_has_sid() {
        let buf = words_to_bytes(&[VITA_PACKET_TYPE_EXT_DATA_WITH_STREAM_ID | 3, 0xdead_beef, 0]);
        let (h, payload, hwords) = read_header_stream(&buf).unwrap();
        assert_eq!(hwords, 2);
        assert_eq!(payload, 1);
        assert_eq!(h.stream_id, 0xdead_beef);
    }

    #[test]
    fn test_stream_parse_full_layout_with_trailer() {
        let word0 = VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID
            | VITA_HEADER_CLASS_ID_PRESENT
            | VITA_HEADER_TRAILER_PRESENT
            | VITA_TSI_UTC
            | VITA_TSF_REAL_TIME
            | 10; // 7 header + 2 payload + 1 trailer
        let buf = words_to_bytes(&[word0, 0x40, FLEX_OUI, 0xffff, 0x11, 0x22, 0x33, 0, 0, 0]);
        let (h, payload, hwords) = read_header_stream(&buf).unwrap();
        assert_eq!(hwords, 7);
        assert_eq!(payload, 2, "10 total - 7 header - 1 trailer");
        assert_eq!(h.class_id_h, FLEX_OUI);
        assert_eq!(h.timestamp_int, 0x11);
        assert_eq!(h.timestamp_frac_l, 0x33);
    }

    #[test]
    fn test_stream_parse_unknown_type_single_word() {
        // Context packets are not in the supported set: header stays 1 word.
        let buf = words_to_bytes(&[0x4000_0000 | 6, 1, 2, 3, 4, 5]);
        let (_, payload, hwords) = read_header_stream(&buf).unwrap();
        assert_eq!(hwords, 1);
        assert_eq!(payload, 5);
    }

    #[test]
    fn test_stream_parse_rejects_truncated_header() {
        let word0 = VITA_PACKET_TYPE_IF_DATA_WITH_STREAM_ID | VITA_HEADER_CLASS_ID_PRESENT | 8;
        // Needs 4 header words, only 3 present.
        let buf = words_to_bytes(&[word0, 1, 2]);
        assert!(read_header_stream(&buf).is_none());
    }

    #[test]
    fn test_pack_parse_round_trip() {
        let hdr = VitaHeader {
            header: 0,
            stream_id: 0x0400_0001,
            class_id_h: FLEX_OUI,
            class_id_l: SL_VITA_SLICE_AUDIO_CLASS,
            timestamp_int: 7,
            timestamp_frac_h: 0,
            timestamp_frac_l: 1234,
        };
        let mut buf = [0u8; MAX_PACKET_LEN];
        write_header(&hdr, 0x25, 128, &mut buf);

        let (parsed, payload, hwords) = read_header_stream(&buf).unwrap();
        assert_eq!(hwords, 7);
        assert_eq!(payload, 128);
        assert_eq!(parsed.stream_id, hdr.stream_id);
        assert_eq!(parsed.class_id_h, hdr.class_id_h);
        assert_eq!(parsed.class_id_l, hdr.class_id_l);
        assert_eq!(parsed.timestamp_int, hdr.timestamp_int);
        assert_eq!(parsed.timestamp_frac_l, hdr.timestamp_frac_l);
        // Counter low nibble lands in bits 16-19.
        assert_eq!(parsed.header & VITA_HEADER_PACKET_COUNT_MASK, 0x5 << 16);
    }

    #[test]
    fn test_float_payload_round_trip() {
        let samples: Vec<f32> = (0..16).map(|i| i as f32 * 0.25 - 2.0).collect();
        let mut buf = [0u8; MAX_PACKET_LEN];
        let mut pkt = VitaPacket::default();
        let n = float_to_vita_frame(&mut pkt, &mut buf, &samples);
        assert_eq!(n, 16);
        assert_eq!(pkt.payload_len, 128);
        let decoded = vita_to_float(pkt.payload(&buf));
        assert_eq!(decoded, samples);
        // Value is mirrored into the first word of each pair too.
        let first = f32::from_bits(u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]));
        assert_eq!(first, samples[0]);
    }

    #[test]
    fn test_float_frame_caps_at_max() {
        let samples = vec![1.0f32; 300];
        let mut buf = [0u8; MAX_PACKET_LEN];
        let mut pkt = VitaPacket::default();
        let n = float_to_vita_frame(&mut pkt, &mut buf, &samples);
        assert_eq!(n, MAX_SAMP_PER_FRAME);
        assert_eq!(pkt.payload_len, MAX_SAMP_PER_FRAME * 8);
    }

    #[test]
    fn test_complex_payload_round_trip() {
        let samples: Vec<Complex<f32>> = (0..8).map(|i| Complex::new(i as f32, -(i as f32))).collect();
        let mut buf = [0u8; MAX_PACKET_LEN];
        let mut pkt = VitaPacket::default();
        let n = complex_to_vita_frame(&mut pkt, &mut buf, &samples);
        assert_eq!(n, 8);
        let decoded = vita_to_complex(pkt.payload(&buf));
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_slice_audio_class_value() {
        assert_eq!(SL_VITA_SLICE_AUDIO_CLASS, 0x534c_03e3);
    }
}
