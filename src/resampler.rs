/// 24 kHz ⇄ 8 kHz FIR resamplers for the modem-rate leg of the pipeline.
///
/// Both directions share one 48-tap low-pass (cutoff 1/3, `fir1(47, 1/3)`);
/// the decimator runs it directly at 24 kHz, the interpolator uses it as a
/// 3-phase polyphase bank with a ×3 gain to make up the interpolation loss.
///
/// The cores are plain structs fed by `push`; the async stage wrappers at
/// the bottom connect them into the chunk pipeline.
use tokio::sync::mpsc;

/// Resampling ratio between the radio rate and the modem rate.
pub const RS_RATIO: usize = 3;

/// 4 kHz low-pass at 24 ksps, 48 taps.
pub const FDMDV_OS24_FILTER: [f32; 48] = [
    -0.000565842330864509,
    -0.00119184233667459,
    -0.000686550128357081,
    0.000939738560355487,
    0.00235824811185176,
    0.00149083509882116,
    -0.00207002114214581,
    -0.00516284617910486,
    -0.00318858060009128,
    0.00422846062091092,
    0.0102371199934064,
    0.00615820273645780,
    -0.00786127965697296,
    -0.0187253107816201,
    -0.0111560475540299,
    0.0139752338625282,
    0.0334879967920482,
    0.0202917237268834,
    -0.0258029481868858,
    -0.0651503052036609,
    -0.0430343789277145,
    0.0624453219256916,
    0.210663786004670,
    0.318319285594497,
    0.318319285594497,
    0.210663786004670,
    0.0624453219256916,
    -0.0430343789277145,
    -0.0651503052036609,
    -0.0258029481868858,
    0.0202917237268834,
    0.0334879967920482,
    0.0139752338625282,
    -0.0111560475540299,
    -0.0187253107816201,
    -0.00786127965697296,
    0.00615820273645780,
    0.0102371199934064,
    0.00422846062091092,
    -0.00318858060009128,
    -0.00516284617910486,
    -0.00207002114214581,
    0.00149083509882116,
    0.00235824811185176,
    0.000939738560355487,
    -0.000686550128357081,
    -0.00119184233667459,
    -0.000565842330864509,
];

// ═══════════════════════════════════════════════════════════════════════
//  24 → 8 kHz decimator
// ═══════════════════════════════════════════════════════════════════════

/// 3:1 decimating FIR. Accumulates `naccum` input samples (rounded down to
/// a multiple of 3) and emits `naccum / 3` per block; the last `ntaps`
/// samples of each block seed the next block's filter memory.
pub struct Resampler24to8 {
    naccum: usize,
    mem: Vec<f32>,
    fill: usize,
}

impl Resampler24to8 {
    pub fn new(naccum: usize) -> Self {
        let naccum = (naccum - naccum % RS_RATIO).max(RS_RATIO);
        let ntaps = FDMDV_OS24_FILTER.len();
        Self {
            naccum,
            mem: vec![0.0; naccum + ntaps],
            fill: 0,
        }
    }

    /// Input samples accepted per emitted block.
    pub fn naccum(&self) -> usize {
        self.naccum
    }

    /// Feed samples; returns zero or more complete output blocks.
    pub fn push(&mut self, mut input: &[f32]) -> Vec<Vec<f32>> {
        let ntaps = FDMDV_OS24_FILTER.len();
        let mut out = Vec::new();
        while !input.is_empty() {
            let n = (self.naccum - self.fill).min(input.len());
            self.mem[ntaps + self.fill..ntaps + self.fill + n].copy_from_slice(&input[..n]);
            self.fill += n;
            input = &input[n..];

            if self.fill == self.naccum {
                let mut block = vec![0.0f32; self.naccum / RS_RATIO];
                for (i, o) in block.iter_mut().enumerate() {
                    let mut v = 0.0f32;
                    for (j, tap) in FDMDV_OS24_FILTER.iter().enumerate() {
                        v += tap * self.mem[i * RS_RATIO + ntaps - j];
                    }
                    *o = v;
                }
                out.push(block);
                let memlen = self.mem.len();
                self.mem.copy_within(memlen - ntaps.., 0);
                self.fill = 0;
            }
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  8 → 24 kHz interpolator
// ═══════════════════════════════════════════════════════════════════════

/// 1:3 interpolating FIR, polyphase over the shared tap set. Emits
/// `naccum · 3` samples per `naccum` (multiple of 3) accumulated inputs.
pub struct Resampler8to24 {
    naccum: usize,
    nmem: usize,
    mem: Vec<f32>,
    fill: usize,
}

impl Resampler8to24 {
    pub fn new(naccum: usize) -> Self {
        let naccum = (naccum - naccum % RS_RATIO).max(RS_RATIO);
        let nmem = FDMDV_OS24_FILTER.len() / RS_RATIO;
        Self {
            naccum,
            nmem,
            mem: vec![0.0; naccum + nmem],
            fill: 0,
        }
    }

    pub fn naccum(&self) -> usize {
        self.naccum
    }

    /// Feed samples; returns zero or more complete output blocks.
    pub fn push(&mut self, mut input: &[f32]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        while !input.is_empty() {
            let n = (self.naccum - self.fill).min(input.len());
            self.mem[self.nmem + self.fill..self.nmem + self.fill + n].copy_from_slice(&input[..n]);
            self.fill += n;
            input = &input[n..];

            if self.fill == self.naccum {
                let mut block = vec![0.0f32; self.naccum * RS_RATIO];
                for i in 0..self.naccum {
                    for j in 0..RS_RATIO {
                        let mut v = 0.0f32;
                        for l in 0..self.nmem {
                            v += FDMDV_OS24_FILTER[l * RS_RATIO + j] * self.mem[i + self.nmem - l];
                        }
                        block[i * RS_RATIO + j] = v * RS_RATIO as f32;
                    }
                }
                out.push(block);
                let memlen = self.mem.len();
                self.mem.copy_within(memlen - self.nmem.., 0);
                self.fill = 0;
            }
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Stage wrappers
// ═══════════════════════════════════════════════════════════════════════

/// Decimator as a pipeline stage: exits when the input closes or the
/// downstream consumer goes away.
pub async fn resamp_24_to_8_stage(
    mut rx: mpsc::Receiver<Vec<f32>>,
    tx: mpsc::Sender<Vec<f32>>,
    naccum: usize,
) {
    let mut rs = Resampler24to8::new(naccum);
    while let Some(chunk) = rx.recv().await {
        for block in rs.push(&chunk) {
            if tx.send(block).await.is_err() {
                return;
            }
        }
    }
}

/// Interpolator as a pipeline stage.
pub async fn resamp_8_to_24_stage(
    mut rx: mpsc::Receiver<Vec<f32>>,
    tx: mpsc::Sender<Vec<f32>>,
    naccum: usize,
) {
    let mut rs = Resampler8to24::new(naccum);
    while let Some(chunk) = rx.recv().await {
        for block in rs.push(&chunk) {
            if tx.send(block).await.is_err() {
                return;
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

    #[test]
    fn test_naccum_rounds_down_to_ratio() {
        assert_eq!(Resampler24to8::new(10).naccum(), 9);
        assert_eq!(Resampler8to24::new(80).naccum(), 78);
    }

    #[test]
    fn test_decimator_output_count() {
        let mut rs = Resampler24to8::new(240);
        let blocks = rs.push(&vec![0.0; 240]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 80);
        // Partial feed spans blocks.
        let mut rs = Resampler24to8::new(240);
        assert!(rs.push(&vec![0.0; 100]).is_empty());
        let blocks = rs.push(&vec![0.0; 380]);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_interpolator_output_count() {
        let mut rs = Resampler8to24::new(240);
        let blocks = rs.push(&vec![0.0; 480]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), 720);
    }

    #[test]
    fn test_decimator_is_linear() {
        let x: Vec<f32> = (0..480).map(|i| ((i * 7) % 13) as f32 - 6.0).collect();
        let mut a = Resampler24to8::new(240);
        let mut b = Resampler24to8::new(240);
        let ya: Vec<f32> = a.push(&x).concat();
        let x2: Vec<f32> = x.iter().map(|v| v * 2.5).collect();
        let yb: Vec<f32> = b.push(&x2).concat();
        for (u, v) in ya.iter().zip(yb.iter()) {
            assert!((v - u * 2.5).abs() < 1e-4, "scaling input scales output");
        }
    }

    #[test]
    fn test_decimator_dc_gain_near_unity() {
        let mut rs = Resampler24to8::new(240);
        let blocks = rs.push(&vec![1.0; 480]);
        // Second block is past the zero-seeded memory warm-up.
        let settled = &blocks[1];
        for v in settled {
            assert!((v - 1.0).abs() < 0.05, "DC gain off unity: {v}");
        }
    }

    #[test]
    fn test_interpolator_dc_gain_near_unity() {
        let mut rs = Resampler8to24::new(240);
        let blocks = rs.push(&vec![1.0; 480]);
        let settled = &blocks[1];
        for v in settled {
            assert!((v - 1.0).abs() < 0.05, "DC gain off unity: {v}");
        }
    }

    /// 24 → 8 → 24 kHz round trip of a 1 kHz sine. After warm-up the
    /// output is the input delayed and lightly rippled; fitting the exact
    /// tone frequency recovers amplitude within the filter's passband
    /// ripple and leaves only stopband-image residue.
    #[test]
    fn test_sine_round_trip_within_ripple() {
        let fs = 24_000.0f64;
        let f0 = 1_000.0f64;
        let n = 4800;
        let input: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * f0 * i as f64 / fs).sin() as f32)
            .collect();

        let mut down = Resampler24to8::new(720);
        let mut up = Resampler8to24::new(240);
        let mut output = Vec::new();
        for block in down.push(&input) {
            for up_block in up.push(&block) {
                output.extend_from_slice(&up_block);
            }
        }
        assert!(output.len() >= 3600, "expected most of the signal back");

        // Least-squares tone fit over 100 whole periods, clear of edges.
        let window = &output[1200..3600];
        let (mut a, mut b) = (0.0f64, 0.0f64);
        for (i, &y) in window.iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * f0 * i as f64 / fs;
            a += y as f64 * phase.sin();
            b += y as f64 * phase.cos();
        }
        a *= 2.0 / window.len() as f64;
        b *= 2.0 / window.len() as f64;
        let amp = (a * a + b * b).sqrt();
        assert!((amp - 1.0).abs() < 0.1, "tone amplitude {amp} out of tolerance");

        let mut residual_sq = 0.0f64;
        for (i, &y) in window.iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * f0 * i as f64 / fs;
            let fit = a * phase.sin() + b * phase.cos();
            residual_sq += (y as f64 - fit) * (y as f64 - fit);
        }
        let residual_rms = (residual_sq / window.len() as f64).sqrt();
        assert!(residual_rms < 0.05, "non-tone residue too high: {residual_rms}");
    }
}
