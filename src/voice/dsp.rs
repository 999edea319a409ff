//! Digital filters and gain helpers for microphone audio
//!
//! Filters are direct-form IIR: `a` holds the feed-forward coefficients
//! applied to the input history, `b` the feedback coefficients applied to the
//! output history. Each filter keeps its own history so it can run over a
//! stream of chunks without discontinuities.

use std::f32::consts::PI;

/// Full-scale divisor for i16 → f32 conversion
const I16_SCALE: f32 = 32768.0;

/// Target peak-to-peak span for auto gain at sensitivity 0
const GAIN_BASE: f32 = 12_000.0;

/// Span added per sensitivity step
const GAIN_STEP: f32 = 800.0;

/// Filter response and its design frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterKind {
    /// Single-pole low-pass
    LowPass { cutoff: f32 },
    /// Four cascaded single-pole low-pass stages
    LowPassFourStage { cutoff: f32 },
    /// Single-pole high-pass
    HighPass { cutoff: f32 },
    /// Two-pole band-pass; `bandwidth` in Hz
    BandPass { center: f32, bandwidth: f32 },
}

impl FilterKind {
    /// Compute `(feed_forward, feedback)` coefficients for a sample rate
    #[must_use]
    pub fn coefficients(self, sample_rate: f32) -> (Vec<f32>, Vec<f32>) {
        match self {
            Self::LowPass { cutoff } => {
                let x = (-2.0 * PI * cutoff / sample_rate).exp();
                (vec![1.0 - x], vec![x])
            }
            Self::LowPassFourStage { cutoff } => {
                let x = (-14.445 * cutoff / sample_rate).exp();
                (
                    vec![(1.0 - x).powi(4)],
                    vec![4.0 * x, -6.0 * x * x, 4.0 * x.powi(3), -x.powi(4)],
                )
            }
            Self::HighPass { cutoff } => {
                let x = (-2.0 * PI * cutoff / sample_rate).exp();
                (vec![(1.0 + x) / 2.0, -(1.0 + x) / 2.0], vec![x])
            }
            Self::BandPass { center, bandwidth } => {
                let r = 1.0 - 3.0 * (bandwidth / sample_rate);
                let t = 2.0 * (2.0 * PI * center / sample_rate).cos();
                let k = (1.0 - r * t + r * r) / (2.0 - t);
                (vec![1.0 - k, (k - r) * t, r * r - k], vec![r * t, -r * r])
            }
        }
    }

    /// The same response moved to a new frequency
    #[must_use]
    pub const fn with_frequency(self, frequency: f32) -> Self {
        match self {
            Self::LowPass { .. } => Self::LowPass { cutoff: frequency },
            Self::LowPassFourStage { .. } => Self::LowPassFourStage { cutoff: frequency },
            Self::HighPass { .. } => Self::HighPass { cutoff: frequency },
            Self::BandPass { bandwidth, .. } => Self::BandPass {
                center: frequency,
                bandwidth,
            },
        }
    }
}

/// Stateful IIR filter
#[derive(Debug, Clone)]
pub struct IirFilter {
    kind: FilterKind,
    sample_rate: f32,
    a: Vec<f32>,
    b: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl IirFilter {
    /// Build a filter with zeroed history
    #[must_use]
    pub fn new(kind: FilterKind, sample_rate: f32) -> Self {
        let (a, b) = kind.coefficients(sample_rate);
        Self {
            kind,
            sample_rate,
            input: vec![0.0; a.len()],
            output: vec![0.0; b.len()],
            a,
            b,
        }
    }

    /// Current response
    #[must_use]
    pub const fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Move the design frequency, keeping the sample history
    pub fn set_frequency(&mut self, frequency: f32) {
        self.kind = self.kind.with_frequency(frequency);
        let (a, b) = self.kind.coefficients(self.sample_rate);
        self.a = a;
        self.b = b;
    }

    /// Filter one sample
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        self.input.rotate_right(1);
        self.input[0] = sample;

        let forward: f32 = self.a.iter().zip(&self.input).map(|(a, x)| a * x).sum();
        let feedback: f32 = self.b.iter().zip(&self.output).map(|(b, y)| b * y).sum();
        let result = forward + feedback;

        if !self.output.is_empty() {
            self.output.rotate_right(1);
            self.output[0] = result;
        }

        result
    }

    /// Filter a buffer in place
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples {
            *sample = self.process_sample(*sample);
        }
    }

    /// Filter i16 samples in place, saturating at the i16 range
    #[allow(clippy::cast_possible_truncation)]
    pub fn process_i16(&mut self, samples: &mut [i16]) {
        for sample in samples {
            *sample = self.process_sample(f32::from(*sample)) as i16;
        }
    }
}

/// Gain that stretches a chunk's peak-to-peak span to the target span
///
/// Returns 0 for a chunk with no span (silence or a flat signal).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn auto_gain(samples: &[i16], sensitivity: i32) -> f32 {
    let Some(max) = samples.iter().copied().max() else {
        return 0.0;
    };
    let min = samples.iter().copied().min().unwrap_or(max);

    let span = i32::from(max) - i32::from(min);
    if span == 0 {
        return 0.0;
    }

    (sensitivity as f32).mul_add(GAIN_STEP, GAIN_BASE) / span as f32
}

/// Multiply samples by a gain factor, saturating at the i16 range
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn apply_gain(samples: &[i16], gain: f32) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (f32::from(s) * gain) as i16)
        .collect()
}

/// Auto-gain a raw microphone chunk at the given sensitivity
#[must_use]
pub fn pre_process(samples: &[i16], sensitivity: i32) -> Vec<i16> {
    apply_gain(samples, auto_gain(samples, sensitivity))
}

/// Convert i16 PCM to f32 in [-1, 1)
#[must_use]
pub fn normalise(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / I16_SCALE).collect()
}

/// Serialize i16 PCM as little-endian bytes
#[must_use]
pub fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian PCM bytes, ignoring a trailing odd byte
#[must_use]
pub fn from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 16_000.0;

    fn sine(frequency: f32, amplitude: f32, len: usize) -> Vec<f32> {
        #[allow(clippy::cast_precision_loss)]
        (0..len)
            .map(|i| (2.0 * PI * frequency * i as f32 / RATE).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_low_pass_at_nyquist_passes_signal() {
        let input = sine(100.0, 0.5, 1600);
        let mut output = input.clone();
        IirFilter::new(FilterKind::LowPass { cutoff: RATE / 2.0 }, RATE).process(&mut output);

        for (x, y) in input.iter().zip(&output) {
            assert!((x - y).abs() < 0.01, "{x} vs {y}");
        }
    }

    #[test]
    fn test_low_pass_attenuates_high_frequency() {
        let mut output = sine(6000.0, 0.5, 1600);
        IirFilter::new(FilterKind::LowPass { cutoff: 100.0 }, RATE).process(&mut output);

        let peak = output[800..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak < 0.05, "peak {peak}");
    }

    #[test]
    fn test_high_pass_removes_dc() {
        let mut output = vec![0.5; 4000];
        IirFilter::new(FilterKind::HighPass { cutoff: 300.0 }, RATE).process(&mut output);

        assert!(output[3999].abs() < 0.01);
    }

    #[test]
    fn test_filters_are_stable_on_dc() {
        for kind in [
            FilterKind::LowPassFourStage { cutoff: 1000.0 },
            FilterKind::BandPass {
                center: 1000.0,
                bandwidth: 200.0,
            },
        ] {
            let mut output = vec![0.25; 8000];
            IirFilter::new(kind, RATE).process(&mut output);
            assert!(output.iter().all(|s| s.is_finite() && s.abs() < 2.0), "{kind:?}");
        }
    }

    #[test]
    fn test_set_frequency_keeps_history() {
        let mut filter = IirFilter::new(FilterKind::LowPass { cutoff: 500.0 }, RATE);
        let first = filter.process_sample(1.0);
        filter.set_frequency(1000.0);

        assert_eq!(filter.kind(), FilterKind::LowPass { cutoff: 1000.0 });
        // Feedback from the retained output history is still applied
        let (a, b) = filter.kind().coefficients(RATE);
        let expected = a[0].mul_add(1.0, b[0] * first);
        assert!((filter.process_sample(1.0) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_auto_gain_silence_is_zero() {
        assert!(auto_gain(&[0; 1280], 0).abs() < f32::EPSILON);
        assert!(auto_gain(&[], 3).abs() < f32::EPSILON);
        assert!(pre_process(&[0; 1280], 5).iter().all(|&s| s == 0));
    }

    #[test]
    fn test_auto_gain_targets_span() {
        let gain = auto_gain(&[-1000, 1000], 0);
        assert!((gain - 6.0).abs() < 1e-6);

        let gain = auto_gain(&[-1000, 1000], 5);
        assert!((gain - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_apply_gain_saturates() {
        assert_eq!(apply_gain(&[20_000, -20_000], 4.0), vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_sample_conversions() {
        assert_eq!(normalise(&[i16::MIN, 0, 16384]), vec![-1.0, 0.0, 0.5]);
        let bytes = to_le_bytes(&[1, -2]);
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff]);
        assert_eq!(from_le_bytes(&bytes), vec![1, -2]);
    }
}
