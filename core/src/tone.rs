//! Waveform codec: bits to tone segments and back
//!
//! A ONE is one cycle of `freq_one` spanning `len_bit_one` samples, a ZERO
//! two cycles of `freq_zero` spanning `len_bit_zero` samples. Classification
//! runs a real-valued FFT over a `len_bit_one` segment and compares the
//! magnitudes `2·|X[k]|/n` at the bins nearest to both tone frequencies.

use crate::config::Settings;
use crate::error::{LinkError, Result};
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// Spectral magnitudes of one bit segment at the ONE and ZERO bins
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitSpectrum {
    pub one: f32,
    pub zero: f32,
}

impl BitSpectrum {
    pub fn bit(&self) -> bool {
        self.one > self.zero
    }

    /// Distance between both bins; the larger, the more trustworthy the bit
    pub fn gap(&self) -> f32 {
        (self.one - self.zero).abs()
    }

    /// Magnitude of the winning bin
    pub fn level(&self) -> f32 {
        if self.bit() {
            self.one
        } else {
            self.zero
        }
    }
}

/// Real FFT of a fixed length with reusable scratch buffers
struct Spectrum {
    fft: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
}

impl Spectrum {
    fn new(planner: &mut RealFftPlanner<f32>, len: usize) -> Self {
        let fft = planner.plan_fft_forward(len);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();
        Self { fft, input, output }
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    /// Magnitude `2·|X[k]|/n` of each requested bin
    fn magnitudes<const K: usize>(&mut self, samples: &[f32], bins: [usize; K]) -> Result<[f32; K]> {
        let n = self.len();
        if samples.len() != n {
            return Err(LinkError::FftError(format!(
                "segment of {} samples for a {}-point FFT",
                samples.len(),
                n
            )));
        }
        self.input.copy_from_slice(samples);
        self.fft
            .process(&mut self.input, &mut self.output)
            .map_err(|e| LinkError::FftError(format!("FFT forward process failed: {:?}", e)))?;

        let mut out = [0.0; K];
        for (slot, &bin) in out.iter_mut().zip(bins.iter()) {
            // only the first half of the spectrum is meaningful for real input
            *slot = if bin < n / 2 {
                2.0 * self.output[bin].norm() / n as f32
            } else {
                0.0
            };
        }
        Ok(out)
    }
}

/// Generate `len` samples of `amplitude * sin(2π f t)`, starting at phase zero
pub fn generate_tone(freq: f32, len: usize, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

pub struct ToneCodec {
    one: Vec<f32>,
    zero: Vec<f32>,
    bin_one: usize,
    bin_zero: usize,
    bin_one_window: usize,
    detection_level: f32,
    bit_fft: Spectrum,
    window_fft: Spectrum,
}

impl ToneCodec {
    pub fn new(settings: &Settings) -> Self {
        let cfg = &settings.config;
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            one: generate_tone(settings.freq_one, settings.len_bit_one, cfg.sample_rate, cfg.amplitude),
            zero: generate_tone(settings.freq_zero, settings.len_bit_zero, cfg.sample_rate, cfg.amplitude),
            bin_one: settings.bin_one_fine,
            bin_zero: settings.bin_zero_fine,
            bin_one_window: settings.bin_one_window,
            detection_level: cfg.detection_level,
            bit_fft: Spectrum::new(&mut planner, settings.len_bit_one),
            window_fft: Spectrum::new(&mut planner, settings.window_len),
        }
    }

    /// Precomputed tone segment for `bit`
    pub fn encode_bit(&self, bit: bool) -> &[f32] {
        if bit {
            &self.one
        } else {
            &self.zero
        }
    }

    /// Samples occupied by `bit` on the wire
    pub fn bit_len(&self, bit: bool) -> usize {
        self.encode_bit(bit).len()
    }

    /// Length of the analysis segment used for every bit decision
    pub fn segment_len(&self) -> usize {
        self.bit_fft.len()
    }

    pub fn spectrum(&mut self, segment: &[f32]) -> Result<BitSpectrum> {
        let [one, zero] = self.bit_fft.magnitudes(segment, [self.bin_one, self.bin_zero])?;
        Ok(BitSpectrum { one, zero })
    }

    /// Classify a segment without checking signal strength. Used while
    /// scanning for the marker, where weak segments are expected.
    pub fn classify(&mut self, segment: &[f32]) -> Result<bool> {
        Ok(self.spectrum(segment)?.bit())
    }

    /// Classify a segment whose result is trusted as telegram content.
    pub fn classify_validated(&mut self, segment: &[f32]) -> Result<bool> {
        let spectrum = self.spectrum(segment)?;
        let level = spectrum.level();
        if level > self.detection_level {
            Ok(spectrum.bit())
        } else {
            Err(LinkError::WeakSignal { level })
        }
    }

    /// Magnitude at the ONE frequency over a full analysis window
    pub fn preamble_level(&mut self, window: &[f32]) -> Result<f32> {
        let [level] = self.window_fft.magnitudes(window, [self.bin_one_window])?;
        Ok(level)
    }

    pub fn preamble_detected(&mut self, window: &[f32]) -> Result<bool> {
        Ok(self.preamble_level(window)? > self.detection_level)
    }
}
