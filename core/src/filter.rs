//! Stateful IIR filters keeping voice and coding tones apart
//!
//! Built from second-order Butterworth sections of the `biquad` crate. Every
//! filter keeps its state between calls, so a stream can be run through it
//! block by block.

use crate::config::Settings;
use crate::error::{LinkError, Result};
use biquad::*;

/// Quality factor of the pilot tone notch, wide enough to absorb drift
pub const CARRIER_NOTCH_Q: f32 = 0.3;

#[derive(Debug, Clone, Copy)]
enum Kind {
    LowPass,
    HighPass,
    Notch,
}

fn section(kind: Kind, sample_rate: u32, cutoff: f32, q: f32) -> Result<DirectForm2Transposed<f32>> {
    let filter = match kind {
        Kind::LowPass => Type::LowPass,
        Kind::HighPass => Type::HighPass,
        Kind::Notch => Type::Notch,
    };
    let coefficients = Coefficients::<f32>::from_params(filter, sample_rate.hz(), cutoff.hz(), q)
        .map_err(|e| LinkError::InvalidConfig(format!("{:?} at {} Hz: {:?}", kind, cutoff, e)))?;
    Ok(DirectForm2Transposed::<f32>::new(coefficients))
}

/// Passes `low_hz..high_hz`: a high-pass and a low-pass section in series
pub struct BandPass {
    high_pass: DirectForm2Transposed<f32>,
    low_pass: DirectForm2Transposed<f32>,
}

impl BandPass {
    pub fn new(sample_rate: u32, low_hz: f32, high_hz: f32) -> Result<Self> {
        Ok(Self {
            high_pass: section(Kind::HighPass, sample_rate, low_hz, Q_BUTTERWORTH_F32)?,
            low_pass: section(Kind::LowPass, sample_rate, high_hz, Q_BUTTERWORTH_F32)?,
        })
    }

    /// Coding band of a session, widened by the configured margin
    pub fn coding(settings: &Settings) -> Result<Self> {
        Self::new(settings.config.sample_rate, settings.band_low_hz, settings.band_high_hz)
    }

    pub fn run(&mut self, x: f32) -> f32 {
        self.high_pass.run(self.low_pass.run(x))
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.run(*s);
        }
    }
}

/// Rejects `low_hz..high_hz` by summing a low-pass below and a high-pass
/// above the band, two sections each
pub struct BandStop {
    low_pass: [DirectForm2Transposed<f32>; 2],
    high_pass: [DirectForm2Transposed<f32>; 2],
}

impl BandStop {
    pub fn new(sample_rate: u32, low_hz: f32, high_hz: f32) -> Result<Self> {
        let low = || section(Kind::LowPass, sample_rate, low_hz, Q_BUTTERWORTH_F32);
        let high = || section(Kind::HighPass, sample_rate, high_hz, Q_BUTTERWORTH_F32);
        Ok(Self {
            low_pass: [low()?, low()?],
            high_pass: [high()?, high()?],
        })
    }

    /// Keeps voice out of the coding band of a session
    pub fn voice(settings: &Settings) -> Result<Self> {
        Self::new(settings.config.sample_rate, settings.band_low_hz, settings.band_high_hz)
    }

    pub fn run(&mut self, x: f32) -> f32 {
        let [l1, l2] = &mut self.low_pass;
        let [h1, h2] = &mut self.high_pass;
        l2.run(l1.run(x)) + h2.run(h1.run(x))
    }
}

pub struct Notch(DirectForm2Transposed<f32>);

impl Notch {
    pub fn new(sample_rate: u32, hz: f32, q: f32) -> Result<Self> {
        Ok(Self(section(Kind::Notch, sample_rate, hz, q)?))
    }

    pub fn run(&mut self, x: f32) -> f32 {
        self.0.run(x)
    }
}

/// Low pilot tone mixed under the output. The phase runs on across blocks.
pub struct Carrier {
    amplitude: f32,
    step: f64,
    phase: f64,
}

impl Carrier {
    pub fn new(settings: &Settings) -> Self {
        let config = &settings.config;
        Self {
            amplitude: config.carrier_amplitude,
            step: std::f64::consts::TAU * config.carrier_hz as f64 / config.sample_rate as f64,
            phase: 0.0,
        }
    }

    /// Scale `out` down by the carrier amplitude and add the carrier
    pub fn apply(&mut self, out: &mut [f32]) {
        let keep = 1.0 - self.amplitude;
        for s in out.iter_mut() {
            *s = *s * keep + self.amplitude * self.phase.sin() as f32;
            self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        }
    }
}

/// What the user hears of the peer: captured audio without the coding band
/// and, optionally, without the peer's pilot tone
pub struct VoiceOutput {
    band_stop: BandStop,
    notch: Option<Notch>,
}

impl VoiceOutput {
    pub fn new(settings: &Settings) -> Result<Self> {
        let config = &settings.config;
        let notch = if config.remove_rx_carrier {
            Some(Notch::new(config.sample_rate, config.carrier_hz, CARRIER_NOTCH_Q)?)
        } else {
            None
        };
        Ok(Self {
            band_stop: BandStop::voice(settings)?,
            notch,
        })
    }

    pub fn process(&mut self, input: &[f32], out: &mut [f32]) {
        for (o, x) in out.iter_mut().zip(input) {
            let voice = self.band_stop.run(*x);
            *o = match self.notch.as_mut() {
                Some(notch) => notch.run(voice),
                None => voice,
            };
        }
    }
}
