//! Frame synchronization: locating the PREAMBLE+START marker in a sample window
//!
//! The search runs in two phases. A rough scan classifies whole bits at a few
//! coarse offsets and looks for the 16-bit marker (last preamble byte followed
//! by START). The best rough hit is then refined sample by sample over the
//! START byte alone. Candidates are ranked by the smallest ONE/ZERO gap among
//! their START bits, so a coincidental match with one ambiguous bit loses to
//! a clean one.
//!
//! After a successful search the rest of the window is demodulated. Bits have
//! different lengths on channels where ZERO is longer than ONE, so the
//! demodulator advances by the length of the bit just decided. Whatever does
//! not form a complete segment is carried into [`FrameSynchronizer::continue_frame`].

use crate::bits::{rfind_pattern, BitBuffer};
use crate::config::Settings;
use crate::error::{LinkError, Result};
use crate::telegram::{PREAMBLE_BYTE, START_BYTE};
use crate::tone::ToneCodec;
use bitvec::prelude::*;
use log::debug;

/// Result of a successful marker search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    /// Position of the first START sample in the searched window
    pub start: usize,
    /// Position of the first content bit, correction included
    pub content_offset: usize,
    /// Worst START bit gap of the winning position
    pub gap: f32,
    /// Peak amplitude of the START segment in percent, if plausible
    pub volume_percent: Option<u8>,
}

pub struct FrameSynchronizer {
    codec: ToneCodec,
    big_step: usize,
    big_scan_rounds: usize,
    small_scan_rounds: usize,
    start_len: usize,
    correction: usize,
    /// Samples that did not fill a complete analysis segment
    pending: Vec<f32>,
    /// Samples of the next block still belonging to the last decided bit
    skip: usize,
}

impl FrameSynchronizer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            codec: ToneCodec::new(settings),
            big_step: settings.big_step,
            big_scan_rounds: settings.config.big_scan_rounds,
            small_scan_rounds: settings.small_scan_rounds,
            start_len: settings.start_len_samples,
            correction: settings.config.sync_offset_correction,
            pending: Vec::new(),
            skip: 0,
        }
    }

    pub fn codec(&mut self) -> &mut ToneCodec {
        &mut self.codec
    }

    /// Drop carried samples, e.g. after a telegram was completed or rejected
    pub fn reset(&mut self) {
        self.pending.clear();
        self.skip = 0;
    }

    /// Search `window` for the marker. On success `bits` is replaced by the
    /// content bits following START.
    pub fn locate(&mut self, window: &[f32], bits: &mut BitBuffer) -> Result<SyncPoint> {
        self.reset();
        let rough = self.rough_scan(window)?;
        let (start, gap) = self.fine_scan(window, rough)?;

        let content_offset = start + self.start_len + self.correction;
        if content_offset > window.len() {
            return Err(LinkError::InsufficientSamples);
        }

        let peak = window[start..start + self.start_len]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        let percent = (peak * 100.0).round();
        let volume_percent = if percent > 1.0 && percent < 100.0 {
            Some(percent as u8)
        } else {
            None
        };

        bits.clear();
        self.demodulate(&window[content_offset..], bits, true)?;
        debug!(
            "marker at {} (rough {}), content at {}, gap {:.4}, {} bits",
            start,
            rough,
            content_offset,
            gap,
            bits.available()
        );

        Ok(SyncPoint {
            start,
            content_offset,
            gap,
            volume_percent,
        })
    }

    /// Demodulate the next block of an already synchronized frame, starting
    /// with the samples carried over from the previous call.
    pub fn continue_frame(&mut self, block: &[f32], bits: &mut BitBuffer) -> Result<()> {
        let skipped = self.skip.min(block.len());
        self.skip -= skipped;
        if self.skip > 0 {
            return Ok(());
        }
        let mut joined = std::mem::take(&mut self.pending);
        joined.extend_from_slice(&block[skipped..]);
        self.demodulate(&joined, bits, false)
    }

    fn rough_scan(&mut self, window: &[f32]) -> Result<usize> {
        let seg = self.codec.segment_len();
        let nr_bits = (window.len() / seg).saturating_sub(1);
        let marker = BitVec::<u8, Msb0>::from_slice(&[PREAMBLE_BYTE, START_BYTE]);

        let mut best: Option<(usize, f32)> = None;
        for round in 1..self.big_scan_rounds {
            let offset = round * self.big_step;
            let mut scanned = BitVec::<u8, Msb0>::with_capacity(nr_bits);
            for i in 0..nr_bits {
                let from = offset + i * seg;
                scanned.push(self.codec.classify(&window[from..from + seg])?);
            }
            let Some(pos) = rfind_pattern(&scanned, &marker) else {
                continue;
            };
            let candidate = offset + (pos + 8) * seg;
            if let Some((_, gap)) = self.start_gap(window, candidate)? {
                if gap > best.map_or(0.0, |(_, g)| g) {
                    best = Some((candidate, gap));
                }
            }
        }
        best.map(|(pos, _)| pos).ok_or(LinkError::MarkerNotFound)
    }

    fn fine_scan(&mut self, window: &[f32], rough: usize) -> Result<(usize, f32)> {
        let half = self.small_scan_rounds / 2;
        let mut best = (0, 0.0f32);
        for pos in rough.saturating_sub(half)..=rough + half {
            if let Some((byte, gap)) = self.start_gap(window, pos)? {
                if byte == START_BYTE && gap > best.1 {
                    best = (pos, gap);
                }
            }
        }
        if best.1 > 0.0 {
            Ok(best)
        } else {
            Err(LinkError::MarkerNotFound)
        }
    }

    /// Classify the eight START bits assumed at `pos`, stepping by the length
    /// each expected bit occupies. Returns the decoded byte and the smallest
    /// gap, or `None` if START would run past the window.
    fn start_gap(&mut self, window: &[f32], pos: usize) -> Result<Option<(u8, f32)>> {
        let seg = self.codec.segment_len();
        let mut p = pos;
        let mut byte = 0u8;
        let mut min_gap = f32::MAX;
        for k in (0..8).rev() {
            if p + seg > window.len() {
                return Ok(None);
            }
            let spectrum = self.codec.spectrum(&window[p..p + seg])?;
            byte = (byte << 1) | spectrum.bit() as u8;
            min_gap = min_gap.min(spectrum.gap());
            p += self.codec.bit_len((START_BYTE >> k) & 1 == 1);
        }
        Ok(Some((byte, min_gap)))
    }

    fn demodulate(&mut self, samples: &[f32], bits: &mut BitBuffer, validate: bool) -> Result<()> {
        let seg = self.codec.segment_len();
        let mut pos = 0;
        while pos + seg <= samples.len() {
            let segment = &samples[pos..pos + seg];
            let bit = if validate {
                self.codec.classify_validated(segment)?
            } else {
                self.codec.classify(segment)?
            };
            bits.push(bit);
            pos += self.codec.bit_len(bit);
        }
        if pos <= samples.len() {
            self.pending = samples[pos..].to_vec();
            self.skip = 0;
        } else {
            self.pending.clear();
            self.skip = pos - samples.len();
        }
        Ok(())
    }
}
