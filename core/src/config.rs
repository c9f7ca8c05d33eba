//! Session configuration and the settings derived from it
//!
//! `Config` holds the handful of values a user may choose. Everything the
//! modem and the protocol need beyond that (bit lengths, FFT bins, chunk
//! geometry, timeouts) is computed once by [`derive_settings`] and never
//! changes for the lifetime of a session.

use crate::error::{LinkError, Result};
use std::time::Duration;

/// Pair of tone frequencies used to code a ONE and a ZERO bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyChannel {
    pub one_hz: u32,
    pub zero_hz: u32,
}

/// Frequency channel table, selected by `Config::frequency_channel`
pub const FREQUENCY_CHANNELS: [FrequencyChannel; 10] = [
    FrequencyChannel { one_hz: 600, zero_hz: 1200 },
    FrequencyChannel { one_hz: 1200, zero_hz: 1700 }, // V.23 mode 1
    FrequencyChannel { one_hz: 1200, zero_hz: 2100 }, // V.23 mode 2
    FrequencyChannel { one_hz: 1200, zero_hz: 2200 }, // Bell 202
    FrequencyChannel { one_hz: 1225, zero_hz: 2205 },
    FrequencyChannel { one_hz: 1200, zero_hz: 2400 },
    FrequencyChannel { one_hz: 3000, zero_hz: 4000 },
    FrequencyChannel { one_hz: 3000, zero_hz: 6000 },
    FrequencyChannel { one_hz: 4800, zero_hz: 5800 },
    FrequencyChannel { one_hz: 6600, zero_hz: 6800 },
];

/// Channels a session may be configured with
pub const ALLOWED_FREQUENCY_CHANNELS: [usize; 7] = [0, 2, 3, 4, 5, 6, 7];

pub const DEFAULT_FREQUENCY_CHANNEL: usize = 5;

// Telegram layout, in bytes
pub const START_LEN_BYTES: usize = 1;
pub const HEADER_LEN_BYTES: usize = 6; // START, ADDRESS, SEQ_NR, SEQ_NR_ACK, COMMAND, DATA_LEN
pub const FOOTER_LEN_BYTES: usize = 2; // END, CHECKSUM

/// Block size of the payload cipher
pub const ENCRYPTION_BLOCK_LEN: usize = 16;

/// Chat payloads may span at most this many telegrams
const MAX_TELEGRAMS_PER_TEXT: usize = 5000;

/// Rx/Tx processing allowance in the retransmission budget, in poll periods
const PROCESSING_POLL_PERIODS: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    /// Peak amplitude of the coding tones
    pub amplitude: f32,
    /// Minimum FFT magnitude a content bit must reach
    pub detection_level: f32,
    /// Index into [`FREQUENCY_CHANNELS`]
    pub frequency_channel: usize,
    pub preamble_len_bytes: usize,
    /// Trailing 0x00 bytes absorbing end-of-signal distortion
    pub terminator_len_bytes: usize,
    pub telegram_max_len_bytes: usize,
    pub chunks_per_telegram: usize,
    /// Capacity of the circular transmit buffer, in telegrams
    pub telegrams_in_parallel: usize,
    /// One-way delay of the audio channel
    pub channel_delay: Duration,
    pub max_resends: u32,
    pub tx_poll_period: Duration,
    /// Coarse offsets tried per bit during the rough scan
    pub big_scan_rounds: usize,
    /// Empirical correction added to the position of the first content bit
    pub sync_offset_correction: usize,
    /// Band-pass modulated telegrams before they are queued for playing
    pub tx_band_pass: bool,
    /// Band-pass captured audio before it reaches the synchronizer
    pub rx_band_pass: bool,
    /// Distance of the filter edges from the coding tones
    pub filter_margin_hz: f32,
    /// Mix a pilot tone under everything played
    pub add_carrier: bool,
    /// Notch the peer's pilot tone out of the received voice
    pub remove_rx_carrier: bool,
    pub carrier_hz: f32,
    pub carrier_amplitude: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            amplitude: 0.5,
            detection_level: 0.001,
            frequency_channel: DEFAULT_FREQUENCY_CHANNEL,
            preamble_len_bytes: 4,
            terminator_len_bytes: 1,
            telegram_max_len_bytes: 32,
            chunks_per_telegram: 1,
            telegrams_in_parallel: 8,
            channel_delay: Duration::from_millis(350),
            max_resends: 3,
            tx_poll_period: Duration::from_millis(10),
            big_scan_rounds: 4,
            sync_offset_correction: 3,
            tx_band_pass: false,
            rx_band_pass: false,
            filter_margin_hz: 400.0,
            add_carrier: false,
            remove_rx_carrier: true,
            carrier_hz: 375.0,
            carrier_amplitude: 0.01,
        }
    }
}

/// Everything derived from a [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config: Config,
    pub freq_one: f32,
    pub freq_zero: f32,
    /// Samples of one ONE bit (one cycle of `freq_one`)
    pub len_bit_one: usize,
    /// Samples of one ZERO bit (two cycles of `freq_zero`)
    pub len_bit_zero: usize,
    /// FFT bins for a `len_bit_one` segment
    pub bin_one_fine: usize,
    pub bin_zero_fine: usize,
    /// Analysis window N, the length of the preamble
    pub window_len: usize,
    /// FFT bin of `freq_one` in an N-sample window
    pub bin_one_window: usize,
    pub start_len_samples: usize,
    /// Samples kept from the previous round so a cut START can be recovered
    pub previous_samples: usize,
    pub data_max_len_bytes: usize,
    pub max_text_len: usize,
    pub telegram_max_len_bits: usize,
    pub telegram_max_len_samples: usize,
    /// Block length of the audio streams, in both directions
    pub chunk_len: usize,
    pub rounds_per_chunk: usize,
    /// Chunks reserved per telegram slot in the transmit arena
    pub slot_chunks: usize,
    /// Rough-scan step in samples
    pub big_step: usize,
    /// Width of the fine scan in samples
    pub small_scan_rounds: usize,
    pub telegram_duration: Duration,
    pub retransmission_short: Duration,
    pub retransmission_long: Duration,
    /// Upper bound for the half-duplex receive flag
    pub receive_timeout: Duration,
    /// Lower edge of the coding band, margin included
    pub band_low_hz: f32,
    pub band_high_hz: f32,
}

impl Settings {
    pub fn overhead_len_bytes(&self) -> usize {
        self.config.preamble_len_bytes
            + HEADER_LEN_BYTES
            + FOOTER_LEN_BYTES
            + self.config.terminator_len_bytes
    }

    pub fn slot_len(&self) -> usize {
        self.slot_chunks * self.chunk_len
    }
}

/// Compute every derived quantity of a session, validating the result.
pub fn derive_settings(config: &Config) -> Result<Settings> {
    if !ALLOWED_FREQUENCY_CHANNELS.contains(&config.frequency_channel) {
        return Err(LinkError::InvalidConfig(format!(
            "frequency channel {} not in {:?}",
            config.frequency_channel, ALLOWED_FREQUENCY_CHANNELS
        )));
    }
    if config.sample_rate == 0 {
        return Err(LinkError::InvalidConfig("sample rate must be positive".into()));
    }
    if !(config.amplitude > 0.0 && config.amplitude <= 1.0) {
        return Err(LinkError::InvalidConfig(format!(
            "amplitude {} outside (0, 1]",
            config.amplitude
        )));
    }
    if config.chunks_per_telegram == 0 || config.telegrams_in_parallel < 2 {
        return Err(LinkError::InvalidConfig(
            "need at least one chunk per telegram and two telegram slots".into(),
        ));
    }
    if config.tx_poll_period.is_zero() {
        return Err(LinkError::InvalidConfig("TX poll period must be positive".into()));
    }

    let channel = FREQUENCY_CHANNELS[config.frequency_channel];
    let fs = config.sample_rate as usize;
    let nyquist = config.sample_rate as f32 / 2.0;

    let band_low_hz = channel.one_hz.min(channel.zero_hz) as f32 - config.filter_margin_hz;
    let band_high_hz = channel.one_hz.max(channel.zero_hz) as f32 + config.filter_margin_hz;
    if !(config.filter_margin_hz >= 0.0 && band_low_hz > 0.0 && band_high_hz < nyquist) {
        return Err(LinkError::InvalidConfig(format!(
            "coding band {}..{} Hz outside (0, {}) Hz",
            band_low_hz, band_high_hz, nyquist
        )));
    }
    if !(config.carrier_hz > 0.0 && config.carrier_hz < nyquist) {
        return Err(LinkError::InvalidConfig(format!(
            "carrier {} Hz outside (0, {}) Hz",
            config.carrier_hz, nyquist
        )));
    }
    if !(0.0..1.0).contains(&config.carrier_amplitude) {
        return Err(LinkError::InvalidConfig(format!(
            "carrier amplitude {} outside [0, 1)",
            config.carrier_amplitude
        )));
    }
    let len_bit_one = fs / channel.one_hz as usize;
    let len_bit_zero = 2 * (fs / channel.zero_hz as usize);
    if len_bit_zero < len_bit_one {
        return Err(LinkError::InvalidConfig(format!(
            "ZERO bit ({} samples) shorter than ONE bit ({} samples)",
            len_bit_zero, len_bit_one
        )));
    }
    if config.big_scan_rounds < 2 || len_bit_one < config.big_scan_rounds {
        return Err(LinkError::InvalidConfig(format!(
            "{} rough-scan rounds do not fit a {}-sample bit",
            config.big_scan_rounds, len_bit_one
        )));
    }

    let bin = |freq: u32, len: usize| {
        (freq as f64 * len as f64 / config.sample_rate as f64).round() as usize
    };
    let bin_one_fine = bin(channel.one_hz, len_bit_one);
    let bin_zero_fine = bin(channel.zero_hz, len_bit_one);
    if bin_one_fine == bin_zero_fine || bin_zero_fine >= len_bit_one / 2 {
        return Err(LinkError::InvalidConfig(format!(
            "ONE/ZERO tones not separable in a {}-sample bit (bins {} and {})",
            len_bit_one, bin_one_fine, bin_zero_fine
        )));
    }

    let overhead = config.preamble_len_bytes
        + HEADER_LEN_BYTES
        + FOOTER_LEN_BYTES
        + config.terminator_len_bytes;
    if config.preamble_len_bytes == 0 || config.telegram_max_len_bytes <= overhead {
        return Err(LinkError::InvalidConfig(format!(
            "telegram of {} bytes leaves no room for data after {} bytes overhead",
            config.telegram_max_len_bytes, overhead
        )));
    }
    let data_max_len_bytes = config.telegram_max_len_bytes - overhead;
    if data_max_len_bytes > u8::MAX as usize {
        return Err(LinkError::InvalidConfig(format!(
            "data length {} does not fit the DATA_LEN field",
            data_max_len_bytes
        )));
    }

    let telegram_max_len_bits = config.telegram_max_len_bytes * 8;
    let telegram_max_len_samples = len_bit_one * telegram_max_len_bits;
    let window_len = len_bit_one * config.preamble_len_bytes * 8;
    let chunk_len = telegram_max_len_samples / config.chunks_per_telegram;
    if chunk_len == 0 || chunk_len % window_len != 0 {
        return Err(LinkError::InvalidConfig(format!(
            "chunk length {} not divisible by analysis window {}",
            chunk_len, window_len
        )));
    }

    let start_len_samples = START_LEN_BYTES * 4 * (len_bit_one + len_bit_zero);
    let previous_samples = start_len_samples + 8 * len_bit_one;
    if previous_samples > window_len {
        return Err(LinkError::InvalidConfig(format!(
            "preamble of {} samples cannot hold last preamble byte and START ({} samples)",
            window_len, previous_samples
        )));
    }

    // a frame made only of ZERO bits is the longest one possible
    let max_frame_samples = telegram_max_len_bits * len_bit_zero;
    let slot_chunks = max_frame_samples.div_ceil(chunk_len);

    let seconds = |samples: usize| samples as f64 / config.sample_rate as f64;
    let telegram_secs = seconds(telegram_max_len_samples);
    let poll_secs = config.tx_poll_period.as_secs_f64();
    let retransmission_secs = 2.0 * telegram_secs
        + 2.0 * config.channel_delay.as_secs_f64()
        + PROCESSING_POLL_PERIODS as f64 * poll_secs
        + seconds(chunk_len);
    let short_polls = (retransmission_secs / poll_secs + 1e-9).floor() as u32;
    let long_polls = (1.5 * short_polls as f64).floor() as u32;

    Ok(Settings {
        config: config.clone(),
        freq_one: channel.one_hz as f32,
        freq_zero: channel.zero_hz as f32,
        len_bit_one,
        len_bit_zero,
        bin_one_fine,
        bin_zero_fine,
        window_len,
        bin_one_window: bin(channel.one_hz, window_len),
        start_len_samples,
        previous_samples,
        data_max_len_bytes,
        max_text_len: data_max_len_bytes * MAX_TELEGRAMS_PER_TEXT,
        telegram_max_len_bits,
        telegram_max_len_samples,
        chunk_len,
        rounds_per_chunk: chunk_len / window_len,
        slot_chunks,
        big_step: len_bit_one / config.big_scan_rounds,
        small_scan_rounds: (len_bit_one / config.big_scan_rounds) * 2,
        telegram_duration: Duration::from_secs_f64(telegram_secs),
        retransmission_short: config.tx_poll_period * short_polls,
        retransmission_long: config.tx_poll_period * long_polls,
        receive_timeout: config.channel_delay + Duration::from_secs_f64(telegram_secs),
        band_low_hz,
        band_high_hz,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = derive_settings(&Config::default()).unwrap();
        assert_eq!(s.len_bit_one, 40);
        assert_eq!(s.len_bit_zero, 40);
        assert_eq!(s.bin_one_fine, 1);
        assert_eq!(s.bin_zero_fine, 2);
        assert_eq!(s.window_len, 1280);
        assert_eq!(s.bin_one_window, 32);
        assert_eq!(s.chunk_len, 10240);
        assert_eq!(s.rounds_per_chunk, 8);
        assert_eq!(s.start_len_samples, 320);
        assert_eq!(s.previous_samples, 640);
        assert_eq!(s.data_max_len_bytes, 19);
        assert_eq!(s.max_text_len, 19 * 5000);
        assert_eq!(s.slot_chunks, 1);
        assert_eq!(s.big_step, 10);
        assert_eq!(s.small_scan_rounds, 20);
    }

    #[test]
    fn test_retransmission_timeouts() {
        let s = derive_settings(&Config::default()).unwrap();
        // 2 * 213.3ms + 2 * 350ms + 60ms + 213.3ms = 1.4s
        assert_eq!(s.retransmission_short, Duration::from_millis(1400));
        assert_eq!(s.retransmission_long, Duration::from_millis(2100));
        assert!(s.receive_timeout > Duration::from_millis(563));
        assert!(s.receive_timeout < Duration::from_millis(564));
    }

    #[test]
    fn test_unequal_bit_lengths_get_larger_slots() {
        let config = Config { frequency_channel: 2, ..Config::default() };
        let s = derive_settings(&config).unwrap();
        assert_eq!(s.len_bit_one, 40);
        assert_eq!(s.len_bit_zero, 44);
        assert_eq!(s.slot_chunks, 2);
    }

    #[test]
    fn test_rejects_disallowed_channel() {
        let config = Config { frequency_channel: 1, ..Config::default() };
        match derive_settings(&config) {
            Err(LinkError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_colliding_bins() {
        // 3000/4000 Hz land in the same bin of a 16-sample segment
        let config = Config { frequency_channel: 6, ..Config::default() };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_chunk_not_divisible_by_window() {
        let config = Config { chunks_per_telegram: 3, ..Config::default() };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_filter_band_beyond_nyquist() {
        let config = Config {
            sample_rate: 8000,
            frequency_channel: 7,
            ..Config::default()
        };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));

        // 600 Hz ONE tone minus a 700 Hz margin
        let config = Config {
            frequency_channel: 0,
            filter_margin_hz: 700.0,
            ..Config::default()
        };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_carrier() {
        let config = Config { carrier_amplitude: 1.0, ..Config::default() };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
        let config = Config { carrier_hz: 0.0, ..Config::default() };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_telegram_without_data_room() {
        let config = Config { telegram_max_len_bytes: 13, ..Config::default() };
        assert!(matches!(derive_settings(&config), Err(LinkError::InvalidConfig(_))));
    }
}
