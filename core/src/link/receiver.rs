//! Receive pipeline: preamble detection, synchronization, telegram decoding
//! and command dispatch
//!
//! Input arrives in chunks of `chunk_len` samples, processed as
//! `rounds_per_chunk` rounds of one analysis window each. While searching, a
//! round is only handed to the synchronizer when it carries preamble energy
//! or directly follows such a round; the window passed along is extended by
//! `previous_samples` taken from before the round, so a START cut at a round
//! boundary is still found.

use super::{lock, Counters, LinkShared, ParseState};
use crate::bits::BitBuffer;
use crate::error::{LinkError, Result};
use crate::filter::BandPass;
use crate::sync::FrameSynchronizer;
use crate::telegram::{Command, DecodeStatus, Received, Telegram, TelegramDecoder};
use log::{debug, error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub struct Receiver {
    shared: Arc<LinkShared>,
    sync: FrameSynchronizer,
    decoder: TelegramDecoder,
    bits: BitBuffer,
    parse_state: ParseState,
    /// Tail of the previous chunk
    previous: Vec<f32>,
    /// Samples not yet forming a complete chunk
    pending: Vec<f32>,
    window: Vec<f32>,
    /// Coding band filter, built on first use when enabled
    band_pass: Option<BandPass>,
    /// Telegrams completed since construction, newest last
    log: Vec<Received>,
    keep_log: bool,
}

impl Receiver {
    pub fn new(shared: Arc<LinkShared>) -> Self {
        let settings = &shared.settings;
        Self {
            sync: FrameSynchronizer::new(settings),
            decoder: TelegramDecoder::new(settings.data_max_len_bytes),
            bits: BitBuffer::new(),
            parse_state: ParseState::SearchPreamble,
            previous: vec![0.0; settings.previous_samples],
            pending: Vec::with_capacity(settings.chunk_len),
            window: Vec::with_capacity(settings.previous_samples + settings.window_len),
            band_pass: None,
            log: Vec::new(),
            keep_log: false,
            shared,
        }
    }

    /// Keep a copy of every decoded telegram, for offline decoding
    pub fn with_log(mut self) -> Self {
        self.keep_log = true;
        self
    }

    pub fn parse_state(&self) -> ParseState {
        self.parse_state
    }

    pub fn take_log(&mut self) -> Vec<Received> {
        std::mem::take(&mut self.log)
    }

    /// Drop any partial telegram and buffered input, as after a purge
    pub fn reset(&mut self) {
        self.reset_search();
        self.pending.clear();
        self.previous.clear();
        self.previous.resize(self.shared.settings.previous_samples, 0.0);
        self.band_pass = None;
        debug!("receiver reset");
    }

    /// Feed an arbitrary number of samples; complete chunks are processed
    /// immediately, the rest waits for the next call.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<()> {
        let chunk_len = self.shared.settings.chunk_len;
        let filtered;
        let mut rest = samples;
        if self.shared.settings.config.rx_band_pass {
            if self.band_pass.is_none() {
                self.band_pass = Some(BandPass::coding(&self.shared.settings)?);
            }
            if let Some(band_pass) = self.band_pass.as_mut() {
                filtered = samples.iter().map(|x| band_pass.run(*x)).collect::<Vec<f32>>();
                rest = filtered.as_slice();
            }
        }
        if !self.pending.is_empty() {
            let take = (chunk_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() < chunk_len {
                return Ok(());
            }
            let chunk = std::mem::take(&mut self.pending);
            self.process_chunk(&chunk)?;
            self.pending = chunk;
            self.pending.clear();
        }
        while rest.len() >= chunk_len {
            self.process_chunk(&rest[..chunk_len])?;
            rest = &rest[chunk_len..];
        }
        self.pending.extend_from_slice(rest);
        Ok(())
    }

    /// Process exactly one chunk of `chunk_len` samples
    pub fn process_chunk(&mut self, chunk: &[f32]) -> Result<()> {
        let n = self.shared.settings.window_len;
        let prev_len = self.shared.settings.previous_samples;
        let rounds = chunk.len() / n;
        let mut preamble_round: Option<usize> = None;

        for m in 0..rounds {
            let round = &chunk[m * n..(m + 1) * n];
            match self.parse_state {
                ParseState::SearchPreamble | ParseState::SearchStart => {
                    let detected = self.sync.codec().preamble_detected(round)?;
                    let follows_preamble = preamble_round.is_some_and(|p| p + 1 == m);
                    let carried = self.parse_state == ParseState::SearchStart && m == 0;
                    if !(detected || follows_preamble || carried) {
                        continue;
                    }
                    if detected {
                        preamble_round = Some(m);
                        self.parse_state = ParseState::SearchStart;
                    }

                    let located = if m == 0 {
                        self.window.clear();
                        self.window.extend_from_slice(&self.previous);
                        self.window.extend_from_slice(round);
                        self.sync.locate(&self.window, &mut self.bits)
                    } else {
                        self.sync.locate(&chunk[m * n - prev_len..(m + 1) * n], &mut self.bits)
                    };
                    match located {
                        Ok(point) => {
                            self.parse_state = ParseState::DecodeFrame;
                            self.shared.receive.start();
                            if let Some(volume) = point.volume_percent {
                                self.shared.set_input_volume(volume);
                            }
                            self.decode_telegram();
                        }
                        Err(LinkError::FftError(e)) => return Err(LinkError::FftError(e)),
                        Err(e) => {
                            debug!("round {}: {}", m, e);
                            if !detected {
                                self.reset_search();
                            }
                        }
                    }
                }
                ParseState::DecodeFrame => {
                    self.sync.continue_frame(round, &mut self.bits)?;
                    self.decode_telegram();
                }
            }
        }

        let tail = chunk.len().saturating_sub(prev_len);
        self.previous.clear();
        self.previous.extend_from_slice(&chunk[tail..]);
        Ok(())
    }

    fn reset_search(&mut self) {
        self.parse_state = ParseState::SearchPreamble;
        self.decoder.reset();
        self.sync.reset();
        self.bits.clear();
    }

    fn decode_telegram(&mut self) {
        let last_acked = self.shared.seq_nr_ack.load(Ordering::SeqCst);
        match self.decoder.decode(&mut self.bits, last_acked) {
            Ok(DecodeStatus::NeedMoreBits) => {}
            Ok(DecodeStatus::Complete(received)) => {
                info!(
                    "RX {}{}",
                    received.telegram,
                    if received.repeated { " (repeated)" } else { "" }
                );
                self.dispatch(&received);
                if self.keep_log {
                    self.log.push(received);
                }
                self.reset_search();
                self.shared.receive.finish();
            }
            Err(e) => {
                error!("RX telegram dropped: {}", e);
                if e.is_protocol_error() {
                    Counters::bump(&self.shared.counters.rx_nok);
                }
                self.reset_search();
                self.shared.receive.finish();
            }
        }
    }

    fn dispatch(&self, received: &Received) {
        let t = &received.telegram;
        let shared = &self.shared;

        if t.ack {
            shared.record_ack(t.seq_nr_ack, Instant::now());
            shared.rx_status.push(String::new());
            debug!("ACK for SeqNr {}", t.seq_nr_ack);
        }

        if !t.command.is_sequenced() {
            self.on_unsequenced(t);
            return;
        }

        if received.repeated {
            info!("{} with repeated SeqNr {}, acknowledged again", t.command, t.seq_nr);
            shared.rx_status.push(format!("RX: {} (rep)", t.command));
        } else {
            if let Err(e) = self.on_new_seq_nr(t) {
                error!("RX {} rejected: {}", t.command, e);
                Counters::bump(&shared.counters.rx_nok);
                return;
            }
            shared.seq_nr_ack.store(t.seq_nr, Ordering::SeqCst);
            Counters::bump(&shared.counters.rx_ok);
            if t.command == Command::CallEnd {
                shared.events.call_end.raise();
                shared.reset_after_ack.raise();
                shared.rx_status.push("RX: CALL END".into());
                info!("received CALL_END");
            }
        }
        shared.send_ack.store(true, Ordering::SeqCst);
    }

    /// Payload handling of a telegram carrying the next sequence number. An
    /// error leaves the sequence number unacknowledged.
    fn on_new_seq_nr(&self, t: &Telegram) -> Result<()> {
        let shared = &self.shared;
        match t.command {
            Command::ChatData => {
                let text = shared.cipher()?.decrypt_text(&t.data)?;
                info!("received message of {} bytes", text.len());
                shared.messages.push(text);
                shared.rx_status.push("RX: DATA".into());
            }
            Command::ChatDataStart => {
                let mut fragments = lock(&shared.fragments);
                fragments.clear();
                fragments.extend_from_slice(&t.data);
                shared.rx_status.push("RX: DATA START".into());
            }
            Command::ChatDataPart => {
                lock(&shared.fragments).extend_from_slice(&t.data);
                shared.rx_status.push("RX: DATA PART".into());
            }
            Command::ChatDataEnd => {
                let cipher = shared.cipher()?;
                let mut fragments = lock(&shared.fragments);
                let before = fragments.len();
                fragments.extend_from_slice(&t.data);
                match cipher.decrypt_text(&fragments) {
                    Ok(text) => {
                        fragments.clear();
                        info!("received fragmented message of {} bytes", text.len());
                        shared.messages.push(text);
                        shared.rx_status.push("RX: DATA END".into());
                    }
                    Err(e) => {
                        // a retransmitted END must find the fragments as they were
                        fragments.truncate(before);
                        return Err(e);
                    }
                }
            }
            Command::CallRejected => {
                shared.events.call_rejected.raise();
                shared.rx_status.push("RX: CALL REJECTED".into());
                info!("received CALL_REJECTED");
            }
            Command::StartupDataComplete => {
                let name = shared.cipher()?.decrypt_text(&t.data)?;
                info!("received STARTUP_DATA_COMPLETE, partner {}", name);
                shared.set_partner_name(name);
                shared.events.startup_data.raise();
                shared.rx_status.push("RX: STARTUP COMPLETE".into());
            }
            _ => {}
        }
        Ok(())
    }

    /// Call setup commands. They carry no sequence number of their own and
    /// are never acknowledged.
    fn on_unsequenced(&self, t: &Telegram) {
        let shared = &self.shared;
        match t.command {
            Command::Call => {
                let peer_token = t.data.first().copied().unwrap_or(0);
                // the caller starts counting from zero, so do we
                shared.reset_seq_nrs();
                shared.resolve_token(peer_token);
                shared.events.call.raise();
                Counters::bump(&shared.counters.rx_ok);
                shared.rx_status.push("RX: CALL".into());
                info!("received CALL, peer token {}", peer_token);
            }
            Command::CallAccepted | Command::KeyStart | Command::KeyEnd => {
                let state = shared.rx_state();
                let Some(next) = state.accept(t.command) else {
                    info!("{} in {:?} ignored", t.command, state);
                    shared.rx_status.push(format!("RX: {} (rep)", t.command));
                    return;
                };
                match t.command {
                    Command::CallAccepted => {
                        shared.events.call_accepted.raise();
                        shared.rx_status.push("RX: CALL ACCEPTED".into());
                    }
                    Command::KeyStart => {
                        *lock(&shared.peer_key_start) = t.data.clone();
                        shared.events.key_start.raise();
                        shared.rx_status.push("RX: KEY START".into());
                    }
                    _ => {
                        let peer_key = [lock(&shared.peer_key_start).as_slice(), t.data.as_slice()].concat();
                        match shared.establish_keys(&peer_key) {
                            Ok(code) => {
                                info!("session keys established, code {}", code);
                                shared.events.key_end.raise();
                                shared.rx_status.push("RX: KEY END".into());
                            }
                            Err(e) => {
                                error!("key agreement failed: {}", e);
                                Counters::bump(&shared.counters.rx_nok);
                                return;
                            }
                        }
                    }
                }
                shared.set_rx_state(next);
                info!("received {}, RxState {:?}", t.command, next);
            }
            Command::StartupData => match shared.cipher().and_then(|c| c.decrypt_text(&t.data)) {
                Ok(name) => {
                    info!("received STARTUP_DATA, partner {}", name);
                    shared.set_partner_name(name);
                    shared.events.startup_data.raise();
                    shared.rx_status.push("RX: STARTUP".into());
                }
                Err(e) => {
                    error!("STARTUP_DATA rejected: {}", e);
                    Counters::bump(&shared.counters.rx_nok);
                }
            },
            Command::None => {}
            other => {
                info!("{} ignored", other);
                shared.rx_status.push(format!("RX: {} (rep)", other));
            }
        }
    }
}
