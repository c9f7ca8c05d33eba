//! A running link: worker threads, the audio port and call orchestration
//!
//! [`Session::start`] spawns three workers sharing one [`LinkShared`]:
//!
//! - the receiver, fed with input blocks over a bounded channel
//! - the sender, polling the transmit state machine every `tx_poll_period`
//! - the half-duplex timer, clearing the receive flag when a telegram is
//!   complete or `receive_timeout` has passed
//!
//! The audio collaborator drives the returned [`AudioPort`] from its stream
//! callbacks. Everything else goes through the session methods, which block
//! the calling thread while they wait for the peer.

use crate::arena::TransmitArena;
use crate::config::{derive_settings, Config, Settings, ENCRYPTION_BLOCK_LEN};
use crate::error::{LinkError, Result};
use crate::filter::{BandStop, Carrier, VoiceOutput};
use crate::link::receiver::Receiver;
use crate::link::transmitter::{fragment, Transmitter};
use crate::link::{lock, LinkShared, LinkStats, Outgoing, RxState, TxState};
use crate::telegram::Command;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Input blocks buffered between the audio callback and the receiver
const INPUT_QUEUE_BLOCKS: usize = 1024;

/// Longest user name, in bytes, that still encrypts to a single block
pub const MAX_NAME_LEN: usize = ENCRYPTION_BLOCK_LEN - 1;

/// The peer as known after a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub partner_name: String,
    /// Compared by both users over the voice channel
    pub session_code: u32,
}

/// Cut `name` to at most [`MAX_NAME_LEN`] bytes on a character boundary
pub fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Stream-facing handle of a session. The callbacks return quickly and never
/// wait on the link workers.
#[derive(Clone)]
pub struct AudioPort {
    input: Sender<Vec<f32>>,
    arena: Arc<TransmitArena>,
    shared: Arc<LinkShared>,
    /// Clears the coding band of the user's voice before it is mixed in
    voice_in: Arc<Mutex<BandStop>>,
    voice_out: Arc<Mutex<VoiceOutput>>,
    carrier: Option<Arc<Mutex<Carrier>>>,
}

impl AudioPort {
    /// Block length expected by both callbacks
    pub fn chunk_len(&self) -> usize {
        self.shared.settings.chunk_len
    }

    /// Playing time of one block
    pub fn chunk_duration(&self) -> Duration {
        let settings = &self.shared.settings;
        Duration::from_secs_f64(settings.chunk_len as f64 / settings.config.sample_rate as f64)
    }

    /// Hand a captured block to the receiver. Blocks are dropped when the
    /// receiver falls too far behind.
    pub fn on_input(&self, samples: &[f32]) {
        match self.input.try_send(samples.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("input queue full, {} samples dropped", samples.len()),
            Err(TrySendError::Disconnected(_)) => debug!("input after receiver stopped"),
        }
    }

    /// Fill an output block with the next transmit chunk or silence
    pub fn on_output(&self, out: &mut [f32]) {
        self.play(out, None);
    }

    /// Like [`on_output`](Self::on_output), with the user's voice mixed in
    /// below and above the coding band
    pub fn on_output_with_voice(&self, voice: &[f32], out: &mut [f32]) {
        self.play(out, Some(voice));
    }

    /// The peer's voice from a captured block, for the speaker: coding
    /// tones removed, and the pilot tone when configured
    pub fn voice_from_input(&self, input: &[f32], out: &mut [f32]) {
        lock(&self.voice_out).process(input, out);
    }

    fn play(&self, out: &mut [f32], voice: Option<&[f32]>) {
        let playing = self.arena.pop_chunk(out);
        if self.shared.transmit_on.swap(playing, Ordering::SeqCst) != playing {
            info!("TX {}", if playing { "ON" } else { "OFF" });
        }
        if let Some(voice) = voice {
            let mut band_stop = lock(&self.voice_in);
            for (o, v) in out.iter_mut().zip(voice) {
                *o += band_stop.run(*v);
            }
        }
        if let Some(carrier) = &self.carrier {
            lock(carrier).apply(out);
        }
    }
}

pub struct Session {
    shared: Arc<LinkShared>,
    arena: Arc<TransmitArena>,
    transmitter: Arc<Mutex<Transmitter>>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Derive the settings, allocate the transmit arena and spawn the
    /// workers. The returned port is what the audio streams talk to.
    pub fn start(config: Config) -> Result<(Session, AudioPort)> {
        let settings = derive_settings(&config)?;
        info!(
            "starting link: ONE {} Hz, ZERO {} Hz, chunk {} samples, data max {} bytes",
            settings.freq_one, settings.freq_zero, settings.chunk_len, settings.data_max_len_bytes
        );
        let shared = Arc::new(LinkShared::new(settings));
        let arena = Arc::new(TransmitArena::new(&shared.settings));
        let transmitter = Arc::new(Mutex::new(Transmitter::new(
            Arc::clone(&shared),
            Arc::clone(&arena),
        )));
        let (input_tx, input_rx) = bounded::<Vec<f32>>(INPUT_QUEUE_BLOCKS);

        let mut session = Session {
            shared: Arc::clone(&shared),
            arena: Arc::clone(&arena),
            transmitter: Arc::clone(&transmitter),
            workers: Vec::with_capacity(3),
        };

        let wakeup = shared.settings.config.tx_poll_period;
        let rx_shared = Arc::clone(&shared);
        session.workers.push(
            thread::Builder::new()
                .name("ac4qgp-rx".into())
                .spawn(move || {
                    let mut receiver = Receiver::new(Arc::clone(&rx_shared));
                    while rx_shared.is_streaming() {
                        let received = input_rx.recv_timeout(wakeup);
                        if rx_shared.reset_receiver.take() {
                            receiver.reset();
                        }
                        match received {
                            Ok(block) => {
                                if let Err(e) = receiver.push_samples(&block) {
                                    error!("receive pipeline: {}", e);
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    debug!("receiver stopped");
                })?,
        );

        let tx_shared = Arc::clone(&shared);
        session.workers.push(
            thread::Builder::new()
                .name("ac4qgp-tx".into())
                .spawn(move || {
                    while tx_shared.is_streaming() {
                        let result = lock(&transmitter).poll(Instant::now());
                        match result {
                            Ok(()) | Err(LinkError::MaxResendsExceeded { .. }) => {}
                            Err(e) => error!("transmitter: {}", e),
                        }
                        thread::sleep(wakeup);
                    }
                    debug!("sender stopped");
                })?,
        );

        let timer_shared = Arc::clone(&shared);
        session.workers.push(
            thread::Builder::new()
                .name("ac4qgp-timer".into())
                .spawn(move || {
                    let timeout = timer_shared.settings.receive_timeout;
                    while timer_shared.is_streaming() {
                        if !timer_shared.receive.supervise(timeout) {
                            thread::sleep(wakeup);
                        }
                    }
                    debug!("half-duplex timer stopped");
                })?,
        );

        let carrier = shared
            .settings
            .config
            .add_carrier
            .then(|| Arc::new(Mutex::new(Carrier::new(&shared.settings))));
        let port = AudioPort {
            input: input_tx,
            voice_in: Arc::new(Mutex::new(BandStop::voice(&shared.settings)?)),
            voice_out: Arc::new(Mutex::new(VoiceOutput::new(&shared.settings)?)),
            carrier,
            arena,
            shared,
        };
        Ok((session, port))
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Stop the workers and wait for them
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stream_on.store(false, Ordering::SeqCst);
        self.shared.receive.finish();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("link worker panicked");
            }
        }
        info!("link stopped");
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            buffer_occupancy: self.arena.occupancy(),
            ..self.shared.stats()
        }
    }

    pub fn session_code(&self) -> Option<u32> {
        self.shared.session_code()
    }

    pub fn partner_name(&self) -> Option<String> {
        self.shared.partner_name()
    }

    pub fn have_token(&self) -> bool {
        self.shared.have_token()
    }

    pub fn rx_state(&self) -> RxState {
        self.shared.rx_state()
    }

    pub fn tx_state(&self) -> TxState {
        self.shared.tx_state()
    }

    /// Whether a CALL arrived since the last check
    pub fn is_call(&self) -> bool {
        self.shared.events.call.take()
    }

    /// Whether the peer ended the call since the last check
    pub fn is_call_end(&self) -> bool {
        self.shared.events.call_end.take()
    }

    pub fn poll_error_message(&self) -> Option<String> {
        self.shared.poll_error_message()
    }

    /// Drain the receive status lines
    pub fn rx_status(&self) -> Vec<String> {
        self.shared.rx_status.drain()
    }

    pub fn tx_status(&self) -> Vec<String> {
        self.shared.tx_status.drain()
    }

    pub fn try_recv_message(&self) -> Option<String> {
        self.shared.messages.try_pop()
    }

    pub fn recv_message(&self, timeout: Duration) -> Option<String> {
        self.shared.messages.pop_timeout(timeout)
    }

    /// Return to the state of a freshly started session
    pub fn purge(&self) {
        lock(&self.transmitter).reset();
        self.shared.purge();
    }

    /// Encrypt `text` and queue it for delivery
    pub fn send_message(&self, text: &str) -> Result<()> {
        let max = self.shared.settings.max_text_len;
        if text.len() > max {
            return Err(LinkError::MessageTooLong { len: text.len(), max });
        }
        let ciphertext = self.shared.cipher()?.encrypt(text.as_bytes());
        let parts = fragment(&ciphertext, self.shared.settings.data_max_len_bytes);
        info!("queueing message of {} bytes in {} telegrams", text.len(), parts.len());
        for part in parts {
            self.shared.outgoing.push(part);
        }
        Ok(())
    }

    fn queue(&self, command: Command, data: Vec<u8>) {
        self.shared.outgoing.push(Outgoing { command, data });
    }

    /// Wait for one reply, i.e. the long retransmission timeout
    fn reply_timeout(&self) -> Duration {
        self.shared.settings.retransmission_long
    }

    /// Poll until `done` holds. Returns `Ok(false)` on timeout; fails when
    /// the peer rejects the call or the session stops.
    fn wait_until(&self, timeout: Duration, mut done: impl FnMut(&LinkShared) -> bool) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let period = self.shared.settings.config.tx_poll_period;
        loop {
            if done(&self.shared) {
                return Ok(true);
            }
            if self.shared.events.call_rejected.take() {
                return Err(LinkError::CallRejected);
            }
            if !self.shared.is_streaming() {
                return Err(LinkError::Stopped);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(period);
        }
    }

    /// Block until a CALL arrives
    pub fn wait_for_call(&self, timeout: Duration) -> Result<bool> {
        self.wait_until(timeout, |s| s.events.call.take())
    }

    /// Send CALL with our collision token and wait for the answer. Returns
    /// `Ok(false)` on timeout, or when a colliding CALL took our token.
    pub fn call_once(&self) -> Result<bool> {
        self.queue(Command::Call, vec![self.shared.comm_token()]);
        info!("calling, token {}", self.shared.comm_token());
        self.wait_until(3 * self.reply_timeout(), |s| {
            s.events.call_accepted.take() || (!s.have_token() && s.events.call.is_raised())
        })
        .map(|answered| answered && self.shared.have_token())
    }

    pub fn accept_call(&self) {
        self.queue(Command::CallAccepted, Vec::new());
    }

    pub fn reject_call(&self) {
        self.shared.reject_call.raise();
    }

    pub fn end_call(&self) {
        self.shared.end_call.raise();
    }

    /// Fresh key pair for the next handshake
    pub fn generate_public_key(&self) {
        self.shared.generate_key();
    }

    pub fn send_key_start_once(&self) -> Result<bool> {
        self.queue(Command::KeyStart, self.shared.key_fragments().0);
        self.wait_until(self.reply_timeout(), |s| s.events.key_start.take())
    }

    pub fn send_key_end_once(&self) -> Result<bool> {
        self.queue(Command::KeyEnd, self.shared.key_fragments().1);
        self.wait_until(self.reply_timeout(), |s| s.events.key_end.take())
    }

    pub fn respond_key_start_once(&self) -> Result<bool> {
        if !self.wait_until(self.reply_timeout(), |s| s.events.key_start.take())? {
            return Ok(false);
        }
        self.queue(Command::KeyStart, self.shared.key_fragments().0);
        Ok(true)
    }

    /// Wait for the peer's KEY_END and answer with ours. On timeout our
    /// KEY_START is repeated, in case it was lost.
    pub fn respond_key_end_once(&self) -> Result<bool> {
        if !self.wait_until(self.reply_timeout(), |s| s.events.key_end.take())? {
            self.queue(Command::KeyStart, self.shared.key_fragments().0);
            return Ok(false);
        }
        self.queue(Command::KeyEnd, self.shared.key_fragments().1);
        Ok(true)
    }

    /// Send our encrypted name and wait for the peer's
    pub fn send_startup_data_once(&self, name: &str) -> Result<bool> {
        let cipher = self.shared.cipher()?;
        self.queue(Command::StartupData, cipher.encrypt(truncate_name(name).as_bytes()));
        self.wait_until(self.reply_timeout(), |s| s.events.startup_data.take())
    }

    /// Wait for the peer's name and reply with ours, reliably. On timeout our
    /// KEY_END is repeated, in case it was lost.
    pub fn respond_startup_data_once(&self, name: &str) -> Result<bool> {
        if !self.wait_until(self.reply_timeout(), |s| s.events.startup_data.take())? {
            self.queue(Command::KeyEnd, self.shared.key_fragments().1);
            return Ok(false);
        }
        let cipher = self.shared.cipher()?;
        self.queue(
            Command::StartupDataComplete,
            cipher.encrypt(truncate_name(name).as_bytes()),
        );
        Ok(true)
    }

    /// Run `once` until it succeeds, at most `max_resends + 1` times
    fn retry(&self, step: &'static str, mut once: impl FnMut() -> Result<bool>) -> Result<()> {
        let attempts = self.shared.settings.config.max_resends + 1;
        for attempt in 1..=attempts {
            if once()? {
                debug!("{} done after {} attempt(s)", step, attempt);
                return Ok(());
            }
            warn!("{}: no answer ({}/{})", step, attempt, attempts);
        }
        self.shared.set_error_message(format!("no answer during {}", step));
        Err(LinkError::HandshakeTimeout(step))
    }

    fn peer_info(&self) -> Result<PeerInfo> {
        Ok(PeerInfo {
            partner_name: self.shared.partner_name().unwrap_or_default(),
            session_code: self.shared.session_code().ok_or(LinkError::MissingSessionKey)?,
        })
    }

    /// Call the peer and run the handshake as the calling side. If the peer
    /// calls at the same time and wins the token, continue as the answering
    /// side.
    pub fn dial(&self, name: &str) -> Result<PeerInfo> {
        self.shared.set_rx_state(RxState::Idle);
        self.shared.events.call_accepted.clear();
        self.shared.events.call_rejected.clear();

        let attempts = self.shared.settings.config.max_resends + 1;
        let mut accepted = false;
        for attempt in 1..=attempts {
            if self.call_once()? {
                accepted = true;
                break;
            }
            if !self.shared.have_token() && self.shared.events.call.take() {
                info!("call collision lost, answering instead");
                return self.answer(name);
            }
            warn!("call: no answer ({}/{})", attempt, attempts);
        }
        if !accepted {
            self.shared.set_error_message("no answer to CALL".into());
            return Err(LinkError::HandshakeTimeout("call"));
        }

        self.generate_public_key();
        self.retry("key start", || self.send_key_start_once())?;
        self.retry("key end", || self.send_key_end_once())?;
        self.retry("startup data", || self.send_startup_data_once(name))?;
        let peer = self.peer_info()?;
        info!("connected to {}, session code {}", peer.partner_name, peer.session_code);
        Ok(peer)
    }

    /// Accept an incoming call and run the handshake as the answering side
    pub fn answer(&self, name: &str) -> Result<PeerInfo> {
        self.shared.set_rx_state(RxState::Idle);
        self.generate_public_key();
        self.retry("key start", || {
            self.accept_call();
            self.respond_key_start_once()
        })?;
        self.retry("key end", || self.respond_key_end_once())?;
        self.retry("startup data", || self.respond_startup_data_once(name))?;
        let peer = self.peer_info()?;
        info!("connected to {}, session code {}", peer.partner_name, peer.session_code);
        Ok(peer)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
