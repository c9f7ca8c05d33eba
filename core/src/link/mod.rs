//! Link state shared by the receiver, the transmitter and the session API
//!
//! Both directions of the link touch the same handful of values: sequence
//! numbers, the pending ACK, the half-duplex flags and the call-setup events.
//! They live in one [`LinkShared`] handed out as an `Arc` to every worker.

pub mod receiver;
pub mod transmitter;

use crate::config::Settings;
use crate::crypto::{LocalKey, SessionCipher};
use crate::error::{LinkError, Result};
use crate::telegram::Command;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Receive pipeline position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    SearchPreamble,
    /// Preamble energy seen, marker not located yet
    SearchStart,
    DecodeFrame,
}

/// Call setup progress as seen by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    Idle,
    CallAccepted,
    KeyStartReceived,
    KeyEndReceived,
}

impl RxState {
    /// Next state after receiving `command`, or `None` if the command is out
    /// of order (repeated or premature) and must be ignored.
    pub fn accept(self, command: Command) -> Option<RxState> {
        match (self, command) {
            (RxState::Idle, Command::CallAccepted) => Some(RxState::CallAccepted),
            (RxState::Idle | RxState::CallAccepted, Command::KeyStart) => {
                Some(RxState::KeyStartReceived)
            }
            (RxState::KeyStartReceived, Command::KeyEnd) => Some(RxState::KeyEndReceived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Idle,
    WaitAck,
}

/// One-shot event flag: raised by one side, consumed by the other
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume the event
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Events raised by the receiver for the session API
#[derive(Debug, Default)]
pub struct Events {
    pub call: Latch,
    pub call_accepted: Latch,
    pub call_rejected: Latch,
    pub call_end: Latch,
    pub key_start: Latch,
    pub key_end: Latch,
    /// Peer name arrived with STARTUP_DATA or STARTUP_DATA_COMPLETE
    pub startup_data: Latch,
}

impl Events {
    fn clear(&self) {
        for latch in [
            &self.call,
            &self.call_accepted,
            &self.call_rejected,
            &self.call_end,
            &self.key_start,
            &self.key_end,
            &self.startup_data,
        ] {
            latch.clear();
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub tx_ok: AtomicU64,
    pub tx_nok: AtomicU64,
    pub rx_ok: AtomicU64,
    pub rx_nok: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the link statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    pub tx_ok: u64,
    pub tx_nok: u64,
    pub rx_ok: u64,
    pub rx_nok: u64,
    /// Last send-to-ACK time
    pub roundtrip: Option<Duration>,
    /// Telegrams in the transmit arena
    pub buffer_occupancy: usize,
    pub input_volume_percent: Option<u8>,
}

/// Queued outgoing telegram payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub command: Command,
    pub data: Vec<u8>,
}

/// Crossbeam channel with both ends kept together
#[derive(Debug)]
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // both ends live in self, the channel cannot be disconnected
        let _ = self.tx.send(item);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Half-duplex receive flag with a bounded lifetime.
///
/// The receiver raises the flag on marker detection and signals completion
/// when the telegram is done. The timer worker clears the flag on completion,
/// or forcibly once `timeout` has passed. A restart while the timer waits
/// begins a fresh timeout instead.
#[derive(Debug)]
pub struct ReceiveFlag {
    on: AtomicBool,
    state: Mutex<FlagState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct FlagState {
    done: bool,
    /// Bumped by every start
    generation: u64,
}

impl ReceiveFlag {
    fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            state: Mutex::new(FlagState::default()),
            cv: Condvar::new(),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        let mut state = lock(&self.state);
        state.done = false;
        state.generation = state.generation.wrapping_add(1);
        if !self.on.swap(true, Ordering::SeqCst) {
            info!("RX ON");
        }
        self.cv.notify_all();
    }

    pub fn finish(&self) {
        if self.is_on() {
            lock(&self.state).done = true;
            self.cv.notify_all();
        }
    }

    /// Timer worker step: if the flag is on, wait for completion or timeout
    /// and clear it. Returns `false` if the flag was off.
    pub fn supervise(&self, timeout: Duration) -> bool {
        if !self.is_on() {
            return false;
        }
        let guard = lock(&self.state);
        let generation = guard.generation;
        let (mut state, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| !s.done && s.generation == generation)
            .unwrap_or_else(|e| e.into_inner());
        if !state.done && state.generation != generation {
            // restarted while waiting, the next step times the new telegram
            return true;
        }
        if result.timed_out() && !state.done {
            warn!("RX flag timed out after {:?}, forcing it off", timeout);
        }
        state.done = false;
        self.on.store(false, Ordering::SeqCst);
        drop(state);
        info!("RX OFF");
        true
    }

    fn reset(&self) {
        let mut state = lock(&self.state);
        state.done = false;
        self.on.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the receiver, the transmitter and the session
pub struct LinkShared {
    pub settings: Settings,

    /// SEQ_NR of our last sequenced telegram
    pub seq_nr_tx: AtomicU8,
    /// Last SEQ_NR we accepted from the peer (sent back as SEQ_NR_ACK)
    pub seq_nr_ack: AtomicU8,
    /// Last SEQ_NR_ACK received with an ACK flag
    pub seq_nr_ack_rx: AtomicU8,
    /// An ACK is owed and rides on the next outgoing telegram
    pub send_ack: AtomicBool,
    /// The owed ACK answers CALL_END; sequence numbers reset once it is out
    pub reset_after_ack: Latch,
    /// Raised by purge, the receive worker drops its partial telegram
    pub reset_receiver: Latch,
    ack_received: Mutex<Option<Instant>>,

    pub stream_on: AtomicBool,
    pub transmit_on: AtomicBool,
    pub receive: ReceiveFlag,

    comm_token: AtomicU8,
    have_token: AtomicBool,

    pub reject_call: Latch,
    pub end_call: Latch,
    pub events: Events,

    rx_state: Mutex<RxState>,
    tx_state: Mutex<TxState>,

    local_key: Mutex<Option<LocalKey>>,
    key_fragments: Mutex<(Vec<u8>, Vec<u8>)>,
    pub(crate) peer_key_start: Mutex<Vec<u8>>,
    cipher: Mutex<Option<SessionCipher>>,
    session_code: Mutex<Option<u32>>,
    partner_name: Mutex<Option<String>>,
    pub(crate) fragments: Mutex<Vec<u8>>,

    pub counters: Counters,
    roundtrip: Mutex<Option<Duration>>,
    input_volume: AtomicU8,
    error_message: Mutex<Option<String>>,

    pub outgoing: Queue<Outgoing>,
    pub messages: Queue<String>,
    pub rx_status: Queue<String>,
    pub tx_status: Queue<String>,
}

impl LinkShared {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            seq_nr_tx: AtomicU8::new(0),
            seq_nr_ack: AtomicU8::new(0),
            seq_nr_ack_rx: AtomicU8::new(0),
            send_ack: AtomicBool::new(false),
            reset_after_ack: Latch::default(),
            reset_receiver: Latch::default(),
            ack_received: Mutex::new(None),
            stream_on: AtomicBool::new(true),
            transmit_on: AtomicBool::new(false),
            receive: ReceiveFlag::new(),
            comm_token: AtomicU8::new(rand::thread_rng().gen()),
            have_token: AtomicBool::new(true),
            reject_call: Latch::default(),
            end_call: Latch::default(),
            events: Events::default(),
            rx_state: Mutex::new(RxState::Idle),
            tx_state: Mutex::new(TxState::Idle),
            local_key: Mutex::new(None),
            key_fragments: Mutex::new((Vec::new(), Vec::new())),
            peer_key_start: Mutex::new(Vec::new()),
            cipher: Mutex::new(None),
            session_code: Mutex::new(None),
            partner_name: Mutex::new(None),
            fragments: Mutex::new(Vec::new()),
            counters: Counters::default(),
            roundtrip: Mutex::new(None),
            input_volume: AtomicU8::new(0),
            error_message: Mutex::new(None),
            outgoing: Queue::new(),
            messages: Queue::new(),
            rx_status: Queue::new(),
            tx_status: Queue::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_on.load(Ordering::SeqCst)
    }

    pub fn reset_seq_nrs(&self) {
        self.seq_nr_tx.store(0, Ordering::SeqCst);
        self.seq_nr_ack.store(0, Ordering::SeqCst);
        self.seq_nr_ack_rx.store(0, Ordering::SeqCst);
        info!("SeqNrs reset");
    }

    pub fn record_ack(&self, seq_nr_ack: u8, at: Instant) {
        self.seq_nr_ack_rx.store(seq_nr_ack, Ordering::SeqCst);
        *lock(&self.ack_received) = Some(at);
    }

    /// Consume a received ACK, returning when it arrived
    pub fn take_ack(&self) -> Option<Instant> {
        lock(&self.ack_received).take()
    }

    pub fn rx_state(&self) -> RxState {
        *lock(&self.rx_state)
    }

    pub fn set_rx_state(&self, state: RxState) {
        *lock(&self.rx_state) = state;
    }

    pub fn tx_state(&self) -> TxState {
        *lock(&self.tx_state)
    }

    pub fn set_tx_state(&self, state: TxState) {
        *lock(&self.tx_state) = state;
    }

    pub fn comm_token(&self) -> u8 {
        self.comm_token.load(Ordering::SeqCst)
    }

    pub fn have_token(&self) -> bool {
        self.have_token.load(Ordering::SeqCst)
    }

    /// Resolve a CALL collision against the peer's token. The larger token
    /// keeps calling; on a tie we draw a different one.
    pub fn resolve_token(&self, peer_token: u8) {
        let ours = self.comm_token();
        if peer_token > ours {
            self.have_token.store(false, Ordering::SeqCst);
            info!("peer token {} beats ours {}, we answer", peer_token, ours);
        } else if peer_token == ours {
            let mut rng = rand::thread_rng();
            let mut redraw: u8 = rng.gen();
            while redraw == ours {
                redraw = rng.gen();
            }
            self.comm_token.store(redraw, Ordering::SeqCst);
            info!("token tie at {}, redrawn as {}", ours, redraw);
        }
    }

    /// Create a fresh key pair and its KEY_START/KEY_END fragments
    pub fn generate_key(&self) {
        let key = LocalKey::generate();
        *lock(&self.key_fragments) = key.fragments(self.settings.data_max_len_bytes);
        *lock(&self.local_key) = Some(key);
    }

    pub fn key_fragments(&self) -> (Vec<u8>, Vec<u8>) {
        lock(&self.key_fragments).clone()
    }

    /// Complete the agreement with the peer's full public key
    pub fn establish_keys(&self, peer_public: &[u8]) -> Result<u32> {
        let key = lock(&self.local_key).take().ok_or(LinkError::MissingSessionKey)?;
        let keys = key.agree(peer_public)?;
        *lock(&self.cipher) = Some(keys.cipher);
        *lock(&self.session_code) = Some(keys.code);
        Ok(keys.code)
    }

    pub fn cipher(&self) -> Result<SessionCipher> {
        lock(&self.cipher).clone().ok_or(LinkError::MissingSessionKey)
    }

    pub fn session_code(&self) -> Option<u32> {
        *lock(&self.session_code)
    }

    pub fn partner_name(&self) -> Option<String> {
        lock(&self.partner_name).clone()
    }

    pub fn set_partner_name(&self, name: String) {
        *lock(&self.partner_name) = Some(name);
    }

    pub fn set_roundtrip(&self, rtt: Duration) {
        *lock(&self.roundtrip) = Some(rtt);
    }

    pub fn set_input_volume(&self, percent: u8) {
        self.input_volume.store(percent, Ordering::Relaxed);
    }

    pub fn set_error_message(&self, message: String) {
        *lock(&self.error_message) = Some(message);
    }

    /// Last delivery failure, cleared by reading it
    pub fn poll_error_message(&self) -> Option<String> {
        lock(&self.error_message).take()
    }

    pub fn stats(&self) -> LinkStats {
        let volume = self.input_volume.load(Ordering::Relaxed);
        LinkStats {
            tx_ok: self.counters.tx_ok.load(Ordering::Relaxed),
            tx_nok: self.counters.tx_nok.load(Ordering::Relaxed),
            rx_ok: self.counters.rx_ok.load(Ordering::Relaxed),
            rx_nok: self.counters.rx_nok.load(Ordering::Relaxed),
            roundtrip: *lock(&self.roundtrip),
            buffer_occupancy: 0,
            input_volume_percent: (volume > 0).then_some(volume),
        }
    }

    /// Return to the state of a fresh session, keeping the streams running
    pub fn purge(&self) {
        self.outgoing.drain();
        self.messages.drain();
        self.reset_receiver.raise();
        self.reset_seq_nrs();
        self.send_ack.store(false, Ordering::SeqCst);
        self.reset_after_ack.clear();
        self.take_ack();
        self.set_tx_state(TxState::Idle);
        self.set_rx_state(RxState::Idle);
        self.reject_call.clear();
        self.end_call.clear();
        self.events.clear();
        self.receive.reset();

        *lock(&self.local_key) = None;
        *lock(&self.key_fragments) = (Vec::new(), Vec::new());
        lock(&self.peer_key_start).clear();
        *lock(&self.cipher) = None;
        *lock(&self.session_code) = None;
        *lock(&self.partner_name) = None;
        lock(&self.fragments).clear();

        self.comm_token.store(rand::thread_rng().gen(), Ordering::SeqCst);
        self.have_token.store(true, Ordering::SeqCst);

        self.counters.rx_ok.store(0, Ordering::Relaxed);
        self.counters.rx_nok.store(0, Ordering::Relaxed);
        self.input_volume.store(0, Ordering::Relaxed);

        self.rx_status.push("RX: purged".into());
        self.tx_status.push("TX: purged".into());
        info!("purged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{derive_settings, Config};

    fn shared() -> LinkShared {
        LinkShared::new(derive_settings(&Config::default()).unwrap())
    }

    #[test]
    fn test_rx_state_transitions() {
        assert_eq!(RxState::Idle.accept(Command::CallAccepted), Some(RxState::CallAccepted));
        assert_eq!(RxState::Idle.accept(Command::KeyStart), Some(RxState::KeyStartReceived));
        assert_eq!(
            RxState::CallAccepted.accept(Command::KeyStart),
            Some(RxState::KeyStartReceived)
        );
        assert_eq!(
            RxState::KeyStartReceived.accept(Command::KeyEnd),
            Some(RxState::KeyEndReceived)
        );
        // repeated or premature commands are ignored
        assert_eq!(RxState::CallAccepted.accept(Command::CallAccepted), None);
        assert_eq!(RxState::KeyStartReceived.accept(Command::KeyStart), None);
        assert_eq!(RxState::Idle.accept(Command::KeyEnd), None);
        assert_eq!(RxState::KeyEndReceived.accept(Command::KeyEnd), None);
    }

    #[test]
    fn test_latch_is_consumed() {
        let latch = Latch::default();
        assert!(!latch.take());
        latch.raise();
        assert!(latch.is_raised());
        assert!(latch.take());
        assert!(!latch.take());
    }

    #[test]
    fn test_token_resolution() {
        let link = shared();
        link.comm_token.store(100, Ordering::SeqCst);
        link.resolve_token(99);
        assert!(link.have_token());
        assert_eq!(link.comm_token(), 100);

        link.resolve_token(101);
        assert!(!link.have_token());
    }

    #[test]
    fn test_token_tie_is_redrawn() {
        for token in [0, 100, u8::MAX] {
            let link = shared();
            link.comm_token.store(token, Ordering::SeqCst);
            link.resolve_token(token);
            assert!(link.have_token());
            assert_ne!(link.comm_token(), token);
        }
    }

    #[test]
    fn test_receive_flag_completion_and_timeout() {
        let flag = ReceiveFlag::new();
        assert!(!flag.supervise(Duration::from_millis(1)));

        flag.start();
        flag.finish();
        assert!(flag.supervise(Duration::from_secs(5)));
        assert!(!flag.is_on());

        flag.start();
        let started = Instant::now();
        assert!(flag.supervise(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!flag.is_on());
    }

    #[test]
    fn test_receive_flag_restart_keeps_it_on() {
        let flag = ReceiveFlag::new();
        flag.start();
        std::thread::scope(|s| {
            let timer = s.spawn(|| flag.supervise(Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(50));
            flag.start();
            assert!(timer.join().unwrap());
        });
        assert!(flag.is_on());

        flag.finish();
        assert!(flag.supervise(Duration::from_secs(5)));
        assert!(!flag.is_on());
    }

    #[test]
    fn test_purge_resets_session_state() {
        let link = shared();
        link.seq_nr_tx.store(7, Ordering::SeqCst);
        link.set_rx_state(RxState::KeyEndReceived);
        link.set_tx_state(TxState::WaitAck);
        link.outgoing.push(Outgoing {
            command: Command::ChatData,
            data: vec![1],
        });
        link.events.call.raise();
        link.messages.push("stale".into());
        Counters::bump(&link.counters.rx_nok);

        link.purge();
        assert_eq!(link.seq_nr_tx.load(Ordering::SeqCst), 0);
        assert_eq!(link.rx_state(), RxState::Idle);
        assert_eq!(link.tx_state(), TxState::Idle);
        assert!(link.outgoing.is_empty());
        assert!(link.messages.is_empty());
        assert!(link.reset_receiver.take());
        assert!(!link.events.call.is_raised());
        assert_eq!(link.stats().rx_nok, 0);
        assert!(link.have_token());
        assert!(matches!(link.cipher(), Err(LinkError::MissingSessionKey)));
        assert_eq!(link.rx_status.drain(), vec!["RX: purged".to_string()]);
    }
}
