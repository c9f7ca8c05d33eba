//! Transmit side of the link: command selection, ACK piggy-backing and
//! retransmission
//!
//! The sender worker calls [`Transmitter::poll`] every `tx_poll_period`. In
//! `Idle` the next command is picked (a pending reject or end of call first,
//! then the outgoing queue) and an owed ACK rides along; if there is nothing
//! to send but an ACK is owed, a bare `NONE` carries it. Sequenced commands
//! move to `WaitAck` until the peer acknowledges their SEQ_NR or `max_resends`
//! retransmissions have gone unanswered.

use super::{Counters, LinkShared, Outgoing, TxState};
use crate::arena::TransmitArena;
use crate::error::{LinkError, Result};
use crate::filter::BandPass;
use crate::telegram::{modulate, next_seq_nr, Command, Telegram};
use crate::tone::ToneCodec;
use log::{error, info, warn};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Split a ciphertext into CHAT_DATA telegram payloads. A ciphertext that
/// fits one telegram is sent as CHAT_DATA, anything longer as START, PART...
/// and END.
pub fn fragment(ciphertext: &[u8], max_len: usize) -> Vec<Outgoing> {
    if ciphertext.len() <= max_len {
        return vec![Outgoing {
            command: Command::ChatData,
            data: ciphertext.to_vec(),
        }];
    }
    let pieces: Vec<&[u8]> = ciphertext.chunks(max_len).collect();
    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Outgoing {
            command: match i {
                0 => Command::ChatDataStart,
                i if i == last => Command::ChatDataEnd,
                _ => Command::ChatDataPart,
            },
            data: piece.to_vec(),
        })
        .collect()
}

pub struct Transmitter {
    shared: Arc<LinkShared>,
    codec: ToneCodec,
    arena: Arc<TransmitArena>,
    /// Sequenced telegram awaiting its ACK
    last: Option<Telegram>,
    deadline: Instant,
    resends: u32,
    sent_at: Instant,
}

impl Transmitter {
    pub fn new(shared: Arc<LinkShared>, arena: Arc<TransmitArena>) -> Self {
        let now = Instant::now();
        Self {
            codec: ToneCodec::new(&shared.settings),
            shared,
            arena,
            last: None,
            deadline: now,
            resends: 0,
            sent_at: now,
        }
    }

    pub fn resends(&self) -> u32 {
        self.resends
    }

    /// Drop the telegram awaiting its ACK, e.g. after a purge
    pub fn reset(&mut self) {
        self.last = None;
        self.resends = 0;
        self.arena.clear();
    }

    /// One step of the transmit state machine. Fails with
    /// `MaxResendsExceeded` when a sequenced telegram is given up.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        match self.shared.tx_state() {
            TxState::Idle => self.poll_idle(now),
            TxState::WaitAck => self.poll_wait_ack(now),
        }
    }

    fn poll_idle(&mut self, now: Instant) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        if shared.receive.is_on() {
            return Ok(());
        }

        let next = if shared.reject_call.take() {
            Some(Outgoing {
                command: Command::CallRejected,
                data: Vec::new(),
            })
        } else if shared.end_call.take() {
            Some(Outgoing {
                command: Command::CallEnd,
                data: Vec::new(),
            })
        } else {
            shared.outgoing.try_pop()
        };

        let ack = shared.send_ack.swap(false, Ordering::SeqCst);
        let Some(Outgoing { command, data }) = next.or_else(|| {
            ack.then(|| Outgoing {
                command: Command::None,
                data: Vec::new(),
            })
        }) else {
            return Ok(());
        };

        if command == Command::Call {
            shared.reset_seq_nrs();
        }
        if command.is_sequenced() {
            let seq_nr = next_seq_nr(shared.seq_nr_tx.load(Ordering::SeqCst));
            shared.seq_nr_tx.store(seq_nr, Ordering::SeqCst);
            // an ACK that arrived while idle belongs to an earlier telegram
            shared.take_ack();
        }

        let telegram = Telegram {
            seq_nr: shared.seq_nr_tx.load(Ordering::SeqCst),
            seq_nr_ack: shared.seq_nr_ack.load(Ordering::SeqCst),
            command,
            ack,
            data,
        };

        if command.is_sequenced() {
            shared.set_tx_state(TxState::WaitAck);
            self.last = Some(telegram.clone());
            self.resends = 0;
            self.sent_at = now;
        }
        self.deadline = now + self.retransmission_timeout();

        shared.tx_status.push(format!("TX: {}", command));
        match self.transmit(&telegram) {
            // a sequenced telegram is retried by the resend timer, ACK included
            Err(LinkError::BufferFull(n)) if command.is_sequenced() => {
                warn!("transmit buffer full ({} telegrams), {} deferred", n, command);
                Ok(())
            }
            Err(LinkError::BufferFull(n)) => {
                if ack {
                    // still owed, rides on the next telegram
                    shared.send_ack.store(true, Ordering::SeqCst);
                }
                Err(LinkError::BufferFull(n))
            }
            Err(e) => Err(e),
            Ok(()) => {
                if ack && shared.reset_after_ack.take() {
                    shared.reset_seq_nrs();
                }
                Ok(())
            }
        }
    }

    fn poll_wait_ack(&mut self, now: Instant) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let Some(last) = self.last.clone() else {
            shared.set_tx_state(TxState::Idle);
            return Ok(());
        };

        if let Some(at) = shared.take_ack() {
            let acked = shared.seq_nr_ack_rx.load(Ordering::SeqCst);
            if acked == last.seq_nr {
                let rtt = at.saturating_duration_since(self.sent_at);
                shared.set_roundtrip(rtt);
                Counters::bump(&shared.counters.tx_ok);
                info!("{} SeqNr {} acknowledged after {:?}", last.command, last.seq_nr, rtt);
                if last.command == Command::CallEnd {
                    shared.reset_seq_nrs();
                }
                self.last = None;
                self.resends = 0;
                shared.set_tx_state(TxState::Idle);
                shared.tx_status.push(String::new());
                return Ok(());
            }
            Counters::bump(&shared.counters.tx_nok);
            error!(
                "ACK for SeqNr {} while waiting for {}",
                acked, last.seq_nr
            );
        }

        if now < self.deadline || shared.receive.is_on() {
            return Ok(());
        }

        let max = shared.settings.config.max_resends;
        if self.resends < max {
            self.resends += 1;
            let ack = shared.send_ack.swap(false, Ordering::SeqCst);
            let telegram = Telegram {
                seq_nr_ack: shared.seq_nr_ack.load(Ordering::SeqCst),
                ack: last.ack || ack,
                ..last
            };
            Counters::bump(&shared.counters.tx_nok);
            self.deadline = now + self.retransmission_timeout();
            warn!("{} SeqNr {} resend {}/{}", telegram.command, telegram.seq_nr, self.resends, max);
            shared
                .tx_status
                .push(format!("TX: {}, resend {}", telegram.command, self.resends));
            let pushed = self.transmit(&telegram);
            if pushed.is_ok() && telegram.ack && shared.reset_after_ack.take() {
                shared.reset_seq_nrs();
            }
            self.last = Some(telegram);
            return match pushed {
                Err(LinkError::BufferFull(_)) => Ok(()),
                other => other,
            };
        }

        if last.command == Command::CallEnd {
            shared.reset_seq_nrs();
        }
        Counters::bump(&shared.counters.tx_nok);
        self.last = None;
        self.resends = 0;
        shared.set_tx_state(TxState::Idle);
        let err = LinkError::MaxResendsExceeded {
            max,
            command: last.command.name().to_string(),
        };
        error!("{}", err);
        shared.tx_status.push(format!("TX: {} failed", last.command));
        shared.set_error_message(err.to_string());
        Err(err)
    }

    fn transmit(&mut self, telegram: &Telegram) -> Result<()> {
        let cfg = &self.shared.settings.config;
        let wire = telegram.to_wire(cfg.preamble_len_bytes, cfg.terminator_len_bytes);
        let mut samples = modulate(&self.codec, &wire, self.shared.settings.chunk_len);
        if cfg.tx_band_pass {
            // every telegram starts from silence, so from a fresh filter
            BandPass::coding(&self.shared.settings)?.process(&mut samples);
        }
        info!("TX {}", telegram);
        self.arena.push(&samples)
    }

    /// Short or long timeout, chosen at random so two stations retrying at
    /// the same moment drift apart
    fn retransmission_timeout(&self) -> Duration {
        let settings = &self.shared.settings;
        if rand::thread_rng().gen_bool(0.5) {
            settings.retransmission_short
        } else {
            settings.retransmission_long
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{derive_settings, Config};
    use crate::link::receiver::Receiver;

    fn setup(max_resends: u32) -> (Arc<LinkShared>, Arc<TransmitArena>, Transmitter) {
        setup_with(Config {
            max_resends,
            telegrams_in_parallel: 16,
            ..Config::default()
        })
    }

    fn setup_with(config: Config) -> (Arc<LinkShared>, Arc<TransmitArena>, Transmitter) {
        let settings = derive_settings(&config).unwrap();
        let arena = Arc::new(TransmitArena::new(&settings));
        let shared = Arc::new(LinkShared::new(settings));
        let tx = Transmitter::new(Arc::clone(&shared), Arc::clone(&arena));
        (shared, arena, tx)
    }

    /// Decode the next telegram played by the arena, as the peer would
    fn played(shared: &LinkShared, arena: &TransmitArena, last_acked: u8) -> Telegram {
        let chunk_len = shared.settings.chunk_len;
        let peer = Arc::new(LinkShared::new(shared.settings.clone()));
        peer.seq_nr_ack.store(last_acked, Ordering::SeqCst);
        let mut rx = Receiver::new(peer).with_log();
        rx.push_samples(&[0.0; 100]).unwrap();

        let mut out = vec![0.0; chunk_len];
        while arena.pop_chunk(&mut out) {
            rx.push_samples(&out).unwrap();
            if let Some(r) = rx.take_log().pop() {
                return r.telegram;
            }
        }
        rx.push_samples(&vec![0.0; chunk_len]).unwrap();
        match rx.take_log().pop() {
            Some(r) => r.telegram,
            None => panic!("no telegram in the transmit arena"),
        }
    }

    fn queue(shared: &LinkShared, command: Command, data: &[u8]) {
        shared.outgoing.push(Outgoing {
            command,
            data: data.to_vec(),
        });
    }

    #[test]
    fn test_nothing_to_send() {
        let (shared, arena, mut tx) = setup(3);
        tx.poll(Instant::now()).unwrap();
        assert!(arena.is_empty());
        assert_eq!(shared.tx_state(), TxState::Idle);
    }

    #[test]
    fn test_bare_ack_is_sent_as_none() {
        let (shared, arena, mut tx) = setup(3);
        shared.seq_nr_ack.store(7, Ordering::SeqCst);
        shared.send_ack.store(true, Ordering::SeqCst);
        tx.poll(Instant::now()).unwrap();

        let t = played(&shared, &arena, 0);
        assert_eq!(t.command, Command::None);
        assert!(t.ack);
        assert_eq!(t.seq_nr_ack, 7);
        assert_eq!(shared.tx_state(), TxState::Idle);
        assert!(!shared.send_ack.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sequenced_command_waits_for_ack() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[1; 16]);
        let t0 = Instant::now();
        tx.poll(t0).unwrap();
        assert_eq!(shared.tx_state(), TxState::WaitAck);
        assert_eq!(shared.seq_nr_tx.load(Ordering::SeqCst), 1);
        let t = played(&shared, &arena, 0);
        assert_eq!(t.seq_nr, 1);
        assert!(!t.ack);

        shared.record_ack(1, t0 + Duration::from_millis(800));
        tx.poll(t0 + Duration::from_millis(810)).unwrap();
        assert_eq!(shared.tx_state(), TxState::Idle);
        let stats = shared.stats();
        assert_eq!(stats.tx_ok, 1);
        assert_eq!(stats.roundtrip, Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_wrong_ack_is_counted_and_waiting_continues() {
        let (shared, _arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[1; 16]);
        let t0 = Instant::now();
        tx.poll(t0).unwrap();
        shared.record_ack(0, t0);
        tx.poll(t0 + Duration::from_millis(10)).unwrap();
        assert_eq!(shared.tx_state(), TxState::WaitAck);
        assert_eq!(shared.stats().tx_nok, 1);
    }

    #[test]
    fn test_retransmission_is_bounded() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::CallRejected, &[]);
        let mut now = Instant::now();
        tx.poll(now).unwrap();

        let step = Duration::from_secs(3);
        for n in 1..=3 {
            now += step;
            tx.poll(now).unwrap();
            assert_eq!(tx.resends(), n);
        }
        // first send plus three resends
        assert_eq!(arena.occupancy(), 4);

        now += step;
        match tx.poll(now) {
            Err(LinkError::MaxResendsExceeded { max: 3, command }) => {
                assert_eq!(command, "CALL_REJECTED");
            }
            other => panic!("expected MaxResendsExceeded, got {:?}", other),
        }
        assert_eq!(shared.tx_state(), TxState::Idle);
        assert!(shared.poll_error_message().is_some());
        assert_eq!(shared.stats().tx_nok, 4);
    }

    #[test]
    fn test_resend_waits_for_timeout() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[2; 16]);
        let now = Instant::now();
        tx.poll(now).unwrap();
        tx.poll(now + Duration::from_millis(1300)).unwrap();
        assert_eq!(tx.resends(), 0);
        assert_eq!(arena.occupancy(), 1);
    }

    #[test]
    fn test_resend_carries_pending_ack() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[3; 16]);
        let now = Instant::now();
        tx.poll(now).unwrap();
        played(&shared, &arena, 0);

        shared.seq_nr_ack.store(4, Ordering::SeqCst);
        shared.send_ack.store(true, Ordering::SeqCst);
        tx.poll(now + Duration::from_secs(3)).unwrap();
        let t = played(&shared, &arena, 0);
        assert_eq!(t.seq_nr, 1);
        assert!(t.ack);
        assert_eq!(t.seq_nr_ack, 4);
    }

    #[test]
    fn test_deferred_while_receiving() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[1; 16]);
        shared.receive.start();
        tx.poll(Instant::now()).unwrap();
        assert!(arena.is_empty());
        assert_eq!(shared.outgoing.len(), 1);
    }

    #[test]
    fn test_reject_takes_priority() {
        let (shared, arena, mut tx) = setup(3);
        queue(&shared, Command::ChatData, &[1; 16]);
        shared.reject_call.raise();
        tx.poll(Instant::now()).unwrap();
        assert_eq!(played(&shared, &arena, 0).command, Command::CallRejected);
        assert_eq!(shared.outgoing.len(), 1);
    }

    #[test]
    fn test_call_resets_sequence_numbers() {
        let (shared, arena, mut tx) = setup(3);
        shared.seq_nr_tx.store(9, Ordering::SeqCst);
        shared.seq_nr_ack.store(9, Ordering::SeqCst);
        queue(&shared, Command::Call, &[42]);
        tx.poll(Instant::now()).unwrap();
        let t = played(&shared, &arena, 0);
        assert_eq!((t.seq_nr, t.seq_nr_ack), (0, 0));
        assert_eq!(t.data, vec![42]);
        assert_eq!(shared.tx_state(), TxState::Idle);
    }

    #[test]
    fn test_ack_of_call_end_resets_after_sending() {
        let (shared, arena, mut tx) = setup(3);
        shared.seq_nr_ack.store(5, Ordering::SeqCst);
        shared.send_ack.store(true, Ordering::SeqCst);
        shared.reset_after_ack.raise();
        tx.poll(Instant::now()).unwrap();
        assert_eq!(played(&shared, &arena, 0).seq_nr_ack, 5);
        assert_eq!(shared.seq_nr_ack.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ack_survives_full_buffer() {
        let (shared, arena, mut tx) = setup(3);
        let silence = vec![0.0; shared.settings.chunk_len];
        while arena.push(&silence).is_ok() {}

        shared.seq_nr_ack.store(2, Ordering::SeqCst);
        shared.send_ack.store(true, Ordering::SeqCst);
        shared.reset_after_ack.raise();
        assert!(matches!(tx.poll(Instant::now()), Err(LinkError::BufferFull(16))));
        assert!(shared.send_ack.load(Ordering::SeqCst));
        assert!(shared.reset_after_ack.is_raised());
        assert_eq!(shared.seq_nr_ack.load(Ordering::SeqCst), 2);

        arena.clear();
        tx.poll(Instant::now()).unwrap();
        let t = played(&shared, &arena, 0);
        assert_eq!(t.command, Command::None);
        assert!(t.ack);
        assert_eq!(t.seq_nr_ack, 2);
        assert!(!shared.send_ack.load(Ordering::SeqCst));
        assert_eq!(shared.seq_nr_ack.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_band_passed_telegram_decodes() {
        let (shared, arena, mut tx) = setup_with(Config {
            tx_band_pass: true,
            ..Config::default()
        });
        queue(&shared, Command::ChatData, b"band limited");
        tx.poll(Instant::now()).unwrap();
        let t = played(&shared, &arena, 0);
        assert_eq!(t.command, Command::ChatData);
        assert_eq!(t.data, b"band limited".to_vec());
        assert_eq!(t.seq_nr, 1);
    }

    #[test]
    fn test_fragmentation() {
        let single = fragment(&[0; 16], 19);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].command, Command::ChatData);

        let parts = fragment(&[0; 48], 19);
        let commands: Vec<Command> = parts.iter().map(|p| p.command).collect();
        assert_eq!(
            commands,
            vec![Command::ChatDataStart, Command::ChatDataPart, Command::ChatDataEnd]
        );
        assert_eq!(parts.iter().map(|p| p.data.len()).sum::<usize>(), 48);

        let two = fragment(&[0; 32], 19);
        assert_eq!(two[0].command, Command::ChatDataStart);
        assert_eq!(two[1].command, Command::ChatDataEnd);
        assert_eq!(two[1].data.len(), 13);
    }
}
