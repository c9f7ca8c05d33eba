use ac4qgp_core::config::{derive_settings, Config};
use ac4qgp_core::link::{LinkShared, ParseState};
use ac4qgp_core::telegram::{modulate, Command, Telegram};
use ac4qgp_core::{Receiver, ToneCodec};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn example() -> Telegram {
    Telegram {
        seq_nr: 5,
        seq_nr_ack: 4,
        command: Command::ChatData,
        ack: false,
        data: b"hi".to_vec(),
    }
}

fn receiver(config: &Config, last_acked: u8) -> (Arc<LinkShared>, Receiver) {
    let shared = Arc::new(LinkShared::new(derive_settings(config).unwrap()));
    shared.seq_nr_ack.store(last_acked, Ordering::SeqCst);
    let rx = Receiver::new(Arc::clone(&shared)).with_log();
    (shared, rx)
}

/// `lead` samples of silence, the telegrams back to back, one chunk of
/// trailing silence
fn signal(config: &Config, telegrams: &[Telegram], lead: usize) -> Vec<f32> {
    let settings = derive_settings(config).unwrap();
    let codec = ToneCodec::new(&settings);
    let mut samples = vec![0.0; lead];
    for t in telegrams {
        let wire = t.to_wire(config.preamble_len_bytes, config.terminator_len_bytes);
        samples.extend(modulate(&codec, &wire, settings.chunk_len));
    }
    samples.resize(samples.len() + settings.chunk_len, 0.0);
    samples
}

#[test]
fn test_example_telegram_checksum() {
    let wire = example().to_wire(4, 1);
    assert_eq!(&wire[4..10], &[0x55, 0x01, 0x05, 0x04, 0x0D, 0x02]);
    let expected = 0x55 ^ 0x01 ^ 0x05 ^ 0x04 ^ 0x0D ^ 0x02 ^ b'h' ^ b'i';
    assert_eq!(wire[12], 0xAA);
    assert_eq!(wire[13], expected);
    assert_eq!(example().checksum(), expected);
}

#[test]
fn test_decode_in_odd_blocks() {
    let config = Config::default();
    let samples = signal(&config, &[example()], 3333);
    for block_len in [441, 1280, 4096, 10240, 17000] {
        let (_shared, mut rx) = receiver(&config, 4);
        for block in samples.chunks(block_len) {
            rx.push_samples(block).unwrap();
        }
        let log = rx.take_log();
        assert_eq!(log.len(), 1, "block length {}", block_len);
        assert_eq!(log[0].telegram, example());
        assert!(!log[0].repeated);
        assert_eq!(rx.parse_state(), ParseState::SearchPreamble);
    }
}

#[test]
fn test_duplicate_is_acknowledged_again() {
    let config = Config::default();
    let (shared, mut rx) = receiver(&config, 5);
    rx.push_samples(&signal(&config, &[example()], 0)).unwrap();

    let log = rx.take_log();
    assert_eq!(log.len(), 1);
    assert!(log[0].repeated);
    assert!(shared.send_ack.load(Ordering::SeqCst));
    assert_eq!(shared.seq_nr_ack.load(Ordering::SeqCst), 5);
    assert_eq!(shared.stats().rx_ok, 0);
}

#[test]
fn test_consecutive_telegrams() {
    let config = Config::default();
    let mut ack = Telegram::new(Command::None, Vec::new());
    ack.ack = true;
    ack.seq_nr_ack = 3;
    let call = Telegram::new(Command::Call, vec![17]);

    let (shared, mut rx) = receiver(&config, 0);
    rx.push_samples(&signal(&config, &[call.clone(), ack.clone()], 500))
        .unwrap();
    let log: Vec<Telegram> = rx.take_log().into_iter().map(|r| r.telegram).collect();
    assert_eq!(log, vec![call, ack]);
    assert!(shared.events.call.take());
    assert!(shared.take_ack().is_some());
    assert_eq!(shared.seq_nr_ack_rx.load(Ordering::SeqCst), 3);
}

#[test]
fn test_decode_on_audio_band_channels() {
    for channel in [0, 2, 3, 4, 5] {
        let config = Config {
            frequency_channel: channel,
            ..Config::default()
        };
        let (_shared, mut rx) = receiver(&config, 4);
        rx.push_samples(&signal(&config, &[example()], 777)).unwrap();
        let log = rx.take_log();
        assert_eq!(log.len(), 1, "channel {}", channel);
        assert_eq!(log[0].telegram, example(), "channel {}", channel);
    }
}

#[test]
fn test_gaussian_noise() {
    let config = Config::default();
    let mut samples = signal(&config, &[example()], 2000);
    let mut rng = StdRng::seed_from_u64(0xAC4);
    let noise = Normal::new(0.0f32, 0.05).unwrap();
    for s in samples.iter_mut() {
        *s += noise.sample(&mut rng);
    }

    let (_shared, mut rx) = receiver(&config, 4);
    rx.push_samples(&samples).unwrap();
    let log = rx.take_log();
    assert!(
        log.iter().any(|r| r.telegram == example()),
        "telegram lost in noise: {:?}",
        log
    );
}

#[test]
fn test_silence_yields_nothing() {
    let config = Config::default();
    let (shared, mut rx) = receiver(&config, 0);
    rx.push_samples(&vec![0.0; 5 * 10240]).unwrap();
    assert!(rx.take_log().is_empty());
    assert_eq!(shared.stats().rx_nok, 0);
    assert!(!shared.receive.is_on());
}
