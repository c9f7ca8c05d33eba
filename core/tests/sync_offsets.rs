use ac4qgp_core::bits::BitBuffer;
use ac4qgp_core::config::{derive_settings, Config};
use ac4qgp_core::sync::FrameSynchronizer;
use ac4qgp_core::telegram::{Command, Telegram};
use ac4qgp_core::tone::ToneCodec;

fn example() -> Telegram {
    Telegram {
        seq_nr: 5,
        seq_nr_ack: 4,
        command: Command::ChatData,
        ack: false,
        data: b"hi".to_vec(),
    }
}

/// Tones for `bytes`, without any padding
fn tones(codec: &ToneCodec, bytes: &[u8]) -> Vec<f32> {
    let mut out = Vec::new();
    for bit in BitBuffer::from_bytes(bytes).unread().iter().by_vals() {
        out.extend_from_slice(codec.encode_bit(bit));
    }
    out
}

fn check_offsets(config: Config, leads: impl Iterator<Item = usize>) {
    let settings = derive_settings(&config).unwrap();
    let codec = ToneCodec::new(&settings);
    let wire = example().to_wire(config.preamble_len_bytes, config.terminator_len_bytes);
    let signal = tones(&codec, &wire);
    let start = config.preamble_len_bytes;

    for lead in leads {
        let mut window = vec![0.0; lead];
        window.extend_from_slice(&signal);

        let mut sync = FrameSynchronizer::new(&settings);
        let mut bits = BitBuffer::new();
        let point = sync
            .locate(&window, &mut bits)
            .unwrap_or_else(|e| panic!("lead {}: {}", lead, e));
        assert_eq!(
            point.start,
            lead + start * 8 * settings.len_bit_one,
            "lead {}",
            lead
        );
        assert_eq!(
            point.content_offset,
            point.start + settings.start_len_samples + config.sync_offset_correction,
            "lead {}",
            lead
        );

        // everything from ADDRESS up to CHECKSUM decodes exactly
        for (i, expected) in wire[start + 1..wire.len() - 1].iter().enumerate() {
            assert_eq!(bits.read_byte(), Some(*expected), "lead {}, byte {}", lead, i);
        }
    }
}

#[test]
fn test_every_offset_without_correction() {
    check_offsets(
        Config {
            sync_offset_correction: 0,
            ..Config::default()
        },
        0..40,
    );
}

#[test]
fn test_every_offset_with_default_correction() {
    check_offsets(Config::default(), 0..40);
}

#[test]
fn test_offsets_on_unequal_bit_channels() {
    for channel in [0, 2, 3, 4] {
        check_offsets(
            Config {
                frequency_channel: channel,
                ..Config::default()
            },
            (0..97).step_by(7),
        );
    }
}
