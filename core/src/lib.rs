//! Audio modem link for end-to-end encrypted chat over a voice channel
//!
//! Bits travel as single tone segments (one cycle of the ONE frequency, two
//! cycles of the ZERO frequency) in short telegrams with a preamble, a START
//! marker and an XOR checksum. A stop-and-wait link layer with piggy-backed
//! ACKs makes chat data reliable; an X25519 key exchange and AES-256-CBC keep
//! it private, with a short session code for out-of-band verification.

pub mod arena;
pub mod bits;
pub mod config;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod link;
pub mod loopback;
pub mod session;
pub mod sync;
pub mod telegram;
pub mod tone;

pub use config::{derive_settings, Config, Settings, FREQUENCY_CHANNELS};
pub use error::{LinkError, Result};
pub use link::receiver::Receiver;
pub use link::transmitter::Transmitter;
pub use link::{LinkShared, LinkStats};
pub use loopback::Loopback;
pub use session::{AudioPort, PeerInfo, Session};
pub use telegram::{Command, Telegram};
pub use tone::ToneCodec;
