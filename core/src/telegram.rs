//! Telegram layout, checksum and the field-by-field decoder
//!
//! Wire format, one byte per field unless noted:
//!
//! ```text
//! PREAMBLE (n x 0xFF) | START 0x55 | ADDRESS | SEQ_NR | SEQ_NR_ACK | COMMAND
//! | DATA_LEN | DATA (DATA_LEN bytes) | END 0xAA | CHECKSUM | TERMINATOR (n x 0x00)
//! ```
//!
//! CHECKSUM is the XOR of START up to the last DATA byte. Bit 7 of COMMAND
//! carries a piggy-backed acknowledgement.

use crate::bits::BitBuffer;
use crate::error::{LinkError, Result};
use crate::tone::ToneCodec;
use bitvec::prelude::*;
use std::fmt;

pub const PREAMBLE_BYTE: u8 = 0xFF;
pub const START_BYTE: u8 = 0x55;
pub const ADDRESS: u8 = 1;
pub const END_BYTE: u8 = 0xAA;
pub const TERMINATOR_BYTE: u8 = 0x00;
pub const ACK_FLAG: u8 = 0x80;
/// Sequence numbers count 0..=254
pub const SEQ_NR_MODULUS: u16 = 255;

pub fn next_seq_nr(seq_nr: u8) -> u8 {
    ((seq_nr as u16 + 1) % SEQ_NR_MODULUS) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    None = 0,
    Call = 1,
    CallAccepted = 2,
    CallRejected = 3,
    CallEnd = 4,
    KeyStart = 5,
    /// Reserved, never sent
    KeyPart = 6,
    KeyEnd = 7,
    StartupData = 8,
    StartupDataComplete = 9,
    ChatDataStart = 10,
    ChatDataPart = 11,
    ChatDataEnd = 12,
    ChatData = 13,
    Error = 0x7E,
    Broadcast = 0x7F,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        use Command::*;
        Some(match code & !ACK_FLAG {
            0 => None,
            1 => Call,
            2 => CallAccepted,
            3 => CallRejected,
            4 => CallEnd,
            5 => KeyStart,
            6 => KeyPart,
            7 => KeyEnd,
            8 => StartupData,
            9 => StartupDataComplete,
            10 => ChatDataStart,
            11 => ChatDataPart,
            12 => ChatDataEnd,
            13 => ChatData,
            0x7E => Error,
            0x7F => Broadcast,
            _ => return Option::None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Commands delivered reliably: they consume a sequence number and are
    /// retransmitted until the peer acknowledges them.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Command::CallRejected
                | Command::CallEnd
                | Command::StartupDataComplete
                | Command::ChatDataStart
                | Command::ChatDataPart
                | Command::ChatDataEnd
                | Command::ChatData
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::None => "NONE",
            Command::Call => "CALL",
            Command::CallAccepted => "CALL_ACCEPTED",
            Command::CallRejected => "CALL_REJECTED",
            Command::CallEnd => "CALL_END",
            Command::KeyStart => "KEY_START",
            Command::KeyPart => "KEY_PART",
            Command::KeyEnd => "KEY_END",
            Command::StartupData => "STARTUP_DATA",
            Command::StartupDataComplete => "STARTUP_DATA_COMPLETE",
            Command::ChatDataStart => "CHAT_DATA_START",
            Command::ChatDataPart => "CHAT_DATA_PART",
            Command::ChatDataEnd => "CHAT_DATA_END",
            Command::ChatData => "CHAT_DATA",
            Command::Error => "ERROR",
            Command::Broadcast => "BROADCAST",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub seq_nr: u8,
    pub seq_nr_ack: u8,
    pub command: Command,
    /// ACK flag (bit 7 of the COMMAND byte)
    pub ack: bool,
    pub data: Vec<u8>,
}

impl Telegram {
    pub fn new(command: Command, data: Vec<u8>) -> Self {
        Self {
            seq_nr: 0,
            seq_nr_ack: 0,
            command,
            ack: false,
            data,
        }
    }

    pub fn command_byte(&self) -> u8 {
        if self.ack {
            self.command.code() | ACK_FLAG
        } else {
            self.command.code()
        }
    }

    pub fn checksum(&self) -> u8 {
        checksum(
            self.seq_nr,
            self.seq_nr_ack,
            self.command_byte(),
            &self.data,
        )
    }

    /// Serialize with `preamble_len` leading 0xFF and `terminator_len`
    /// trailing 0x00 bytes.
    pub fn to_wire(&self, preamble_len: usize, terminator_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(preamble_len + 8 + self.data.len() + terminator_len);
        out.resize(preamble_len, PREAMBLE_BYTE);
        out.extend_from_slice(&[
            START_BYTE,
            ADDRESS,
            self.seq_nr,
            self.seq_nr_ack,
            self.command_byte(),
            self.data.len() as u8,
        ]);
        out.extend_from_slice(&self.data);
        out.push(END_BYTE);
        out.push(self.checksum());
        out.resize(out.len() + terminator_len, TERMINATOR_BYTE);
        out
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} sn={} sna={} len={}",
            self.command,
            if self.ack { "+ACK" } else { "" },
            self.seq_nr,
            self.seq_nr_ack,
            self.data.len()
        )
    }
}

fn checksum(seq_nr: u8, seq_nr_ack: u8, command: u8, data: &[u8]) -> u8 {
    data.iter().fold(
        START_BYTE ^ ADDRESS ^ seq_nr ^ seq_nr_ack ^ command ^ data.len() as u8,
        |acc, b| acc ^ b,
    )
}

/// Map serialized bytes to tones, MSB first, padded with silence to a whole
/// number of `chunk_len` blocks.
pub fn modulate(codec: &ToneCodec, wire: &[u8], chunk_len: usize) -> Vec<f32> {
    let bits = wire.view_bits::<Msb0>();
    let ones = bits.count_ones();
    let len = ones * codec.bit_len(true) + (bits.len() - ones) * codec.bit_len(false);
    let mut samples = Vec::with_capacity(len.div_ceil(chunk_len) * chunk_len);
    for bit in bits.iter().by_vals() {
        samples.extend_from_slice(codec.encode_bit(bit));
    }
    samples.resize(len.div_ceil(chunk_len) * chunk_len, 0.0);
    samples
}

/// Field currently expected by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeSubState {
    #[default]
    Address,
    SeqNr,
    SeqNrAck,
    Command,
    DataLen,
    Data,
    End,
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub telegram: Telegram,
    /// SEQ_NR equals the last one acknowledged: a retransmission
    pub repeated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    NeedMoreBits,
    Complete(Received),
}

/// Consumes content bits (everything after START) one field at a time.
/// A field is only consumed once all of its bits are available.
#[derive(Debug)]
pub struct TelegramDecoder {
    state: DecodeSubState,
    data_max_len: usize,
    seq_nr: u8,
    seq_nr_ack: u8,
    command: u8,
    data_len: usize,
    data: Vec<u8>,
    repeated: bool,
    /// SEQ_NR out of order, rejected once COMMAND shows it is not a CALL
    unexpected_seq_nr: Option<u8>,
}

impl TelegramDecoder {
    pub fn new(data_max_len: usize) -> Self {
        Self {
            state: DecodeSubState::Address,
            data_max_len,
            seq_nr: 0,
            seq_nr_ack: 0,
            command: 0,
            data_len: 0,
            data: Vec::with_capacity(data_max_len),
            repeated: false,
            unexpected_seq_nr: None,
        }
    }

    pub fn state(&self) -> DecodeSubState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = DecodeSubState::Address;
        self.data.clear();
        self.data_len = 0;
        self.repeated = false;
        self.unexpected_seq_nr = None;
    }

    /// Advance as far as the available bits allow. `last_acked` is the last
    /// sequence number this side acknowledged to the peer. On a validation
    /// error the decoder is reset before the error is returned.
    pub fn decode(&mut self, bits: &mut BitBuffer, last_acked: u8) -> Result<DecodeStatus> {
        let result = self.advance(bits, last_acked);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn advance(&mut self, bits: &mut BitBuffer, last_acked: u8) -> Result<DecodeStatus> {
        loop {
            let Some(byte) = bits.read_byte() else {
                return Ok(DecodeStatus::NeedMoreBits);
            };
            self.state = match self.state {
                DecodeSubState::Address => {
                    if byte != ADDRESS {
                        return Err(LinkError::AddressMismatch(byte));
                    }
                    DecodeSubState::SeqNr
                }
                DecodeSubState::SeqNr => {
                    let expected = next_seq_nr(last_acked);
                    self.repeated = byte == last_acked;
                    self.unexpected_seq_nr = (byte != expected && byte != last_acked).then_some(expected);
                    self.seq_nr = byte;
                    DecodeSubState::SeqNrAck
                }
                DecodeSubState::SeqNrAck => {
                    self.seq_nr_ack = byte;
                    DecodeSubState::Command
                }
                DecodeSubState::Command => {
                    // a CALL starts a new sequence, whatever came before
                    if let Some(expected) = self.unexpected_seq_nr {
                        if Command::from_code(byte) != Some(Command::Call) {
                            return Err(LinkError::SeqNrMismatch {
                                got: self.seq_nr,
                                expected,
                            });
                        }
                    }
                    self.command = byte;
                    DecodeSubState::DataLen
                }
                DecodeSubState::DataLen => {
                    let len = byte as usize;
                    if len > self.data_max_len {
                        return Err(LinkError::DataLengthExceeded {
                            len,
                            max: self.data_max_len,
                        });
                    }
                    self.data_len = len;
                    self.data.clear();
                    if len == 0 {
                        DecodeSubState::End
                    } else {
                        DecodeSubState::Data
                    }
                }
                DecodeSubState::Data => {
                    self.data.push(byte);
                    if self.data.len() < self.data_len {
                        DecodeSubState::Data
                    } else {
                        DecodeSubState::End
                    }
                }
                DecodeSubState::End => {
                    if byte != END_BYTE {
                        return Err(LinkError::EndMarkerMismatch(byte));
                    }
                    DecodeSubState::Checksum
                }
                DecodeSubState::Checksum => {
                    let calculated = checksum(self.seq_nr, self.seq_nr_ack, self.command, &self.data);
                    if byte != calculated {
                        return Err(LinkError::ChecksumMismatch { got: byte, calculated });
                    }
                    let command = Command::from_code(self.command)
                        .ok_or(LinkError::UnknownCommand(self.command))?;
                    let received = Received {
                        telegram: Telegram {
                            seq_nr: self.seq_nr,
                            seq_nr_ack: self.seq_nr_ack,
                            command,
                            ack: self.command & ACK_FLAG != 0,
                            data: std::mem::take(&mut self.data),
                        },
                        repeated: self.repeated,
                    };
                    self.reset();
                    return Ok(DecodeStatus::Complete(received));
                }
            };
        }
    }
}
