//! Circular transmit buffer between the sender worker and the output callback
//!
//! The arena holds `telegrams_in_parallel` slots of `slot_chunks` chunks each.
//! The sender worker is the only producer and writes a modulated telegram into
//! the slot at the write cursor; the output callback is the only consumer and
//! reads one chunk per call from the read cursor. Cursors are only compared
//! and advanced under `cursors`; a slot's samples are locked separately and
//! never touched by both sides at once, since the producer only writes slots
//! outside `[read, read + len)`.

use crate::config::Settings;
use crate::error::{LinkError, Result};
use std::sync::Mutex;

struct Slot {
    samples: Box<[f32]>,
    /// Chunks of `samples` holding the current telegram
    chunks: usize,
}

#[derive(Debug, Default)]
struct Cursors {
    write: usize,
    read: usize,
    /// Next chunk to play within the read slot
    read_chunk: usize,
    /// Slots filled and not completely played
    len: usize,
}

pub struct TransmitArena {
    chunk_len: usize,
    slot_len: usize,
    slots: Vec<Mutex<Slot>>,
    cursors: Mutex<Cursors>,
}

impl TransmitArena {
    pub fn new(settings: &Settings) -> Self {
        let slot_len = settings.slot_len();
        let slots = (0..settings.config.telegrams_in_parallel)
            .map(|_| {
                Mutex::new(Slot {
                    samples: vec![0.0; slot_len].into_boxed_slice(),
                    chunks: 0,
                })
            })
            .collect();
        Self {
            chunk_len: settings.chunk_len,
            slot_len,
            slots,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Telegrams queued or playing
    pub fn occupancy(&self) -> usize {
        self.lock_cursors().len
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    /// Queue a modulated telegram, already padded to whole chunks.
    pub fn push(&self, samples: &[f32]) -> Result<()> {
        if samples.len() > self.slot_len {
            return Err(LinkError::FrameTooLong {
                len: samples.len(),
                capacity: self.slot_len,
            });
        }
        let index = {
            let cursors = self.lock_cursors();
            if cursors.len == self.capacity() {
                return Err(LinkError::BufferFull(cursors.len));
            }
            cursors.write
        };

        {
            let mut slot = self.lock_slot(index);
            slot.samples[..samples.len()].copy_from_slice(samples);
            slot.chunks = samples.len().div_ceil(self.chunk_len);
            let used = slot.chunks * self.chunk_len;
            slot.samples[samples.len()..used].fill(0.0);
        }

        let mut cursors = self.lock_cursors();
        cursors.write = (cursors.write + 1) % self.capacity();
        cursors.len += 1;
        Ok(())
    }

    /// Fill `out` with the next chunk, or with silence when nothing is queued.
    /// Returns whether a telegram chunk was played.
    pub fn pop_chunk(&self, out: &mut [f32]) -> bool {
        let (index, chunk) = {
            let cursors = self.lock_cursors();
            if cursors.len == 0 {
                out.fill(0.0);
                return false;
            }
            (cursors.read, cursors.read_chunk)
        };

        let chunks = {
            let slot = self.lock_slot(index);
            let from = chunk * self.chunk_len;
            let n = out.len().min(self.chunk_len);
            out[..n].copy_from_slice(&slot.samples[from..from + n]);
            out[n..].fill(0.0);
            slot.chunks
        };

        let mut cursors = self.lock_cursors();
        cursors.read_chunk += 1;
        if cursors.read_chunk >= chunks {
            cursors.read_chunk = 0;
            cursors.read = (cursors.read + 1) % self.capacity();
            cursors.len -= 1;
        }
        true
    }

    /// Drop everything queued
    pub fn clear(&self) {
        *self.lock_cursors() = Cursors::default();
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_slot(&self, index: usize) -> std::sync::MutexGuard<'_, Slot> {
        self.slots[index].lock().unwrap_or_else(|e| e.into_inner())
    }
}
