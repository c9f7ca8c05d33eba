//! In-process audio channel between two sessions
//!
//! Each step plays one output block of either port into the input of the
//! other. [`Loopback::start`] runs the steps on a thread at a fixed pace,
//! normally the playing time of one block.

use crate::error::Result;
use crate::session::AudioPort;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Exchange one block in both directions
pub fn exchange(a: &AudioPort, b: &AudioPort, block: &mut [f32]) {
    a.on_output(block);
    b.on_input(block);
    b.on_output(block);
    a.on_input(block);
}

pub struct Loopback {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Loopback {
    /// Connect `a` and `b`, exchanging one block every `pace`
    pub fn start(a: AudioPort, b: AudioPort, pace: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("ac4qgp-loopback".into())
            .spawn(move || {
                let mut block = vec![0.0; a.chunk_len()];
                let mut next = Instant::now();
                let mut blocks = 0u64;
                while flag.load(Ordering::SeqCst) {
                    exchange(&a, &b, &mut block);
                    blocks += 1;
                    next += pace;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                debug!("loopback stopped after {} blocks", blocks);
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Connect `a` and `b` in real time
    pub fn real_time(a: AudioPort, b: AudioPort) -> Result<Self> {
        let pace = a.chunk_duration();
        Self::start(a, b, pace)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.stop();
    }
}
