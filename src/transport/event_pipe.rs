//! Cross-thread wake-up for the engine's poll.
//!
//! Writers call [`EventPipe::activate`] after handing the engine work; the
//! engine calls [`EventPipe::reset`] once per turn before it drains that work.
//! Only the first activation after a reset touches the kernel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Registry, Token, Waker};

#[derive(Debug)]
pub struct EventPipe {
    waker: Waker,
    pending: AtomicBool,
}

impl EventPipe {
    /// Register a waker with `registry` under `token`.
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            waker: Waker::new(registry, token)?,
            pending: AtomicBool::new(false),
        })
    }

    /// Interrupt the engine's wait unless a wake-up is already outstanding.
    pub fn activate(&self) -> io::Result<()> {
        if !self.pending.swap(true, Ordering::SeqCst) {
            self.waker.wake()?;
        }
        Ok(())
    }

    /// Allow the next activation to wake the engine again.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}
