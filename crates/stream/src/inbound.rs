//! Inbound buffer state
//!
//! One receive buffer per session, shared by every reader. The fields
//! here form the session's fast-lock domain: the completion dispatcher
//! is the only hardware-side writer, and the lock is never held across
//! a wait. `filled > copied` is the sole condition for "data ready".

use crate::engine::{CompletionStatus, TransferToken};
use crate::error::StreamError;

/// Sticky transfer faults, recorded by completions and surfaced to
/// exactly the next foreground call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sticky {
    PipeReset,
    Transport,
}

impl Sticky {
    pub(crate) fn into_error(self) -> StreamError {
        match self {
            Sticky::PipeReset => StreamError::PipeReset,
            Sticky::Transport => {
                StreamError::Transport("transfer completed with an unexpected status".into())
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct InboundState {
    /// The receive buffer; `None` while a transfer owns it.
    buf: Option<Vec<u8>>,
    capacity: usize,
    /// Fresh bytes delivered by the last completion.
    pub(crate) filled: usize,
    /// How many of them callers have already copied out.
    pub(crate) copied: usize,
    /// A receive transfer is standing at the engine.
    pub(crate) in_flight: bool,
    /// A completion happened that no reader has observed yet.
    pub(crate) unclaimed: bool,
    /// Token of the standing transfer, for explicit cancellation.
    pub(crate) token: Option<TransferToken>,
    sticky: Option<Sticky>,
}

impl InboundState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Some(vec![0; capacity]),
            capacity,
            filled: 0,
            copied: 0,
            in_flight: false,
            unclaimed: false,
            token: None,
            sticky: None,
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.filled - self.copied
    }

    pub(crate) fn has_data(&self) -> bool {
        self.filled > self.copied
    }

    pub(crate) fn record_sticky(&mut self, sticky: Sticky) {
        self.sticky = Some(sticky);
    }

    /// Take the sticky error, if any; it is reported exactly once.
    pub(crate) fn take_sticky(&mut self) -> Option<Sticky> {
        self.sticky.take()
    }

    /// An error replaces whatever the buffer held.
    pub(crate) fn discard_window(&mut self) {
        self.filled = 0;
        self.copied = 0;
    }

    /// Detach the buffer for a fresh submission, resetting the window.
    /// Declines (`None`) while a transfer is already standing, which
    /// makes opportunistic submissions idempotent.
    pub(crate) fn begin_receive(&mut self) -> Option<Vec<u8>> {
        if self.in_flight {
            return None;
        }
        let buf = self.buf.take()?;
        debug_assert_eq!(buf.len(), self.capacity);
        self.filled = 0;
        self.copied = 0;
        self.in_flight = true;
        self.unclaimed = false;
        Some(buf)
    }

    /// Dispatcher half: the transfer finished and buffer ownership
    /// returns. Benign teardown statuses leave no trace; unexpected
    /// ones go sticky.
    pub(crate) fn complete(&mut self, status: CompletionStatus, buffer: Vec<u8>) {
        match status {
            CompletionStatus::Completed { actual } => {
                self.filled = actual.min(self.capacity);
                self.copied = 0;
            }
            status if status.is_benign() => {}
            CompletionStatus::Stall => self.record_sticky(Sticky::PipeReset),
            _ => self.record_sticky(Sticky::Transport),
        }
        self.in_flight = false;
        self.unclaimed = true;
        self.token = None;
        self.buf = Some(buffer);
    }

    /// Restore state after a submission the engine rejected.
    pub(crate) fn abort_receive(&mut self, buffer: Vec<u8>) {
        self.in_flight = false;
        self.unclaimed = false;
        self.buf = Some(buffer);
    }

    /// Copy the next chunk out, advancing the consumed offset.
    pub(crate) fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let Some(buf) = &self.buf else {
            return 0;
        };
        let chunk = self.available().min(out.len());
        out[..chunk].copy_from_slice(&buf[self.copied..self.copied + chunk]);
        self.copied += chunk;
        chunk
    }
}
