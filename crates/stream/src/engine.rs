//! Transfer engine abstraction
//!
//! One interface over the host's asynchronous transfer machinery, with
//! backends selected at configuration time: [`libusb::LibusbEngine`]
//! for real hardware and [`mock::MockEngine`] for deterministic tests
//! and simulation. The session state machine above this trait is never
//! forked between them.
//!
//! Completions are message-passed into a [`CompletionSink`] from the
//! engine's own context (the libusb event thread, or whichever thread
//! finishes a mock transfer). Engines never invoke the sink from
//! inside `submit`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "libusb")]
pub mod libusb;
pub mod mock;

#[cfg(feature = "libusb")]
pub use libusb::LibusbEngine;
pub use mock::MockEngine;

/// Transfer direction relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer kind from the interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of the claimed interface.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
    pub max_packet_size: usize,
}

/// Identifies a submitted transfer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);

/// How a transfer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transfer moved `actual` bytes.
    Completed { actual: usize },
    /// Cancelled by teardown or drain.
    Cancelled,
    TimedOut,
    /// The endpoint halted.
    Stall,
    /// The device left the bus while the transfer was in flight.
    Disconnected,
    /// Any other failure.
    Error,
}

impl CompletionStatus {
    /// Statuses produced by intentional teardown; never reportable.
    pub fn is_benign(self) -> bool {
        matches!(self, CompletionStatus::Cancelled | CompletionStatus::Disconnected)
    }
}

/// A finished transfer. Ownership of the buffer returns to the sink.
#[derive(Debug)]
pub struct Completion {
    pub token: TransferToken,
    pub direction: Direction,
    pub status: CompletionStatus,
    pub buffer: Vec<u8>,
}

/// An asynchronous transfer to submit.
///
/// The buffer is owned by the transfer while it is in flight: for
/// inbound transfers its full length is the requested read size, for
/// outbound transfers it holds the bytes to send.
pub struct TransferRequest {
    pub direction: Direction,
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    /// Zero means no timeout.
    pub timeout: Duration,
}

/// Submission-time failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transfer allocation failed")]
    NoMem,

    #[error("device is no longer attached")]
    NoDevice,

    #[error("endpoint {0:#04x} rejected the submission")]
    Rejected(u8),

    #[error("transfer backend failure: {0}")]
    Backend(String),
}

/// Rejected submissions hand the buffer back to the caller.
pub type SubmitResult = std::result::Result<TransferToken, (Vec<u8>, EngineError)>;

/// Receives completions from the engine.
pub trait CompletionSink: Send + Sync {
    /// Runs exactly once per accepted submission, including cancelled
    /// ones. Must not block beyond short lock contention.
    fn on_complete(&self, completion: Completion);
}

/// The host's asynchronous transfer machinery.
pub trait TransferEngine: Send + Sync {
    /// Endpoints of the claimed interface.
    fn endpoints(&self) -> std::result::Result<Vec<EndpointInfo>, EngineError>;

    /// Queue an asynchronous transfer. The sink is never invoked from
    /// inside this call.
    fn submit(&self, request: TransferRequest, sink: Arc<dyn CompletionSink>) -> SubmitResult;

    /// Best-effort cancellation. The completion path still runs for a
    /// cancelled transfer, with a benign status.
    fn cancel(&self, token: TransferToken);

    /// Hold off (or re-allow) power suspension while a stream is open.
    fn set_power_hold(&self, held: bool);
}
