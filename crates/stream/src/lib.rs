//! Transfer-and-buffering engine for the gridpad device
//!
//! Turns an interrupt-driven, small-fixed-packet USB peripheral into a
//! read/write stream with correct concurrency and lifecycle semantics:
//! a standing receive transfer feeds one shared inbound buffer that
//! sequential readers drain by offset, outbound transfers are bounded
//! by a small in-flight throttle, and teardown (unplug, suspend,
//! reset) drains or force-cancels everything without leaking a buffer
//! or a throttle slot.
//!
//! The hardware side is abstracted behind [`engine::TransferEngine`],
//! with an asynchronous libusb backend for real devices and a
//! deterministic mock backend for tests and simulation. The session
//! state machine is shared between them.

pub mod engine;
mod error;
mod inbound;
mod session;
mod throttle;

pub use error::{Result, StreamError};
pub use session::{DeviceSession, PollEvents, ResetGuard, StreamHandle, MAX_TRANSFER, WRITE_LIMIT};
