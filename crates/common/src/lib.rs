//! Common utilities for gridpad
//!
//! Shared error handling and logging setup used by the stream engine
//! consumers and the MIDI bridge daemon.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
