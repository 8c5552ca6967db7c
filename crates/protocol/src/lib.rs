//! Wire format for the gridpad hardware channel
//!
//! The device speaks fixed 3-byte packets over its interrupt endpoint
//! pair. Outbound frames set a single pad LED; inbound bytes report
//! key presses and releases, with one-byte mode markers switching the
//! top control row in and out of the stream.
//!
//! # Example
//!
//! ```
//! use protocol::{Brightness, Key, PacketDecoder, GridEvent, led_frame};
//!
//! // Light the top-left pad.
//! let frame = led_frame(Key::from_grid(0, 0).unwrap(), Brightness::Bright);
//! assert_eq!(frame, [0x90, 0x00, 0x38]);
//!
//! // Decode a press of the same pad.
//! let mut decoder = PacketDecoder::new();
//! let events = decoder.feed(&[0x00, 0x7F]);
//! assert!(matches!(events[0], GridEvent::Pad { down: true, .. }));
//! ```

mod codec;
mod types;

pub use codec::{PacketDecoder, frame_to_note, led_frame};
pub use types::{Brightness, GridEvent, Key, NoteEvent, CONTROL_MARKER, GRID_SIZE, KEY_STATUS, PACKET_LEN, ROW_STRIDE};
