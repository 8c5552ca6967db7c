//! Frame encoding and the stateful inbound decoder
//!
//! Inbound bytes arrive as an unframed stream: a reader may pull one
//! byte at a time, so the decoder carries a half-consumed pair and the
//! current control-mode flag across feeds. Mode markers (`0xB0` in,
//! `0x90` out) are consumed without producing an event.

use crate::types::{Brightness, GridEvent, Key, NoteEvent, CONTROL_MARKER, KEY_STATUS, PACKET_LEN};

/// Encode an outbound LED frame for one key.
pub fn led_frame(key: Key, brightness: Brightness) -> [u8; PACKET_LEN] {
    [KEY_STATUS, key.0, brightness.velocity()]
}

/// Interpret an outbound LED frame as the musical event it encodes:
/// a nonzero velocity is a note-on, zero a note-off.
pub fn frame_to_note(frame: &[u8; PACKET_LEN]) -> Option<NoteEvent> {
    if frame[0] != KEY_STATUS {
        return None;
    }
    Some(match frame[2] {
        0 => NoteEvent::Off { note: frame[1] },
        velocity => NoteEvent::On { note: frame[1], velocity },
    })
}

/// Incremental decoder for the inbound byte stream.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    /// First byte of a pair whose second byte has not arrived yet.
    pending: Option<u8>,
    /// Set while the stream reports the control row.
    control_mode: bool,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes, producing every event completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<GridEvent> {
        let mut events = Vec::new();
        for &byte in bytes {
            match self.pending.take() {
                Some(first) => {
                    let key = Key(first);
                    let down = byte != 0;
                    events.push(if self.control_mode {
                        GridEvent::Control { key, down }
                    } else {
                        GridEvent::Pad { key, down }
                    });
                }
                None => match byte {
                    CONTROL_MARKER => self.control_mode = true,
                    KEY_STATUS => self.control_mode = false,
                    first => self.pending = Some(first),
                },
            }
        }
        events
    }

    /// Whether the decoder is mid-pair.
    pub fn has_partial(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget any half-consumed pair and leave control mode, e.g.
    /// after a pipe reset invalidated the stream position.
    pub fn reset(&mut self) {
        self.pending = None;
        self.control_mode = false;
    }
}
