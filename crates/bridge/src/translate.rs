//! Pad-event / musical-event translation
//!
//! Owns the bridge's translation state (current channel and volume)
//! and the bounded queue of LED frames waiting for a throttle slot.
//! Grid pads map to notes one-to-one; the top control row steps volume
//! and channel and reports controller 7.

use std::collections::VecDeque;

use protocol::{led_frame, Brightness, GridEvent, Key, NoteEvent, PACKET_LEN};
use tracing::warn;

/// LED frames the queue will hold before dropping new ones.
pub const MAX_QUEUE: usize = 256;

/// Volume step per control-row press.
const VOLUME_STEP: u8 = 10;

/// MIDI messages the bridge emits toward the sequencer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    /// Controller 7 updates driven by the control row.
    Volume { channel: u8, value: u8 },
}

impl MidiMessage {
    pub fn to_bytes(self) -> [u8; 3] {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                [0x90 | (channel & 0x0F), note, velocity]
            }
            MidiMessage::NoteOff { channel, note } => [0x80 | (channel & 0x0F), note, 0],
            MidiMessage::Volume { channel, value } => [0xB0 | (channel & 0x0F), 0x07, value],
        }
    }
}

/// Parse an inbound raw MIDI message into the note event the grid can
/// display. Note-on with velocity zero is a release, per running
/// status convention.
pub fn parse_midi(bytes: &[u8]) -> Option<NoteEvent> {
    let status = bytes.first()? & 0xF0;
    match status {
        0x90 if bytes.len() >= 3 => Some(match bytes[2] {
            0 => NoteEvent::Off { note: bytes[1] },
            velocity => NoteEvent::On { note: bytes[1], velocity },
        }),
        0x80 if bytes.len() >= 2 => Some(NoteEvent::Off { note: bytes[1] }),
        _ => None,
    }
}

/// Stateful two-way translator.
pub struct Translator {
    channel: u8,
    volume: u8,
}

impl Translator {
    pub fn new() -> Self {
        Self { channel: 1, volume: 64 }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Grid side to MIDI side. Control-row releases produce nothing.
    pub fn grid_to_midi(&mut self, event: GridEvent) -> Option<MidiMessage> {
        match event {
            GridEvent::Pad { key, down } => Some(if down {
                MidiMessage::NoteOn {
                    channel: self.channel,
                    note: key.0,
                    velocity: self.volume,
                }
            } else {
                MidiMessage::NoteOff { channel: self.channel, note: key.0 }
            }),
            GridEvent::Control { key, down } => {
                if !down {
                    return None;
                }
                match key.control_offset()? {
                    0 => {
                        self.volume =
                            if self.volume > 127 - VOLUME_STEP { 127 } else { self.volume + VOLUME_STEP };
                    }
                    1 => {
                        self.volume =
                            if self.volume < VOLUME_STEP + 1 { 0 } else { self.volume - VOLUME_STEP };
                    }
                    2 => self.channel = (self.channel + 1).min(15),
                    3 => self.channel = self.channel.saturating_sub(1),
                    _ => return None,
                }
                Some(MidiMessage::Volume { channel: self.channel, value: self.volume })
            }
        }
    }

    /// MIDI side to an LED frame. A plain note-off dims the pad rather
    /// than blanking it, so released keys stay visible on the grid.
    pub fn note_to_frame(&self, event: NoteEvent) -> [u8; PACKET_LEN] {
        match event {
            NoteEvent::On { note, velocity } => {
                // the stock key-on velocity renders poorly; nudge it
                // onto a real brightness level
                let velocity = if velocity == 64 { 60 } else { velocity };
                led_frame(Key(note), Brightness::from_velocity(velocity))
            }
            NoteEvent::Off { note } => led_frame(Key(note), Brightness::Dim),
        }
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO of LED frames awaiting a write slot.
pub struct OutboundQueue {
    frames: VecDeque<[u8; PACKET_LEN]>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue a frame; full queues drop the newcomer and count it.
    pub fn push(&mut self, frame: [u8; PACKET_LEN]) -> bool {
        if self.frames.len() >= self.capacity {
            self.dropped += 1;
            warn!(dropped = self.dropped, "LED queue full, dropping frame");
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    pub fn pop(&mut self) -> Option<[u8; PACKET_LEN]> {
        self.frames.pop_front()
    }

    /// Put a frame back at the head after a would-block write.
    pub fn requeue_front(&mut self, frame: [u8; PACKET_LEN]) {
        self.frames.push_front(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::frame_to_note;

    #[test]
    fn pad_press_becomes_note_on_at_current_volume() {
        let mut translator = Translator::new();
        let message = translator
            .grid_to_midi(GridEvent::Pad { key: Key(0x29), down: true })
            .unwrap();
        assert_eq!(
            message,
            MidiMessage::NoteOn { channel: 1, note: 0x29, velocity: 64 }
        );
        assert_eq!(message.to_bytes(), [0x91, 0x29, 64]);

        let message = translator
            .grid_to_midi(GridEvent::Pad { key: Key(0x29), down: false })
            .unwrap();
        assert_eq!(message, MidiMessage::NoteOff { channel: 1, note: 0x29 });
    }

    #[test]
    fn bright_frame_translates_to_note_on() {
        // an LED frame for note 0 at the bright level reads back as
        // note-on 0 with velocity 56
        let translator = Translator::new();
        let frame = translator.note_to_frame(NoteEvent::On { note: 0, velocity: 56 });
        assert_eq!(frame, [0x90, 0x00, 0x38]);
        assert_eq!(
            frame_to_note(&frame),
            Some(NoteEvent::On { note: 0, velocity: 56 })
        );
    }

    #[test]
    fn stock_velocity_is_remapped_and_note_off_dims() {
        let translator = Translator::new();
        assert_eq!(
            translator.note_to_frame(NoteEvent::On { note: 3, velocity: 64 }),
            [0x90, 3, 60]
        );
        assert_eq!(
            translator.note_to_frame(NoteEvent::Off { note: 3 }),
            [0x90, 3, 12]
        );
    }

    #[test]
    fn volume_buttons_step_and_clamp() {
        let mut translator = Translator::new();
        // key 104 = volume up
        for _ in 0..10 {
            translator.grid_to_midi(GridEvent::Control { key: Key(104), down: true });
        }
        assert_eq!(translator.volume(), 127);

        // key 105 = volume down, saturating at zero
        for _ in 0..20 {
            translator.grid_to_midi(GridEvent::Control { key: Key(105), down: true });
        }
        assert_eq!(translator.volume(), 0);

        // releases change nothing
        assert_eq!(
            translator.grid_to_midi(GridEvent::Control { key: Key(104), down: false }),
            None
        );
        assert_eq!(translator.volume(), 0);
    }

    #[test]
    fn channel_buttons_step_within_midi_range() {
        let mut translator = Translator::new();
        for _ in 0..20 {
            translator.grid_to_midi(GridEvent::Control { key: Key(106), down: true });
        }
        assert_eq!(translator.channel(), 15);

        for _ in 0..20 {
            translator.grid_to_midi(GridEvent::Control { key: Key(107), down: true });
        }
        assert_eq!(translator.channel(), 0);
    }

    #[test]
    fn parse_midi_handles_both_note_forms() {
        assert_eq!(
            parse_midi(&[0x90, 5, 100]),
            Some(NoteEvent::On { note: 5, velocity: 100 })
        );
        assert_eq!(parse_midi(&[0x90, 5, 0]), Some(NoteEvent::Off { note: 5 }));
        assert_eq!(parse_midi(&[0x81, 5, 0]), Some(NoteEvent::Off { note: 5 }));
        assert_eq!(parse_midi(&[0xB0, 7, 64]), None);
        assert_eq!(parse_midi(&[]), None);
    }

    #[test]
    fn queue_is_bounded_and_counts_drops() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.push([0x90, 0, 0]));
        assert!(queue.push([0x90, 1, 0]));
        assert!(!queue.push([0x90, 2, 0]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        let head = queue.pop().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.pop(), Some([0x90, 0, 0]));
        assert_eq!(queue.pop(), Some([0x90, 1, 0]));
        assert!(queue.is_empty());
    }
}
