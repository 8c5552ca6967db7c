//! Grid and musical event type definitions

/// Length of every hardware frame.
pub const PACKET_LEN: usize = 3;

/// Status byte opening an outbound LED frame.
pub const KEY_STATUS: u8 = 0x90;

/// Inbound marker switching the decoder into extended-control mode.
pub const CONTROL_MARKER: u8 = 0xB0;

/// Pads per row and rows per grid.
pub const GRID_SIZE: u8 = 8;

/// Key indices advance by this much from one row to the next.
pub const ROW_STRIDE: u8 = 16;

/// First key index of the top control row.
const CONTROL_ROW_BASE: u8 = 104;

/// Raw key index as carried on the wire (`row * 16 + col`).
///
/// Grid pads occupy columns 0..8 of rows 0..8; the round buttons of
/// the top control row live at 104..=111.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub u8);

impl Key {
    /// Build a key from grid coordinates. Returns `None` outside the
    /// 8x8 pad matrix.
    pub fn from_grid(row: u8, col: u8) -> Option<Self> {
        if row < GRID_SIZE && col < GRID_SIZE {
            Some(Key(row * ROW_STRIDE + col))
        } else {
            None
        }
    }

    pub fn row(&self) -> u8 {
        self.0 / ROW_STRIDE
    }

    pub fn col(&self) -> u8 {
        self.0 % ROW_STRIDE
    }

    /// True for the 8x8 pad matrix (excludes the scene column and the
    /// control row).
    pub fn is_grid(&self) -> bool {
        self.row() < GRID_SIZE && self.col() < GRID_SIZE
    }

    /// Offset within the top control row, if this key belongs to it.
    pub fn control_offset(&self) -> Option<u8> {
        self.0.checked_sub(CONTROL_ROW_BASE).filter(|off| *off < GRID_SIZE)
    }
}

/// LED brightness as encoded in the velocity byte of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brightness {
    Off,
    Dim,
    Bright,
    /// Raw velocity passthrough for intermediate levels.
    Level(u8),
}

impl Brightness {
    pub fn velocity(self) -> u8 {
        match self {
            Brightness::Off => 0,
            Brightness::Dim => 12,
            Brightness::Bright => 56,
            Brightness::Level(v) => v,
        }
    }

    pub fn from_velocity(v: u8) -> Self {
        match v {
            0 => Brightness::Off,
            12 => Brightness::Dim,
            56 => Brightness::Bright,
            other => Brightness::Level(other),
        }
    }
}

/// One decoded inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridEvent {
    /// A pad (or scene button) went down or up.
    Pad { key: Key, down: bool },
    /// A key reported while the stream is in extended-control mode.
    Control { key: Key, down: bool },
}

/// Musical event exchanged with the MIDI side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    On { note: u8, velocity: u8 },
    Off { note: u8 },
}
