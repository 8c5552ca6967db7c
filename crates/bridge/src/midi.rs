//! Virtual MIDI ports for the bridge
//!
//! Creates the sequencer-facing ports and forwards inbound MIDI bytes
//! from the midir callback onto an async channel, where the daemon's
//! select loop picks them up.

use async_channel::Sender;
use common::{Error, Result};
use midir::os::unix::{VirtualInput, VirtualOutput};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::debug;

pub struct MidiPorts {
    /// Held for the lifetime of the bridge; dropping it closes the port.
    _input: MidiInputConnection<Sender<Vec<u8>>>,
    output: MidiOutputConnection,
}

impl MidiPorts {
    /// Create the virtual input/output pair and route inbound messages
    /// into `tx`.
    pub fn create(client_name: &str, tx: Sender<Vec<u8>>) -> Result<Self> {
        let input = MidiInput::new(client_name).map_err(|e| Error::Midi(e.to_string()))?;
        let input = input
            .create_virtual(
                &format!("{client_name} in"),
                |_timestamp, message, tx| {
                    // a closed channel just means the bridge is exiting
                    let _ = tx.send_blocking(message.to_vec());
                },
                tx,
            )
            .map_err(|e| Error::Midi(e.to_string()))?;

        let output = MidiOutput::new(client_name).map_err(|e| Error::Midi(e.to_string()))?;
        let output = output
            .create_virtual(&format!("{client_name} out"))
            .map_err(|e| Error::Midi(e.to_string()))?;

        debug!(client_name, "virtual MIDI ports created");
        Ok(Self { _input: input, output })
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.send(bytes).map_err(|e| Error::Midi(e.to_string()))
    }
}
