//! gridpad MIDI bridge daemon
//!
//! Opens the grid controller through the stream engine, decodes its
//! byte stream into pad events, and bridges both directions to a pair
//! of virtual MIDI ports: pads become notes, incoming notes become LED
//! frames. A blocking reader thread feeds the async select loop over a
//! channel, so hardware readiness, MIDI input, the LED flush tick and
//! shutdown are all waited on in one place.

mod config;
mod midi;
mod translate;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use protocol::{GridEvent, PacketDecoder};
use stream::engine::{LibusbEngine, TransferEngine};
use stream::{DeviceSession, StreamError, StreamHandle};
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::midi::MidiPorts;
use crate::translate::{OutboundQueue, Translator};

/// How often queued LED frames are retried against the write throttle.
const FLUSH_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Parser, Debug)]
#[command(name = "gridpadd")]
#[command(
    author,
    version,
    about = "Bridge an 8x8 grid controller to virtual MIDI ports"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => BridgeConfig::load(path).context("failed to load configuration")?,
        None => BridgeConfig::load_or_default(),
    };
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).map_err(|e| anyhow::anyhow!("{}", e))?;

    info!("gridpadd v{}", env!("CARGO_PKG_VERSION"));

    let engine = LibusbEngine::open(config.device.vendor_id, config.device.product_id)
        .context("failed to open the grid controller")?;
    let engine: Arc<dyn TransferEngine> = Arc::new(engine);
    let session = Arc::new(DeviceSession::probe(engine).context("device probe failed")?);

    // pad events flow from a blocking reader thread into the select loop
    let (grid_tx, grid_rx) = async_channel::bounded::<GridEvent>(256);
    let running = Arc::new(AtomicBool::new(true));
    let reader = spawn_reader(session.clone(), grid_tx, running.clone());

    // inbound MIDI lands on its own channel via the midir callback
    let (midi_tx, midi_rx) = async_channel::bounded::<Vec<u8>>(256);
    let mut ports = MidiPorts::create(&config.midi.client_name, midi_tx)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let writer = session.open().map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut translator = Translator::new();
    let mut queue = OutboundQueue::new(translate::MAX_QUEUE);
    let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            event = grid_rx.recv() => {
                let Ok(event) = event else {
                    warn!("grid reader ended");
                    break;
                };
                if let Some(message) = translator.grid_to_midi(event) {
                    if let Err(e) = ports.send(&message.to_bytes()) {
                        warn!("MIDI send failed: {}", e);
                    }
                }
            }
            bytes = midi_rx.recv() => {
                let Ok(bytes) = bytes else { break };
                if let Some(event) = translate::parse_midi(&bytes) {
                    queue.push(translator.note_to_frame(event));
                }
                flush_queue(&writer, &mut queue);
            }
            _ = flush_tick.tick() => {
                if !queue.is_empty() {
                    flush_queue(&writer, &mut queue);
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    // stop the reader, then settle in-flight transfers; closing the
    // channel first keeps the reader from blocking on a full queue
    running.store(false, Ordering::Release);
    drop(grid_rx);
    session.interrupt();
    if let Err(e) = reader.join() {
        error!("grid reader panicked: {:?}", e);
    }
    if let Err(e) = session.flush() {
        debug!("flush reported pending error: {}", e);
    }
    drop(writer);

    info!("gridpadd stopped");
    Ok(())
}

/// Blocking USB reader: decodes the stream and forwards pad events.
fn spawn_reader(
    session: Arc<DeviceSession>,
    tx: async_channel::Sender<GridEvent>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("grid-reader".to_string())
        .spawn(move || {
            let handle = match session.open() {
                Ok(handle) => handle,
                Err(e) => {
                    error!("could not open the stream: {}", e);
                    return;
                }
            };
            let mut decoder = PacketDecoder::new();
            let mut buf = [0u8; 64];
            while running.load(Ordering::Acquire) {
                match handle.read(&mut buf, false) {
                    Ok(n) => {
                        for event in decoder.feed(&buf[..n]) {
                            if tx.send_blocking(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(StreamError::Interrupted) => {}
                    Err(StreamError::PipeReset) => {
                        warn!("pipe reset; resynchronizing the decoder");
                        decoder.reset();
                    }
                    Err(StreamError::DeviceGone) => {
                        warn!("grid controller disappeared");
                        session.disconnect();
                        break;
                    }
                    Err(e) => {
                        warn!("stream read failed: {}", e);
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            debug!("grid reader stopped");
        })
        .expect("failed to spawn grid reader")
}

/// Push queued LED frames until the throttle pushes back.
fn flush_queue(writer: &StreamHandle, queue: &mut OutboundQueue) {
    while let Some(frame) = queue.pop() {
        match writer.write(&frame, true) {
            Ok(_) => {}
            Err(StreamError::WouldBlock) => {
                queue.requeue_front(frame);
                break;
            }
            Err(e) => {
                warn!("LED write failed: {}", e);
                break;
            }
        }
    }
}
