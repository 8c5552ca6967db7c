//! Asynchronous libusb transfer backend
//!
//! Interrupt transfers go through rusb's FFI layer so they can be
//! submitted without blocking and cancelled while in flight. A
//! dedicated pump thread drives `libusb_handle_events`; completions
//! are trampolined from it into the submitting sink, so they never run
//! inline with a submission.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use libc::{c_int, c_uint};
use rusb::constants::*;
use rusb::ffi::*;
use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, trace, warn};

use super::{
    Completion, CompletionSink, CompletionStatus, Direction, EndpointInfo, EndpointKind,
    EngineError, SubmitResult, TransferEngine, TransferRequest, TransferToken,
};

/// Per-iteration timeout of the event pump, and the grace period the
/// engine gives outstanding transfers at teardown.
const EVENT_SLICE: Duration = Duration::from_millis(100);
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

struct WrappedTransfer(NonNull<libusb_transfer>);

// SAFETY: the raw transfer is only touched while it is registered in
// the in-flight map (under its mutex) or by the libusb callback after
// removing it from that map.
unsafe impl Send for WrappedTransfer {}

/// Context handed to libusb as `user_data`, reclaimed in the callback.
struct FlightState {
    token: TransferToken,
    direction: Direction,
    buffer: Vec<u8>,
    sink: Arc<dyn CompletionSink>,
    shared: Arc<Shared>,
}

struct Shared {
    context: Context,
    handle: DeviceHandle<Context>,
    interface: u8,
    in_flight: Mutex<HashMap<u64, WrappedTransfer>>,
    next_token: AtomicU64,
    running: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("failed to release interface {}: {}", self.interface, e);
        }
        if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
            debug!("could not reattach kernel driver (may not have been detached): {}", e);
        }
    }
}

/// Engine backend over a claimed libusb device handle.
pub struct LibusbEngine {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LibusbEngine {
    /// Open and claim the grid controller by vendor/product id,
    /// detaching a bound kernel driver when necessary, and start the
    /// event pump.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, EngineError> {
        let context = Context::new().map_err(map_rusb)?;
        let handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(EngineError::NoDevice)?;

        let interface = 0;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("detaching kernel driver from interface {}", interface);
                handle.detach_kernel_driver(interface).map_err(map_rusb)?;
            }
            Ok(false) => {}
            Err(e) => debug!("kernel driver query failed: {}", e),
        }
        handle.claim_interface(interface).map_err(map_rusb)?;
        debug!(vendor_id, product_id, "claimed grid device");

        let shared = Arc::new(Shared {
            context: context.clone(),
            handle,
            interface,
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });
        let pump = spawn_pump(shared.clone());

        Ok(Self { shared, pump: Mutex::new(Some(pump)) })
    }
}

impl TransferEngine for LibusbEngine {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>, EngineError> {
        let device = self.shared.handle.device();
        let config = device.active_config_descriptor().map_err(map_rusb)?;

        let mut endpoints = Vec::new();
        for interface in config.interfaces() {
            if interface.number() != self.shared.interface {
                continue;
            }
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    endpoints.push(EndpointInfo {
                        address: endpoint.address(),
                        direction: match endpoint.direction() {
                            rusb::Direction::In => Direction::In,
                            rusb::Direction::Out => Direction::Out,
                        },
                        kind: match endpoint.transfer_type() {
                            rusb::TransferType::Control => EndpointKind::Control,
                            rusb::TransferType::Isochronous => EndpointKind::Isochronous,
                            rusb::TransferType::Bulk => EndpointKind::Bulk,
                            rusb::TransferType::Interrupt => EndpointKind::Interrupt,
                        },
                        max_packet_size: endpoint.max_packet_size() as usize,
                    });
                }
            }
        }
        Ok(endpoints)
    }

    fn submit(&self, request: TransferRequest, sink: Arc<dyn CompletionSink>) -> SubmitResult {
        let TransferRequest { direction, endpoint, mut buffer, timeout } = request;

        let transfer = unsafe { libusb_alloc_transfer(0) };
        let Some(transfer) = NonNull::new(transfer) else {
            return Err((buffer, EngineError::NoMem));
        };

        let token = TransferToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let length = buffer.len() as c_int;
        // heap data stays put when the Vec moves into the flight state
        let data = buffer.as_mut_ptr();
        let state = Box::new(FlightState {
            token,
            direction,
            buffer,
            sink,
            shared: self.shared.clone(),
        });
        let user_data = Box::into_raw(state) as *mut c_void;

        // SAFETY: transfer, device handle, buffer and user_data stay
        // valid until transfer_finished reclaims them.
        unsafe {
            libusb_fill_interrupt_transfer(
                transfer.as_ptr(),
                self.shared.handle.as_raw(),
                endpoint,
                data,
                length,
                transfer_finished as _,
                user_data,
                timeout.as_millis() as c_uint,
            );
        }

        // register before submission so cancel() can always find it
        self.shared
            .in_flight
            .lock()
            .unwrap()
            .insert(token.0, WrappedTransfer(transfer));

        let rc = unsafe { libusb_submit_transfer(transfer.as_ptr()) };
        if rc < 0 {
            self.shared.in_flight.lock().unwrap().remove(&token.0);
            // SAFETY: the callback will never run for a rejected
            // submission; reclaim the flight state and the transfer.
            let state = unsafe { Box::from_raw(user_data as *mut FlightState) };
            unsafe { libusb_free_transfer(transfer.as_ptr()) };
            warn!(endpoint, rc, "transfer submission rejected");
            return Err((state.buffer, map_submit_error(rc, endpoint)));
        }

        trace!(token = token.0, endpoint, ?direction, "transfer submitted");
        Ok(token)
    }

    fn cancel(&self, token: TransferToken) {
        let in_flight = self.shared.in_flight.lock().unwrap();
        if let Some(wrapped) = in_flight.get(&token.0) {
            // SAFETY: the callback frees the transfer only after
            // removing it from the registry we hold locked, so the
            // pointer is valid for the duration of this call.
            let rc = unsafe { libusb_cancel_transfer(wrapped.0.as_ptr()) };
            if rc < 0 && rc != LIBUSB_ERROR_NOT_FOUND {
                debug!(token = token.0, rc, "cancel rejected");
            }
        }
    }

    fn set_power_hold(&self, held: bool) {
        // libusb exposes no autosuspend control; the host keeps the
        // device powered while the interface is claimed
        trace!(held, "power hold request");
    }
}

impl Drop for LibusbEngine {
    fn drop(&mut self) {
        let tokens: Vec<u64> = self.shared.in_flight.lock().unwrap().keys().copied().collect();
        for token in tokens {
            self.cancel(TransferToken(token));
        }
        // let the pump run the cancelled completion paths out
        let deadline = Instant::now() + TEARDOWN_GRACE;
        while !self.shared.in_flight.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.shared.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }
    // SAFETY: libusb hands back the pointer filled in submit().
    let transfer = unsafe { &mut *transfer_ptr };
    let user_data = transfer.user_data;
    if user_data.is_null() {
        return;
    }
    // SAFETY: user_data is the Box<FlightState> leaked at submission.
    let state = unsafe { Box::from_raw(user_data as *mut FlightState) };

    let status = map_transfer_status(transfer.status, transfer.actual_length);
    state.shared.in_flight.lock().unwrap().remove(&state.token.0);
    // SAFETY: deregistered above; nothing else can reach the transfer.
    unsafe { libusb_free_transfer(transfer_ptr) };

    trace!(token = state.token.0, ?status, "transfer finished");
    let FlightState { token, direction, buffer, sink, .. } = *state;
    sink.on_complete(Completion { token, direction, status, buffer });
}

fn spawn_pump(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-pump".to_string())
        .spawn(move || {
            debug!("USB event pump started");
            while shared.running.load(Ordering::Acquire) {
                match shared.context.handle_events(Some(EVENT_SLICE)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => trace!("event handling interrupted"),
                    Err(e) => {
                        warn!("error handling USB events: {}", e);
                        std::thread::sleep(EVENT_SLICE);
                    }
                }
            }
            debug!("USB event pump stopped");
        })
        .expect("failed to spawn USB event pump")
}

fn map_transfer_status(status: c_int, actual_length: c_int) -> CompletionStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => CompletionStatus::Completed {
            actual: actual_length.max(0) as usize,
        },
        LIBUSB_TRANSFER_CANCELLED => CompletionStatus::Cancelled,
        LIBUSB_TRANSFER_TIMED_OUT => CompletionStatus::TimedOut,
        LIBUSB_TRANSFER_STALL => CompletionStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => CompletionStatus::Disconnected,
        _ => CompletionStatus::Error,
    }
}

fn map_submit_error(rc: c_int, endpoint: u8) -> EngineError {
    match rc {
        LIBUSB_ERROR_NO_DEVICE => EngineError::NoDevice,
        LIBUSB_ERROR_NO_MEM => EngineError::NoMem,
        LIBUSB_ERROR_INVALID_PARAM | LIBUSB_ERROR_NOT_SUPPORTED => EngineError::Rejected(endpoint),
        other => EngineError::Backend(format!("libusb error {}", other)),
    }
}

fn map_rusb(err: rusb::Error) -> EngineError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => EngineError::NoDevice,
        rusb::Error::NoMem => EngineError::NoMem,
        other => EngineError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_transfer_statuses() {
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_COMPLETED, 3),
            CompletionStatus::Completed { actual: 3 }
        );
        assert_eq!(map_transfer_status(LIBUSB_TRANSFER_CANCELLED, 0), CompletionStatus::Cancelled);
        assert_eq!(map_transfer_status(LIBUSB_TRANSFER_STALL, 0), CompletionStatus::Stall);
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_NO_DEVICE, -1),
            CompletionStatus::Disconnected
        );
        assert_eq!(map_transfer_status(LIBUSB_TRANSFER_ERROR, 0), CompletionStatus::Error);
    }

    #[test]
    fn maps_submit_errors() {
        assert!(matches!(map_submit_error(LIBUSB_ERROR_NO_DEVICE, 0x01), EngineError::NoDevice));
        assert!(matches!(map_submit_error(LIBUSB_ERROR_NO_MEM, 0x01), EngineError::NoMem));
        assert!(matches!(
            map_submit_error(LIBUSB_ERROR_INVALID_PARAM, 0x01),
            EngineError::Rejected(0x01)
        ));
    }
}
