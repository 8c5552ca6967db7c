//! Deterministic in-process transfer engine
//!
//! Holds submitted transfers until the driving side completes, fails,
//! or cancels them, so every session interleaving can be exercised by
//! hand. Cancellation delivers its completion inline on the calling
//! thread; everything else completes on whichever thread drives the
//! engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    Completion, CompletionSink, CompletionStatus, Direction, EndpointInfo, EndpointKind,
    EngineError, SubmitResult, TransferEngine, TransferRequest, TransferToken,
};

/// Interrupt endpoint pair mirroring the hardware.
pub const MOCK_IN_EP: u8 = 0x81;
pub const MOCK_OUT_EP: u8 = 0x01;

struct Pending {
    token: TransferToken,
    direction: Direction,
    buffer: Vec<u8>,
    sink: Arc<dyn CompletionSink>,
}

struct Shared {
    endpoints: Vec<EndpointInfo>,
    pending: Mutex<VecDeque<Pending>>,
    next_token: AtomicU64,
    gone: AtomicBool,
    reject_submits: AtomicBool,
    power_holds: AtomicI64,
}

/// Scriptable engine backend. Clones share the same transfer state.
#[derive(Clone)]
pub struct MockEngine {
    shared: Arc<Shared>,
}

impl MockEngine {
    pub fn new(max_packet_size: usize) -> Self {
        let endpoints = vec![
            EndpointInfo {
                address: MOCK_IN_EP,
                direction: Direction::In,
                kind: EndpointKind::Interrupt,
                max_packet_size,
            },
            EndpointInfo {
                address: MOCK_OUT_EP,
                direction: Direction::Out,
                kind: EndpointKind::Interrupt,
                max_packet_size,
            },
        ];
        Self {
            shared: Arc::new(Shared {
                endpoints,
                pending: Mutex::new(VecDeque::new()),
                next_token: AtomicU64::new(1),
                gone: AtomicBool::new(false),
                reject_submits: AtomicBool::new(false),
                power_holds: AtomicI64::new(0),
            }),
        }
    }

    /// Engine with endpoints but no interrupt-OUT, for probe tests.
    pub fn without_out_endpoint(max_packet_size: usize) -> Self {
        let mut engine = Self::new(max_packet_size);
        Arc::get_mut(&mut engine.shared)
            .expect("fresh engine")
            .endpoints
            .retain(|ep| ep.direction == Direction::In);
        engine
    }

    /// Subsequent submissions are rejected as if the device unplugged.
    pub fn set_gone(&self) {
        self.shared.gone.store(true, Ordering::Release);
    }

    /// Subsequent submissions fail allocation.
    pub fn set_reject_submits(&self, reject: bool) {
        self.shared.reject_submits.store(reject, Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    pub fn in_flight_in(&self) -> bool {
        self.shared
            .pending
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.direction == Direction::In)
    }

    pub fn in_flight_out(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.direction == Direction::Out)
            .count()
    }

    /// Net power-hold count observed from open/close transitions.
    pub fn power_holds(&self) -> i64 {
        self.shared.power_holds.load(Ordering::Acquire)
    }

    /// Complete the standing receive with `data`. Returns false when no
    /// receive is pending.
    pub fn complete_in(&self, data: &[u8]) -> bool {
        self.finish(Direction::In, |pending| {
            let actual = data.len().min(pending.buffer.len());
            pending.buffer[..actual].copy_from_slice(&data[..actual]);
            CompletionStatus::Completed { actual }
        })
    }

    /// Fail the standing receive with an explicit status.
    pub fn fail_in(&self, status: CompletionStatus) -> bool {
        self.finish(Direction::In, |_| status)
    }

    /// Complete the oldest outbound transfer successfully.
    pub fn complete_out(&self) -> bool {
        self.finish(Direction::Out, |pending| CompletionStatus::Completed {
            actual: pending.buffer.len(),
        })
    }

    /// Fail the oldest outbound transfer with an explicit status.
    pub fn fail_out(&self, status: CompletionStatus) -> bool {
        self.finish(Direction::Out, |_| status)
    }

    /// Bytes of the oldest outbound transfer, for payload assertions.
    pub fn peek_out(&self) -> Option<Vec<u8>> {
        self.shared
            .pending
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.direction == Direction::Out)
            .map(|p| p.buffer.clone())
    }

    fn take(&self, direction: Direction) -> Option<Pending> {
        let mut pending = self.shared.pending.lock().unwrap();
        let index = pending.iter().position(|p| p.direction == direction)?;
        pending.remove(index)
    }

    fn finish(
        &self,
        direction: Direction,
        status: impl FnOnce(&mut Pending) -> CompletionStatus,
    ) -> bool {
        let Some(mut pending) = self.take(direction) else {
            return false;
        };
        let status = status(&mut pending);
        let Pending { token, direction, buffer, sink } = pending;
        // sink runs outside the pending lock
        sink.on_complete(Completion { token, direction, status, buffer });
        true
    }
}

impl TransferEngine for MockEngine {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>, EngineError> {
        Ok(self.shared.endpoints.clone())
    }

    fn submit(&self, request: TransferRequest, sink: Arc<dyn CompletionSink>) -> SubmitResult {
        if self.shared.gone.load(Ordering::Acquire) {
            return Err((request.buffer, EngineError::NoDevice));
        }
        if self.shared.reject_submits.load(Ordering::Acquire) {
            return Err((request.buffer, EngineError::NoMem));
        }
        let token = TransferToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.pending.lock().unwrap().push_back(Pending {
            token,
            direction: request.direction,
            buffer: request.buffer,
            sink,
        });
        Ok(token)
    }

    fn cancel(&self, token: TransferToken) {
        let pending = {
            let mut queue = self.shared.pending.lock().unwrap();
            let index = queue.iter().position(|p| p.token == token);
            index.and_then(|i| queue.remove(i))
        };
        if let Some(pending) = pending {
            let Pending { token, direction, buffer, sink } = pending;
            sink.on_complete(Completion {
                token,
                direction,
                status: CompletionStatus::Cancelled,
                buffer,
            });
        }
    }

    fn set_power_hold(&self, held: bool) {
        let delta = if held { 1 } else { -1 };
        self.shared.power_holds.fetch_add(delta, Ordering::AcqRel);
    }
}
