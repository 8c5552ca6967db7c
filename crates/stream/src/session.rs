//! Device session: stream surface and lifecycle machine
//!
//! One session per claimed device. Two lock domains keep completions
//! and callers apart: the fast lock (inbound state, write anchor) is
//! all a completion ever touches and is never held across a wait; the
//! I/O lock serializes the multi-step read/write orchestration and
//! teardown, and may be held across waits.
//!
//! Readers are serialized by the I/O lock and share the single
//! delivered buffer through the consumed offset. Writes are
//! independent transfers bounded by the throttle, serialized against
//! teardown only at submission time. The session object itself is
//! reference-counted through the engine's completion sinks, so it can
//! outlive physical disconnect while transfers or handles still hold
//! it; the device handle goes away exactly once, when the last
//! reference drops.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::engine::{
    Completion, CompletionSink, CompletionStatus, Direction, EndpointInfo, EndpointKind,
    EngineError, TransferEngine, TransferRequest, TransferToken,
};
use crate::error::StreamError;
use crate::inbound::{InboundState, Sticky};
use crate::throttle::WriteThrottle;

/// Upper bound on concurrently in-flight outbound transfers.
pub const WRITE_LIMIT: usize = 8;

/// Largest payload accepted per write call, chosen so transfer buffers
/// stay under a page with headroom for the largest high-speed packet.
pub const MAX_TRANSFER: usize = 4096 - 512;

/// Grace period a drain gives outstanding transfers before force-
/// cancelling them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Recheck slice for interruptible waits.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Outbound transfers that sit longer than this have gone wrong.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// The standing receive completes whenever the device talks.
const READ_TIMEOUT: Duration = Duration::ZERO;

/// Results of a non-blocking readiness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents {
    /// Delivered bytes are waiting in the inbound buffer.
    pub readable: bool,
    /// Always true; the throttle absorbs writers.
    pub writable: bool,
}

struct IoGuarded {
    /// False once the physical device is gone; checked before every
    /// submission.
    present: bool,
    /// Logical openers. The first takes the engine power hold, the
    /// last returns it.
    open_count: u32,
}

struct SessionInner {
    weak: Weak<SessionInner>,
    engine: Arc<dyn TransferEngine>,
    in_ep: EndpointInfo,
    out_ep: EndpointInfo,
    io: Mutex<IoGuarded>,
    inbound: Mutex<InboundState>,
    readable: Condvar,
    /// Anchor of outstanding outbound transfers, for drain/cancel.
    writes: Mutex<HashSet<TransferToken>>,
    writes_idle: Condvar,
    throttle: WriteThrottle,
    interrupt_epoch: AtomicU64,
}

/// A claimed grid device exposed as a byte stream.
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

/// One logical opener of the stream; dropping it is the close.
pub struct StreamHandle {
    inner: Arc<SessionInner>,
}

/// Holds the I/O lock through a bus reset. Dropping it is the
/// post-reset step: the pipe-reset marker goes sticky and the lock is
/// released.
pub struct ResetGuard<'a> {
    inner: &'a SessionInner,
    _io: MutexGuard<'a, IoGuarded>,
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        // drained, so nothing races this but the fast lock still
        // guards it
        self.inner.inbound.lock().unwrap().record_sticky(Sticky::PipeReset);
        debug!("post-reset: pipe-reset marker recorded");
    }
}

impl DeviceSession {
    /// Probe a claimed device: locate the interrupt endpoint pair and
    /// size the receive buffer from the IN endpoint. Failures unwind
    /// fully; no partial session is ever registered.
    pub fn probe(engine: Arc<dyn TransferEngine>) -> Result<Self, StreamError> {
        let endpoints = engine.endpoints().map_err(map_engine)?;
        let in_ep = endpoints
            .iter()
            .copied()
            .find(|ep| ep.kind == EndpointKind::Interrupt && ep.direction == Direction::In)
            .ok_or(StreamError::DeviceGone)?;
        let out_ep = endpoints
            .iter()
            .copied()
            .find(|ep| ep.kind == EndpointKind::Interrupt && ep.direction == Direction::Out)
            .ok_or(StreamError::DeviceGone)?;
        let capacity = in_ep.max_packet_size.min(4096);
        if capacity == 0 {
            return Err(StreamError::DeviceGone);
        }
        debug!(
            in_ep = in_ep.address,
            out_ep = out_ep.address,
            capacity,
            "probed grid device"
        );

        let inner = Arc::new_cyclic(|weak| SessionInner {
            weak: weak.clone(),
            engine,
            in_ep,
            out_ep,
            io: Mutex::new(IoGuarded { present: true, open_count: 0 }),
            inbound: Mutex::new(InboundState::new(capacity)),
            readable: Condvar::new(),
            writes: Mutex::new(HashSet::new()),
            writes_idle: Condvar::new(),
            throttle: WriteThrottle::new(WRITE_LIMIT),
            interrupt_epoch: AtomicU64::new(0),
        });
        Ok(Self { inner })
    }

    /// Open a logical stream over the session. The first open takes
    /// the engine's power hold.
    pub fn open(&self) -> Result<StreamHandle, StreamError> {
        let mut io = self.inner.io.lock().unwrap();
        if !io.present {
            return Err(StreamError::DeviceGone);
        }
        io.open_count += 1;
        if io.open_count == 1 {
            self.inner.engine.set_power_hold(true);
        }
        Ok(StreamHandle { inner: self.inner.clone() })
    }

    pub fn open_count(&self) -> u32 {
        self.inner.io.lock().unwrap().open_count
    }

    pub fn is_present(&self) -> bool {
        self.inner.io.lock().unwrap().present
    }

    /// Wait for in-flight I/O to settle and surface any pending sticky
    /// error, leaving subsequent opens a clean slate.
    pub fn flush(&self) -> Result<(), StreamError> {
        let mut io = self.inner.io.lock().unwrap();
        self.inner.drain_locked(&mut io);
        let sticky = self.inner.inbound.lock().unwrap().take_sticky();
        match sticky {
            Some(sticky) => Err(sticky.into_error()),
            None => Ok(()),
        }
    }

    /// Drain for power suspension; errors stay sticky for the next
    /// caller.
    pub fn suspend(&self) {
        let mut io = self.inner.io.lock().unwrap();
        self.inner.drain_locked(&mut io);
    }

    /// Drain with the I/O lock held for the duration of a bus reset.
    pub fn pre_reset(&self) -> ResetGuard<'_> {
        let mut io = self.inner.io.lock().unwrap();
        self.inner.drain_locked(&mut io);
        ResetGuard { inner: &self.inner, _io: io }
    }

    /// The physical device is gone: cancel everything outstanding (the
    /// completion paths wake any blocked reader), refuse new
    /// submissions, and drain. Handles stay valid and keep failing
    /// with `DeviceGone`.
    ///
    /// Call this once the engine itself is refusing submissions (the
    /// hardware left the bus); a woken reader otherwise restarts its
    /// receive before the present flag can be cleared.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Wake every blocked reader and writer; their calls surface
    /// `Interrupted` and can be retried.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }
}

impl StreamHandle {
    /// Read up to `out.len()` bytes from the device stream.
    pub fn read(&self, out: &mut [u8], nonblocking: bool) -> Result<usize, StreamError> {
        self.inner.read(out, nonblocking)
    }

    /// Write up to [`MAX_TRANSFER`] bytes; callers loop for more.
    /// Returns the number of bytes accepted for transfer, not
    /// necessarily acknowledged by hardware yet.
    pub fn write(&self, data: &[u8], nonblocking: bool) -> Result<usize, StreamError> {
        self.inner.write(data, nonblocking)
    }

    /// Readiness query. Starts a receive opportunistically when none
    /// is standing and no data is buffered.
    pub fn poll(&self) -> PollEvents {
        self.inner.poll()
    }

    /// Block until data is readable or the timeout elapses.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        self.inner.wait_readable(timeout)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let mut io = self.inner.io.lock().unwrap();
        io.open_count = io.open_count.saturating_sub(1);
        if io.open_count == 0 {
            self.inner.engine.set_power_hold(false);
        }
    }
}

impl SessionInner {
    fn sink(&self) -> Arc<dyn CompletionSink> {
        let strong: Arc<SessionInner> = self.weak.upgrade().expect("session inner alive");
        strong
    }

    fn epoch(&self) -> u64 {
        self.interrupt_epoch.load(Ordering::Acquire)
    }

    fn interrupted_since(&self, epoch: u64) -> bool {
        self.interrupt_epoch.load(Ordering::Acquire) != epoch
    }

    fn interrupt(&self) {
        self.interrupt_epoch.fetch_add(1, Ordering::AcqRel);
        self.readable.notify_all();
        self.writes_idle.notify_all();
        self.throttle.wake_all();
    }

    fn read(&self, out: &mut [u8], nonblocking: bool) -> Result<usize, StreamError> {
        if out.is_empty() {
            // end-of-stream semantics, not an error
            return Ok(0);
        }
        let epoch = self.epoch();
        let io = self.io.lock().unwrap();
        if !io.present {
            return Err(StreamError::DeviceGone);
        }

        loop {
            let mut st = self.inbound.lock().unwrap();

            if st.in_flight || st.unclaimed {
                if st.in_flight {
                    if nonblocking {
                        return Err(StreamError::WouldBlock);
                    }
                    // the device may stay silent indefinitely
                    while st.in_flight {
                        let (guard, _) = self.readable.wait_timeout(st, WAIT_SLICE).unwrap();
                        st = guard;
                        if self.interrupted_since(epoch) {
                            return Err(StreamError::Interrupted);
                        }
                    }
                }
                // this caller has observed the completion
                st.unclaimed = false;
            }

            // errors outrank data
            if let Some(sticky) = st.take_sticky() {
                st.discard_window();
                return Err(sticky.into_error());
            }

            if st.has_data() {
                let available = st.available();
                let n = st.copy_out(out);
                let wants_more = available < out.len();
                drop(st);
                trace!(n, available, "read satisfied from buffer");
                if wants_more {
                    // start the next receive without waiting on it
                    if let Err(e) = self.submit_read(&io) {
                        warn!("opportunistic receive submission failed: {}", e);
                    }
                }
                return Ok(n);
            }

            // buffer fully drained: fresh I/O is needed
            drop(st);
            self.submit_read(&io)?;
            if nonblocking {
                return Err(StreamError::WouldBlock);
            }
        }
    }

    /// Submit a receive transfer if none is standing. Idempotent: a
    /// standing transfer makes this a no-op, which closes the window
    /// where an opportunistic submission could race a completion.
    fn submit_read(&self, io: &IoGuarded) -> Result<(), StreamError> {
        if !io.present {
            return Err(StreamError::DeviceGone);
        }
        let buffer = {
            let mut st = self.inbound.lock().unwrap();
            match st.begin_receive() {
                Some(buffer) => buffer,
                None => return Ok(()),
            }
        };
        let request = TransferRequest {
            direction: Direction::In,
            endpoint: self.in_ep.address,
            buffer,
            timeout: READ_TIMEOUT,
        };
        match self.engine.submit(request, self.sink()) {
            Ok(token) => {
                let mut st = self.inbound.lock().unwrap();
                if st.in_flight {
                    st.token = Some(token);
                }
                trace!(token = token.0, "receive transfer submitted");
                Ok(())
            }
            Err((buffer, err)) => {
                self.inbound.lock().unwrap().abort_receive(buffer);
                warn!("receive submission failed: {}", err);
                Err(map_engine(err))
            }
        }
    }

    fn write(&self, data: &[u8], nonblocking: bool) -> Result<usize, StreamError> {
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len().min(MAX_TRANSFER);
        let epoch = self.epoch();

        self.throttle.acquire(nonblocking, &|| self.interrupted_since(epoch))?;

        if let Some(sticky) = self.inbound.lock().unwrap().take_sticky() {
            self.throttle.release();
            return Err(sticky.into_error());
        }

        // the copy is the ownership handoff into the transfer
        let buffer = data[..len].to_vec();

        let io = self.io.lock().unwrap();
        if !io.present {
            self.throttle.release();
            return Err(StreamError::DeviceGone);
        }
        // hold the anchor across submission so the completion path
        // cannot observe an unregistered token
        let mut writes = self.writes.lock().unwrap();
        let request = TransferRequest {
            direction: Direction::Out,
            endpoint: self.out_ep.address,
            buffer,
            timeout: WRITE_TIMEOUT,
        };
        match self.engine.submit(request, self.sink()) {
            Ok(token) => {
                writes.insert(token);
                trace!(token = token.0, len, "write transfer submitted");
                Ok(len)
            }
            Err((_, err)) => {
                drop(writes);
                drop(io);
                self.throttle.release();
                warn!("write submission failed: {}", err);
                Err(map_engine(err))
            }
        }
    }

    fn poll(&self) -> PollEvents {
        let io = self.io.lock().unwrap();
        let idle = {
            let st = self.inbound.lock().unwrap();
            !st.in_flight && !st.has_data()
        };
        if idle && io.present {
            if let Err(e) = self.submit_read(&io) {
                debug!("poll could not start a receive: {}", e);
            }
        }
        let readable = self.inbound.lock().unwrap().has_data();
        PollEvents { readable, writable: true }
    }

    fn wait_readable(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inbound.lock().unwrap();
        loop {
            if st.has_data() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let (guard, _) = self.readable.wait_timeout(st, slice).unwrap();
            st = guard;
        }
    }

    /// Draw down all outstanding I/O. The caller holds the I/O lock,
    /// whether for a reset (kept held afterwards) or a flush/suspend
    /// (released on return). A no-op when nothing is outstanding.
    fn drain_locked(&self, _io: &mut IoGuarded) {
        if !self.wait_writes_idle(Instant::now() + DRAIN_TIMEOUT) {
            let tokens: Vec<TransferToken> =
                self.writes.lock().unwrap().iter().copied().collect();
            debug!(count = tokens.len(), "drain timeout: force-cancelling writes");
            for token in tokens {
                self.engine.cancel(token);
            }
            // cancelled transfers still run their completion path
            if !self.wait_writes_idle(Instant::now() + DRAIN_TIMEOUT) {
                warn!("write transfers survived forced cancellation");
            }
        }

        // the standing receive is cancelled explicitly
        let token = self.inbound.lock().unwrap().token;
        if let Some(token) = token {
            self.engine.cancel(token);
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut st = self.inbound.lock().unwrap();
        while st.in_flight {
            let now = Instant::now();
            if now >= deadline {
                warn!("receive transfer did not complete during drain");
                break;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let (guard, _) = self.readable.wait_timeout(st, slice).unwrap();
            st = guard;
        }
    }

    fn wait_writes_idle(&self, deadline: Instant) -> bool {
        let mut writes = self.writes.lock().unwrap();
        loop {
            if writes.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let (guard, _) = self.writes_idle.wait_timeout(writes, slice).unwrap();
            writes = guard;
        }
    }

    fn disconnect(&self) {
        debug!("device disconnect: cancelling outstanding transfers");
        // cancel before taking the I/O lock: the completion paths wake
        // any reader blocked while holding it, letting it reach an
        // exit path
        let tokens: Vec<TransferToken> = self.writes.lock().unwrap().iter().copied().collect();
        for token in tokens {
            self.engine.cancel(token);
        }
        let read_token = self.inbound.lock().unwrap().token;
        if let Some(token) = read_token {
            self.engine.cancel(token);
        }

        let mut io = self.io.lock().unwrap();
        io.present = false;
        self.drain_locked(&mut io);
        drop(io);
        debug!("session detached from hardware");
    }
}

impl CompletionSink for SessionInner {
    fn on_complete(&self, completion: Completion) {
        match completion.direction {
            Direction::In => {
                if !completion.status.is_benign()
                    && !matches!(completion.status, CompletionStatus::Completed { .. })
                {
                    warn!(status = ?completion.status, "receive completed with unexpected status");
                }
                {
                    let mut st = self.inbound.lock().unwrap();
                    st.complete(completion.status, completion.buffer);
                }
                // buffer state is settled before anyone wakes
                self.readable.notify_all();
            }
            Direction::Out => {
                match completion.status {
                    CompletionStatus::Completed { .. } => {}
                    status if status.is_benign() => {}
                    CompletionStatus::Stall => {
                        self.inbound.lock().unwrap().record_sticky(Sticky::PipeReset);
                    }
                    status => {
                        warn!(?status, "write completed with unexpected status");
                        self.inbound.lock().unwrap().record_sticky(Sticky::Transport);
                    }
                }
                let empty = {
                    let mut writes = self.writes.lock().unwrap();
                    writes.remove(&completion.token);
                    writes.is_empty()
                };
                if empty {
                    self.writes_idle.notify_all();
                }
                self.throttle.release();
                // completion.buffer drops here, releasing the copy
            }
        }
    }
}

fn map_engine(err: EngineError) -> StreamError {
    match err {
        EngineError::NoMem => StreamError::OutOfMemory,
        EngineError::NoDevice => StreamError::DeviceGone,
        EngineError::Rejected(_) | EngineError::Backend(_) => {
            StreamError::Transport(err.to_string())
        }
    }
}
