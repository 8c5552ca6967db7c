//! Outbound write throttle
//!
//! A fixed pool of permits bounding how many outbound transfers may be
//! in flight at once. Completion paths return permits; blocked writers
//! wait on the condvar in slices so an interrupt is never missed for
//! long.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::StreamError;

const WAIT_SLICE: Duration = Duration::from_millis(100);

pub(crate) struct WriteThrottle {
    limit: usize,
    free: Mutex<usize>,
    freed: Condvar,
}

impl WriteThrottle {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            free: Mutex::new(limit),
            freed: Condvar::new(),
        }
    }

    /// Take one permit. Non-blocking callers fail with `WouldBlock`
    /// when the pool is empty; blocking callers wait until a
    /// completion frees a slot or `interrupted` reports true.
    pub(crate) fn acquire(
        &self,
        nonblocking: bool,
        interrupted: &dyn Fn() -> bool,
    ) -> Result<(), StreamError> {
        let mut free = self.free.lock().unwrap();
        loop {
            if *free > 0 {
                *free -= 1;
                return Ok(());
            }
            if nonblocking {
                return Err(StreamError::WouldBlock);
            }
            let (guard, _) = self.freed.wait_timeout(free, WAIT_SLICE).unwrap();
            free = guard;
            if interrupted() {
                return Err(StreamError::Interrupted);
            }
        }
    }

    /// Return one permit; runs on the completion path for every
    /// outbound transfer, cancelled or not.
    pub(crate) fn release(&self) {
        let mut free = self.free.lock().unwrap();
        *free = (*free + 1).min(self.limit);
        drop(free);
        self.freed.notify_one();
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.limit - *self.free.lock().unwrap()
    }

    /// Nudge blocked writers so they observe an interrupt promptly.
    pub(crate) fn wake_all(&self) {
        self.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const NEVER: fn() -> bool = || false;

    #[test]
    fn bounds_in_flight_writes() {
        let throttle = WriteThrottle::new(2);
        throttle.acquire(true, &NEVER).unwrap();
        throttle.acquire(true, &NEVER).unwrap();
        assert_eq!(throttle.in_flight(), 2);

        assert_eq!(throttle.acquire(true, &NEVER), Err(StreamError::WouldBlock));

        throttle.release();
        throttle.acquire(true, &NEVER).unwrap();
        assert_eq!(throttle.in_flight(), 2);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let throttle = Arc::new(WriteThrottle::new(1));
        throttle.acquire(true, &NEVER).unwrap();

        let waiter = {
            let throttle = throttle.clone();
            std::thread::spawn(move || throttle.acquire(false, &NEVER))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        throttle.release();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn interrupt_unblocks_waiter() {
        let throttle = Arc::new(WriteThrottle::new(1));
        throttle.acquire(true, &NEVER).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let waiter = {
            let throttle = throttle.clone();
            let stop = stop.clone();
            std::thread::spawn(move || throttle.acquire(false, &|| stop.load(Ordering::Acquire)))
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        throttle.wake_all();
        assert_eq!(waiter.join().unwrap(), Err(StreamError::Interrupted));
    }
}
