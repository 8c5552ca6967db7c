//! Session behavior against the mock engine
//!
//! Covers the stream contract end to end: throttle bounds, partial
//! reads against a single fill, drain and reset lifecycle, disconnect
//! with transfers in flight, and interruption of blocked callers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stream::engine::{CompletionStatus, MockEngine, TransferEngine};
use stream::{DeviceSession, StreamError, WRITE_LIMIT};

const PACKET: usize = 8;

fn session_with(engine: &MockEngine) -> DeviceSession {
    let shared: Arc<dyn TransferEngine> = Arc::new(engine.clone());
    DeviceSession::probe(shared).expect("probe")
}

#[test]
fn probe_rejects_device_without_out_endpoint() {
    let engine = MockEngine::without_out_endpoint(PACKET);
    let shared: Arc<dyn TransferEngine> = Arc::new(engine);
    assert_eq!(
        DeviceSession::probe(shared).err(),
        Some(StreamError::DeviceGone)
    );
}

#[test]
fn zero_length_read_is_end_of_stream() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.read(&mut [], true), Ok(0));
    // no side effects: nothing was submitted
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn nonblocking_read_submits_then_would_block() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.in_flight_in());

    // still in flight: would block again, without a second submission
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert_eq!(engine.in_flight(), 1);
}

#[test]
fn sequential_partial_reads_drain_one_fill_in_order() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.complete_in(&[0xA0, 0xA1, 0xA2]));

    // bytes come back in order, one at a time
    assert_eq!(handle.read(&mut buf, true), Ok(1));
    assert_eq!(buf[0], 0xA0);
    assert!(!engine.in_flight_in());

    assert_eq!(handle.read(&mut buf, true), Ok(1));
    assert_eq!(buf[0], 0xA1);
    assert!(!engine.in_flight_in());

    // exactly one byte remains; asking for exactly one byte must not
    // start fresh I/O
    assert_eq!(handle.read(&mut buf, true), Ok(1));
    assert_eq!(buf[0], 0xA2);
    assert!(!engine.in_flight_in());

    // the buffer is drained now, so the next read starts a receive
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.in_flight_in());
}

#[test]
fn oversized_request_takes_what_is_there_and_restarts_io() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.complete_in(&[1, 2]));

    // two bytes available, eight wanted: deliver two and submit the
    // remainder opportunistically
    assert_eq!(handle.read(&mut buf, true), Ok(2));
    assert_eq!(&buf[..2], &[1, 2]);
    assert!(engine.in_flight_in());
}

#[test]
fn blocking_read_wakes_on_completion() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    // prime the standing receive
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));

    let reader = std::thread::spawn(move || {
        let mut buf = [0u8; 3];
        let n = handle.read(&mut buf, false)?;
        Ok::<_, StreamError>((n, buf))
    });

    std::thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());
    assert!(engine.complete_in(&[7, 8, 9]));

    let (n, buf) = reader.join().unwrap().unwrap();
    assert_eq!(n, 3);
    assert_eq!(buf, [7, 8, 9]);
}

#[test]
fn write_limit_bounds_in_flight_transfers() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    for i in 0..WRITE_LIMIT {
        assert_eq!(handle.write(&[0x90, i as u8, 56], true), Ok(3));
    }
    assert_eq!(engine.in_flight_out(), WRITE_LIMIT);

    // the (limit+1)th non-blocking write fails immediately
    assert_eq!(
        handle.write(&[0x90, 0, 0], true),
        Err(StreamError::WouldBlock)
    );

    // the blocking variant suspends until a slot frees
    let writer = {
        let handle = session.open().unwrap();
        std::thread::spawn(move || handle.write(&[0x90, 0x40, 12], false))
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());

    assert!(engine.complete_out());
    assert_eq!(writer.join().unwrap(), Ok(3));
    assert_eq!(engine.in_flight_out(), WRITE_LIMIT);
}

#[test]
fn write_payload_reaches_the_engine_unchanged() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.write(&[0x90, 0x29, 0x0C], true), Ok(3));
    assert_eq!(engine.peek_out().as_deref(), Some(&[0x90, 0x29, 0x0C][..]));

    assert_eq!(handle.write(&[], true), Ok(0));
    assert_eq!(engine.in_flight_out(), 1);
}

#[test]
fn failed_write_goes_sticky_and_reports_once() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.write(&[0x90, 0, 56], true), Ok(3));
    assert!(engine.fail_out(CompletionStatus::Error));

    match handle.write(&[0x90, 1, 56], true) {
        Err(StreamError::Transport(_)) => {}
        other => panic!("expected transport error, got {:?}", other),
    }
    // the slot taken by the failed attempt came back; a retry works
    assert_eq!(handle.write(&[0x90, 1, 56], true), Ok(3));
}

#[test]
fn failed_receive_goes_sticky_and_reports_once() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.fail_in(CompletionStatus::Error));

    match handle.read(&mut buf, true) {
        Err(StreamError::Transport(_)) => {}
        other => panic!("expected transport error, got {:?}", other),
    }
    // reported exactly once; the next read restarts I/O instead
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::WouldBlock));
    assert!(engine.in_flight_in());
}

#[test]
fn stall_surfaces_as_pipe_reset() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));
    assert!(engine.fail_in(CompletionStatus::Stall));
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::PipeReset));
}

#[test]
fn drain_with_nothing_outstanding_returns_immediately() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);

    let start = Instant::now();
    session.suspend();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(session.flush().is_ok());
}

#[test]
fn drain_cancels_the_standing_receive() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));
    assert!(engine.in_flight_in());

    session.suspend();
    assert_eq!(engine.in_flight(), 0);

    // cancellation is not a reportable error
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));
    assert!(engine.in_flight_in());
}

#[test]
fn reset_guard_marks_pipe_reset_once() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    let guard = session.pre_reset();
    drop(guard);

    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::PipeReset));
    // cleared after one report
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));
}

#[test]
fn disconnect_with_write_in_flight_releases_buffer_and_slot() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.write(&[0x90, 0, 56], true), Ok(3));
    assert_eq!(engine.in_flight_out(), 1);

    engine.set_gone();
    session.disconnect();

    // the write's completion path ran: no transfer left behind
    assert_eq!(engine.in_flight(), 0);
    assert!(!session.is_present());

    // every slot is free again, and the device is reported gone rather
    // than busy
    for _ in 0..WRITE_LIMIT {
        assert_eq!(handle.write(&[0x90, 0, 0], true), Err(StreamError::DeviceGone));
    }
    let mut buf = [0u8; 1];
    assert_eq!(handle.read(&mut buf, true), Err(StreamError::DeviceGone));
}

#[test]
fn disconnect_wakes_blocked_reader() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));

    let reader = std::thread::spawn(move || handle.read(&mut [0u8; 3], false));
    std::thread::sleep(Duration::from_millis(50));

    engine.set_gone();
    session.disconnect();

    assert_eq!(reader.join().unwrap(), Err(StreamError::DeviceGone));
}

#[test]
fn interrupt_surfaces_to_blocked_reader() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));

    let reader = std::thread::spawn(move || handle.read(&mut [0u8; 3], false));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());

    session.interrupt();
    assert_eq!(reader.join().unwrap(), Err(StreamError::Interrupted));

    // the standing receive survives an interrupt and still delivers
    assert!(engine.complete_in(&[5]));
    let handle = session.open().unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(handle.read(&mut buf, true), Ok(1));
    assert_eq!(buf[0], 5);
}

#[test]
fn poll_reports_readiness_and_starts_receives() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    // idle poll starts a receive; nothing readable yet
    let events = handle.poll();
    assert!(!events.readable);
    assert!(events.writable);
    assert!(engine.in_flight_in());

    assert!(engine.complete_in(&[1, 2]));
    let events = handle.poll();
    assert!(events.readable);
    // data pending: no extra submission
    assert!(!engine.in_flight_in());

    assert!(handle.wait_readable(Duration::from_millis(10)));
}

#[test]
fn open_count_drives_the_power_hold() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    assert_eq!(engine.power_holds(), 0);

    let first = session.open().unwrap();
    assert_eq!(engine.power_holds(), 1);
    let second = session.open().unwrap();
    assert_eq!(engine.power_holds(), 1);
    assert_eq!(session.open_count(), 2);

    drop(first);
    assert_eq!(engine.power_holds(), 1);
    drop(second);
    assert_eq!(engine.power_holds(), 0);
    assert_eq!(session.open_count(), 0);
}

#[test]
fn submission_failure_maps_out_of_memory() {
    let engine = MockEngine::new(PACKET);
    let session = session_with(&engine);
    let handle = session.open().unwrap();

    engine.set_reject_submits(true);
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::OutOfMemory));
    assert_eq!(handle.write(&[1, 2, 3], true), Err(StreamError::OutOfMemory));

    // nothing leaked: with submission restored both directions work
    engine.set_reject_submits(false);
    assert_eq!(handle.write(&[1, 2, 3], true), Ok(3));
    assert_eq!(handle.read(&mut [0u8; 1], true), Err(StreamError::WouldBlock));
}
