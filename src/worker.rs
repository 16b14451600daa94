//! Background playback worker for continuous frame output.
//!
//! [`PlaybackWorker`] decouples frame producers from the USB link. Any thread
//! may call [`PlaybackWorker::submit_frame()`]; frames are encoded on the
//! caller's thread and pushed into a bounded queue. A single worker thread
//! pops one frame at a time, writes it to the DAC and polls the device status
//! until the frame has been drawn, so the laser's draw rate paces output.
//!
//! When the queue is full, `submit_frame` blocks. A
//! [`WriteFrameFlags::DONT_BLOCK`] frame is only accepted when nothing is
//! queued or being drawn, otherwise it fails with [`Error::FrameNotReady`].
//! Frames are never dropped once accepted, except that closing the session
//! discards whatever is still queued.

use crossbeam::channel::{bounded, select, Receiver, SendTimeoutError, Sender};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::dac::{DeviceSession, SessionState};
use crate::error::{Error, Result};
use crate::frame::{encode, EncodedFrame, Frame, WriteFrameFlags};
use crate::transport::Transport;
use crate::types::Point;

/// Number of encoded frames that may wait for the device.
pub const QUEUE_CAPACITY: usize = 20;

/// How often an idle worker or a blocked producer re-checks whether the
/// session was closed.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Bounded frame queue feeding a dedicated playback thread.
///
/// The worker is created in two phases so producers can fill the queue
/// before output starts:
/// 1. [`new()`](Self::new) - creates the queue, no thread yet
/// 2. [`start()`](Self::start) - starts the playback thread
///
/// [`spawn()`](Self::spawn) does both.
pub struct PlaybackWorker<T: Transport> {
    session: Arc<DeviceSession<T>>,
    frame_tx: Sender<EncodedFrame>,
    /// Receiver held until start() is called.
    frame_rx: Mutex<Option<Receiver<EncodedFrame>>>,
    /// Dropped to tell the playback thread to exit.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Frames accepted but not yet drawn, including the one in flight.
    pending: Arc<AtomicUsize>,
    frames_written: Arc<AtomicU64>,
}

impl<T: Transport> PlaybackWorker<T> {
    /// Create an idle worker with the default queue capacity.
    pub fn new(session: Arc<DeviceSession<T>>) -> Self {
        Self::with_capacity(session, QUEUE_CAPACITY)
    }

    /// Create an idle worker with a custom queue capacity (at least 1).
    pub fn with_capacity(session: Arc<DeviceSession<T>>, capacity: usize) -> Self {
        let (frame_tx, frame_rx) = bounded(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(0);

        PlaybackWorker {
            session,
            frame_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            handle: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a worker and start its playback thread.
    pub fn spawn(session: Arc<DeviceSession<T>>) -> Self {
        let worker = Self::new(session);
        worker.start();
        worker
    }

    /// Start the playback thread. Calling it again, or after
    /// [`close()`](Self::close), has no effect.
    pub fn start(&self) {
        let Some(frames) = lock(&self.frame_rx).take() else {
            return;
        };

        let session = Arc::clone(&self.session);
        let shutdown = self.shutdown_rx.clone();
        let pending = Arc::clone(&self.pending);
        let frames_written = Arc::clone(&self.frames_written);

        let handle = thread::Builder::new()
            .name("helios-playback".into())
            .spawn(move || {
                Self::playback_loop(session, frames, shutdown, pending, frames_written)
            });

        match handle {
            Ok(handle) => *lock(&self.handle) = Some(handle),
            Err(e) => {
                warn!("Helios: failed to spawn playback thread: {}", e);
                self.session.close();
            }
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession<T>> {
        &self.session
    }

    /// Encode a frame and queue it for playback.
    ///
    /// Blocks while the queue is full. If `flags` contains
    /// [`WriteFrameFlags::DONT_BLOCK`], returns [`Error::FrameNotReady`]
    /// instead whenever a previous frame is still queued or being drawn.
    /// A closed session fails with [`Error::DeviceClosed`], including while
    /// blocked on a full queue.
    pub fn submit_frame(&self, points: &[Point], pps: u32, flags: WriteFrameFlags) -> Result<()> {
        match self.session.state() {
            SessionState::Open => {}
            SessionState::Uninitialized => return Err(Error::NotInitialized),
            SessionState::Closed => return Err(Error::DeviceClosed),
        }

        let frame = encode(points, pps, flags)?;

        if flags.contains(WriteFrameFlags::DONT_BLOCK) {
            // Claim the idle slot; the queue is empty and nothing is in flight
            if self
                .pending
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::FrameNotReady);
            }
        } else {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        let result = self.enqueue(frame);
        if result.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Push onto the queue, waiting for a free slot until the session closes.
    fn enqueue(&self, mut frame: EncodedFrame) -> Result<()> {
        loop {
            match self.frame_tx.send_timeout(frame, IDLE_CHECK_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(unsent)) => {
                    if !self.session.is_open() {
                        return Err(Error::DeviceClosed);
                    }
                    frame = unsent;
                }
                // The playback thread has exited or the worker was closed
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::DeviceClosed),
            }
        }
    }

    /// Queue a [`Frame`] for playback.
    pub fn submit(&self, frame: &Frame) -> Result<()> {
        self.submit_frame(&frame.points, frame.pps, frame.flags)
    }

    /// Number of frames waiting in the queue.
    pub fn queued_frames(&self) -> usize {
        self.frame_tx.len()
    }

    /// Number of frames accepted but not yet drawn, including the one in
    /// flight.
    pub fn pending_frames(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of frames the device has finished drawing.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Checks if the playback thread is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.handle).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Close the session and stop the playback thread.
    ///
    /// Queued frames are discarded and blocked producers return
    /// [`Error::DeviceClosed`]. Waits for the frame in flight, if any.
    pub fn close(&self) {
        self.session.close();
        lock(&self.shutdown_tx).take();
        lock(&self.frame_rx).take();

        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn playback_loop(
        session: Arc<DeviceSession<T>>,
        frames: Receiver<EncodedFrame>,
        shutdown: Receiver<()>,
        pending: Arc<AtomicUsize>,
        frames_written: Arc<AtomicU64>,
    ) {
        debug!("Helios: playback thread started");

        while session.is_open() {
            select! {
                recv(frames) -> frame => {
                    let Ok(frame) = frame else { break };
                    let played = Self::play(&session, &frame);
                    pending.fetch_sub(1, Ordering::AcqRel);
                    match played {
                        Ok(()) => {
                            frames_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(Error::DeviceClosed) => break,
                        Err(e) => {
                            warn!("Helios: playback failed, closing session: {}", e);
                            session.close();
                            break;
                        }
                    }
                }
                recv(shutdown) -> _ => break,
                default(IDLE_CHECK_INTERVAL) => {}
            }
        }

        debug!(
            "Helios: playback thread exiting ({} queued frames discarded)",
            frames.len()
        );
    }

    /// Write one frame, then wait until the device has drawn it.
    fn play(session: &DeviceSession<T>, frame: &EncodedFrame) -> Result<()> {
        session.write_frame(frame)?;
        Self::wait_until_ready(session)
    }

    fn wait_until_ready(session: &DeviceSession<T>) -> Result<()> {
        let config = session.config();
        let started = Instant::now();
        let mut polls = 0u64;

        loop {
            // status() fails with DeviceClosed once the session is closed
            if session.status()?.is_ready() {
                trace!("Helios: device ready after {} polls", polls);
                return Ok(());
            }
            polls += 1;

            if let Some(timeout) = config.status_timeout {
                if started.elapsed() >= timeout {
                    return Err(Error::StatusTimeout(timeout));
                }
            }
            if !config.status_poll_interval.is_zero() {
                thread::sleep(config.status_poll_interval);
            }
        }
    }
}

impl<T: Transport> Drop for PlaybackWorker<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockTransport;
    use crate::types::SessionConfig;
    use std::sync::atomic::AtomicBool;

    const WAIT: Duration = Duration::from_secs(5);

    fn open_session(mock: &MockTransport) -> Arc<DeviceSession<MockTransport>> {
        let config = SessionConfig::default().with_status_poll_interval(Duration::from_micros(50));
        let session = Arc::new(DeviceSession::new(mock.clone(), config));
        session.open().unwrap();
        session
    }

    fn square() -> Vec<Point> {
        vec![
            Point::new(-5, 5),
            Point::new(5, 5),
            Point::new(5, -5),
            Point::new(-5, -5),
        ]
    }

    #[test]
    fn test_frames_are_written_in_order() {
        let mock = MockTransport::new();
        let worker = PlaybackWorker::spawn(open_session(&mock));

        for pps in [1000, 2000, 3000] {
            worker
                .submit_frame(&square(), pps, WriteFrameFlags::empty())
                .unwrap();
        }
        assert!(mock.wait_for(WAIT, |s| s.bulk_writes.len() == 3));

        let written: Vec<u16> = mock
            .bulk_writes()
            .iter()
            .map(|b| u16::from_le_bytes([b[28], b[29]]))
            .collect();
        assert_eq!(written, vec![1000, 2000, 3000]);
        assert!(mock.wait_for(WAIT, |_| worker.frames_written() == 3));
    }

    #[test]
    fn test_each_frame_waits_for_ready() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.ready = false);
        let worker = PlaybackWorker::spawn(open_session(&mock));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();

        assert!(mock.wait_for(WAIT, |s| s.status_polls >= 5));
        // Second frame is held back until the first is drawn
        assert_eq!(mock.bulk_writes().len(), 1);

        mock.with_state(|s| s.ready = true);
        assert!(mock.wait_for(WAIT, |s| s.bulk_writes.len() == 2));
    }

    #[test]
    fn test_full_queue_blocks_until_slot_frees() {
        let mock = MockTransport::new();
        let worker = Arc::new(PlaybackWorker::new(open_session(&mock)));

        for _ in 0..QUEUE_CAPACITY {
            worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        }
        assert_eq!(worker.queued_frames(), QUEUE_CAPACITY);

        let submitted = Arc::new(AtomicBool::new(false));
        let producer = {
            let worker = Arc::clone(&worker);
            let submitted = Arc::clone(&submitted);
            thread::spawn(move || {
                let result = worker.submit_frame(&square(), 1000, WriteFrameFlags::empty());
                submitted.store(true, Ordering::SeqCst);
                result
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!submitted.load(Ordering::SeqCst));

        worker.start();
        producer.join().unwrap().unwrap();
        assert!(submitted.load(Ordering::SeqCst));

        assert!(mock.wait_for(WAIT, |s| s.bulk_writes.len() == QUEUE_CAPACITY + 1));
    }

    #[test]
    fn test_dont_block_while_frame_queued() {
        let mock = MockTransport::new();
        let worker = PlaybackWorker::new(open_session(&mock));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK).unwrap();
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK),
            Err(Error::FrameNotReady)
        ));
        assert_eq!(worker.queued_frames(), 1);
        assert_eq!(worker.pending_frames(), 1);

        // Blocking submits are still queued behind it
        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        assert_eq!(worker.queued_frames(), 2);
    }

    #[test]
    fn test_dont_block_while_frame_in_flight() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.ready = false);
        let worker = PlaybackWorker::spawn(open_session(&mock));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK).unwrap();
        assert!(mock.wait_for(WAIT, |s| s.status_polls >= 2));
        assert_eq!(worker.queued_frames(), 0);
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK),
            Err(Error::FrameNotReady)
        ));

        // Accepted again once the device has drawn the frame
        mock.with_state(|s| s.ready = true);
        assert!(mock.wait_for(WAIT, |_| worker.pending_frames() == 0));
        worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK).unwrap();
        assert!(mock.wait_for(WAIT, |s| s.bulk_writes.len() == 2));
    }

    #[test]
    fn test_dont_block_on_full_queue() {
        let mock = MockTransport::new();
        let worker = PlaybackWorker::with_capacity(open_session(&mock), 1);

        worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK).unwrap();
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::DONT_BLOCK),
            Err(Error::FrameNotReady)
        ));
    }

    #[test]
    fn test_encoder_errors_are_returned_to_caller() {
        let mock = MockTransport::new();
        let worker = PlaybackWorker::spawn(open_session(&mock));

        assert!(matches!(
            worker.submit_frame(&square(), 3, WriteFrameFlags::empty()),
            Err(Error::PpsTooLow(3))
        ));
        assert!(matches!(
            worker.submit_frame(&[], 1000, WriteFrameFlags::empty()),
            Err(Error::NullPoints)
        ));
        assert_eq!(worker.queued_frames(), 0);
        assert!(worker.is_running());
    }

    #[test]
    fn test_submit_before_open() {
        let mock = MockTransport::new();
        let session = Arc::new(DeviceSession::new(mock, SessionConfig::default()));
        let worker = PlaybackWorker::new(session);
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_close_during_status_poll() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.ready = false);
        let session = open_session(&mock);
        let worker = PlaybackWorker::spawn(Arc::clone(&session));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        assert!(mock.wait_for(WAIT, |s| s.status_polls >= 3));

        session.close();
        assert!(mock.wait_for(WAIT, |_| !worker.is_running()));

        let started = Instant::now();
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()),
            Err(Error::DeviceClosed)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        // No more polling once closed
        let polls = mock.status_polls();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mock.status_polls(), polls);
    }

    #[test]
    fn test_close_unblocks_waiting_producer() {
        let mock = MockTransport::new();
        let worker = Arc::new(PlaybackWorker::with_capacity(open_session(&mock), 1));
        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();

        let producer = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()))
        };
        thread::sleep(Duration::from_millis(50));

        worker.close();
        assert!(matches!(producer.join().unwrap(), Err(Error::DeviceClosed)));
        assert!(mock.bulk_writes().is_empty());
    }

    #[test]
    fn test_session_close_unblocks_producer_before_start() {
        let mock = MockTransport::new();
        let session = open_session(&mock);
        let worker = Arc::new(PlaybackWorker::with_capacity(Arc::clone(&session), 1));
        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();

        let producer = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        // Close through the session only; the worker is never started
        session.close();
        assert!(mock.wait_for(WAIT, |_| producer.is_finished()));
        assert!(matches!(producer.join().unwrap(), Err(Error::DeviceClosed)));
        assert_eq!(worker.pending_frames(), 1);
        assert!(mock.bulk_writes().is_empty());
    }

    #[test]
    fn test_transport_failure_stops_playback() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.fail_bulk = Some(rusb::Error::NoDevice));
        let session = open_session(&mock);
        let worker = PlaybackWorker::spawn(Arc::clone(&session));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        assert!(mock.wait_for(WAIT, |_| !worker.is_running()));
        assert!(session.is_closed());
        assert!(matches!(
            worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()),
            Err(Error::DeviceClosed)
        ));
    }

    #[test]
    fn test_status_timeout_closes_session() {
        let mock = MockTransport::new();
        mock.with_state(|s| s.ready = false);
        let config = SessionConfig::default().with_status_timeout(Duration::from_millis(20));
        let session = Arc::new(DeviceSession::new(mock.clone(), config));
        session.open().unwrap();
        let worker = PlaybackWorker::spawn(Arc::clone(&session));

        worker.submit_frame(&square(), 1000, WriteFrameFlags::empty()).unwrap();
        assert!(mock.wait_for(WAIT, |_| session.is_closed()));
        assert!(mock.wait_for(WAIT, |_| !worker.is_running()));
        assert_eq!(worker.frames_written(), 0);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let mock = MockTransport::new();
        let worker = PlaybackWorker::new(open_session(&mock));
        worker.start();
        worker.start();
        assert!(worker.is_running());
        worker.close();
        assert!(!worker.is_running());
    }
}
