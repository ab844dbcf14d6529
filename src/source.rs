//! The frame-source orchestrator.
//!
//! [`FrameSource`] wraps one [`AcquisitionBackend`] and owns everything that is
//! common to all of them: the "next" versus "latest" buffering policy, the single
//! outstanding-peek slot, stream stop/resume/restart, canonical color conversion,
//! the crop/scale stage and the optional delivery thread.
//!
//! Blocking waits are cut into short dequeue slices so that stream state changes
//! and delivery-thread cancellation take effect at the next slice boundary.

use crate::backend::{AcquisitionBackend, DequeuePolicy, RawFormat, Slot};
use crate::crop_scale::{CropRect, CropScaler};
use crate::delivery::{DeliveryThread, Delivered};
use crate::error::{FrameError, Result};
use crate::frame::{convert_to_canonical, ColorMode, FrameBuffer, RawFrame};
use crate::utils::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest a single blocking dequeue runs before state and cancellation are rechecked.
const DEQUEUE_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Running,
}

/// Counters describing what a source has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Frames handed to the consumer by get calls
    pub delivered: u64,
    /// Backlog frames discarded by latest-frame requests
    pub purged: u64,
    /// Stale peeks released on the caller's behalf
    pub auto_unpeeks: u64,
    pub dequeue_failures: u64,
}

/// Post-conversion options applied by a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceOptions {
    pub mode: ColorMode,
    pub crop: CropRect,
    pub scale: f64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            mode: ColorMode::Color,
            crop: CropRect::NONE,
            scale: 1.0,
        }
    }
}

/// Stream state flag plus the condition variable get calls park on while Stopped.
struct StreamSignal {
    state: Mutex<StreamState>,
    changed: Condvar,
}

impl StreamSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Running),
            changed: Condvar::new(),
        }
    }

    fn get(&self) -> StreamState {
        *lock(&self.state)
    }

    fn set(&self, state: StreamState) {
        *lock(&self.state) = state;
        self.changed.notify_all();
    }

    /// Blocks while Stopped. Fails with `Cancelled` once `cancel` is raised.
    fn wait_running(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        let mut state = lock(&self.state);
        loop {
            if is_cancelled(cancel) {
                return Err(FrameError::Cancelled);
            }
            if *state == StreamState::Running {
                return Ok(());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wakes every waiter so it can observe a raised cancel flag.
    fn wake(&self) {
        let _state = lock(&self.state);
        self.changed.notify_all();
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::Acquire))
}

/// Everything touched by the thread inside a get call.
///
/// Field order matters: the backend is dropped before the crop/scale scratch buffer.
pub(crate) struct Core {
    backend: Box<dyn AcquisitionBackend>,
    peeked: Option<Peek>,
    /// Id handed to the most recent peek
    peek_seq: u64,
    scaler: CropScaler,
    stats: SourceStats,
}

/// The outstanding peeked slot and the id of the [`PeekedFrame`] that owns it.
struct Peek {
    id: u64,
    slot: Slot,
}

impl Core {
    /// Hands a slot back to the backend. Failures are logged, the slot is gone either way.
    fn release(&mut self, slot: Slot) {
        if let Err(e) = self.backend.enqueue(slot) {
            warn!("Could not give a frame back to the backend: {}", e);
        }
    }

    /// Releases the outstanding peek, if any.
    fn release_peek(&mut self) -> bool {
        match self.peeked.take() {
            Some(peek) => {
                self.release(peek.slot);
                true
            }
            None => false,
        }
    }

    fn dequeue_next(&mut self) -> Result<Option<Slot>> {
        self.backend.dequeue(DequeuePolicy::Wait(DEQUEUE_SLICE))
    }

    /// Poll first; with nothing queued wait for the next frame, otherwise drain the
    /// backlog, re-enqueueing each discarded frame at once, and keep the newest.
    fn dequeue_latest(&mut self) -> Result<Option<Slot>> {
        let Some(mut newest) = self.backend.dequeue(DequeuePolicy::Poll)? else {
            return self.dequeue_next();
        };

        let mut purged = 0;
        loop {
            match self.backend.dequeue(DequeuePolicy::Poll) {
                Ok(Some(slot)) => {
                    let stale = std::mem::replace(&mut newest, slot);
                    self.release(stale);
                    purged += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.release(newest);
                    self.stats.purged += purged;
                    return Err(e);
                }
            }
        }
        if purged > 0 {
            debug!("Purged {} stale frames", purged);
        }
        self.stats.purged += purged;
        Ok(Some(newest))
    }

    /// raw → canonical → crop/scale → `buffer`
    fn convert_into(&mut self, slot: &Slot, mode: ColorMode, buffer: &mut FrameBuffer) -> Result<()> {
        let raw = self.backend.raw_frame(slot);
        match self.scaler.take_scratch() {
            None => convert_to_canonical(&raw, mode, buffer),
            Some(mut scratch) => {
                let result = convert_to_canonical(&raw, mode, &mut scratch)
                    .and_then(|()| self.scaler.apply(&scratch, buffer));
                self.scaler.restore_scratch(scratch);
                result
            }
        }
    }
}

/// State shared between a [`FrameSource`] and its delivery thread.
pub(crate) struct Shared {
    core: Mutex<Core>,
    signal: StreamSignal,
    mode: ColorMode,
    raw_format: RawFormat,
    output_size: (u32, u32),
    description: String,
}

impl Shared {
    pub(crate) fn new_buffer(&self) -> FrameBuffer {
        FrameBuffer::new(self.output_size.0, self.output_size.1, self.mode)
    }

    /// Wakes a get call parked on the stream state so it can see `cancel`.
    pub(crate) fn interrupt(&self) {
        self.signal.wake();
    }

    /// Waits for a frame and returns the locked core together with the checked-out slot.
    fn acquire(&self, latest: bool, cancel: Option<&AtomicBool>) -> Result<(MutexGuard<'_, Core>, Slot)> {
        loop {
            self.signal.wait_running(cancel)?;
            let mut core = lock(&self.core);
            // stop_stream may have won the race for the core lock
            if self.signal.get() != StreamState::Running {
                continue;
            }

            if core.release_peek() {
                warn!("Frame requested while a peeked frame is outstanding; unpeeking the stale frame");
                core.stats.auto_unpeeks += 1;
            }

            let dequeued = if latest && core.backend.is_queued() {
                core.dequeue_latest()
            } else {
                core.dequeue_next()
            };
            match dequeued {
                Ok(Some(slot)) => {
                    if self.signal.get() == StreamState::Running {
                        return Ok((core, slot));
                    }
                    core.release(slot);
                }
                Ok(None) => {}
                Err(e) => {
                    core.stats.dequeue_failures += 1;
                    warn!("Could not capture a frame: {}", e);
                    return Err(e);
                }
            }
            drop(core);

            if is_cancelled(cancel) {
                return Err(FrameError::Cancelled);
            }
        }
    }

    /// Peek, convert into `buffer`, unpeek. Returns the frame timestamp.
    pub(crate) fn get_frame(
        &self,
        buffer: &mut FrameBuffer,
        latest: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<u64> {
        buffer.check_geometry(self.output_size.0, self.output_size.1, self.mode.channels())?;

        let (mut core, slot) = self.acquire(latest, cancel)?;
        let timestamp_us = slot.timestamp_us();
        let result = core.convert_into(&slot, self.mode, buffer);
        core.release(slot);
        match result {
            Ok(()) => {
                core.stats.delivered += 1;
                Ok(timestamp_us)
            }
            Err(e) => {
                warn!("Could not convert a frame: {}", e);
                Err(e)
            }
        }
    }
}

/// A raw frame checked out by [`FrameSource::peek_next_frame`] or
/// [`FrameSource::peek_latest_frame`].
///
/// The frame stays checked out until [`PeekedFrame::unpeek`] or
/// [`FrameSource::unpeek_frame`] is called, or until the next peek or get releases
/// it with a warning. Dropping the view does not give the frame back.
pub struct PeekedFrame<'a> {
    shared: &'a Shared,
    id: u64,
    timestamp_us: u64,
}

impl PeekedFrame<'_> {
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn format(&self) -> RawFormat {
        self.shared.raw_format
    }

    /// Whether this frame is still checked out.
    pub fn is_current(&self) -> bool {
        lock(&self.shared.core)
            .peeked
            .as_ref()
            .is_some_and(|peek| peek.id == self.id)
    }

    /// Runs `f` over the unconverted frame data, exactly as the backend delivered it.
    ///
    /// The source is locked while `f` runs. Fails with [`FrameError::PeekReleased`]
    /// once the frame has been given back.
    pub fn with_raw<R>(&self, f: impl FnOnce(RawFrame<'_>) -> R) -> Result<R> {
        let core = lock(&self.shared.core);
        match &core.peeked {
            Some(peek) if peek.id == self.id => Ok(f(core.backend.raw_frame(&peek.slot))),
            _ => Err(FrameError::PeekReleased),
        }
    }

    /// Gives the frame back to the backend. Does nothing if it was already released.
    pub fn unpeek(self) {
        let mut core = lock(&self.shared.core);
        if core.peeked.as_ref().is_some_and(|peek| peek.id == self.id) {
            core.release_peek();
        }
    }
}

/// Uniform access to one camera, video file or image.
///
/// All methods take `&self`; a source can be shared between threads. Direct get
/// calls and the delivery thread are alternative usage modes: while a delivery
/// thread runs, get and peek calls fail with [`FrameError::DeliveryRunning`].
pub struct FrameSource {
    delivery: Mutex<Option<DeliveryThread>>,
    shared: Arc<Shared>,
}

impl FrameSource {
    /// Wraps an opened backend. The source starts Running.
    pub fn new(backend: impl AcquisitionBackend + 'static, options: SourceOptions) -> Result<Self> {
        Self::from_boxed(Box::new(backend), options)
    }

    pub fn from_boxed(backend: Box<dyn AcquisitionBackend>, options: SourceOptions) -> Result<Self> {
        let raw_format = backend.format();
        if raw_format.width == 0 || raw_format.height == 0 {
            return Err(FrameError::Init(format!(
                "backend reports an empty frame size {}",
                raw_format
            )));
        }
        let scaler = CropScaler::setup(
            raw_format.width,
            raw_format.height,
            options.mode,
            options.crop,
            options.scale,
        )?;
        let output_size = scaler.output_size();
        let description = backend.description();

        info!(
            "Frame source ready: {} -> {}x{} {:?}",
            description, output_size.0, output_size.1, options.mode
        );

        Ok(Self {
            delivery: Mutex::new(None),
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    backend,
                    peeked: None,
                    peek_seq: 0,
                    scaler,
                    stats: SourceStats::default(),
                }),
                signal: StreamSignal::new(),
                mode: options.mode,
                raw_format,
                output_size,
                description,
            }),
        })
    }

    pub fn description(&self) -> &str {
        &self.shared.description
    }

    pub fn color_mode(&self) -> ColorMode {
        self.shared.mode
    }

    /// Size of the frames the backend produces, before crop/scale.
    pub fn raw_format(&self) -> RawFormat {
        self.shared.raw_format
    }

    /// Size of the frames written by the get calls.
    pub fn output_size(&self) -> (u32, u32) {
        self.shared.output_size
    }

    /// A buffer of the right geometry for the get calls.
    pub fn new_buffer(&self) -> FrameBuffer {
        self.shared.new_buffer()
    }

    pub fn stream_state(&self) -> StreamState {
        self.shared.signal.get()
    }

    pub fn is_running(&self) -> bool {
        self.stream_state() == StreamState::Running
    }

    pub fn stats(&self) -> SourceStats {
        lock(&self.shared.core).stats
    }

    fn ensure_direct_use(&self) -> Result<()> {
        if self.is_delivering() {
            Err(FrameError::DeliveryRunning)
        } else {
            Ok(())
        }
    }

    /// Blocks until the next queued frame is available and writes it into `buffer`.
    /// Never skips a queued frame. Returns the frame timestamp in microseconds.
    pub fn get_next_frame(&self, buffer: &mut FrameBuffer) -> Result<u64> {
        self.ensure_direct_use()?;
        self.shared.get_frame(buffer, false, None)
    }

    /// Like [`FrameSource::get_next_frame`], but discards any backlog first so the
    /// newest available frame is returned.
    pub fn get_latest_frame(&self, buffer: &mut FrameBuffer) -> Result<u64> {
        self.ensure_direct_use()?;
        self.shared.get_frame(buffer, true, None)
    }

    pub fn peek_next_frame(&self) -> Result<PeekedFrame<'_>> {
        self.peek(false)
    }

    pub fn peek_latest_frame(&self) -> Result<PeekedFrame<'_>> {
        self.peek(true)
    }

    fn peek(&self, latest: bool) -> Result<PeekedFrame<'_>> {
        self.ensure_direct_use()?;
        let (mut core, slot) = self.shared.acquire(latest, None)?;
        core.peek_seq += 1;
        let id = core.peek_seq;
        let timestamp_us = slot.timestamp_us();
        core.peeked = Some(Peek { id, slot });
        Ok(PeekedFrame {
            shared: &self.shared,
            id,
            timestamp_us,
        })
    }

    /// Releases the outstanding peeked frame, if any.
    pub fn unpeek_frame(&self) {
        lock(&self.shared.core).release_peek();
    }

    /// Halts the stream and discards queued frames. Get calls block until the stream
    /// is resumed or restarted.
    pub fn stop_stream(&self) -> Result<()> {
        let previous = self.stream_state();
        self.shared.signal.set(StreamState::Stopped);

        let mut core = lock(&self.shared.core);
        if core.release_peek() {
            debug!("Released the peeked frame before stopping");
        }
        if let Err(e) = core.backend.stop() {
            warn!("Could not stop the stream: {}", e);
            drop(core);
            self.shared.signal.set(previous);
            return Err(e);
        }
        info!("Stream stopped");
        Ok(())
    }

    /// Flushes and re-arms the backend, then wakes blocked get calls.
    pub fn resume_stream(&self) -> Result<()> {
        self.rearm(false)
    }

    /// Rewinds seekable sources to the beginning, then resumes. Same as
    /// [`FrameSource::resume_stream`] for live cameras.
    pub fn restart_stream(&self) -> Result<()> {
        self.rearm(true)
    }

    fn rearm(&self, rewind: bool) -> Result<()> {
        let mut core = lock(&self.shared.core);
        core.release_peek();
        let result = if rewind {
            core.backend.restart()
        } else {
            core.backend.resume()
        };
        drop(core);

        match result {
            Ok(()) => {
                self.shared.signal.set(StreamState::Running);
                info!("Stream {}", if rewind { "restarted" } else { "resumed" });
                Ok(())
            }
            Err(e) => {
                warn!("Could not {} the stream: {}", if rewind { "restart" } else { "resume" }, e);
                Err(e)
            }
        }
    }

    /// Starts the delivery thread.
    ///
    /// With a non-zero `interval` the thread sleeps `interval` and then delivers the
    /// latest frame; with a zero interval it delivers every frame in order. On an
    /// acquisition failure `callback` receives `None` once and the thread exits.
    pub fn start_delivery<F>(&self, interval: Duration, callback: F) -> Result<()>
    where
        F: FnMut(Option<Delivered<'_>>) + Send + 'static,
    {
        let mut delivery = lock(&self.delivery);
        if let Some(thread) = delivery.as_ref() {
            if !thread.is_finished() {
                return Err(FrameError::DeliveryRunning);
            }
        }
        // Reap a thread that already ended on its own
        if let Some(finished) = delivery.take() {
            finished.join();
        }
        *delivery = Some(DeliveryThread::spawn(self.shared.clone(), interval, Box::new(callback))?);
        Ok(())
    }

    /// Cancels the delivery thread at its next dequeue boundary and joins it.
    pub fn stop_delivery(&self) {
        let thread = lock(&self.delivery).take();
        if let Some(thread) = thread {
            thread.join();
        }
    }

    pub fn is_delivering(&self) -> bool {
        lock(&self.delivery)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop_delivery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::test_pattern;
    use crate::backend::{StillImageBackend, SyntheticBackend, SyntheticConfig, SyntheticFeed};
    use crate::frame::PixelEncoding;
    use std::io::Write;
    use std::thread;

    fn synthetic(width: u32, height: u32, slots: usize, options: SourceOptions) -> (FrameSource, SyntheticFeed) {
        let backend = SyntheticBackend::open(SyntheticConfig {
            width,
            height,
            encoding: PixelEncoding::Gray8,
            slots,
            interval: None,
            on_demand: false,
        })
        .unwrap();
        let feed = backend.feed();
        (FrameSource::new(backend, options).unwrap(), feed)
    }

    fn gray() -> SourceOptions {
        SourceOptions {
            mode: ColorMode::Grayscale,
            ..Default::default()
        }
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_get_next_frame_never_skips() {
        let (source, feed) = synthetic(8, 4, 4, gray());
        for ts in [100, 200, 300] {
            assert!(feed.push(&[ts as u8; 32], ts));
        }

        let mut buffer = source.new_buffer();
        for expected in [100, 200, 300] {
            assert_eq!(source.get_next_frame(&mut buffer).unwrap(), expected);
            assert_eq!(buffer.data[0], expected as u8);
        }
        assert_eq!(source.stats().delivered, 3);
        assert_eq!(source.stats().purged, 0);
    }

    #[test]
    fn test_get_latest_frame_purges_backlog() {
        let (source, feed) = synthetic(8, 4, 4, gray());
        for ts in [1, 2, 3] {
            feed.push(&[ts as u8; 32], ts);
        }

        let mut buffer = source.new_buffer();
        assert_eq!(source.get_latest_frame(&mut buffer).unwrap(), 3);
        assert_eq!(buffer.data[0], 3);
        assert_eq!(feed.queued(), 0);
        assert_eq!(source.stats().purged, 2);

        // Discarded buffers went straight back into the ring
        for ts in [4, 5, 6, 7] {
            assert!(feed.push(&[0; 32], ts));
        }
    }

    #[test]
    fn test_get_latest_frame_waits_when_queue_is_empty() {
        let (source, feed) = synthetic(8, 4, 2, gray());
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                feed.push(&[5; 32], 77);
            });
            let mut buffer = source.new_buffer();
            assert_eq!(source.get_latest_frame(&mut buffer).unwrap(), 77);
        });
    }

    #[test]
    fn test_grayscale_test_pattern_640x480() {
        let (source, feed) = synthetic(640, 480, 4, gray());
        assert!(feed.push_pattern());

        let mut buffer = source.new_buffer();
        assert_eq!((buffer.width, buffer.height, buffer.channels), (640, 480, 1));
        let ts = source.get_next_frame(&mut buffer).unwrap();
        assert_eq!(ts, 0);
        assert_eq!(buffer.data, test_pattern(640, 480, PixelEncoding::Gray8, 0));
    }

    #[test]
    fn test_color_source_expands_gray_camera() {
        let (source, feed) = synthetic(4, 2, 2, SourceOptions::default());
        feed.push_pattern();
        let mut buffer = source.new_buffer();
        source.get_next_frame(&mut buffer).unwrap();
        assert_eq!(&buffer.data[..6], &[0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_crop_and_scale_shape_the_output() {
        let options = SourceOptions {
            mode: ColorMode::Grayscale,
            crop: CropRect::new(8, 8, 16, 16),
            scale: 2.0,
        };
        let (source, feed) = synthetic(64, 48, 2, options);
        assert_eq!(source.output_size(), (32, 32));
        feed.push(&[200; 64 * 48], 1);

        let mut buffer = source.new_buffer();
        source.get_next_frame(&mut buffer).unwrap();
        assert!(buffer.data.iter().all(|&v| v.abs_diff(200) <= 1));
    }

    #[test]
    fn test_wrong_buffer_is_rejected_without_consuming() {
        let (source, feed) = synthetic(8, 4, 2, gray());
        feed.push(&[1; 32], 1);
        let mut wrong = FrameBuffer::new(8, 4, ColorMode::Color);
        assert!(matches!(
            source.get_next_frame(&mut wrong),
            Err(FrameError::BufferMismatch { .. })
        ));
        assert_eq!(feed.queued(), 1);
    }

    #[test]
    fn test_peek_then_peek_auto_unpeeks_with_one_warning() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let (source, feed) = synthetic(8, 4, 1, gray());
        tracing::subscriber::with_default(subscriber, || {
            feed.push(&[1; 32], 10);
            let first = source.peek_next_frame().unwrap();
            assert_eq!(first.timestamp_us(), 10);
            assert_eq!(first.with_raw(|raw| raw.data[0]).unwrap(), 1);

            // The only slot is still checked out, so this frame is lost
            assert!(!feed.push(&[2; 32], 20));

            thread::scope(|s| {
                s.spawn(|| {
                    thread::sleep(Duration::from_millis(50));
                    assert!(feed.push(&[3; 32], 30));
                });
                // `first` is still alive here
                let second = source.peek_next_frame().unwrap();
                assert_eq!(second.timestamp_us(), 30);
                assert_eq!(second.with_raw(|raw| raw.data[0]).unwrap(), 3);

                assert!(!first.is_current());
                assert!(matches!(first.with_raw(|_| ()), Err(FrameError::PeekReleased)));
                // A stale view must not release the newer peek
                first.unpeek();
                assert!(second.is_current());
                second.unpeek();
            });
        });

        assert_eq!(source.stats().auto_unpeeks, 1);
        assert_eq!(capture.text().matches("WARN").count(), 1);
        assert!(capture.text().contains("peeked frame is outstanding"));
        assert!(feed.push(&[4; 32], 40));
    }

    #[test]
    fn test_get_while_peek_is_alive_releases_it() {
        let (source, feed) = synthetic(8, 4, 2, gray());
        feed.push(&[1; 32], 1);
        feed.push(&[2; 32], 2);

        let peeked = source.peek_next_frame().unwrap();
        let mut buffer = source.new_buffer();
        assert_eq!(source.get_next_frame(&mut buffer).unwrap(), 2);
        assert!(!peeked.is_current());
        assert_eq!(source.stats().auto_unpeeks, 1);

        // Both slots are back in the ring
        assert!(feed.push(&[3; 32], 3));
        assert!(feed.push(&[4; 32], 4));
    }

    #[test]
    fn test_unpeek_frame_returns_slot() {
        let (source, feed) = synthetic(8, 4, 1, gray());
        feed.push(&[1; 32], 1);
        let peeked = source.peek_latest_frame().unwrap();
        source.unpeek_frame();
        assert!(!peeked.is_current());
        assert!(feed.push(&[2; 32], 2));
        assert_eq!(source.stats().auto_unpeeks, 0);
    }

    #[test]
    fn test_stop_blocks_get_until_resume() {
        let (source, feed) = synthetic(8, 4, 4, gray());
        feed.push(&[1; 32], 1);
        source.stop_stream().unwrap();
        assert!(!source.is_running());
        assert_eq!(feed.queued(), 0);

        thread::scope(|s| {
            let getter = s.spawn(|| {
                let mut buffer = source.new_buffer();
                source.get_next_frame(&mut buffer).map(|ts| (ts, buffer.data[0]))
            });

            thread::sleep(Duration::from_millis(150));
            assert!(!getter.is_finished());
            assert!(!feed.push(&[2; 32], 2));

            source.resume_stream().unwrap();
            assert!(feed.push(&[3; 32], 3));
            assert_eq!(getter.join().unwrap().unwrap(), (3, 3));
        });
    }

    #[test]
    fn test_stop_while_get_is_blocked() {
        let (source, feed) = synthetic(8, 4, 4, gray());

        thread::scope(|s| {
            let getter = s.spawn(|| {
                let mut buffer = source.new_buffer();
                source.get_next_frame(&mut buffer).map(|ts| (ts, buffer.data[0]))
            });

            // Let the getter block inside a dequeue before stopping
            thread::sleep(Duration::from_millis(150));
            assert!(!getter.is_finished());
            source.stop_stream().unwrap();
            assert!(!feed.push(&[2; 32], 2));

            thread::sleep(Duration::from_millis(150));
            assert!(!getter.is_finished());

            source.resume_stream().unwrap();
            assert!(feed.push(&[3; 32], 3));
            assert_eq!(getter.join().unwrap().unwrap(), (3, 3));
        });
    }

    #[test]
    fn test_dequeue_failure_is_reported_once() {
        let (source, feed) = synthetic(8, 4, 2, gray());
        feed.inject_failure("transfer error");
        let mut buffer = source.new_buffer();
        assert!(matches!(
            source.get_next_frame(&mut buffer),
            Err(FrameError::Acquisition(_))
        ));
        assert_eq!(source.stats().dequeue_failures, 1);

        feed.push(&[4; 32], 4);
        assert_eq!(source.get_next_frame(&mut buffer).unwrap(), 4);
    }

    #[test]
    fn test_still_image_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        image::RgbImage::from_fn(20, 10, |x, y| image::Rgb([x as u8 * 10, y as u8 * 20, 99]))
            .save(&path)
            .unwrap();

        let backend = StillImageBackend::open(&path, ColorMode::Color).unwrap();
        let source = FrameSource::new(backend, SourceOptions::default()).unwrap();
        let mut first = source.new_buffer();
        let mut second = source.new_buffer();
        source.get_next_frame(&mut first).unwrap();
        source.get_latest_frame(&mut second).unwrap();
        assert_eq!(first, second);

        source.restart_stream().unwrap();
        let mut third = source.new_buffer();
        source.get_next_frame(&mut third).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_invalid_crop_fails_construction() {
        let backend = SyntheticBackend::open(SyntheticConfig {
            width: 8,
            height: 4,
            interval: None,
            ..Default::default()
        })
        .unwrap();
        let options = SourceOptions {
            crop: CropRect::new(4, 0, 8, 4),
            ..Default::default()
        };
        assert!(matches!(
            FrameSource::new(backend, options),
            Err(FrameError::InvalidCrop { .. })
        ));
    }
}
