//! Software camera that behaves like a DMA ring.
//!
//! A fixed number of slots circulate between a producer and the consumer. The
//! producer is either a built-in generator thread (free-running camera) or a
//! [`SyntheticFeed`] handle driven by the caller. When every slot is filled or
//! checked out, new frames are dropped, the way a camera drops frames nobody
//! collected in time.

use super::{AcquisitionBackend, DequeuePolicy, RawFormat, Slot};
use crate::error::{FrameError, Result};
use crate::frame::PixelEncoding;
use crate::utils::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// One of Gray8, Rgb24, Yuyv
    pub encoding: PixelEncoding,
    /// Ring size
    pub slots: usize,
    /// Frame period of the built-in generator; `None` leaves production to a feed
    pub interval: Option<Duration>,
    /// Produce a fresh frame on every dequeue instead of using the ring
    pub on_demand: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            encoding: PixelEncoding::Gray8,
            slots: 4,
            interval: Some(Duration::from_micros(33_333)),
            on_demand: false,
        }
    }
}

struct Ring {
    /// `None` while the slot is checked out by the consumer
    buffers: Vec<Option<Vec<u8>>>,
    free: VecDeque<usize>,
    filled: VecDeque<(usize, u64)>,
    streaming: bool,
    seq: u64,
    dropped: u64,
    pending_failure: Option<String>,
}

struct Shared {
    ring: Mutex<Ring>,
    ready: Condvar,
    format: RawFormat,
    period_us: u64,
}

impl Shared {
    /// Fills a free slot with `fill` and queues it. Returns false when the frame was dropped.
    fn produce(&self, fill: impl FnOnce(&mut [u8], u64), timestamp_us: Option<u64>) -> bool {
        let mut ring = lock(&self.ring);
        let seq = ring.seq;
        ring.seq += 1;
        if !ring.streaming {
            return false;
        }
        let Some(index) = ring.free.pop_front() else {
            ring.dropped += 1;
            return false;
        };
        let Some(buffer) = ring.buffers[index].as_mut() else {
            return false;
        };
        fill(buffer, seq);
        let ts = timestamp_us.unwrap_or(seq * self.period_us);
        ring.filled.push_back((index, ts));
        drop(ring);
        self.ready.notify_all();
        true
    }
}

/// Producer handle for a [`SyntheticBackend`]. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct SyntheticFeed {
    shared: Arc<Shared>,
}

impl SyntheticFeed {
    /// Queues the next test-pattern frame. Returns false if the ring was full.
    pub fn push_pattern(&self) -> bool {
        let format = self.shared.format;
        self.shared.produce(
            |buf, seq| fill_pattern(buf, format.width, format.height, format.encoding, seq),
            None,
        )
    }

    /// Queues caller-supplied frame data, truncated or zero-padded to the frame size.
    pub fn push(&self, data: &[u8], timestamp_us: u64) -> bool {
        self.shared.produce(
            |buf, _| {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf[n..].fill(0);
            },
            Some(timestamp_us),
        )
    }

    /// Makes the next dequeue fail, as a camera reporting a transfer error would.
    pub fn inject_failure(&self, message: impl Into<String>) {
        lock(&self.shared.ring).pending_failure = Some(message.into());
        self.shared.ready.notify_all();
    }

    /// Frames lost because every slot was busy.
    pub fn dropped(&self) -> u64 {
        lock(&self.shared.ring).dropped
    }

    /// Frames waiting to be dequeued.
    pub fn queued(&self) -> usize {
        lock(&self.shared.ring).filled.len()
    }
}

pub struct SyntheticBackend {
    shared: Arc<Shared>,
    /// Buffers checked out of the ring, by slot index
    held: Vec<Option<Vec<u8>>>,
    config: SyntheticConfig,
    generator: Option<(JoinHandle<()>, Arc<AtomicBool>)>,
}

impl SyntheticBackend {
    pub fn open(config: SyntheticConfig) -> Result<Self> {
        if !matches!(
            config.encoding,
            PixelEncoding::Gray8 | PixelEncoding::Rgb24 | PixelEncoding::Yuyv
        ) {
            return Err(FrameError::Init(format!(
                "synthetic camera cannot produce {:?}",
                config.encoding
            )));
        }
        if config.width == 0 || config.height == 0 || config.slots == 0 {
            return Err(FrameError::Init(format!(
                "synthetic camera needs a non-empty frame and ring, got {}x{} with {} slots",
                config.width, config.height, config.slots
            )));
        }
        if config.encoding == PixelEncoding::Yuyv && config.width % 2 != 0 {
            return Err(FrameError::Init("YUYV needs an even width".into()));
        }

        let format = RawFormat::packed(config.width, config.height, config.encoding);
        let frame_len = format.encoding.frame_len(format.width, format.height, format.stride);
        let slots = if config.on_demand { 1 } else { config.slots };
        let period_us = config
            .interval
            .map(|d| d.as_micros() as u64)
            .unwrap_or(33_333)
            .max(1);

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                buffers: (0..slots).map(|_| Some(vec![0; frame_len])).collect(),
                free: (0..slots).collect(),
                filled: VecDeque::new(),
                streaming: true,
                seq: 0,
                dropped: 0,
                pending_failure: None,
            }),
            ready: Condvar::new(),
            format,
            period_us,
        });

        let generator = match config.interval {
            Some(interval) if !config.on_demand => {
                Some(spawn_generator(SyntheticFeed { shared: shared.clone() }, interval))
            }
            _ => None,
        };

        info!(
            "Synthetic camera: {}, {} slots{}",
            format,
            slots,
            if config.on_demand { ", on demand" } else { "" }
        );

        Ok(Self {
            shared,
            held: (0..slots).map(|_| None).collect(),
            config,
            generator,
        })
    }

    /// Handle for pushing frames from another thread.
    pub fn feed(&self) -> SyntheticFeed {
        SyntheticFeed {
            shared: self.shared.clone(),
        }
    }

    fn take_filled(&mut self, ring: &mut Ring) -> Option<Slot> {
        let (index, ts) = ring.filled.pop_front()?;
        let buffer = ring.buffers[index].take()?;
        let len = buffer.len();
        self.held[index] = Some(buffer);
        Some(Slot::new(index, len, ts))
    }
}

fn spawn_generator(feed: SyntheticFeed, interval: Duration) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = thread::spawn(move || {
        let mut next = Instant::now() + interval;
        while !stop_flag.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next {
                thread::park_timeout(next - now);
                continue;
            }
            next += interval;
            if !feed.push_pattern() {
                debug!("Synthetic camera dropped a frame");
            }
        }
    });
    (handle, stop)
}

impl AcquisitionBackend for SyntheticBackend {
    fn format(&self) -> RawFormat {
        self.shared.format
    }

    fn description(&self) -> String {
        let rate = match (self.config.on_demand, self.config.interval) {
            (true, _) => "on demand".to_string(),
            (false, Some(interval)) => format!("{:.1} fps", 1.0 / interval.as_secs_f64()),
            (false, None) => "externally fed".to_string(),
        };
        format!("synthetic camera {} ({})", self.shared.format, rate)
    }

    fn is_queued(&self) -> bool {
        !self.config.on_demand
    }

    fn dequeue(&mut self, policy: DequeuePolicy) -> Result<Option<Slot>> {
        let shared = self.shared.clone();
        let mut ring = lock(&shared.ring);

        if let Some(message) = ring.pending_failure.take() {
            return Err(FrameError::Acquisition(message));
        }
        if !ring.streaming {
            return Err(FrameError::StreamControl("camera is not streaming".into()));
        }

        if self.config.on_demand {
            drop(ring);
            let format = shared.format;
            shared.produce(
                |buf, seq| fill_pattern(buf, format.width, format.height, format.encoding, seq),
                None,
            );
            ring = lock(&shared.ring);
        } else if let DequeuePolicy::Wait(timeout) = policy {
            ring = shared
                .ready
                .wait_timeout_while(ring, timeout, |r| {
                    r.filled.is_empty() && r.pending_failure.is_none() && r.streaming
                })
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
            if let Some(message) = ring.pending_failure.take() {
                return Err(FrameError::Acquisition(message));
            }
        }

        Ok(self.take_filled(&mut ring))
    }

    fn slot_data(&self, slot: &Slot) -> &[u8] {
        self.held
            .get(slot.index())
            .and_then(|b| b.as_deref())
            .unwrap_or(&[])
    }

    fn enqueue(&mut self, slot: Slot) -> Result<()> {
        let buffer = self
            .held
            .get_mut(slot.index())
            .and_then(Option::take)
            .ok_or_else(|| {
                FrameError::Acquisition(format!("slot {} is not checked out", slot.index()))
            })?;
        let mut ring = lock(&self.shared.ring);
        ring.buffers[slot.index()] = Some(buffer);
        ring.free.push_back(slot.index());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut ring = lock(&self.shared.ring);
        ring.streaming = false;
        let flushed = ring.filled.len();
        while let Some((index, _)) = ring.filled.pop_front() {
            ring.free.push_back(index);
        }
        drop(ring);
        self.shared.ready.notify_all();
        debug!("Synthetic camera stopped, {} queued frames flushed", flushed);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        lock(&self.shared.ring).streaming = true;
        Ok(())
    }
}

impl Drop for SyntheticBackend {
    fn drop(&mut self) {
        if let Some((handle, stop)) = self.generator.take() {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// Deterministic test image for frame number `seq`.
///
/// Luminance at (x, y) is `(x + y + seq) % 256`; in RGB the green and blue
/// channels carry `x` and `y` so orientation mistakes show up.
pub fn test_pattern(width: u32, height: u32, encoding: PixelEncoding, seq: u64) -> Vec<u8> {
    let stride = encoding.row_bytes(width);
    let mut data = vec![0; encoding.frame_len(width, height, stride)];
    fill_pattern(&mut data, width, height, encoding, seq);
    data
}

fn fill_pattern(buf: &mut [u8], width: u32, height: u32, encoding: PixelEncoding, seq: u64) {
    let w = width as usize;
    let s = seq as usize;
    let row_len = encoding.row_bytes(width);
    for (y, row) in buf.chunks_exact_mut(row_len).take(height as usize).enumerate() {
        match encoding {
            PixelEncoding::Rgb24 => {
                for (x, px) in row.chunks_exact_mut(3).enumerate() {
                    px[0] = ((x + y + s) % 256) as u8;
                    px[1] = (x % 256) as u8;
                    px[2] = (y % 256) as u8;
                }
            }
            PixelEncoding::Yuyv => {
                for (x, px) in row.chunks_exact_mut(2).enumerate() {
                    px[0] = ((x + y + s) % 256) as u8;
                    px[1] = 128;
                }
            }
            _ => {
                for (x, px) in row.iter_mut().take(w).enumerate() {
                    *px = ((x + y + s) % 256) as u8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(slots: usize) -> (SyntheticBackend, SyntheticFeed) {
        let backend = SyntheticBackend::open(SyntheticConfig {
            width: 8,
            height: 4,
            slots,
            interval: None,
            ..Default::default()
        })
        .unwrap();
        let feed = backend.feed();
        (backend, feed)
    }

    #[test]
    fn test_pattern_values() {
        let gray = test_pattern(4, 2, PixelEncoding::Gray8, 3);
        assert_eq!(gray, vec![3, 4, 5, 6, 4, 5, 6, 7]);

        let yuyv = test_pattern(4, 1, PixelEncoding::Yuyv, 0);
        assert_eq!(yuyv, vec![0, 128, 1, 128, 2, 128, 3, 128]);
    }

    #[test]
    fn test_poll_on_empty_ring_returns_none() {
        let (mut backend, _feed) = fed(2);
        assert!(backend.dequeue(DequeuePolicy::Poll).unwrap().is_none());
    }

    #[test]
    fn test_frames_come_out_in_order() {
        let (mut backend, feed) = fed(3);
        assert!(feed.push(&[1; 32], 10));
        assert!(feed.push(&[2; 32], 20));

        let a = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
        assert_eq!(a.timestamp_us(), 10);
        assert_eq!(backend.slot_data(&a)[0], 1);
        backend.enqueue(a).unwrap();

        let b = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
        assert_eq!(b.timestamp_us(), 20);
        assert_eq!(backend.slot_data(&b)[0], 2);
        backend.enqueue(b).unwrap();
    }

    #[test]
    fn test_full_ring_drops_new_frames() {
        let (mut backend, feed) = fed(2);
        assert!(feed.push_pattern());
        assert!(feed.push_pattern());
        assert!(!feed.push_pattern());
        assert_eq!(feed.dropped(), 1);

        let slot = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
        backend.enqueue(slot).unwrap();
        assert!(feed.push_pattern());
    }

    #[test]
    fn test_wait_wakes_on_push_from_other_thread() {
        let (mut backend, feed) = fed(2);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            feed.push(&[9; 32], 5)
        });
        let slot = backend
            .dequeue(DequeuePolicy::Wait(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        assert_eq!(slot.timestamp_us(), 5);
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_stop_flushes_queue_and_rejects_frames() {
        let (mut backend, feed) = fed(3);
        feed.push_pattern();
        feed.push_pattern();
        backend.stop().unwrap();
        assert_eq!(feed.queued(), 0);
        assert!(!feed.push_pattern());
        assert!(backend.dequeue(DequeuePolicy::Poll).is_err());

        backend.resume().unwrap();
        assert!(feed.push_pattern());
        assert!(backend.dequeue(DequeuePolicy::Poll).unwrap().is_some());
    }

    #[test]
    fn test_injected_failure_is_reported_once() {
        let (mut backend, feed) = fed(2);
        feed.inject_failure("cable unplugged");
        assert!(matches!(
            backend.dequeue(DequeuePolicy::Poll),
            Err(FrameError::Acquisition(_))
        ));
        assert!(backend.dequeue(DequeuePolicy::Poll).unwrap().is_none());
    }

    #[test]
    fn test_on_demand_always_has_a_frame() {
        let mut backend = SyntheticBackend::open(SyntheticConfig {
            width: 4,
            height: 2,
            on_demand: true,
            ..Default::default()
        })
        .unwrap();
        assert!(!backend.is_queued());
        for expected in 0..3u8 {
            let slot = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
            assert_eq!(backend.slot_data(&slot)[0], expected);
            backend.enqueue(slot).unwrap();
        }
    }

    #[test]
    fn test_generator_produces_frames() {
        let mut backend = SyntheticBackend::open(SyntheticConfig {
            width: 4,
            height: 2,
            interval: Some(Duration::from_millis(5)),
            ..Default::default()
        })
        .unwrap();
        let slot = backend
            .dequeue(DequeuePolicy::Wait(Duration::from_secs(5)))
            .unwrap();
        assert!(slot.is_some());
    }
}
