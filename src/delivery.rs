//! Background frame delivery.

use crate::error::{FrameError, Result};
use crate::frame::FrameBuffer;
use crate::source::Shared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// One frame handed to a delivery callback.
#[derive(Debug, Clone, Copy)]
pub struct Delivered<'a> {
    pub buffer: &'a FrameBuffer,
    pub timestamp_us: u64,
}

/// Consumer callback. `None` means acquisition failed and no more frames will come.
pub type FrameCallback = Box<dyn FnMut(Option<Delivered<'_>>) + Send + 'static>;

/// Owned handle to a running delivery thread.
pub(crate) struct DeliveryThread {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl DeliveryThread {
    pub(crate) fn spawn(shared: Arc<Shared>, interval: Duration, callback: FrameCallback) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            shared: shared.clone(),
            cancel: cancel.clone(),
            interval,
            callback,
        };
        let handle = thread::Builder::new()
            .name("frame-delivery".into())
            .spawn(move || worker.run())
            .map_err(|e| FrameError::io("spawning the delivery thread", e))?;

        Ok(Self {
            handle,
            cancel,
            shared,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels at the next dequeue boundary and waits for the thread to exit.
    pub(crate) fn join(self) {
        self.cancel.store(true, Ordering::Release);
        self.shared.interrupt();
        self.handle.thread().unpark();
        if self.handle.join().is_err() {
            error!("Delivery thread panicked");
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    interval: Duration,
    callback: FrameCallback,
}

impl Worker {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Sleeps for `interval` unless cancelled first. Returns false on cancellation.
    fn sleep(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn run(mut self) {
        let mut buffer = self.shared.new_buffer();
        let rate_limited = !self.interval.is_zero();
        info!(
            "Delivery thread started ({})",
            if rate_limited {
                format!("latest frame every {:?}", self.interval)
            } else {
                "every frame".to_string()
            }
        );

        loop {
            if rate_limited && !self.sleep() {
                break;
            }
            let result = self
                .shared
                .get_frame(&mut buffer, rate_limited, Some(self.cancel.as_ref()));
            match result {
                Ok(timestamp_us) => (self.callback)(Some(Delivered {
                    buffer: &buffer,
                    timestamp_us,
                })),
                Err(FrameError::Cancelled) => break,
                Err(e) => {
                    error!("Delivery thread stopping: {}", e);
                    (self.callback)(None);
                    return;
                }
            }
            if self.cancelled() {
                break;
            }
        }
        info!("Delivery thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{SyntheticBackend, SyntheticConfig, SyntheticFeed};
    use crate::frame::{ColorMode, PixelEncoding};
    use crate::source::{FrameSource, SourceOptions};
    use std::sync::mpsc;
    use std::time::Duration;

    fn source(interval: Option<Duration>) -> (FrameSource, SyntheticFeed) {
        let backend = SyntheticBackend::open(SyntheticConfig {
            width: 16,
            height: 8,
            encoding: PixelEncoding::Gray8,
            slots: 4,
            interval,
            on_demand: false,
        })
        .unwrap();
        let feed = backend.feed();
        let options = SourceOptions {
            mode: ColorMode::Grayscale,
            ..Default::default()
        };
        (FrameSource::new(backend, options).unwrap(), feed)
    }

    #[test]
    fn test_every_frame_is_delivered_in_order() {
        let (source, feed) = source(None);
        let (tx, rx) = mpsc::channel();
        source
            .start_delivery(Duration::ZERO, move |frame| {
                let _ = tx.send(frame.map(|f| (f.timestamp_us, f.buffer.data[0])));
            })
            .unwrap();
        assert!(source.is_delivering());

        for ts in 1..=3u64 {
            assert!(feed.push(&[ts as u8; 128], ts * 10));
        }
        for ts in 1..=3u64 {
            let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(got, Some((ts * 10, ts as u8)));
        }

        source.stop_delivery();
        assert!(!source.is_delivering());
    }

    #[test]
    fn test_rate_limited_delivery_gets_latest_frames() {
        let (source, _feed) = source(Some(Duration::from_millis(2)));
        let (tx, rx) = mpsc::channel();
        source
            .start_delivery(Duration::from_millis(30), move |frame| {
                let _ = tx.send(frame.map(|f| f.timestamp_us));
            })
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(second > first);
        source.stop_delivery();
        assert!(source.stats().purged > 0);
    }

    #[test]
    fn test_failure_is_signalled_once_and_thread_exits() {
        let (source, feed) = source(None);
        let (tx, rx) = mpsc::channel();
        source
            .start_delivery(Duration::ZERO, move |frame| {
                let _ = tx.send(frame.is_some());
            })
            .unwrap();

        feed.inject_failure("bus reset");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
        // The sender is dropped with the exiting thread
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
        for _ in 0..100 {
            if !source.is_delivering() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!source.is_delivering());
    }

    #[test]
    fn test_stop_delivery_cancels_a_thread_blocked_on_a_stopped_stream() {
        let (source, _feed) = source(None);
        source.stop_stream().unwrap();
        source.start_delivery(Duration::ZERO, |_| {}).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        source.stop_delivery();
        assert!(!source.is_delivering());
    }

    #[test]
    fn test_direct_gets_are_refused_while_delivering() {
        let (source, _feed) = source(None);
        source.start_delivery(Duration::ZERO, |_| {}).unwrap();
        let mut buffer = source.new_buffer();
        assert!(matches!(
            source.get_next_frame(&mut buffer),
            Err(crate::error::FrameError::DeliveryRunning)
        ));
        assert!(matches!(
            source.start_delivery(Duration::ZERO, |_| {}),
            Err(crate::error::FrameError::DeliveryRunning)
        ));
        drop(source);
    }
}
