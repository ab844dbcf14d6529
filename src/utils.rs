use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Tracks delivered frames per second over a reporting window.
pub struct FpsCounter {
    frame_count: u32,
    total_frames: u64,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// Create a new FPS counter reporting once per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            frame_count: 0,
            total_frames: 0,
            last_time: Instant::now(),
            interval,
        }
    }

    /// Update the counter with a new frame.
    /// Returns Some(fps) if the reporting interval has passed, otherwise None.
    pub fn update(&mut self) -> Option<f32> {
        self.frame_count += 1;
        self.total_frames += 1;
        let elapsed = self.last_time.elapsed();

        if elapsed >= self.interval {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            self.frame_count = 0;
            self.last_time = Instant::now();
            Some(fps)
        } else {
            None
        }
    }

    /// Frames counted since creation.
    pub fn total(&self) -> u64 {
        self.total_frames
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_after_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_millis(50));
        assert!(counter.update().is_none());
        std::thread::sleep(Duration::from_millis(60));
        let fps = counter.update().unwrap();
        assert!(fps > 0.0);
        assert_eq!(counter.total(), 2);
        assert!(counter.update().is_none());
    }
}
