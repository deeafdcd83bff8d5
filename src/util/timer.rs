use std::time::Instant;

use chrono::Local;

/// Monotonic nanosecond stopwatch.
///
/// Backed by `Instant` (CLOCK_MONOTONIC on Linux); `start`/`elapsed_ns`
/// cost tens of nanoseconds, cheap enough to bracket single cache-line
/// accesses. One instance per call site, no shared state.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Restart the stopwatch.
    #[inline(always)]
    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Nanoseconds since the last `start` (or construction).
    #[inline(always)]
    pub fn elapsed_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Wall-clock tag used to name result directories, e.g. `07311433022026`.
    pub fn wall_clock_tag() -> String {
        Local::now().format("%m%d%Y%H%M%S").to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_monotonic() {
        let mut timer = Timer::new();
        timer.start();
        let first = timer.elapsed_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = timer.elapsed_ns();
        assert!(second > first);
        assert!(second >= 2_000_000);
    }

    #[test]
    fn wall_clock_tag_is_all_digits() {
        let tag = Timer::wall_clock_tag();
        assert_eq!(tag.len(), 14);
        assert!(tag.chars().all(|c| c.is_ascii_digit()));
    }
}
