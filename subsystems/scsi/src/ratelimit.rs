//! # Coalescing Rate Limiter
//!
//! Repeated diagnostics (adapter rejections, mostly) are coalesced into one
//! message per window carrying the number of occurrences, so a misbehaving
//! backend cannot flood the log from the issue path.

use spin::Mutex;
use strata_hal::Nanoseconds;

const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    start: Nanoseconds,
    count: u64,
}

/// Event coalescer with a fixed time window
///
/// Events inside an open window are counted silently. The count surfaces
/// once, when the window is observed to have closed, either by the next
/// event or by an explicit [`RateLimited::flush`].
#[derive(Debug)]
pub struct RateLimited {
    window_ns: u64,
    state: Mutex<Window>,
}

impl RateLimited {
    /// Create a coalescer with a `window_ms` millisecond window
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ns: window_ms * NS_PER_MS,
            state: Mutex::new(Window::default()),
        }
    }

    /// Record one event at time `now`
    ///
    /// Returns `Some(count)` when this event observes a closed window; the
    /// caller emits exactly one diagnostic carrying that count. The current
    /// event opens the next window.
    pub fn note(&self, now: Nanoseconds) -> Option<u64> {
        let mut window = self.state.lock();
        if window.count == 0 {
            *window = Window {
                start: now,
                count: 1,
            };
            return None;
        }
        if now.saturating_sub(window.start) >= self.window_ns {
            let coalesced = window.count;
            *window = Window {
                start: now,
                count: 1,
            };
            Some(coalesced)
        } else {
            window.count += 1;
            None
        }
    }

    /// Surface the pending count if the window has closed without a new
    /// event
    pub fn flush(&self, now: Nanoseconds) -> Option<u64> {
        let mut window = self.state.lock();
        if window.count > 0 && now.saturating_sub(window.start) >= self.window_ns {
            let coalesced = window.count;
            *window = Window::default();
            Some(coalesced)
        } else {
            None
        }
    }

    /// Events counted in the currently open window
    pub fn pending(&self) -> u64 {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_inside_window_stay_silent() {
        let limiter = RateLimited::new(10);
        for t in 0..100 {
            assert_eq!(limiter.note(t * NS_PER_MS / 10), None);
        }
        assert_eq!(limiter.pending(), 100);
    }

    #[test]
    fn window_close_reports_full_count_once() {
        let limiter = RateLimited::new(10);
        for _ in 0..100 {
            assert_eq!(limiter.note(0), None);
        }
        assert_eq!(limiter.flush(10 * NS_PER_MS), Some(100));
        assert_eq!(limiter.flush(20 * NS_PER_MS), None);
    }

    #[test]
    fn late_event_emits_and_reopens() {
        let limiter = RateLimited::new(10);
        assert_eq!(limiter.note(0), None);
        assert_eq!(limiter.note(1), None);
        assert_eq!(limiter.note(11 * NS_PER_MS), Some(2));
        assert_eq!(limiter.pending(), 1);
    }
}
