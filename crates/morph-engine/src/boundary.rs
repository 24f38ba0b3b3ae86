use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive render failures before a unit is rolled back.
pub const CRASH_THRESHOLD: u32 = 3;

/// Counts consecutive render crashes for one unit. A successful render
/// resets the count.
#[derive(Debug)]
pub struct CrashBoundary {
    consecutive: AtomicU32,
    threshold: u32,
}

impl Default for CrashBoundary {
    fn default() -> Self {
        Self::new(CRASH_THRESHOLD)
    }
}

impl CrashBoundary {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold,
        }
    }

    /// Record a crash and return the new consecutive count.
    pub fn record_crash(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn has_crashed(&self) -> bool {
        self.consecutive() > 0
    }

    pub fn should_roll_back(&self) -> bool {
        self.consecutive() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_reached_on_third_crash() {
        let boundary = CrashBoundary::default();
        assert_eq!(boundary.record_crash(), 1);
        assert_eq!(boundary.record_crash(), 2);
        assert!(!boundary.should_roll_back());
        assert_eq!(boundary.record_crash(), 3);
        assert!(boundary.should_roll_back());
    }

    #[test]
    fn success_resets() {
        let boundary = CrashBoundary::default();
        boundary.record_crash();
        boundary.record_crash();
        boundary.record_success();
        assert!(!boundary.has_crashed());
        assert_eq!(boundary.record_crash(), 1);
    }
}
