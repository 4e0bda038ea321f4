//! Device health monitoring
//!
//! Pure-logic monitor fed by every polling read that touches the output
//! backend. Easy to set, hard to clear: a lost device stays lost until a
//! deliberate backend reinitialization resets the monitor, which prevents
//! flapping while another exclusive-mode consumer still holds the hardware.

use crate::config::health::TRANSIENT_ERROR_THRESHOLD;

/// Classification of a backend failure at the component boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Another consumer holds exclusive access to the device
    Busy,
    /// The requested operation is already in effect
    AlreadyActive,
    /// Momentary failure not indicating device loss
    Transient,
    /// Anything else
    Other,
}

/// Tracks consecutive errors on backend reads and exposes the sticky
/// device-lost flag
#[derive(Debug, Clone)]
pub struct DeviceHealthMonitor {
    consecutive_errors: u32,
    last_error: Option<ErrorClass>,
    is_lost: bool,
    threshold: u32,
}

impl Default for DeviceHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHealthMonitor {
    pub fn new() -> Self {
        Self::with_threshold(TRANSIENT_ERROR_THRESHOLD)
    }

    /// Create a monitor with a custom transient-error threshold (for testing)
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            consecutive_errors: 0,
            last_error: None,
            is_lost: false,
            threshold,
        }
    }

    /// Record a failed backend read.
    ///
    /// Busy marks the device lost immediately: exclusive takeover is not
    /// transient. Other classes count toward the threshold first.
    pub fn record_error(&mut self, class: ErrorClass) {
        self.consecutive_errors += 1;
        self.last_error = Some(class);
        match class {
            ErrorClass::Busy => self.is_lost = true,
            _ => {
                if self.consecutive_errors > self.threshold {
                    self.is_lost = true;
                }
            }
        }
    }

    /// Record a successful backend read. Resets the error counter but never
    /// clears the lost flag.
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Whether the device is considered lost. Sticky until [`reset`](Self::reset).
    pub fn is_lost(&self) -> bool {
        self.is_lost
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_error(&self) -> Option<ErrorClass> {
        self.last_error
    }

    /// Full reset. Only called from a deliberate backend reinitialization
    /// path (device reselect, next Play after loss).
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
        self.is_lost = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> DeviceHealthMonitor {
        DeviceHealthMonitor::with_threshold(3)
    }

    // --- Initial state ---

    #[test]
    fn starts_healthy() {
        let m = monitor();
        assert!(!m.is_lost());
        assert_eq!(m.consecutive_errors(), 0);
        assert!(m.last_error().is_none());
    }

    // --- Busy errors ---

    #[test]
    fn busy_marks_lost_immediately() {
        let mut m = monitor();
        m.record_error(ErrorClass::Busy);
        assert!(m.is_lost());
        assert_eq!(m.consecutive_errors(), 1);
        assert_eq!(m.last_error(), Some(ErrorClass::Busy));
    }

    #[test]
    fn busy_after_successes_still_marks_lost() {
        let mut m = monitor();
        m.record_success();
        m.record_success();
        m.record_error(ErrorClass::Busy);
        assert!(m.is_lost());
    }

    // --- Transient errors ---

    #[test]
    fn transient_below_threshold_not_lost() {
        let mut m = monitor();
        for _ in 0..3 {
            m.record_error(ErrorClass::Transient);
        }
        assert!(!m.is_lost());
        assert_eq!(m.consecutive_errors(), 3);
    }

    #[test]
    fn transient_above_threshold_marks_lost() {
        let mut m = monitor();
        for _ in 0..4 {
            m.record_error(ErrorClass::Transient);
        }
        assert!(m.is_lost());
    }

    #[test]
    fn success_resets_transient_counter() {
        let mut m = monitor();
        m.record_error(ErrorClass::Transient);
        m.record_error(ErrorClass::Transient);
        m.record_success();
        assert_eq!(m.consecutive_errors(), 0);
        // Brief glitches self-heal: the next run of errors starts over
        for _ in 0..3 {
            m.record_error(ErrorClass::Transient);
        }
        assert!(!m.is_lost());
    }

    #[test]
    fn other_errors_count_like_transient() {
        let mut m = monitor();
        for _ in 0..4 {
            m.record_error(ErrorClass::Other);
        }
        assert!(m.is_lost());
    }

    // --- Sticky lost flag ---

    #[test]
    fn success_does_not_clear_lost() {
        let mut m = monitor();
        m.record_error(ErrorClass::Busy);
        assert!(m.is_lost());
        for _ in 0..10 {
            m.record_success();
        }
        assert!(m.is_lost(), "lost flag must survive successful reads");
        assert_eq!(m.consecutive_errors(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut m = monitor();
        m.record_error(ErrorClass::Busy);
        m.record_error(ErrorClass::Transient);
        m.reset();
        assert!(!m.is_lost());
        assert_eq!(m.consecutive_errors(), 0);
        assert!(m.last_error().is_none());
    }

    #[test]
    fn usable_again_after_reset() {
        let mut m = monitor();
        m.record_error(ErrorClass::Busy);
        m.reset();
        m.record_error(ErrorClass::Transient);
        assert!(!m.is_lost());
        m.record_error(ErrorClass::Busy);
        assert!(m.is_lost());
    }

    // --- last_error tracking ---

    #[test]
    fn last_error_tracks_most_recent() {
        let mut m = monitor();
        m.record_error(ErrorClass::Transient);
        assert_eq!(m.last_error(), Some(ErrorClass::Transient));
        m.record_error(ErrorClass::Busy);
        assert_eq!(m.last_error(), Some(ErrorClass::Busy));
        // Success keeps the last error for diagnostics
        m.record_success();
        assert_eq!(m.last_error(), Some(ErrorClass::Busy));
    }

    #[test]
    fn custom_threshold_zero_loses_on_first_transient() {
        let mut m = DeviceHealthMonitor::with_threshold(0);
        m.record_error(ErrorClass::Transient);
        assert!(m.is_lost());
    }

    #[test]
    fn error_class_eq_and_copy() {
        let c = ErrorClass::Busy;
        let copied = c;
        assert_eq!(c, copied);
        assert_ne!(ErrorClass::Busy, ErrorClass::Transient);
        let _ = format!("{:?}", ErrorClass::AlreadyActive);
    }
}
