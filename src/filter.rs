//! deadband filter: forward a reading only when it moved far enough from the
//! last forwarded one.

/// default threshold for every sensor
pub const DEFAULT_THRESHOLD: f64 = 0.001;

#[derive(Debug, Clone, Copy)]
pub struct Deadband {
    threshold: f64,
    last_sent: f64,
}

impl Deadband {
    /// starts from 0.0, so a first reading of exactly 0.0 is not forwarded
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last_sent: 0.0,
        }
    }

    pub fn changed(&self, value: f64) -> bool {
        (value - self.last_sent).abs() > self.threshold
    }

    /// returns true and remembers `value` if it should be forwarded
    pub fn update(&mut self, value: f64) -> bool {
        if self.changed(value) {
            self.last_sent = value;
            true
        } else {
            false
        }
    }

    pub fn last_sent(&self) -> f64 {
        self.last_sent
    }
}

impl Default for Deadband {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reading_compares_against_zero() {
        let mut band = Deadband::default();
        assert!(!band.update(0.0));
        assert!(band.update(21.5));
        assert_eq!(band.last_sent(), 21.5);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut band = Deadband::new(0.5);
        assert!(band.update(10.0));
        assert!(!band.update(10.5));
        assert!(!band.update(9.5));
        assert!(band.update(10.6));
    }

    #[test]
    fn test_small_drift_does_not_accumulate() {
        // last_sent only moves on a forward, so creeping drift eventually trips it
        let mut band = Deadband::default();
        assert!(band.update(1.0));
        assert!(!band.update(1.0006));
        assert!(!band.update(1.0009));
        assert!(band.update(1.0012));
        assert_eq!(band.last_sent(), 1.0012);
    }

    #[test]
    fn test_send_iff_delta_exceeds_default() {
        let pairs = [
            (0.0, 0.0, false),
            (0.0, 0.01, true),
            (5.0, 5.0005, false),
            (5.0, 4.99, true),
            (-2.0, -2.0, false),
            (-2.0, 2.0, true),
        ];
        for (prev, next, expected) in pairs {
            let mut band = Deadband::default();
            band.update(prev);
            // force the stored value even when prev is within the band of zero
            band.last_sent = prev;
            assert_eq!(band.update(next), expected, "{} -> {}", prev, next);
        }
    }
}
