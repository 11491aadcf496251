//! Certificate-expiry threshold tracking.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Default day thresholds, most urgent last.
pub const DEFAULT_SSL_THRESHOLDS: [i64; 4] = [30, 14, 7, 1];

/// Tracks which day thresholds have already been notified for the current
/// certificate. Resets entirely when the observed expiry changes, so a
/// renewed certificate re-arms the full ladder.
#[derive(Debug, Default)]
pub struct SslLadder {
    cert_expiry: Option<DateTime<Utc>>,
    notified: HashSet<i64>,
}

impl SslLadder {
    /// Compare the observed expiry against the ladder. Returns the most
    /// urgent threshold already crossed (the smallest threshold that is
    /// still >= days-until-expiry), at most once per threshold per
    /// certificate.
    pub fn observe(
        &mut self,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
        thresholds: &[i64],
    ) -> Option<i64> {
        if self.cert_expiry != Some(expiry) {
            self.cert_expiry = Some(expiry);
            self.notified.clear();
        }

        let days_until = (expiry - now).num_days();
        let crossed = thresholds
            .iter()
            .copied()
            .filter(|t| *t >= days_until)
            .min()?;

        if self.notified.insert(crossed) {
            Some(crossed)
        } else {
            None
        }
    }

    /// Expiry of the certificate currently tracked, if any.
    pub fn cert_expiry(&self) -> Option<DateTime<Utc>> {
        self.cert_expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_matches_smallest_threshold_not_yet_passed() {
        let now = Utc::now();
        let mut ladder = SslLadder::default();

        let expiry = now + Duration::days(25);
        assert_eq!(ladder.observe(expiry, now, &DEFAULT_SSL_THRESHOLDS), Some(30));
    }

    #[test]
    fn test_expired_certificate_matches_most_urgent_rung() {
        let now = Utc::now();
        let mut ladder = SslLadder::default();

        let expiry = now - Duration::days(5);
        assert_eq!(ladder.observe(expiry, now, &DEFAULT_SSL_THRESHOLDS), Some(1));
    }

    #[test]
    fn test_far_future_expiry_is_quiet() {
        let now = Utc::now();
        let mut ladder = SslLadder::default();

        let expiry = now + Duration::days(200);
        assert_eq!(ladder.observe(expiry, now, &DEFAULT_SSL_THRESHOLDS), None);
    }

    #[test]
    fn test_each_threshold_notifies_once() {
        let now = Utc::now();
        let mut ladder = SslLadder::default();
        let expiry = now + Duration::days(25);

        assert_eq!(ladder.observe(expiry, now, &DEFAULT_SSL_THRESHOLDS), Some(30));
        assert_eq!(ladder.observe(expiry, now, &DEFAULT_SSL_THRESHOLDS), None);

        // Time passes; the certificate crosses the next rung.
        let later = now + Duration::days(12);
        assert_eq!(ladder.observe(expiry, later, &DEFAULT_SSL_THRESHOLDS), Some(14));
        assert_eq!(ladder.observe(expiry, later, &DEFAULT_SSL_THRESHOLDS), None);
    }

    #[test]
    fn test_renewal_rearms_ladder() {
        let now = Utc::now();
        let mut ladder = SslLadder::default();

        let old_expiry = now + Duration::days(3);
        assert_eq!(ladder.observe(old_expiry, now, &DEFAULT_SSL_THRESHOLDS), Some(7));

        // Renewed: tracker resets and stays quiet until the new certificate
        // approaches a rung again.
        let new_expiry = now + Duration::days(90);
        assert_eq!(ladder.observe(new_expiry, now, &DEFAULT_SSL_THRESHOLDS), None);
        assert_eq!(ladder.cert_expiry(), Some(new_expiry));

        let near_end = now + Duration::days(89);
        assert_eq!(
            ladder.observe(new_expiry, near_end, &DEFAULT_SSL_THRESHOLDS),
            Some(1)
        );
    }
}
