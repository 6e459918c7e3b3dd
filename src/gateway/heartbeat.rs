use std::time::Duration;
use tokio::time::Instant;

/// Ping/pong bookkeeping for one session's write pump.
///
/// The write pump sends a ping every `interval`. The earliest unanswered
/// ping is remembered; once a pong arrives at or after it the session is
/// considered live again. A ping left unanswered for longer than `timeout`
/// means the connection is half-open.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    outstanding_since: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            outstanding_since: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ping_sent(&mut self, at: Instant) {
        if self.outstanding_since.is_none() {
            self.outstanding_since = Some(at);
        }
    }

    /// Feed the time of the latest pong seen by the read pump.
    pub fn pong_received(&mut self, at: Instant) {
        if matches!(self.outstanding_since, Some(since) if at >= since) {
            self.outstanding_since = None;
        }
    }

    /// When the earliest unanswered ping expires, if one is outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding_since.map(|since| since + self.timeout)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(Duration::from_secs(30), Duration::from_secs(60))
    }

    #[test]
    fn test_fresh_heartbeat_is_not_overdue() {
        let hb = heartbeat();
        assert!(hb.deadline().is_none());
        assert!(!hb.is_overdue(Instant::now() + Duration::from_secs(600)));
    }

    #[test]
    fn test_unanswered_ping_becomes_overdue() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.ping_sent(t0);
        assert!(!hb.is_overdue(t0 + Duration::from_secs(59)));
        assert!(hb.is_overdue(t0 + Duration::from_secs(60)));
        assert!(hb.is_overdue(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_deadline_is_ping_plus_timeout() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.ping_sent(t0);
        assert_eq!(hb.deadline(), Some(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_pong_clears_outstanding_ping() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.ping_sent(t0);
        hb.pong_received(t0 + Duration::from_secs(1));
        assert!(hb.deadline().is_none());
        assert!(!hb.is_overdue(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn test_stale_pong_does_not_count() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.ping_sent(t0 + Duration::from_secs(30));
        hb.pong_received(t0);
        assert!(hb.deadline().is_some());
    }

    #[test]
    fn test_repeated_pings_keep_earliest() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.ping_sent(t0);
        hb.ping_sent(t0 + Duration::from_secs(30));
        assert!(hb.is_overdue(t0 + Duration::from_secs(61)));
    }
}
