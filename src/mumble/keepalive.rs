use std::time::Duration;

/// Default delay between a ping reply and the next ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Ping scheduling on a clock measured from connection start.
///
/// At most one ping is outstanding. If no reply arrives before the next
/// deadline the ping is reissued, so a lost packet cannot stall the cycle.
#[derive(Debug)]
pub struct KeepAlive {
    interval: Duration,
    outstanding: Option<u64>,
    next_due: Option<Duration>,
    last_rtt: Option<Duration>,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new(PING_INTERVAL)
    }
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            outstanding: None,
            next_due: None,
            last_rtt: None,
        }
    }

    /// Begins the cycle. Returns the timestamp to ping with, or `None` if one is already in flight.
    pub fn start(&mut self, now: Duration) -> Option<u64> {
        if self.outstanding.is_some() {
            return None;
        }
        Some(self.issue(now))
    }

    /// Returns a timestamp when a ping is due at `now`.
    pub fn poll(&mut self, now: Duration) -> Option<u64> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        if let Some(stale) = self.outstanding {
            log::warn!("ping {stale} went unanswered, resending");
        }
        Some(self.issue(now))
    }

    /// Handles an echoed timestamp. Returns the round trip when it matches the outstanding ping.
    pub fn on_reply(&mut self, echoed: u64, now: Duration) -> Option<Duration> {
        if self.outstanding != Some(echoed) {
            log::warn!(
                "ping reply {echoed} does not match outstanding ping {:?}",
                self.outstanding
            );
            return None;
        }
        let rtt = Duration::from_millis(millis(now).saturating_sub(echoed));
        self.outstanding = None;
        self.last_rtt = Some(rtt);
        self.next_due = Some(now + self.interval);
        Some(rtt)
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    fn issue(&mut self, now: Duration) -> u64 {
        let timestamp = millis(now);
        self.outstanding = Some(timestamp);
        self.next_due = Some(now + self.interval);
        timestamp
    }
}

fn millis(at: Duration) -> u64 {
    u64::try_from(at.as_millis()).unwrap_or(u64::MAX)
}
