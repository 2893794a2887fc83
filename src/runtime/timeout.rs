//! Poll wait bound from a set of absolute deadlines.
//!
//! A `Timeout` is seeded with the current time and an optional ceiling, then
//! fed every pending deadline. It keeps the smallest remaining duration and
//! remembers whether any deadline has already passed, so the caller can tell
//! "expire now" apart from "wait forever".

use std::time::{Duration, Instant};

/// Result of comparing a single deadline with the reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The deadline is at or before the reference time.
    Expired,
    /// Time left until the deadline.
    Remaining(Duration),
}

/// How long the poller may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBound {
    /// At least one deadline already passed; do not block.
    Expired,
    /// Block for at most this long.
    Wait(Duration),
    /// No deadline and no ceiling.
    Forever,
}

impl WaitBound {
    /// Timeout argument for `mio::Poll::poll`.
    pub fn as_poll_timeout(self) -> Option<Duration> {
        match self {
            WaitBound::Expired => Some(Duration::ZERO),
            WaitBound::Wait(d) => Some(d),
            WaitBound::Forever => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeout {
    now: Instant,
    current: Option<Duration>,
    expired: bool,
}

impl Timeout {
    /// Start tracking relative to `now` with no pending deadline.
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            current: None,
            expired: false,
        }
    }

    /// Cap the wait at `ceiling` even when no deadline is pending.
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.current = Some(ceiling);
        self
    }

    /// Fold one deadline into the bound.
    pub fn update(&mut self, deadline: Instant) -> Expiry {
        if deadline <= self.now {
            self.expired = true;
            return Expiry::Expired;
        }

        let remaining = deadline - self.now;
        self.current = Some(match self.current {
            Some(current) => current.min(remaining),
            None => remaining,
        });
        Expiry::Remaining(remaining)
    }

    /// Bound over every deadline seen so far.
    pub fn bound(&self) -> WaitBound {
        if self.expired {
            return WaitBound::Expired;
        }
        match self.current {
            Some(d) => WaitBound::Wait(d),
            None => WaitBound::Forever,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadlines_waits_forever() {
        let timeout = Timeout::new(Instant::now());
        assert_eq!(timeout.bound(), WaitBound::Forever);
        assert_eq!(WaitBound::Forever.as_poll_timeout(), None);
    }

    #[test]
    fn test_picks_smallest_remaining() {
        let now = Instant::now();
        let mut timeout = Timeout::new(now);
        for deadline in [
            now + Duration::from_secs(5),
            now + Duration::from_millis(30),
            now + Duration::from_secs(1),
        ] {
            timeout.update(deadline);
        }
        assert_eq!(timeout.bound(), WaitBound::Wait(Duration::from_millis(30)));
    }

    #[test]
    fn test_past_deadline_expires_immediately() {
        let now = Instant::now() + Duration::from_secs(1);
        let mut timeout = Timeout::new(now);

        assert_eq!(
            timeout.update(now + Duration::from_secs(2)),
            Expiry::Remaining(Duration::from_secs(2))
        );
        assert_eq!(timeout.update(now - Duration::from_millis(1)), Expiry::Expired);
        assert_eq!(timeout.bound(), WaitBound::Expired);
        assert_eq!(timeout.bound().as_poll_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_deadline_equal_to_now_is_expired() {
        let now = Instant::now();
        let mut timeout = Timeout::new(now);
        assert_eq!(timeout.update(now), Expiry::Expired);
    }

    #[test]
    fn test_ceiling_bounds_wait() {
        let now = Instant::now();
        let mut timeout = Timeout::new(now).with_ceiling(Duration::from_secs(10));
        assert_eq!(timeout.bound(), WaitBound::Wait(Duration::from_secs(10)));

        timeout.update(now + Duration::from_secs(60));
        assert_eq!(timeout.bound(), WaitBound::Wait(Duration::from_secs(10)));

        timeout.update(now + Duration::from_millis(250));
        assert_eq!(timeout.bound(), WaitBound::Wait(Duration::from_millis(250)));
    }
}
