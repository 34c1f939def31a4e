//! Heartbeat liveness monitor.
//!
//! While a connection is active the monitor alternates between two timers:
//! the ping timer, `interval` after activation or after the last pong, and
//! the pong deadline, `timeout` after a ping went out. The owner polls
//! [`HeartbeatMonitor::next_deadline`] and feeds fires back through
//! [`HeartbeatMonitor::on_timer`]; fires are checked against the current
//! state, so a stale one does nothing.

use std::time::Duration;
use tokio::time::Instant;

/// What the owner should do after a timer fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a PING with this correlation id
    SendPing(u64),
    /// Pong deadline missed, the peer is gone
    TimedOut,
    /// Nothing due
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    corr_id: u64,
    sent_at: Instant,
    deadline: Instant,
}

/// Per-connection ping/pong tracker
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    running: bool,
    next_ping_at: Option<Instant>,
    outstanding: Option<OutstandingPing>,
    next_corr_id: u64,
    last_ping_sent_at: Option<Instant>,
    last_pong_received_at: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            running: false,
            next_ping_at: None,
            outstanding: None,
            next_corr_id: 1,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            last_rtt: None,
        }
    }

    /// Arm the ping timer
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.outstanding = None;
        self.next_ping_at = Some(now + self.interval);
    }

    /// Cancel both timers
    pub fn stop(&mut self) {
        self.running = false;
        self.next_ping_at = None;
        self.outstanding = None;
    }

    /// Whether the monitor is armed
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Next instant at which [`HeartbeatMonitor::on_timer`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        self.outstanding
            .map(|ping| ping.deadline)
            .or(self.next_ping_at)
    }

    /// Evaluate timers at `now`
    pub fn on_timer(&mut self, now: Instant) -> HeartbeatAction {
        if !self.running {
            return HeartbeatAction::Idle;
        }

        if let Some(ping) = self.outstanding {
            if now >= ping.deadline {
                self.stop();
                return HeartbeatAction::TimedOut;
            }
            return HeartbeatAction::Idle;
        }

        match self.next_ping_at {
            Some(at) if now >= at => {
                let corr_id = self.next_corr_id;
                self.next_corr_id = self.next_corr_id.wrapping_add(1);
                self.next_ping_at = None;
                self.outstanding = Some(OutstandingPing {
                    corr_id,
                    sent_at: now,
                    deadline: now + self.timeout,
                });
                self.last_ping_sent_at = Some(now);
                HeartbeatAction::SendPing(corr_id)
            }
            _ => HeartbeatAction::Idle,
        }
    }

    /// Handle a PONG, returning the round trip time when it answers the
    /// outstanding ping. Unknown correlation ids are ignored.
    pub fn on_pong(&mut self, corr_id: u64, now: Instant) -> Option<Duration> {
        if !self.running {
            return None;
        }
        let ping = self.outstanding.filter(|ping| ping.corr_id == corr_id)?;

        let rtt = now.saturating_duration_since(ping.sent_at);
        self.outstanding = None;
        self.last_pong_received_at = Some(now);
        self.last_rtt = Some(rtt);
        self.next_ping_at = Some(now + self.interval);
        Some(rtt)
    }

    /// When the last ping went out
    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// When the last matching pong arrived
    pub fn last_pong_received_at(&self) -> Option<Instant> {
        self.last_pong_received_at
    }

    /// Most recent round trip time
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_is_inert() {
        let mut monitor = HeartbeatMonitor::new(INTERVAL, TIMEOUT);
        assert_eq!(monitor.next_deadline(), None);
        assert_eq!(
            monitor.on_timer(Instant::now() + INTERVAL * 10),
            HeartbeatAction::Idle
        );
        assert_eq!(monitor.on_pong(1, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_timeout() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, TIMEOUT);
        monitor.start(start);
        assert_eq!(monitor.next_deadline(), Some(start + INTERVAL));

        assert_eq!(
            monitor.on_timer(start + INTERVAL - Duration::from_millis(1)),
            HeartbeatAction::Idle
        );
        assert_eq!(
            monitor.on_timer(start + INTERVAL),
            HeartbeatAction::SendPing(1)
        );
        assert_eq!(monitor.last_ping_sent_at(), Some(start + INTERVAL));
        assert_eq!(monitor.next_deadline(), Some(start + INTERVAL + TIMEOUT));

        assert_eq!(
            monitor.on_timer(start + INTERVAL + TIMEOUT - Duration::from_millis(1)),
            HeartbeatAction::Idle
        );
        assert_eq!(
            monitor.on_timer(start + INTERVAL + TIMEOUT),
            HeartbeatAction::TimedOut
        );
        assert!(!monitor.is_running());
        assert_eq!(monitor.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_pong_rearms_ping_timer() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, TIMEOUT);
        monitor.start(start);

        let ping_at = start + INTERVAL;
        let HeartbeatAction::SendPing(corr_id) = monitor.on_timer(ping_at) else {
            panic!("expected a ping");
        };

        // stray pong
        assert_eq!(monitor.on_pong(corr_id + 100, ping_at), None);
        assert_eq!(monitor.next_deadline(), Some(ping_at + TIMEOUT));

        let pong_at = ping_at + Duration::from_millis(40);
        assert_eq!(
            monitor.on_pong(corr_id, pong_at),
            Some(Duration::from_millis(40))
        );
        assert_eq!(monitor.last_pong_received_at(), Some(pong_at));
        assert_eq!(monitor.last_rtt(), Some(Duration::from_millis(40)));
        assert_eq!(monitor.next_deadline(), Some(pong_at + INTERVAL));

        // duplicate pong is ignored
        assert_eq!(monitor.on_pong(corr_id, pong_at), None);

        assert_eq!(
            monitor.on_timer(pong_at + INTERVAL),
            HeartbeatAction::SendPing(corr_id + 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_outstanding_ping() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, TIMEOUT);
        monitor.start(start);
        monitor.on_timer(start + INTERVAL);
        monitor.stop();
        assert_eq!(
            monitor.on_timer(start + INTERVAL + TIMEOUT),
            HeartbeatAction::Idle
        );
    }
}
