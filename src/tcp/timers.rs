//! Per-connection timer deadlines (§4.5, §5): retransmit, persist,
//! delayed-ack, and time-wait. Each TCB owns one `Timers`; a single driver
//! polls all connections rather than parking a thread per timer.

use std::time::{Duration, Instant};

pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(200);
pub const PERSIST_INITIAL: Duration = Duration::from_secs(1);
pub const PERSIST_MAX: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Default)]
pub struct Timers {
    pub retransmit_deadline: Option<Instant>,
    pub persist_deadline: Option<Instant>,
    persist_backoff: Duration,
    pub delayed_ack_deadline: Option<Instant>,
    pub time_wait_deadline: Option<Instant>,
}

impl Timers {
    pub fn arm_retransmit(&mut self, now: Instant, rto: Duration) {
        self.retransmit_deadline = Some(now + rto);
    }

    pub fn disarm_retransmit(&mut self) {
        self.retransmit_deadline = None;
    }

    /// Arm or re-arm the persist timer, exponentially backing off each time
    /// it is rearmed without an intervening `disarm_persist`.
    pub fn arm_persist(&mut self, now: Instant) {
        self.persist_backoff = if self.persist_backoff.is_zero() { PERSIST_INITIAL } else { (self.persist_backoff * 2).min(PERSIST_MAX) };
        self.persist_deadline = Some(now + self.persist_backoff);
    }

    pub fn disarm_persist(&mut self) {
        self.persist_deadline = None;
        self.persist_backoff = Duration::ZERO;
    }

    pub fn arm_delayed_ack(&mut self, now: Instant) {
        if self.delayed_ack_deadline.is_none() {
            self.delayed_ack_deadline = Some(now + DELAYED_ACK_TIMEOUT);
        }
    }

    pub fn disarm_delayed_ack(&mut self) {
        self.delayed_ack_deadline = None;
    }

    pub fn arm_time_wait(&mut self, now: Instant, msl: Duration) {
        self.time_wait_deadline = Some(now + msl * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_backoff_doubles_each_rearm() {
        let mut t = Timers::default();
        let now = Instant::now();
        t.arm_persist(now);
        let first = t.persist_deadline.unwrap();
        t.arm_persist(now);
        let second = t.persist_deadline.unwrap();
        assert!(second - now > first - now);
    }

    #[test]
    fn delayed_ack_does_not_rearm_while_pending() {
        let mut t = Timers::default();
        let now = Instant::now();
        t.arm_delayed_ack(now);
        let first = t.delayed_ack_deadline;
        t.arm_delayed_ack(now + Duration::from_millis(50));
        assert_eq!(t.delayed_ack_deadline, first);
    }
}
