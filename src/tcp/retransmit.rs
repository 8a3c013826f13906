//! RFC 6298 retransmission-timeout estimation and RFC 5681-style congestion
//! control (§4.5): slow start below `ssthresh`, additive increase above it,
//! multiplicative decrease on timeout.

use std::time::Duration;

pub const INITIAL_RTO: Duration = Duration::from_secs(1);
pub const MIN_RTO: Duration = Duration::from_millis(200);
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Smoothed round-trip time and its variance (RFC 6298 §2).
#[derive(Clone, Copy, Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator { srtt: None, rttvar: Duration::ZERO, rto: INITIAL_RTO }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Fold one RTT sample from a segment that was never retransmitted
    /// (Karn's algorithm: ambiguous samples from retransmitted segments
    /// must never reach this method).
    pub fn sample(&mut self, measured: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(measured);
                self.rttvar = measured / 2;
            }
            Some(srtt) => {
                let delta = if measured > srtt { measured - srtt } else { srtt - measured };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + measured) / 8);
            }
        }
        let rto = self.srtt.unwrap() + self.rttvar * 4;
        self.rto = rto.clamp(MIN_RTO, MAX_RTO);
    }

    /// Exponential backoff on a retransmission timeout (RFC 6298 §5.5).
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Congestion window and slow-start threshold, tracked in bytes.
#[derive(Clone, Copy, Debug)]
pub struct CongestionController {
    pub cwnd: u32,
    pub ssthresh: u32,
    mss: u32,
}

impl CongestionController {
    pub fn new(mss: u16) -> Self {
        let mss = mss.max(1) as u32;
        CongestionController { cwnd: mss, ssthresh: u32::MAX, mss }
    }

    /// An ACK advanced SND.UNA: slow-start grows `cwnd` by one MSS per ACK
    /// until `ssthresh`, then AIMD grows it by `mss*mss/cwnd` per ACK.
    pub fn on_ack(&mut self) {
        if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_add(self.mss);
        } else {
            let increment = ((self.mss as u64 * self.mss as u64) / self.cwnd.max(1) as u64).max(1) as u32;
            self.cwnd = self.cwnd.saturating_add(increment);
        }
    }

    /// Retransmission timeout fired: collapse to one segment and remember
    /// half the outstanding flight as the new slow-start threshold.
    pub fn on_timeout(&mut self, flight_size: u32) {
        self.ssthresh = (flight_size / 2).max(2 * self.mss);
        self.cwnd = self.mss;
    }

    pub fn usable_window(&self, snd_wnd: u32) -> u32 {
        self.cwnd.min(snd_wnd)
    }
}
