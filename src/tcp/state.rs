//! RFC 793/9293 connection states (§4.5) and wrapping sequence-number
//! comparisons used throughout the engine.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived)
    }
}

/// `a` is strictly after `b` in 32-bit wrapping sequence space.
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_gte(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && !seq_gt(a, b)
}

pub fn seq_lte(a: u32, b: u32) -> bool {
    a == b || !seq_gt(a, b)
}
