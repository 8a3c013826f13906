//! TCP connection engine (§4.5): the RFC 793/9293 state machine, RFC 6298
//! retransmission timing, RFC 5681 congestion control, and per-connection
//! timers. `socket::tcp` drives one [`Tcb`] per connection and a listener
//! `Tcb` per bound LISTEN socket.

mod retransmit;
mod state;
mod tcb;
mod timers;

pub use retransmit::{CongestionController, RttEstimator};
pub use state::{seq_gt, seq_gte, seq_lt, seq_lte, TcpState};
pub use tcb::{SegmentOutcome, Tcb, MAX_SEND_BUFFER, OUR_WINDOW_SHIFT, RECV_BUFFER_CAP};
pub use timers::Timers;
