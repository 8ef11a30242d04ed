//! STCP: a reliable, in-order byte-stream transport layered above a
//! lossless, ordered packet substrate.
//!
//! One engine instance is spawned per connection via [`run`]. The engine
//! owns the connection context and drives a single-threaded event loop:
//! three-way open, window-bounded data transfer with cumulative
//! acknowledgments, and a four-way close ending in a 2-MSL timed wait.
//! Everything outside the engine, the packet substrate below, the
//! application byte stream above and the multiplexer joining them, is
//! reached through the [`Channel`] trait; [`loopback`] provides the
//! in-process implementation used by the tests and the demo.

mod err;
pub use err::Error;

pub mod loopback;

mod stcp;
pub use stcp::{
    in_window, run, seq_between, seq_cmp, seq_lt, Channel, Config, Events, PortPair, Role, State,
    LOCAL_WIN, MSL, MSS,
};
