use std::time::Duration;

mod chan;
mod engine;
mod seq;
mod tcb;
mod wire;

pub use chan::{Channel, Events};
pub use engine::run;
pub use seq::{in_window, seq_between, seq_cmp, seq_lt};
pub use tcb::State;

/// Largest payload carried by a single segment.
pub const MSS: usize = 536;

/// Receive window advertised in every outbound segment.
pub const LOCAL_WIN: u16 = 3072;

/// Maximum segment lifetime. The timed-wait phase of a close lasts twice
/// this long.
pub const MSL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// Source and destination identifiers carried in every segment header.
/// The engine copies them onto the wire and never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub ports: PortPair,
    pub local_win: u16,
    /// Pin the initial send sequence number to 1 instead of drawing it at
    /// random from `[0, 255]`.
    pub deterministic_iss: bool,
    pub msl: Duration,
}

impl Config {
    pub fn active(ports: PortPair) -> Self {
        Config::new(Role::Active, ports)
    }

    pub fn passive(ports: PortPair) -> Self {
        Config::new(Role::Passive, ports)
    }

    fn new(role: Role, ports: PortPair) -> Self {
        Config {
            role,
            ports,
            local_win: LOCAL_WIN,
            deterministic_iss: false,
            msl: MSL,
        }
    }
}
