use crate::stcp::State;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet channel error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment shorter than a header")]
    MalformedSegment,

    #[error("out-of-order payload: expected seq {expected}, got {got}")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("connection refused")]
    ConnectionRefused,

    #[error("segment not admissible in state {state:?}")]
    UnexpectedSegment { state: State },
}
