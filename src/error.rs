use crate::segment::Flag;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation not valid in current state")]
    BadState,

    #[error("segment flag {0:?} must not carry a payload")]
    WrongFlag(Flag),

    #[error("payload of {0} bytes exceeds the maximum segment payload of {1} bytes")]
    OversizedPayload(usize, usize),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configured window of {0} is invalid; must be nonzero")]
    InvalidWindow(u8),
}
