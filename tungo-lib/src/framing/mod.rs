//! Length-delimited record framing over byte-stream transports.
//!
//! Every record on a stream transport is a 2-byte big-endian length
//! prefix followed by that many payload bytes. The codec is stateless
//! beyond the wrapped transport: it never buffers a partial frame across
//! calls, so a failed read leaves the stream desynchronized and the only
//! safe recovery is to close the connection.

mod cap;
mod deadline;
mod framed;

pub use cap::{FrameCap, MAX_FRAME_CAP};
pub use deadline::DeadlineStream;
pub use framed::{FrameReader, FrameWriter, LENGTH_PREFIX_LEN};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame cap must be positive")]
    ZeroCap,

    #[error("negative frame length: {0}")]
    NegativeLength(i64),

    #[error("frame length {len} exceeds cap {cap}")]
    CapExceeded { len: i64, cap: usize },

    #[error("zero-length frame")]
    ZeroLengthFrame,

    #[error("invalid length prefix")]
    InvalidLengthPrefix,

    #[error("frame of {frame} bytes does not fit buffer of {buf} bytes")]
    ShortBuffer { frame: usize, buf: usize },

    #[error("transport accepted zero bytes mid-write")]
    ShortWrite,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
