//! Error types shared by every subsystem in the pipeline.
//!
//! A transient `Wait` arm that the caller swallows and a `Fatal` arm that
//! propagates all the way out to `Pipeline::run`, rather than one flat
//! error type a caller has to pattern-match to tell the two apart.

use std::fmt;
use std::io;

pub type LoopResult<T> = Result<T, LoopError>;

/// Outcome of an I/O operation on one of the two endpoints.
#[derive(Debug)]
pub enum LoopError {
    /// `EAGAIN`/`EINTR`: return to the loop immediately, no state changed.
    Wait,
    /// Anything else: the pipeline must stop.
    Fatal(FatalReason),
}

#[derive(Debug)]
pub enum FatalReason {
    /// A read returned 0 bytes: the peer end of the fd is gone.
    PeerClosed,
    Io(io::ErrorKind),
    Rohc(String),
    ConfigMissing(&'static str),
    ResourceInit(&'static str),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::PeerClosed => write!(f, "peer closed the file descriptor"),
            FatalReason::Io(kind) => write!(f, "I/O error: {:?}", kind),
            FatalReason::Rohc(msg) => write!(f, "ROHC error: {}", msg),
            FatalReason::ConfigMissing(what) => write!(f, "missing configuration: {}", what),
            FatalReason::ResourceInit(what) => write!(f, "failed to initialize: {}", what),
        }
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Wait => write!(f, "would block"),
            LoopError::Fatal(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for FatalReason {}
impl std::error::Error for LoopError {}

impl From<io::Error> for LoopError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => LoopError::Wait,
            kind => LoopError::Fatal(FatalReason::Io(kind)),
        }
    }
}

impl From<FatalReason> for LoopError {
    #[inline]
    fn from(reason: FatalReason) -> Self {
        LoopError::Fatal(reason)
    }
}

pub trait LoopResultExt {
    /// `true` for anything other than a clean `Wait`.
    fn has_failed(&self) -> bool;
}

impl<T> LoopResultExt for LoopResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(LoopError::Wait))
    }
}
