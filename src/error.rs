use thiserror::Error;

/// Why `deallocate` refused a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InvalidFreeReason {
  /// No span was ever indexed at the pointer's page.
  #[error("address is not owned by the heap")]
  Unmapped,
  /// The owning span is free (double free, or a stale pointer).
  #[error("owning span is not in use")]
  NotInUse,
  /// Raw page allocations must be freed through their first byte.
  #[error("pointer is not the start of its page allocation")]
  NotSpanStart,
  /// The pointer falls inside a small object instead of at its start.
  #[error("pointer is not aligned to an object boundary")]
  Misaligned,
  /// The pointer lies in the slack past the last object carved from its span.
  #[error("pointer lies past the last object of its span")]
  PastLastObject,
  /// The object is already on a free list.
  #[error("object is already free")]
  DoubleFree,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
  #[error("out of memory: could not map {bytes} bytes")]
  OutOfMemory { bytes: usize },
  #[error("invalid free of {addr:#x}: {reason}")]
  InvalidFree {
    addr: usize,
    reason: InvalidFreeReason,
  },
  #[error("invalid request: {0}")]
  InvalidRequest(&'static str),
  #[error("invariant violated: {0}")]
  InvariantViolation(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Bails out of a `check_state` style function with an `InvariantViolation`.
macro_rules! ensure {
  ($cond:expr, $($arg:tt)+) => {
    if !$cond {
      return Err($crate::Error::InvariantViolation(format!($($arg)+)));
    }
  };
}

pub(crate) use ensure;
