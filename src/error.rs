//! The single result-code space shared by every kernel call (spec §7).
use core::fmt;

/// Every fallible kernel operation returns `Result<T, Error>`. Success
/// (`OK` in the TNKernel-style enumeration this is drawn from) is carried by
/// `Result::Ok` instead of a tenth variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The wait exceeded its deadline, or a polling call found nothing ready.
    Timeout,
    /// The operation would have made a count exceed its configured maximum.
    Overflow,
    /// Called from the wrong context (task vs. ISR) for this operation.
    WrongContext,
    /// The object is in a state that does not permit this operation.
    WrongState,
    /// An argument failed validation.
    BadParam,
    /// The object's identity tag doesn't match; it is uninitialized, already
    /// destroyed, or the memory never held a live object of this type.
    InvalidObject,
    /// The operation is not permitted under the current compile-time
    /// configuration.
    IllegalUse,
    /// The primitive was deleted while the calling task was waiting on it.
    Deleted,
    /// The wait was released by an explicit unblock call, not by the
    /// primitive being satisfied.
    ForceReleased,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timed out",
            Self::Overflow => "count would exceed maximum",
            Self::WrongContext => "called from the wrong context",
            Self::WrongState => "object is in the wrong state for this operation",
            Self::BadParam => "argument failed validation",
            Self::InvalidObject => "object identity tag mismatch",
            Self::IllegalUse => "operation not permitted under current configuration",
            Self::Deleted => "primitive was deleted while waiting",
            Self::ForceReleased => "wait was released by an explicit unblock",
        };
        f.write_str(s)
    }
}

/// The reason a blocked call returned, delivered via [`crate::task::Task::wait_rc`].
///
/// This is a strict subset of [`Error`]: only the outcomes a completed wait
/// can carry. `Ok(())` means the primitive was satisfied normally.
pub type WaitResult = Result<(), WaitOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Timeout,
    Deleted,
    ForceReleased,
}

impl From<WaitOutcome> for Error {
    fn from(o: WaitOutcome) -> Self {
        match o {
            WaitOutcome::Timeout => Error::Timeout,
            WaitOutcome::Deleted => Error::Deleted,
            WaitOutcome::ForceReleased => Error::ForceReleased,
        }
    }
}

/// Violations of kernel-internal invariants are not reportable conditions;
/// they indicate a bug in the kernel or its port, so they call this hook
/// instead of returning an `Error`. The default implementation panics.
///
/// Ported from the same idea as `r3_kernel`'s use of `unreachable!()`/
/// `assert!()` on internal invariant checks, but centralized so a port can
/// override it (e.g. to blink an LED and halt instead of unwinding on a
/// target with no panic handler).
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    panic!("corvid-kernel: internal invariant violated: {msg}");
}
