//! Timeout bookkeeping consumed by the application's tick driver (spec §5,
//! §6: "consumed by the tick driver, not specified here").
//!
//! Grounded in `r3_kernel::timeout`'s system-clock/tick machinery, but
//! reduced to what this crate's scope actually needs: a plain countdown
//! per waiting task, decremented by [`crate::kernel::Kernel::tick`], rather
//! than the teacher's sorted timeout-event list keyed by absolute system
//! time (`TimeoutGlobals`, `Time32` arithmetic across tick-count wraparound).
//! That machinery exists there to keep timeout insertion/cancellation
//! O(log n) against thousands of simultaneous timers across many primitive
//! kinds; this kernel has exactly one blocking primitive and a tick rate
//! expected to stay in the tens-to-hundreds of Hz, so an O(n) per-tick sweep
//! over the all-tasks list (already needed for round-robin bookkeeping) is
//! the simpler, still entirely adequate choice. Noted as an Open Question
//! resolution in `DESIGN.md`.

/// A relative tick count. `0` is used as a sentinel meaning "poll, don't
/// wait" at the call sites that accept a timeout; an armed deadline of
/// `Some(1)` fires on the very next [`crate::kernel::Kernel::tick`] call.
pub type Ticks = u32;

/// Spec §5's "infinite" timeout: never expires. Passed as `None` to
/// `acquire`/`wait_curr` rather than as a sentinel value of [`Ticks`], since
/// `Option<Ticks>` makes "no timeout armed" unrepresentable by accident.
pub const INFINITE: Option<Ticks> = None;
