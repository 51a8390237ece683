//! Compile-time configuration (spec §6): `{priorities_count, check_param,
//! debug, round_robin_default_ticks[priority], stack_overflow_check}`.
//!
//! Most of these knobs aren't a runtime value at all in this crate — they're
//! expressed as Rust's own compile-time mechanisms, the way `r3_kernel`'s
//! `KernelCfg1`/`KernelCfg2` traits turn a build-time configuration struct
//! into const generics and associated types rather than fields read at run
//! time. This module is where an application-writer-facing summary of that
//! mapping lives, plus the one knob ([`STACK_OVERFLOW_CANARY`]) that needs an
//! actual constant.
//!
//! | spec.md knob | Rust mechanism |
//! |---|---|
//! | `priorities_count` | [`crate::kernel::Kernel`]'s `N_PRIORITIES` const generic parameter |
//! | `check_param` | always on (see `DESIGN.md`'s Open Question entry) |
//! | `debug` | the `debug` Cargo feature, gating `log` trace points |
//! | `round_robin_default_ticks[priority]` | the `[u8; N_PRIORITIES]` passed to [`crate::kernel::Kernel::new`] |
//! | `stack_overflow_check` | the `stack_overflow_check` Cargo feature |

/// Canary word painted at the low end of a task's stack when the
/// `stack_overflow_check` feature is enabled, and checked on every
/// [`crate::kernel::Kernel::tick`]. Chosen to be an unlikely accidental
/// stack value, the same role `r3_portkit`'s port test suites use a guard
/// word for, simplified here to one word instead of a guard region.
#[cfg(feature = "stack_overflow_check")]
pub const STACK_OVERFLOW_CANARY: usize = 0xDEAD_C0DE;

/// Trace a kernel event through the `log` facade when the `debug` feature
/// is enabled; expands to nothing otherwise. Kept as a macro (rather than a
/// function wrapping `log::trace!`) so the format arguments aren't evaluated
/// at all when the feature is off.
#[cfg(feature = "debug")]
macro_rules! ktrace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

#[cfg(not(feature = "debug"))]
macro_rules! ktrace {
    ($($arg:tt)*) => {};
}

pub(crate) use ktrace;
