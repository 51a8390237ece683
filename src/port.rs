//! The architecture port contract (spec §4.5, §6).
//!
//! Everything in this module is a trait the *application's* architecture
//! layer implements — interrupt primitives, stack layout, and the
//! register-save context switch. None of it is implemented here; per spec
//! §1 the port is an external collaborator. Method names follow the
//! original C contract this kernel's design is grounded in
//! (`original_source/src/arch/tn_arch.h`: `tn_arch_int_dis`,
//! `tn_arch_sr_save_int_dis`, `_tn_arch_context_switch`, ...) and the
//! equivalent Rust-side split in `r3_kernel` (`PortThreading`).

/// Operations a concrete microcontroller port must supply.
///
/// # Safety
///
/// Implementors must uphold the preconditions documented on each method;
/// the kernel calls them only at the points spec §4.5 describes, and relies
/// on them being implemented correctly for memory safety (an incorrect
/// context switch can corrupt arbitrary task stacks).
pub unsafe trait Port: Sized + 'static {
    /// An opaque token produced by [`Port::sr_save_int_dis`] and consumed by
    /// [`Port::sr_restore`]; typically a saved status/primask register value.
    /// Nestable: restoring an outer token re-establishes whatever interrupt
    /// state was active when it was saved, even if inner save/restore pairs
    /// ran in between.
    type IntrState: Copy;

    /// Unconditionally disable interrupts. Not nestable; prefer
    /// [`Port::sr_save_int_dis`]/[`Port::sr_restore`] in kernel code that
    /// must compose with callers that may already have interrupts disabled.
    fn int_dis();

    /// Unconditionally enable interrupts.
    fn int_en();

    /// Atomically disable interrupts and return the previous state.
    fn sr_save_int_dis() -> Self::IntrState;

    /// Restore a state previously returned by [`Port::sr_save_int_dis`].
    fn sr_restore(state: Self::IntrState);

    /// Whether the CPU is currently executing an interrupt service routine.
    fn inside_isr() -> bool;

    /// Attempt to enter a CPU Lock state, i.e. claim the one
    /// [`crate::klock::CpuLockToken`] that may exist at a time. Returns
    /// `false` if a CPU Lock is already active (reentrant call).
    ///
    /// # Safety
    /// Only meant to be called by [`crate::klock::lock_cpu`], immediately
    /// after [`Port::sr_save_int_dis`].
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave a CPU Lock state previously entered via
    /// [`Port::try_enter_cpu_lock`].
    ///
    /// # Safety
    /// A CPU Lock must currently be active, entered by the caller.
    unsafe fn leave_cpu_lock();

    /// Compute the initial stack pointer for a stack occupying
    /// `[stack_low, stack_low + size_words * size_of::<usize>())`, honoring
    /// this architecture's stack growth direction.
    fn stack_start_get(stack_low: *mut u8, size_words: usize) -> *mut usize;

    /// Lay down a synthetic context frame on `stack_start` (as returned by
    /// [`Port::stack_start_get`]) such that the first context switch into
    /// this task enters `body(param)` with interrupts enabled. Returns the
    /// resulting top-of-stack to store as the task's saved stack pointer.
    ///
    /// # Safety
    /// `stack_start` must point into a stack region of adequate size and
    /// correct alignment for this architecture; `body` must be a valid task
    /// entry point that never returns (it must call task-exit machinery
    /// instead).
    unsafe fn stack_init(
        body: unsafe extern "C" fn(usize),
        stack_start: *mut usize,
        param: usize,
    ) -> *mut usize;

    /// Perform a context switch: save the caller's context onto its own
    /// stack, then restore the context of the kernel's current "next" task.
    ///
    /// # Preconditions
    /// Interrupts are enabled; the kernel has already recorded which task is
    /// "current" (the caller) and which is "next" (the target, readable via
    /// the application's own `Kernel::next_task`). Implementations save the
    /// caller's stack pointer into its own [`crate::task::Task::set_sp`],
    /// restore the target's via [`crate::task::Task::sp`], and finish by
    /// calling the application's `Kernel::commit_switch` with the target
    /// task so the kernel's current/next bookkeeping reflects the switch.
    ///
    /// # Safety
    /// Must only be called by the kernel at a valid suspension point (spec
    /// §5).
    unsafe fn context_switch();

    /// Like [`Port::context_switch`] but does not save the caller's context
    /// (the caller is exiting for good, e.g. from `task_exit`) and never
    /// returns.
    ///
    /// # Preconditions
    /// Interrupts are disabled.
    ///
    /// # Safety
    /// Must only be called by the kernel when the current task is
    /// relinquishing the CPU permanently.
    unsafe fn context_switch_exit() -> !;

    /// Perform the very first context switch of the system, into whichever
    /// task the kernel has already chosen as "next" (the highest-priority
    /// runnable task, or the application-supplied idle task). Never returns.
    /// Restores that task's context from its saved stack pointer and finishes
    /// by calling the application's `Kernel::commit_switch` and enabling
    /// interrupts, exactly like the last half of [`Port::context_switch`]
    /// minus the save step.
    ///
    /// # Preconditions
    /// Interrupts are not yet enabled anywhere.
    ///
    /// # Safety
    /// Must only be called once, by [`crate::kernel::Kernel::start`].
    unsafe fn system_start() -> !;
}

/// A host-backed stand-in `Port`, playing the same role for this crate's own
/// tests that `r3_port_std` plays for the teacher pack: a way to exercise
/// scheduler-core logic without real hardware or a real context switch.
#[cfg(test)]
pub(crate) mod tests {
    use super::Port;
    use std::cell::Cell;

    thread_local! {
        static INT_DISABLED: Cell<bool> = Cell::new(false);
        static CPU_LOCK_ACTIVE: Cell<bool> = Cell::new(false);
    }

    pub struct MockPort;

    unsafe impl Port for MockPort {
        type IntrState = bool;

        fn int_dis() {
            INT_DISABLED.with(|c| c.set(true));
        }

        fn int_en() {
            INT_DISABLED.with(|c| c.set(false));
        }

        fn sr_save_int_dis() -> bool {
            INT_DISABLED.with(|c| c.replace(true))
        }

        fn sr_restore(state: bool) {
            INT_DISABLED.with(|c| c.set(state));
        }

        fn inside_isr() -> bool {
            false
        }

        unsafe fn try_enter_cpu_lock() -> bool {
            CPU_LOCK_ACTIVE.with(|c| {
                if c.get() {
                    false
                } else {
                    c.set(true);
                    true
                }
            })
        }

        unsafe fn leave_cpu_lock() {
            CPU_LOCK_ACTIVE.with(|c| c.set(false));
        }

        fn stack_start_get(stack_low: *mut u8, size_words: usize) -> *mut usize {
            // Safety: only used with `std::boxed::Box`-backed test stacks.
            unsafe { (stack_low as *mut usize).add(size_words) }
        }

        unsafe fn stack_init(
            _body: unsafe extern "C" fn(usize),
            stack_start: *mut usize,
            _param: usize,
        ) -> *mut usize {
            stack_start
        }

        unsafe fn context_switch() {}

        unsafe fn context_switch_exit() -> ! {
            panic!("MockPort::context_switch_exit called in test")
        }

        unsafe fn system_start() -> ! {
            panic!("MockPort::system_start called in test")
        }
    }
}
