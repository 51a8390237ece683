//! Scheduler core (spec §4.5): the single per-system instance holding
//! `current_task`/`next_task`, the ready-queue set, and the entry points
//! that drive the architecture context switch.
//!
//! Grounded in `r3_kernel`'s `State` (the `Traits::state()` singleton) and
//! its `task::*`/`wait::*` free functions operating on it, collapsed into one
//! named `Kernel<P, N_PRIORITIES>` value instead of a trait-associated
//! global — spec §9's "best modeled ... explicitly via a kernel handle"
//! option, chosen over a zero-cost-global singleton because this crate has
//! no compile-time `Traits`-per-application type to hang one off of (see
//! `SPEC_FULL.md`'s scheduler-core entry and this file's `DESIGN.md` note).

use crate::klock::{lock_cpu, CpuLockCell};
use crate::list::ListHead;
use crate::port::Port;
use crate::readyqueue::ReadyQueueSet;
use crate::task::{CreateQueueRole, Task, TaskState};
use crate::wait::WaitQueue;

/// The scheduler singleton. One `Kernel<P, N_PRIORITIES>` per application;
/// typically declared as a single `static KERNEL: Kernel<MyPort, 8> =
/// Kernel::new([...round-robin budgets...])`.
pub struct Kernel<P: Port, const N_PRIORITIES: usize> {
    pub(crate) ready: ReadyQueueSet<P, N_PRIORITIES>,
    pub(crate) current: CpuLockCell<P, Option<&'static Task<P>>>,
    pub(crate) next: CpuLockCell<P, Option<&'static Task<P>>>,
    pub(crate) all_tasks: ListHead<Task<P>, CreateQueueRole>,
    /// Private wait-queue backing [`Kernel::task_sleep`]; nothing ever
    /// signals it, so a sleeper only ever leaves via timeout expiry.
    pub(crate) sleep_queue: WaitQueue<P>,
    started: CpuLockCell<P, bool>,
    rr_default_ticks: [u8; N_PRIORITIES],
}

impl<P: Port, const N_PRIORITIES: usize> Kernel<P, N_PRIORITIES> {
    /// `rr_default_ticks[p]` is the round-robin budget refilled whenever a
    /// task at priority `p` is rotated (spec §4.2); `0` disables rotation for
    /// that priority (pure cooperative scheduling among peers).
    pub const fn new(rr_default_ticks: [u8; N_PRIORITIES]) -> Self {
        Self {
            ready: ReadyQueueSet::new(),
            current: CpuLockCell::new(None),
            next: CpuLockCell::new(None),
            all_tasks: ListHead::new(),
            sleep_queue: WaitQueue::new(),
            started: CpuLockCell::new(false),
            rr_default_ticks,
        }
    }

    /// Register a task with the all-tasks list. Must be called once per task
    /// before it is ever activated; typically done for every statically
    /// declared task at startup, before [`Kernel::start`].
    ///
    /// # Safety
    /// `task` must not already be registered with this or any other kernel.
    pub unsafe fn register_task(&'static self, task: &'static Task<P>) {
        // Safety: forwarded from the caller.
        unsafe { self.all_tasks.push_back(task) };
    }

    pub(crate) fn default_rr_budget(&self, priority: usize) -> u8 {
        self.rr_default_ticks[priority]
    }

    /// The currently running task, or `None` before [`Kernel::start`].
    pub fn current_task(&self) -> Option<&'static Task<P>> {
        let mut guard = lock_cpu::<P>();
        self.current.get(&guard.borrow_mut())
    }

    /// The task the scheduler wants running, i.e. the target of the next
    /// context switch. This is the "next_task" half of the arch handshake
    /// spec §4.5 describes; the architecture port reads it (directly, or by
    /// calling this method from its own `context_switch`/`system_start`
    /// implementation) to know which task's context to restore.
    pub fn next_task(&self) -> Option<&'static Task<P>> {
        let mut guard = lock_cpu::<P>();
        self.next.get(&guard.borrow_mut())
    }

    /// Record that `task` is now the running task. This is the
    /// "assign current_task = next_task" step spec §4.5 assigns to the
    /// architecture's context-switch primitives; the portable kernel code
    /// never performs it itself for an ordinary switch (only `task_exit`'s
    /// deferred-exit path does, since nothing can run after it to call
    /// back in). A concrete `Port` implementation calls this exactly once,
    /// as the last step of `context_switch`/`system_start`, after it has
    /// fully restored `task`'s register context (so nothing can observe
    /// `current_task` and `task` disagreeing about which stack is live).
    ///
    /// # Safety
    /// Must only be called by the architecture port, with `task` equal to
    /// the value most recently returned by [`Kernel::next_task`], and only
    /// after that task's context has actually been restored.
    pub unsafe fn commit_switch(&self, task: &'static Task<P>) {
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();
        self.current.replace(&mut key, Some(task));
    }

    /// Highest-priority runnable task (spec §4.5's `find_next_task`), or
    /// `None` if nothing is runnable. A Non-goal of this kernel is supplying
    /// an idle task; an application with no idle task must ensure some task
    /// is always runnable, or treat `None` here as "halt/sleep the core".
    pub(crate) fn find_next_task(
        &self,
        key: &crate::klock::CpuLockTokenRefMut<'_, P>,
    ) -> Option<&'static Task<P>> {
        self.ready.head(key)
    }

    /// Recompute `next_task` from the ready-queue set. Called after any
    /// mutation that could change which task is highest-priority-runnable.
    pub(crate) fn recompute_next(&self, key: &mut crate::klock::CpuLockTokenRefMut<'_, P>) {
        let next = self.find_next_task(key);
        self.next.replace(key, next);
    }

    /// If a task has just become Runnable at `new_priority`, strictly
    /// outranking the currently running task, the outgoing task is being
    /// preempted: spec §4.2 requires it be reinserted at the tail of its own
    /// priority's slot ("when the currently running task is preempted ...
    /// and remains runnable, it is reinserted at the tail of its priority's
    /// slot"; boundary scenario 1 restates this directly: "B moved back to
    /// ready tail of slot 5"). A newly runnable task at the *same* priority
    /// as the current one does not preempt it — it simply joins the tail of
    /// that slot and waits its turn — so this only rotates on a strictly
    /// higher priority (numerically lower index).
    ///
    /// Called by every site that enqueues a task into the ready set outside
    /// of round-robin rotation itself ([`Kernel::tick`], [`Kernel::task_yield`])
    /// — those already place the rotated task at the tail directly and must
    /// not be double-rotated here.
    pub(crate) fn rotate_current_if_preempted_by(
        &self,
        key: &mut crate::klock::CpuLockTokenRefMut<'_, P>,
        new_priority: usize,
    ) {
        let Some(current) = self.current.get(key) else {
            return;
        };
        if current.state(key) != TaskState::RUNNABLE {
            return;
        }
        let current_priority = current.priority(key);
        if new_priority < current_priority {
            // Safety: Runnable means linked at the head of its own slot;
            // insertion is always at the tail, so the running task is always
            // the head of its slot until rotated or removed.
            unsafe { self.ready.rotate(current_priority, current) };
        }
    }

    /// Perform a context switch if `current_task != next_task` (spec §4.5).
    /// Task context, interrupts must be enabled at call (the port contract
    /// for [`Port::context_switch`]).
    pub(crate) fn switch_if_needed(&'static self) {
        let (current, next) = {
            let mut guard = lock_cpu::<P>();
            let key = guard.borrow_mut();
            (self.current.get(&key), self.next.get(&key))
        };
        if same_task(current, next) {
            return;
        }
        // Safety: interrupts are enabled here (we just dropped the guard),
        // and `current`/`next` reflect the scheduler's own bookkeeping.
        unsafe { P::context_switch() };
    }

    /// First-ever switch into whichever task is highest-priority-runnable.
    /// Never returns. Call once, after every static task has been registered
    /// and activated as needed.
    pub fn start(&'static self) -> ! {
        {
            let mut guard = lock_cpu::<P>();
            let mut key = guard.borrow_mut();
            self.recompute_next(&mut key);
            self.started.replace(&mut key, true);
        }
        // Safety: called once, before interrupts are enabled anywhere, per
        // `Port::system_start`'s precondition.
        unsafe { P::system_start() }
    }

    pub fn is_started(&self) -> bool {
        let mut guard = lock_cpu::<P>();
        self.started.get(&guard.borrow_mut())
    }

    /// Round-robin and timeout sweep, called by the application's tick
    /// driver (spec §6: "consumed by the tick driver, not specified here").
    ///
    /// Decrements every waiting task's armed timeout, completing any that
    /// reach zero with [`crate::error::WaitOutcome::Timeout`]; decrements the
    /// current task's round-robin budget and rotates it to its slot's tail
    /// when it reaches zero and rotation is enabled for its priority.
    pub fn tick(&'static self) {
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        for task in self.all_tasks.iter() {
            if let Some(remaining) = task.timeout_ticks(&key) {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    task.set_timeout_ticks(&mut key, None);
                    self.wait_complete(&mut key, task, Err(crate::error::WaitOutcome::Timeout));
                } else {
                    task.set_timeout_ticks(&mut key, Some(remaining));
                }
            }
        }

        if let Some(current) = self.current.get(&key) {
            #[cfg(feature = "stack_overflow_check")]
            if !current.check_stack_canary() {
                crate::error::fatal("stack overflow detected");
            }

            if current.state(&key) == TaskState::RUNNABLE {
                let budget = current.rr_budget(&key).saturating_sub(1);
                if budget == 0 {
                    let priority = current.priority(&key);
                    let refill = self.default_rr_budget(priority);
                    if refill > 0 {
                        // Safety: `current` is the running task, hence the
                        // head of its own priority slot.
                        unsafe { self.ready.rotate(priority, current) };
                        current.set_rr_budget(&mut key, refill);
                    }
                } else {
                    current.set_rr_budget(&mut key, budget);
                }
            }
        }

        self.recompute_next(&mut key);
    }
}

fn same_task<P: Port>(a: Option<&'static Task<P>>, b: Option<&'static Task<P>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => core::ptr::eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaitOutcome;
    use crate::port::tests::MockPort;
    use crate::task::WaitReason;
    use crate::wait::WaitQueue;

    type TestKernel = Kernel<MockPort, 4>;

    fn leak_task(priority: usize) -> &'static Task<MockPort> {
        let stack = Box::leak(Box::new([0usize; 32]));
        unsafe extern "C" fn body(_: usize) {}
        Box::leak(Box::new(unsafe {
            Task::new("t", body, 0, stack.as_mut_ptr() as *mut u8, 32, priority)
        }))
    }

    /// Spec §8 boundary scenario 3: a finite-timeout wait with no signaller
    /// expires exactly at the tick the countdown reaches zero, leaving
    /// whatever it was waiting on untouched.
    #[test]
    fn tick_expires_timeout_after_exact_tick_count() {
        let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new([0; 4])));
        let task = leak_task(2);
        unsafe { kernel.register_task(task) };

        let queue: &'static WaitQueue<MockPort> = Box::leak(Box::new(WaitQueue::new()));
        {
            let mut guard = lock_cpu::<MockPort>();
            let mut key = guard.borrow_mut();
            task.set_state(&mut key, TaskState::RUNNABLE);
            unsafe { kernel.ready.enqueue(&mut key, 2, task) };
            kernel.current.replace(&mut key, Some(task));
            kernel.wait_curr(&mut key, queue, WaitReason::Semaphore, Some(10));
        }

        for _ in 0..9 {
            kernel.tick();
            let guard = lock_cpu::<MockPort>();
            let key = guard.borrow_mut();
            assert!(
                task.state(&key).contains(TaskState::WAITING),
                "must still be waiting before the 10th tick"
            );
        }
        kernel.tick();

        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        assert_eq!(task.wait_rc(&key), Err(WaitOutcome::Timeout));
        assert!(task.state(&key).contains(TaskState::RUNNABLE));
        assert!(queue.is_empty());
    }

    /// Spec §4.2's round-robin: a zero round-robin tick exhausts and rotates
    /// the running task to the tail of its own priority slot, refilling the
    /// budget from the per-priority default.
    #[test]
    fn tick_rotates_current_task_when_round_robin_budget_expires() {
        let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new([2, 0, 0, 0])));
        let a = leak_task(0);
        let b = leak_task(0);
        unsafe {
            kernel.register_task(a);
            kernel.register_task(b);
        }
        kernel.task_activate(a).unwrap();
        kernel.task_activate(b).unwrap();

        {
            let mut guard = lock_cpu::<MockPort>();
            let mut key = guard.borrow_mut();
            kernel.current.replace(&mut key, Some(a));
        }

        assert!(core::ptr::eq(kernel.ready.first_of(0).unwrap(), a));
        kernel.tick();
        assert!(
            core::ptr::eq(kernel.ready.first_of(0).unwrap(), a),
            "budget of 2 survives the first tick"
        );
        kernel.tick();
        assert!(
            core::ptr::eq(kernel.ready.first_of(0).unwrap(), b),
            "budget exhausted on the second tick, `a` rotates to the tail"
        );
    }

    /// Spec §4.5's deferred ISR switch: an ISR-context signal only updates
    /// `next_task`, never `current_task`, leaving the actual switch to
    /// whatever calls `switch_if_needed` at the ISR-exit epilogue.
    #[test]
    fn isr_wakeup_updates_next_without_touching_current() {
        let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new([0; 4])));
        let low = leak_task(3);
        let waiter = leak_task(0);
        unsafe {
            kernel.register_task(low);
            kernel.register_task(waiter);
        }
        kernel.task_activate(low).unwrap();

        let sem: &'static crate::semaphore::Semaphore<MockPort> =
            Box::leak(Box::new(crate::semaphore::Semaphore::uninit()));
        sem.create(0, 1).unwrap();

        {
            let mut guard = lock_cpu::<MockPort>();
            let mut key = guard.borrow_mut();
            waiter.set_state(&mut key, TaskState::RUNNABLE);
            unsafe { kernel.ready.enqueue(&mut key, 0, waiter) };
            // Block `waiter` on the semaphore (`wait_curr` always operates on
            // whichever task is recorded as current), then restore `low` as
            // the simulated running task.
            kernel.current.replace(&mut key, Some(waiter));
            kernel.wait_curr(&mut key, sem.wait_queue(), WaitReason::Semaphore, None);
            kernel.current.replace(&mut key, Some(low));
        }

        sem.isignal(kernel).unwrap();

        assert!(core::ptr::eq(kernel.current_task().unwrap(), low));
        assert!(core::ptr::eq(kernel.next_task().unwrap(), waiter));
    }
}
