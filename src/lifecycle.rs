//! Task lifecycle operations (spec §6: "task create/activate/exit/delete/
//! suspend/resume/sleep/yield/change-priority") and the Runnable-state
//! transitions of spec §4.3 that aren't already covered by [`crate::wait`],
//! plus the explicit wait-unblock operation spec §5/§7 name (`FORCE`).
//!
//! `task_create` itself is just [`crate::task::Task::new`] plus
//! [`Kernel::register_task`] — both already exist — so this module covers
//! everything from `task_activate` onward. Grounded in `r3_kernel::task`'s
//! `activate`/`unlock_cpu_and_check_preemption` pair, simplified to this
//! crate's always-tail-insertion ready queue and collapsed single-task
//! priority field (no mutex ceiling, so `priority` tracks `base_priority`
//! exactly — see `DESIGN.md`'s priority-inheritance Open Question).
//! `task_wait_release` is grounded in `r3_kernel::wait::interrupt_task`.

use crate::error::Error;
use crate::klock::lock_cpu;
use crate::kernel::Kernel;
use crate::port::Port;
use crate::task::{Task, TaskState};
use crate::timeout::Ticks;

impl<P: Port, const N_PRIORITIES: usize> Kernel<P, N_PRIORITIES> {
    /// Dormant → Runnable (spec §4.3). Lays down the task's initial context
    /// via the port, resets `priority` to `base_priority`, and enqueues it.
    pub fn task_activate(&'static self, task: &'static Task<P>) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }

        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        if task.state(&key) != TaskState::DORMANT {
            return Err(Error::WrongState);
        }

        task.init_context();
        #[cfg(feature = "stack_overflow_check")]
        task.paint_stack_canary();
        let base = task.base_priority(&key);
        task.set_priority(&mut key, base);
        task.set_state(&mut key, TaskState::RUNNABLE);
        task.set_rr_budget(&mut key, self.default_rr_budget(base));
        // Safety: `task` was Dormant, hence linked nowhere.
        unsafe { self.ready.enqueue(&mut key, base, task) };
        self.rotate_current_if_preempted_by(&mut key, base);
        self.recompute_next(&mut key);
        drop(guard);

        crate::config::ktrace!("task {:?} activated at priority {base}", task.name());
        self.switch_if_needed();
        Ok(())
    }

    /// Terminate the calling task (spec §4.3's "any live → Dormant" via
    /// `task_exit`). Task context only; never returns.
    ///
    /// # Safety
    /// Must be called by the task itself, as its last action — the stack
    /// this call executes on is never unwound.
    pub unsafe fn task_exit(&'static self) -> ! {
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        let current = self
            .current
            .get(&key)
            .unwrap_or_else(|| crate::error::fatal("task_exit with no current task"));

        let priority = current.priority(&key);
        // Safety: the running task is always linked in its own ready slot.
        unsafe { self.ready.remove(&mut key, priority, current) };
        current.set_state(&mut key, TaskState::DORMANT);
        self.recompute_next(&mut key);
        let next = self.next.get(&key);
        self.current.replace(&mut key, next);

        // Safety: interrupts are still disabled (we never dropped `guard`),
        // satisfying `Port::context_switch_exit`'s precondition; the caller
        // is relinquishing the CPU permanently per this function's contract.
        unsafe { P::context_switch_exit() }
    }

    /// Free a Dormant task's identity tag (spec §4.3's `task_delete`).
    pub fn task_delete(&self, task: &'static Task<P>) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        let mut guard = lock_cpu::<P>();
        let key = guard.borrow_mut();
        if task.state(&key) != TaskState::DORMANT {
            return Err(Error::WrongState);
        }
        task.mark_freed();
        Ok(())
    }

    /// Cooperatively give up the CPU for the remainder of the current
    /// priority's round-robin slot (spec §5's suspension point (c)).
    pub fn task_yield(&'static self) {
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();
        if let Some(current) = self.current.get(&key) {
            let priority = current.priority(&key);
            // Safety: the running task is always the head of its own slot.
            unsafe { self.ready.rotate(priority, current) };
            self.recompute_next(&mut key);
        }
        drop(guard);
        self.switch_if_needed();
    }

    /// Block the calling task for `ticks`, waking it with no other effect
    /// (spec §6's `sleep`). Implemented as a wait on a private queue that
    /// nothing ever signals, so the only way out is the timeout sweep in
    /// [`Kernel::tick`] — a timed-out sleep is the *expected* completion, so
    /// unlike every other blocking call this one folds `Timeout` back into
    /// `Ok(())`.
    pub fn task_sleep(&'static self, ticks: Ticks) -> Result<(), Error> {
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        self.wait_curr(&mut key, &self.sleep_queue, crate::task::WaitReason::Sleep, Some(ticks));
        let current = self
            .current
            .get(&key)
            .unwrap_or_else(|| crate::error::fatal("task_sleep with no current task"));
        drop(guard);

        self.switch_if_needed();

        let guard = lock_cpu::<P>();
        let key = guard.borrow_mut();
        match current.wait_rc(&key) {
            Ok(()) | Err(crate::error::WaitOutcome::Timeout) => Ok(()),
            Err(outcome) => Err(outcome.into()),
        }
    }

    /// Runnable → Suspended, or set the Suspended bit alongside Waiting
    /// (spec §4.3). Idempotent if already Suspended.
    pub fn task_suspend(&'static self, task: &'static Task<P>) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        let mut state = task.state(&key);
        if state.contains(TaskState::DORMANT) {
            return Err(Error::WrongState);
        }
        if state.contains(TaskState::RUNNABLE) {
            let priority = task.priority(&key);
            // Safety: Runnable means linked in its priority's ready slot.
            unsafe { self.ready.remove(&mut key, priority, task) };
        }
        state.remove(TaskState::RUNNABLE);
        state.insert(TaskState::SUSPENDED);
        task.set_state(&mut key, state);
        self.recompute_next(&mut key);
        drop(guard);

        self.switch_if_needed();
        Ok(())
    }

    /// Clear the Suspended bit (spec §4.3): returns to Runnable only if
    /// Waiting is also clear; otherwise the task simply becomes plain
    /// Waiting again, still blocked on whatever it was waiting for.
    pub fn task_resume(&'static self, task: &'static Task<P>) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        let mut state = task.state(&key);
        if !state.contains(TaskState::SUSPENDED) {
            return Err(Error::WrongState);
        }
        state.remove(TaskState::SUSPENDED);
        if state.is_empty() {
            state.insert(TaskState::RUNNABLE);
            let priority = task.priority(&key);
            // Safety: `task` was Suspended (and not Waiting), hence linked
            // nowhere.
            unsafe { self.ready.enqueue(&mut key, priority, task) };
            self.rotate_current_if_preempted_by(&mut key, priority);
        }
        task.set_state(&mut key, state);
        self.recompute_next(&mut key);
        drop(guard);

        self.switch_if_needed();
        Ok(())
    }

    /// Change `task`'s priority (spec §4.3's "when `priority` changes").
    /// This kernel implements no priority-inheritance primitive (mutex is a
    /// Non-goal), so `priority` always tracks `base_priority` exactly; if
    /// `task` is currently Runnable, it is atomically moved to the tail of
    /// the new priority's slot.
    pub fn task_set_priority(&'static self, task: &'static Task<P>, priority: usize) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        if priority >= N_PRIORITIES {
            return Err(Error::BadParam);
        }
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        if task.state(&key).contains(TaskState::RUNNABLE) {
            let old_priority = task.priority(&key);
            // Safety: Runnable means linked in `old_priority`'s slot.
            unsafe { self.ready.remove(&mut key, old_priority, task) };
            task.set_base_priority(&mut key, priority);
            task.set_priority(&mut key, priority);
            task.set_rr_budget(&mut key, self.default_rr_budget(priority));
            // Safety: just removed above, so linked nowhere.
            unsafe { self.ready.enqueue(&mut key, priority, task) };
            self.rotate_current_if_preempted_by(&mut key, priority);
            self.recompute_next(&mut key);
        } else {
            task.set_base_priority(&mut key, priority);
            task.set_priority(&mut key, priority);
        }
        drop(guard);

        self.switch_if_needed();
        Ok(())
    }

    pub fn task_base_priority(&self, task: &'static Task<P>) -> Result<usize, Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        let mut guard = lock_cpu::<P>();
        let key = guard.borrow_mut();
        if task.state(&key) == TaskState::DORMANT {
            return Err(Error::WrongState);
        }
        Ok(task.base_priority(&key))
    }

    /// Explicitly release `task` from whatever it is waiting on, delivering
    /// [`crate::error::WaitOutcome::ForceReleased`] instead of the primitive's
    /// own completion (spec §5's "explicit unblock API", §7's `FORCE` result
    /// code). Grounded in `r3_kernel::wait::interrupt_task`, which this
    /// method follows directly: reject if `task` is not currently Waiting,
    /// otherwise hand its wait the `ForceReleased` outcome exactly as
    /// [`Kernel::wait_complete`] would for any other resolution.
    pub fn task_wait_release(&'static self, task: &'static Task<P>) -> Result<(), Error> {
        if !task.is_live() {
            return Err(Error::InvalidObject);
        }
        let mut guard = lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        if !task.state(&key).contains(TaskState::WAITING) {
            return Err(Error::WrongState);
        }
        self.wait_complete(&mut key, task, Err(crate::error::WaitOutcome::ForceReleased));
        drop(guard);

        self.switch_if_needed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::lock_cpu;
    use crate::port::tests::MockPort;

    type TestKernel = Kernel<MockPort, 4>;

    fn leak_task(priority: usize) -> &'static Task<MockPort> {
        let stack = Box::leak(Box::new([0usize; 32]));
        unsafe extern "C" fn body(_: usize) {}
        Box::leak(Box::new(unsafe {
            Task::new("t", body, 0, stack.as_mut_ptr() as *mut u8, 32, priority)
        }))
    }

    fn leak_kernel() -> &'static TestKernel {
        Box::leak(Box::new(Kernel::new([4; 4])))
    }

    #[test]
    fn activate_moves_dormant_task_to_ready_set() {
        let kernel = leak_kernel();
        let task = leak_task(2);
        unsafe { kernel.register_task(task) };

        kernel.task_activate(task).unwrap();

        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        assert_eq!(task.state(&key), TaskState::RUNNABLE);
        assert!(core::ptr::eq(kernel.ready.first_of(2).unwrap(), task));
        assert_eq!(
            kernel.task_activate(task),
            Err(Error::WrongState),
            "activating twice without an intervening exit is rejected"
        );
    }

    #[test]
    fn suspend_then_resume_round_trips_through_ready_set() {
        let kernel = leak_kernel();
        let task = leak_task(1);
        unsafe { kernel.register_task(task) };
        kernel.task_activate(task).unwrap();

        kernel.task_suspend(task).unwrap();
        {
            let guard = lock_cpu::<MockPort>();
            let key = guard.borrow_mut();
            assert!(task.state(&key).contains(TaskState::SUSPENDED));
            assert!(!task.state(&key).contains(TaskState::RUNNABLE));
            assert!(kernel.ready.first_of(1).is_none());
        }

        kernel.task_resume(task).unwrap();
        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        assert_eq!(task.state(&key), TaskState::RUNNABLE);
        assert!(core::ptr::eq(kernel.ready.first_of(1).unwrap(), task));
    }

    #[test]
    fn suspend_while_waiting_then_resume_returns_to_plain_waiting() {
        let kernel = leak_kernel();
        let task = leak_task(0);
        unsafe { kernel.register_task(task) };
        kernel.task_activate(task).unwrap();

        let queue: &'static crate::wait::WaitQueue<MockPort> =
            Box::leak(Box::new(crate::wait::WaitQueue::new()));
        {
            let mut guard = lock_cpu::<MockPort>();
            let mut key = guard.borrow_mut();
            kernel.current.replace(&mut key, Some(task));
            kernel.wait_curr(&mut key, queue, crate::task::WaitReason::Semaphore, None);
        }

        kernel.task_suspend(task).unwrap();
        {
            let guard = lock_cpu::<MockPort>();
            let key = guard.borrow_mut();
            let state = task.state(&key);
            assert!(state.contains(TaskState::SUSPENDED));
            assert!(state.contains(TaskState::WAITING));
            assert!(!state.contains(TaskState::RUNNABLE));
        }

        kernel.task_resume(task).unwrap();
        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        let state = task.state(&key);
        assert!(state.contains(TaskState::WAITING));
        assert!(!state.contains(TaskState::SUSPENDED));
        assert!(!state.contains(TaskState::RUNNABLE));
        assert!(kernel.ready.first_of(0).is_none());
    }

    #[test]
    fn set_priority_moves_runnable_task_between_slots() {
        let kernel = leak_kernel();
        let task = leak_task(3);
        unsafe { kernel.register_task(task) };
        kernel.task_activate(task).unwrap();

        kernel.task_set_priority(task, 0).unwrap();

        assert!(kernel.ready.first_of(3).is_none());
        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        assert!(core::ptr::eq(kernel.ready.first_of(0).unwrap(), task));
        assert_eq!(task.priority(&key), 0);
        assert_eq!(task.base_priority(&key), 0);
    }

    #[test]
    fn delete_requires_dormant_state() {
        let kernel = leak_kernel();
        let task = leak_task(0);
        unsafe { kernel.register_task(task) };
        kernel.task_activate(task).unwrap();

        assert_eq!(kernel.task_delete(task), Err(Error::WrongState));

        kernel.task_suspend(task).unwrap();
        kernel.task_resume(task).unwrap();
        // Still Runnable, not Dormant; deletion still rejected.
        assert_eq!(kernel.task_delete(task), Err(Error::WrongState));
    }

    #[test]
    fn wait_release_delivers_force_released_and_requires_waiting_state() {
        let kernel = leak_kernel();
        let task = leak_task(0);
        unsafe { kernel.register_task(task) };
        kernel.task_activate(task).unwrap();

        assert_eq!(
            kernel.task_wait_release(task),
            Err(Error::WrongState),
            "a Runnable task has nothing to release it from"
        );

        let queue: &'static crate::wait::WaitQueue<MockPort> =
            Box::leak(Box::new(crate::wait::WaitQueue::new()));
        {
            let mut guard = lock_cpu::<MockPort>();
            let mut key = guard.borrow_mut();
            kernel.current.replace(&mut key, Some(task));
            kernel.wait_curr(&mut key, queue, crate::task::WaitReason::Semaphore, None);
        }

        kernel.task_wait_release(task).unwrap();

        let guard = lock_cpu::<MockPort>();
        let key = guard.borrow_mut();
        assert_eq!(
            task.wait_rc(&key),
            Err(crate::error::WaitOutcome::ForceReleased)
        );
        assert!(task.state(&key).contains(TaskState::RUNNABLE));
        assert!(queue.is_empty());
    }
}
