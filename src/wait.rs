//! The wait-queue protocol shared by every blocking primitive (spec §4.4):
//! `wait_curr`, `wait_complete`, `queue_notify_deleted`.
//!
//! Grounded in `r3_kernel::wait`, but collapsed from its `Wait`/`WaitPayload`
//! per-call object (needed there to support many primitive kinds plus
//! priority-ordered and FIFO-ordered queues side by side) down to a single
//! `task_queue` link reused directly by whichever queue the task is
//! currently a member of, per this crate's source spec's literal data model
//! (`SPEC_FULL.md`'s wait-queue-protocol entry). Ordering is always FIFO
//! (spec §4.4: "the default is FIFO"; nothing in this crate's scope needs
//! the priority-ordered variant).

use crate::error::WaitOutcome;
use crate::kernel::Kernel;
use crate::klock::CpuLockTokenRefMut;
use crate::list::ListHead;
use crate::port::Port;
use crate::task::{Task, TaskQueueRole, TaskState, WaitReason};
use crate::timeout::Ticks;

/// A FIFO queue of blocked tasks, embedded in a primitive (e.g.
/// [`crate::semaphore::Semaphore`]).
pub struct WaitQueue<P: Port>(ListHead<Task<P>, TaskQueueRole>);

impl<P: Port> WaitQueue<P> {
    pub const fn new() -> Self {
        Self(ListHead::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&'static Task<P>> {
        self.0.first()
    }
}

impl<P: Port> Default for WaitQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port, const N_PRIORITIES: usize> Kernel<P, N_PRIORITIES> {
    /// Block the current task on `queue` (spec §4.4's `wait_curr`). Task
    /// context, interrupts already disabled (the caller holds `key`).
    /// `timeout` of `None` means wait forever; `Some(0)` should instead be
    /// handled as an immediate poll by the caller, which never reaches here.
    pub(crate) fn wait_curr(
        &'static self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        queue: &'static WaitQueue<P>,
        reason: WaitReason,
        timeout: Option<Ticks>,
    ) {
        let current = self
            .current
            .get(key)
            .unwrap_or_else(|| crate::error::fatal("wait_curr with no current task"));

        let priority = current.priority(key);
        // Safety: `current` is the running task, hence linked at the head of
        // its own priority's ready slot.
        unsafe { self.ready.remove(key, priority, current) };

        let mut state = current.state(key);
        state.remove(TaskState::RUNNABLE);
        state.insert(TaskState::WAITING);
        current.set_state(key, state);
        current.set_wait_reason(key, reason);
        current.set_wait_rc(key, Err(WaitOutcome::Timeout));

        // Safety: `current` was just removed from the ready set above, so it
        // is linked nowhere.
        unsafe { queue.0.push_back(current) };
        current.set_waiting_on(key, Some(queue));

        current.set_timeout_ticks(key, timeout);

        self.recompute_next(key);
        crate::config::ktrace!("task blocked, reason={reason:?}, timeout={timeout:?}");
    }

    /// Unblock `task` with outcome `rc` (spec §4.4's `wait_complete`). Valid
    /// from any context, interrupts already disabled.
    pub(crate) fn wait_complete(
        &'static self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        task: &'static Task<P>,
        rc: Result<(), WaitOutcome>,
    ) {
        if let Some(queue) = task.waiting_on(key) {
            // Safety: `task` is recorded as a member of exactly this queue.
            unsafe { queue.0.remove(task) };
        }
        task.set_waiting_on(key, None);
        task.set_timeout_ticks(key, None);

        let mut state = task.state(key);
        state.remove(TaskState::WAITING);
        task.set_state(key, state);
        task.set_wait_rc(key, rc);
        crate::config::ktrace!("wait completed with {rc:?}");

        if !state.contains(TaskState::SUSPENDED) {
            let mut state = task.state(key);
            state.insert(TaskState::RUNNABLE);
            task.set_state(key, state);
            let priority = task.priority(key);
            // Safety: `task` was just cleared of Waiting and is not
            // Suspended, and was unlinked from its wait-queue above, so it is
            // linked nowhere.
            unsafe { self.ready.enqueue(key, priority, task) };
            self.rotate_current_if_preempted_by(key, priority);
            self.recompute_next(key);
        }
    }

    /// Deliver [`WaitOutcome::Deleted`] to every waiter on `queue` (spec
    /// §4.4's `queue_notify_deleted`), called when a primitive is destroyed
    /// while tasks are blocked on it.
    pub(crate) fn queue_notify_deleted(
        &'static self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        queue: &'static WaitQueue<P>,
    ) {
        while let Some(task) = queue.first() {
            self.wait_complete(key, task, Err(WaitOutcome::Deleted));
        }
    }

    /// The call shape every blocking primitive follows (spec §4.4), grounded
    /// in `tn_sem.c`'s `_sem_job_perform`: under the CPU Lock, try `poll`; on
    /// failure, block the current task on `queue` (unless `timeout ==
    /// Some(0)`, a pure poll), release the lock, perform the deferred switch,
    /// then read back the wait's outcome. Task context only; callers have
    /// already done their own identity/context checks before reaching here.
    pub(crate) fn block_on(
        &'static self,
        queue: &'static WaitQueue<P>,
        reason: WaitReason,
        timeout: Option<Ticks>,
        mut poll: impl FnMut() -> bool,
    ) -> Result<(), crate::error::Error> {
        let mut guard = crate::klock::lock_cpu::<P>();
        let mut key = guard.borrow_mut();

        if poll() {
            return Ok(());
        }
        if timeout == Some(0) {
            return Err(crate::error::Error::Timeout);
        }

        self.wait_curr(&mut key, queue, reason, timeout);
        let current = self
            .current
            .get(&key)
            .unwrap_or_else(|| crate::error::fatal("block_on blocked with no current task"));
        drop(guard);

        self.switch_if_needed();

        // By the time control returns here, `wait_complete` has already run
        // for this task (from the primitive being signalled, a timeout
        // sweep, or deletion) and recorded the outcome.
        let guard = crate::klock::lock_cpu::<P>();
        let key = guard.borrow_mut();
        current.wait_rc(&key).map_err(crate::error::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::MockPort;

    type TestKernel = Kernel<MockPort, 8>;

    fn leak_task(priority: usize) -> &'static Task<MockPort> {
        let stack = Box::leak(Box::new([0usize; 32]));
        unsafe extern "C" fn body(_: usize) {}
        let task = Box::leak(Box::new(unsafe {
            Task::new("t", body, 0, stack.as_mut_ptr() as *mut u8, 32, priority)
        }));
        task
    }

    fn leak_kernel() -> &'static TestKernel {
        Box::leak(Box::new(Kernel::new([0; 8])))
    }

    #[test]
    fn wait_curr_then_wait_complete_round_trips_to_runnable() {
        let kernel = leak_kernel();
        let queue: &'static WaitQueue<MockPort> = Box::leak(Box::new(WaitQueue::new()));
        let task = leak_task(3);

        unsafe { kernel.register_task(task) };

        let mut guard = crate::klock::lock_cpu::<MockPort>();
        let mut key = guard.borrow_mut();

        // Pretend `task` is current and runnable, as `task_activate` would
        // have left it: Runnable means linked into the ready set, even for
        // the task that is presently running (spec §3's invariant).
        task.set_state(&mut key, TaskState::RUNNABLE);
        unsafe { kernel.ready.enqueue(&mut key, 3, task) };
        kernel.current.replace(&mut key, Some(task));

        kernel.wait_curr(&mut key, queue, WaitReason::Semaphore, None);
        assert!(task.state(&key).contains(TaskState::WAITING));
        assert!(!task.state(&key).contains(TaskState::RUNNABLE));
        assert!(!queue.is_empty());

        kernel.wait_complete(&mut key, task, Ok(()));
        assert!(task.state(&key).contains(TaskState::RUNNABLE));
        assert!(!task.state(&key).contains(TaskState::WAITING));
        assert_eq!(task.wait_rc(&key), Ok(()));
        assert!(queue.is_empty());
    }

    #[test]
    fn suspended_waiter_does_not_return_to_ready_set_on_completion() {
        let kernel = leak_kernel();
        let queue: &'static WaitQueue<MockPort> = Box::leak(Box::new(WaitQueue::new()));
        let task = leak_task(1);
        unsafe { kernel.register_task(task) };

        let mut guard = crate::klock::lock_cpu::<MockPort>();
        let mut key = guard.borrow_mut();

        task.set_state(&mut key, TaskState::RUNNABLE);
        unsafe { kernel.ready.enqueue(&mut key, 1, task) };
        kernel.current.replace(&mut key, Some(task));
        kernel.wait_curr(&mut key, queue, WaitReason::Semaphore, None);

        let mut state = task.state(&key);
        state.insert(TaskState::SUSPENDED);
        task.set_state(&mut key, state);

        kernel.wait_complete(&mut key, task, Ok(()));
        let state = task.state(&key);
        assert!(state.contains(TaskState::SUSPENDED));
        assert!(!state.contains(TaskState::RUNNABLE));
        assert!(!state.contains(TaskState::WAITING));
    }

    #[test]
    fn queue_notify_deleted_wakes_every_waiter_with_deleted() {
        let kernel = leak_kernel();
        let queue: &'static WaitQueue<MockPort> = Box::leak(Box::new(WaitQueue::new()));
        let t1 = leak_task(4);
        let t2 = leak_task(4);
        unsafe {
            kernel.register_task(t1);
            kernel.register_task(t2);
        }

        let mut guard = crate::klock::lock_cpu::<MockPort>();
        let mut key = guard.borrow_mut();

        t1.set_state(&mut key, TaskState::RUNNABLE);
        unsafe { kernel.ready.enqueue(&mut key, 4, t1) };
        kernel.current.replace(&mut key, Some(t1));
        kernel.wait_curr(&mut key, queue, WaitReason::Semaphore, None);

        t2.set_state(&mut key, TaskState::RUNNABLE);
        unsafe { kernel.ready.enqueue(&mut key, 4, t2) };
        kernel.current.replace(&mut key, Some(t2));
        kernel.wait_curr(&mut key, queue, WaitReason::Semaphore, None);

        kernel.queue_notify_deleted(&mut key, queue);

        assert_eq!(t1.wait_rc(&key), Err(WaitOutcome::Deleted));
        assert_eq!(t2.wait_rc(&key), Err(WaitOutcome::Deleted));
        assert!(queue.is_empty());
    }
}
