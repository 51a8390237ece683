//! Task control block and the state-machine transitions of spec §4.3.
//!
//! Grounded in `r3_kernel::task`'s `TaskCb`/`TaskSt`/`TaskAttr` split between
//! "fixed at creation" and "`CpuLockCell`-protected, mutated under CPU Lock"
//! fields. The state representation itself diverges deliberately: the
//! teacher's `TaskSt` is a plain mutually-exclusive enum (`Ready`, `Running`,
//! `Waiting`, `Dormant`, `PendingActivation`), because `r3_kernel` represents
//! "suspended" as a separate boosted-priority mechanism. This crate's source
//! spec calls for `Suspended` to independently combine with `Waiting`
//! (`SPEC_FULL.md`'s task module), so `TaskState` here is a `bitflags` bitmask
//! instead, matching the `bitflags::bitflags!` style already used for
//! `r3_kernel::interrupt`'s line-init flags.

use core::cell::Cell;

use bitflags::bitflags;

use crate::error::WaitResult;
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::list::{Link, Linked};
use crate::port::Port;
use crate::timeout::Ticks;
use crate::wait::WaitQueue;

/// Sentinel written into [`Task::id_tag`] while the task object is live;
/// cleared (to `0`) by [`crate::kernel::Kernel::task_delete`]. Chosen
/// arbitrarily but memorably, per spec §9's "identity tag ... unlikely to
/// collide with valid memory content".
pub const TASK_ID_TAG: u32 = 0x5441_534b; // "TASK"

bitflags! {
    /// A task's schedulability state (spec §3, §4.3).
    ///
    /// Deliberately a bitmask, not an enum: `Waiting` and `Suspended` are
    /// independent conditions that can both be set, and the transition
    /// table in spec §4.3 depends on that (e.g. a suspended task whose wait
    /// completes moves to plain `Suspended`, not back to `Runnable`).
    pub struct TaskState: u8 {
        const RUNNABLE = 0b0001;
        const WAITING = 0b0010;
        const SUSPENDED = 0b0100;
        const DORMANT = 0b1000;
    }
}

/// What a waiting task is blocked on. This crate implements only the
/// semaphore primitive plus the kernel's own private sleep wait (spec's
/// Non-goals exclude mutex/event-group/queue/pool/timer), so this is
/// presently a small tag rather than the open enumeration spec §3 allows
/// for. `None` is reserved for a task that is not waiting at all (spec §3:
/// "If `state` contains Waiting ... `wait_reason ≠ None`" — every call that
/// actually blocks a task passes one of the other variants, the same way
/// the original kernel has a distinct `TN_WAIT_REASON_SLEEP` alongside
/// `TN_WAIT_REASON_SEM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None,
    Semaphore,
    Sleep,
}

/// Marker distinguishing a task's ready-queue-or-wait-queue linkage from its
/// membership in the all-tasks list. See [`crate::list`]'s module doc.
pub struct TaskQueueRole;
/// Marker for the global all-tasks list (spec §3's `create_queue`).
pub struct CreateQueueRole;

/// The task control block.
///
/// Every `Task` the application declares is a `'static` object (typically a
/// `static TASK: Task<P> = Task::new(...)`), mirroring `r3_kernel`'s
/// statically-allocated `TaskCb` pool: this kernel has no heap and never
/// moves a task after its address is first handed to the scheduler.
pub struct Task<P: Port> {
    id_tag: Cell<u32>,

    /// Diagnostic-only: surfaced by [`Task::name`] for debug logging and
    /// panic messages (`r3_kernel::task::TaskAttr::name` plays the same
    /// role). Participates in no invariant or scheduling decision.
    name: &'static str,

    stack_low: *mut u8,
    stack_words: usize,
    entry: unsafe extern "C" fn(usize),
    param: usize,

    /// Saved stack pointer. Written only by [`Port::stack_init`] (at
    /// activation) and by the architecture's own context-switch code
    /// thereafter; kept outside [`CpuLockCell`] because port code accesses it
    /// directly, the same reason `r3_kernel::TaskCb::port_task_state` is a
    /// bare field placed at a fixed offset rather than lock-cell-wrapped.
    sp: Cell<*mut usize>,

    base_priority: CpuLockCell<P, usize>,
    priority: CpuLockCell<P, usize>,
    state: CpuLockCell<P, TaskState>,

    pub(crate) task_queue: Link<Task<P>, TaskQueueRole>,
    pub(crate) create_queue: Link<Task<P>, CreateQueueRole>,

    wait_reason: CpuLockCell<P, WaitReason>,
    wait_rc: CpuLockCell<P, WaitResult>,

    /// The wait-queue this task's `task_queue` link currently belongs to,
    /// set by `wait::wait_curr` and cleared by `wait::wait_complete`. Lets
    /// `wait_complete(task, rc)` unlink `task` without the caller having to
    /// name the queue, matching spec §4.4's literal two-argument signature.
    waiting_on: CpuLockCell<P, Option<&'static WaitQueue<P>>>,

    /// Remaining ticks until an armed timeout fires, decremented by
    /// [`crate::kernel::Kernel::tick`]. `None` means no timeout is armed
    /// (includes the "infinite" and "already satisfied" cases).
    timeout_ticks: CpuLockCell<P, Option<Ticks>>,

    /// Remaining round-robin budget for this task's current priority slot
    /// (spec §4.2). Refilled from the per-priority default on rotation.
    rr_budget: CpuLockCell<P, u8>,
}

// Safety: every field is either immutable after construction or wrapped in
// `CpuLockCell`/accessed only under CPU Lock, which is itself `Sync` under
// the same reasoning (single core, at most one lock holder at a time).
unsafe impl<P: Port> Sync for Task<P> {}

impl<P: Port> Task<P> {
    /// Construct a task in the `Dormant` state. `stack_low`/`stack_words`
    /// describe the stack region; the task does not run until
    /// [`crate::kernel::Kernel::task_activate`] is called on it.
    ///
    /// # Safety
    /// `stack_low..stack_low + stack_words * size_of::<usize>()` must be a
    /// valid, exclusively-owned memory region for the lifetime of the task,
    /// and `entry` must be a valid task entry point (diverges, or calls
    /// `Kernel::task_exit` rather than returning).
    pub const unsafe fn new(
        name: &'static str,
        entry: unsafe extern "C" fn(usize),
        param: usize,
        stack_low: *mut u8,
        stack_words: usize,
        base_priority: usize,
    ) -> Self {
        Self {
            id_tag: Cell::new(TASK_ID_TAG),
            name,
            stack_low,
            stack_words,
            entry,
            param,
            sp: Cell::new(core::ptr::null_mut()),
            base_priority: CpuLockCell::new(base_priority),
            priority: CpuLockCell::new(base_priority),
            state: CpuLockCell::new(TaskState::DORMANT),
            task_queue: Link::new(),
            create_queue: Link::new(),
            wait_reason: CpuLockCell::new(WaitReason::None),
            wait_rc: CpuLockCell::new(Ok(())),
            waiting_on: CpuLockCell::new(None),
            timeout_ticks: CpuLockCell::new(None),
            rr_budget: CpuLockCell::new(0),
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.id_tag.get() == TASK_ID_TAG
    }

    /// This task's diagnostic name, for debug logging and panic messages.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn mark_freed(&self) {
        self.id_tag.set(0);
    }

    #[inline]
    pub fn state(&self, key: &CpuLockTokenRefMut<'_, P>) -> TaskState {
        self.state.get(key)
    }

    #[inline]
    pub(crate) fn set_state(&self, key: &mut CpuLockTokenRefMut<'_, P>, state: TaskState) {
        self.state.replace(key, state);
    }

    #[inline]
    pub fn priority(&self, key: &CpuLockTokenRefMut<'_, P>) -> usize {
        self.priority.get(key)
    }

    #[inline]
    pub fn base_priority(&self, key: &CpuLockTokenRefMut<'_, P>) -> usize {
        self.base_priority.get(key)
    }

    #[inline]
    pub(crate) fn set_priority(&self, key: &mut CpuLockTokenRefMut<'_, P>, priority: usize) {
        self.priority.replace(key, priority);
    }

    #[inline]
    pub(crate) fn set_base_priority(&self, key: &mut CpuLockTokenRefMut<'_, P>, priority: usize) {
        self.base_priority.replace(key, priority);
    }

    #[inline]
    pub fn wait_reason(&self, key: &CpuLockTokenRefMut<'_, P>) -> WaitReason {
        self.wait_reason.get(key)
    }

    #[inline]
    pub(crate) fn set_wait_reason(&self, key: &mut CpuLockTokenRefMut<'_, P>, reason: WaitReason) {
        self.wait_reason.replace(key, reason);
    }

    #[inline]
    pub fn wait_rc(&self, key: &CpuLockTokenRefMut<'_, P>) -> WaitResult {
        self.wait_rc.get(key)
    }

    #[inline]
    pub(crate) fn set_wait_rc(&self, key: &mut CpuLockTokenRefMut<'_, P>, rc: WaitResult) {
        self.wait_rc.replace(key, rc);
    }

    #[inline]
    pub(crate) fn timeout_ticks(&self, key: &CpuLockTokenRefMut<'_, P>) -> Option<Ticks> {
        self.timeout_ticks.get(key)
    }

    #[inline]
    pub(crate) fn set_timeout_ticks(&self, key: &mut CpuLockTokenRefMut<'_, P>, ticks: Option<Ticks>) {
        self.timeout_ticks.replace(key, ticks);
    }

    #[inline]
    pub(crate) fn waiting_on(&self, key: &CpuLockTokenRefMut<'_, P>) -> Option<&'static WaitQueue<P>> {
        self.waiting_on.get(key)
    }

    #[inline]
    pub(crate) fn set_waiting_on(
        &self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        queue: Option<&'static WaitQueue<P>>,
    ) {
        self.waiting_on.replace(key, queue);
    }

    #[inline]
    pub(crate) fn rr_budget(&self, key: &CpuLockTokenRefMut<'_, P>) -> u8 {
        self.rr_budget.get(key)
    }

    #[inline]
    pub(crate) fn set_rr_budget(&self, key: &mut CpuLockTokenRefMut<'_, P>, budget: u8) {
        self.rr_budget.replace(key, budget);
    }

    /// The task's saved stack pointer. Public because the architecture
    /// port's own `context_switch`/`system_start` implementation (outside
    /// this crate) is the code that actually reads and restores it; the
    /// kernel itself only writes it once, at activation, via
    /// [`Task::init_context`].
    #[inline]
    pub fn sp(&self) -> *mut usize {
        self.sp.get()
    }

    /// Overwrite the saved stack pointer. Called by the architecture port
    /// immediately after saving the previously running task's context onto
    /// its own stack, as the last step of `Port::context_switch`.
    #[inline]
    pub fn set_sp(&self, sp: *mut usize) {
        self.sp.set(sp);
    }

    /// Lay down the initial context frame via the port, per spec §6's
    /// `stack_init` contract, and record the resulting stack pointer.
    pub(crate) fn init_context(&self) {
        let stack_start = P::stack_start_get(self.stack_low, self.stack_words);
        // Safety: `stack_low`/`stack_words` were validated by the caller of
        // `Task::new`; `entry` is a valid task body per the same contract.
        let sp = unsafe { P::stack_init(self.entry, stack_start, self.param) };
        self.set_sp(sp);
    }

    /// Write [`crate::config::STACK_OVERFLOW_CANARY`] at the lowest word of
    /// the stack region, checked later by [`Task::check_stack_canary`].
    #[cfg(feature = "stack_overflow_check")]
    pub(crate) fn paint_stack_canary(&self) {
        // Safety: `stack_low` is the low end of a region at least one word
        // wide, exclusively owned per `Task::new`'s safety contract.
        unsafe { (self.stack_low as *mut usize).write(crate::config::STACK_OVERFLOW_CANARY) };
    }

    /// Returns `false` if the canary word has been overwritten, indicating
    /// the task's stack overflowed downward into it.
    #[cfg(feature = "stack_overflow_check")]
    pub(crate) fn check_stack_canary(&self) -> bool {
        // Safety: see `paint_stack_canary`.
        unsafe { (self.stack_low as *const usize).read() == crate::config::STACK_OVERFLOW_CANARY }
    }
}

impl<P: Port> Linked<TaskQueueRole> for Task<P> {
    fn link(&'static self) -> &'static Link<Self, TaskQueueRole> {
        &self.task_queue
    }
}

impl<P: Port> Linked<CreateQueueRole> for Task<P> {
    fn link(&'static self) -> &'static Link<Self, CreateQueueRole> {
        &self.create_queue
    }
}
