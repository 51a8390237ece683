//! The ready-queue set: per-priority FIFO slots plus the bitmap that finds
//! the highest-priority non-empty one in O(1) (spec §4.2).
//!
//! Grounded in `r3_kernel::task::readyqueue::BitmapQueue`, minus its
//! `prev_task_priority`/"imaginary task" bookkeeping — that machinery exists
//! there to let a single `pop_front_task` call double as both "what should
//! run next" and "where does the preempted task's reinsertion point fall
//! relative to same-priority peers", needed because `r3_kernel` reorders a
//! preempted task by effective priority among peers. This crate's source
//! spec always reinserts at the tail of the task's own slot (plain
//! round-robin, spec §4.2's "insertion is always at the tail"), so `enqueue`
//! and `highest_priority`/`first_of` stand on their own.

use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::list::ListHead;
use crate::port::Port;
use crate::prio_bitmap::{FixedPrioBitmap, PrioBitmap};
use crate::task::{Task, TaskQueueRole};

/// `N_PRIORITIES` list heads, one per priority level (0 = highest), plus the
/// bitmap mirroring their occupancy.
pub struct ReadyQueueSet<P: Port, const N_PRIORITIES: usize> {
    slots: [ListHead<Task<P>, TaskQueueRole>; N_PRIORITIES],
    bitmap: CpuLockCell<P, FixedPrioBitmap>,
}

impl<P: Port, const N_PRIORITIES: usize> ReadyQueueSet<P, N_PRIORITIES> {
    pub const fn new() -> Self {
        assert!(
            N_PRIORITIES <= usize::BITS as usize,
            "priority count exceeds bitmap width"
        );
        Self {
            slots: ListHead::new_array(),
            bitmap: CpuLockCell::new(FixedPrioBitmap::new()),
        }
    }

    /// Append `task` to the slot for `priority` and set the bitmap bit.
    ///
    /// # Safety
    /// `task` must not already be linked into any ready-queue slot or
    /// wait-queue (spec §4.2's enqueue precondition).
    pub unsafe fn enqueue(
        &self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        priority: usize,
        task: &'static Task<P>,
    ) {
        // Safety: forwarded from the caller.
        unsafe { self.slots[priority].push_back(task) };
        let mut bitmap = self.bitmap.get(key);
        bitmap.set(priority);
        self.bitmap.replace(key, bitmap);
    }

    /// Unlink `task` from the slot for `priority`; clear the bitmap bit if
    /// that slot becomes empty.
    ///
    /// # Safety
    /// `task` must currently be linked into precisely that slot.
    pub unsafe fn remove(
        &self,
        key: &mut CpuLockTokenRefMut<'_, P>,
        priority: usize,
        task: &'static Task<P>,
    ) {
        // Safety: forwarded from the caller.
        unsafe { self.slots[priority].remove(task) };
        if self.slots[priority].is_empty() {
            let mut bitmap = self.bitmap.get(key);
            bitmap.clear(priority);
            self.bitmap.replace(key, bitmap);
        }
    }

    /// The index of the highest-priority (lowest-numbered) non-empty slot.
    pub fn highest_priority(&self, key: &CpuLockTokenRefMut<'_, P>) -> Option<usize> {
        self.bitmap.get(key).find_set()
    }

    /// The first (longest-waiting) task in the slot for `priority`.
    pub fn first_of(&self, priority: usize) -> Option<&'static Task<P>> {
        self.slots[priority].first()
    }

    /// Whether the bitmap bit for `priority` is set. Exposed for invariant
    /// checks (spec §8's "`ready_bitmap` bit *p* set ⇔ ready slot *p*
    /// non-empty"); normal scheduling code never needs this directly since
    /// [`ReadyQueueSet::highest_priority`]/[`ReadyQueueSet::head`] already
    /// fold the bitmap query in.
    pub(crate) fn bit_is_set(&self, key: &CpuLockTokenRefMut<'_, P>, priority: usize) -> bool {
        self.bitmap.get(key).get(priority)
    }

    /// The highest-priority runnable task, i.e. the head of
    /// [`ReadyQueueSet::highest_priority`]'s slot.
    pub fn head(&self, key: &CpuLockTokenRefMut<'_, P>) -> Option<&'static Task<P>> {
        self.first_of(self.highest_priority(key)?)
    }

    /// Remove and return the head of the highest-priority non-empty slot.
    pub fn pop_highest(&self, key: &mut CpuLockTokenRefMut<'_, P>) -> Option<&'static Task<P>> {
        let priority = self.highest_priority(key)?;
        let task = self.slots[priority].pop_front()?;
        if self.slots[priority].is_empty() {
            let mut bitmap = self.bitmap.get(key);
            bitmap.clear(priority);
            self.bitmap.replace(key, bitmap);
        }
        Some(task)
    }

    /// Move the task currently at the head of `priority`'s slot to the tail,
    /// used for round-robin rotation (spec §4.2) and for a task that yields
    /// or is preempted but remains runnable.
    ///
    /// # Safety
    /// `task` must currently be the head of the slot for `priority`.
    pub unsafe fn rotate(&self, priority: usize, task: &'static Task<P>) {
        // Safety: forwarded from the caller; removing then re-appending the
        // same task keeps the bitmap bit set throughout (the slot is
        // non-empty both before and after, since `task` itself re-enters
        // it), so no bitmap update is needed.
        unsafe {
            self.slots[priority].remove(task);
            self.slots[priority].push_back(task);
        }
    }
}
