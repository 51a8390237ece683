//! Randomized scheduler/semaphore property test (spec §8): "randomized
//! task/sem operations under a deterministic virtual tick simulating
//! preemption points must preserve all invariants above after every
//! operation."
//!
//! Grounded in the same bytecode-interpreter style
//! `crate::prio_bitmap`'s own `quickcheck` test already uses (a `Vec<u8>`
//! decoded into a bounded command sequence, rather than a hand-rolled
//! `Arbitrary` impl per command type), run against the in-process
//! [`crate::port::tests::MockPort`] — this crate's stand-in for the
//! teacher pack's separate host-port crates (`r3_port_std`,
//! `constance_port_std`), small enough here to live directly in the test
//! module it supports instead of its own crate.

#![cfg(test)]

use quickcheck_macros::quickcheck;

use crate::error::WaitOutcome;
use crate::klock::lock_cpu;
use crate::port::tests::MockPort;
use crate::semaphore::Semaphore;
use crate::task::{Task, TaskState, WaitReason};
use crate::Kernel;

const N_PRIORITIES: usize = 4;
const N_TASKS: usize = 3;

type TestKernel = Kernel<MockPort, N_PRIORITIES>;

fn leak_task(priority: usize) -> &'static Task<MockPort> {
    let stack = Box::leak(Box::new([0usize; 32]));
    unsafe extern "C" fn body(_: usize) {}
    Box::leak(Box::new(unsafe {
        Task::new("t", body, 0, stack.as_mut_ptr() as *mut u8, 32, priority)
    }))
}

/// Every invariant spec §8 lists that this harness is in a position to
/// check (the ones genuinely about scheduler/semaphore state reachable
/// without a real architecture port driving actual execution).
fn check_invariants(
    kernel: &'static TestKernel,
    tasks: &[&'static Task<MockPort>; N_TASKS],
    sem: &'static Semaphore<MockPort>,
) {
    let mut guard = lock_cpu::<MockPort>();
    let key = guard.borrow_mut();

    // ready_bitmap bit p set <=> ready slot p non-empty.
    for p in 0..N_PRIORITIES {
        assert_eq!(
            kernel.ready.bit_is_set(&key, p),
            kernel.ready.first_of(p).is_some(),
            "bitmap bit {p} disagrees with slot occupancy"
        );
    }

    // Per-task: Runnable <=> linked at `priority`'s slot; priority >= base.
    for task in tasks {
        let state = task.state(&key);
        assert!(
            task.priority(&key) >= task.base_priority(&key),
            "priority must never drop below base_priority"
        );

        if state == TaskState::RUNNABLE {
            let priority = task.priority(&key);
            assert!(
                slot_contains(kernel, priority, task),
                "Runnable task must be linked into its priority's ready slot"
            );
        }
    }

    // Semaphore invariants: 0 <= count <= max_count; count > 0 => queue empty.
    assert!(sem.count() <= sem.max_count());
    if sem.count() > 0 {
        assert!(sem.is_empty_wait_queue());
    }
}

/// Whether `task` is currently linked into the ready slot for `priority`,
/// found by rotating the slot all the way around and checking membership.
/// Safe to call here because the caller already holds the CPU lock for the
/// whole invariant check, so nothing else can observe the slot mid-rotation.
fn slot_contains(kernel: &'static TestKernel, priority: usize, task: &'static Task<MockPort>) -> bool {
    let first = match kernel.ready.first_of(priority) {
        Some(t) => t,
        None => return false,
    };
    let mut found = false;
    for _ in 0..N_TASKS {
        let head = kernel.ready.first_of(priority).unwrap();
        found |= core::ptr::eq(head, task);
        // Safety: rotating a slot's own head back to its own tail is always
        // valid for a task linked there.
        unsafe { kernel.ready.rotate(priority, head) };
    }
    // `N_TASKS` rotations of an at-most-`N_TASKS`-long slot always returns
    // it to its original order.
    debug_assert!(core::ptr::eq(kernel.ready.first_of(priority).unwrap(), first));
    found
}

enum Op {
    Activate(usize),
    AcquirePolling,
    Signal,
    BlockOnSem(usize),
    Suspend(usize),
    Resume(usize),
    WaitRelease(usize),
    SetPriority(usize, usize),
    Tick,
}

fn interpret(bytecode: &[u8]) -> Vec<Op> {
    let mut out = Vec::new();
    for chunk in bytecode.chunks(2) {
        let tag = chunk[0] % 9;
        let arg = *chunk.get(1).unwrap_or(&0) as usize;
        let task_idx = arg % N_TASKS;
        out.push(match tag {
            0 => Op::Activate(task_idx),
            1 => Op::AcquirePolling,
            2 => Op::Signal,
            3 => Op::BlockOnSem(task_idx),
            4 => Op::Suspend(task_idx),
            5 => Op::Resume(task_idx),
            6 => Op::WaitRelease(task_idx),
            7 => Op::SetPriority(task_idx, arg % N_PRIORITIES),
            _ => Op::Tick,
        });
    }
    out
}

#[quickcheck]
fn scheduler_invariants_survive_randomized_ops(bytecode: Vec<u8>) {
    let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new([2; N_PRIORITIES])));
    let tasks: [&'static Task<MockPort>; N_TASKS] =
        core::array::from_fn(|i| leak_task(i % N_PRIORITIES));
    for task in &tasks {
        unsafe { kernel.register_task(task) };
    }
    let sem: &'static Semaphore<MockPort> = Box::leak(Box::new(Semaphore::uninit()));
    sem.create(0, 2).unwrap();

    for op in interpret(&bytecode[..bytecode.len().min(256)]) {
        match op {
            Op::Activate(i) => {
                let _ = kernel.task_activate(tasks[i]);
            }
            Op::AcquirePolling => {
                let _ = sem.acquire_polling();
            }
            Op::Signal => {
                let _ = sem.signal(kernel);
            }
            Op::BlockOnSem(i) => {
                let task = tasks[i];
                let mut guard = lock_cpu::<MockPort>();
                let mut key = guard.borrow_mut();
                if task.state(&key) == TaskState::RUNNABLE {
                    kernel.current.replace(&mut key, Some(task));
                    kernel.wait_curr(&mut key, sem.wait_queue(), WaitReason::Semaphore, None);
                }
            }
            Op::Suspend(i) => {
                let _ = kernel.task_suspend(tasks[i]);
            }
            Op::Resume(i) => {
                let _ = kernel.task_resume(tasks[i]);
            }
            Op::WaitRelease(i) => {
                let _ = kernel.task_wait_release(tasks[i]);
            }
            Op::SetPriority(i, p) => {
                let _ = kernel.task_set_priority(tasks[i], p);
            }
            Op::Tick => kernel.tick(),
        }
        check_invariants(kernel, &tasks, sem);
    }
}

#[test]
fn force_released_waiter_is_distinguishable_from_timeout_and_deleted() {
    let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new([0; N_PRIORITIES])));
    let task = leak_task(1);
    unsafe { kernel.register_task(task) };
    kernel.task_activate(task).unwrap();

    let sem: &'static Semaphore<MockPort> = Box::leak(Box::new(Semaphore::uninit()));
    sem.create(0, 1).unwrap();

    {
        let mut guard = lock_cpu::<MockPort>();
        let mut key = guard.borrow_mut();
        kernel.current.replace(&mut key, Some(task));
        kernel.wait_curr(&mut key, sem.wait_queue(), WaitReason::Semaphore, Some(5));
    }

    kernel.task_wait_release(task).unwrap();

    let guard = lock_cpu::<MockPort>();
    let key = guard.borrow_mut();
    assert_eq!(task.wait_rc(&key), Err(WaitOutcome::ForceReleased));
    assert!(task.state(&key).contains(TaskState::RUNNABLE));
}
