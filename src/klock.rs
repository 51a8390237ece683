//! Critical-section locking (spec §5): a RAII guard over "interrupts
//! disabled" that also serves as the access token for [`CpuLockCell`],
//! the cell type every piece of shared scheduler state is stored in.
//!
//! Grounded in `r3_kernel::klock`, which wraps the `tokenlock` crate's
//! compile-time singleton token so that "holds the token" and "may safely
//! access the cell" are the same fact, checked by the borrow checker rather
//! than a runtime `RefCell` check. We keep that mechanism and drop the
//! debug-formatting proxies and `CellLike` blanket impls the teacher adds
//! for its generic wait-queue accessors, which this crate doesn't need.

use core::ops;
use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncTokenLock};

use crate::port::Port;

/// Per-`Port` marker type identifying one kernel's token/keyhole pair.
struct CpuLockTag<P>(core::marker::PhantomData<P>);

type CpuLockToken<P> = UnsyncSingletonToken<CpuLockTag<P>>;
type CpuLockKeyhole<P> = SingletonTokenId<CpuLockTag<P>>;

/// A cell only accessible while holding a [`CpuLockGuard`]`<P>` (or a
/// borrowed [`CpuLockTokenRefMut`]`<P>`), i.e. only with interrupts disabled.
///
/// Every field of [`crate::task::Task`], [`crate::kernel::Kernel`], and
/// [`crate::semaphore::Semaphore`] that participates in the invariants of
/// spec §3/§5 is wrapped in one of these.
pub struct CpuLockCell<P, T>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub const fn new(value: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::<P>::INIT, value))
    }
}

impl<P, T: Copy> CpuLockCell<P, T> {
    #[inline]
    pub fn get(&self, key: &CpuLockTokenRefMut<'_, P>) -> T {
        *self.0.read(key)
    }
}

impl<P, T> CpuLockCell<P, T> {
    #[inline]
    pub fn read<'a>(&'a self, key: &'a CpuLockTokenRefMut<'_, P>) -> &'a T {
        self.0.read(key)
    }

    #[inline]
    pub fn write<'a>(&'a self, key: &'a mut CpuLockTokenRefMut<'_, P>) -> &'a mut T {
        self.0.write(key)
    }

    #[inline]
    pub fn replace(&self, key: &mut CpuLockTokenRefMut<'_, P>, value: T) -> T {
        core::mem::replace(self.0.write(key), value)
    }
}

// Safety: all accesses are gated by holding the single `CpuLockToken<P>`,
// which can only exist while interrupts are disabled on this one core.
unsafe impl<P, T: Send> Sync for CpuLockCell<P, T> {}

/// RAII guard for "interrupts disabled" / CPU Lock active.
pub struct CpuLockGuard<P: Port> {
    state: P::IntrState,
    token: CpuLockToken<P>,
}

impl<P: Port> CpuLockGuard<P> {
    #[inline]
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        // Safety: this guard is the one that entered the CPU Lock state in
        // `lock_cpu`, and is the only place that leaves it again.
        unsafe { P::leave_cpu_lock() };
        P::sr_restore(self.state);
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

pub type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;

/// Disable interrupts and obtain the token that unlocks every
/// [`CpuLockCell`] in the kernel. Not reentrant: internal kernel code always
/// threads an existing guard through via [`CpuLockGuard::borrow_mut`] rather
/// than calling this again while one is live, and that discipline is
/// enforced here, not just assumed — [`Port::try_enter_cpu_lock`] gates the
/// actual token mint, so a nested call can't mint a second live
/// `CpuLockToken<P>` and alias a `CpuLockCell`'s `&mut T` out from under the
/// outer guard. A reentrant call is a kernel-internal bug, not a normal
/// error condition, so it goes through [`crate::error::fatal`] rather than a
/// `Result` — see `DESIGN.md`.
#[inline]
pub fn lock_cpu<P: Port>() -> CpuLockGuard<P> {
    let state = P::sr_save_int_dis();
    // Safety: only this function calls `try_enter_cpu_lock`, and only right
    // after disabling interrupts.
    if !unsafe { P::try_enter_cpu_lock() } {
        P::sr_restore(state);
        crate::error::fatal("lock_cpu: CPU Lock already held (reentrant call)");
    }
    // Safety: `try_enter_cpu_lock` just succeeded, so this is the only
    // `CpuLockToken<P>` in existence.
    let token = unsafe { CpuLockToken::<P>::new_unchecked() };
    CpuLockGuard { state, token }
}
