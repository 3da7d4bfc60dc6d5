//! Mutex with priority inheritance
//!
//! A recursive lock owned by one task at a time. While a higher-priority
//! task waits for it, the owner runs at the highest waiter's priority, so a
//! medium-priority task cannot starve the owner (priority inversion).

use core::cell::Cell;
use core::marker::PhantomData;

use critical_section::CriticalSection;

use crate::kernel::list::WaitList;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::{Deadline, Kernel};
use crate::types::{KernelError, Result, TaskId};

#[derive(Clone, Copy)]
struct Ownership {
    owner: Option<TaskId>,
    depth: u32,
}

/// A mutual exclusion primitive with priority inheritance.
///
/// While tasks wait for the mutex, its owner runs at the highest priority
/// among them (or its own, if higher). The boost follows the waiters: it
/// shrinks when a waiter times out, passes to the next owner when the
/// mutex is handed over, and is dropped once no held mutex justifies it.
///
/// The owner may lock again; each `lock` must be matched by an `unlock`.
/// A task holds at most `config::MAX_HELD_MUTEXES` mutexes at once.
///
/// # Example
///
/// ```ignore
/// use rtkernel::sync::Mutex;
///
/// static BUS: Mutex<'static> = Mutex::new(&KERNEL);
///
/// fn sensor_task(kernel: &'static Kernel) {
///     loop {
///         {
///             let _bus = BUS.guard(INFINITE).unwrap();
///             read_sensor();
///         } // released here
///         kernel.delay(10);
///     }
/// }
/// ```
pub struct Mutex<'k> {
    kernel: &'k Kernel,
    state: critical_section::Mutex<Cell<Ownership>>,
    waiters: WaitList,
}

impl<'k> Mutex<'k> {
    pub const fn new(kernel: &'k Kernel) -> Self {
        Mutex {
            kernel,
            state: critical_section::Mutex::new(Cell::new(Ownership { owner: None, depth: 0 })),
            waiters: WaitList::new(),
        }
    }

    /// Claim for the calling task, or nest if it already owns the mutex.
    /// A new owner inherits the priority of tasks still waiting.
    fn claim(&self, cs: CriticalSection<'_>, sched: &mut Scheduler) -> Result<()> {
        let Some(me) = sched.caller() else {
            return Err(KernelError::NotOwner);
        };
        let cell = self.state.borrow(cs);
        let mut st = cell.get();
        match st.owner {
            None => {
                sched.hold_mutex(me, &self.waiters)?;
                st.owner = Some(me);
                st.depth = 1;
                cell.set(st);
                sched.refresh_priority(cs, me);
            }
            Some(owner) if owner == me => {
                st.depth += 1;
                cell.set(st);
            }
            Some(_) => return Err(KernelError::Timeout),
        }
        Ok(())
    }

    /// Acquire without blocking.
    ///
    /// Fails with [`KernelError::Timeout`] if another task holds the mutex,
    /// with [`KernelError::NotOwner`] outside task context and with
    /// [`KernelError::NoMemory`] if the caller already holds the maximum
    /// number of mutexes.
    pub fn try_lock(&self) -> Result<()> {
        self.kernel.with(|cs, sched| self.claim(cs, sched))
    }

    /// Acquire, blocking for at most `timeout_ms`.
    ///
    /// Before blocking, the owner inherits the caller's priority if it is
    /// higher. If the wait times out, the owner's priority is recomputed
    /// from the tasks still waiting.
    pub fn lock(&self, timeout_ms: u32) -> Result<()> {
        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let outcome = self.kernel.with(|cs, sched| {
                let err = match self.claim(cs, sched) {
                    Ok(()) => return Some(Ok(())),
                    Err(e) => e,
                };
                if deadline.is_poll() || err != KernelError::Timeout {
                    return Some(Err(err));
                }
                let owner = self.state.borrow(cs).get().owner;
                let now = sched.tick_count();
                if deadline.expired(now) {
                    if let Some(owner) = owner {
                        sched.refresh_priority(cs, owner);
                    }
                    return Some(Err(KernelError::Timeout));
                }
                if let (Some(owner), Some(me)) = (owner, sched.caller()) {
                    let mine = sched.task(me).priority;
                    sched.inherit_priority(owner, mine);
                }
                if !sched.block_caller(cs, &self.waiters, deadline.at(now)) {
                    return Some(Err(err));
                }
                None
            });
            match outcome {
                Some(r) => return r,
                None => self.kernel.settle(),
            }
        }
    }

    /// Release one level of ownership.
    ///
    /// At depth zero the owner drops to the priority its remaining mutexes
    /// entitle it to and the most recently blocked waiter is woken.
    /// Fails with [`KernelError::NotOwner`] if the caller does not hold it.
    pub fn unlock(&self) -> Result<()> {
        self.kernel.with(|cs, sched| {
            let cell = self.state.borrow(cs);
            let mut st = cell.get();
            let Some(me) = sched.caller().filter(|me| st.owner == Some(*me)) else {
                return Err(KernelError::NotOwner);
            };
            st.depth -= 1;
            if st.depth == 0 {
                st.owner = None;
                cell.set(st);
                sched.release_mutex(me, &self.waiters);
                sched.refresh_priority(cs, me);
                sched.unblock_one(cs, &self.waiters);
            } else {
                cell.set(st);
            }
            Ok(())
        })
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self, timeout_ms: u32) -> Result<MutexGuard<'_, 'k>> {
        self.lock(timeout_ms)?;
        Ok(MutexGuard { mutex: self, _not_send: PhantomData })
    }

    /// Current owner, if locked.
    pub fn owner(&self) -> Option<TaskId> {
        critical_section::with(|cs| self.state.borrow(cs).get().owner)
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Recursive lock depth of the owner.
    pub fn depth(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow(cs).get().depth)
    }
}

impl Drop for Mutex<'_> {
    fn drop(&mut self) {
        let owner = critical_section::with(|cs| self.state.borrow(cs).get().owner);
        if let Some(owner) = owner {
            self.kernel.with(|cs, sched| {
                sched.release_mutex(owner, &self.waiters);
                sched.refresh_priority(cs, owner);
            });
        }
    }
}

/// Unlocks the mutex when dropped. `!Send`: only the owning task may
/// release it.
pub struct MutexGuard<'a, 'k> {
    mutex: &'a Mutex<'k>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MutexGuard<'_, '_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_outside_task_context_is_refused() {
        static KERNEL: Kernel = Kernel::new();
        let m = Mutex::new(&KERNEL);
        assert_eq!(m.try_lock(), Err(KernelError::NotOwner));
        assert_eq!(m.lock(100), Err(KernelError::NotOwner));
        assert_eq!(m.unlock(), Err(KernelError::NotOwner));
        assert!(!m.is_locked());
    }
}
