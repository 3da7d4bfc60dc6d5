//! Binary and counting semaphores
//!
//! Unlike mutexes, semaphores have no owner and no priority inheritance,
//! and can be given from interrupt context.

use core::cell::Cell;

use crate::kernel::list::WaitList;
use crate::kernel::Kernel;
use crate::types::{KernelError, Result};

/// A binary semaphore for task synchronization.
///
/// Useful for signaling between tasks or from an ISR to a task. Giving an
/// already-given semaphore has no effect.
///
/// # Example
///
/// ```ignore
/// use rtkernel::sync::BinarySemaphore;
///
/// static DATA_READY: BinarySemaphore<'static> = BinarySemaphore::new(&KERNEL);
///
/// // In one task: wait for signal
/// DATA_READY.take(INFINITE)?;
///
/// // In another task or ISR: signal
/// DATA_READY.give();
/// ```
pub struct BinarySemaphore<'k> {
    kernel: &'k Kernel,
    available: critical_section::Mutex<Cell<bool>>,
    waiters: WaitList,
}

impl<'k> BinarySemaphore<'k> {
    /// Creates a binary semaphore in the "not given" state.
    pub const fn new(kernel: &'k Kernel) -> Self {
        BinarySemaphore {
            kernel,
            available: critical_section::Mutex::new(Cell::new(false)),
            waiters: WaitList::new(),
        }
    }

    /// Signal the semaphore and wake one waiter. Interrupt-safe.
    pub fn give(&self) {
        self.kernel.with(|cs, sched| {
            self.available.borrow(cs).set(true);
            sched.unblock_one(cs, &self.waiters);
        });
    }

    /// Take the semaphore, blocking for at most `timeout_ms`.
    pub fn take(&self, timeout_ms: u32) -> Result<()> {
        self.kernel.block_on(&self.waiters, timeout_ms, |cs, _| {
            if self.available.borrow(cs).replace(false) {
                Ok(())
            } else {
                Err(KernelError::Timeout)
            }
        })
    }

    /// Take without blocking; fails with [`KernelError::Timeout`].
    pub fn try_take(&self) -> Result<()> {
        self.take(0)
    }

    /// 1 if given, 0 otherwise.
    pub fn count(&self) -> u32 {
        critical_section::with(|cs| u32::from(self.available.borrow(cs).get()))
    }
}

/// A counting semaphore holding up to `MAX` units.
///
/// Useful for managing a pool of resources or counting events.
///
/// # Example
///
/// ```ignore
/// use rtkernel::sync::CountingSemaphore;
///
/// // Three identical DMA channels, all free
/// static CHANNELS: CountingSemaphore<'static, 3> = CountingSemaphore::new(&KERNEL, 3);
///
/// CHANNELS.take(INFINITE)?;
/// // ... use a channel ...
/// CHANNELS.give()?;
/// ```
pub struct CountingSemaphore<'k, const MAX: u32> {
    kernel: &'k Kernel,
    count: critical_section::Mutex<Cell<u32>>,
    waiters: WaitList,
}

impl<'k, const MAX: u32> CountingSemaphore<'k, MAX> {
    const MAX_OK: () = assert!(MAX > 0, "counting semaphore needs MAX > 0");

    /// Creates a counting semaphore. `initial` is clamped to `MAX`.
    pub const fn new(kernel: &'k Kernel, initial: u32) -> Self {
        let () = Self::MAX_OK;
        let initial = if initial > MAX { MAX } else { initial };
        CountingSemaphore {
            kernel,
            count: critical_section::Mutex::new(Cell::new(initial)),
            waiters: WaitList::new(),
        }
    }

    /// Add one unit and wake one waiter. Interrupt-safe.
    ///
    /// At `MAX` the count is left unchanged and
    /// [`KernelError::QueueFull`] is returned.
    pub fn give(&self) -> Result<()> {
        self.kernel.with(|cs, sched| {
            let count = self.count.borrow(cs);
            if count.get() >= MAX {
                return Err(KernelError::QueueFull);
            }
            count.set(count.get() + 1);
            sched.unblock_one(cs, &self.waiters);
            Ok(())
        })
    }

    /// Take one unit, blocking for at most `timeout_ms`.
    pub fn take(&self, timeout_ms: u32) -> Result<()> {
        self.kernel.block_on(&self.waiters, timeout_ms, |cs, _| {
            let count = self.count.borrow(cs);
            match count.get() {
                0 => Err(KernelError::Timeout),
                n => {
                    count.set(n - 1);
                    Ok(())
                }
            }
        })
    }

    /// Take without blocking; fails with [`KernelError::Timeout`].
    pub fn try_take(&self) -> Result<()> {
        self.take(0)
    }

    pub fn count(&self) -> u32 {
        critical_section::with(|cs| self.count.borrow(cs).get())
    }

    pub const fn max_count(&self) -> u32 {
        MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static KERNEL: Kernel = Kernel::new();

    #[test]
    fn test_binary_give_is_idempotent() {
        let sem = BinarySemaphore::new(&KERNEL);
        for _ in 0..5 {
            sem.give();
        }
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.try_take(), Ok(()));
        assert_eq!(sem.try_take(), Err(KernelError::Timeout));
    }

    #[test]
    fn test_counting_saturates_at_max() {
        let sem: CountingSemaphore<'_, 2> = CountingSemaphore::new(&KERNEL, 0);
        assert_eq!(sem.give(), Ok(()));
        assert_eq!(sem.give(), Ok(()));
        assert_eq!(sem.give(), Err(KernelError::QueueFull));
        assert_eq!(sem.count(), 2);
        assert_eq!(sem.try_take(), Ok(()));
        assert_eq!(sem.try_take(), Ok(()));
        assert_eq!(sem.try_take(), Err(KernelError::Timeout));
    }

    #[test]
    fn test_counting_initial_clamped() {
        let sem: CountingSemaphore<'_, 4> = CountingSemaphore::new(&KERNEL, 9);
        assert_eq!(sem.count(), 4);
        assert_eq!(sem.max_count(), 4);
    }
}
