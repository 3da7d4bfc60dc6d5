//! Event flags
//!
//! A 32-bit word of independent flags. Tasks wait for any or all of a set
//! of bits; setters never block.

use core::cell::Cell;

use crate::kernel::list::WaitList;
use crate::kernel::Kernel;
use crate::types::{KernelError, Result};

/// A group of 32 event bits.
///
/// All waiters share one wait list. `set` wakes every one of them and each
/// re-checks its own condition, going back to sleep if it still does not
/// hold.
///
/// Waiting on an empty mask returns `Ok(0)` at once, for both `wait_any`
/// and `wait_all`.
///
/// # Example
///
/// ```ignore
/// use rtkernel::sync::EventFlags;
///
/// const RX: u32 = 1 << 0;
/// const TX: u32 = 1 << 1;
///
/// static LINK: EventFlags<'static> = EventFlags::new(&KERNEL);
///
/// // ISR
/// LINK.set(RX);
///
/// // Task: wait for RX or TX, consume what was seen
/// let seen = LINK.wait_any(RX | TX, INFINITE, true)?;
/// ```
pub struct EventFlags<'k> {
    kernel: &'k Kernel,
    bits: critical_section::Mutex<Cell<u32>>,
    waiters: WaitList,
}

impl<'k> EventFlags<'k> {
    pub const fn new(kernel: &'k Kernel) -> Self {
        EventFlags {
            kernel,
            bits: critical_section::Mutex::new(Cell::new(0)),
            waiters: WaitList::new(),
        }
    }

    /// OR `mask` into the flags and wake every waiter. Returns the new
    /// value. Interrupt-safe.
    pub fn set(&self, mask: u32) -> u32 {
        self.kernel.with(|cs, sched| {
            let bits = self.bits.borrow(cs);
            bits.set(bits.get() | mask);
            sched.unblock_all(cs, &self.waiters);
            bits.get()
        })
    }

    /// Clear the bits in `mask`. Returns the value before clearing.
    pub fn clear(&self, mask: u32) -> u32 {
        critical_section::with(|cs| {
            let bits = self.bits.borrow(cs);
            let old = bits.get();
            bits.set(old & !mask);
            old
        })
    }

    pub fn get(&self) -> u32 {
        critical_section::with(|cs| self.bits.borrow(cs).get())
    }

    /// Wait until at least one bit of `mask` is set. Returns the subset of
    /// `mask` that was set; with `auto_clear` exactly those bits are
    /// cleared.
    pub fn wait_any(&self, mask: u32, timeout_ms: u32, auto_clear: bool) -> Result<u32> {
        self.wait(mask, timeout_ms, auto_clear, |matched| matched != 0)
    }

    /// Wait until every bit of `mask` is set. Returns `mask`; with
    /// `auto_clear` those bits are cleared.
    pub fn wait_all(&self, mask: u32, timeout_ms: u32, auto_clear: bool) -> Result<u32> {
        self.wait(mask, timeout_ms, auto_clear, |matched| matched == mask)
    }

    fn wait(
        &self,
        mask: u32,
        timeout_ms: u32,
        auto_clear: bool,
        satisfied: impl Fn(u32) -> bool,
    ) -> Result<u32> {
        if mask == 0 {
            return Ok(0);
        }
        self.kernel.block_on(&self.waiters, timeout_ms, |cs, _| {
            let bits = self.bits.borrow(cs);
            let matched = bits.get() & mask;
            if !satisfied(matched) {
                return Err(KernelError::Timeout);
            }
            if auto_clear {
                bits.set(bits.get() & !matched);
            }
            Ok(matched)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INFINITE;

    static KERNEL: Kernel = Kernel::new();

    #[test]
    fn test_wait_any_returns_matched_subset() {
        let flags = EventFlags::new(&KERNEL);
        flags.set(0b0110);
        assert_eq!(flags.wait_any(0b0011, 0, false), Ok(0b0010));
        assert_eq!(flags.get(), 0b0110);
        assert_eq!(flags.wait_any(0b0011, 0, true), Ok(0b0010));
        assert_eq!(flags.get(), 0b0100);
        assert_eq!(flags.wait_any(0b0001, 0, true), Err(KernelError::Timeout));
    }

    #[test]
    fn test_wait_all_needs_every_bit() {
        let flags = EventFlags::new(&KERNEL);
        flags.set(0b0001);
        assert_eq!(flags.wait_all(0b0011, 0, true), Err(KernelError::Timeout));
        assert_eq!(flags.get(), 0b0001);
        flags.set(0b1010);
        assert_eq!(flags.wait_all(0b0011, 0, true), Ok(0b0011));
        assert_eq!(flags.get(), 0b1000);
    }

    #[test]
    fn test_empty_mask_returns_at_once() {
        let flags = EventFlags::new(&KERNEL);
        flags.set(0b1);
        assert_eq!(flags.wait_any(0, INFINITE, true), Ok(0));
        assert_eq!(flags.wait_all(0, INFINITE, true), Ok(0));
        assert_eq!(flags.get(), 0b1);
    }

    #[test]
    fn test_clear_returns_previous() {
        let flags = EventFlags::new(&KERNEL);
        flags.set(0xF0);
        assert_eq!(flags.clear(0x30), 0xF0);
        assert_eq!(flags.get(), 0xC0);
    }
}
