//! Bounded message queue
//!
//! A fixed-capacity FIFO of `T` values copied in and out. Capacity is a
//! const generic, so the storage lives inside the queue object and a
//! `static` queue needs no allocator.

use core::cell::RefCell;
use core::mem::{size_of, MaybeUninit};

use crate::config::MAX_IPC_MESSAGE_SIZE;
use crate::kernel::list::WaitList;
use crate::kernel::Kernel;
use crate::types::{KernelError, Result};

/// Types that may travel through a [`Queue`].
///
/// # Safety
///
/// Implementors must be plain data: no pointers or references, so a copy
/// received by another task never aliases the sender's memory.
pub unsafe trait IpcMessage: Copy + Send + 'static {}

macro_rules! impl_ipc_message {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl IpcMessage for $t {})*
    };
}

impl_ipc_message!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

unsafe impl<T: IpcMessage, const M: usize> IpcMessage for [T; M] {}
unsafe impl<A: IpcMessage, B: IpcMessage> IpcMessage for (A, B) {}
unsafe impl<A: IpcMessage, B: IpcMessage, C: IpcMessage> IpcMessage for (A, B, C) {}

/// Circular buffer behind a queue. `N` is a power of two, so indices wrap
/// with a mask.
struct Ring<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    head: usize,
    tail: usize,
    len: usize,
}

impl<T: Copy, const N: usize> Ring<T, N> {
    const MASK: usize = N - 1;

    const fn new() -> Self {
        Ring { slots: [const { MaybeUninit::uninit() }; N], head: 0, tail: 0, len: 0 }
    }

    fn push(&mut self, item: T) -> Result<()> {
        if self.len == N {
            return Err(KernelError::QueueFull);
        }
        self.slots[self.tail].write(item);
        self.tail = (self.tail + 1) & Self::MASK;
        self.len += 1;
        Ok(())
    }

    fn peek(&self) -> Result<T> {
        if self.len == 0 {
            return Err(KernelError::QueueEmpty);
        }
        // SAFETY: slots between head and tail were written by `push`.
        Ok(unsafe { self.slots[self.head].assume_init() })
    }

    fn pop(&mut self) -> Result<T> {
        let item = self.peek()?;
        self.head = (self.head + 1) & Self::MASK;
        self.len -= 1;
        Ok(item)
    }

    fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}

/// A type-safe FIFO queue for inter-task communication.
///
/// # Example
///
/// ```ignore
/// use rtkernel::sync::Queue;
///
/// static READINGS: Queue<'static, i16, 8> = Queue::new(&KERNEL);
///
/// // Producer
/// READINGS.send(adc_read(), 10)?;
///
/// // Consumer
/// let sample = READINGS.receive(INFINITE)?;
/// ```
///
/// # Memory Layout
///
/// The queue stores items by value (copying them). For large types,
/// consider sending indices into a [`Pool`](crate::memory::Pool) instead.
pub struct Queue<'k, T: IpcMessage, const N: usize> {
    kernel: &'k Kernel,
    ring: critical_section::Mutex<RefCell<Ring<T, N>>>,
    senders: WaitList,
    receivers: WaitList,
}

impl<'k, T: IpcMessage, const N: usize> Queue<'k, T, N> {
    const LAYOUT_OK: () = {
        assert!(N >= 2 && N.is_power_of_two(), "queue capacity must be a power of two >= 2");
        assert!(size_of::<T>() <= MAX_IPC_MESSAGE_SIZE, "queue item exceeds MAX_IPC_MESSAGE_SIZE");
    };

    pub const fn new(kernel: &'k Kernel) -> Self {
        let () = Self::LAYOUT_OK;
        Queue {
            kernel,
            ring: critical_section::Mutex::new(RefCell::new(Ring::new())),
            senders: WaitList::new(),
            receivers: WaitList::new(),
        }
    }

    /// Append without blocking; [`KernelError::QueueFull`] if full.
    pub fn try_send(&self, item: T) -> Result<()> {
        self.send(item, 0)
    }

    /// Remove the oldest item without blocking; [`KernelError::QueueEmpty`]
    /// if empty.
    pub fn try_receive(&self) -> Result<T> {
        self.receive(0)
    }

    /// Append, blocking for at most `timeout_ms` while full.
    ///
    /// A zero timeout fails with [`KernelError::QueueFull`]; an expired
    /// wait fails with [`KernelError::Timeout`].
    pub fn send(&self, item: T, timeout_ms: u32) -> Result<()> {
        self.kernel.block_on(&self.senders, timeout_ms, |cs, sched| {
            self.ring.borrow_ref_mut(cs).push(item)?;
            sched.unblock_one(cs, &self.receivers);
            Ok(())
        })
    }

    /// Remove the oldest item, blocking for at most `timeout_ms` while
    /// empty.
    pub fn receive(&self, timeout_ms: u32) -> Result<T> {
        self.kernel.block_on(&self.receivers, timeout_ms, |cs, sched| {
            let item = self.ring.borrow_ref_mut(cs).pop()?;
            sched.unblock_one(cs, &self.senders);
            Ok(item)
        })
    }

    /// Copy of the oldest item, left in place.
    pub fn try_peek(&self) -> Result<T> {
        critical_section::with(|cs| self.ring.borrow_ref(cs).peek())
    }

    /// Drop every queued item and wake all blocked senders.
    pub fn reset(&self) {
        self.kernel.with(|cs, sched| {
            self.ring.borrow_ref_mut(cs).clear();
            sched.unblock_all(cs, &self.senders);
        });
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.ring.borrow_ref(cs).len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static KERNEL: Kernel = Kernel::new();

    #[test]
    fn test_fifo_across_wraparound() {
        let q: Queue<'_, u32, 4> = Queue::new(&KERNEL);
        for i in 0..4 {
            assert_eq!(q.try_send(i), Ok(()));
        }
        assert_eq!(q.try_send(4), Err(KernelError::QueueFull));
        assert_eq!(q.try_receive(), Ok(0));
        assert_eq!(q.try_receive(), Ok(1));
        assert_eq!(q.try_send(100), Ok(()));
        assert_eq!(q.try_send(101), Ok(()));
        for expected in [2, 3, 100, 101] {
            assert_eq!(q.try_receive(), Ok(expected));
        }
        assert_eq!(q.try_receive(), Err(KernelError::QueueEmpty));
    }

    #[test]
    fn test_peek_and_reset() {
        let q: Queue<'_, (u8, u16), 2> = Queue::new(&KERNEL);
        assert_eq!(q.try_peek(), Err(KernelError::QueueEmpty));
        q.try_send((1, 300)).unwrap();
        assert_eq!(q.try_peek(), Ok((1, 300)));
        assert_eq!(q.len(), 1);
        q.try_send((2, 400)).unwrap();
        assert!(q.is_full());
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn test_blocking_calls_outside_task_context_fail_fast() {
        let q: Queue<'_, [u8; 8], 2> = Queue::new(&KERNEL);
        assert_eq!(q.receive(50), Err(KernelError::QueueEmpty));
    }
}
