//! Task notifications
//!
//! Every task owns one 32-bit notification slot: a lightweight mailbox that
//! any task or interrupt can write and only the owning task can wait on.
//! Waiting does not use a wait list; the waiter is parked off every list
//! and woken directly by `notify`.
//!
//! # Example
//!
//! ```ignore
//! use rtkernel::sync::{NotifyAction, NotifyClear};
//!
//! // Producer (task or ISR)
//! KERNEL.notify(worker_id, NotifyAction::SetBits(RX_READY))?;
//!
//! // Worker
//! let bits = KERNEL.notify_wait(NotifyClear::All, INFINITE)?;
//! ```

use crate::kernel::{Deadline, Kernel};
use crate::types::{KernelError, Result, TaskId};

/// How `notify` writes the target's slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyAction {
    /// OR the bits into the slot.
    SetBits(u32),
    /// Add one, wrapping.
    Increment,
    /// Replace the value unconditionally.
    Overwrite(u32),
    /// Replace the value only if no notification is pending.
    OverwriteIfEmpty(u32),
}

/// What a successful wait does to the slot after reading it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyClear {
    /// Leave the value, consume the pending flag.
    None,
    /// Reset the value to zero.
    All,
    /// Clear these bits of the value.
    Bits(u32),
    /// Subtract one; stays pending while the value is non-zero.
    Decrement,
}

/// Per-task notification state, stored in the task control block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotificationSlot {
    pub value: u32,
    pub pending: bool,
}

impl NotificationSlot {
    pub(crate) const EMPTY: NotificationSlot = NotificationSlot { value: 0, pending: false };

    /// Apply `action`. Returns the value held before the write.
    ///
    /// `OverwriteIfEmpty` on a pending slot fails with
    /// [`KernelError::QueueFull`] and leaves the slot unchanged.
    pub fn apply(&mut self, action: NotifyAction) -> Result<u32> {
        let previous = self.value;
        match action {
            NotifyAction::SetBits(bits) => self.value |= bits,
            NotifyAction::Increment => self.value = self.value.wrapping_add(1),
            NotifyAction::Overwrite(v) => self.value = v,
            NotifyAction::OverwriteIfEmpty(v) => {
                if self.pending {
                    return Err(KernelError::QueueFull);
                }
                self.value = v;
            }
        }
        self.pending = true;
        Ok(previous)
    }

    /// Consume a pending notification, returning the value as it was
    /// before `clear` was applied.
    pub fn take(&mut self, clear: NotifyClear) -> Option<u32> {
        if !self.pending {
            return None;
        }
        let value = self.value;
        match clear {
            NotifyClear::None => self.pending = false,
            NotifyClear::All => {
                self.value = 0;
                self.pending = false;
            }
            NotifyClear::Bits(bits) => {
                self.value &= !bits;
                self.pending = false;
            }
            NotifyClear::Decrement => {
                self.value = self.value.saturating_sub(1);
                self.pending = self.value != 0;
            }
        }
        Some(value)
    }
}

impl Kernel {
    /// Write `task`'s notification slot and wake it if it is waiting.
    /// Returns the previous slot value. Safe to call from interrupts.
    pub fn notify(&self, task: TaskId, action: NotifyAction) -> Result<u32> {
        self.with(|_, sched| {
            if !sched.is_registered(task) {
                return Err(KernelError::InvalidPointer);
            }
            let previous = sched.notification_mut(task).apply(action)?;
            sched.wake_notified(task);
            Ok(previous)
        })
    }

    /// Block the calling task until its slot is notified, for at most
    /// `timeout_ms`. Returns the value read, before `clear` is applied.
    pub fn notify_wait(&self, clear: NotifyClear, timeout_ms: u32) -> Result<u32> {
        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let outcome = self.with(|_, sched| {
                let Some(me) = sched.caller() else {
                    return Some(Err(KernelError::Timeout));
                };
                if let Some(value) = sched.notification_mut(me).take(clear) {
                    return Some(Ok(value));
                }
                if deadline.is_poll() {
                    return Some(Err(KernelError::Timeout));
                }
                let now = sched.tick_count();
                if deadline.expired(now) {
                    return Some(Err(KernelError::Timeout));
                }
                sched.block_caller_on_notification(deadline.at(now));
                None
            });
            match outcome {
                Some(r) => return r,
                None => self.settle(),
            }
        }
    }

    /// Non-blocking [`notify_wait`](Kernel::notify_wait).
    pub fn notify_try_wait(&self, clear: NotifyClear) -> Result<u32> {
        self.notify_wait(clear, 0)
    }

    /// Read `task`'s slot without consuming it: `(value, pending)`.
    pub fn notify_peek(&self, task: TaskId) -> (u32, bool) {
        self.with(|_, sched| {
            let slot = *sched.notification_mut(task);
            (slot.value, slot.pending)
        })
    }
}
