//! Task handle
//!
//! A [`TaskHandle`] pairs a [`TaskId`] with the kernel that owns it, so task
//! control and notification calls read naturally at the call site.
//!
//! # Example
//!
//! ```ignore
//! let worker = KERNEL.task(KERNEL.register(&WORKER)?);
//! worker.set_priority(Priority::High);
//! worker.notify(NotifyAction::Increment)?;
//! ```

use crate::kernel::Kernel;
use crate::sync::notification::NotifyAction;
use crate::types::{Priority, Result, TaskId, TaskState};

/// A handle to a registered task.
///
/// The handle is `Copy` and can be freely duplicated.
#[derive(Clone, Copy)]
pub struct TaskHandle<'k> {
    kernel: &'k Kernel,
    id: TaskId,
}

impl Kernel {
    /// Handle for a task registered with this kernel.
    pub fn task(&self, id: TaskId) -> TaskHandle<'_> {
        TaskHandle { kernel: self, id }
    }

    /// Handle for the task currently selected to run.
    pub fn current_handle(&self) -> Option<TaskHandle<'_>> {
        self.current_task().map(|id| self.task(id))
    }
}

impl<'k> TaskHandle<'k> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.kernel.task_name(self.id)
    }

    pub fn state(&self) -> TaskState {
        self.kernel.task_state(self.id)
    }

    /// Effective priority, including any inherited boost.
    pub fn priority(&self) -> Priority {
        self.kernel.task_priority(self.id)
    }

    pub fn set_priority(&self, priority: Priority) {
        self.kernel.set_priority(self.id, priority);
    }

    pub fn suspend(&self) {
        self.kernel.suspend(self.id);
    }

    /// Returns `false` if the task was not suspended.
    pub fn resume(&self) -> bool {
        self.kernel.resume(self.id)
    }

    /// Write the task's notification slot; returns the previous value.
    pub fn notify(&self, action: NotifyAction) -> Result<u32> {
        self.kernel.notify(self.id, action)
    }

    /// `(value, pending)` of the notification slot.
    pub fn notification(&self) -> (u32, bool) {
        self.kernel.notify_peek(self.id)
    }

    pub fn run_time_us(&self) -> u64 {
        self.kernel.task_run_time_us(self.id)
    }

    pub fn stack_high_water_mark(&self) -> usize {
        self.kernel.stack_high_water_mark(self.id)
    }
}

impl core::fmt::Debug for TaskHandle<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}
