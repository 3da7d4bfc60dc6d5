/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Task control blocks and statically allocated task objects.
 */

//! Task Control Blocks
//!
//! - [`TaskControlBlock`] - per-task scheduler record, one slot of the
//!   kernel's fixed task table
//! - [`Task`] - a statically allocated task: name, priority, entry function
//!   and its stack, registered once with [`Kernel::register`]
//!
//! [`Kernel::register`]: crate::kernel::Kernel::register

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::config::{config_assert, MAX_HELD_MUTEXES, MIN_STACK_SIZE, STACK_ALIGNMENT, STACK_FILL_BYTE};
use crate::kernel::list::{ListTag, WaitRef};
use crate::kernel::Kernel;
use crate::sync::notification::NotificationSlot;
use crate::types::{KernelError, Priority, Result, TaskId, TaskState, Ticks};

// =============================================================================
// Stack region
// =============================================================================

/// A task's stack: base (lowest address) and size in bytes. Stacks grow down
/// from `base + size` on every supported architecture.
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    pub base: *mut u8,
    pub size: usize,
}

// Safety: a stack region is only written by the task that owns it and by the
// port while that task is not running.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub const EMPTY: StackRegion = StackRegion { base: ptr::null_mut(), size: 0 };

    /// Highest address of the region rounded down to the stack alignment;
    /// the initial stack pointer is built below it.
    pub fn top(&self) -> usize {
        (self.base as usize + self.size) & !(STACK_ALIGNMENT - 1)
    }

    /// Top of the region aligned down to `align`, provided an initial frame
    /// of `frame_bytes` still fits between it and the base.
    pub fn frame_top(&self, align: usize, frame_bytes: usize) -> Result<usize> {
        let top = self.top() & !(align - 1);
        if top < self.base as usize + frame_bytes {
            return Err(KernelError::NoMemory);
        }
        Ok(top)
    }

    /// Fill the whole region with [`STACK_FILL_BYTE`].
    ///
    /// # Safety
    /// The region must not be in use by a running task.
    pub unsafe fn paint(&self) {
        if !self.base.is_null() {
            // SAFETY: region is owned by a not-yet-started task.
            unsafe { ptr::write_bytes(self.base, STACK_FILL_BYTE, self.size) };
        }
    }

    /// Bytes at the bottom of the stack that still hold the fill pattern.
    pub fn untouched_bytes(&self) -> usize {
        if self.base.is_null() {
            return 0;
        }
        let mut n = 0;
        while n < self.size {
            // SAFETY: in bounds; a racing write only makes the answer stale.
            let b = unsafe { ptr::read_volatile(self.base.add(n)) };
            if b != STACK_FILL_BYTE {
                break;
            }
            n += 1;
        }
        n
    }
}

// =============================================================================
// Task Control Block
// =============================================================================

/// Scheduler record of a task.
///
/// The saved stack pointer lives next to the table, in the kernel's context
/// array, because the ports' switch code reads and writes it directly.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TaskControlBlock {
    /// Slot holds a registered task.
    pub in_use: bool,

    /// Descriptive name given at registration. Facilitates debugging only.
    pub name: &'static str,

    /// Effective priority: the base priority, raised while the task holds a
    /// mutex a higher-priority task is waiting for.
    pub priority: Priority,

    /// Priority assigned at registration or by `set_priority`.
    pub base_priority: Priority,

    pub state: TaskState,

    /// Tick at which a delayed task becomes ready.
    pub wake_time: Ticks,

    /// Tick at which a blocked task's wait times out; `None` waits forever.
    pub deadline: Option<Ticks>,

    /// Intrusive link; meaning depends on `list`.
    pub next: Option<TaskId>,
    pub list: ListTag,

    /// Blocked on its own notification slot rather than on a wait list.
    pub awaiting_notification: bool,
    pub notification: NotificationSlot,

    /// Wait lists of the mutexes this task owns. Their waiters decide the
    /// inherited priority.
    pub held: [Option<WaitRef>; MAX_HELD_MUTEXES],

    /// Microseconds spent running, updated at every switch away.
    pub run_time_us: u64,

    pub stack: StackRegion,
}

impl TaskControlBlock {
    pub(crate) const EMPTY: TaskControlBlock = TaskControlBlock {
        in_use: false,
        name: "",
        priority: Priority::Idle,
        base_priority: Priority::Idle,
        state: TaskState::Suspended,
        wake_time: 0,
        deadline: None,
        next: None,
        list: ListTag::Detached,
        awaiting_notification: false,
        notification: NotificationSlot::EMPTY,
        held: [None; MAX_HELD_MUTEXES],
        run_time_us: 0,
        stack: StackRegion::EMPTY,
    };
}

// =============================================================================
// Static task objects
// =============================================================================

/// Signature of a task body. The kernel the task was registered with is
/// passed in; returning from it retires the task.
pub type TaskFn = fn(&'static Kernel);

const UNREGISTERED: u8 = u8::MAX;

/// The part of a [`Task`] that does not depend on its stack size.
pub struct TaskHeader {
    name: &'static str,
    priority: Priority,
    entry: TaskFn,
    id: AtomicU8,
    kernel: AtomicPtr<Kernel>,
}

impl TaskHeader {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Id assigned at registration, if registered.
    pub fn id(&self) -> Option<TaskId> {
        match self.id.load(Ordering::Acquire) {
            UNREGISTERED => None,
            n => Some(TaskId(n)),
        }
    }

    pub(crate) fn bind(&self, kernel: &'static Kernel, id: TaskId) {
        self.kernel.store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
        self.id.store(id.0, Ordering::Release);
    }

    pub(crate) fn entry(&self) -> TaskFn {
        self.entry
    }

    pub(crate) fn kernel(&self) -> Option<&'static Kernel> {
        let k = self.kernel.load(Ordering::Acquire);
        // SAFETY: only ever set from a `&'static Kernel` in `bind`.
        unsafe { k.as_ref() }
    }

    /// Kernel of a task that is being started. Registration binds it
    /// before the task can run.
    pub(crate) fn bound_kernel(&self) -> Option<&'static Kernel> {
        let kernel = self.kernel();
        config_assert(kernel.is_some(), "task started without a kernel");
        kernel
    }
}

#[repr(C, align(8))]
struct Stack<const N: usize>(UnsafeCell<[u8; N]>);

/// A task with an `N`-byte stack, meant to live in a `static`.
///
/// # Example
///
/// ```ignore
/// use rtkernel::{Kernel, Priority, Task};
///
/// static KERNEL: Kernel = Kernel::new();
/// static BLINK: Task<2048> = Task::new("blink", Priority::Normal, blink);
///
/// fn blink(kernel: &'static Kernel) {
///     loop {
///         toggle_led();
///         kernel.delay(500);
///     }
/// }
///
/// fn main() -> ! {
///     KERNEL.register(&BLINK).unwrap();
///     KERNEL.start()
/// }
/// ```
pub struct Task<const N: usize> {
    header: TaskHeader,
    stack: Stack<N>,
}

// Safety: the stack is handed to exactly one execution context by `register`.
unsafe impl<const N: usize> Sync for Task<N> {}

impl<const N: usize> Task<N> {
    const STACK_OK: () = assert!(N >= MIN_STACK_SIZE, "task stack below MIN_STACK_SIZE");

    pub const fn new(name: &'static str, priority: Priority, entry: TaskFn) -> Self {
        let () = Self::STACK_OK;
        Task {
            header: TaskHeader {
                name,
                priority,
                entry,
                id: AtomicU8::new(UNREGISTERED),
                kernel: AtomicPtr::new(ptr::null_mut()),
            },
            stack: Stack(UnsafeCell::new([0; N])),
        }
    }

    pub fn header(&self) -> &TaskHeader {
        &self.header
    }

    /// Id assigned at registration, if registered.
    pub fn id(&self) -> Option<TaskId> {
        self.header.id()
    }

    pub(crate) fn stack_region(&self) -> StackRegion {
        StackRegion { base: self.stack.0.get().cast::<u8>(), size: N }
    }
}

/// First code run by every task: calls the body, then retires the task.
pub(crate) extern "C" fn task_trampoline(arg: usize) {
    // SAFETY: `arg` is the address of a registered, 'static `TaskHeader`.
    let header = unsafe { &*(arg as *const TaskHeader) };
    let Some(kernel) = header.bound_kernel() else {
        return;
    };
    (header.entry())(kernel);
    kernel.retire_current();
}
