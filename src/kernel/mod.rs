/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] The kernel context: the scheduler state behind the critical
 * section, the saved contexts of every task, and the port. One `Kernel`
 * value is constructed (normally as a `static`), tasks are registered with
 * it, and `start` hands control to the first task for good.
 */

//! Kernel Core
//!
//! - [`list`] - intrusive task lists and wait lists
//! - `ready` - priority-bitmap ready queue
//! - `scheduler` - task state machine
//! - [`tasks`] - task control blocks and static task objects
//!
//! ## Lifecycle
//!
//! 1. `static KERNEL: Kernel = Kernel::new();`
//! 2. [`Kernel::register`] every [`Task`] (before or after start)
//! 3. [`Kernel::start`] - never returns
//!
//! Every kernel operation runs its scheduler mutation inside
//! `critical_section::with`, then asks the port for a context switch if the
//! mutation selected a different task.

pub(crate) mod list;
pub(crate) mod ready;
pub(crate) mod scheduler;
pub mod tasks;

use core::cell::{Cell, RefCell};

use critical_section::CriticalSection;

use crate::config::{ms_to_ticks, MAX_TASKS};
use crate::port::{Context, Platform, Port, TaskImage};
use crate::trace;
use crate::types::{KernelError, Priority, Result, TaskId, TaskState, Ticks, INFINITE};

use self::list::WaitList;
use self::scheduler::{tick_reached, Scheduler};
use self::tasks::{task_trampoline, TaskHeader};

pub use self::tasks::{StackRegion, Task, TaskFn};

// =============================================================================
// Deadlines
// =============================================================================

/// Absolute deadline of a blocking call, fixed the first time the call has
/// to block.
pub(crate) struct Deadline {
    ticks: Ticks,
    at: Option<Ticks>,
}

impl Deadline {
    pub(crate) fn new(timeout_ms: u32) -> Self {
        Deadline { ticks: ms_to_ticks(timeout_ms), at: None }
    }

    /// Zero timeout: never block.
    #[inline]
    pub(crate) fn is_poll(&self) -> bool {
        self.ticks == 0
    }

    /// Absolute tick of the deadline, `None` for [`INFINITE`].
    pub(crate) fn at(&mut self, now: Ticks) -> Option<Ticks> {
        if self.ticks == INFINITE {
            return None;
        }
        Some(*self.at.get_or_insert(now.wrapping_add(self.ticks)))
    }

    pub(crate) fn expired(&mut self, now: Ticks) -> bool {
        match self.at(now) {
            Some(at) => tick_reached(now, at),
            None => false,
        }
    }
}

// =============================================================================
// Kernel
// =============================================================================

/// A kernel instance.
pub struct Kernel {
    sched: critical_section::Mutex<RefCell<Scheduler>>,
    contexts: [Context; MAX_TASKS],
    switched_at: critical_section::Mutex<Cell<u64>>,
    port: Platform,
}

// Safety: the scheduler is only reached through the critical section; a
// context slot is only written by the port while its task is switched out.
unsafe impl Sync for Kernel {}

impl Kernel {
    pub const fn new() -> Self {
        Kernel {
            sched: critical_section::Mutex::new(RefCell::new(Scheduler::new())),
            contexts: [const { Context::new() }; MAX_TASKS],
            switched_at: critical_section::Mutex::new(Cell::new(0)),
            port: Platform::new(),
        }
    }

    // =========================================================================
    // Critical section plumbing
    // =========================================================================

    /// Run `f` on the scheduler inside the critical section, then hand any
    /// switch it requested to the port.
    ///
    /// A task that is still current but no longer running (suspended or
    /// blocked by someone else while nothing was ready to replace it) waits
    /// here until it is running again.
    pub(crate) fn with<R>(&self, f: impl FnOnce(CriticalSection<'_>, &mut Scheduler) -> R) -> R {
        let mut f = Some(f);
        loop {
            self.port.switch_point();
            let done = critical_section::with(|cs| {
                if !self.port.may_run() {
                    return None;
                }
                let mut sched = self.sched.borrow_ref_mut(cs);
                let caller = if sched.is_started() && self.port.in_task_context() {
                    sched.current()
                } else {
                    None
                };
                sched.set_caller(caller);
                if !sched.caller_may_continue() {
                    sched.set_caller(None);
                    return Some(None);
                }
                let f = f.take()?;
                let r = f(cs, &mut sched);
                sched.set_caller(None);
                self.dispatch(cs, &mut sched);
                Some(Some(r))
            });
            match done {
                Some(Some(r)) => {
                    self.port.switch_point();
                    return r;
                }
                Some(None) => self.port.wait_for_interrupt(),
                None => {}
            }
        }
    }

    /// Read-only view of the scheduler.
    fn inspect<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        critical_section::with(|cs| f(&self.sched.borrow_ref(cs)))
    }

    fn dispatch(&self, cs: CriticalSection<'_>, sched: &mut Scheduler) {
        let Some((from, to)) = sched.take_switch() else {
            return;
        };
        let now = self.port.micros();
        let since = self.switched_at.borrow(cs).replace(now);
        if let Some(from) = from {
            sched.add_run_time(from, now.wrapping_sub(since));
        }
        trace::task_switched(from, to);
        self.port.trigger_switch(to, &self.contexts[to.index()]);
    }

    /// Wait until the calling task is scheduled again after it delayed,
    /// blocked or suspended itself. If nothing else is ready the caller
    /// stays current and idles here.
    pub(crate) fn settle(&self) {
        self.with(|_, _| ());
    }

    /// Retry-after-wake loop shared by every blocking primitive.
    ///
    /// `attempt` runs inside the critical section. On failure the caller
    /// blocks on `waiters` until woken or until the deadline, then retries.
    /// A zero timeout returns `attempt`'s own error; an expired deadline
    /// returns [`KernelError::Timeout`].
    pub(crate) fn block_on<T>(
        &self,
        waiters: &WaitList,
        timeout_ms: u32,
        mut attempt: impl FnMut(CriticalSection<'_>, &mut Scheduler) -> Result<T>,
    ) -> Result<T> {
        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let outcome = self.with(|cs, sched| {
                let err = match attempt(cs, sched) {
                    Ok(v) => return Some(Ok(v)),
                    Err(e) => e,
                };
                if deadline.is_poll() {
                    return Some(Err(err));
                }
                let now = sched.tick_count();
                if deadline.expired(now) {
                    return Some(Err(KernelError::Timeout));
                }
                if !sched.block_caller(cs, waiters, deadline.at(now)) {
                    return Some(Err(err));
                }
                None
            });
            match outcome {
                Some(r) => return r,
                None => self.settle(),
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a statically allocated task. It becomes ready immediately;
    /// if the scheduler is running and the task outranks the caller, it
    /// preempts.
    ///
    /// Registering the same task object twice returns the existing id.
    /// Fails with [`KernelError::NoMemory`] when the task table is full.
    pub fn register<const N: usize>(&'static self, task: &'static Task<N>) -> Result<TaskId> {
        let header = task.header();
        if let Some(id) = header.id() {
            return Ok(id);
        }
        let stack = task.stack_region();
        let id = self.with(|_, sched| sched.register(header.name(), header.priority(), stack))?;

        let image = TaskImage {
            id,
            name: header.name(),
            stack,
            entry: task_trampoline,
            arg: header as *const TaskHeader as usize,
        };
        // SAFETY: the stack belongs to this task object and nothing has run
        // on it yet.
        let sp = unsafe {
            stack.paint();
            self.port.init_stack(image)
        };
        let sp = match sp {
            Ok(sp) => sp,
            Err(e) => {
                self.with(|_, sched| sched.release(id));
                return Err(e);
            }
        };
        // SAFETY: the task has not been made ready, so it cannot be running.
        unsafe { self.contexts[id.index()].set(sp) };
        header.bind(self, id);

        self.with(|_, sched| {
            sched.make_ready(id);
            sched.reschedule();
        });
        Ok(id)
    }

    /// Start scheduling. Runs the highest-priority registered task and never
    /// returns. With no task registered the kernel idles forever.
    pub fn start(&'static self) -> ! {
        let first = self.with(|_, sched| sched.start());
        match first {
            Some(id) => {
                trace::scheduler_started(id, Platform::NAME);
                critical_section::with(|cs| self.switched_at.borrow(cs).set(self.port.micros()));
                self.port.start_first_task(self, id, &self.contexts[id.index()])
            }
            None => loop {
                self.port.wait_for_interrupt();
            },
        }
    }

    /// Advance time by one tick. Called once per tick period by the port's
    /// timer interrupt (or the host's timer thread).
    pub fn tick(&self) {
        self.with(|cs, sched| sched.tick(cs));
    }

    /// Called from the task trampoline when a task body returns.
    pub(crate) fn retire_current(&self) -> ! {
        loop {
            self.with(|cs, sched| sched.retire_caller(cs));
            self.settle();
        }
    }

    // =========================================================================
    // Calling-task operations
    // =========================================================================

    /// Sleep for `ms` milliseconds. `delay(0)` is [`yield_now`].
    ///
    /// Outside task context (before `start`, from a thread the kernel does
    /// not manage) this busy-waits on the port clock instead, or returns at
    /// once if that clock is not running yet.
    ///
    /// [`yield_now`]: Kernel::yield_now
    pub fn delay(&self, ms: u32) {
        let ticks = ms_to_ticks(ms);
        let is_task = self.with(|_, sched| match sched.caller() {
            Some(_) => {
                sched.delay_caller(ticks);
                true
            }
            None => false,
        });
        if is_task {
            self.settle();
        } else if Platform::FREE_RUNNING_CLOCK || self.is_started() {
            let start = self.port.micros();
            let wait = u64::from(ms) * 1000;
            while self.port.micros_since(start) < wait {
                self.port.wait_for_interrupt();
            }
        }
    }

    /// Let the scheduler pick again. Equal-priority tasks are not rotated,
    /// so this only gives way to a task that now outranks the caller.
    pub fn yield_now(&self) {
        self.with(|_, sched| {
            if sched.caller().is_some() {
                sched.reschedule();
            }
        });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Task selected to run, `None` before `start`.
    pub fn current_task(&self) -> Option<TaskId> {
        self.inspect(Scheduler::current)
    }

    /// Ticks since `start`.
    pub fn tick_count(&self) -> Ticks {
        self.inspect(Scheduler::tick_count)
    }

    pub fn is_started(&self) -> bool {
        self.inspect(Scheduler::is_started)
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.inspect(Scheduler::task_count)
    }

    pub fn task_name(&self, id: TaskId) -> &'static str {
        self.inspect(|s| s.task(id).name)
    }

    pub fn task_state(&self, id: TaskId) -> TaskState {
        self.inspect(|s| s.task(id).state)
    }

    /// Effective priority, including any inherited boost.
    pub fn task_priority(&self, id: TaskId) -> Priority {
        self.inspect(|s| s.task(id).priority)
    }

    pub fn task_base_priority(&self, id: TaskId) -> Priority {
        self.inspect(|s| s.task(id).base_priority)
    }

    /// Microseconds the task has spent running, as of its last switch out.
    pub fn task_run_time_us(&self, id: TaskId) -> u64 {
        self.inspect(|s| s.task(id).run_time_us)
    }

    /// Bytes of stack never touched since registration.
    pub fn stack_high_water_mark(&self, id: TaskId) -> usize {
        let stack = self.inspect(|s| s.task(id).stack);
        stack.untouched_bytes()
    }

    // =========================================================================
    // Task control
    // =========================================================================

    /// Remove a task from scheduling until [`resume`](Kernel::resume).
    /// Suspending the caller parks it here.
    pub fn suspend(&self, id: TaskId) {
        let is_self = self.with(|cs, sched| {
            sched.suspend(cs, id);
            sched.caller() == Some(id)
        });
        if is_self {
            self.settle();
        }
    }

    /// Make a suspended task ready. Returns `false` if it was not suspended.
    pub fn resume(&self, id: TaskId) -> bool {
        self.with(|_, sched| sched.resume(id))
    }

    /// Change a task's base priority.
    pub fn set_priority(&self, id: TaskId, priority: Priority) {
        self.with(|cs, sched| {
            if sched.is_registered(id) {
                sched.set_priority(cs, id, priority);
            }
        });
    }

    // =========================================================================
    // Port access
    // =========================================================================

    pub fn port(&self) -> &Platform {
        &self.port
    }

    /// Port clock, microseconds.
    pub fn micros(&self) -> u64 {
        self.port.micros()
    }

    pub fn micros_since(&self, start: u64) -> u64 {
        self.port.micros_since(start)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_poll_and_infinite() {
        let mut poll = Deadline::new(0);
        assert!(poll.is_poll());
        let mut forever = Deadline::new(INFINITE);
        assert!(!forever.is_poll());
        assert_eq!(forever.at(10), None);
        assert!(!forever.expired(u32::MAX));
        assert_eq!(poll.at(10), Some(10));
    }

    #[test]
    fn test_deadline_is_fixed_at_first_block() {
        let mut d = Deadline::new(5);
        let at = d.at(100).unwrap();
        assert_eq!(d.at(103), Some(at));
        assert!(!d.expired(104));
        assert!(d.expired(at));
    }

    #[test]
    fn test_deadline_across_wrap() {
        let mut d = Deadline::new(10);
        assert_eq!(d.at(u32::MAX - 2), Some(7));
        assert!(!d.expired(u32::MAX));
        assert!(d.expired(7));
    }

    #[test]
    fn test_operations_before_start_do_not_block() {
        static KERNEL: Kernel = Kernel::new();
        assert!(!KERNEL.is_started());
        assert_eq!(KERNEL.current_task(), None);
        let waiters = WaitList::new();
        let r: Result<()> = KERNEL.block_on(&waiters, INFINITE, |_, _| Err(KernelError::QueueEmpty));
        assert_eq!(r, Err(KernelError::QueueEmpty));
        KERNEL.yield_now();
        KERNEL.delay(1);
    }
}
