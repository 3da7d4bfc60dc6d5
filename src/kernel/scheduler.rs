/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Scheduler state machine: task table, ready queue, delayed
 * list, tick count and the transitions between task states. Contains no
 * port code; `Kernel` wraps it in the critical section and turns a pending
 * switch into a port request.
 */

//! Scheduler
//!
//! ```text
//!            reschedule              delay               tick
//!   Ready <-------------> Running ---------> Delayed ----------> Ready
//!                            |   block               unblock/timeout
//!                            +-----------> Blocked -------------> Ready
//!   any --suspend--> Suspended --resume--> Ready
//! ```
//!
//! The running task stays linked on its ready list. Every other state
//! change moves the task's single link between lists, see [`list`].
//!
//! [`list`]: crate::kernel::list

use critical_section::CriticalSection;

use crate::config::{config_assert, MAX_TASKS};
use crate::kernel::list::{ListTag, TaskList, WaitList, WaitRef};
use crate::kernel::ready::ReadyQueue;
use crate::kernel::tasks::{StackRegion, TaskControlBlock};
use crate::sync::notification::NotificationSlot;
use crate::trace;
use crate::types::{KernelError, Priority, Result, TaskId, TaskState, Ticks};

/// `true` once `now` has reached or passed `at`, across counter wraparound.
#[inline(always)]
pub(crate) fn tick_reached(now: Ticks, at: Ticks) -> bool {
    (now.wrapping_sub(at) as i32) >= 0
}

pub(crate) struct Scheduler {
    tasks: [TaskControlBlock; MAX_TASKS],
    count: usize,
    ready: ReadyQueue,
    delayed: TaskList,
    current: Option<TaskId>,
    /// Task on whose behalf the current critical section runs; `None` for
    /// interrupts and foreign threads.
    caller: Option<TaskId>,
    tick: Ticks,
    started: bool,
    idle: bool,
    switch_from: Option<TaskId>,
    switch_to: Option<TaskId>,
}

impl Scheduler {
    pub(crate) const fn new() -> Self {
        Scheduler {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            count: 0,
            ready: ReadyQueue::new(),
            delayed: TaskList::new(),
            current: None,
            caller: None,
            tick: 0,
            started: false,
            idle: false,
            switch_from: None,
            switch_to: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline(always)]
    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    #[inline(always)]
    pub(crate) fn caller(&self) -> Option<TaskId> {
        self.caller
    }

    #[inline(always)]
    pub(crate) fn set_caller(&mut self, caller: Option<TaskId>) {
        self.caller = caller;
    }

    #[inline(always)]
    pub(crate) fn tick_count(&self) -> Ticks {
        self.tick
    }

    #[inline(always)]
    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    #[inline(always)]
    pub(crate) fn task_count(&self) -> usize {
        self.count
    }

    #[inline(always)]
    pub(crate) fn task(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id.index()]
    }

    #[inline(always)]
    pub(crate) fn notification_mut(&mut self, id: TaskId) -> &mut NotificationSlot {
        &mut self.tasks[id.index()].notification
    }

    pub(crate) fn is_registered(&self, id: TaskId) -> bool {
        id.index() < MAX_TASKS && self.tasks[id.index()].in_use
    }

    /// The caller is scheduled to run (or is not a task at all).
    pub(crate) fn caller_may_continue(&self) -> bool {
        match self.caller {
            Some(id) => self.tasks[id.index()].state == TaskState::Running,
            None => true,
        }
    }

    // =========================================================================
    // Registration and start
    // =========================================================================

    pub(crate) fn register(
        &mut self,
        name: &'static str,
        priority: Priority,
        stack: StackRegion,
    ) -> Result<TaskId> {
        let Some(index) = self.tasks.iter().position(|tcb| !tcb.in_use) else {
            return Err(KernelError::NoMemory);
        };
        let id = TaskId::from_index(index);
        self.count += 1;
        self.tasks[index] = TaskControlBlock {
            in_use: true,
            name,
            priority,
            base_priority: priority,
            stack,
            ..TaskControlBlock::EMPTY
        };
        trace::task_registered(id, name, priority);
        Ok(id)
    }

    /// Give back the slot of a task that was registered but never made
    /// ready.
    pub(crate) fn release(&mut self, id: TaskId) {
        let tcb = &mut self.tasks[id.index()];
        config_assert(tcb.in_use && tcb.list == ListTag::Detached, "released slot is in use");
        *tcb = TaskControlBlock::EMPTY;
        self.count -= 1;
    }

    /// Mark the scheduler running and select the first task.
    pub(crate) fn start(&mut self) -> Option<TaskId> {
        self.started = true;
        self.current = self.ready.highest();
        match self.current {
            Some(id) => self.tasks[id.index()].state = TaskState::Running,
            None => {
                self.idle = true;
                trace::no_ready_task();
            }
        }
        self.current
    }

    // =========================================================================
    // Ready queue transitions
    // =========================================================================

    pub(crate) fn make_ready(&mut self, id: TaskId) {
        let tcb = &mut self.tasks[id.index()];
        config_assert(tcb.list == ListTag::Detached, "task made ready while linked");
        tcb.state = TaskState::Ready;
        tcb.deadline = None;
        self.ready.insert(&mut self.tasks, id);
    }

    pub(crate) fn make_not_ready(&mut self, id: TaskId) {
        self.ready.remove(&mut self.tasks, id);
    }

    /// Select the highest-priority ready task and, if it is not the current
    /// one, record a pending switch.
    pub(crate) fn reschedule(&mut self) {
        if !self.started {
            return;
        }
        let Some(next) = self.ready.highest() else {
            if !self.idle {
                self.idle = true;
                trace::no_ready_task();
            }
            return;
        };
        self.idle = false;
        if self.current == Some(next) {
            self.tasks[next.index()].state = TaskState::Running;
            return;
        }
        if let Some(cur) = self.current {
            let tcb = &mut self.tasks[cur.index()];
            if tcb.state == TaskState::Running {
                tcb.state = TaskState::Ready;
            }
        }
        if self.switch_to.is_none() {
            self.switch_from = self.current;
        }
        self.tasks[next.index()].state = TaskState::Running;
        self.current = Some(next);
        self.switch_to = Some(next);
    }

    /// Pending switch as `(from, to)`, cleared on read.
    pub(crate) fn take_switch(&mut self) -> Option<(Option<TaskId>, TaskId)> {
        let to = self.switch_to.take()?;
        let from = self.switch_from.take();
        if from == Some(to) {
            None
        } else {
            Some((from, to))
        }
    }

    pub(crate) fn add_run_time(&mut self, id: TaskId, us: u64) {
        let tcb = &mut self.tasks[id.index()];
        tcb.run_time_us = tcb.run_time_us.wrapping_add(us);
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Advance the tick count, wake delayed tasks that are due, time out
    /// blocked tasks whose deadline passed, then reschedule.
    pub(crate) fn tick(&mut self, cs: CriticalSection<'_>) {
        self.tick = self.tick.wrapping_add(1);
        if !self.started {
            return;
        }
        let now = self.tick;

        let mut cursor = self.delayed.first();
        while let Some(id) = cursor {
            cursor = self.tasks[id.index()].next;
            if tick_reached(now, self.tasks[id.index()].wake_time) {
                self.delayed.remove(&mut self.tasks, id);
                self.make_ready(id);
            }
        }

        for index in 0..MAX_TASKS {
            let tcb = &self.tasks[index];
            if tcb.state != TaskState::Blocked {
                continue;
            }
            match tcb.deadline {
                Some(at) if tick_reached(now, at) => {}
                _ => continue,
            }
            let id = TaskId::from_index(index);
            self.unlink(cs, id);
            trace::task_timed_out(id, now);
            self.make_ready(id);
        }

        self.reschedule();
    }

    /// Detach `id` from whatever list it is on and drop any pending wait.
    fn unlink(&mut self, cs: CriticalSection<'_>, id: TaskId) {
        match self.tasks[id.index()].list {
            ListTag::Detached => {}
            ListTag::Ready(_) => self.ready.remove(&mut self.tasks, id),
            ListTag::Delayed => {
                self.delayed.remove(&mut self.tasks, id);
            }
            ListTag::Waiting(wait) => {
                // SAFETY: the task is still blocked on this list, so the
                // owning object is still borrowed by the blocking call.
                let waiters = unsafe { wait.get() };
                let tasks = &mut self.tasks;
                let found = waiters.update(cs, |list| list.remove(tasks, id));
                config_assert(found, "wait tag does not match wait list");
            }
        }
        let tcb = &mut self.tasks[id.index()];
        tcb.awaiting_notification = false;
        tcb.deadline = None;
    }

    // =========================================================================
    // Delay
    // =========================================================================

    /// Put the calling task to sleep for `ticks`. Zero only reschedules.
    pub(crate) fn delay_caller(&mut self, ticks: Ticks) {
        let Some(id) = self.caller else {
            return;
        };
        if ticks == 0 {
            self.reschedule();
            return;
        }
        self.make_not_ready(id);
        let wake_time = self.tick.wrapping_add(ticks);
        let tcb = &mut self.tasks[id.index()];
        tcb.wake_time = wake_time;
        tcb.state = TaskState::Delayed;
        self.delayed.push_front(&mut self.tasks, id, ListTag::Delayed);
        trace::task_delayed(id, wake_time);
        self.reschedule();
    }

    // =========================================================================
    // Blocking on wait lists
    // =========================================================================

    /// Move the calling task from the ready queue onto `waiters`.
    /// Returns `false` when there is no calling task to block.
    pub(crate) fn block_caller(
        &mut self,
        cs: CriticalSection<'_>,
        waiters: &WaitList,
        deadline: Option<Ticks>,
    ) -> bool {
        let Some(id) = self.caller else {
            return false;
        };
        self.make_not_ready(id);
        let tag = waiters.tag();
        let tasks = &mut self.tasks;
        waiters.update(cs, |list| list.push_front(tasks, id, tag));
        let tcb = &mut self.tasks[id.index()];
        tcb.state = TaskState::Blocked;
        tcb.deadline = deadline;
        trace::task_blocked(id, deadline);
        self.reschedule();
        true
    }

    /// Wake the most recently blocked task on `waiters`.
    pub(crate) fn unblock_one(&mut self, cs: CriticalSection<'_>, waiters: &WaitList) -> Option<TaskId> {
        let tasks = &mut self.tasks;
        let id = waiters.update(cs, |list| list.pop_front(tasks))?;
        self.wake(id);
        Some(id)
    }

    /// Wake every task on `waiters`. Returns how many were woken.
    pub(crate) fn unblock_all(&mut self, cs: CriticalSection<'_>, waiters: &WaitList) -> usize {
        let mut woken = 0;
        while self.unblock_one(cs, waiters).is_some() {
            woken += 1;
        }
        woken
    }

    fn wake(&mut self, id: TaskId) {
        self.tasks[id.index()].awaiting_notification = false;
        self.make_ready(id);
        trace::task_unblocked(id);
        self.reschedule();
    }

    /// Highest effective priority among tasks blocked on `waiters`.
    pub(crate) fn highest_waiter(&self, cs: CriticalSection<'_>, waiters: &WaitList) -> Option<Priority> {
        waiters
            .get(cs)
            .iter(&self.tasks)
            .map(|id| self.tasks[id.index()].priority)
            .max()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Block the calling task until its notification slot is written.
    pub(crate) fn block_caller_on_notification(&mut self, deadline: Option<Ticks>) -> bool {
        let Some(id) = self.caller else {
            return false;
        };
        self.make_not_ready(id);
        let tcb = &mut self.tasks[id.index()];
        tcb.state = TaskState::Blocked;
        tcb.awaiting_notification = true;
        tcb.deadline = deadline;
        trace::task_blocked(id, deadline);
        self.reschedule();
        true
    }

    /// Wake `id` if it is blocked waiting for a notification.
    pub(crate) fn wake_notified(&mut self, id: TaskId) {
        let tcb = &self.tasks[id.index()];
        if tcb.awaiting_notification && tcb.state == TaskState::Blocked {
            self.wake(id);
        }
    }

    // =========================================================================
    // Priorities
    // =========================================================================

    /// Change the effective priority, moving the task between ready lists
    /// if it is on one.
    fn set_effective_priority(&mut self, id: TaskId, priority: Priority) {
        if self.tasks[id.index()].priority == priority {
            return;
        }
        if let ListTag::Ready(_) = self.tasks[id.index()].list {
            self.ready.remove(&mut self.tasks, id);
            self.tasks[id.index()].priority = priority;
            self.ready.insert(&mut self.tasks, id);
        } else {
            self.tasks[id.index()].priority = priority;
        }
        self.reschedule();
    }

    /// Raise `holder` to `priority` if that is higher than its current
    /// effective priority.
    pub(crate) fn inherit_priority(&mut self, holder: TaskId, priority: Priority) {
        let from = self.tasks[holder.index()].priority;
        if priority > from {
            trace::priority_inherit(holder, from, priority);
            self.set_effective_priority(holder, priority);
        }
    }

    /// Record that `holder` now owns the mutex whose waiters are `waiters`.
    pub(crate) fn hold_mutex(&mut self, holder: TaskId, waiters: &WaitList) -> Result<()> {
        let held = &mut self.tasks[holder.index()].held;
        let slot = held.iter_mut().find(|slot| slot.is_none()).ok_or(KernelError::NoMemory)?;
        *slot = Some(WaitRef::new(waiters));
        Ok(())
    }

    /// Forget the mutex whose waiters are `waiters`.
    pub(crate) fn release_mutex(&mut self, holder: TaskId, waiters: &WaitList) {
        let target = WaitRef::new(waiters);
        for slot in self.tasks[holder.index()].held.iter_mut() {
            if *slot == Some(target) {
                *slot = None;
            }
        }
    }

    /// Effective priority `id` is entitled to: its base priority, raised to
    /// the highest task waiting on any mutex it holds.
    pub(crate) fn entitled_priority(&self, cs: CriticalSection<'_>, id: TaskId) -> Priority {
        let tcb = &self.tasks[id.index()];
        tcb.held
            .iter()
            .flatten()
            .filter_map(|held| {
                // SAFETY: a mutex is on its owner's held list only while
                // owned and alive, see `Mutex::drop`.
                let waiters = unsafe { held.get() };
                self.highest_waiter(cs, waiters)
            })
            .fold(tcb.base_priority, Priority::max)
    }

    /// Move `id` to the priority it is entitled to, up or down.
    pub(crate) fn refresh_priority(&mut self, cs: CriticalSection<'_>, id: TaskId) {
        let from = self.tasks[id.index()].priority;
        let to = self.entitled_priority(cs, id);
        if to > from {
            trace::priority_inherit(id, from, to);
        } else if to < from {
            trace::priority_disinherit(id, from, to);
        } else {
            return;
        }
        self.set_effective_priority(id, to);
    }

    /// Set the base priority. An inherited priority above the new base is
    /// kept while the mutex that justifies it is held.
    pub(crate) fn set_priority(&mut self, cs: CriticalSection<'_>, id: TaskId, priority: Priority) {
        self.tasks[id.index()].base_priority = priority;
        trace::task_priority_set(id, priority);
        self.refresh_priority(cs, id);
    }

    // =========================================================================
    // Suspend / resume
    // =========================================================================

    pub(crate) fn suspend(&mut self, cs: CriticalSection<'_>, id: TaskId) {
        if !self.is_registered(id) || self.tasks[id.index()].state == TaskState::Suspended {
            return;
        }
        self.unlink(cs, id);
        self.tasks[id.index()].state = TaskState::Suspended;
        trace::task_suspended(id);
        self.reschedule();
    }

    /// Returns `false` if the task was not suspended.
    pub(crate) fn resume(&mut self, id: TaskId) -> bool {
        if !self.is_registered(id) || self.tasks[id.index()].state != TaskState::Suspended {
            return false;
        }
        self.make_ready(id);
        trace::task_resumed(id);
        self.reschedule();
        true
    }

    /// Take the calling task out of scheduling for good.
    pub(crate) fn retire_caller(&mut self, cs: CriticalSection<'_>) {
        if let Some(id) = self.caller {
            trace::task_retired(id, self.tasks[id.index()].name);
            self.suspend(cs, id);
        }
    }
}
