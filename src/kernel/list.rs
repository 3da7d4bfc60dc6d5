/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Intrusive task lists. Instead of pointer-linked list items
 * embedded in each TCB, every TCB carries one `next` index into the task
 * table plus a tag naming the list that index currently belongs to.
 */

//! Task Lists
//!
//! Every list the scheduler uses (the per-priority ready lists, the delayed
//! list and each synchronization object's wait list) is a [`TaskList`]: the
//! head index of a singly linked chain threaded through the task table.
//!
//! A task is on at most one list at a time. The [`ListTag`] stored in the TCB
//! records which one, and every insertion and removal asserts the tag
//! transition (`Detached` -> list on insert, list -> `Detached` on remove).
//!
//! Insertion is always at the head, so the most recently inserted task is
//! the first one popped.

use core::cell::Cell;
use core::ptr::NonNull;

use critical_section::CriticalSection;

use crate::config::config_assert;
use crate::kernel::tasks::TaskControlBlock;
use crate::types::{Priority, TaskId};

// =============================================================================
// List tag
// =============================================================================

/// The list a task's `next` link currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListTag {
    /// Not linked anywhere (running-but-blocked on a notification, suspended,
    /// or not yet made ready).
    Detached,
    /// Ready list for this priority.
    Ready(Priority),
    /// The scheduler's delayed list.
    Delayed,
    /// A synchronization object's wait list.
    Waiting(WaitRef),
}

/// Address of the wait list a blocked task is linked on, kept in the TCB so
/// the tick handler can unlink a task whose timeout expired.
///
/// The pointee outlives the link: a task stays on a wait list only while it
/// is inside a blocking call that borrows the owning object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WaitRef(NonNull<WaitList>);

// Safety: only dereferenced inside the kernel critical section while the
// blocked task still holds its borrow of the owning object.
unsafe impl Send for WaitRef {}

impl WaitRef {
    pub(crate) fn new(list: &WaitList) -> Self {
        WaitRef(NonNull::from(list))
    }

    /// # Safety
    /// The task tagged with this reference must still be blocked on it.
    pub(crate) unsafe fn get<'a>(self) -> &'a WaitList {
        // SAFETY: upheld by the caller, see type docs.
        unsafe { self.0.as_ref() }
    }
}

// =============================================================================
// TaskList
// =============================================================================

/// Head of an intrusive singly linked list of tasks.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TaskList {
    head: Option<TaskId>,
}

impl TaskList {
    pub(crate) const fn new() -> Self {
        TaskList { head: None }
    }

    #[inline(always)]
    pub(crate) fn first(&self) -> Option<TaskId> {
        self.head
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `id` at the head and tag it with `tag`.
    pub(crate) fn push_front(&mut self, tasks: &mut [TaskControlBlock], id: TaskId, tag: ListTag) {
        let tcb = &mut tasks[id.index()];
        config_assert(tcb.list == ListTag::Detached, "task linked on two lists");
        tcb.next = self.head;
        tcb.list = tag;
        self.head = Some(id);
    }

    /// Unlink and return the head.
    pub(crate) fn pop_front(&mut self, tasks: &mut [TaskControlBlock]) -> Option<TaskId> {
        let id = self.head?;
        let tcb = &mut tasks[id.index()];
        self.head = tcb.next.take();
        tcb.list = ListTag::Detached;
        Some(id)
    }

    /// Unlink `id` wherever it sits. Returns `false` if it was not on this list.
    pub(crate) fn remove(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) -> bool {
        let mut prev: Option<TaskId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            if cur == id {
                let next = tasks[cur.index()].next.take();
                match prev {
                    None => self.head = next,
                    Some(p) => tasks[p.index()].next = next,
                }
                tasks[cur.index()].list = ListTag::Detached;
                return true;
            }
            prev = cursor;
            cursor = tasks[cur.index()].next;
        }
        false
    }

    /// Walk the list head to tail.
    pub(crate) fn iter<'a>(&self, tasks: &'a [TaskControlBlock]) -> Iter<'a> {
        Iter { tasks, cursor: self.head }
    }
}

pub(crate) struct Iter<'a> {
    tasks: &'a [TaskControlBlock],
    cursor: Option<TaskId>,
}

impl Iterator for Iter<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.cursor?;
        self.cursor = self.tasks[id.index()].next;
        Some(id)
    }
}

// =============================================================================
// WaitList
// =============================================================================

/// Wait list owned by a synchronization object.
///
/// Only the scheduler links and unlinks tasks here, always inside the
/// kernel critical section.
pub(crate) struct WaitList {
    tasks: critical_section::Mutex<Cell<TaskList>>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        WaitList {
            tasks: critical_section::Mutex::new(Cell::new(TaskList::new())),
        }
    }

    #[inline]
    pub(crate) fn get(&self, cs: CriticalSection<'_>) -> TaskList {
        self.tasks.borrow(cs).get()
    }

    /// Read-modify-write the list under the critical section.
    pub(crate) fn update<R>(&self, cs: CriticalSection<'_>, f: impl FnOnce(&mut TaskList) -> R) -> R {
        let cell = self.tasks.borrow(cs);
        let mut list = cell.get();
        let r = f(&mut list);
        cell.set(list);
        r
    }

    pub(crate) fn tag(&self) -> ListTag {
        ListTag::Waiting(WaitRef::new(self))
    }
}
