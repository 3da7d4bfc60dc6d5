/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Ready queue with the port-optimised task selection: one bit
 * per priority, highest set bit found with a leading-zero count.
 */

//! Ready Queue
//!
//! Eight [`TaskList`]s, one per priority, plus a presence bitmap. Bit N is
//! set exactly when list N is non-empty, so the highest ready task is found
//! in O(1). Tasks are inserted at the head of their list and never rotated.

use crate::config::{config_assert, MAX_PRIORITIES};
use crate::kernel::list::{ListTag, TaskList};
use crate::kernel::tasks::TaskControlBlock;
use crate::types::{Priority, TaskId};

pub(crate) struct ReadyQueue {
    bitmap: u8,
    lists: [TaskList; MAX_PRIORITIES],
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        ReadyQueue { bitmap: 0, lists: [TaskList::new(); MAX_PRIORITIES] }
    }

    /// Head of the highest non-empty priority list.
    #[inline]
    pub(crate) fn highest(&self) -> Option<TaskId> {
        let p = self.highest_priority()?;
        self.lists[p.index()].first()
    }

    #[inline]
    pub(crate) fn highest_priority(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            return None;
        }
        Priority::from_index(7 - self.bitmap.leading_zeros() as usize)
    }

    /// Link `id` at the head of the list for its current (effective)
    /// priority. Does not touch the task's state.
    pub(crate) fn insert(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let p = tasks[id.index()].priority;
        self.lists[p.index()].push_front(tasks, id, ListTag::Ready(p));
        self.bitmap |= 1 << p.index();
    }

    /// Unlink `id` from the ready list it is tagged with.
    pub(crate) fn remove(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let ListTag::Ready(p) = tasks[id.index()].list else {
            config_assert(false, "task removed from ready queue while not ready");
            return;
        };
        let list = &mut self.lists[p.index()];
        let found = list.remove(tasks, id);
        config_assert(found, "ready tag does not match ready list");
        if list.is_empty() {
            self.bitmap &= !(1 << p.index());
        }
    }

    #[cfg(test)]
    pub(crate) fn bitmap(&self) -> u8 {
        self.bitmap
    }
}
