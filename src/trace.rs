/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Trace hooks called at key points in the scheduler. Each hook
 * forwards to the `log` facade, so tracing costs a level check when no
 * logger is installed and can be routed to any backend (semihosting, RTT,
 * env_logger on the host) without touching kernel code.
 */

//! Trace Hooks
//!
//! The kernel calls these functions from inside its critical section. They
//! must not call back into the kernel.
//!
//! ## Categories
//!
//! - `task_*` - task lifecycle and scheduling events
//! - `priority_*` - priority inheritance
//! - `scheduler_*` and `no_ready_task` - kernel-wide events
//!
//! Records use the `rtkernel::sched` and `rtkernel::sync` log targets.

#![allow(unused_variables)]

use log::{debug, trace};

use crate::types::{Priority, TaskId, Ticks};

const SCHED: &str = "rtkernel::sched";
const SYNC: &str = "rtkernel::sync";

// =============================================================================
// Task lifecycle
// =============================================================================

#[inline(always)]
pub fn task_registered(id: TaskId, name: &str, priority: Priority) {
    debug!(target: SCHED, "task {} '{}' registered at {:?}", id, name, priority);
}

#[inline(always)]
pub fn task_retired(id: TaskId, name: &str) {
    debug!(target: SCHED, "task {} '{}' returned from its entry function", id, name);
}

#[inline(always)]
pub fn task_suspended(id: TaskId) {
    trace!(target: SCHED, "task {} suspended", id);
}

#[inline(always)]
pub fn task_resumed(id: TaskId) {
    trace!(target: SCHED, "task {} resumed", id);
}

// =============================================================================
// Scheduling
// =============================================================================

#[inline(always)]
pub fn scheduler_started(first: TaskId, port: &str) {
    debug!(target: SCHED, "scheduler started on {} port, first task {}", port, first);
}

#[inline(always)]
pub fn task_switched(from: Option<TaskId>, to: TaskId) {
    trace!(target: SCHED, "switch {:?} -> {}", from, to);
}

#[inline(always)]
pub fn task_delayed(id: TaskId, wake_time: Ticks) {
    trace!(target: SCHED, "task {} delayed until tick {}", id, wake_time);
}

#[inline(always)]
pub fn task_blocked(id: TaskId, deadline: Option<Ticks>) {
    trace!(target: SYNC, "task {} blocked, deadline {:?}", id, deadline);
}

#[inline(always)]
pub fn task_unblocked(id: TaskId) {
    trace!(target: SYNC, "task {} unblocked", id);
}

#[inline(always)]
pub fn task_timed_out(id: TaskId, tick: Ticks) {
    trace!(target: SYNC, "task {} wait timed out at tick {}", id, tick);
}

#[inline(always)]
pub fn task_priority_set(id: TaskId, priority: Priority) {
    trace!(target: SCHED, "task {} base priority set to {:?}", id, priority);
}

#[inline(always)]
pub fn no_ready_task() {
    debug!(target: SCHED, "no task is ready to run; idling");
}

// =============================================================================
// Priority inheritance
// =============================================================================

#[inline(always)]
pub fn priority_inherit(holder: TaskId, from: Priority, to: Priority) {
    debug!(target: SYNC, "task {} inherits {:?} (was {:?})", holder, to, from);
}

#[inline(always)]
pub fn priority_disinherit(holder: TaskId, from: Priority, to: Priority) {
    debug!(target: SYNC, "task {} drops back to {:?} (was {:?})", holder, to, from);
}
