/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Host emulation port. Each task runs on its own OS thread; the
 * scheduler hands a single run permission from thread to thread, so only the
 * selected task executes kernel code. A timer thread stands in for the tick
 * interrupt.
 */

//! Host Port
//!
//! - Critical section: the `critical-section` crate's `std` implementation
//!   (one process-wide lock).
//! - Context switch: `trigger_switch` stores the next task in the `turn`
//!   slot and wakes all task threads; each thread waits in `switch_point`
//!   until the turn is its own.
//! - Tick: a timer thread calls [`Kernel::tick`] every `TICK_PERIOD_MS`.
//!
//! Preemption is only observed at kernel call points: a task thread that
//! loses the turn keeps executing plain user code until its next kernel
//! call, where it parks.

use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{Context, Port, TaskImage};
use crate::config::{HOST_MIN_THREAD_STACK, TICK_PERIOD_MS};
use crate::kernel::Kernel;
use crate::types::{KernelError, Result, TaskId};

std::thread_local! {
    /// Task backed by the current OS thread, if any.
    static HOST_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

pub struct HostPort {
    turn: Mutex<Option<TaskId>>,
    turn_changed: Condvar,
    epoch: OnceLock<Instant>,
}

impl HostPort {
    pub const fn new() -> Self {
        HostPort {
            turn: Mutex::new(None),
            turn_changed: Condvar::new(),
            epoch: OnceLock::new(),
        }
    }

    fn turn(&self) -> MutexGuard<'_, Option<TaskId>> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grant(&self, task: TaskId) {
        *self.turn() = Some(task);
        self.turn_changed.notify_all();
    }

    /// Park the calling thread until `task` holds the run permission.
    fn wait_turn(&self, task: TaskId) {
        let mut turn = self.turn();
        while *turn != Some(task) {
            turn = self
                .turn_changed
                .wait(turn)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn current_thread_task() -> Option<TaskId> {
        HOST_TASK.with(Cell::get)
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    const NAME: &'static str = "host";

    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize> {
        let TaskImage { id, name, stack, entry, arg } = image;
        thread::Builder::new()
            .name(name.into())
            .stack_size(stack.size.max(HOST_MIN_THREAD_STACK))
            .spawn(move || {
                HOST_TASK.with(|t| t.set(Some(id)));
                self.wait_turn(id);
                entry(arg);
            })
            .map_err(|_| KernelError::NoMemory)?;
        // The thread keeps its own stack pointer.
        Ok(stack.top())
    }

    fn trigger_switch(&self, next: TaskId, _next_context: &Context) {
        self.grant(next);
    }

    fn start_first_task(&'static self, kernel: &'static Kernel, first: TaskId, _context: &'static Context) -> ! {
        self.epoch.get_or_init(Instant::now);
        let tick = Duration::from_millis(u64::from(TICK_PERIOD_MS));
        let spawned = thread::Builder::new()
            .name("rtk-tick".into())
            .spawn(move || {
                let mut next = Instant::now() + tick;
                loop {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    next += tick;
                    kernel.tick();
                }
            });
        if spawned.is_err() {
            log::error!(target: "rtkernel::port", "could not spawn the tick thread");
        }
        self.grant(first);
        loop {
            thread::park();
        }
    }

    fn switch_point(&self) {
        if let Some(me) = Self::current_thread_task() {
            self.wait_turn(me);
        }
    }

    fn may_run(&self) -> bool {
        match Self::current_thread_task() {
            Some(me) => *self.turn() == Some(me),
            None => true,
        }
    }

    fn in_task_context(&self) -> bool {
        Self::current_thread_task().is_some()
    }

    fn micros(&self) -> u64 {
        self.epoch.get_or_init(Instant::now).elapsed().as_micros() as u64
    }

    fn wait_for_interrupt(&self) {
        thread::sleep(Duration::from_micros(200));
    }
}
