//! Shared helpers for the host-port integration tests.
//!
//! Every test owns a `static Kernel`, registers its tasks from the test
//! thread and boots the kernel on a thread of its own. Tasks report back
//! through atomics; the test thread polls with a deadline.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use rtkernel::{Kernel, TaskId, TaskState};

/// Generous bound for anything that should happen within a few ticks.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Start `kernel` on a background thread. `start` never returns.
pub fn boot(kernel: &'static Kernel) {
    thread::Builder::new()
        .name("rtk-boot".into())
        .spawn(move || kernel.start())
        .expect("spawn boot thread");
}

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Wait until `task` is parked in `state`.
pub fn wait_for_state(kernel: &Kernel, task: TaskId, state: TaskState) -> bool {
    wait_until(SETTLE, || kernel.task_state(task) == state)
}
