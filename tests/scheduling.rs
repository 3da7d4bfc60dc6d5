//! Scheduler integration tests on the host port.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use common::{boot, wait_for_state, wait_until, SETTLE};
use rtkernel::{Kernel, Priority, Task, TaskState};

// ============================================================================
// Priority order
// ============================================================================

#[test]
fn test_highest_priority_task_runs_first() {
    static KERNEL: Kernel = Kernel::new();
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static LOW: Task<1024> = Task::new("low", Priority::Low, low);
    static HIGH: Task<1024> = Task::new("high", Priority::High, high);

    fn record(what: &'static str) {
        LOG.lock().unwrap().push(what);
    }

    fn low(_: &'static Kernel) {
        record("low");
    }

    fn high(kernel: &'static Kernel) {
        record("high");
        kernel.delay(50);
        record("high-again");
    }

    KERNEL.register(&LOW).unwrap();
    KERNEL.register(&HIGH).unwrap();
    assert_eq!(KERNEL.task_count(), 2);
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || LOG.lock().unwrap().len() == 3));
    assert_eq!(*LOG.lock().unwrap(), ["high", "low", "high-again"]);

    // A task whose body returns is retired.
    let low_id = LOW.id().unwrap();
    assert!(wait_for_state(&KERNEL, low_id, TaskState::Suspended));
}

#[test]
fn test_registering_higher_priority_task_preempts() {
    static KERNEL: Kernel = Kernel::new();
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static PARENT: Task<1024> = Task::new("parent", Priority::Normal, parent);
    static CHILD: Task<1024> = Task::new("child", Priority::High, child);

    fn parent(kernel: &'static Kernel) {
        LOG.lock().unwrap().push("parent");
        kernel.register(&CHILD).unwrap();
        LOG.lock().unwrap().push("parent-after-register");
    }

    fn child(_: &'static Kernel) {
        LOG.lock().unwrap().push("child");
    }

    KERNEL.register(&PARENT).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || LOG.lock().unwrap().len() == 3));
    assert_eq!(*LOG.lock().unwrap(), ["parent", "child", "parent-after-register"]);
    assert_eq!(KERNEL.task_name(CHILD.id().unwrap()), "child");
}

// ============================================================================
// Time
// ============================================================================

#[test]
fn test_delay_sleeps_at_least_the_requested_ticks() {
    static KERNEL: Kernel = Kernel::new();
    static SLEPT_TICKS: AtomicU32 = AtomicU32::new(0);
    static SLEPT_US: AtomicU64 = AtomicU64::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);
    static SLEEPER: Task<1024> = Task::new("sleeper", Priority::Normal, sleeper);

    fn sleeper(kernel: &'static Kernel) {
        let ticks = kernel.tick_count();
        let us = kernel.micros();
        kernel.delay(30);
        SLEPT_TICKS.store(kernel.tick_count().wrapping_sub(ticks), Ordering::SeqCst);
        SLEPT_US.store(kernel.micros_since(us), Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
    }

    KERNEL.register(&SLEEPER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || DONE.load(Ordering::SeqCst)));
    assert!(SLEPT_TICKS.load(Ordering::SeqCst) >= 30);
    assert!(SLEPT_US.load(Ordering::SeqCst) >= 29_000);
    assert!(KERNEL.tick_count() >= 30);
}

#[test]
fn test_busy_task_accumulates_run_time() {
    static KERNEL: Kernel = Kernel::new();
    static ROUNDS: AtomicU32 = AtomicU32::new(0);
    static WORKER: Task<1024> = Task::new("worker", Priority::Normal, worker);
    static SPINNER: Task<1024> = Task::new("spinner", Priority::Idle, spinner);

    // Run time is charged when a task is switched out, so something has
    // to be ready while the worker sleeps.
    fn spinner(kernel: &'static Kernel) {
        loop {
            kernel.yield_now();
        }
    }

    fn worker(kernel: &'static Kernel) {
        loop {
            let start = kernel.micros();
            while kernel.micros_since(start) < 2_000 {}
            kernel.delay(1);
            ROUNDS.fetch_add(1, Ordering::SeqCst);
        }
    }

    KERNEL.register(&WORKER).unwrap();
    KERNEL.register(&SPINNER).unwrap();
    boot(&KERNEL);

    let id = WORKER.id().unwrap();
    assert!(wait_until(SETTLE, || ROUNDS.load(Ordering::SeqCst) >= 3));
    assert!(KERNEL.task_run_time_us(id) >= 2_000);
    assert_eq!(KERNEL.stack_high_water_mark(id), 1024);
}

// ============================================================================
// Task control
// ============================================================================

#[test]
fn test_suspend_and_resume_from_outside() {
    static KERNEL: Kernel = Kernel::new();
    static COUNT: AtomicU32 = AtomicU32::new(0);
    static TICKER: Task<1024> = Task::new("ticker", Priority::Normal, ticker);

    fn ticker(kernel: &'static Kernel) {
        loop {
            COUNT.fetch_add(1, Ordering::SeqCst);
            kernel.delay(2);
        }
    }

    KERNEL.register(&TICKER).unwrap();
    boot(&KERNEL);
    let id = TICKER.id().unwrap();
    assert!(wait_until(SETTLE, || COUNT.load(Ordering::SeqCst) >= 3));

    KERNEL.suspend(id);
    assert_eq!(KERNEL.task_state(id), TaskState::Suspended);
    thread::sleep(Duration::from_millis(20));
    let frozen = COUNT.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(COUNT.load(Ordering::SeqCst), frozen);

    assert!(KERNEL.resume(id));
    assert!(!KERNEL.resume(id));
    assert!(wait_until(SETTLE, || COUNT.load(Ordering::SeqCst) >= frozen + 3));
}

#[test]
fn test_set_priority_through_handle() {
    static KERNEL: Kernel = Kernel::new();
    static IDLER: Task<1024> = Task::new("idler", Priority::Low, idler);

    fn idler(kernel: &'static Kernel) {
        loop {
            kernel.delay(5);
        }
    }

    KERNEL.register(&IDLER).unwrap();
    boot(&KERNEL);
    let handle = KERNEL.task(IDLER.id().unwrap());
    assert_eq!(handle.name(), "idler");
    assert_eq!(handle.priority(), Priority::Low);

    handle.set_priority(Priority::AboveNormal);
    assert_eq!(handle.priority(), Priority::AboveNormal);
    assert_eq!(KERNEL.task_base_priority(handle.id()), Priority::AboveNormal);
}
