/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Port layer abstraction for rtkernel.
 * The port layer contains hardware-specific implementations of:
 * - Stack initialization
 * - Context switching
 * - Scheduler start and the tick source
 * - The monotonic microsecond clock
 *
 * Critical sections come from the `critical-section` crate; each port
 * enables or registers the matching implementation.
 *
 * Select a port via Cargo features (e.g., `port-host`, `port-cortex-m4f`).
 */

//! Port Layer
//!
//! Every port implements [`Port`]. The kernel is written against
//! [`Platform`], an alias for the port chosen at build time.
//!
//! ## Available Ports
//!
//! - `port-host` - one OS thread per task (default, used by the test suite)
//! - `port-cortex-m0` - ARMv6-M, PendSV/SVC/SysTick
//! - `port-cortex-m3` - ARMv7-M, PendSV/SVC/SysTick
//! - `port-cortex-m4f` - ARMv7E-M with FPU (lazy stacking)
//! - `port-riscv32` - RV32 machine mode, CLINT timer
//! - `port-xtensa` - ESP32-class windowed Xtensa, CCOMPARE0 tick

use core::cell::UnsafeCell;

use crate::kernel::tasks::StackRegion;
use crate::kernel::Kernel;
use crate::types::{Result, TaskId};

#[cfg(feature = "port-host")]
mod host;
#[cfg(feature = "port-host")]
pub use host::HostPort as Platform;

#[cfg(all(
    any(feature = "port-cortex-m3", feature = "port-cortex-m4f"),
    not(feature = "port-host")
))]
mod cortex_m;
#[cfg(all(
    any(feature = "port-cortex-m3", feature = "port-cortex-m4f"),
    not(feature = "port-host")
))]
pub use cortex_m::CortexMPort as Platform;

#[cfg(all(
    feature = "port-cortex-m0",
    not(any(feature = "port-host", feature = "port-cortex-m3", feature = "port-cortex-m4f"))
))]
mod cortex_m0;
#[cfg(all(
    feature = "port-cortex-m0",
    not(any(feature = "port-host", feature = "port-cortex-m3", feature = "port-cortex-m4f"))
))]
pub use cortex_m0::CortexM0Port as Platform;

#[cfg(all(feature = "port-riscv32", not(feature = "port-host")))]
mod riscv32;
#[cfg(all(feature = "port-riscv32", not(feature = "port-host")))]
pub use riscv32::Riscv32Port as Platform;

#[cfg(all(feature = "port-xtensa", not(feature = "port-host")))]
mod xtensa;
#[cfg(all(feature = "port-xtensa", not(feature = "port-host")))]
pub use xtensa::XtensaPort as Platform;

#[cfg(not(any(
    feature = "port-host",
    feature = "port-cortex-m0",
    feature = "port-cortex-m3",
    feature = "port-cortex-m4f",
    feature = "port-riscv32",
    feature = "port-xtensa"
)))]
compile_error!("select a port: enable one of the `port-*` features");

// =============================================================================
// Port contract
// =============================================================================

/// Signature of the first function a task executes.
pub type TaskEntry = extern "C" fn(usize);

/// Everything a port needs to prepare a task's first context.
#[derive(Clone, Copy, Debug)]
pub struct TaskImage {
    pub id: TaskId,
    pub name: &'static str,
    pub stack: StackRegion,
    pub entry: TaskEntry,
    pub arg: usize,
}

/// Saved stack pointer of one task. Written by the port's switch code.
#[repr(transparent)]
pub struct Context(UnsafeCell<usize>);

impl Context {
    pub const fn new() -> Self {
        Context(UnsafeCell::new(0))
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut usize {
        self.0.get()
    }

    /// # Safety
    /// The owning task must not be running.
    #[inline(always)]
    pub unsafe fn set(&self, sp: usize) {
        // SAFETY: upheld by the caller.
        unsafe { *self.0.get() = sp };
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Context-switch provider for one architecture.
///
/// `trigger_switch` is always called inside the kernel critical section;
/// the switch itself takes effect once the section is left.
pub trait Port: Sync {
    /// Human-readable port name, used in trace output.
    const NAME: &'static str;

    /// Whether `micros` advances before the scheduler starts. Ports whose
    /// clock is the tick timer report `false`.
    const FREE_RUNNING_CLOCK: bool = true;

    /// Build the initial saved context of a task so that restoring it
    /// starts `image.entry(image.arg)` on the task's own stack with
    /// interrupts enabled. Returns the initial saved stack pointer.
    ///
    /// # Safety
    /// The stack region must be exclusively owned by the task and outlive
    /// it.
    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize>;

    /// Request a switch from the running task to `next`, whose saved stack
    /// pointer lives in `next_context`.
    fn trigger_switch(&self, next: TaskId, next_context: &Context);

    /// Start the tick source and restore the first task. Never returns.
    fn start_first_task(&'static self, kernel: &'static Kernel, first: TaskId, context: &'static Context) -> !;

    /// Called on every exit from the kernel critical section. Ports whose
    /// switch is not instantaneous park the caller here until it is
    /// scheduled again.
    #[inline(always)]
    fn switch_point(&self) {}

    /// Whether the calling context may enter the kernel right now.
    #[inline(always)]
    fn may_run(&self) -> bool {
        true
    }

    /// Whether the caller is a task (as opposed to an interrupt handler or
    /// a thread the kernel does not manage).
    fn in_task_context(&self) -> bool;

    /// Monotonic microseconds since an arbitrary epoch.
    fn micros(&self) -> u64;

    /// Microseconds elapsed since `start`, a value returned by `micros`.
    #[inline]
    fn micros_since(&self, start: u64) -> u64 {
        self.micros().wrapping_sub(start)
    }

    /// Low-power wait until the next interrupt.
    fn wait_for_interrupt(&self);
}
