/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Compile-time kernel configuration for rtkernel.
 * Configuration is done via:
 * - Cargo features for major toggles (port selection, `std`)
 * - Constants in this module for numeric values
 */

//! Kernel Configuration
//!
//! Every table in the kernel is sized from these constants; nothing is
//! allocated at runtime.

use crate::types::{Priority, Ticks, INFINITE};

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Size of the task table. Registration beyond this fails with `NoMemory`.
pub const MAX_TASKS: usize = 16;

/// Number of priority levels (fixed by the ready-queue bitmap width).
pub const MAX_PRIORITIES: usize = Priority::COUNT;

/// Tick rate in Hz
pub const TICK_RATE_HZ: u32 = 1000;

/// Tick period in milliseconds
pub const TICK_PERIOD_MS: u32 = 1000 / TICK_RATE_HZ;

/// CPU clock frequency in Hz
/// [AMENDMENT] This should be set to match your target hardware.
/// Default: 80 MHz (common for Cortex-M4F parts like STM32L4, TI TM4C)
pub const CPU_CLOCK_HZ: u32 = 80_000_000;

/// RISC-V MTIME timer frequency in Hz
/// QEMU sifive_e runs the CLINT at 32768 Hz.
#[cfg(feature = "port-riscv32")]
pub const MTIME_HZ: u32 = 32_768;

/// Xtensa CCOUNT frequency in Hz (ESP32 default CPU clock).
#[cfg(feature = "port-xtensa")]
pub const XTENSA_CCOUNT_HZ: u32 = 160_000_000;

/// Interrupts with a numerically lower (more urgent) priority than this are
/// never masked by the kernel and must not call into it. Cortex-M only.
pub const MAX_SYSCALL_INTERRUPT_PRIORITY: u8 = 0xBF;

// =============================================================================
// Stacks
// =============================================================================

/// Alignment of every task stack and initial stack pointer.
pub const STACK_ALIGNMENT: usize = 8;

/// Smallest stack a task may be registered with.
pub const MIN_STACK_SIZE: usize = 256;

/// Byte painted over a fresh stack; high-water measurement scans for it.
pub const STACK_FILL_BYTE: u8 = 0xA5;

/// Stack of the OS thread backing a task on the host port. Task stacks
/// smaller than this are rounded up.
pub const HOST_MIN_THREAD_STACK: usize = 64 * 1024;

/// Dedicated interrupt stack for ports that switch stacks on trap entry.
pub const ISR_STACK_SIZE: usize = 1024;

// =============================================================================
// IPC
// =============================================================================

/// Largest item a `Queue` may carry, in bytes.
pub const MAX_IPC_MESSAGE_SIZE: usize = 64;

/// Mutexes one task may hold at the same time. Locking one more fails with
/// `NoMemory`.
pub const MAX_HELD_MUTEXES: usize = 8;

// =============================================================================
// Debug / Assert
// =============================================================================

/// Kernel invariant check.
/// [AMENDMENT] In Rust, we use debug_assert!; release builds elide the check.
#[inline(always)]
#[track_caller]
pub fn config_assert(condition: bool, what: &'static str) {
    debug_assert!(condition, "kernel assertion failed: {}", what);
}

/// Convert a millisecond timeout into ticks.
///
/// `0` and [`INFINITE`] pass through unchanged; every other value rounds up
/// so that a non-zero timeout never becomes a poll.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Ticks {
    if ms == INFINITE || ms == 0 {
        ms
    } else {
        let ticks = ms.div_ceil(TICK_PERIOD_MS);
        if ticks == INFINITE {
            INFINITE - 1
        } else {
            ticks
        }
    }
}

const _: () = assert!(MAX_TASKS <= u8::MAX as usize, "task ids are stored in a u8");
const _: () = assert!(TICK_RATE_HZ <= 1000, "tick period must be at least 1 ms");
const _: () = assert!(STACK_ALIGNMENT.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks_keeps_sentinels() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(INFINITE), INFINITE);
        assert_eq!(ms_to_ticks(5), 5 / TICK_PERIOD_MS);
    }
}
