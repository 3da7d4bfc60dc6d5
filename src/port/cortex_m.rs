/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] ARMv7-M port (Cortex-M3, and Cortex-M4F with the FPU lazy
 * stacking extension). PendSV performs the switch, SVC restores the first
 * task, SysTick drives the kernel tick.
 */

//! Cortex-M3 / Cortex-M4F Port
//!
//! - Critical section: `cortex-m/critical-section-single-core` (PRIMASK).
//! - Context switch: `trigger_switch` records the next context slot in
//!   `RTK_NEXT_CONTEXT` and pends PendSV. PendSV runs at the lowest
//!   priority, so the switch happens as soon as the critical section and
//!   every nested interrupt have been left.
//! - Saved context, top of stack first: `r4-r11`, `EXC_RETURN`, then
//!   `s16-s31` if the task used the FPU (M4F), then the hardware frame.

use core::arch::{global_asm, naked_asm};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use super::{Context, Port, TaskImage};
use crate::config::{CPU_CLOCK_HZ, MAX_SYSCALL_INTERRUPT_PRIORITY, STACK_ALIGNMENT, TICK_PERIOD_MS, TICK_RATE_HZ};
use crate::kernel::Kernel;
use crate::types::{Result, TaskId};

// =============================================================================
// Constants
// =============================================================================

/// Thumb state bit; every task starts in Thumb state.
const INITIAL_XPSR: usize = 0x0100_0000;

/// Return to thread mode, process stack, no FP frame.
const INITIAL_EXC_RETURN: usize = 0xFFFF_FFFD;

/// Hardware-stacked frame: r0-r3, r12, lr, pc, xpsr.
const HW_FRAME_WORDS: usize = 8;

/// Software-stacked frame: r4-r11, EXC_RETURN.
const SW_FRAME_WORDS: usize = 9;

/// Lowest exception priority, used for PendSV and SysTick.
const LOWEST_PRIORITY: u8 = 0xFF;

const SYSTICK_RELOAD: u32 = CPU_CLOCK_HZ / TICK_RATE_HZ - 1;

/// FPCCR: automatic and lazy FP state preservation.
#[cfg(feature = "port-cortex-m4f")]
const FPCCR: *mut u32 = 0xE000_EF34 as *mut u32;
#[cfg(feature = "port-cortex-m4f")]
const FPCCR_ASPEN_LSPEN: u32 = (1 << 31) | (1 << 30);

// =============================================================================
// Switch state shared with the exception handlers
// =============================================================================

/// Context slot of the task whose registers are live.
#[no_mangle]
static RTK_CURRENT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

/// Context slot PendSV switches to.
#[no_mangle]
static RTK_NEXT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

/// Kernel driven by SysTick.
static TICK_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(ptr::null_mut());

/// Ticks since the scheduler started, for the microsecond clock.
static UPTIME_TICKS: critical_section::Mutex<Cell<u64>> = critical_section::Mutex::new(Cell::new(0));

// =============================================================================
// Port
// =============================================================================

pub struct CortexMPort;

impl CortexMPort {
    pub const fn new() -> Self {
        CortexMPort
    }
}

impl Default for CortexMPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for CortexMPort {
    #[cfg(feature = "port-cortex-m4f")]
    const NAME: &'static str = "cortex-m4f";
    #[cfg(not(feature = "port-cortex-m4f"))]
    const NAME: &'static str = "cortex-m3";

    const FREE_RUNNING_CLOCK: bool = false;

    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize> {
        let frame_bytes = (HW_FRAME_WORDS + SW_FRAME_WORDS) * 4;
        let top = image.stack.frame_top(STACK_ALIGNMENT, frame_bytes)?;

        let hw = (top - HW_FRAME_WORDS * 4) as *mut usize;
        let sw = (top - frame_bytes) as *mut usize;
        // SAFETY: both frames lie inside the task's own stack, checked above.
        unsafe {
            hw.add(0).write(image.arg); // r0
            hw.add(1).write(0); // r1
            hw.add(2).write(0); // r2
            hw.add(3).write(0); // r3
            hw.add(4).write(0); // r12
            hw.add(5).write(task_exit_trap as usize); // lr
            hw.add(6).write(image.entry as usize & !1); // pc
            hw.add(7).write(INITIAL_XPSR);
            for reg in 0..8 {
                sw.add(reg).write(0); // r4-r11
            }
            sw.add(8).write(INITIAL_EXC_RETURN);
        }
        Ok(sw as usize)
    }

    fn trigger_switch(&self, _next: TaskId, next_context: &Context) {
        RTK_NEXT_CONTEXT.store(next_context.as_ptr(), Ordering::Release);
        SCB::set_pendsv();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn start_first_task(&'static self, kernel: &'static Kernel, _first: TaskId, context: &'static Context) -> ! {
        TICK_KERNEL.store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
        RTK_CURRENT_CONTEXT.store(context.as_ptr(), Ordering::Release);
        RTK_NEXT_CONTEXT.store(context.as_ptr(), Ordering::Release);

        cortex_m::interrupt::disable();
        // SAFETY: the scheduler owns SCB handler priorities and SysTick from
        // here on; nothing else runs yet.
        let mut cp = unsafe { cortex_m::Peripherals::steal() };
        unsafe {
            cp.SCB.set_priority(SystemHandler::PendSV, LOWEST_PRIORITY);
            cp.SCB.set_priority(SystemHandler::SysTick, LOWEST_PRIORITY);
        }

        #[cfg(feature = "port-cortex-m4f")]
        {
            cp.SCB.enable_fpu();
            // SAFETY: FPCCR is a core register; only the preservation bits
            // are changed.
            unsafe {
                let fpccr = ptr::read_volatile(FPCCR);
                ptr::write_volatile(FPCCR, fpccr | FPCCR_ASPEN_LSPEN);
            }
        }

        cp.SYST.disable_counter();
        cp.SYST.set_clock_source(SystClkSource::Core);
        cp.SYST.set_reload(SYSTICK_RELOAD);
        cp.SYST.clear_current();
        cp.SYST.enable_interrupt();
        cp.SYST.enable_counter();

        // SAFETY: the current context slot holds a frame built by
        // `init_stack`.
        unsafe { start_first_task() }
    }

    fn in_task_context(&self) -> bool {
        SCB::vect_active() == VectActive::ThreadMode
    }

    fn micros(&self) -> u64 {
        critical_section::with(|cs| {
            let mut ticks = UPTIME_TICKS.borrow(cs).get();
            let mut elapsed = SYSTICK_RELOAD - SYST::get_current();
            // A wrap not yet serviced by SysTick.
            if SCB::is_pendst_pending() {
                ticks += 1;
                elapsed = SYSTICK_RELOAD - SYST::get_current();
            }
            let us_per_tick = u64::from(TICK_PERIOD_MS) * 1000;
            ticks * us_per_tick + u64::from(elapsed) * 1_000_000 / u64::from(CPU_CLOCK_HZ)
        })
    }

    fn wait_for_interrupt(&self) {
        cortex_m::asm::wfi();
    }
}

/// A task body returning past the trampoline is a kernel bug.
extern "C" fn task_exit_trap() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::bkpt();
    }
}

// =============================================================================
// Exception handlers
// =============================================================================

#[no_mangle]
extern "C" fn rtk_systick_handler() {
    critical_section::with(|cs| {
        let ticks = UPTIME_TICKS.borrow(cs);
        ticks.set(ticks.get() + 1);
    });
    let kernel = TICK_KERNEL.load(Ordering::Acquire);
    // SAFETY: set once from a `&'static Kernel` before SysTick is enabled.
    if let Some(kernel) = unsafe { kernel.as_ref() } {
        kernel.tick();
    }
}

/// Restore the first task. Entered through `svc 0`.
#[unsafe(naked)]
#[no_mangle]
unsafe extern "C" fn rtk_svc_handler() {
    naked_asm!(
        "ldr r3, =RTK_CURRENT_CONTEXT",
        "ldr r1, [r3]",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11, r14}}",
        "msr psp, r0",
        "isb",
        "mov r0, #0",
        "msr basepri, r0",
        "bx r14",
    );
}

#[cfg(not(feature = "port-cortex-m4f"))]
#[unsafe(naked)]
#[no_mangle]
unsafe extern "C" fn rtk_pendsv_handler() {
    naked_asm!(
        "mrs r0, psp",
        "isb",
        "ldr r3, =RTK_CURRENT_CONTEXT",
        "ldr r2, [r3]",
        "stmdb r0!, {{r4-r11, r14}}",
        "str r0, [r2]",
        // Mask kernel-aware interrupts while the slots change.
        "mov r0, #{max_syscall}",
        "msr basepri, r0",
        "dsb",
        "isb",
        "ldr r1, =RTK_NEXT_CONTEXT",
        "ldr r1, [r1]",
        "str r1, [r3]",
        "mov r0, #0",
        "msr basepri, r0",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11, r14}}",
        "msr psp, r0",
        "isb",
        "bx r14",
        max_syscall = const MAX_SYSCALL_INTERRUPT_PRIORITY,
    );
}

#[cfg(feature = "port-cortex-m4f")]
#[unsafe(naked)]
#[no_mangle]
unsafe extern "C" fn rtk_pendsv_handler() {
    naked_asm!(
        ".fpu fpv4-sp-d16",
        "mrs r0, psp",
        "isb",
        "ldr r3, =RTK_CURRENT_CONTEXT",
        "ldr r2, [r3]",
        // EXC_RETURN bit 4 clear: the task has an FP frame.
        "tst r14, #0x10",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb r0!, {{r4-r11, r14}}",
        "str r0, [r2]",
        "mov r0, #{max_syscall}",
        "msr basepri, r0",
        "dsb",
        "isb",
        "ldr r1, =RTK_NEXT_CONTEXT",
        "ldr r1, [r1]",
        "str r1, [r3]",
        "mov r0, #0",
        "msr basepri, r0",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11, r14}}",
        "tst r14, #0x10",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr psp, r0",
        "isb",
        "bx r14",
        max_syscall = const MAX_SYSCALL_INTERRUPT_PRIORITY,
    );
}

/// Reset MSP from the vector table, enable interrupts and raise SVC.
#[unsafe(naked)]
unsafe extern "C" fn start_first_task() -> ! {
    naked_asm!(
        "ldr r0, 1f",
        "ldr r0, [r0]",
        "ldr r0, [r0]",
        "msr msp, r0",
        "mov r0, #0",
        "msr control, r0",
        "cpsie i",
        "cpsie f",
        "dsb",
        "isb",
        "svc 0",
        "b .",
        ".align 2",
        "1: .word 0xE000ED08",
    );
}

// cortex-m-rt binds exceptions by these names.
global_asm!(
    ".thumb_func",
    ".global SVCall",
    ".type SVCall, %function",
    "SVCall:",
    "b rtk_svc_handler",
    ".thumb_func",
    ".global PendSV",
    ".type PendSV, %function",
    "PendSV:",
    "b rtk_pendsv_handler",
    ".thumb_func",
    ".global SysTick",
    ".type SysTick, %function",
    "SysTick:",
    "b rtk_systick_handler",
);
