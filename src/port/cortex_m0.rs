/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] ARMv6-M port (Cortex-M0/M0+) for rtkernel.
 * ARMv6-M has no BASEPRI and Thumb-1 STM/LDM can only move r0-r7, so the
 * switch code shuffles r8-r11 through the low registers.
 */

//! Cortex-M0 / Cortex-M0+ Port
//!
//! Same switching scheme as the ARMv7-M port: `trigger_switch` records the
//! next context slot and pends PendSV.
//!
//! Saved context, top of stack first: `EXC_RETURN`, `r4-r7`, `r8-r11`,
//! then the hardware frame.

use core::arch::{global_asm, naked_asm};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use super::{Context, Port, TaskImage};
use crate::config::{CPU_CLOCK_HZ, STACK_ALIGNMENT, TICK_PERIOD_MS, TICK_RATE_HZ};
use crate::kernel::Kernel;
use crate::types::{Result, TaskId};

const INITIAL_XPSR: usize = 0x0100_0000;
const INITIAL_EXC_RETURN: usize = 0xFFFF_FFFD;
const HW_FRAME_WORDS: usize = 8;
const SW_FRAME_WORDS: usize = 9;
const LOWEST_PRIORITY: u8 = 0xFF;
const SYSTICK_RELOAD: u32 = CPU_CLOCK_HZ / TICK_RATE_HZ - 1;

#[no_mangle]
static RTK_CURRENT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

#[no_mangle]
static RTK_NEXT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

static TICK_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(ptr::null_mut());

// No atomic read-modify-write on ARMv6-M.
static UPTIME_TICKS: critical_section::Mutex<Cell<u64>> = critical_section::Mutex::new(Cell::new(0));

pub struct CortexM0Port;

impl CortexM0Port {
    pub const fn new() -> Self {
        CortexM0Port
    }
}

impl Default for CortexM0Port {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for CortexM0Port {
    const NAME: &'static str = "cortex-m0";

    const FREE_RUNNING_CLOCK: bool = false;

    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize> {
        let frame_bytes = (HW_FRAME_WORDS + SW_FRAME_WORDS) * 4;
        let top = image.stack.frame_top(STACK_ALIGNMENT, frame_bytes)?;

        let hw = (top - HW_FRAME_WORDS * 4) as *mut usize;
        let sw = (top - frame_bytes) as *mut usize;
        // SAFETY: both frames lie inside the task's own stack, checked above.
        unsafe {
            hw.add(0).write(image.arg); // r0
            for reg in 1..5 {
                hw.add(reg).write(0); // r1-r3, r12
            }
            hw.add(5).write(task_exit_trap as usize); // lr
            hw.add(6).write(image.entry as usize & !1); // pc
            hw.add(7).write(INITIAL_XPSR);
            sw.add(0).write(INITIAL_EXC_RETURN);
            for reg in 1..SW_FRAME_WORDS {
                sw.add(reg).write(0); // r4-r11
            }
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
        // SAFETY: the scheduler owns handler priorities and SysTick from here.
        let mut cp = unsafe { cortex_m::Peripherals::steal() };
        unsafe {
            cp.SCB.set_priority(SystemHandler::PendSV, LOWEST_PRIORITY);
            cp.SCB.set_priority(SystemHandler::SysTick, LOWEST_PRIORITY);
        }
        // Clock source before reload: QEMU latches it on enable.
        cp.SYST.disable_counter();
        cp.SYST.set_clock_source(SystClkSource::Core);
        cp.SYST.clear_current();
        cp.SYST.set_reload(SYSTICK_RELOAD);
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

extern "C" fn task_exit_trap() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::bkpt();
    }
}

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

/// Restore the first task. r4-r11 are still zero, so only EXC_RETURN is
/// read back.
#[unsafe(naked)]
#[no_mangle]
unsafe extern "C" fn rtk_svc_handler() {
    naked_asm!(
        ".syntax unified",
        "ldr r2, =RTK_CURRENT_CONTEXT",
        "ldr r1, [r2]",
        "ldr r0, [r1]",
        "ldm r0!, {{r2}}",
        "adds r0, #32",
        "msr psp, r0",
        "isb",
        "bx r2",
    );
}

#[unsafe(naked)]
#[no_mangle]
unsafe extern "C" fn rtk_pendsv_handler() {
    naked_asm!(
        ".syntax unified",
        "mrs r0, psp",
        "ldr r2, =RTK_CURRENT_CONTEXT",
        "ldr r1, [r2]",
        "subs r0, r0, #36",
        "str r0, [r1]",
        "mov r3, lr",
        "stmia r0!, {{r3-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "stmia r0!, {{r4-r7}}",
        "cpsid i",
        "ldr r1, =RTK_NEXT_CONTEXT",
        "ldr r1, [r1]",
        "str r1, [r2]",
        "cpsie i",
        "ldr r0, [r1]",
        // r8-r11 first, through r4-r7.
        "adds r0, r0, #20",
        "ldmia r0!, {{r4-r7}}",
        "mov r8, r4",
        "mov r9, r5",
        "mov r10, r6",
        "mov r11, r7",
        "msr psp, r0",
        "subs r0, r0, #36",
        "ldmia r0!, {{r3-r7}}",
        "bx r3",
    );
}

/// VTOR is optional on ARMv6-M, so MSP is left as is.
#[unsafe(naked)]
unsafe extern "C" fn start_first_task() -> ! {
    naked_asm!(
        ".syntax unified",
        "cpsie i",
        "dsb",
        "isb",
        "svc #0",
        "b .",
    );
}

global_asm!(
    ".syntax unified",
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
