/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] ESP32-class Xtensa LX6/LX7 port for rtkernel (windowed ABI).
 */

//! Xtensa Port
//!
//! The runtime's level-1 interrupt vector spills every live register window
//! to the stack and saves an [`XtensaFrame`] before calling
//! `__level_1_interrupt`. With the windows spilled, a task is completely
//! described by that frame, so switching is a copy: the interrupted task's
//! frame goes to its save area, and the next task's save area is copied
//! over the frame the vector is about to restore.
//!
//! - Critical section: registered here via `critical_section::set_impl!`,
//!   raising `PS.INTLEVEL` with `rsil`.
//! - Context switch: software interrupt 7 (level 1), raised by
//!   `trigger_switch`.
//! - Tick: internal timer 0 (`CCOMPARE0`, CPU interrupt 6, level 1).
//! - Each task's save area sits at the top of its own stack; the saved
//!   context of a task is the address of that area.
//!
//! Tasks must not use the FPU: coprocessor state is not part of the frame.

use core::arch::asm;
use core::cell::Cell;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::{Context, Port, TaskImage};
use crate::config::{TICK_RATE_HZ, XTENSA_CCOUNT_HZ};
use crate::kernel::Kernel;
use crate::types::{Result, TaskId};

// =============================================================================
// Constants
// =============================================================================

const TIMER0_INTERRUPT: u32 = 1 << 6;
const SOFTWARE_INTERRUPT: u32 = 1 << 7;

const CCOUNT_PER_TICK: u32 = XTENSA_CCOUNT_HZ / TICK_RATE_HZ;
const CCOUNT_PER_US: u64 = (XTENSA_CCOUNT_HZ / 1_000_000) as u64;

/// PS for a new task: WOE set, CALLINC=1 (entered as if by `call4`),
/// INTLEVEL 0.
const INITIAL_PS: u32 = (1 << 18) | (1 << 16);

/// Window base save area the callee spills its caller's a0-a3 into.
const BASE_SAVE_AREA: usize = 16;

const STACK_ALIGN: usize = 16;

/// Interrupt level masked by the kernel critical section (XCHAL_EXCM_LEVEL
/// on ESP32). Levels above it must not call into the kernel.
const CRITICAL_LEVEL: u32 = 3;

// =============================================================================
// Trap frame
// =============================================================================

/// Integer register file as saved by the level-1 vector.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(non_snake_case)]
pub struct XtensaFrame {
    pub PC: u32,
    pub PS: u32,
    pub A0: u32,
    pub A1: u32,
    pub A2: u32,
    pub A3: u32,
    pub A4: u32,
    pub A5: u32,
    pub A6: u32,
    pub A7: u32,
    pub A8: u32,
    pub A9: u32,
    pub A10: u32,
    pub A11: u32,
    pub A12: u32,
    pub A13: u32,
    pub A14: u32,
    pub A15: u32,
    pub SAR: u32,
    pub EXCCAUSE: u32,
    pub EXCVADDR: u32,
    pub LBEG: u32,
    pub LEND: u32,
    pub LCOUNT: u32,
    pub THREADPTR: u32,
    pub SCOMPARE1: u32,
    pub BR: u32,
    pub ACCLO: u32,
    pub ACCHI: u32,
    pub M0: u32,
    pub M1: u32,
    pub M2: u32,
    pub M3: u32,
}

impl XtensaFrame {
    const ZERO: Self = XtensaFrame {
        PC: 0,
        PS: 0,
        A0: 0,
        A1: 0,
        A2: 0,
        A3: 0,
        A4: 0,
        A5: 0,
        A6: 0,
        A7: 0,
        A8: 0,
        A9: 0,
        A10: 0,
        A11: 0,
        A12: 0,
        A13: 0,
        A14: 0,
        A15: 0,
        SAR: 0,
        EXCCAUSE: 0,
        EXCVADDR: 0,
        LBEG: 0,
        LEND: 0,
        LCOUNT: 0,
        THREADPTR: 0,
        SCOMPARE1: 0,
        BR: 0,
        ACCLO: 0,
        ACCHI: 0,
        M0: 0,
        M1: 0,
        M2: 0,
        M3: 0,
    };
}

// =============================================================================
// Critical section
// =============================================================================

struct InterruptLevelCriticalSection;
critical_section::set_impl!(InterruptLevelCriticalSection);

unsafe impl critical_section::Impl for InterruptLevelCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let ps: u32;
        // SAFETY: raising INTLEVEL only defers interrupts.
        unsafe { asm!("rsil {0}, {level}", out(reg) ps, level = const CRITICAL_LEVEL) };
        ps
    }

    unsafe fn release(restore: critical_section::RawRestoreState) {
        // SAFETY: `restore` is the PS read by the matching `acquire`.
        unsafe { asm!("wsr.ps {0}", "rsync", in(reg) restore) };
    }
}

// =============================================================================
// Switch state
// =============================================================================

static CURRENT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());
static NEXT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());
static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);
static TICK_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(ptr::null_mut());

/// Save area for the boot thread, which is switched away from once and
/// never resumed.
struct BootSlot {
    frame: core::cell::UnsafeCell<XtensaFrame>,
    context: Context,
}

// Safety: only touched by the level-1 handler.
unsafe impl Sync for BootSlot {}

static BOOT: BootSlot = BootSlot {
    frame: core::cell::UnsafeCell::new(XtensaFrame::ZERO),
    context: Context::new(),
};

#[derive(Clone, Copy)]
struct Clock {
    cycles: u64,
    last_ccount: u32,
}

/// CCOUNT wraps every few seconds; fold it into 64 bits on every read.
static CLOCK: critical_section::Mutex<Cell<Clock>> =
    critical_section::Mutex::new(Cell::new(Clock { cycles: 0, last_ccount: 0 }));

fn ccount() -> u32 {
    let c: u32;
    // SAFETY: reading CCOUNT has no side effects.
    unsafe { asm!("rsr.ccount {0}", out(reg) c) };
    c
}

fn clock_cycles() -> u64 {
    critical_section::with(|cs| {
        let cell = CLOCK.borrow(cs);
        let mut clock = cell.get();
        let now = ccount();
        clock.cycles += u64::from(now.wrapping_sub(clock.last_ccount));
        clock.last_ccount = now;
        cell.set(clock);
        clock.cycles
    })
}

fn set_ccompare0(value: u32) {
    // SAFETY: CCOMPARE0 belongs to the port once the scheduler started.
    unsafe { asm!("wsr.ccompare0 {0}", "isync", in(reg) value) };
}

fn read_ccompare0() -> u32 {
    let v: u32;
    // SAFETY: read-only.
    unsafe { asm!("rsr.ccompare0 {0}", out(reg) v) };
    v
}

fn raise_software_interrupt() {
    // SAFETY: INTSET only pends the software interrupt.
    unsafe { asm!("wsr.intset {0}", "rsync", in(reg) SOFTWARE_INTERRUPT) };
}

fn clear_interrupts(mask: u32) {
    // SAFETY: acknowledges edge/software interrupts owned by the port.
    unsafe { asm!("wsr.intclear {0}", "rsync", in(reg) mask) };
}

fn enable_interrupts(mask: u32) {
    // SAFETY: INTENABLE bits for the tick and switch interrupts.
    unsafe {
        asm!(
            "rsr.intenable {t}",
            "or {t}, {t}, {m}",
            "wsr.intenable {t}",
            "rsync",
            t = out(reg) _,
            m = in(reg) mask,
        )
    };
}

// =============================================================================
// Port
// =============================================================================

pub struct XtensaPort;

impl XtensaPort {
    pub const fn new() -> Self {
        XtensaPort
    }
}

impl Default for XtensaPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for XtensaPort {
    const NAME: &'static str = "xtensa";

    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize> {
        let frame_size = (size_of::<XtensaFrame>() + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        let top = image.stack.frame_top(STACK_ALIGN, frame_size + BASE_SAVE_AREA + STACK_ALIGN)?;
        let area = (top - frame_size) as *mut XtensaFrame;
        let sp = (area as usize - BASE_SAVE_AREA) & !(STACK_ALIGN - 1);

        let mut frame = XtensaFrame::ZERO;
        frame.PC = image.entry as usize as u32;
        frame.PS = INITIAL_PS;
        frame.A1 = sp as u32;
        // After `entry` rotates the window by four, a6 becomes the callee's a2.
        frame.A6 = image.arg as u32;
        // SAFETY: the save area lies inside the task's own stack.
        unsafe { area.write(frame) };
        Ok(area as usize)
    }

    fn trigger_switch(&self, _next: TaskId, next_context: &Context) {
        NEXT_CONTEXT.store(next_context.as_ptr(), Ordering::Release);
        if !IN_INTERRUPT.load(Ordering::Acquire) {
            raise_software_interrupt();
        }
    }

    fn start_first_task(&'static self, kernel: &'static Kernel, _first: TaskId, context: &'static Context) -> ! {
        TICK_KERNEL.store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
        // SAFETY: the boot slot is only ever written by the level-1 handler.
        unsafe { BOOT.context.set(BOOT.frame.get() as usize) };
        CURRENT_CONTEXT.store(BOOT.context.as_ptr(), Ordering::Release);
        NEXT_CONTEXT.store(context.as_ptr(), Ordering::Release);

        clock_cycles();
        set_ccompare0(ccount().wrapping_add(CCOUNT_PER_TICK));
        enable_interrupts(TIMER0_INTERRUPT | SOFTWARE_INTERRUPT);
        raise_software_interrupt();
        loop {
            self.wait_for_interrupt();
        }
    }

    fn in_task_context(&self) -> bool {
        !IN_INTERRUPT.load(Ordering::Acquire)
    }

    fn micros(&self) -> u64 {
        clock_cycles() / CCOUNT_PER_US
    }

    fn wait_for_interrupt(&self) {
        // SAFETY: waits at level 0 until any interrupt.
        unsafe { asm!("waiti 0") };
    }
}

// =============================================================================
// Level-1 interrupt
// =============================================================================

/// Level-1 handler called by the runtime's vector with the saved frame of
/// the interrupted task.
///
/// # Safety
/// `frame` must be the frame the vector restores on return, with every
/// register window already spilled.
#[no_mangle]
pub unsafe extern "C" fn __level_1_interrupt(_level: u32, frame: *mut XtensaFrame) {
    IN_INTERRUPT.store(true, Ordering::Release);

    let pending: u32;
    // SAFETY: read-only.
    unsafe { asm!("rsr.interrupt {0}", out(reg) pending) };

    if pending & SOFTWARE_INTERRUPT != 0 {
        clear_interrupts(SOFTWARE_INTERRUPT);
    }
    if pending & TIMER0_INTERRUPT != 0 {
        // Writing CCOMPARE0 acknowledges the timer.
        set_ccompare0(read_ccompare0().wrapping_add(CCOUNT_PER_TICK));
        clock_cycles();
        let kernel = TICK_KERNEL.load(Ordering::Acquire);
        // SAFETY: set once from a `&'static Kernel` before the tick starts.
        if let Some(kernel) = unsafe { kernel.as_ref() } {
            kernel.tick();
        }
    }

    let current = CURRENT_CONTEXT.load(Ordering::Acquire);
    let next = NEXT_CONTEXT.load(Ordering::Acquire);
    if !next.is_null() && current != next {
        // SAFETY: both slots hold save-area addresses set up by
        // `init_stack` (or the boot slot); `frame` is live for this call.
        unsafe {
            let save = *current as *mut XtensaFrame;
            let restore = *next as *const XtensaFrame;
            save.write(frame.read());
            frame.write(restore.read());
        }
        CURRENT_CONTEXT.store(next, Ordering::Release);
    }

    IN_INTERRUPT.store(false, Ordering::Release);
}
