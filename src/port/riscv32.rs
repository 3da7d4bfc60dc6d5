/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] RISC-V RV32 machine-mode port for rtkernel.
 *
 * This port targets RV32I/RV32IMAC cores with a standard CLINT timer.
 * Tested on QEMU sifive_e machine.
 */

//! RISC-V RV32 Port
//!
//! - Critical section: registered here via `critical_section::set_impl!`,
//!   masking `mstatus.MIE`.
//! - Context switch: one trap handler serves both the tick interrupt and
//!   `ecall`. It saves the interrupted task on its own stack, runs on the
//!   ISR stack, then restores whatever `RTK_NEXT_CONTEXT` names.
//!   A switch requested from task code is carried out by `ecall` in
//!   `switch_point`; one requested from the tick happens on trap exit.
//! - Tick: CLINT `mtimecmp`, rearmed from the trap.
//!
//! Saved frame, 32 words:
//!
//! ```text
//! [0] mepc  [1] mstatus  [2] ra  [3..30] x5..x31  [30..32] padding
//! ```

use core::arch::{asm, global_asm};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use super::{Context, Port, TaskImage};
use crate::config::{ISR_STACK_SIZE, MTIME_HZ, TICK_RATE_HZ};
use crate::kernel::Kernel;
use crate::types::{Result, TaskId};

// =============================================================================
// Constants
// =============================================================================

/// CLINT base address (SiFive standard, used by QEMU sifive_e/virt)
const CLINT_BASE: usize = 0x0200_0000;
const MTIME_ADDR: usize = CLINT_BASE + 0xBFF8;
const MTIMECMP_ADDR: usize = CLINT_BASE + 0x4000;

const MTIME_PER_TICK: u64 = (MTIME_HZ / TICK_RATE_HZ) as u64;

const MSTATUS_MIE: u32 = 1 << 3;

/// MPIE=1 (interrupts on after mret), MPP=machine.
const INITIAL_MSTATUS: usize = 0x1880;

const MIE_MTIE: usize = 1 << 7;

const FRAME_WORDS: usize = 32;

/// RISC-V ABI stack alignment.
const FRAME_ALIGN: usize = 16;

// =============================================================================
// Critical section
// =============================================================================

struct MachineModeCriticalSection;
critical_section::set_impl!(MachineModeCriticalSection);

unsafe impl critical_section::Impl for MachineModeCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let mstatus: u32;
        // SAFETY: clearing MIE only defers interrupts.
        unsafe { asm!("csrrci {0}, mstatus, 8", out(reg) mstatus, options(nostack)) };
        mstatus & MSTATUS_MIE
    }

    unsafe fn release(restore: critical_section::RawRestoreState) {
        if restore != 0 {
            // SAFETY: MIE was set when the matching `acquire` ran.
            unsafe { asm!("csrsi mstatus, 8", options(nostack)) };
        }
    }
}

// =============================================================================
// Switch state shared with the trap handler
// =============================================================================

#[no_mangle]
static RTK_CURRENT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

#[no_mangle]
static RTK_NEXT_CONTEXT: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());

/// Set while the trap handler runs.
#[no_mangle]
static RTK_IN_TRAP: AtomicBool = AtomicBool::new(false);

/// A switch was requested from task code and `ecall` has not run yet.
#[no_mangle]
static RTK_SWITCH_PENDING: AtomicBool = AtomicBool::new(false);

#[no_mangle]
static RTK_ISR_STACK_TOP: AtomicUsize = AtomicUsize::new(0);

static mut ISR_STACK: [u8; ISR_STACK_SIZE] = [0; ISR_STACK_SIZE];

static TICK_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(ptr::null_mut());

/// Next `mtimecmp` value.
static NEXT_COMPARE: critical_section::Mutex<Cell<u64>> = critical_section::Mutex::new(Cell::new(0));

// =============================================================================
// CLINT
// =============================================================================

fn read_mtime() -> u64 {
    loop {
        // SAFETY: CLINT registers are always mapped.
        unsafe {
            let hi = ptr::read_volatile((MTIME_ADDR + 4) as *const u32);
            let lo = ptr::read_volatile(MTIME_ADDR as *const u32);
            if hi == ptr::read_volatile((MTIME_ADDR + 4) as *const u32) {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }
}

fn write_mtimecmp(value: u64) {
    // High word parked at max first so no spurious match fires mid-update.
    // SAFETY: CLINT registers are always mapped.
    unsafe {
        ptr::write_volatile((MTIMECMP_ADDR + 4) as *mut u32, u32::MAX);
        ptr::write_volatile(MTIMECMP_ADDR as *mut u32, value as u32);
        ptr::write_volatile((MTIMECMP_ADDR + 4) as *mut u32, (value >> 32) as u32);
    }
}

fn arm_next_tick() {
    critical_section::with(|cs| {
        let next = NEXT_COMPARE.borrow(cs);
        write_mtimecmp(next.get());
        next.set(next.get() + MTIME_PER_TICK);
    });
}

// =============================================================================
// Port
// =============================================================================

pub struct Riscv32Port;

impl Riscv32Port {
    pub const fn new() -> Self {
        Riscv32Port
    }
}

impl Default for Riscv32Port {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for Riscv32Port {
    const NAME: &'static str = "riscv32";

    unsafe fn init_stack(&'static self, image: TaskImage) -> Result<usize> {
        let frame_bytes = FRAME_WORDS * 4;
        let top = image.stack.frame_top(FRAME_ALIGN, frame_bytes)?;
        let frame = (top - frame_bytes) as *mut usize;
        // SAFETY: the frame lies inside the task's own stack, checked above.
        unsafe {
            for word in 0..FRAME_WORDS {
                frame.add(word).write(0);
            }
            frame.add(0).write(image.entry as usize); // mepc
            frame.add(1).write(INITIAL_MSTATUS);
            frame.add(2).write(task_exit_trap as usize); // ra
            frame.add(8).write(image.arg); // a0 (x10)
        }
        Ok(frame as usize)
    }

    fn trigger_switch(&self, _next: TaskId, next_context: &Context) {
        RTK_NEXT_CONTEXT.store(next_context.as_ptr(), Ordering::Release);
        if !RTK_IN_TRAP.load(Ordering::Acquire) {
            RTK_SWITCH_PENDING.store(true, Ordering::Release);
        }
    }

    fn start_first_task(&'static self, kernel: &'static Kernel, _first: TaskId, context: &'static Context) -> ! {
        TICK_KERNEL.store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
        RTK_CURRENT_CONTEXT.store(context.as_ptr(), Ordering::Release);
        RTK_NEXT_CONTEXT.store(context.as_ptr(), Ordering::Release);
        let isr_top = ptr::addr_of_mut!(ISR_STACK) as usize + ISR_STACK_SIZE;
        RTK_ISR_STACK_TOP.store(isr_top & !(FRAME_ALIGN - 1), Ordering::Release);

        critical_section::with(|cs| NEXT_COMPARE.borrow(cs).set(read_mtime() + MTIME_PER_TICK));
        arm_next_tick();

        // SAFETY: the trap vector and the first frame are in place; the
        // restore path never comes back here.
        unsafe {
            asm!(
                "csrci mstatus, 8",
                "la t0, rtk_trap_handler",
                "csrw mtvec, t0",
                "csrs mie, t1",
                "j rtk_restore_context",
                in("t1") MIE_MTIE,
                options(noreturn)
            );
        }
    }

    fn switch_point(&self) {
        if RTK_IN_TRAP.load(Ordering::Acquire) {
            return;
        }
        // No CAS on RV32I; a trap in between only clears the flag early.
        if RTK_SWITCH_PENDING.load(Ordering::Acquire) {
            RTK_SWITCH_PENDING.store(false, Ordering::Release);
            // SAFETY: the trap handler saves and restores the full context.
            unsafe { asm!("ecall") };
        }
    }

    fn in_task_context(&self) -> bool {
        !RTK_IN_TRAP.load(Ordering::Acquire)
    }

    fn micros(&self) -> u64 {
        read_mtime() * 1_000_000 / u64::from(MTIME_HZ)
    }

    fn wait_for_interrupt(&self) {
        // SAFETY: wfi has no side effects beyond stalling.
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }
}

#[no_mangle]
extern "C" fn task_exit_trap() -> ! {
    loop {
        // SAFETY: parks the hart; only reached if a task unwinds past its
        // trampoline.
        unsafe { asm!("csrci mstatus, 8", "wfi") };
    }
}

/// Rust half of the trap handler, entered on the ISR stack.
#[no_mangle]
extern "C" fn rtk_trap_dispatch(mcause: usize) {
    const INTERRUPT: usize = 1 << 31;
    const MACHINE_TIMER: usize = 7;
    const ECALL_M: usize = 11;

    if mcause & INTERRUPT != 0 {
        if mcause & 0x7FF == MACHINE_TIMER {
            arm_next_tick();
            let kernel = TICK_KERNEL.load(Ordering::Acquire);
            // SAFETY: set once from a `&'static Kernel` before mtie.
            if let Some(kernel) = unsafe { kernel.as_ref() } {
                kernel.tick();
            }
        }
        return;
    }
    if mcause != ECALL_M {
        log::error!(target: "rtkernel::port", "unhandled trap, mcause={:#x}", mcause);
        loop {
            // SAFETY: halt on a fault the kernel cannot recover from.
            unsafe { asm!("wfi", options(nomem, nostack)) };
        }
    }
    // ecall: the switch target is already in RTK_NEXT_CONTEXT.
}

// =============================================================================
// Trap handler
// =============================================================================

global_asm!(
    r#"
.section .text.rtk_trap_handler
.global rtk_trap_handler
.global rtk_restore_context
.align 4

rtk_trap_handler:
    addi sp, sp, -128

    sw x1,   8(sp)
    sw x5,  12(sp)
    sw x6,  16(sp)
    sw x7,  20(sp)
    sw x8,  24(sp)
    sw x9,  28(sp)
    sw x10, 32(sp)
    sw x11, 36(sp)
    sw x12, 40(sp)
    sw x13, 44(sp)
    sw x14, 48(sp)
    sw x15, 52(sp)
    sw x16, 56(sp)
    sw x17, 60(sp)
    sw x18, 64(sp)
    sw x19, 68(sp)
    sw x20, 72(sp)
    sw x21, 76(sp)
    sw x22, 80(sp)
    sw x23, 84(sp)
    sw x24, 88(sp)
    sw x25, 92(sp)
    sw x26, 96(sp)
    sw x27, 100(sp)
    sw x28, 104(sp)
    sw x29, 108(sp)
    sw x30, 112(sp)
    sw x31, 116(sp)

    csrr t0, mstatus
    sw t0, 4(sp)

    # Synchronous traps resume after the faulting instruction.
    csrr a0, mcause
    csrr t0, mepc
    bltz a0, 1f
    addi t0, t0, 4
1:
    sw t0, 0(sp)

    la t0, RTK_CURRENT_CONTEXT
    lw t0, 0(t0)
    sw sp, 0(t0)

    li t0, 1
    la t1, RTK_IN_TRAP
    sb t0, 0(t1)

    la sp, RTK_ISR_STACK_TOP
    lw sp, 0(sp)
    call rtk_trap_dispatch

rtk_restore_context:
    la t0, RTK_NEXT_CONTEXT
    lw t1, 0(t0)
    la t0, RTK_CURRENT_CONTEXT
    sw t1, 0(t0)
    lw sp, 0(t1)

    la t0, RTK_IN_TRAP
    sb zero, 0(t0)
    la t0, RTK_SWITCH_PENDING
    sb zero, 0(t0)

    lw t0, 0(sp)
    csrw mepc, t0
    lw t0, 4(sp)
    csrw mstatus, t0

    lw x1,   8(sp)
    lw x5,  12(sp)
    lw x6,  16(sp)
    lw x7,  20(sp)
    lw x8,  24(sp)
    lw x9,  28(sp)
    lw x10, 32(sp)
    lw x11, 36(sp)
    lw x12, 40(sp)
    lw x13, 44(sp)
    lw x14, 48(sp)
    lw x15, 52(sp)
    lw x16, 56(sp)
    lw x17, 60(sp)
    lw x18, 64(sp)
    lw x19, 68(sp)
    lw x20, 72(sp)
    lw x21, 76(sp)
    lw x22, 80(sp)
    lw x23, 84(sp)
    lw x24, 88(sp)
    lw x25, 92(sp)
    lw x26, 96(sp)
    lw x27, 100(sp)
    lw x28, 104(sp)
    lw x29, 108(sp)
    lw x30, 112(sp)
    lw x31, 116(sp)

    addi sp, sp, 128
    mret
"#
);
