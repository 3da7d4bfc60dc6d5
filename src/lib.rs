/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy of
 * this software and associated documentation files (the "Software"), to deal in
 * the Software without restriction, including without limitation the rights to
 * use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
 * the Software, and to permit persons to whom the Software is furnished to do so,
 * subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
 * FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
 * COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
 * IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
 * CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
 *
 * https://www.FreeRTOS.org
 * https://github.com/FreeRTOS
 *
 * [AMENDMENT] This file is part of rtkernel, a priority-based preemptive
 * kernel in the FreeRTOS tradition: static tasks, a bitmap ready queue,
 * priority-inheriting mutexes and per-architecture context-switch ports.
 */

//! # rtkernel - Priority-Based Real-Time Kernel
//!
//! A compile-time configured scheduler for eight priority levels with
//! blocking synchronization primitives and fixed-block memory pools.
//!
//! ## Features
//!
//! - `port-host` - run tasks as OS threads (default; used by the tests)
//! - `port-cortex-m0` / `port-cortex-m3` / `port-cortex-m4f` - ARM Cortex-M
//! - `port-riscv32` - RV32 machine mode
//! - `port-xtensa` - ESP32-class Xtensa
//! - `std` - enable std (implied by `port-host`)
//!
//! Bare-metal builds use `default-features = false` and exactly one port.
//!
//! ## Quick start
//!
//! ```ignore
//! use rtkernel::{Kernel, Priority, Task, INFINITE};
//! use rtkernel::sync::Queue;
//!
//! static KERNEL: Kernel = Kernel::new();
//! static SAMPLES: Queue<'static, u16, 8> = Queue::new(&KERNEL);
//! static SENSOR: Task<1024> = Task::new("sensor", Priority::High, sensor);
//! static LOGGER: Task<1024> = Task::new("logger", Priority::Low, logger);
//!
//! fn sensor(kernel: &'static Kernel) {
//!     loop {
//!         let _ = SAMPLES.send(read_adc(), 0);
//!         kernel.delay(10);
//!     }
//! }
//!
//! fn logger(_: &'static Kernel) {
//!     loop {
//!         let sample = SAMPLES.receive(INFINITE).unwrap();
//!         log::info!("sample {}", sample);
//!     }
//! }
//!
//! fn main() -> ! {
//!     KERNEL.register(&SENSOR).unwrap();
//!     KERNEL.register(&LOGGER).unwrap();
//!     KERNEL.start()
//! }
//! ```

#![no_std]
#![cfg_attr(all(target_arch = "xtensa", feature = "port-xtensa"), feature(asm_experimental_arch))]

#[cfg(feature = "std")]
extern crate std;

// Core modules
pub mod config;
pub mod trace;
pub mod types;

// Port layer
pub mod port;

// Memory management
pub mod memory;

// Kernel modules
pub mod kernel;

// Safe synchronization API
pub mod sync;

// Re-export commonly used items at crate root
pub use kernel::{Kernel, Task, TaskFn};
pub use types::{KernelError, Priority, Result, TaskId, TaskState, Ticks, INFINITE};
