/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Deterministic memory for rtkernel. The kernel itself never
 * allocates; applications that need run-time buffers use fixed-block pools.
 */

//! Memory Pools
//!
//! [`Pool`] hands out fixed-size blocks from storage embedded in the pool
//! object. Allocation and release are O(1) and never fragment, which makes
//! pools usable from interrupts and in hard real-time paths.
//!
//! ```ignore
//! use rtkernel::memory::Pool;
//!
//! static FRAMES: Pool<256, 8> = Pool::new();
//!
//! let frame = FRAMES.allocate()?;
//! // ... fill frame, pass its address through a queue ...
//! FRAMES.deallocate(frame)?;
//! ```

mod pool;

pub use pool::Pool;

// =============================================================================
// Pool Statistics
// =============================================================================

/// Pool statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of blocks in the pool
    pub capacity: usize,
    /// Blocks currently free
    pub available: usize,
    /// Lowest `available` ever observed
    pub minimum_ever_available: usize,
    /// Number of successful allocations
    pub allocations: usize,
    /// Number of successful frees
    pub frees: usize,
}
