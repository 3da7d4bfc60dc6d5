/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Base types shared by every rtkernel module: tick counts,
 * priority levels, task identity/state and the kernel error kinds.
 */

//! Kernel Base Types
//!
//! - [`Ticks`] - tick counter (one tick per `config::TICK_PERIOD_MS`)
//! - [`Priority`] - the eight scheduling levels, `Idle` (0) to `Critical` (7)
//! - [`TaskId`] - index of a task control block in the kernel's task table
//! - [`TaskState`] - scheduling state of a task
//! - [`KernelError`] / [`Result`] - error kinds returned by fallible calls

use core::fmt;

// =============================================================================
// Tick type
// =============================================================================

/// Tick counter type. Wraps on overflow; deadlines compare with wrapping
/// arithmetic.
pub type Ticks = u32;

/// Timeout value meaning "wait forever".
pub const INFINITE: u32 = 0xFFFF_FFFF;

// =============================================================================
// Priorities
// =============================================================================

/// Task priority. Higher numeric value runs first.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    BelowNormal = 2,
    Normal = 3,
    AboveNormal = 4,
    High = 5,
    Realtime = 6,
    Critical = 7,
}

impl Priority {
    /// Number of priority levels.
    pub const COUNT: usize = 8;

    /// All levels, lowest first.
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Idle,
        Priority::Low,
        Priority::BelowNormal,
        Priority::Normal,
        Priority::AboveNormal,
        Priority::High,
        Priority::Realtime,
        Priority::Critical,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Level for a numeric priority, `None` above 7.
    pub const fn from_index(index: usize) -> Option<Priority> {
        if index < Self::COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// =============================================================================
// Task identity and state
// =============================================================================

/// Handle to a registered task: its slot in the kernel's task table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub(crate) const fn from_index(index: usize) -> TaskId {
        TaskId(index as u8)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// On its priority's ready list, not executing.
    Ready,
    /// Selected by the scheduler. Still linked on its ready list.
    Running,
    /// Waiting on a synchronization object or its notification slot.
    Blocked,
    /// Removed from scheduling until resumed (also the state of a task whose
    /// entry function returned).
    Suspended,
    /// Sleeping on the delayed list until its wake time.
    Delayed,
}

// =============================================================================
// Errors
// =============================================================================

/// Error kinds returned by kernel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// The wait deadline passed before the operation could complete.
    Timeout,
    /// A bounded container (queue, counting semaphore, notification slot)
    /// cannot accept another item.
    QueueFull,
    /// Nothing to receive.
    QueueEmpty,
    /// Mutex released by a task that does not hold it.
    NotOwner,
    /// A fixed-size table or pool is exhausted.
    NoMemory,
    /// Pointer handed back to a pool that did not allocate it.
    InvalidPointer,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::Timeout => "operation timed out",
            KernelError::QueueFull => "queue full",
            KernelError::QueueEmpty => "queue empty",
            KernelError::NotOwner => "mutex not owned by caller",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidPointer => "pointer does not belong to this pool",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KernelError {}

/// Result type used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::Realtime);
        assert!(Priority::Idle < Priority::Low);
        assert_eq!(Priority::Critical.index(), 7);
        assert_eq!(Priority::from_index(3), Some(Priority::Normal));
        assert_eq!(Priority::from_index(8), None);
    }

    #[test]
    fn test_infinite_sentinel() {
        assert_eq!(INFINITE, u32::MAX);
    }
}
