/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 *
 * [AMENDMENT] Fixed-block pool. Free blocks are chained through their own
 * storage, like the heap_4 free list, but every block has the same size so
 * there is nothing to split or coalesce.
 */

use core::cell::{Cell, UnsafeCell};
use core::mem::{align_of, size_of, MaybeUninit};
use core::ptr::NonNull;

use super::PoolStats;
use crate::types::{KernelError, Result};

/// End-of-list marker in the free chain.
const NIL: usize = usize::MAX;

#[repr(C, align(8))]
struct Block<const B: usize>(MaybeUninit<[u8; B]>);

#[derive(Clone, Copy)]
struct FreeList {
    head: usize,
    initialised: bool,
    available: usize,
    minimum_ever: usize,
    allocations: usize,
    frees: usize,
}

/// `N` blocks of at least `B` bytes each, 8-byte aligned.
pub struct Pool<const B: usize, const N: usize> {
    storage: UnsafeCell<[Block<B>; N]>,
    free: critical_section::Mutex<Cell<FreeList>>,
}

// Safety: block storage is only handed out through the critical-section
// protected free list; each block has at most one owner.
unsafe impl<const B: usize, const N: usize> Sync for Pool<B, N> {}

impl<const B: usize, const N: usize> Pool<B, N> {
    const LAYOUT_OK: () = {
        assert!(N > 0, "pool needs at least one block");
        assert!(B >= size_of::<usize>(), "pool block too small to hold a free-list link");
    };

    /// Distance between consecutive blocks.
    const STRIDE: usize = size_of::<Block<B>>();

    pub const fn new() -> Self {
        let () = Self::LAYOUT_OK;
        Pool {
            storage: UnsafeCell::new([const { Block(MaybeUninit::uninit()) }; N]),
            free: critical_section::Mutex::new(Cell::new(FreeList {
                head: NIL,
                initialised: false,
                available: N,
                minimum_ever: N,
                allocations: 0,
                frees: 0,
            })),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.get().cast::<u8>()
    }

    fn block_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: callers pass index < N, so the offset stays in bounds.
        unsafe { self.base().add(index * Self::STRIDE) }
    }

    /// # Safety
    /// Block `index` must be free (not owned by a caller).
    unsafe fn set_link(&self, index: usize, next: usize) {
        // SAFETY: free block, aligned to 8 >= align_of::<usize>().
        unsafe { self.block_ptr(index).cast::<usize>().write(next) };
    }

    /// # Safety
    /// Block `index` must be on the free chain.
    unsafe fn link(&self, index: usize) -> usize {
        // SAFETY: written by `set_link` when the block was freed.
        unsafe { self.block_ptr(index).cast::<usize>().read() }
    }

    /// Chain every block on first use, so `new` can stay `const`.
    fn initialise(&self, list: &mut FreeList) {
        debug_assert!(align_of::<Block<B>>() >= align_of::<usize>());
        for index in 0..N {
            let next = if index + 1 < N { index + 1 } else { NIL };
            // SAFETY: nothing has been handed out yet.
            unsafe { self.set_link(index, next) };
        }
        list.head = 0;
        list.initialised = true;
    }

    /// Pop a free block. Fails with [`KernelError::NoMemory`] when every
    /// block is in use.
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        critical_section::with(|cs| {
            let cell = self.free.borrow(cs);
            let mut list = cell.get();
            if !list.initialised {
                self.initialise(&mut list);
            }
            if list.head == NIL {
                cell.set(list);
                return Err(KernelError::NoMemory);
            }
            let index = list.head;
            // SAFETY: `index` is the head of the free chain.
            list.head = unsafe { self.link(index) };
            list.available -= 1;
            list.minimum_ever = list.minimum_ever.min(list.available);
            list.allocations += 1;
            cell.set(list);
            NonNull::new(self.block_ptr(index)).ok_or(KernelError::NoMemory)
        })
    }

    /// Return a block. Fails with [`KernelError::InvalidPointer`] if `ptr`
    /// is not the start of one of this pool's blocks. Freeing a block twice
    /// is not detected.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let index = self.index_of(ptr).ok_or(KernelError::InvalidPointer)?;
        critical_section::with(|cs| {
            let cell = self.free.borrow(cs);
            let mut list = cell.get();
            if !list.initialised {
                return Err(KernelError::InvalidPointer);
            }
            // SAFETY: the caller gives the block back; it is free from here.
            unsafe { self.set_link(index, list.head) };
            list.head = index;
            list.available += 1;
            list.frees += 1;
            cell.set(list);
            Ok(())
        })
    }

    /// Block index of `ptr`, if it is a block boundary inside the pool.
    fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.base() as usize;
        let addr = ptr.as_ptr() as usize;
        let offset = addr.checked_sub(base)?;
        if offset >= N * Self::STRIDE || offset % Self::STRIDE != 0 {
            return None;
        }
        Some(offset / Self::STRIDE)
    }

    /// Whether `ptr` lies anywhere inside the pool's storage.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + N * Self::STRIDE
    }

    /// Free blocks.
    pub fn available(&self) -> usize {
        critical_section::with(|cs| self.free.borrow(cs).get().available)
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Usable bytes per block (the requested size rounded up to 8).
    pub const fn block_size(&self) -> usize {
        Self::STRIDE
    }

    pub fn stats(&self) -> PoolStats {
        let list = critical_section::with(|cs| self.free.borrow(cs).get());
        PoolStats {
            capacity: N,
            available: list.available,
            minimum_ever_available: list.minimum_ever,
            allocations: list.allocations,
            frees: list.frees,
        }
    }
}

impl<const B: usize, const N: usize> Default for Pool<B, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaust_and_restore() {
        let pool: Pool<32, 4> = Pool::new();
        let mut blocks = [NonNull::dangling(); 4];
        for b in blocks.iter_mut() {
            *b = pool.allocate().unwrap();
        }
        assert_eq!(pool.allocate(), Err(KernelError::NoMemory));
        assert_eq!(pool.available(), 0);

        pool.deallocate(blocks[2]).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate(), Ok(blocks[2]));
    }

    #[test]
    fn test_blocks_are_distinct_and_aligned() {
        let pool: Pool<12, 3> = Pool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(pool.block_size(), 16);
        let distance = (b.as_ptr() as usize).abs_diff(a.as_ptr() as usize);
        assert_eq!(distance % pool.block_size(), 0);
    }

    #[test]
    fn test_foreign_and_misaligned_pointers_rejected() {
        let pool: Pool<16, 2> = Pool::new();
        let block = pool.allocate().unwrap();
        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>();
        assert_eq!(pool.deallocate(foreign), Err(KernelError::InvalidPointer));

        let inner = unsafe { NonNull::new_unchecked(block.as_ptr().add(4)) };
        assert!(pool.contains(inner.as_ptr()));
        assert_eq!(pool.deallocate(inner), Err(KernelError::InvalidPointer));
        assert_eq!(pool.deallocate(block), Ok(()));
    }

    #[test]
    fn test_stats_track_low_water() {
        let pool: Pool<8, 3> = Pool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.minimum_ever_available, 1);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 2);
    }
}
