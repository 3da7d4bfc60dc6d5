//! Blocking primitives exercised by real tasks on the host port.

mod common;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::thread;
use std::time::Duration;

use common::{boot, wait_for_state, wait_until, SETTLE};
use rtkernel::memory::Pool;
use rtkernel::sync::{
    BinarySemaphore, CountingSemaphore, EventFlags, Mutex, NotifyAction, NotifyClear, Queue,
};
use rtkernel::{Kernel, KernelError, Priority, Task, TaskState, INFINITE};

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_queue_blocks_both_ways_and_keeps_fifo_order() {
    static KERNEL: Kernel = Kernel::new();
    static CHANNEL: Queue<'static, u32, 4> = Queue::new(&KERNEL);
    static RECEIVED: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
    static PRODUCER: Task<1024> = Task::new("producer", Priority::Normal, producer);
    static CONSUMER: Task<1024> = Task::new("consumer", Priority::Low, consumer);

    // Outranks the consumer, so it fills the queue and blocks on it.
    fn producer(_: &'static Kernel) {
        for value in 0..32 {
            CHANNEL.send(value, INFINITE).unwrap();
        }
    }

    fn consumer(kernel: &'static Kernel) {
        loop {
            let value = CHANNEL.receive(INFINITE).unwrap();
            RECEIVED.lock().unwrap().push(value);
            if value % 8 == 0 {
                kernel.delay(1);
            }
        }
    }

    KERNEL.register(&PRODUCER).unwrap();
    KERNEL.register(&CONSUMER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || RECEIVED.lock().unwrap().len() == 32));
    let received = RECEIVED.lock().unwrap().clone();
    assert_eq!(received, (0..32).collect::<Vec<_>>());
    assert!(CHANNEL.is_empty());

    let consumer_id = CONSUMER.id().unwrap();
    assert!(wait_for_state(&KERNEL, consumer_id, TaskState::Blocked));
}

#[test]
fn test_queue_receive_times_out() {
    static KERNEL: Kernel = Kernel::new();
    static EMPTY: Queue<'static, u8, 2> = Queue::new(&KERNEL);
    static WAITED: AtomicU32 = AtomicU32::new(0);
    static TIMED_OUT: AtomicBool = AtomicBool::new(false);
    static READER: Task<1024> = Task::new("reader", Priority::Normal, reader);

    fn reader(kernel: &'static Kernel) {
        let start = kernel.tick_count();
        let result = EMPTY.receive(25);
        WAITED.store(kernel.tick_count().wrapping_sub(start), Ordering::SeqCst);
        TIMED_OUT.store(result == Err(KernelError::Timeout), Ordering::SeqCst);
    }

    KERNEL.register(&READER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || TIMED_OUT.load(Ordering::SeqCst)));
    assert!(WAITED.load(Ordering::SeqCst) >= 25);
    assert_eq!(EMPTY.try_receive(), Err(KernelError::QueueEmpty));
}

// ============================================================================
// Mutex
// ============================================================================

#[test]
fn test_mutex_owner_inherits_waiter_priority() {
    static KERNEL: Kernel = Kernel::new();
    static LOCK: Mutex<'static> = Mutex::new(&KERNEL);
    static WHILE_HELD: AtomicU8 = AtomicU8::new(u8::MAX);
    static AFTER_UNLOCK: AtomicU8 = AtomicU8::new(u8::MAX);
    static HIGH_GOT_LOCK: AtomicBool = AtomicBool::new(false);
    static LOW: Task<1024> = Task::new("low", Priority::Low, low);
    static HIGH: Task<1024> = Task::new("high", Priority::High, high);

    fn low(kernel: &'static Kernel) {
        let me = kernel.current_task().unwrap();
        LOCK.lock(INFINITE).unwrap();
        kernel.delay(40);
        WHILE_HELD.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
        LOCK.unlock().unwrap();
        AFTER_UNLOCK.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
    }

    fn high(kernel: &'static Kernel) {
        kernel.delay(10);
        LOCK.lock(INFINITE).unwrap();
        HIGH_GOT_LOCK.store(true, Ordering::SeqCst);
        LOCK.unlock().unwrap();
    }

    KERNEL.register(&LOW).unwrap();
    KERNEL.register(&HIGH).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || AFTER_UNLOCK.load(Ordering::SeqCst) != u8::MAX));
    assert!(HIGH_GOT_LOCK.load(Ordering::SeqCst));
    assert_eq!(WHILE_HELD.load(Ordering::SeqCst), Priority::High as u8);
    assert_eq!(AFTER_UNLOCK.load(Ordering::SeqCst), Priority::Low as u8);
    assert!(!LOCK.is_locked());
}

#[test]
fn test_mutex_lock_times_out_and_restores_owner_priority() {
    static KERNEL: Kernel = Kernel::new();
    static LOCK: Mutex<'static> = Mutex::new(&KERNEL);
    static RESULT: AtomicU8 = AtomicU8::new(0);
    static OWNER_AFTER_TIMEOUT: AtomicU8 = AtomicU8::new(u8::MAX);
    static HOLDER: Task<1024> = Task::new("holder", Priority::Low, holder);
    static WAITER: Task<1024> = Task::new("waiter", Priority::High, waiter);

    fn holder(kernel: &'static Kernel) {
        let _guard = LOCK.guard(INFINITE).unwrap();
        loop {
            kernel.delay(5);
        }
    }

    fn waiter(kernel: &'static Kernel) {
        kernel.delay(5);
        let timed_out = LOCK.lock(20) == Err(KernelError::Timeout);
        let owner = LOCK.owner().unwrap();
        OWNER_AFTER_TIMEOUT.store(kernel.task_priority(owner) as u8, Ordering::SeqCst);
        RESULT.store(if timed_out { 1 } else { 2 }, Ordering::SeqCst);
        // Not the owner.
        assert_eq!(LOCK.unlock(), Err(KernelError::NotOwner));
    }

    KERNEL.register(&HOLDER).unwrap();
    KERNEL.register(&WAITER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || RESULT.load(Ordering::SeqCst) != 0));
    assert_eq!(RESULT.load(Ordering::SeqCst), 1);
    assert_eq!(OWNER_AFTER_TIMEOUT.load(Ordering::SeqCst), Priority::Low as u8);
    assert_eq!(LOCK.owner(), HOLDER.id());
}

#[test]
fn test_mutex_recursive_depth_and_partial_unlock() {
    static KERNEL: Kernel = Kernel::new();
    static LOCK: Mutex<'static> = Mutex::new(&KERNEL);
    static DEPTHS: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
    static EXTRA_UNLOCK_REFUSED: AtomicBool = AtomicBool::new(false);
    static NESTER: Task<1024> = Task::new("nester", Priority::Normal, nester);

    fn record() {
        DEPTHS.lock().unwrap().push(LOCK.depth());
    }

    fn nester(kernel: &'static Kernel) {
        let me = kernel.current_task();
        LOCK.try_lock().unwrap();
        record();
        LOCK.lock(INFINITE).unwrap();
        record();
        LOCK.try_lock().unwrap();
        record();
        for _ in 0..3 {
            LOCK.unlock().unwrap();
            assert_eq!(LOCK.owner(), if LOCK.depth() > 0 { me } else { None });
            record();
        }
        EXTRA_UNLOCK_REFUSED.store(LOCK.unlock() == Err(KernelError::NotOwner), Ordering::SeqCst);
    }

    KERNEL.register(&NESTER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || EXTRA_UNLOCK_REFUSED.load(Ordering::SeqCst)));
    assert_eq!(*DEPTHS.lock().unwrap(), [1, 2, 3, 2, 1, 0]);
    assert!(!LOCK.is_locked());
}

#[test]
fn test_mutex_excludes_three_contending_tasks() {
    const ROUNDS: u32 = 20;

    static KERNEL: Kernel = Kernel::new();
    static LOCK: Mutex<'static> = Mutex::new(&KERNEL);
    static INSIDE: AtomicBool = AtomicBool::new(false);
    static OVERLAPS: AtomicU32 = AtomicU32::new(0);
    static ENTRIES: AtomicU32 = AtomicU32::new(0);
    static LOW: Task<1024> = Task::new("low", Priority::Low, worker);
    static MID: Task<1024> = Task::new("mid", Priority::Normal, worker);
    static HIGH: Task<1024> = Task::new("high", Priority::High, worker);

    fn worker(kernel: &'static Kernel) {
        for _ in 0..ROUNDS {
            let guard = LOCK.guard(INFINITE).unwrap();
            if INSIDE.swap(true, Ordering::SeqCst) {
                OVERLAPS.fetch_add(1, Ordering::SeqCst);
            }
            // Sleep while holding it so the others pile up on the lock.
            kernel.delay(1);
            INSIDE.store(false, Ordering::SeqCst);
            ENTRIES.fetch_add(1, Ordering::SeqCst);
            drop(guard);
            kernel.delay(1);
        }
    }

    KERNEL.register(&LOW).unwrap();
    KERNEL.register(&MID).unwrap();
    KERNEL.register(&HIGH).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || ENTRIES.load(Ordering::SeqCst) == 3 * ROUNDS));
    assert_eq!(OVERLAPS.load(Ordering::SeqCst), 0);
    assert!(!LOCK.is_locked());
    let low = LOW.id().unwrap();
    assert!(wait_for_state(&KERNEL, low, TaskState::Suspended));
    assert_eq!(KERNEL.task_priority(low), Priority::Low);
}

#[test]
fn test_mutex_handoff_passes_inheritance_to_next_owner() {
    static KERNEL: Kernel = Kernel::new();
    static LOCK: Mutex<'static> = Mutex::new(&KERNEL);
    static MID_WHILE_HOLDING: AtomicU8 = AtomicU8::new(u8::MAX);
    static MID_AFTER_UNLOCK: AtomicU8 = AtomicU8::new(u8::MAX);
    static HIGH_WAS_BLOCKED: AtomicBool = AtomicBool::new(false);
    static HIGH_GOT_LOCK: AtomicBool = AtomicBool::new(false);
    static LOW: Task<1024> = Task::new("low", Priority::Low, low);
    static MID: Task<1024> = Task::new("mid", Priority::Normal, mid);
    static HIGH: Task<1024> = Task::new("high", Priority::High, high);

    fn low(kernel: &'static Kernel) {
        LOCK.lock(INFINITE).unwrap();
        kernel.delay(30);
        LOCK.unlock().unwrap();
    }

    // Blocks first.
    fn high(kernel: &'static Kernel) {
        kernel.delay(5);
        LOCK.lock(INFINITE).unwrap();
        HIGH_GOT_LOCK.store(true, Ordering::SeqCst);
        LOCK.unlock().unwrap();
    }

    // Blocks last, so it is woken first.
    fn mid(kernel: &'static Kernel) {
        kernel.delay(10);
        LOCK.lock(INFINITE).unwrap();
        let me = kernel.current_task().unwrap();
        let high = HIGH.id().unwrap();
        MID_WHILE_HOLDING.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
        HIGH_WAS_BLOCKED.store(kernel.task_state(high) == TaskState::Blocked, Ordering::SeqCst);
        LOCK.unlock().unwrap();
        MID_AFTER_UNLOCK.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
    }

    KERNEL.register(&LOW).unwrap();
    KERNEL.register(&MID).unwrap();
    KERNEL.register(&HIGH).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || MID_AFTER_UNLOCK.load(Ordering::SeqCst) != u8::MAX));
    assert!(HIGH_WAS_BLOCKED.load(Ordering::SeqCst));
    assert_eq!(MID_WHILE_HOLDING.load(Ordering::SeqCst), Priority::High as u8);
    assert_eq!(MID_AFTER_UNLOCK.load(Ordering::SeqCst), Priority::Normal as u8);
    assert!(HIGH_GOT_LOCK.load(Ordering::SeqCst));
    assert_eq!(KERNEL.task_priority(LOW.id().unwrap()), Priority::Low);
}

#[test]
fn test_mutex_nested_release_drops_boost() {
    static KERNEL: Kernel = Kernel::new();
    static OUTER: Mutex<'static> = Mutex::new(&KERNEL);
    static INNER: Mutex<'static> = Mutex::new(&KERNEL);
    static WHILE_HOLDING_BOTH: AtomicU8 = AtomicU8::new(u8::MAX);
    static AFTER_BOTH: AtomicU8 = AtomicU8::new(u8::MAX);
    static HIGH_GOT_OUTER: AtomicBool = AtomicBool::new(false);
    static LOW: Task<1024> = Task::new("low", Priority::Low, low);
    static HIGH: Task<1024> = Task::new("high", Priority::High, high);

    fn low(kernel: &'static Kernel) {
        let me = kernel.current_task().unwrap();
        OUTER.lock(INFINITE).unwrap();
        kernel.delay(20);
        // Boosted through OUTER by now.
        INNER.lock(INFINITE).unwrap();
        WHILE_HOLDING_BOTH.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
        OUTER.unlock().unwrap();
        INNER.unlock().unwrap();
        AFTER_BOTH.store(kernel.task_priority(me) as u8, Ordering::SeqCst);
    }

    fn high(kernel: &'static Kernel) {
        kernel.delay(5);
        OUTER.lock(INFINITE).unwrap();
        HIGH_GOT_OUTER.store(true, Ordering::SeqCst);
        OUTER.unlock().unwrap();
    }

    KERNEL.register(&LOW).unwrap();
    KERNEL.register(&HIGH).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || AFTER_BOTH.load(Ordering::SeqCst) != u8::MAX));
    assert_eq!(WHILE_HOLDING_BOTH.load(Ordering::SeqCst), Priority::High as u8);
    assert_eq!(AFTER_BOTH.load(Ordering::SeqCst), Priority::Low as u8);
    assert!(HIGH_GOT_OUTER.load(Ordering::SeqCst));
    assert!(!OUTER.is_locked());
    assert!(!INNER.is_locked());
}

// ============================================================================
// Semaphores
// ============================================================================

#[test]
fn test_binary_semaphore_given_from_outside_wakes_task() {
    static KERNEL: Kernel = Kernel::new();
    static SIGNAL: BinarySemaphore<'static> = BinarySemaphore::new(&KERNEL);
    static WOKEN: AtomicU32 = AtomicU32::new(0);
    static HANDLER: Task<1024> = Task::new("handler", Priority::High, handler);

    fn handler(_: &'static Kernel) {
        loop {
            SIGNAL.take(INFINITE).unwrap();
            WOKEN.fetch_add(1, Ordering::SeqCst);
        }
    }

    KERNEL.register(&HANDLER).unwrap();
    boot(&KERNEL);
    let id = HANDLER.id().unwrap();

    for round in 1..=3 {
        assert!(wait_for_state(&KERNEL, id, TaskState::Blocked));
        // The test thread is not a task, like an interrupt handler.
        SIGNAL.give();
        assert!(wait_until(SETTLE, || WOKEN.load(Ordering::SeqCst) == round));
    }
    assert_eq!(SIGNAL.count(), 0);
}

#[test]
fn test_counting_semaphore_timeout_then_drain() {
    static KERNEL: Kernel = Kernel::new();
    static SLOTS: CountingSemaphore<'static, 3> = CountingSemaphore::new(&KERNEL, 0);
    static TIMED_OUT: AtomicBool = AtomicBool::new(false);
    static TAKEN: AtomicU32 = AtomicU32::new(0);
    static USER: Task<1024> = Task::new("user", Priority::Normal, user);

    fn user(_: &'static Kernel) {
        TIMED_OUT.store(SLOTS.take(15) == Err(KernelError::Timeout), Ordering::SeqCst);
        loop {
            SLOTS.take(INFINITE).unwrap();
            TAKEN.fetch_add(1, Ordering::SeqCst);
        }
    }

    KERNEL.register(&USER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || TIMED_OUT.load(Ordering::SeqCst)));
    let id = USER.id().unwrap();
    assert!(wait_for_state(&KERNEL, id, TaskState::Blocked));

    SLOTS.give().unwrap();
    SLOTS.give().unwrap();
    assert!(wait_until(SETTLE, || TAKEN.load(Ordering::SeqCst) == 2));
    assert_eq!(SLOTS.count(), 0);
}

// ============================================================================
// Event flags
// ============================================================================

#[test]
fn test_event_flags_wait_all_collects_bits_from_two_setters() {
    static KERNEL: Kernel = Kernel::new();
    static FLAGS: EventFlags<'static> = EventFlags::new(&KERNEL);
    static SEEN: AtomicU32 = AtomicU32::new(0);
    static ANY_TIMED_OUT: AtomicBool = AtomicBool::new(false);
    static WAITER: Task<1024> = Task::new("waiter", Priority::High, waiter);
    static SETTER: Task<1024> = Task::new("setter", Priority::Low, setter);

    fn waiter(_: &'static Kernel) {
        let seen = FLAGS.wait_all(0b11, INFINITE, true).unwrap();
        SEEN.store(seen, Ordering::SeqCst);
        ANY_TIMED_OUT.store(FLAGS.wait_any(0b100, 10, false) == Err(KernelError::Timeout), Ordering::SeqCst);
    }

    fn setter(kernel: &'static Kernel) {
        FLAGS.set(0b01);
        kernel.delay(5);
        FLAGS.set(0b10);
    }

    KERNEL.register(&WAITER).unwrap();
    KERNEL.register(&SETTER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || ANY_TIMED_OUT.load(Ordering::SeqCst)));
    assert_eq!(SEEN.load(Ordering::SeqCst), 0b11);
    assert_eq!(FLAGS.get(), 0);
}

#[test]
fn test_event_flags_wait_any_blocks_until_a_wanted_bit() {
    static KERNEL: Kernel = Kernel::new();
    static FLAGS: EventFlags<'static> = EventFlags::new(&KERNEL);
    static SEEN: AtomicU32 = AtomicU32::new(0);
    static EMPTY_MASK_RETURNED: AtomicBool = AtomicBool::new(false);
    static WAITER: Task<1024> = Task::new("waiter", Priority::High, waiter);

    fn waiter(_: &'static Kernel) {
        SEEN.store(FLAGS.wait_any(0b1100, INFINITE, true).unwrap(), Ordering::SeqCst);
        EMPTY_MASK_RETURNED.store(FLAGS.wait_any(0, INFINITE, false) == Ok(0), Ordering::SeqCst);
    }

    KERNEL.register(&WAITER).unwrap();
    boot(&KERNEL);
    let id = WAITER.id().unwrap();

    assert!(wait_for_state(&KERNEL, id, TaskState::Blocked));
    FLAGS.set(0b0001);
    thread::sleep(Duration::from_millis(20));
    assert!(wait_for_state(&KERNEL, id, TaskState::Blocked));
    assert_eq!(SEEN.load(Ordering::SeqCst), 0);

    FLAGS.set(0b0100);
    assert!(wait_until(SETTLE, || EMPTY_MASK_RETURNED.load(Ordering::SeqCst)));
    assert_eq!(SEEN.load(Ordering::SeqCst), 0b0100);
    assert_eq!(FLAGS.get(), 0b0001);
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn test_notification_wakes_waiting_task() {
    static KERNEL: Kernel = Kernel::new();
    static BITS: AtomicU32 = AtomicU32::new(0);
    static COUNT: AtomicU32 = AtomicU32::new(0);
    static PROCEED: AtomicBool = AtomicBool::new(false);
    static RECEIVER: Task<1024> = Task::new("receiver", Priority::Normal, receiver);

    fn receiver(kernel: &'static Kernel) {
        let bits = kernel.notify_wait(NotifyClear::All, INFINITE).unwrap();
        BITS.store(bits, Ordering::SeqCst);
        while !PROCEED.load(Ordering::SeqCst) {
            kernel.delay(1);
        }
        let mut count = 0;
        while kernel.notify_try_wait(NotifyClear::Decrement).is_ok() {
            count += 1;
        }
        COUNT.store(count, Ordering::SeqCst);
    }

    KERNEL.register(&RECEIVER).unwrap();
    boot(&KERNEL);
    let id = RECEIVER.id().unwrap();

    assert!(wait_for_state(&KERNEL, id, TaskState::Blocked));
    assert_eq!(KERNEL.notify(id, NotifyAction::SetBits(0x5)), Ok(0));
    assert!(wait_until(SETTLE, || BITS.load(Ordering::SeqCst) == 0x5));

    for _ in 0..3 {
        KERNEL.notify(id, NotifyAction::Increment).unwrap();
    }
    assert_eq!(KERNEL.notify_peek(id), (3, true));
    assert_eq!(KERNEL.notify(id, NotifyAction::OverwriteIfEmpty(9)), Err(KernelError::QueueFull));
    PROCEED.store(true, Ordering::SeqCst);

    assert!(wait_until(SETTLE, || COUNT.load(Ordering::SeqCst) == 3));
    assert_eq!(KERNEL.notify_peek(id), (0, false));
}

// ============================================================================
// Memory pool
// ============================================================================

#[test]
fn test_pool_blocks_travel_between_tasks() {
    const ITEMS: u32 = 20;

    static KERNEL: Kernel = Kernel::new();
    static BLOCKS: Pool<32, 4> = Pool::new();
    static HANDOFF: Queue<'static, usize, 4> = Queue::new(&KERNEL);
    static RECEIVED: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
    static PRODUCER: Task<1024> = Task::new("producer", Priority::Normal, producer);
    static CONSUMER: Task<1024> = Task::new("consumer", Priority::Low, consumer);

    fn producer(kernel: &'static Kernel) {
        let mut n = 0;
        while n < ITEMS {
            let Ok(block) = BLOCKS.allocate() else {
                // Exhausted: let the consumer give some back.
                kernel.delay(1);
                continue;
            };
            unsafe { block.as_ptr().cast::<u32>().write(n) };
            HANDOFF.send(block.as_ptr() as usize, INFINITE).unwrap();
            n += 1;
        }
    }

    fn consumer(_: &'static Kernel) {
        loop {
            let addr = HANDOFF.receive(INFINITE).unwrap();
            let block = NonNull::new(addr as *mut u8).unwrap();
            let value = unsafe { block.as_ptr().cast::<u32>().read() };
            RECEIVED.lock().unwrap().push(value);
            BLOCKS.deallocate(block).unwrap();
        }
    }

    KERNEL.register(&PRODUCER).unwrap();
    KERNEL.register(&CONSUMER).unwrap();
    boot(&KERNEL);

    assert!(wait_until(SETTLE, || RECEIVED.lock().unwrap().len() == ITEMS as usize));
    assert_eq!(*RECEIVED.lock().unwrap(), (0..ITEMS).collect::<Vec<_>>());
    assert!(wait_until(SETTLE, || BLOCKS.available() == 4));
    let stats = BLOCKS.stats();
    assert_eq!(stats.allocations, ITEMS as usize);
    assert_eq!(stats.frees, ITEMS as usize);
    assert_eq!(stats.minimum_ever_available, 0);
}
