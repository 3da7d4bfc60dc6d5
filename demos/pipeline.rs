//! rtkernel host demo
//!
//! Runs a small sensor pipeline on the host port:
//! - `sampler` (High) produces a reading every 5 ms into a queue
//! - `filter` (Normal) averages readings into pool blocks and hands their
//!   addresses to the reporter
//! - `reporter` (Low) prints the averages, guarded by a mutex
//! - the main thread waits for the done flag, then prints task statistics
//!
//! Run with `cargo run --example pipeline`.

use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use rtkernel::memory::Pool;
use rtkernel::sync::{EventFlags, Mutex, Queue};
use rtkernel::{Kernel, Priority, Task, INFINITE};

const WINDOW: u32 = 4;
const REPORTS: u32 = 8;

const DONE: u32 = 1 << 0;

static KERNEL: Kernel = Kernel::new();

static READINGS: Queue<'static, u32, 8> = Queue::new(&KERNEL);
static AVERAGES: Queue<'static, usize, 4> = Queue::new(&KERNEL);
static BLOCKS: Pool<16, 4> = Pool::new();
static CONSOLE: Mutex<'static> = Mutex::new(&KERNEL);
static STATUS: EventFlags<'static> = EventFlags::new(&KERNEL);

static SAMPLER: Task<2048> = Task::new("sampler", Priority::High, sampler);
static FILTER: Task<2048> = Task::new("filter", Priority::Normal, filter);
static REPORTER: Task<2048> = Task::new("reporter", Priority::Low, reporter);

fn sampler(kernel: &'static Kernel) {
    let mut reading = 100u32;
    loop {
        reading = reading.wrapping_mul(1_103_515_245).wrapping_add(12_345) % 1000;
        if READINGS.send(reading, 0).is_err() {
            println!("[sampler] queue full, dropping {}", reading);
        }
        kernel.delay(5);
    }
}

fn filter(_: &'static Kernel) {
    loop {
        let mut sum = 0;
        for _ in 0..WINDOW {
            sum += READINGS.receive(INFINITE).unwrap_or(0);
        }
        let Ok(block) = BLOCKS.allocate() else {
            continue;
        };
        // SAFETY: the block is ours until the reporter frees it; 16 bytes
        // hold one u32.
        unsafe { block.as_ptr().cast::<u32>().write(sum / WINDOW) };
        if AVERAGES.send(block.as_ptr() as usize, INFINITE).is_err() {
            let _ = BLOCKS.deallocate(block);
        }
    }
}

fn reporter(kernel: &'static Kernel) {
    for n in 1..=REPORTS {
        let Ok(addr) = AVERAGES.receive(INFINITE) else {
            continue;
        };
        let Some(block) = NonNull::new(addr as *mut u8) else {
            continue;
        };
        // SAFETY: written by the filter before the address was queued.
        let average = unsafe { block.as_ptr().cast::<u32>().read() };
        if let Ok(_console) = CONSOLE.guard(INFINITE) {
            println!("[reporter] #{} average {} at tick {}", n, average, kernel.tick_count());
        }
        let _ = BLOCKS.deallocate(block);
    }
    STATUS.set(DONE);
}

fn main() {
    KERNEL.register(&SAMPLER).expect("register sampler");
    KERNEL.register(&FILTER).expect("register filter");
    KERNEL.register(&REPORTER).expect("register reporter");

    thread::spawn(|| KERNEL.start());

    while STATUS.get() & DONE == 0 {
        thread::sleep(Duration::from_millis(10));
    }

    for task in [&SAMPLER, &FILTER, &REPORTER] {
        let handle = KERNEL.task(task.id().expect("registered"));
        println!(
            "{:<10} {:?} {:?} run {} us",
            handle.name(),
            handle.priority(),
            handle.state(),
            handle.run_time_us()
        );
    }
    println!("pool: {:?}", BLOCKS.stats());
}
