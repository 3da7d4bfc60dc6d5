//! Synchronization primitives
//!
//! Every primitive is a plain value with `const fn new`, so it can live in a
//! `static`. Each one borrows the [`Kernel`](crate::Kernel) it schedules
//! against and owns the wait list its blocked tasks are parked on.
//!
//! All blocking calls take a timeout in milliseconds: `0` never blocks and
//! [`INFINITE`](crate::INFINITE) waits forever.
//!
//! # Example
//!
//! ```ignore
//! use rtkernel::sync::{Mutex, Queue};
//!
//! static KERNEL: Kernel = Kernel::new();
//! static LOG_LOCK: Mutex<'static> = Mutex::new(&KERNEL);
//! static EVENTS: Queue<'static, u32, 16> = Queue::new(&KERNEL);
//!
//! fn producer(_: &'static Kernel) {
//!     EVENTS.send(42, INFINITE).unwrap();
//! }
//! ```

mod event_flags;
mod mutex;
pub(crate) mod notification;
mod queue;
mod semaphore;
mod task;

pub use event_flags::EventFlags;
pub use mutex::{Mutex, MutexGuard};
pub use notification::{NotificationSlot, NotifyAction, NotifyClear};
pub use queue::{IpcMessage, Queue};
pub use semaphore::{BinarySemaphore, CountingSemaphore};
pub use task::TaskHandle;
