//! # Main Thread Queue
//!
//! Deferred-work queue that moves inbound I/O results onto the host's logical
//! thread.
//!
//! Socket tasks run on tokio worker threads and must never touch session or
//! game state directly. Instead they push a closure here; the host calls
//! [`MainThreadQueue::pump`] once per tick and the closures run there, in the
//! order they were queued, against the state the host owns.
//!
//! ## Locking
//! Producers hold the lock only long enough to push. `pump` swaps the pending
//! list for an empty one under the lock and runs the jobs after releasing it,
//! so a slow handler never stalls an I/O task.
//!
//! ## Usage
//! ```rust
//! use netplay_engine::utils::main_thread::MainThreadQueue;
//!
//! let queue = MainThreadQueue::<Vec<i32>>::new();
//! let producer = queue.clone();
//! std::thread::spawn(move || producer.execute_on_main_thread(|log| log.push(1)))
//!     .join()
//!     .unwrap();
//!
//! let mut log = Vec::new();
//! assert_eq!(queue.pump(&mut log), 1);
//! assert_eq!(log, vec![1]);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Job<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

struct Shared<T> {
    pending: Mutex<Vec<Job<T>>>,
    has_pending: AtomicBool,
}

/// Thread-safe queue of closures drained on the host's thread
pub struct MainThreadQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MainThreadQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                has_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Queue `job` to run on the next pump. Safe to call from any thread.
    pub fn execute_on_main_thread<F>(&self, job: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let mut pending = self.lock();
        pending.push(Box::new(job));
        self.shared.has_pending.store(true, Ordering::Release);
    }

    /// Run every job queued so far against `target`, returning how many ran.
    ///
    /// Jobs queued while the batch runs wait for the next pump. Call this only
    /// from the thread that owns `target`.
    pub fn pump(&self, target: &mut T) -> usize {
        if !self.shared.has_pending.load(Ordering::Acquire) {
            return 0;
        }

        let batch = {
            let mut pending = self.lock();
            self.shared.has_pending.store(false, Ordering::Release);
            std::mem::take(&mut *pending)
        };

        let count = batch.len();
        for job in batch {
            job(target);
        }
        count
    }

    /// Number of jobs waiting for the next pump
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued job without running it
    pub fn clear(&self) {
        let mut pending = self.lock();
        pending.clear();
        self.shared.has_pending.store(false, Ordering::Release);
    }

    // A job that panicked while being queued cannot leave the Vec half-written,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Vec<Job<T>>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Clone for MainThreadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for MainThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for MainThreadQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadQueue")
            .field("pending", &self.len())
            .finish()
    }
}
