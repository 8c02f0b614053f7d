use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use anyhow::{anyhow, bail, ensure, Result};

/// Fixed set of exclusive slots shared by concurrent callers.
pub struct SessionPool<T> {
    slots: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> SessionPool<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            slots: items.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hands out the first idle slot, scanning from the round-robin cursor.
    /// Waits on the cursor's slot only when every slot is busy.
    pub fn acquire(&self) -> Result<(usize, MutexGuard<'_, T>)> {
        ensure!(!self.slots.is_empty(), "session pool is empty");
        let len = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;

        for step in 0..len {
            let slot = (start + step) % len;
            match self.slots[slot].try_lock() {
                Ok(guard) => return Ok((slot, guard)),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => bail!("session {slot} is poisoned"),
            }
        }

        let guard = self.slots[start]
            .lock()
            .map_err(|_| anyhow!("session {start} is poisoned"))?;
        Ok((start, guard))
    }
}
