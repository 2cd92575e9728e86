//! Process Slots
//!
//! Counting limit on live tool processes. One set of slots is shared by a
//! run and every nested workflow it starts, so `max_parallel` bounds the
//! whole process tree rather than each engine separately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// How often a waiting instance re-checks cancellation.
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ProcessSlots {
    capacity: usize,
    free: Mutex<usize>,
    released: Condvar,
}

/// Held while a process runs; the slot returns on drop.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard<'a> {
    slots: &'a ProcessSlots,
}

impl ProcessSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            free: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a slot is free.
    ///
    /// Returns `None` if `cancel` is raised while waiting.
    pub fn acquire(&self, cancel: &AtomicBool) -> Option<SlotGuard<'_>> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if cancel.load(Ordering::SeqCst) {
                return None;
            }
            if *free > 0 {
                *free -= 1;
                return Some(SlotGuard { slots: self });
            }
            free = match self.released.wait_timeout(free, WAIT_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        *self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut free = self.slots.free.lock().unwrap_or_else(PoisonError::into_inner);
        *free += 1;
        self.slots.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_zero_capacity_still_admits_one() {
        let slots = ProcessSlots::new(0);
        assert_eq!(slots.capacity(), 1);
        let cancel = AtomicBool::new(false);
        assert!(slots.acquire(&cancel).is_some());
    }

    #[test]
    fn test_guard_returns_slot_on_drop() {
        let slots = ProcessSlots::new(2);
        let cancel = AtomicBool::new(false);

        let first = slots.acquire(&cancel).unwrap();
        let second = slots.acquire(&cancel).unwrap();
        assert_eq!(slots.available(), 0);

        drop(first);
        assert_eq!(slots.available(), 1);
        drop(second);
        assert_eq!(slots.available(), 2);
    }

    #[test]
    fn test_waiter_wakes_when_slot_released() {
        let slots = Arc::new(ProcessSlots::new(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let held = slots.acquire(&cancel).unwrap();

        let waiter = {
            let slots = Arc::clone(&slots);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || slots.acquire(&cancel).is_some())
        };
        thread::sleep(Duration::from_millis(100));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(slots.available(), 1);
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let slots = Arc::new(ProcessSlots::new(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let _held = slots.acquire(&cancel).unwrap();

        let started = Instant::now();
        let waiter = {
            let slots = Arc::clone(&slots);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || slots.acquire(&cancel).is_none())
        };
        thread::sleep(Duration::from_millis(100));
        cancel.store(true, Ordering::SeqCst);
        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
