//! SeqLock cell for the published segment geometry
//!
//! The owner is the only writer. The peer reads a consistent snapshot
//! without blocking the owner; it simply retries if a publish raced the read.
//!
//! # Performance
//! - Publish: two atomic stores + a small copy
//! - Read: one copy, retried only while a publish is in progress

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// A sequence-locked value living in shared memory
#[repr(C)]
pub struct SeqCell<T: Copy> {
    /// Sequence number: odd = write in progress, even = stable
    sequence: AtomicU64,
    value: UnsafeCell<T>,
}

// SAFETY: readers never observe a torn value (they retry), and there is a
// single writer by protocol.
unsafe impl<T: Copy + Send> Sync for SeqCell<T> {}

impl<T: Copy> SeqCell<T> {
    /// Initialize the cell in place
    ///
    /// # Safety
    /// `ptr` must be valid, aligned and not yet visible to any reader.
    pub unsafe fn init(ptr: *mut Self, value: T) {
        std::ptr::addr_of_mut!((*ptr).sequence).write(AtomicU64::new(0));
        std::ptr::addr_of_mut!((*ptr).value).write(UnsafeCell::new(value));
    }

    /// Publish a new value
    ///
    /// This will:
    /// 1. Increment sequence to odd (signal write starting)
    /// 2. Copy the value
    /// 3. Increment sequence to even (signal write complete)
    pub fn publish(&self, value: &T) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        unsafe {
            std::ptr::write_volatile(self.value.get(), *value);
        }

        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a consistent snapshot, spinning while a publish is in progress
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            core::hint::spin_loop();
        }
    }

    /// Try to read once without spinning
    ///
    /// Returns `None` if a publish was in progress or raced the read.
    pub fn try_read(&self) -> Option<T> {
        let seq1 = self.sequence.load(Ordering::Acquire);
        if seq1 & 1 == 1 {
            return None;
        }

        let value = unsafe { std::ptr::read_volatile(self.value.get()) };

        fence(Ordering::Acquire);
        let seq2 = self.sequence.load(Ordering::Relaxed);
        (seq1 == seq2).then_some(value)
    }

    /// Number of completed publishes
    pub fn generation(&self) -> u64 {
        self.sequence.load(Ordering::Acquire) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Pair {
        a: u64,
        b: u64,
    }

    fn new_cell(value: Pair) -> Box<SeqCell<Pair>> {
        let mut slot = Box::new(MaybeUninit::<SeqCell<Pair>>::uninit());
        unsafe {
            SeqCell::init(slot.as_mut_ptr(), value);
            Box::from_raw(Box::into_raw(slot).cast::<SeqCell<Pair>>())
        }
    }

    #[test]
    fn test_seqcell_basic() {
        let cell = new_cell(Pair { a: 1, b: 1 });
        assert_eq!(cell.generation(), 0);

        cell.publish(&Pair { a: 7, b: 7 });
        assert_eq!(cell.read(), Pair { a: 7, b: 7 });
        assert_eq!(cell.generation(), 1);
    }

    #[test]
    fn test_seqcell_no_torn_reads() {
        let cell: Arc<SeqCell<Pair>> = Arc::from(new_cell(Pair { a: 0, b: 0 }));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    i += 1;
                    cell.publish(&Pair { a: i, b: i });
                }
            })
        };

        for _ in 0..10_000 {
            let snapshot = cell.read();
            assert_eq!(snapshot.a, snapshot.b);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
