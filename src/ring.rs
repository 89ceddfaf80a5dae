//! Event ring living in the segment mapping
//!
//! One ring per direction. Producers on one side may be several threads
//! (claims are a CAS on `back`); there is exactly one consumer.
//!
//! # Design
//! - Fixed-size slots with a state word
//! - Producers: check space -> claim -> write -> publish
//! - Consumer: read -> release slot -> advance `front`
//!
//! Cursors are monotonic; the slot index is `cursor & (capacity - 1)`.

use crate::error::{FrameLinkError, Result};
use crate::event::RawEvent;
use crate::shm::ShmRegion;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Slot states
mod slot_state {
    pub const EMPTY: u32 = 0;
    pub const WRITING: u32 = 1;
    pub const READY: u32 = 2;
}

/// Padding to cache line
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// A single event slot
#[repr(C)]
pub struct EventSlot {
    state: AtomicU32,
    _pad: u32,
    event: UnsafeCell<RawEvent>,
}

/// Ring header in shared memory
#[repr(C)]
pub struct RingHeader {
    /// Producer cursor (next slot to claim)
    back: CachePadded<AtomicU64>,
    /// Consumer cursor (next slot to read)
    front: CachePadded<AtomicU64>,
    /// Number of slots (power of two)
    capacity: u64,
    _pad: [u8; CACHE_LINE_SIZE - 8],
}

/// Outcome of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pushed {
    /// Free slots left after this push
    pub free: usize,
    /// The ring was empty before this push (doorbell edge)
    pub was_empty: bool,
}

/// View of one ring inside a mapping
///
/// Built on demand from the region and the published offset, so a remap
/// never leaves a stale pointer behind.
pub struct EventRing<'a> {
    header: &'a RingHeader,
    slots: *mut EventSlot,
    capacity: u64,
}

impl<'a> EventRing<'a> {
    /// Size of a ring (header + slots) in bytes
    pub const fn size_for(capacity: usize) -> usize {
        std::mem::size_of::<RingHeader>() + capacity * std::mem::size_of::<EventSlot>()
    }

    /// Initialize a ring at `offset` (owner side, before the peer attaches)
    pub fn init(region: &'a ShmRegion, offset: usize, capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(FrameLinkError::OutOfBounds {
                offset,
                len: capacity,
                size: region.size(),
            });
        }
        region.check(offset, Self::size_for(capacity))?;

        let header = region.ptr_at::<RingHeader>(offset)?;
        unsafe {
            (*header).back = CachePadded(AtomicU64::new(0));
            (*header).front = CachePadded(AtomicU64::new(0));
            (*header).capacity = capacity as u64;
        }

        let ring = Self::attach(region, offset)?;
        ring.reset();
        Ok(ring)
    }

    /// View an initialized ring at `offset`
    pub fn attach(region: &'a ShmRegion, offset: usize) -> Result<Self> {
        let header = unsafe { &*region.ptr_at::<RingHeader>(offset)? };
        let capacity = header.capacity;
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(FrameLinkError::OutOfBounds {
                offset,
                len: capacity as usize,
                size: region.size(),
            });
        }
        region.check(offset, Self::size_for(capacity as usize))?;

        let slots = region.ptr_at::<EventSlot>(offset + std::mem::size_of::<RingHeader>())?;
        Ok(Self {
            header,
            slots,
            capacity,
        })
    }

    #[inline]
    fn slot(&self, cursor: u64) -> &EventSlot {
        unsafe { &*self.slots.add((cursor & (self.capacity - 1)) as usize) }
    }

    /// Try to push an event (non-blocking)
    ///
    /// A full ring returns `Saturated` and leaves every entry untouched.
    pub fn try_push(&self, event: &RawEvent) -> Result<Pushed> {
        let mut back = self.header.back.0.load(Ordering::Acquire);
        loop {
            let front = self.header.front.0.load(Ordering::Acquire);
            if back.wrapping_sub(front) >= self.capacity {
                return Err(FrameLinkError::Saturated {
                    capacity: self.capacity as usize,
                });
            }

            match self.header.back.0.compare_exchange_weak(
                back,
                back + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let slot = self.slot(back);
                    // The consumer releases a slot before moving `front`, so a
                    // claimed slot is always EMPTY here.
                    slot.state.store(slot_state::WRITING, Ordering::Relaxed);
                    unsafe {
                        std::ptr::write_volatile(slot.event.get(), *event);
                    }
                    slot.state.store(slot_state::READY, Ordering::Release);

                    let used = (back + 1).wrapping_sub(front);
                    return Ok(Pushed {
                        free: (self.capacity - used.min(self.capacity)) as usize,
                        was_empty: back == front,
                    });
                }
                Err(current) => back = current,
            }
        }
    }

    /// Try to pop the oldest event (single consumer)
    ///
    /// Returns `None` when empty, or when the oldest claimed slot is still
    /// being written; FIFO order is never skipped over.
    pub fn try_pop(&self) -> Option<RawEvent> {
        let front = self.header.front.0.load(Ordering::Relaxed);
        let back = self.header.back.0.load(Ordering::Acquire);
        if front == back {
            return None;
        }

        let slot = self.slot(front);
        if slot.state.load(Ordering::Acquire) != slot_state::READY {
            return None;
        }

        let event = unsafe { std::ptr::read_volatile(slot.event.get()) };

        // Release slot, then advance
        slot.state.store(slot_state::EMPTY, Ordering::Release);
        self.header.front.0.store(front + 1, Ordering::Release);

        Some(event)
    }

    /// Pop everything currently published
    pub fn drain(&self) -> Vec<RawEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.try_pop() {
            out.push(ev);
        }
        out
    }

    /// Reset both cursors to zero and mark every slot empty
    ///
    /// Only valid while neither side touches the ring (resize quiescence).
    pub fn reset(&self) {
        for i in 0..self.capacity {
            self.slot(i).state.store(slot_state::EMPTY, Ordering::Relaxed);
        }
        self.header.front.0.store(0, Ordering::Release);
        self.header.back.0.store(0, Ordering::Release);
    }

    /// Number of claimed slots
    pub fn len(&self) -> usize {
        let front = self.header.front.0.load(Ordering::Acquire);
        let back = self.header.back.0.load(Ordering::Acquire);
        back.wrapping_sub(front).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Current (front, back) cursors
    pub fn cursors(&self) -> (u64, u64) {
        (
            self.header.front.0.load(Ordering::Acquire),
            self.header.back.0.load(Ordering::Acquire),
        )
    }
}
