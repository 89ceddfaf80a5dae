//! Event queue: two rings, the shared doorbell and the descriptor channel
//!
//! Each side owns one outbound ring (it is the only producer) and one
//! inbound ring (it is the only consumer). The ring offsets never move
//! across a resize, so the queue keeps plain offsets and resolves ring views
//! against whatever mapping the caller currently holds.

use crate::config::TransportConfig;
use crate::descriptor::DescriptorChannel;
use crate::error::{FrameLinkError, Result};
use crate::event::{Event, RawEvent, FLAG_DESCRIPTOR};
use crate::layout::{flags, SegmentHeader};
use crate::ring::EventRing;
use crate::sem::NamedSemaphore;
use crate::shm::ShmRegion;
use parking_lot::Mutex;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// An event taken off the inbound ring, with its handle if it carried one
///
/// Dropping a `Delivered` closes the handle.
#[derive(Debug)]
pub struct Delivered {
    pub event: Event,
    pub handle: Option<OwnedFd>,
}

impl Delivered {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            handle: None,
        }
    }

    /// Take ownership of the attached handle
    pub fn take_handle(&mut self) -> Option<OwnedFd> {
        self.handle.take()
    }
}

/// One side's view of the segment event queue
pub struct EventQueue {
    outbound: usize,
    inbound: usize,
    doorbell: NamedSemaphore,
    channel: DescriptorChannel,
    /// Serializes descriptor send + ring publish across producer threads
    send_lock: Option<Mutex<()>>,
    slice: Duration,
}

impl EventQueue {
    pub fn new(
        outbound: usize,
        inbound: usize,
        doorbell: NamedSemaphore,
        channel: DescriptorChannel,
        config: &TransportConfig,
    ) -> Self {
        Self {
            outbound,
            inbound,
            doorbell,
            channel,
            send_lock: config.thread_safe_queue.then(|| Mutex::new(())),
            slice: config.doorbell_slice,
        }
    }

    pub fn channel(&self) -> &DescriptorChannel {
        &self.channel
    }

    fn check_open(region: &ShmRegion) -> Result<&SegmentHeader> {
        let header = SegmentHeader::from_region(region)?;
        if header.has_flag(flags::DEAD) {
            return Err(FrameLinkError::SegmentClosed);
        }
        Ok(header)
    }

    /// Publish an event if there is room
    ///
    /// Returns the free slots left. A full ring returns `Saturated` and
    /// sends nothing, not even the descriptor.
    pub fn try_enqueue(
        &self,
        region: &ShmRegion,
        event: &Event,
        handle: Option<BorrowedFd<'_>>,
    ) -> Result<usize> {
        Self::check_open(region)?;
        if event.carries_descriptor() && handle.is_none() {
            return Err(FrameLinkError::TransferFailed(format!(
                "{} needs a handle",
                event
            )));
        }

        let _guard = self.send_lock.as_ref().map(|lock| lock.lock());
        let ring = EventRing::attach(region, self.outbound)?;
        if ring.len() >= ring.capacity() {
            return Err(FrameLinkError::Saturated {
                capacity: ring.capacity(),
            });
        }

        let raw = event.encode();
        if let (true, Some(fd)) = (event.carries_descriptor(), handle) {
            self.channel.send_fd(fd)?;
        }

        let pushed = match ring.try_push(&raw) {
            Ok(pushed) => pushed,
            Err(FrameLinkError::Saturated { .. }) if raw.flags & FLAG_DESCRIPTOR != 0 => {
                // Only another unsynchronized producer can get here
                return Err(FrameLinkError::TransferFailed(
                    "ring filled after descriptor was sent; enable thread_safe_queue".into(),
                ));
            }
            Err(e) => return Err(e),
        };

        trace!(event = %event, free = pushed.free, "enqueued");
        if pushed.was_empty {
            self.doorbell.post()?;
        }
        Ok(pushed.free)
    }

    /// Publish an event, waiting for room as long as the peer is alive
    pub fn enqueue(
        &self,
        region: &ShmRegion,
        event: &Event,
        handle: Option<BorrowedFd<'_>>,
    ) -> Result<()> {
        let pause = self.slice.min(Duration::from_millis(1));
        loop {
            match self.try_enqueue(region, event, handle) {
                Ok(_) => return Ok(()),
                Err(FrameLinkError::Saturated { .. }) => {
                    self.channel.check_peer()?;
                    std::thread::sleep(pause);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the next inbound event without blocking
    ///
    /// `Ok(None)` means the ring is empty and the peer is alive. Every
    /// error is terminal for the segment.
    pub fn poll(&self, region: &ShmRegion) -> Result<Option<Delivered>> {
        Self::check_open(region)?;
        let ring = EventRing::attach(region, self.inbound)?;

        loop {
            let Some(raw) = ring.try_pop() else {
                self.channel.check_peer()?;
                return Ok(None);
            };

            match self.deliver(&raw)? {
                Some(delivered) => {
                    trace!(event = %delivered.event, "dequeued");
                    return Ok(Some(delivered));
                }
                None => continue,
            }
        }
    }

    fn deliver(&self, raw: &RawEvent) -> Result<Option<Delivered>> {
        let handle = if raw.flags & FLAG_DESCRIPTOR != 0 {
            Some(self.channel.recv_fd()?)
        } else {
            None
        };

        match Event::decode(raw) {
            Some(event) => Ok(Some(Delivered { event, handle })),
            None => {
                // The handle (if any) was still taken to keep the streams paired
                warn!(
                    category = raw.category,
                    kind = raw.kind,
                    "dropping undecodable event"
                );
                Ok(None)
            }
        }
    }

    /// Wait for the next inbound event
    ///
    /// `None` waits indefinitely. `Ok(None)` is returned only on timeout.
    pub fn wait(&self, region: &ShmRegion, timeout: Option<Duration>) -> Result<Option<Delivered>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(delivered) = self.poll(region)? {
                return Ok(Some(delivered));
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.slice.min(deadline - now)
                }
                None => self.slice,
            };

            if self.doorbell.wait(Some(slice))? && self.token_misrouted(region)? {
                // Both directions share the doorbell: the post was for the peer
                self.doorbell.post()?;
                std::thread::sleep(slice);
            }
        }
    }

    fn token_misrouted(&self, region: &ShmRegion) -> Result<bool> {
        let inbound = EventRing::attach(region, self.inbound)?;
        let outbound = EventRing::attach(region, self.outbound)?;
        Ok(inbound.is_empty() && !outbound.is_empty())
    }

    /// Pop every decodable inbound event (resize quiescence)
    pub fn drain_inbound(&self, region: &ShmRegion) -> Result<Vec<Delivered>> {
        let ring = EventRing::attach(region, self.inbound)?;
        let mut out = Vec::new();
        while let Some(raw) = ring.try_pop() {
            if let Some(delivered) = self.deliver(&raw)? {
                out.push(delivered);
            }
        }
        Ok(out)
    }

    /// Reset the inbound ring; it must be empty and the peer quiescent
    pub fn reset_inbound(&self, region: &ShmRegion) -> Result<()> {
        EventRing::attach(region, self.inbound)?.reset();
        Ok(())
    }

    /// Move unconsumed outbound entries to the front of a zeroed ring
    ///
    /// Only valid while the consumer is quiescent. Descriptors already sent
    /// stay queued on the socket in the same order as the entries.
    pub fn compact_outbound(&self, region: &ShmRegion) -> Result<usize> {
        let ring = EventRing::attach(region, self.outbound)?;
        let live = ring.drain();
        ring.reset();
        for raw in &live {
            ring.try_push(raw)?;
        }
        debug!(live = live.len(), "compacted outbound ring");
        if !live.is_empty() {
            self.doorbell.post()?;
        }
        Ok(live.len())
    }

    /// Entries waiting in the outbound ring
    pub fn outbound_len(&self, region: &ShmRegion) -> Result<usize> {
        Ok(EventRing::attach(region, self.outbound)?.len())
    }

    /// Entries waiting in the inbound ring
    pub fn inbound_len(&self, region: &ShmRegion) -> Result<usize> {
        Ok(EventRing::attach(region, self.inbound)?.len())
    }
}
