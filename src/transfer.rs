//! Buffer transfer path
//!
//! A video frame reaches the consumer either as a passed buffer handle
//! (zero-copy) or through readback into the segment's video region. The
//! choice is made in exactly one place, [`choose_path`], and a failed
//! handle transfer degrades the segment to readback for good.

use crate::client::ClientSegment;
use crate::error::{FrameLinkError, Result};
use crate::event::HandleMeta;
use crate::layout::{Geometry, BYTES_PER_PIXEL};
use rustix::fd::OwnedFd;
use crate::shm::ShmRegion;
use rustix::fs::{fcntl_add_seals, SealFlags};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// DRM fourcc for 32-bit XRGB
pub const FOURCC_XRGB8888: u32 = u32::from_le_bytes(*b"XR24");

/// Which path carried a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    Handle,
    Readback,
}

/// What a producer hands to `submit_*_frame`
#[derive(Debug)]
pub enum BufferDescriptor {
    /// Payload already written into the segment region, `offset` relative to
    /// the start of that region
    Region { offset: usize, len: usize },
    /// A transferable buffer handle
    Handle { fd: OwnedFd, meta: HandleMeta },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    frame: u64,
    deadline: Instant,
}

/// Per-segment handle passing state on the producer side
#[derive(Debug)]
pub struct PassingState {
    broken: bool,
    in_flight: Option<InFlight>,
    ack_timeout: Duration,
}

impl PassingState {
    pub fn new(disabled: bool, ack_timeout: Duration) -> Self {
        Self {
            broken: disabled,
            in_flight: None,
            ack_timeout,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Degrade to readback for the rest of the segment's life
    pub fn mark_broken(&mut self, reason: &str) {
        if !self.broken {
            warn!(reason, "buffer handle passing disabled, using readback");
        }
        self.broken = true;
        self.in_flight = None;
    }

    /// Record a handle frame awaiting acknowledgement
    pub fn begin(&mut self, frame: u64, now: Instant) {
        self.in_flight = Some(InFlight {
            frame,
            deadline: now + self.ack_timeout,
        });
    }

    /// Consumer acknowledged `frame`; returns `false` for a stale ack
    pub fn on_ack(&mut self, frame: u64) -> bool {
        match self.in_flight {
            Some(f) if f.frame == frame => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Consumer could not use the handle
    pub fn on_fail(&mut self) {
        self.mark_broken("consumer reported buffer failure");
    }

    /// Mark passing broken if the in-flight frame missed its deadline
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        match self.in_flight {
            Some(f) if now >= f.deadline => {
                self.mark_broken("handle acknowledgement timed out");
                true
            }
            _ => false,
        }
    }

    /// Frame number awaiting acknowledgement
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.map(|f| f.frame)
    }
}

/// The transfer decision
///
/// Handle passing only while it has never failed on this segment and the
/// producer can actually export a handle.
pub fn choose_path(state: &PassingState, export_available: bool) -> TransferPath {
    if !state.is_broken() && export_available {
        TransferPath::Handle
    } else {
        TransferPath::Readback
    }
}

/// A render target backed by its own memfd
///
/// Exporting hands out a duplicate of the descriptor, so the consumer maps
/// the very pages the producer rendered. The size is sealed at creation.
pub struct BackingStore {
    width: u32,
    height: u32,
    stride: usize,
    region: ShmRegion,
}

impl BackingStore {
    pub fn new(geometry: Geometry) -> Result<Self> {
        let stride = geometry.width as usize * BYTES_PER_PIXEL as usize;
        let size = stride * geometry.height as usize;
        let region = ShmRegion::anonymous("framelink_store", size)?;
        fcntl_add_seals(region.fd(), SealFlags::SHRINK | SealFlags::GROW)
            .map_err(|e| FrameLinkError::TransferFailed(format!("sealing backing store: {}", e)))?;
        Ok(Self {
            width: geometry.width,
            height: geometry.height,
            stride,
            region,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.as_ptr(), self.region.size()) }
    }

    /// Mutable pixels; only the store not currently in flight is handed out
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr(), self.region.size()) }
    }

    /// Fill with one 32-bit pixel value
    pub fn fill(&mut self, pixel: u32) {
        for chunk in self.pixels_mut().chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel.to_le_bytes());
        }
    }

    pub fn meta(&self) -> HandleMeta {
        HandleMeta {
            width: self.width,
            height: self.height,
            stride: self.stride as u32,
            fourcc: FOURCC_XRGB8888,
            planes: 1,
        }
    }
}

/// Turns a backing store into a transferable handle
pub trait HandleExporter {
    /// Whether this exporter can produce handles at all
    fn available(&self) -> bool {
        true
    }

    fn export(&mut self, store: &BackingStore) -> Result<(OwnedFd, HandleMeta)>;
}

/// Exports a store by duplicating its memfd
///
/// Nothing is copied: the consumer maps the store itself, which is why the
/// output never renders into a store that is still in flight.
#[derive(Debug, Default)]
pub struct MemfdExporter {
    exported: u64,
}

impl MemfdExporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandleExporter for MemfdExporter {
    fn export(&mut self, store: &BackingStore) -> Result<(OwnedFd, HandleMeta)> {
        let fd = store
            .region
            .clone_fd()
            .map_err(|e| FrameLinkError::TransferFailed(format!("memfd export: {}", e)))?;
        self.exported += 1;
        Ok((fd, store.meta()))
    }
}

impl MemfdExporter {
    /// Number of handles handed out so far
    pub fn exported(&self) -> u64 {
        self.exported
    }
}

/// Result of one `signal`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Geometry changed; both stores were reallocated and the frame dropped
    Reallocated,
    /// The frame was delivered along `TransferPath`
    Presented(TransferPath),
}

/// Double-buffered accelerated output for one segment
///
/// The producer renders into [`back_buffer`](Self::back_buffer) and calls
/// [`signal`](Self::signal); the active store flips after every delivered
/// frame.
pub struct AcceleratedOutput<E: HandleExporter> {
    stores: [BackingStore; 2],
    active: usize,
    generation: u64,
    exporter: E,
}

impl<E: HandleExporter> AcceleratedOutput<E> {
    pub fn new(client: &ClientSegment, exporter: E) -> Result<Self> {
        let geometry = client.geometry();
        Ok(Self {
            stores: [BackingStore::new(geometry)?, BackingStore::new(geometry)?],
            active: 0,
            generation: client.geometry_generation(),
            exporter,
        })
    }

    /// The store to render the next frame into
    pub fn back_buffer(&mut self) -> &mut BackingStore {
        &mut self.stores[self.active]
    }

    /// Index of the active store (0 or 1)
    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn exporter(&self) -> &E {
        &self.exporter
    }

    /// Deliver the active store to the consumer
    pub fn signal(&mut self, client: &mut ClientSegment) -> Result<SignalOutcome> {
        let generation = client.geometry_generation();
        if generation != self.generation {
            let geometry = client.geometry();
            debug!(
                width = geometry.width,
                height = geometry.height,
                "reallocating backing stores"
            );
            self.stores = [BackingStore::new(geometry)?, BackingStore::new(geometry)?];
            self.active = 0;
            self.generation = generation;
            return Ok(SignalOutcome::Reallocated);
        }

        client.ensure_video_free()?;

        let store = &self.stores[self.active];
        if choose_path(client.passing(), self.exporter.available()) == TransferPath::Handle {
            match self.exporter.export(store) {
                Ok((fd, meta)) => match client.submit_video_frame(BufferDescriptor::Handle { fd, meta }) {
                    Ok(path) => {
                        self.active ^= 1;
                        return Ok(SignalOutcome::Presented(path));
                    }
                    // The client already marked passing broken
                    Err(FrameLinkError::TransferFailed(_)) => {}
                    Err(e) => return Err(e),
                },
                Err(e) => client.mark_passing_broken(&e.to_string()),
            }
        }

        let len = client.write_video(store.pixels(), store.stride())?;
        let path = client.submit_video_frame(BufferDescriptor::Region { offset: 0, len })?;
        self.active ^= 1;
        Ok(SignalOutcome::Presented(path))
    }
}
