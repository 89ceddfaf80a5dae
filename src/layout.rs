//! Segment layout
//!
//! ```text
//! +-------------------------+ 0
//! | SegmentHeader           |
//! +-------------------------+ parent_ring_offset   (client -> server)
//! | RingHeader + slots      |
//! +-------------------------+ child_ring_offset    (server -> client)
//! | RingHeader + slots      |
//! +-------------------------+ audio_offset
//! | audio buffer            |
//! +-------------------------+ video_offset
//! | video buffer (h*stride) |
//! +-------------------------+ total_size (page aligned)
//! ```
//!
//! Every offset is relative to the start of the mapping. The owner computes a
//! [`RegionLayout`] off to the side and publishes it through the header's
//! [`SeqCell`]; the peer only ever reads it back.

use crate::error::{FrameLinkError, Result};
use crate::event::RawEvent;
use crate::ring::{EventRing, RingHeader};
use crate::seqlock::SeqCell;
use crate::shm::ShmRegion;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 3;

/// Bytes per pixel in the video region (RGBA8888)
pub const BYTES_PER_PIXEL: u32 = 4;

const CACHE_LINE_SIZE: usize = 64;
const PAGE_SIZE: usize = 4096;

/// Header flag bits
pub mod flags {
    /// An authentication token was written to the header
    pub const AUTH_TOKEN: u32 = 1 << 0;
    /// The client wants new geometry; owner has not answered yet
    pub const RESIZE_PENDING: u32 = 1 << 1;
    /// The owner has closed the segment
    pub const DEAD: u32 = 1 << 2;
    /// The owner will not accept passed buffer handles
    pub const NO_HANDLE_PASSING: u32 = 1 << 3;
}

/// Video and audio dimensions
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub samplerate: u32,
    pub channels: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            samplerate: 48_000,
            channels: 2,
        }
    }

    /// Reject zero or over-limit dimensions
    pub fn validate(&self, max_width: u32, max_height: u32) -> Result<()> {
        let reason = if self.width == 0 || self.height == 0 {
            "zero dimension"
        } else if self.width > max_width || self.height > max_height {
            "exceeds limit"
        } else {
            return Ok(());
        };
        Err(FrameLinkError::InvalidGeometry {
            width: self.width,
            height: self.height,
            reason,
        })
    }
}

/// Byte offsets of every region, as published in the header
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub geometry: Geometry,
    pub ring_capacity: u32,
    /// Bytes per video row
    pub stride: u32,
    pub total_size: u64,
    pub parent_ring_offset: u64,
    pub child_ring_offset: u64,
    pub audio_offset: u64,
    pub audio_size: u64,
    pub video_offset: u64,
    pub video_size: u64,
}

#[inline]
fn align_up(v: usize, align: usize) -> Option<usize> {
    v.checked_add(align - 1).map(|v| v & !(align - 1))
}

impl RegionLayout {
    /// Compute a layout for `geometry` without touching any mapping
    pub fn compute(geometry: Geometry, ring_capacity: usize, audio_size: usize) -> Result<Self> {
        let too_large = || FrameLinkError::InvalidGeometry {
            width: geometry.width,
            height: geometry.height,
            reason: "layout overflows address space",
        };

        let stride = geometry
            .width
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or_else(too_large)?;
        let video_size = (stride as usize)
            .checked_mul(geometry.height as usize)
            .ok_or_else(too_large)?;
        let ring_size = EventRing::size_for(ring_capacity);

        let parent_ring_offset = HEADER_SIZE;
        let child_ring_offset = align_up(parent_ring_offset + ring_size, CACHE_LINE_SIZE)
            .ok_or_else(too_large)?;
        let audio_offset = align_up(child_ring_offset + ring_size, CACHE_LINE_SIZE)
            .ok_or_else(too_large)?;
        let video_offset = audio_offset
            .checked_add(audio_size)
            .and_then(|v| align_up(v, CACHE_LINE_SIZE))
            .ok_or_else(too_large)?;
        let total_size = video_offset
            .checked_add(video_size)
            .and_then(|v| align_up(v, PAGE_SIZE))
            .ok_or_else(too_large)?;

        Ok(Self {
            geometry,
            ring_capacity: ring_capacity as u32,
            stride,
            total_size: total_size as u64,
            parent_ring_offset: parent_ring_offset as u64,
            child_ring_offset: child_ring_offset as u64,
            audio_offset: audio_offset as u64,
            audio_size: audio_size as u64,
            video_offset: video_offset as u64,
            video_size: video_size as u64,
        })
    }

    /// Check every region against a mapping of `mapped` bytes
    pub fn validate(&self, mapped: usize) -> Result<()> {
        let ring_size = EventRing::size_for(self.ring_capacity as usize) as u64;
        let regions = [
            (self.parent_ring_offset, ring_size),
            (self.child_ring_offset, ring_size),
            (self.audio_offset, self.audio_size),
            (self.video_offset, self.video_size),
        ];

        for (offset, len) in regions {
            let end = offset.checked_add(len);
            if offset < HEADER_SIZE as u64 || end.map_or(true, |end| end > mapped as u64) {
                return Err(FrameLinkError::OutOfBounds {
                    offset: offset as usize,
                    len: len as usize,
                    size: mapped,
                });
            }
        }
        if self.total_size > mapped as u64 {
            return Err(FrameLinkError::OutOfBounds {
                offset: 0,
                len: self.total_size as usize,
                size: mapped,
            });
        }
        Ok(())
    }
}

/// Header stored at the beginning of every segment
#[repr(C)]
pub struct SegmentHeader {
    pub cookie: u64,
    pub version_major: u16,
    pub version_minor: u16,
    pub header_size: u32,
    pub flags: AtomicU32,
    pub owner_pid: u32,
    /// Geometry requested by the client while RESIZE_PENDING is set
    pub req_width: AtomicU32,
    pub req_height: AtomicU32,
    pub req_samplerate: AtomicU32,
    pub req_channels: AtomicU32,
    /// Set by the producer after a complete video frame, cleared on release
    pub vready: AtomicU32,
    /// Set by the producer after a complete audio buffer, cleared on release
    pub aready: AtomicU32,
    /// Presentation timestamp of the last signalled video frame
    pub vpts: AtomicU64,
    /// Bytes of valid audio in the audio region
    pub audio_used: AtomicU32,
    _pad: u32,
    /// Authentication token (render-node magic), valid with AUTH_TOKEN
    pub auth_token: AtomicU64,
    pub layout: SeqCell<RegionLayout>,
}

/// Space reserved for the header
pub const HEADER_SIZE: usize = {
    let size = size_of::<SegmentHeader>();
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
};

const fn fnv1a(mut hash: u64, value: u64) -> u64 {
    let bytes = value.to_le_bytes();
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Hash of the structural layout shared by both sides
///
/// Covers the protocol version and the size and field offsets of every
/// record that lives in the mapping.
pub const fn layout_cookie() -> u64 {
    let parts: [u64; 16] = [
        VERSION_MAJOR as u64,
        VERSION_MINOR as u64,
        size_of::<SegmentHeader>() as u64,
        offset_of!(SegmentHeader, flags) as u64,
        offset_of!(SegmentHeader, req_width) as u64,
        offset_of!(SegmentHeader, vready) as u64,
        offset_of!(SegmentHeader, vpts) as u64,
        offset_of!(SegmentHeader, auth_token) as u64,
        offset_of!(SegmentHeader, layout) as u64,
        size_of::<RegionLayout>() as u64,
        offset_of!(RegionLayout, total_size) as u64,
        offset_of!(RegionLayout, video_offset) as u64,
        size_of::<RawEvent>() as u64,
        offset_of!(RawEvent, ints) as u64,
        size_of::<RingHeader>() as u64,
        BYTES_PER_PIXEL as u64,
    ];

    let mut hash = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < parts.len() {
        hash = fnv1a(hash, parts[i]);
        i += 1;
    }
    hash
}

/// The cookie compiled into this build
pub const LAYOUT_COOKIE: u64 = layout_cookie();

impl SegmentHeader {
    /// Write a fresh header into zeroed memory
    ///
    /// # Safety
    /// `ptr` must point to at least `HEADER_SIZE` writable, aligned bytes
    /// that no peer is reading yet.
    pub unsafe fn init(ptr: *mut Self, layout: RegionLayout) {
        (*ptr).cookie = LAYOUT_COOKIE;
        (*ptr).version_major = VERSION_MAJOR;
        (*ptr).version_minor = VERSION_MINOR;
        (*ptr).header_size = HEADER_SIZE as u32;
        (*ptr).flags = AtomicU32::new(0);
        (*ptr).owner_pid = std::process::id();
        (*ptr).req_width = AtomicU32::new(0);
        (*ptr).req_height = AtomicU32::new(0);
        (*ptr).req_samplerate = AtomicU32::new(0);
        (*ptr).req_channels = AtomicU32::new(0);
        (*ptr).vready = AtomicU32::new(0);
        (*ptr).aready = AtomicU32::new(0);
        (*ptr).vpts = AtomicU64::new(0);
        (*ptr).audio_used = AtomicU32::new(0);
        (*ptr)._pad = 0;
        (*ptr).auth_token = AtomicU64::new(0);
        SeqCell::init(std::ptr::addr_of_mut!((*ptr).layout), layout);
    }

    /// Borrow the header at the start of a mapping
    pub fn from_region(region: &ShmRegion) -> Result<&SegmentHeader> {
        region.check(0, HEADER_SIZE)?;
        let ptr = region.ptr_at::<SegmentHeader>(0)?;
        Ok(unsafe { &*ptr })
    }

    /// Verify the peer was built with the same layout
    pub fn check_cookie(&self) -> Result<()> {
        let got = unsafe { std::ptr::read_volatile(&self.cookie) };
        if got != LAYOUT_COOKIE {
            return Err(FrameLinkError::ProtocolMismatch {
                expected: LAYOUT_COOKIE,
                got,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Requested geometry written by the client
    pub fn requested_geometry(&self) -> Geometry {
        Geometry {
            width: self.req_width.load(Ordering::Acquire),
            height: self.req_height.load(Ordering::Acquire),
            samplerate: self.req_samplerate.load(Ordering::Acquire),
            channels: self.req_channels.load(Ordering::Acquire),
        }
    }

    /// Publish an authentication token; readers see it once `AUTH_TOKEN` is set
    pub fn publish_auth_token(&self, token: u64) {
        self.auth_token.store(token, Ordering::Release);
        self.set_flag(flags::AUTH_TOKEN);
    }

    /// The published token, if any
    pub fn auth_token(&self) -> Option<u64> {
        self.has_flag(flags::AUTH_TOKEN)
            .then(|| self.auth_token.load(Ordering::Acquire))
    }

    /// Take the published token and clear the flag
    pub fn take_auth_token(&self) -> Option<u64> {
        let previous = self.flags.fetch_and(!flags::AUTH_TOKEN, Ordering::AcqRel);
        (previous & flags::AUTH_TOKEN != 0).then(|| self.auth_token.swap(0, Ordering::AcqRel))
    }

    pub fn write_request(&self, geometry: Geometry) {
        self.req_width.store(geometry.width, Ordering::Release);
        self.req_height.store(geometry.height, Ordering::Release);
        self.req_samplerate.store(geometry.samplerate, Ordering::Release);
        self.req_channels.store(geometry.channels, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_is_stable_and_nonzero() {
        assert_eq!(layout_cookie(), LAYOUT_COOKIE);
        assert_ne!(LAYOUT_COOKIE, 0);
    }

    #[test]
    fn test_cookie_tracks_version() {
        let bumped = fnv1a(0xcbf2_9ce4_8422_2325, VERSION_MAJOR as u64 + 1);
        let current = fnv1a(0xcbf2_9ce4_8422_2325, VERSION_MAJOR as u64);
        assert_ne!(bumped, current);
    }

    #[test]
    fn test_auth_token_is_taken_once() {
        let layout = RegionLayout::compute(Geometry::new(8, 8), 8, 1024).unwrap();
        let region = ShmRegion::anonymous("auth", layout.total_size as usize).unwrap();
        unsafe {
            SegmentHeader::init(region.ptr_at::<SegmentHeader>(0).unwrap(), layout);
        }
        let header = SegmentHeader::from_region(&region).unwrap();
        assert_eq!(header.owner_pid, std::process::id());
        assert_eq!(header.auth_token(), None);

        header.publish_auth_token(0xfeed);
        assert!(header.has_flag(flags::AUTH_TOKEN));
        assert_eq!(header.auth_token(), Some(0xfeed));
        assert_eq!(header.take_auth_token(), Some(0xfeed));
        assert!(!header.has_flag(flags::AUTH_TOKEN));
        assert_eq!(header.take_auth_token(), None);
    }

    #[test]
    fn test_layout_regions_fit() {
        let layout = RegionLayout::compute(Geometry::new(640, 480), 64, 16 * 1024).unwrap();
        assert_eq!(layout.stride, 640 * 4);
        assert_eq!(layout.video_size, 640 * 480 * 4);
        assert_eq!(layout.total_size % PAGE_SIZE as u64, 0);
        assert!(layout.parent_ring_offset >= HEADER_SIZE as u64);
        assert!(layout.child_ring_offset > layout.parent_ring_offset);
        assert!(layout.audio_offset > layout.child_ring_offset);
        assert!(layout.video_offset >= layout.audio_offset + layout.audio_size);
        layout.validate(layout.total_size as usize).unwrap();
        assert!(layout.validate(layout.total_size as usize - 1).is_err());
    }

    #[test]
    fn test_resized_layout_keeps_rings_in_place() {
        let small = RegionLayout::compute(Geometry::new(64, 64), 32, 4096).unwrap();
        let large = RegionLayout::compute(Geometry::new(1024, 768), 32, 4096).unwrap();
        assert_eq!(small.parent_ring_offset, large.parent_ring_offset);
        assert_eq!(small.child_ring_offset, large.child_ring_offset);
        assert!(large.total_size > small.total_size);
        assert!(large.validate(small.total_size as usize).is_err());
    }

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::new(0, 10).validate(100, 100).is_err());
        assert!(Geometry::new(10, 0).validate(100, 100).is_err());
        assert!(Geometry::new(101, 10).validate(100, 100).is_err());
        assert!(Geometry::new(100, 100).validate(100, 100).is_ok());
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let result = RegionLayout::compute(Geometry::new(u32::MAX, u32::MAX), 8, 0);
        assert!(matches!(result, Err(FrameLinkError::InvalidGeometry { .. })));
    }
}
