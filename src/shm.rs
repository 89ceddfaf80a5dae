//! Low-level POSIX shared memory operations

use crate::error::{FrameLinkError, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{fstat, ftruncate, memfd_create, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const FRAMELINK_SHM_PREFIX: &str = "/framelink_";

/// Longest name accepted for a region (the prefix counts against NAME_MAX)
pub const MAX_NAME_LEN: usize = 255 - FRAMELINK_SHM_PREFIX.len();

/// How the region came to exist; decides what `Drop` cleans up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// Named object we created; unlinked on drop
    Owned,
    /// Named object opened by name
    Opened,
    /// Mapped from a descriptor (passed handle or memfd)
    Descriptor,
}

/// Handle to a shared memory region
pub struct ShmRegion {
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    backing: Backing,
}

// SAFETY: the mapping is plain shared memory; concurrent access is
// synchronized by the atomics in the header and ring structures.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn shm_path(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(FrameLinkError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    CString::new(format!("{}{}", FRAMELINK_SHM_PREFIX, name)).map_err(|_| {
        FrameLinkError::ShmCreate {
            name: name.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        }
    })
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    if size == 0 {
        return Err(FrameLinkError::Mmap(std::io::Error::from(
            std::io::ErrorKind::InvalidInput,
        )));
    }

    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| FrameLinkError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| FrameLinkError::Mmap(std::io::Error::from(std::io::ErrorKind::Other)))
}

impl ShmRegion {
    /// Create a new named shared memory region
    ///
    /// # Arguments
    /// * `name` - Unique name for the region (will be prefixed with "/framelink_")
    /// * `size` - Size in bytes
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_path(name)?;

        // Try to create exclusively first; a leftover from a crashed owner is reused
        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => fd,
            Err(_) => shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(
                |e| FrameLinkError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                },
            )?,
        };

        ftruncate(&fd, size as u64).map_err(|e| FrameLinkError::Truncate(e.into()))?;
        let addr = map_shared(&fd, size)?;

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            backing: Backing::Owned,
        })
    }

    /// Open an existing named region
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_path(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            FrameLinkError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let mut region = Self::from_fd(fd, name)?;
        region.backing = Backing::Opened;
        Ok(region)
    }

    /// Map a region from a descriptor received from the peer
    pub fn from_fd(fd: OwnedFd, name: &str) -> Result<Self> {
        let stat = fstat(&fd).map_err(|e| FrameLinkError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        let addr = map_shared(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            backing: Backing::Descriptor,
        })
    }

    /// Create an anonymous, descriptor-only region (memfd)
    pub fn anonymous(name: &str, size: usize) -> Result<Self> {
        let fd = memfd_create(name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING).map_err(
            |e| FrameLinkError::ShmCreate {
                name: name.to_string(),
                source: e.into(),
            },
        )?;
        ftruncate(&fd, size as u64).map_err(|e| FrameLinkError::Truncate(e.into()))?;
        let addr = map_shared(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            backing: Backing::Descriptor,
        })
    }

    /// Grow or shrink the backing object and remap it (owner side)
    ///
    /// On failure the old mapping stays valid.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size == self.size {
            return Ok(());
        }
        ftruncate(&self.fd, new_size as u64).map_err(|e| FrameLinkError::Truncate(e.into()))?;
        self.replace_mapping(new_size)
    }

    /// Pick up a size change made by the owner (peer side)
    ///
    /// Returns `true` if the mapping moved.
    pub fn remap(&mut self) -> Result<bool> {
        let stat = fstat(&self.fd).map_err(|e| FrameLinkError::Mmap(e.into()))?;
        let size = stat.st_size as usize;
        if size == self.size {
            return Ok(false);
        }
        self.replace_mapping(size)?;
        Ok(true)
    }

    fn replace_mapping(&mut self, new_size: usize) -> Result<()> {
        let addr = map_shared(&self.fd, new_size)?;
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
        self.addr = addr;
        self.size = new_size;
        Ok(())
    }

    /// Check that `offset..offset + len` lies inside the mapping
    #[inline]
    pub fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(FrameLinkError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Typed pointer into the mapping, bounds and alignment checked
    pub fn ptr_at<T>(&self, offset: usize) -> Result<*mut T> {
        self.check(offset, std::mem::size_of::<T>())?;
        let ptr = unsafe { self.addr.as_ptr().add(offset) };
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(FrameLinkError::OutOfBounds {
                offset,
                len: std::mem::size_of::<T>(),
                size: self.size,
            });
        }
        Ok(ptr.cast::<T>())
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the mapping at `offset` into `buf`
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Borrow a byte range of the mapping
    ///
    /// The peer may write concurrently; callers only borrow ranges the
    /// protocol currently hands to them (a signalled, unreleased frame).
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.addr.as_ptr().add(offset), len) })
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the current mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of the region
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns (and will unlink) the region
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.backing == Backing::Owned
    }

    /// Borrow the backing descriptor
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Duplicate the backing descriptor for passing to a peer
    pub fn clone_fd(&self) -> Result<OwnedFd> {
        self.fd.try_clone().map_err(FrameLinkError::Socket)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.backing == Backing::Owned {
            if let Ok(c_name) = shm_path(&self.name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = format!("test_shm_create_{}", std::process::id());
        let size = 4096;

        let shm1 = ShmRegion::create(&name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        shm1.write_bytes(0, &[42u8]).unwrap();

        // Open from another "process"
        let shm2 = ShmRegion::open(&name).unwrap();
        assert!(!shm2.is_owner());

        let mut val = [0u8; 1];
        shm2.read_bytes(0, &mut val).unwrap();
        assert_eq!(val[0], 42u8);

        drop(shm2);
        drop(shm1);
    }

    #[test]
    fn test_resize_and_remap_through_fd() {
        let name = format!("test_shm_resize_{}", std::process::id());
        let mut owner = ShmRegion::create(&name, 4096).unwrap();
        let mut peer = ShmRegion::from_fd(owner.clone_fd().unwrap(), &name).unwrap();

        owner.resize(3 * 4096).unwrap();
        owner.write_bytes(2 * 4096, b"grown").unwrap();

        assert!(peer.remap().unwrap());
        assert_eq!(peer.size(), 3 * 4096);
        assert_eq!(peer.slice(2 * 4096, 5).unwrap(), b"grown");
        assert!(!peer.remap().unwrap());
    }

    #[test]
    fn test_bounds_checked_access() {
        let region = ShmRegion::anonymous("bounds", 128).unwrap();
        assert!(region.write_bytes(120, &[0u8; 8]).is_ok());
        assert!(matches!(
            region.write_bytes(121, &[0u8; 8]),
            Err(FrameLinkError::OutOfBounds { .. })
        ));
        assert!(region.ptr_at::<u64>(3).is_err());
        assert!(region.ptr_at::<u64>(8).is_ok());
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            ShmRegion::create(&name, 64),
            Err(FrameLinkError::NameTooLong { .. })
        ));
    }
}
