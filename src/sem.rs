//! Named POSIX semaphores
//!
//! Each segment carries three: video-ready, audio-ready and the event
//! doorbell. They are created closed (value 0) by the owner and opened by
//! name from the peer.

use crate::error::{FrameLinkError, Result};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;

const SEM_PREFIX: &str = "/framelink_";

/// Which of the three segment semaphores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemKind {
    Video,
    Audio,
    Doorbell,
}

impl SemKind {
    fn suffix(self) -> &'static str {
        match self {
            SemKind::Video => "v",
            SemKind::Audio => "a",
            SemKind::Doorbell => "e",
        }
    }

    /// Semaphore name derived from the segment name
    pub fn name_for(self, segment: &str) -> String {
        format!("{}{}_{}", SEM_PREFIX, segment, self.suffix())
    }
}

/// A process-shared named semaphore
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
    is_owner: bool,
}

// SAFETY: sem_t operations are thread-safe by POSIX
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore with value 0, replacing a stale one of the same name
    pub fn create(name: &str) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        let mut sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };

        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Self::error(name, err));
            }
            // left behind by an owner that never unlinked
            unsafe {
                libc::sem_unlink(c_name.as_ptr());
                sem = libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                );
            }
            if sem == libc::SEM_FAILED {
                return Err(Self::error(name, io::Error::last_os_error()));
            }
        }

        Ok(Self {
            sem: NonNull::new(sem).ok_or_else(|| Self::error(name, io::ErrorKind::Other.into()))?,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open a semaphore created by the owner
    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Self::error(name, io::Error::last_os_error()));
        }

        Ok(Self {
            sem: NonNull::new(sem).ok_or_else(|| Self::error(name, io::ErrorKind::Other.into()))?,
            name: name.to_string(),
            is_owner: false,
        })
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| Self::error(name, io::ErrorKind::InvalidInput.into()))
    }

    fn error(name: &str, source: io::Error) -> FrameLinkError {
        // EINVAL on an opened semaphore means the object is gone
        if source.raw_os_error() == Some(libc::EINVAL) {
            return FrameLinkError::PeerLost(format!("semaphore {} invalid", name));
        }
        FrameLinkError::Semaphore {
            name: name.to_string(),
            source,
        }
    }

    /// Open the semaphore (value + 1)
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(Self::error(&self.name, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Take the semaphore if it is open; never blocks
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Self::error(&self.name, err)),
            }
        }
    }

    /// Wait until the semaphore can be taken or `timeout` expires
    ///
    /// `None` waits indefinitely. Returns `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match timeout {
            None => loop {
                if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(Self::error(&self.name, err));
                }
            },
            Some(timeout) => self.timed_wait(timeout),
        }
    }

    #[cfg(target_os = "linux")]
    fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let total_nsec = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (total_nsec / 1_000_000_000) as libc::time_t,
            tv_nsec: (total_nsec % 1_000_000_000) as _,
        };

        loop {
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Self::error(&self.name, err)),
            }
        }
    }

    // No sem_timedwait outside Linux; poll with short sleeps instead
    #[cfg(not(target_os = "linux"))]
    fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Take every pending post; returns how many were taken
    pub fn drain(&self) -> Result<usize> {
        let mut taken = 0;
        while self.try_wait()? {
            taken += 1;
        }
        Ok(taken)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if self.is_owner {
            if let Ok(c_name) = Self::c_name(&self.name) {
                unsafe {
                    libc::sem_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

/// The three semaphores of one segment
pub struct SegmentSemaphores {
    pub video: NamedSemaphore,
    pub audio: NamedSemaphore,
    pub doorbell: NamedSemaphore,
}

impl SegmentSemaphores {
    /// Owner side: create all three closed
    pub fn create(segment: &str) -> Result<Self> {
        Ok(Self {
            video: NamedSemaphore::create(&SemKind::Video.name_for(segment))?,
            audio: NamedSemaphore::create(&SemKind::Audio.name_for(segment))?,
            doorbell: NamedSemaphore::create(&SemKind::Doorbell.name_for(segment))?,
        })
    }

    /// Peer side: open the owner's semaphores
    pub fn open(segment: &str) -> Result<Self> {
        Ok(Self {
            video: NamedSemaphore::open(&SemKind::Video.name_for(segment))?,
            audio: NamedSemaphore::open(&SemKind::Audio.name_for(segment))?,
            doorbell: NamedSemaphore::open(&SemKind::Doorbell.name_for(segment))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_closed() {
        let name = format!("/framelink_test_sem_closed_{}", std::process::id());
        let sem = NamedSemaphore::create(&name).unwrap();
        assert!(!sem.try_wait().unwrap());
        assert!(!sem.wait(Some(Duration::from_millis(5))).unwrap());
    }

    #[test]
    fn test_post_visible_through_second_handle() {
        let name = format!("/framelink_test_sem_pair_{}", std::process::id());
        let owner = NamedSemaphore::create(&name).unwrap();
        let peer = NamedSemaphore::open(&name).unwrap();

        owner.post().unwrap();
        owner.post().unwrap();
        assert!(peer.wait(Some(Duration::from_millis(100))).unwrap());
        assert_eq!(peer.drain().unwrap(), 1);
        assert!(!peer.try_wait().unwrap());
    }

    #[test]
    fn test_segment_set_names() {
        assert_eq!(SemKind::Video.name_for("seg1"), "/framelink_seg1_v");
        assert_eq!(SemKind::Doorbell.name_for("seg1"), "/framelink_seg1_e");

        let segment = format!("test_semset_{}", std::process::id());
        let owner = SegmentSemaphores::create(&segment).unwrap();
        let peer = SegmentSemaphores::open(&segment).unwrap();
        owner.audio.post().unwrap();
        assert!(peer.audio.try_wait().unwrap());
        assert!(!peer.video.try_wait().unwrap());
    }
}
