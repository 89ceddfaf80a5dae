//! Out-of-band descriptor channel
//!
//! File handles cannot live in shared memory. They travel over the
//! connection socket as `SCM_RIGHTS` messages, each with a small payload
//! that keeps the two streams paired: a sequence tag for event handles, or
//! a fixed hello record during the connection handshake.

use crate::error::{FrameLinkError, Result};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{
    recv, recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};

/// One end of the descriptor channel
pub struct DescriptorChannel {
    stream: UnixStream,
    sent: AtomicU64,
    received: AtomicU64,
}

impl DescriptorChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    /// Connected pair, for in-process use and tests
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(FrameLinkError::Socket)?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Send `payload` with an optional descriptor attached
    ///
    /// The caller keeps its own descriptor; the peer gets a duplicate.
    pub fn send_message(&self, payload: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<()> {
        let fds = fd.map(|fd| [fd]);
        let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
        let mut control = SendAncillaryBuffer::new(&mut space);
        if let Some(fds) = &fds {
            if !control.push(SendAncillaryMessage::ScmRights(fds)) {
                return Err(FrameLinkError::TransferFailed(
                    "ancillary buffer too small".into(),
                ));
            }
        }

        let mut written = loop {
            match sendmsg(
                &self.stream,
                &[IoSlice::new(payload)],
                &mut control,
                SendFlags::NOSIGNAL,
            ) {
                Ok(n) => break n,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(map_send_error(e)),
            }
        };

        // The descriptor rode on the first chunk; finish the payload plainly
        while written < payload.len() {
            match rustix::net::send(&self.stream, &payload[written..], SendFlags::NOSIGNAL) {
                Ok(n) => written += n,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(map_send_error(e)),
            }
        }
        Ok(())
    }

    /// Receive exactly `buf.len()` bytes and the descriptor sent with them
    pub fn recv_message(&self, buf: &mut [u8]) -> Result<Option<OwnedFd>> {
        let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
        let mut control = RecvAncillaryBuffer::new(&mut space);

        let received = loop {
            match recvmsg(
                &self.stream,
                &mut [IoSliceMut::new(buf)],
                &mut control,
                RecvFlags::CMSG_CLOEXEC,
            ) {
                Ok(msg) => break msg.bytes,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(FrameLinkError::Socket(e.into())),
            }
        };
        if received == 0 && !buf.is_empty() {
            return Err(FrameLinkError::PeerLost("descriptor channel closed".into()));
        }

        let mut handle = None;
        for message in control.drain() {
            if let RecvAncillaryMessage::ScmRights(fds) = message {
                for fd in fds {
                    // Extra descriptors are dropped (closed) here
                    if handle.is_none() {
                        handle = Some(fd);
                    }
                }
            }
        }

        let mut filled = received;
        while filled < buf.len() {
            match recv(&self.stream, &mut buf[filled..], RecvFlags::empty()) {
                Ok(0) => return Err(FrameLinkError::PeerLost("descriptor channel closed".into())),
                Ok(n) => filled += n,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(FrameLinkError::Socket(e.into())),
            }
        }
        Ok(handle)
    }

    /// Send a descriptor that belongs to the next descriptor-carrying event
    pub fn send_fd(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        let tag = self.sent.fetch_add(1, Ordering::AcqRel);
        self.send_message(&tag.to_le_bytes(), Some(fd))?;
        Ok(tag)
    }

    /// Receive the descriptor for the event just popped
    pub fn recv_fd(&self) -> Result<OwnedFd> {
        let mut tag = [0u8; 8];
        let handle = self.recv_message(&mut tag)?;
        let tag = u64::from_le_bytes(tag);
        let expected = self.received.fetch_add(1, Ordering::AcqRel);

        if tag != expected {
            return Err(FrameLinkError::TransferFailed(format!(
                "descriptor stream out of step: tag {} expected {}",
                tag, expected
            )));
        }
        handle.ok_or_else(|| FrameLinkError::TransferFailed("message carried no descriptor".into()))
    }

    /// Check, without blocking, that the peer still holds its end
    pub fn check_peer(&self) -> Result<()> {
        let mut fds = [PollFd::new(&self.stream, PollFlags::IN)];
        loop {
            match poll(&mut fds, 0) {
                Ok(_) => break,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(FrameLinkError::Socket(e.into())),
            }
        }

        let revents = fds[0].revents();
        if revents.intersects(PollFlags::HUP | PollFlags::ERR) {
            return Err(FrameLinkError::PeerLost("peer closed the connection".into()));
        }
        if revents.contains(PollFlags::IN) {
            let mut peek = [0u8; 1];
            match recv(&self.stream, &mut peek, RecvFlags::PEEK | RecvFlags::DONTWAIT) {
                Ok(0) => return Err(FrameLinkError::PeerLost("peer closed the connection".into())),
                Ok(_) | Err(Errno::AGAIN) | Err(Errno::INTR) => {}
                Err(e) => return Err(FrameLinkError::Socket(e.into())),
            }
        }
        Ok(())
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn map_send_error(e: Errno) -> FrameLinkError {
    match e {
        Errno::PIPE | Errno::CONNRESET => FrameLinkError::PeerLost("peer closed the connection".into()),
        other => FrameLinkError::Socket(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;

    #[test]
    fn test_fd_arrives_usable() {
        let (a, b) = DescriptorChannel::pair().unwrap();
        let region = ShmRegion::anonymous("fd_pass", 4096).unwrap();
        region.write_bytes(0, b"handle").unwrap();

        a.send_fd(region.fd()).unwrap();
        let fd = b.recv_fd().unwrap();

        let mapped = ShmRegion::from_fd(fd, "fd_pass").unwrap();
        assert_eq!(mapped.slice(0, 6).unwrap(), b"handle");
    }

    #[test]
    fn test_fds_keep_order() {
        let (a, b) = DescriptorChannel::pair().unwrap();
        let first = ShmRegion::anonymous("first", 4096).unwrap();
        let second = ShmRegion::anonymous("second", 8192).unwrap();

        a.send_fd(first.fd()).unwrap();
        a.send_fd(second.fd()).unwrap();

        let one = ShmRegion::from_fd(b.recv_fd().unwrap(), "one").unwrap();
        let two = ShmRegion::from_fd(b.recv_fd().unwrap(), "two").unwrap();
        assert_eq!(one.size(), 4096);
        assert_eq!(two.size(), 8192);
    }

    #[test]
    fn test_message_without_descriptor() {
        let (a, b) = DescriptorChannel::pair().unwrap();
        a.send_message(b"hello, peer", None).unwrap();

        let mut buf = [0u8; 11];
        assert!(b.recv_message(&mut buf).unwrap().is_none());
        assert_eq!(&buf, b"hello, peer");
    }

    #[test]
    fn test_peer_loss_detected() {
        let (a, b) = DescriptorChannel::pair().unwrap();
        assert!(a.check_peer().is_ok());

        drop(b);
        assert!(matches!(a.check_peer(), Err(FrameLinkError::PeerLost(_))));
        assert!(matches!(
            a.send_message(b"x", None),
            Err(FrameLinkError::PeerLost(_))
        ));
    }

    #[test]
    fn test_pending_data_is_not_peer_loss() {
        let (a, b) = DescriptorChannel::pair().unwrap();
        let region = ShmRegion::anonymous("pending", 4096).unwrap();
        a.send_fd(region.fd()).unwrap();
        assert!(b.check_peer().is_ok());
        assert!(b.recv_fd().is_ok());
    }
}
