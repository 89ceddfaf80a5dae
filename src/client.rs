//! Attaching (client) side of a segment

use crate::config::TransportConfig;
use crate::descriptor::DescriptorChannel;
use crate::error::{FrameLinkError, Result};
use crate::event::{Event, ExternalEvent, Label, SegmentKind, TargetEvent};
use crate::layout::{flags, Geometry, RegionLayout, SegmentHeader, VERSION_MAJOR};
use crate::queue::{Delivered, EventQueue};
use crate::sem::{NamedSemaphore, SegmentSemaphores};
use crate::shm::ShmRegion;
use crate::state::{Answer, SegmentState, SubsegmentState, SubsegmentTracker, Transition};
use crate::transfer::{choose_path, BufferDescriptor, PassingState, TransferPath};
use rustix::fd::{AsFd, OwnedFd};
use std::collections::{HashSet, VecDeque};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where to find the segment mapping
#[derive(Debug)]
pub enum AttachSource {
    /// Open the named region
    Name(String),
    /// Map a descriptor received from the owner; `name` locates the semaphores
    Fd { fd: OwnedFd, name: String },
}

/// Outcome of [`ClientSegment::acquire_loop`]
#[derive(Debug, Default)]
pub struct Acquired {
    /// The grant or reject for the request, `None` on timeout
    pub answer: Option<Delivered>,
    /// Unrelated events received while waiting, in arrival order
    pub buffered: Vec<Delivered>,
}

/// Client side of one segment
pub struct ClientSegment {
    name: String,
    region: ShmRegion,
    queue: EventQueue,
    video: NamedSemaphore,
    audio: NamedSemaphore,
    layout: RegionLayout,
    generation: u64,
    config: TransportConfig,
    state: SegmentState,
    tracker: SubsegmentTracker,
    /// Outbound events held back while a resize is pending
    backlog: VecDeque<(Event, Option<OwnedFd>)>,
    passing: PassingState,
    next_frame: u64,
    attached_children: HashSet<u32>,
}

impl ClientSegment {
    /// Map a segment, verify the cookie and recover the published layout
    pub fn attach(source: AttachSource, channel: DescriptorChannel, config: &TransportConfig) -> Result<Self> {
        let (region, name) = match source {
            AttachSource::Name(name) => (ShmRegion::open(&name)?, name),
            AttachSource::Fd { fd, name } => (ShmRegion::from_fd(fd, &name)?, name),
        };

        let header = SegmentHeader::from_region(&region)?;
        header.check_cookie()?;
        if header.version_major != VERSION_MAJOR {
            return Err(FrameLinkError::ProtocolMismatch {
                expected: VERSION_MAJOR as u64,
                got: header.version_major as u64,
            });
        }
        if header.has_flag(flags::DEAD) {
            return Err(FrameLinkError::SegmentClosed);
        }

        let layout = header.layout.read();
        layout.validate(region.size())?;
        let generation = header.layout.generation();
        let no_passing = config.disable_handle_passing || header.has_flag(flags::NO_HANDLE_PASSING);

        let SegmentSemaphores {
            video,
            audio,
            doorbell,
        } = SegmentSemaphores::open(&name)?;
        let queue = EventQueue::new(
            layout.parent_ring_offset as usize,
            layout.child_ring_offset as usize,
            doorbell,
            channel,
            config,
        );

        debug!(
            segment = %name,
            width = layout.geometry.width,
            height = layout.geometry.height,
            "attached"
        );

        Ok(Self {
            name,
            region,
            queue,
            video,
            audio,
            layout,
            generation,
            config: config.clone(),
            state: SegmentState::Connecting,
            tracker: SubsegmentTracker::new(config),
            backlog: VecDeque::new(),
            passing: PassingState::new(no_passing, config.handle_ack_timeout),
            next_frame: 0,
            attached_children: HashSet::new(),
        })
    }

    fn header(&self) -> Result<&SegmentHeader> {
        SegmentHeader::from_region(&self.region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn geometry(&self) -> Geometry {
        self.layout.geometry
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Number of layout publications seen; bumps on every completed resize
    pub fn geometry_generation(&self) -> u64 {
        self.generation
    }

    /// Process id of the owner that initialized the segment
    pub fn owner_pid(&self) -> Result<u32> {
        Ok(self.header()?.owner_pid)
    }

    /// Hand the owner a token to authenticate (e.g. a render-node magic)
    pub fn publish_auth_token(&self, token: u64) -> Result<()> {
        self.state.ensure_open()?;
        self.header()?.publish_auth_token(token);
        debug!(segment = %self.name, "auth token published");
        Ok(())
    }

    pub fn passing(&self) -> &PassingState {
        &self.passing
    }

    pub fn mark_passing_broken(&mut self, reason: &str) {
        self.passing.mark_broken(reason);
    }

    /// State of one of our subsegment requests
    pub fn subsegment_state(&self, request_id: u32) -> Option<SubsegmentState> {
        self.tracker.state(request_id)
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_terminal() && !self.state.is_dead() {
                info!(segment = %self.name, error = %e, "segment lost");
                self.state = SegmentState::Dead;
            }
        }
        result
    }

    fn send(&mut self, event: Event, handle: Option<OwnedFd>) -> Result<()> {
        if self.state == SegmentState::Resizing {
            self.backlog.push_back((event, handle));
            return Ok(());
        }
        let result = self
            .queue
            .enqueue(&self.region, &event, handle.as_ref().map(|fd| fd.as_fd()));
        self.guard(result)
    }

    /// Announce the client's kind; moves to preroll
    pub fn register(&mut self, kind: SegmentKind, title: &str) -> Result<()> {
        self.state = self.state.apply(Transition::Register)?;
        self.send(
            Event::External(ExternalEvent::Register {
                kind,
                title: Label::new(title),
            }),
            None,
        )
    }

    /// Send an event, waiting for room (held back while resizing)
    pub fn enqueue(&mut self, event: Event) -> Result<()> {
        self.state.ensure_open()?;
        self.send(event, None)
    }

    /// Send an event if there is room; returns the free slots left
    pub fn try_enqueue(&mut self, event: &Event) -> Result<usize> {
        self.state.ensure_open()?;
        if self.state == SegmentState::Resizing {
            return Err(FrameLinkError::ResizePending);
        }
        let result = self.queue.try_enqueue(&self.region, event, None);
        self.guard(result)
    }

    /// Next event from the owner without blocking
    ///
    /// Errors are terminal. While a resize is pending nothing is consumed.
    pub fn poll(&mut self) -> Result<Option<Delivered>> {
        self.state.ensure_open()?;
        let result = self.pump();
        self.guard(result)
    }

    fn pump(&mut self) -> Result<Option<Delivered>> {
        let now = Instant::now();
        self.passing.check_timeout(now);
        for id in self.tracker.expire(now) {
            debug!(segment = %self.name, request_id = id, "subsegment request expired");
        }

        if self.state == SegmentState::Resizing {
            let header = self.header()?;
            if header.has_flag(flags::DEAD) {
                return Err(FrameLinkError::SegmentClosed);
            }
            if header.has_flag(flags::RESIZE_PENDING) {
                self.queue.channel().check_peer()?;
                return Ok(None);
            }
            self.finish_resize()?;
        }

        while let Some(delivered) = self.queue.poll(&self.region)? {
            if let Some(delivered) = self.route(delivered)? {
                return Ok(Some(delivered));
            }
        }
        Ok(None)
    }

    fn route(&mut self, delivered: Delivered) -> Result<Option<Delivered>> {
        let now = Instant::now();
        match &delivered.event {
            Event::Target(TargetEvent::Activate) => match self.state.apply(Transition::Activate) {
                Ok(next) => self.state = next,
                Err(e) => warn!(segment = %self.name, error = %e, "ignoring activate"),
            },
            Event::Target(TargetEvent::Terminate) => {
                self.state = SegmentState::Dead;
                return Err(FrameLinkError::SegmentClosed);
            }
            Event::Target(TargetEvent::NewSegment { request_id, .. }) => {
                if self.tracker.on_grant(*request_id, now) == Answer::Ignore {
                    debug!(segment = %self.name, request_id, "dropping late or duplicate grant");
                    return Ok(None);
                }
            }
            Event::Target(TargetEvent::RequestFail { request_id }) => {
                if self.tracker.on_reject(*request_id, now) == Answer::Ignore {
                    return Ok(None);
                }
            }
            Event::Target(TargetEvent::BufferAck { frame }) => {
                self.passing.on_ack(*frame);
            }
            Event::Target(TargetEvent::BufferFail) => self.passing.on_fail(),
            _ => {}
        }
        Ok(Some(delivered))
    }

    /// Wait for the next event from the owner
    ///
    /// `Ok(None)` only on timeout.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivered>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(delivered) = self.poll()? {
                return Ok(Some(delivered));
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(self.config.doorbell_slice)
                }
                None => self.config.doorbell_slice,
            };

            if self.state == SegmentState::Resizing {
                // the doorbell belongs to the owner until the resize lands
                std::thread::sleep(slice);
                continue;
            }
            let result = self.queue.wait(&self.region, Some(slice));
            if let Some(delivered) = self.guard(result)? {
                let result = self.route(delivered);
                if let Some(delivered) = self.guard(result)? {
                    return Ok(Some(delivered));
                }
            }
        }
    }

    /// Ask the owner for new dimensions
    ///
    /// Malformed geometry is refused locally and the segment stays active.
    pub fn request_resize(&mut self, geometry: Geometry) -> Result<()> {
        match self.state {
            SegmentState::Active => {}
            SegmentState::Resizing => return Err(FrameLinkError::ResizePending),
            SegmentState::Dead => return Err(FrameLinkError::SegmentClosed),
            state => return Err(FrameLinkError::invalid_state("request resize", state)),
        }
        geometry.validate(self.config.max_width, self.config.max_height)?;

        self.header()?.write_request(geometry);
        let result = self.queue.enqueue(
            &self.region,
            &Event::External(ExternalEvent::ResizeRequest {
                width: geometry.width,
                height: geometry.height,
            }),
            None,
        );
        self.guard(result)?;
        self.header()?.set_flag(flags::RESIZE_PENDING);
        self.state = self.state.apply(Transition::ResizeRequest)?;
        debug!(
            segment = %self.name,
            width = geometry.width,
            height = geometry.height,
            "resize requested"
        );
        Ok(())
    }

    fn finish_resize(&mut self) -> Result<()> {
        self.region.remap()?;
        let header = self.header()?;
        let layout = header.layout.read();
        let generation = header.layout.generation();
        layout.validate(self.region.size())?;

        let transition = if generation != self.generation {
            Transition::ResizeAck
        } else {
            Transition::ResizeRejected
        };
        self.layout = layout;
        self.generation = generation;
        self.state = self.state.apply(transition)?;
        info!(
            segment = %self.name,
            width = layout.geometry.width,
            height = layout.geometry.height,
            accepted = transition == Transition::ResizeAck,
            "resize settled"
        );

        while let Some((event, handle)) = self.backlog.pop_front() {
            self.queue
                .enqueue(&self.region, &event, handle.as_ref().map(|fd| fd.as_fd()))?;
        }
        Ok(())
    }

    /// Ask for an auxiliary segment; returns the request id
    pub fn request_subsegment(&mut self, purpose: SegmentKind, width: u32, height: u32) -> Result<u32> {
        self.state.ensure_open()?;
        let request_id = self.tracker.request(purpose, Instant::now());
        let event = Event::External(ExternalEvent::SegmentRequest {
            request_id,
            purpose,
            width,
            height,
        });
        if let Err(e) = self.send(event, None) {
            self.tracker.cancel(request_id);
            return Err(e);
        }
        Ok(request_id)
    }

    /// Wait for the answer to `request_id`, buffering everything else
    ///
    /// Buffered events keep their handles; the caller forwards or drops
    /// them one by one.
    pub fn acquire_loop(&mut self, request_id: u32, timeout: Duration) -> Result<Acquired> {
        let deadline = Instant::now() + timeout;
        let mut acquired = Acquired::default();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(acquired);
            }
            let Some(delivered) = self.wait(Some(deadline - now))? else {
                continue;
            };
            let answers = matches!(
                delivered.event,
                Event::Target(TargetEvent::NewSegment { request_id: id, .. })
                    | Event::Target(TargetEvent::RequestFail { request_id: id })
                    if id == request_id
            );
            if answers {
                acquired.answer = Some(delivered);
                return Ok(acquired);
            }
            acquired.buffered.push(delivered);
        }
    }

    /// Attach the subsegment carried by a grant
    pub fn attach_child(&mut self, mut grant: Delivered) -> Result<ClientSegment> {
        let Event::Target(TargetEvent::NewSegment { request_id, name, .. }) = &grant.event else {
            return Err(FrameLinkError::invalid_state("attach child", &grant.event));
        };
        let (request_id, name) = (*request_id, name.as_str().to_string());
        if !self.attached_children.insert(request_id) {
            return Err(FrameLinkError::invalid_state("attach child", "already attached"));
        }
        let handle = grant
            .take_handle()
            .ok_or_else(|| FrameLinkError::TransferFailed("grant without handle".into()))?;

        let channel = DescriptorChannel::new(UnixStream::from(handle));
        let mut child = ClientSegment::attach(AttachSource::Name(name), channel, &self.config)?;
        child.state = SegmentState::Active;
        info!(segment = %self.name, child = %child.name, request_id, "subsegment attached");
        Ok(child)
    }

    /// Tell the owner we are leaving; the segment is dead afterwards
    ///
    /// Mid-resize the owner may reset our outbound ring, so the socket is
    /// shut down instead and the owner sees the peer go away.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state.is_dead() {
            return Ok(());
        }
        if self.state == SegmentState::Resizing {
            self.backlog.clear();
            self.state = SegmentState::Dead;
            return self
                .queue
                .channel()
                .stream()
                .shutdown(Shutdown::Both)
                .map_err(FrameLinkError::Socket);
        }
        let result = self
            .queue
            .try_enqueue(&self.region, &Event::External(ExternalEvent::Terminate), None);
        self.state = SegmentState::Dead;
        result.map(|_| ())
    }

    /// Payload regions may be touched only while no resize is pending
    ///
    /// The owner may already have shrunk the backing object under our
    /// mapping, so every writer checks this before touching it.
    fn ensure_writable(&self) -> Result<()> {
        self.state.ensure_open()?;
        if self.state == SegmentState::Resizing {
            return Err(FrameLinkError::ResizePending);
        }
        Ok(())
    }

    /// Fail unless a new video frame may be submitted now
    pub fn ensure_video_free(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.passing.check_timeout(Instant::now());
        if self.header()?.vready.load(Ordering::Acquire) != 0 || self.passing.in_flight().is_some() {
            return Err(FrameLinkError::FrameInFlight("video"));
        }
        Ok(())
    }

    /// Copy pixel rows into the video region; returns the bytes covered
    pub fn write_video(&self, pixels: &[u8], src_stride: usize) -> Result<usize> {
        self.ensure_writable()?;
        let stride = self.layout.stride as usize;
        let row_len = src_stride.min(stride);
        let rows = (self.layout.geometry.height as usize).min(pixels.len() / src_stride.max(1));
        let base = self.layout.video_offset as usize;

        for row in 0..rows {
            let src = &pixels[row * src_stride..row * src_stride + row_len];
            self.region.write_bytes(base + row * stride, src)?;
        }
        Ok(rows * stride)
    }

    /// Copy audio bytes into the audio region; returns the bytes written
    pub fn write_audio(&self, samples: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        if samples.len() as u64 > self.layout.audio_size {
            return Err(FrameLinkError::OutOfBounds {
                offset: 0,
                len: samples.len(),
                size: self.layout.audio_size as usize,
            });
        }
        self.region.write_bytes(self.layout.audio_offset as usize, samples)?;
        Ok(samples.len())
    }

    fn signal_video(&mut self) -> Result<()> {
        let frame = self.next_frame;
        self.next_frame += 1;
        let header = self.header()?;
        header.vpts.store(frame, Ordering::Release);
        header.vready.store(1, Ordering::Release);
        let result = self.video.post();
        self.guard(result)
    }

    /// Hand a finished video frame to the owner; returns the path taken
    pub fn submit_video_frame(&mut self, descriptor: BufferDescriptor) -> Result<TransferPath> {
        self.ensure_video_free()?;

        match descriptor {
            BufferDescriptor::Region { offset, len } => {
                let end = offset.checked_add(len);
                if end.map_or(true, |end| end as u64 > self.layout.video_size) {
                    return Err(FrameLinkError::OutOfBounds {
                        offset,
                        len,
                        size: self.layout.video_size as usize,
                    });
                }
                self.signal_video()?;
                Ok(TransferPath::Readback)
            }
            BufferDescriptor::Handle { fd, meta } => {
                if choose_path(&self.passing, true) == TransferPath::Readback {
                    self.readback_handle(fd, meta.stride as usize)?;
                    self.signal_video()?;
                    return Ok(TransferPath::Readback);
                }
                if meta.planes != 1 {
                    self.passing.mark_broken("multi-plane handles are not passed");
                    return Err(FrameLinkError::TransferFailed(format!(
                        "{} planes",
                        meta.planes
                    )));
                }

                let frame = self.next_frame;
                let event = Event::External(ExternalEvent::BufferStream { frame, meta });
                match self.queue.enqueue(&self.region, &event, Some(fd.as_fd())) {
                    Ok(()) => {
                        self.next_frame += 1;
                        self.passing.begin(frame, Instant::now());
                        Ok(TransferPath::Handle)
                    }
                    Err(e) if e.is_terminal() => self.guard(Err(e)),
                    Err(e) => {
                        self.passing.mark_broken(&e.to_string());
                        Err(FrameLinkError::TransferFailed(e.to_string()))
                    }
                }
            }
        }
    }

    fn readback_handle(&self, fd: OwnedFd, stride: usize) -> Result<()> {
        let mapped = ShmRegion::from_fd(fd, "readback")
            .map_err(|e| FrameLinkError::TransferFailed(format!("handle not mappable: {}", e)))?;
        let pixels = mapped.slice(0, mapped.size())?;
        self.write_video(pixels, stride)?;
        Ok(())
    }

    /// Hand a filled audio buffer to the owner
    pub fn submit_audio_frame(&mut self, descriptor: BufferDescriptor) -> Result<()> {
        self.ensure_writable()?;
        let (offset, len) = match descriptor {
            BufferDescriptor::Region { offset, len } => (offset, len),
            BufferDescriptor::Handle { .. } => {
                return Err(FrameLinkError::TransferFailed(
                    "audio buffers cannot be passed as handles".into(),
                ))
            }
        };
        if offset != 0 || len as u64 > self.layout.audio_size {
            return Err(FrameLinkError::OutOfBounds {
                offset,
                len,
                size: self.layout.audio_size as usize,
            });
        }

        let header = self.header()?;
        if header.aready.load(Ordering::Acquire) != 0 {
            return Err(FrameLinkError::FrameInFlight("audio"));
        }
        header.audio_used.store(len as u32, Ordering::Release);
        header.aready.store(1, Ordering::Release);
        let result = self.audio.post();
        self.guard(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Segment;

    fn config() -> TransportConfig {
        TransportConfig {
            ring_capacity: 16,
            audio_buffer_size: 4096,
            doorbell_slice: Duration::from_millis(2),
            ..TransportConfig::default()
        }
    }

    fn active_pair(config: &TransportConfig) -> (Segment, ClientSegment) {
        let (mut server, mut client) = Segment::create_pair(config, Geometry::new(32, 16)).unwrap();
        client.register(SegmentKind::Application, "test").unwrap();
        server.poll().unwrap();
        server.activate().unwrap();
        let activate = client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(activate.event, Event::Target(TargetEvent::Activate));
        assert_eq!(client.state(), SegmentState::Active);
        (server, client)
    }

    #[test]
    fn test_cookie_mismatch_fails_attach() {
        let region = ShmRegion::anonymous("bad_cookie", 64 * 1024).unwrap();
        let layout =
            RegionLayout::compute(Geometry::new(8, 8), 8, 1024).unwrap();
        unsafe {
            SegmentHeader::init(region.ptr_at::<SegmentHeader>(0).unwrap(), layout);
            (*region.ptr_at::<SegmentHeader>(0).unwrap()).cookie ^= 1;
        }
        let (_a, b) = DescriptorChannel::pair().unwrap();
        let result = ClientSegment::attach(
            AttachSource::Fd {
                fd: region.clone_fd().unwrap(),
                name: "bad_cookie".into(),
            },
            b,
            &config(),
        );
        assert!(matches!(result, Err(FrameLinkError::ProtocolMismatch { .. })));
    }

    #[test]
    fn test_invalid_resize_is_local() {
        let (_server, mut client) = active_pair(&config());
        assert!(matches!(
            client.request_resize(Geometry::new(0, 16)),
            Err(FrameLinkError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            client.request_resize(Geometry::new(100_000, 16)),
            Err(FrameLinkError::InvalidGeometry { .. })
        ));
        assert_eq!(client.state(), SegmentState::Active);
    }

    #[test]
    fn test_region_frame_in_flight_until_release() {
        let (mut server, mut client) = active_pair(&config());
        let pixels = vec![0xabu8; 32 * 4 * 16];
        let len = client.write_video(&pixels, 32 * 4).unwrap();
        assert_eq!(
            client
                .submit_video_frame(BufferDescriptor::Region { offset: 0, len })
                .unwrap(),
            TransferPath::Readback
        );
        assert!(matches!(
            client.submit_video_frame(BufferDescriptor::Region { offset: 0, len }),
            Err(FrameLinkError::FrameInFlight("video"))
        ));

        assert!(server.poll().unwrap().video_ready);
        assert!(server.video_frame().unwrap().unwrap().iter().all(|&b| b == 0xab));
        server.release_video().unwrap();
        assert!(client
            .submit_video_frame(BufferDescriptor::Region { offset: 0, len })
            .is_ok());
    }

    #[test]
    fn test_audio_path() {
        let (mut server, mut client) = active_pair(&config());
        let len = client.write_audio(&[1, 2, 3, 4]).unwrap();
        client
            .submit_audio_frame(BufferDescriptor::Region { offset: 0, len })
            .unwrap();
        assert!(matches!(
            client.submit_audio_frame(BufferDescriptor::Region { offset: 0, len }),
            Err(FrameLinkError::FrameInFlight("audio"))
        ));
        assert!(server.poll().unwrap().audio_ready);
        assert_eq!(server.audio_buffer().unwrap().unwrap(), &[1, 2, 3, 4]);
        server.release_audio().unwrap();

        let memfd = ShmRegion::anonymous("audio_handle", 4096).unwrap();
        let result = client.submit_audio_frame(BufferDescriptor::Handle {
            fd: memfd.clone_fd().unwrap(),
            meta: Default::default(),
        });
        assert!(matches!(result, Err(FrameLinkError::TransferFailed(_))));
    }

    #[test]
    fn test_resize_round_trip() {
        let (mut server, mut client) = active_pair(&config());
        client.request_resize(Geometry::new(64, 48)).unwrap();
        assert_eq!(client.state(), SegmentState::Resizing);
        assert!(matches!(
            client.request_resize(Geometry::new(64, 48)),
            Err(FrameLinkError::ResizePending)
        ));

        server.poll().unwrap();
        assert_eq!(server.state(), SegmentState::Active);
        assert_eq!(server.geometry(), Geometry::new(64, 48));

        let ack = client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert!(matches!(
            ack.event,
            Event::Target(TargetEvent::ResizeAck { width: 64, height: 48, .. })
        ));
        assert_eq!(client.state(), SegmentState::Active);
        assert_eq!(client.geometry(), Geometry::new(64, 48));
        assert_eq!(client.geometry_generation(), 1);
    }

    #[test]
    fn test_writers_refuse_while_resize_pending() {
        let (mut server, mut client) = Segment::create_pair(&config(), Geometry::new(256, 256)).unwrap();
        client.register(SegmentKind::Application, "shrink").unwrap();
        server.poll().unwrap();
        server.activate().unwrap();
        client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        let pixels = vec![1u8; 256 * 4 * 256];

        client.request_resize(Geometry::new(8, 8)).unwrap();
        server.poll().unwrap();
        assert_eq!(server.geometry(), Geometry::new(8, 8));

        // The backing object already shrank under the client's old mapping
        assert!(matches!(
            client.write_video(&pixels, 256 * 4),
            Err(FrameLinkError::ResizePending)
        ));
        assert!(matches!(client.write_audio(&[9; 4]), Err(FrameLinkError::ResizePending)));
        assert!(matches!(
            client.submit_audio_frame(BufferDescriptor::Region { offset: 0, len: 4 }),
            Err(FrameLinkError::ResizePending)
        ));

        client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(client.write_video(&pixels, 256 * 4).unwrap(), 8 * 8 * 4);
        let len = client.write_audio(&[9; 4]).unwrap();
        client
            .submit_audio_frame(BufferDescriptor::Region { offset: 0, len })
            .unwrap();
        assert!(server.poll().unwrap().audio_ready);
        assert_eq!(server.audio_buffer().unwrap().unwrap(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_terminate_mid_resize_reaches_owner() {
        let (mut server, mut client) = active_pair(&config());
        client.request_resize(Geometry::new(48, 48)).unwrap();
        client.terminate().unwrap();
        assert_eq!(client.state(), SegmentState::Dead);

        assert!(matches!(server.poll(), Err(FrameLinkError::PeerLost(_))));
        assert_eq!(server.state(), SegmentState::Dead);
    }

    #[test]
    fn test_second_handle_frame_is_refused_and_first_kept() {
        let (mut server, mut client) = active_pair(&config());
        let meta = crate::event::HandleMeta {
            width: 32,
            height: 16,
            stride: 128,
            fourcc: crate::transfer::FOURCC_XRGB8888,
            planes: 1,
        };
        let first = ShmRegion::anonymous("first", 32 * 16 * 4).unwrap();
        first.write_bytes(0, b"one!").unwrap();
        let path = client
            .submit_video_frame(BufferDescriptor::Handle {
                fd: first.clone_fd().unwrap(),
                meta,
            })
            .unwrap();
        assert_eq!(path, TransferPath::Handle);

        // A second frame published before the consumer released the first
        let second = ShmRegion::anonymous("second", 32 * 16 * 4).unwrap();
        let event = Event::External(ExternalEvent::BufferStream { frame: 99, meta });
        client.queue.enqueue(&client.region, &event, Some(second.fd())).unwrap();

        assert!(server.poll().unwrap().video_ready);
        let fail = client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(fail.event, Event::Target(TargetEvent::BufferFail));

        let frame = server.take_handle_frame().unwrap();
        assert_eq!(frame.frame, 0);
        let mapped = ShmRegion::from_fd(frame.fd, "kept").unwrap();
        assert_eq!(mapped.slice(0, 4).unwrap(), b"one!");
        assert!(server.take_handle_frame().is_none());
    }
}
