//! Owner side of a segment
//!
//! The owner allocates the mapping, names and semaphores, and is the only
//! party that moves the segment through a resize. All header mutation
//! happens inside [`Segment::poll`] (and the explicit control calls).

use crate::client::{AttachSource, ClientSegment};
use crate::clock::FrameClock;
use crate::config::TransportConfig;
use crate::descriptor::DescriptorChannel;
use crate::error::{FrameLinkError, Result};
use crate::event::{Event, ExternalEvent, HandleMeta, Label, SegmentKind, TargetEvent};
use crate::layout::{flags, Geometry, RegionLayout, SegmentHeader};
use crate::queue::{Delivered, EventQueue};
use crate::ring::EventRing;
use crate::sem::{NamedSemaphore, SegmentSemaphores};
use crate::shm::ShmRegion;
use crate::state::{SegmentState, SubsegmentBroker, SubsegmentRequest, Transition};
use rustix::fd::{AsFd, OwnedFd};
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

static SEGMENT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A fresh segment name, unique within this process
pub fn next_segment_name() -> String {
    format!(
        "{}_{}",
        std::process::id(),
        SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Result of a successful owner poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStatus {
    /// A video frame (region or handle) is waiting to be consumed
    pub video_ready: bool,
    /// An audio buffer is waiting to be consumed
    pub audio_ready: bool,
    /// Events waiting in the owner's inbox
    pub pending_events: usize,
}

/// A handle-passed video frame taken from the client
#[derive(Debug)]
pub struct HandleFrame {
    pub frame: u64,
    pub meta: HandleMeta,
    pub fd: OwnedFd,
}

/// Owner side of one segment
pub struct Segment {
    name: String,
    region: ShmRegion,
    queue: EventQueue,
    video: NamedSemaphore,
    audio: NamedSemaphore,
    layout: RegionLayout,
    config: TransportConfig,
    state: SegmentState,
    broker: SubsegmentBroker,
    inbox: VecDeque<Delivered>,
    handle_frame: Option<HandleFrame>,
    clock: Option<FrameClock>,
    client_kind: SegmentKind,
    client_title: Label,
    children: Vec<Weak<()>>,
    /// Held by subsegments; the parent counts live children through it
    lease: Option<Arc<()>>,
}

/// A segment accepted from a connection point
pub type ServerClient = Segment;

impl Segment {
    /// Allocate a segment under a generated name
    pub fn create(config: &TransportConfig, geometry: Geometry, channel: DescriptorChannel) -> Result<Self> {
        Self::create_named(&next_segment_name(), config, geometry, channel)
    }

    /// Allocate a segment: mapping, header, both rings and three closed semaphores
    pub fn create_named(
        name: &str,
        config: &TransportConfig,
        geometry: Geometry,
        channel: DescriptorChannel,
    ) -> Result<Self> {
        geometry.validate(config.max_width, config.max_height)?;
        let capacity = config.effective_ring_capacity();
        let layout = RegionLayout::compute(geometry, capacity, config.audio_buffer_size)?;

        let region = ShmRegion::create(name, layout.total_size as usize)?;
        unsafe {
            SegmentHeader::init(region.ptr_at::<SegmentHeader>(0)?, layout);
        }
        EventRing::init(&region, layout.parent_ring_offset as usize, capacity)?;
        EventRing::init(&region, layout.child_ring_offset as usize, capacity)?;
        if config.disable_handle_passing {
            SegmentHeader::from_region(&region)?.set_flag(flags::NO_HANDLE_PASSING);
        }

        let SegmentSemaphores {
            video,
            audio,
            doorbell,
        } = SegmentSemaphores::create(name)?;
        let queue = EventQueue::new(
            layout.child_ring_offset as usize,
            layout.parent_ring_offset as usize,
            doorbell,
            channel,
            config,
        );

        info!(
            segment = name,
            width = geometry.width,
            height = geometry.height,
            size = layout.total_size,
            "segment created"
        );

        Ok(Self {
            name: name.to_string(),
            region,
            queue,
            video,
            audio,
            layout,
            config: config.clone(),
            state: SegmentState::Connecting,
            broker: SubsegmentBroker::new(config),
            inbox: VecDeque::new(),
            handle_frame: None,
            clock: None,
            client_kind: SegmentKind::Unknown,
            client_title: Label::default(),
            children: Vec::new(),
            lease: None,
        })
    }

    /// Segment plus an attached client over an in-process socket pair
    pub fn create_pair(config: &TransportConfig, geometry: Geometry) -> Result<(Segment, ClientSegment)> {
        let (ours, theirs) = DescriptorChannel::pair()?;
        let segment = Self::create(config, geometry, ours)?;
        let client = ClientSegment::attach(
            AttachSource::Fd {
                fd: segment.region.clone_fd()?,
                name: segment.name.clone(),
            },
            theirs,
            config,
        )?;
        Ok((segment, client))
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

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn geometry(&self) -> Geometry {
        self.layout.geometry
    }

    pub(crate) fn channel(&self) -> &DescriptorChannel {
        self.queue.channel()
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    /// Kind and title the client registered with
    pub fn client_identity(&self) -> (SegmentKind, &Label) {
        (self.client_kind, &self.client_title)
    }

    fn enter_dead(&mut self) {
        if !self.state.is_dead() {
            info!(segment = %self.name, "segment dead");
        }
        self.state = SegmentState::Dead;
        if let Ok(header) = self.header() {
            header.set_flag(flags::DEAD);
        }
        self.handle_frame = None;
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_terminal() {
                self.enter_dead();
            }
        }
        result
    }

    /// Process the client's traffic and report what is ready
    ///
    /// Runs a pending resize to completion, routes inbound events (subsegment
    /// requests go to the broker) and returns a terminal error once the
    /// client is gone or has terminated.
    pub fn poll(&mut self) -> Result<ClientStatus> {
        self.state.ensure_open()?;
        let result = self.pump();
        self.guard(result)?;

        let header = self.header()?;
        let video_ready = header.vready.load(Ordering::Acquire) != 0 || self.handle_frame.is_some();
        let audio_ready = header.aready.load(Ordering::Acquire) != 0;
        // the ready words are authoritative; posts are only wakeups
        self.video.drain()?;
        self.audio.drain()?;

        Ok(ClientStatus {
            video_ready,
            audio_ready,
            pending_events: self.inbox.len(),
        })
    }

    fn pump(&mut self) -> Result<()> {
        if self.header()?.has_flag(flags::RESIZE_PENDING) {
            self.run_resize()?;
        }
        while let Some(delivered) = self.queue.poll(&self.region)? {
            self.route(delivered)?;
        }
        // the client may have raised the flag while we drained
        if self.header()?.has_flag(flags::RESIZE_PENDING) {
            self.run_resize()?;
        }
        Ok(())
    }

    fn route(&mut self, mut delivered: Delivered) -> Result<()> {
        debug!(segment = %self.name, event = %delivered.event, "client event");
        match &delivered.event {
            Event::External(ExternalEvent::Register { kind, title }) => {
                match self.state.apply(Transition::Register) {
                    Ok(next) => {
                        self.state = next;
                        self.client_kind = *kind;
                        self.client_title = title.clone();
                    }
                    Err(e) => warn!(segment = %self.name, error = %e, "ignoring register"),
                }
                self.inbox.push_back(delivered);
            }
            Event::External(ExternalEvent::SegmentRequest {
                request_id,
                purpose,
                width,
                height,
            }) => {
                let request = SubsegmentRequest {
                    request_id: *request_id,
                    purpose: *purpose,
                    width: *width,
                    height: *height,
                };
                self.prune_children();
                if let Err(reason) = self.broker.submit(request) {
                    debug!(segment = %self.name, request_id, ?reason, "subsegment request refused");
                    self.send(&Event::Target(TargetEvent::RequestFail {
                        request_id: *request_id,
                    }))?;
                }
            }
            Event::External(ExternalEvent::BufferStream { frame, meta }) => {
                let (frame, meta) = (*frame, *meta);
                let Some(fd) = delivered.take_handle() else {
                    return Err(FrameLinkError::TransferFailed("buffer stream without handle".into()));
                };
                if self.header()?.has_flag(flags::NO_HANDLE_PASSING) {
                    self.send(&Event::Target(TargetEvent::BufferFail))?;
                } else if let Some(pending) = &self.handle_frame {
                    // the first frame stays; the newcomer's descriptor is closed here
                    warn!(segment = %self.name, pending = pending.frame, frame, "second handle frame refused");
                    drop(fd);
                    self.send(&Event::Target(TargetEvent::BufferFail))?;
                } else {
                    self.handle_frame = Some(HandleFrame { frame, meta, fd });
                }
            }
            Event::External(ExternalEvent::ClockRequest { rate, once }) if self.config.autoclock => {
                self.clock = FrameClock::new(*rate, *once);
                debug!(segment = %self.name, rate, once, "clock set");
            }
            Event::External(ExternalEvent::Terminate) => {
                self.enter_dead();
                return Err(FrameLinkError::SegmentClosed);
            }
            // handled through the header flag
            Event::External(ExternalEvent::ResizeRequest { .. }) => self.inbox.push_back(delivered),
            _ => self.inbox.push_back(delivered),
        }
        Ok(())
    }

    fn run_resize(&mut self) -> Result<()> {
        let requested = self.header()?.requested_geometry();
        match self.state.apply(Transition::ResizeRequest) {
            Ok(next) => self.state = next,
            Err(e) => {
                warn!(segment = %self.name, error = %e, "resize request out of state");
                return self.reject_resize(requested);
            }
        }
        info!(
            segment = %self.name,
            width = requested.width,
            height = requested.height,
            "resizing"
        );

        // Quiesce: everything the client sent before raising the flag
        for delivered in self.queue.drain_inbound(&self.region)? {
            self.route(delivered)?;
        }

        if requested.validate(self.config.max_width, self.config.max_height).is_err() {
            return self.reject_resize(requested);
        }
        let layout = match RegionLayout::compute(
            requested,
            self.layout.ring_capacity as usize,
            self.layout.audio_size as usize,
        ) {
            Ok(layout) => layout,
            Err(_) => return self.reject_resize(requested),
        };

        if let Err(e) = self.region.resize(layout.total_size as usize) {
            warn!(segment = %self.name, error = %e, "cannot grow backing store");
            self.state = self.state.apply(Transition::ResizeFailed)?;
            self.enter_dead();
            return Err(e);
        }

        self.queue.compact_outbound(&self.region)?;
        self.queue.reset_inbound(&self.region)?;

        let header = self.header()?;
        header.vready.store(0, Ordering::Release);
        header.aready.store(0, Ordering::Release);
        header.layout.publish(&layout);
        let generation = header.layout.generation();
        header.clear_flag(flags::RESIZE_PENDING);
        self.layout = layout;
        self.handle_frame = None;
        self.state = self.state.apply(Transition::ResizeAck)?;

        self.send(&Event::Target(TargetEvent::ResizeAck {
            width: requested.width,
            height: requested.height,
            generation,
        }))
    }

    fn reject_resize(&mut self, requested: Geometry) -> Result<()> {
        if self.state == SegmentState::Resizing {
            self.state = self.state.apply(Transition::ResizeRejected)?;
        }
        self.header()?.clear_flag(flags::RESIZE_PENDING);
        debug!(segment = %self.name, ?requested, "resize rejected");
        self.send(&Event::Target(TargetEvent::ResizeRejected {
            width: requested.width,
            height: requested.height,
        }))
    }

    fn send(&self, event: &Event) -> Result<()> {
        self.queue.enqueue(&self.region, event, None)
    }

    /// Next event from the client, processing pending traffic first
    pub fn dequeue_event(&mut self) -> Result<Option<Delivered>> {
        self.state.ensure_open()?;
        if self.inbox.is_empty() {
            let result = self.pump();
            self.guard(result)?;
        }
        Ok(self.inbox.pop_front())
    }

    /// Wait up to `timeout` for the next client event
    pub fn wait_event(&mut self, timeout: Option<Duration>) -> Result<Option<Delivered>> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if let Some(delivered) = self.dequeue_event()? {
                return Ok(Some(delivered));
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(self.config.doorbell_slice)
                }
                None => self.config.doorbell_slice,
            };
            let result = self.queue.wait(&self.region, Some(slice));
            if let Some(delivered) = self.guard(result)? {
                let result = self.route(delivered);
                self.guard(result)?;
            }
        }
    }

    /// Send an event to the client without blocking
    pub fn try_enqueue(&self, event: &Event) -> Result<usize> {
        self.state.ensure_open()?;
        self.queue.try_enqueue(&self.region, event, None)
    }

    /// Send an event to the client, waiting for room
    pub fn enqueue(&self, event: &Event) -> Result<()> {
        self.state.ensure_open()?;
        self.send(event)
    }

    /// The clock the client asked for, if autoclock is on and one is set
    pub fn clock(&self) -> Option<&FrameClock> {
        self.clock.as_ref()
    }

    /// Advance the client's clock by `ticks`; returns the frames stepped
    ///
    /// Each firing sends `StepFrame { frames: 1 }`. A one-shot clock is
    /// cleared after it fires. Segments that are not active do not tick.
    pub fn tick(&mut self, ticks: u32) -> Result<u32> {
        self.state.ensure_open()?;
        if self.state != SegmentState::Active {
            return Ok(0);
        }
        let Some(clock) = self.clock.as_mut() else {
            return Ok(0);
        };
        let fired = clock.advance(ticks);
        if fired > 0 && clock.is_once() {
            self.clock = None;
        }
        for _ in 0..fired {
            let result = self.send(&Event::Target(TargetEvent::StepFrame { frames: 1 }));
            self.guard(result)?;
        }
        Ok(fired)
    }

    /// Accept the registered client
    pub fn activate(&mut self) -> Result<()> {
        self.state = self.state.apply(Transition::Activate)?;
        info!(segment = %self.name, kind = ?self.client_kind, "activated");
        self.send(&Event::Target(TargetEvent::Activate))
    }

    /// Close the segment; the client sees `SegmentClosed` from then on
    pub fn terminate(&mut self) {
        if self.state.is_dead() {
            return;
        }
        // answer queued subsegment requests so requesters are not left waiting
        for request in self.broker.drain() {
            let fail = Event::Target(TargetEvent::RequestFail {
                request_id: request.request_id,
            });
            let _ = self.queue.try_enqueue(&self.region, &fail, None);
        }
        let _ = self.queue.try_enqueue(&self.region, &Event::Target(TargetEvent::Terminate), None);
        self.enter_dead();
    }

    /// The signalled video region, if the client has a frame ready
    pub fn video_frame(&self) -> Result<Option<&[u8]>> {
        self.state.ensure_open()?;
        let header = self.header()?;
        if header.vready.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        self.region
            .slice(self.layout.video_offset as usize, self.layout.video_size as usize)
            .map(Some)
    }

    /// Hand the region back to the client
    pub fn release_video(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.header()?.vready.store(0, Ordering::Release);
        Ok(())
    }

    /// Take a handle-passed frame; answer it with `ack_buffer` or `buffer_fail`
    pub fn take_handle_frame(&mut self) -> Option<HandleFrame> {
        self.handle_frame.take()
    }

    pub fn ack_buffer(&self, frame: u64) -> Result<()> {
        self.enqueue(&Event::Target(TargetEvent::BufferAck { frame }))
    }

    /// Tell the client its handle was unusable; it degrades to readback
    pub fn buffer_fail(&self) -> Result<()> {
        self.enqueue(&Event::Target(TargetEvent::BufferFail))
    }

    /// Take the token the client published for authentication, if any
    pub fn take_auth_token(&self) -> Result<Option<u64>> {
        self.state.ensure_open()?;
        Ok(self.header()?.take_auth_token())
    }

    /// Stop accepting buffer handles from now on
    ///
    /// Handle frames already in the ring are answered with `BufferFail`,
    /// which moves the client to readback.
    pub fn disable_handle_passing(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.header()?.set_flag(flags::NO_HANDLE_PASSING);
        Ok(())
    }

    /// The signalled audio bytes, if any
    pub fn audio_buffer(&self) -> Result<Option<&[u8]>> {
        self.state.ensure_open()?;
        let header = self.header()?;
        if header.aready.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let used = (header.audio_used.load(Ordering::Acquire) as u64).min(self.layout.audio_size);
        self.region
            .slice(self.layout.audio_offset as usize, used as usize)
            .map(Some)
    }

    pub fn release_audio(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.header()?.aready.store(0, Ordering::Release);
        Ok(())
    }

    fn prune_children(&mut self) {
        self.children.retain(|c| c.strong_count() > 0);
        self.broker.set_live(self.children.len());
    }

    /// Next queued subsegment request, one at a time and never mid-resize
    pub fn next_subsegment_request(&mut self) -> Option<SubsegmentRequest> {
        self.prune_children();
        self.broker
            .next(self.state == SegmentState::Resizing || self.state.is_dead())
    }

    /// Grant the request being negotiated: allocate the child and send it
    pub fn grant_subsegment(&mut self, request: &SubsegmentRequest) -> Result<Segment> {
        self.state.ensure_open()?;
        if self.broker.negotiating() != Some(*request) {
            return Err(FrameLinkError::invalid_state("grant subsegment", self.broker.negotiating()));
        }

        let (ours, theirs) = UnixStream::pair().map_err(FrameLinkError::Socket)?;
        let mut child = Segment::create(
            &self.config,
            request.geometry(),
            DescriptorChannel::new(ours),
        )?;
        child.state = SegmentState::Active;
        child.client_kind = request.purpose;
        let lease = Arc::new(());
        self.children.push(Arc::downgrade(&lease));
        child.lease = Some(lease);

        let grant = Event::Target(TargetEvent::NewSegment {
            request_id: request.request_id,
            purpose: request.purpose,
            width: request.width,
            height: request.height,
            name: Label::new(child.name()),
        });
        self.queue.enqueue(&self.region, &grant, Some(theirs.as_fd()))?;
        self.broker.finish(request.request_id, true);
        info!(
            segment = %self.name,
            child = %child.name,
            request_id = request.request_id,
            "subsegment granted"
        );
        Ok(child)
    }

    /// Refuse the request being negotiated
    pub fn reject_subsegment(&mut self, request: &SubsegmentRequest) -> Result<()> {
        self.state.ensure_open()?;
        if !self.broker.finish(request.request_id, false) {
            return Err(FrameLinkError::invalid_state("reject subsegment", self.broker.negotiating()));
        }
        self.send(&Event::Target(TargetEvent::RequestFail {
            request_id: request.request_id,
        }))
    }

    /// Live subsegments granted from this segment
    pub fn live_subsegments(&mut self) -> usize {
        self.prune_children();
        self.broker.live()
    }

    /// True for a segment created through `grant_subsegment`
    pub fn is_subsegment(&self) -> bool {
        self.lease.is_some()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            ring_capacity: 16,
            audio_buffer_size: 4096,
            doorbell_slice: Duration::from_millis(2),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_create_publishes_layout() {
        let (server, client) = Segment::create_pair(&config(), Geometry::new(64, 32)).unwrap();
        let header = SegmentHeader::from_region(server.region()).unwrap();
        header.check_cookie().unwrap();
        assert_eq!(header.layout.read(), *server.layout());
        assert_eq!(client.geometry(), Geometry::new(64, 32));
        assert_eq!(server.state(), SegmentState::Connecting);
    }

    #[test]
    fn test_register_then_activate() {
        let (mut server, mut client) = Segment::create_pair(&config(), Geometry::new(32, 32)).unwrap();
        client.register(SegmentKind::Terminal, "term").unwrap();

        let status = server.poll().unwrap();
        assert_eq!(status.pending_events, 1);
        assert_eq!(server.state(), SegmentState::Preroll);
        assert_eq!(server.client_identity().0, SegmentKind::Terminal);
        assert!(server.activate().is_ok());
        assert!(server.activate().is_err());
    }

    #[test]
    fn test_activate_before_register_is_refused() {
        let (mut server, _client) = Segment::create_pair(&config(), Geometry::new(32, 32)).unwrap();
        assert!(matches!(server.activate(), Err(FrameLinkError::InvalidState { .. })));
    }

    #[test]
    fn test_refused_subsegment_request_is_answered() {
        let config = TransportConfig {
            max_subsegments: 0,
            ..config()
        };
        let (mut server, mut client) = Segment::create_pair(&config, Geometry::new(32, 32)).unwrap();
        client.register(SegmentKind::Application, "app").unwrap();
        server.poll().unwrap();
        server.activate().unwrap();
        client.poll().unwrap();

        let id = client.request_subsegment(SegmentKind::Clipboard, 16, 16).unwrap();
        server.poll().unwrap();
        assert!(server.next_subsegment_request().is_none());

        let delivered = client.wait(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(delivered.event, Event::Target(TargetEvent::RequestFail { request_id: id }));
    }

    #[test]
    fn test_drop_closes_client() {
        let (server, mut client) = Segment::create_pair(&config(), Geometry::new(32, 32)).unwrap();
        drop(server);
        assert!(matches!(client.poll(), Err(FrameLinkError::SegmentClosed)));
        assert!(matches!(client.poll(), Err(FrameLinkError::SegmentClosed)));
    }
}
