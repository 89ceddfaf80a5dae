//! Segment state machine and subsegment negotiation
//!
//! ```text
//! Connecting --register--> Preroll --activate--> Active <--ack/reject-- Resizing
//!                             |                    |  --resize request-->  |
//!                             +--terminate--> Dead <---- terminate / peer loss / grow failure
//! ```

use crate::config::TransportConfig;
use crate::error::{FrameLinkError, Result};
use crate::event::SegmentKind;
use crate::layout::Geometry;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Lifecycle of one segment, tracked independently on each side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentState {
    /// Mapped, no control traffic yet
    #[default]
    Connecting,
    /// Client registered; waiting for the owner to activate
    Preroll,
    /// Steady state
    Active,
    /// Geometry renegotiation in progress
    Resizing,
    /// Terminal
    Dead,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Register,
    Activate,
    ResizeRequest,
    ResizeAck,
    ResizeRejected,
    /// The owner could not grow the backing store
    ResizeFailed,
    Terminate,
    PeerLost,
}

impl SegmentState {
    /// Apply a transition, or explain why it does not apply here
    ///
    /// Terminate and peer loss are accepted from every state. Everything
    /// else on a dead segment is `SegmentClosed`.
    pub fn apply(self, transition: Transition) -> Result<SegmentState> {
        use SegmentState::*;
        use Transition as T;

        let next = match (self, transition) {
            (_, T::Terminate) | (_, T::PeerLost) => Dead,
            (Dead, _) => return Err(FrameLinkError::SegmentClosed),
            (Connecting, T::Register) => Preroll,
            (Preroll, T::Activate) => Active,
            (Active, T::ResizeRequest) => Resizing,
            (Resizing, T::ResizeAck) | (Resizing, T::ResizeRejected) => Active,
            (Resizing, T::ResizeFailed) => Dead,
            (state, t) => {
                return Err(FrameLinkError::InvalidState {
                    op: transition_name(t),
                    state: format!("{:?}", state),
                })
            }
        };
        Ok(next)
    }

    pub fn is_dead(self) -> bool {
        self == SegmentState::Dead
    }

    /// Fail with `SegmentClosed` once dead
    pub fn ensure_open(self) -> Result<()> {
        if self.is_dead() {
            return Err(FrameLinkError::SegmentClosed);
        }
        Ok(())
    }
}

fn transition_name(t: Transition) -> &'static str {
    match t {
        Transition::Register => "register",
        Transition::Activate => "activate",
        Transition::ResizeRequest => "resize request",
        Transition::ResizeAck => "resize ack",
        Transition::ResizeRejected => "resize reject",
        Transition::ResizeFailed => "resize failure",
        Transition::Terminate => "terminate",
        Transition::PeerLost => "peer loss",
    }
}

/// A subsegment request as seen by the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsegmentRequest {
    pub request_id: u32,
    pub purpose: SegmentKind,
    pub width: u32,
    pub height: u32,
}

impl SubsegmentRequest {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }
}

/// Why the broker refused a request outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Live + queued subsegments already at `max_subsegments`
    CapReached,
    /// Too many requests waiting behind a resize or another negotiation
    QueueFull,
    /// Zero or over-limit dimensions
    InvalidGeometry,
    /// Same id already queued or under negotiation
    Duplicate,
}

/// Owner-side queue of subsegment requests
///
/// Requests that arrive while the owner is resizing or already negotiating
/// another subsegment wait here, up to a bound; anything beyond the bound or
/// the subsegment cap is rejected explicitly.
#[derive(Debug)]
pub struct SubsegmentBroker {
    pending: VecDeque<SubsegmentRequest>,
    negotiating: Option<SubsegmentRequest>,
    live: usize,
    max_live: usize,
    max_pending: usize,
    max_width: u32,
    max_height: u32,
}

impl SubsegmentBroker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            negotiating: None,
            live: 0,
            max_live: config.max_subsegments,
            max_pending: config.max_pending_requests,
            max_width: config.max_width,
            max_height: config.max_height,
        }
    }

    /// Accept a request into the queue, or say why it is refused
    pub fn submit(&mut self, request: SubsegmentRequest) -> std::result::Result<(), RejectReason> {
        if request
            .geometry()
            .validate(self.max_width, self.max_height)
            .is_err()
        {
            return Err(RejectReason::InvalidGeometry);
        }
        let mut known = self.negotiating.iter().chain(self.pending.iter());
        if known.any(|r| r.request_id == request.request_id) {
            return Err(RejectReason::Duplicate);
        }
        if self.live + self.pending.len() + self.negotiating.is_some() as usize >= self.max_live {
            return Err(RejectReason::CapReached);
        }
        if self.pending.len() >= self.max_pending {
            return Err(RejectReason::QueueFull);
        }
        self.pending.push_back(request);
        Ok(())
    }

    /// Hand out the next request, one negotiation at a time
    ///
    /// Returns `None` while `busy` (owner resizing) or while a previous
    /// request is still being answered.
    pub fn next(&mut self, busy: bool) -> Option<SubsegmentRequest> {
        if busy || self.negotiating.is_some() {
            return None;
        }
        let request = self.pending.pop_front()?;
        self.negotiating = Some(request);
        Some(request)
    }

    /// The request currently being negotiated
    pub fn negotiating(&self) -> Option<SubsegmentRequest> {
        self.negotiating
    }

    /// Close the current negotiation; `granted` counts it as live
    ///
    /// Returns `false` if `request_id` is not the one being negotiated.
    pub fn finish(&mut self, request_id: u32, granted: bool) -> bool {
        match self.negotiating {
            Some(r) if r.request_id == request_id => {
                self.negotiating = None;
                if granted {
                    self.live += 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Resynchronize the live count with the subsegments still alive
    pub fn set_live(&mut self, live: usize) {
        self.live = live;
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop every queued request, returning them so each can be answered
    pub fn drain(&mut self) -> Vec<SubsegmentRequest> {
        self.negotiating.take().into_iter().chain(self.pending.drain(..)).collect()
    }
}

/// Requester-side view of one subsegment request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsegmentState {
    Requested,
    Granted,
    Rejected,
}

/// What the requester should do with an incoming answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// First grant for an outstanding request: attach the child
    Attach,
    /// First reject for an outstanding request
    Rejected,
    /// Late, duplicate or unknown; drop it (close any handle)
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    purpose: SegmentKind,
    deadline: Instant,
}

/// Tracks the client's subsegment requests and their deadlines
#[derive(Debug)]
pub struct SubsegmentTracker {
    next_id: u32,
    outstanding: HashMap<u32, Outstanding>,
    resolved: HashMap<u32, SubsegmentState>,
    /// Resolution order, oldest first; bounds `resolved`
    history: VecDeque<u32>,
    timeout: std::time::Duration,
}

/// Answered requests whose outcome stays queryable
const RESOLVED_HISTORY: usize = 64;

impl SubsegmentTracker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            next_id: 1,
            outstanding: HashMap::new(),
            resolved: HashMap::new(),
            history: VecDeque::new(),
            timeout: config.subsegment_timeout,
        }
    }

    /// Register a new request and return its id
    pub fn request(&mut self, purpose: SegmentKind, now: Instant) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.outstanding.insert(
            id,
            Outstanding {
                purpose,
                deadline: now + self.timeout,
            },
        );
        id
    }

    fn resolve(&mut self, request_id: u32, state: SubsegmentState) {
        if self.resolved.insert(request_id, state).is_none() {
            self.history.push_back(request_id);
        }
        while self.history.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.history.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }

    /// Forget a request that never made it onto the wire
    pub fn cancel(&mut self, request_id: u32) {
        self.outstanding.remove(&request_id);
    }

    /// Classify a grant for `request_id`
    pub fn on_grant(&mut self, request_id: u32, now: Instant) -> Answer {
        self.expire(now);
        match self.outstanding.remove(&request_id) {
            Some(_) => {
                self.resolve(request_id, SubsegmentState::Granted);
                Answer::Attach
            }
            None => Answer::Ignore,
        }
    }

    /// Classify a reject for `request_id`
    pub fn on_reject(&mut self, request_id: u32, now: Instant) -> Answer {
        self.expire(now);
        match self.outstanding.remove(&request_id) {
            Some(_) => {
                self.resolve(request_id, SubsegmentState::Rejected);
                Answer::Rejected
            }
            None => Answer::Ignore,
        }
    }

    /// Move every request past its deadline to `Rejected`
    pub fn expire(&mut self, now: Instant) -> Vec<u32> {
        let expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            self.outstanding.remove(id);
            self.resolve(*id, SubsegmentState::Rejected);
        }
        expired
    }

    pub fn state(&self, request_id: u32) -> Option<SubsegmentState> {
        if self.outstanding.contains_key(&request_id) {
            return Some(SubsegmentState::Requested);
        }
        self.resolved.get(&request_id).copied()
    }

    pub fn purpose(&self, request_id: u32) -> Option<SegmentKind> {
        self.outstanding.get(&request_id).map(|o| o.purpose)
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().map(|o| o.deadline).min()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(id: u32) -> SubsegmentRequest {
        SubsegmentRequest {
            request_id: id,
            purpose: SegmentKind::Clipboard,
            width: 32,
            height: 32,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let s = SegmentState::default();
        let s = s.apply(Transition::Register).unwrap();
        assert_eq!(s, SegmentState::Preroll);
        let s = s.apply(Transition::Activate).unwrap();
        assert_eq!(s, SegmentState::Active);
        let s = s.apply(Transition::ResizeRequest).unwrap();
        assert_eq!(s, SegmentState::Resizing);
        let s = s.apply(Transition::ResizeAck).unwrap();
        assert_eq!(s, SegmentState::Active);
        let s = s.apply(Transition::Terminate).unwrap();
        assert!(s.is_dead());
    }

    #[test]
    fn test_dead_is_terminal() {
        let dead = SegmentState::Dead;
        assert!(matches!(
            dead.apply(Transition::Activate),
            Err(FrameLinkError::SegmentClosed)
        ));
        assert_eq!(dead.apply(Transition::Terminate).unwrap(), SegmentState::Dead);
        assert!(matches!(dead.ensure_open(), Err(FrameLinkError::SegmentClosed)));
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        assert!(matches!(
            SegmentState::Connecting.apply(Transition::Activate),
            Err(FrameLinkError::InvalidState { .. })
        ));
        assert!(SegmentState::Preroll.apply(Transition::ResizeRequest).is_err());
        assert!(SegmentState::Active.apply(Transition::ResizeAck).is_err());
    }

    #[test]
    fn test_preroll_reject_and_grow_failure_are_fatal() {
        assert!(SegmentState::Preroll.apply(Transition::Terminate).unwrap().is_dead());
        assert!(SegmentState::Resizing
            .apply(Transition::ResizeFailed)
            .unwrap()
            .is_dead());
        assert_eq!(
            SegmentState::Resizing.apply(Transition::ResizeRejected).unwrap(),
            SegmentState::Active
        );
    }

    #[test]
    fn test_broker_one_negotiation_at_a_time() {
        let mut broker = SubsegmentBroker::new(&TransportConfig::default());
        broker.submit(request(1)).unwrap();
        broker.submit(request(2)).unwrap();

        assert!(broker.next(true).is_none());
        assert_eq!(broker.next(false), Some(request(1)));
        assert!(broker.next(false).is_none());

        assert!(!broker.finish(2, true));
        assert!(broker.finish(1, true));
        assert_eq!(broker.live(), 1);
        assert_eq!(broker.next(false), Some(request(2)));
    }

    #[test]
    fn test_broker_rejects_beyond_cap_and_queue_bound() {
        let config = TransportConfig {
            max_subsegments: 2,
            max_pending_requests: 8,
            ..TransportConfig::default()
        };
        let mut broker = SubsegmentBroker::new(&config);
        broker.submit(request(1)).unwrap();
        broker.submit(request(2)).unwrap();
        assert_eq!(broker.submit(request(3)), Err(RejectReason::CapReached));

        let config = TransportConfig {
            max_subsegments: 8,
            max_pending_requests: 1,
            ..TransportConfig::default()
        };
        let mut broker = SubsegmentBroker::new(&config);
        broker.submit(request(1)).unwrap();
        assert_eq!(broker.submit(request(2)), Err(RejectReason::QueueFull));
        assert_eq!(broker.submit(request(1)), Err(RejectReason::Duplicate));
    }

    #[test]
    fn test_broker_validates_geometry() {
        let mut broker = SubsegmentBroker::new(&TransportConfig::default());
        let mut bad = request(1);
        bad.width = 0;
        assert_eq!(broker.submit(bad), Err(RejectReason::InvalidGeometry));
        bad.width = 100_000;
        assert_eq!(broker.submit(bad), Err(RejectReason::InvalidGeometry));
    }

    #[test]
    fn test_tracker_grant_is_idempotent() {
        let mut tracker = SubsegmentTracker::new(&TransportConfig::default());
        let now = Instant::now();
        let id = tracker.request(SegmentKind::Output, now);
        assert_eq!(tracker.state(id), Some(SubsegmentState::Requested));

        assert_eq!(tracker.on_grant(id, now), Answer::Attach);
        assert_eq!(tracker.on_grant(id, now), Answer::Ignore);
        assert_eq!(tracker.on_reject(id, now), Answer::Ignore);
        assert_eq!(tracker.state(id), Some(SubsegmentState::Granted));
    }

    #[test]
    fn test_tracker_ignores_late_answers() {
        let config = TransportConfig {
            subsegment_timeout: Duration::from_millis(50),
            ..TransportConfig::default()
        };
        let mut tracker = SubsegmentTracker::new(&config);
        let now = Instant::now();
        let id = tracker.request(SegmentKind::Clipboard, now);
        let other = tracker.request(SegmentKind::Clipboard, now + Duration::from_millis(40));

        let later = now + Duration::from_millis(60);
        assert_eq!(tracker.expire(later), vec![id]);
        assert_eq!(tracker.state(id), Some(SubsegmentState::Rejected));
        assert_eq!(tracker.on_grant(id, later), Answer::Ignore);
        assert_eq!(tracker.on_reject(other, later), Answer::Rejected);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_tracker_history_is_bounded() {
        let mut tracker = SubsegmentTracker::new(&TransportConfig::default());
        let now = Instant::now();
        let first = tracker.request(SegmentKind::Popup, now);
        tracker.on_reject(first, now);

        let mut last = first;
        for _ in 0..RESOLVED_HISTORY {
            last = tracker.request(SegmentKind::Popup, now);
            tracker.on_grant(last, now);
        }

        assert_eq!(tracker.resolved.len(), RESOLVED_HISTORY);
        assert_eq!(tracker.history.len(), RESOLVED_HISTORY);
        assert_eq!(tracker.state(first), None);
        assert_eq!(tracker.state(last), Some(SubsegmentState::Granted));
    }
}
