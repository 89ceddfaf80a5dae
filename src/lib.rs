//! FrameLink - Shared memory display transport
//!
//! A display server and its clients exchange video frames, audio buffers
//! and input/control events through per-client shared memory segments.
//!
//! # Architecture
//!
//! - **Owner (server)**: creates the segment, publishes its layout, runs the
//!   resize protocol and brokers subsegment requests
//! - **Peer (client)**: attaches, renders into the video region (or passes a
//!   buffer handle) and signals readiness
//!
//! Events travel through two lock-free rings inside the segment, one per
//! direction. File handles travel next to them over the connection socket.
//!
//! # Example
//!
//! ```no_run
//! use framelink::{Geometry, Segment, SegmentKind, TransportConfig};
//!
//! let config = TransportConfig::default();
//! let (mut server, mut client) = Segment::create_pair(&config, Geometry::new(640, 480))?;
//! client.register(SegmentKind::Application, "demo")?;
//! server.poll()?;
//! server.activate()?;
//! # Ok::<(), framelink::FrameLinkError>(())
//! ```

pub mod error;
pub mod config;
pub mod shm;
pub mod sem;
pub mod seqlock;
pub mod layout;
pub mod event;
pub mod ring;
pub mod descriptor;
pub mod queue;
pub mod state;
pub mod transfer;
pub mod server;
pub mod client;
pub mod clock;
pub mod connpoint;

pub use error::{FrameLinkError, Result};
pub use config::TransportConfig;
pub use layout::{Geometry, RegionLayout, SegmentHeader};
pub use event::{Event, ExternalEvent, HandleMeta, InputEvent, Label, SegmentKind, TargetEvent};
pub use queue::Delivered;
pub use state::{SegmentState, SubsegmentRequest, SubsegmentState};
pub use transfer::{
    AcceleratedOutput, BackingStore, BufferDescriptor, HandleExporter, MemfdExporter, SignalOutcome,
    TransferPath,
};
pub use server::{ClientStatus, HandleFrame, Segment, ServerClient};
pub use client::{Acquired, AttachSource, ClientSegment};
pub use clock::{FrameClock, MonotonicTicker};
pub use connpoint::{connect, connect_default, resolve_connpath, ConnectionPoint};
