//! Example Listener (Owner/Server)
//!
//! Binds a connection point, activates every client that registers, answers
//! subsegment requests and logs the frames it receives.

use clap::Parser;
use framelink::clock::{MonotonicTicker, DEFAULT_TICK};
use framelink::{
    ConnectionPoint, Event, ExternalEvent, FrameLinkError, Geometry, Segment, SegmentState, TransportConfig,
};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Serve framelink segments on a connection point")]
struct Args {
    /// Connection point name or absolute socket path
    #[arg(default_value = "framelink_demo")]
    name: String,

    /// Authentication key clients must present
    #[arg(long)]
    key: Option<String>,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Refuse all subsegment requests
    #[arg(long)]
    no_subsegments: bool,

    /// Pace clients that ask for a clock
    #[arg(long)]
    autoclock: bool,
}

struct Client {
    segment: Segment,
    children: Vec<Segment>,
    frames: u64,
    since: Instant,
}

impl Client {
    fn new(segment: Segment) -> Self {
        Self {
            segment,
            children: Vec::new(),
            frames: 0,
            since: Instant::now(),
        }
    }

    /// Run one poll round; `Err` means the client is gone
    fn service(&mut self, ticks: u32) -> framelink::Result<()> {
        let status = self.segment.poll()?;
        if let Some(token) = self.segment.take_auth_token()? {
            info!(segment = self.segment.name(), token, "client published an auth token");
        }
        self.segment.tick(ticks)?;

        while let Some(delivered) = self.segment.dequeue_event()? {
            match delivered.event {
                Event::External(ExternalEvent::Register { kind, ref title }) => {
                    info!(segment = self.segment.name(), ?kind, %title, "client registered");
                    if self.segment.state() == SegmentState::Preroll {
                        self.segment.activate()?;
                    }
                }
                Event::External(ExternalEvent::ResizeRequest { width, height }) => {
                    info!(segment = self.segment.name(), width, height, "client asked for a resize");
                }
                ref other => info!(segment = self.segment.name(), event = %other, "event"),
            }
        }

        if let Some(request) = self.segment.next_subsegment_request() {
            match self.segment.grant_subsegment(&request) {
                Ok(child) => self.children.push(child),
                Err(e) => {
                    warn!(error = %e, "grant failed, rejecting");
                    self.segment.reject_subsegment(&request)?;
                }
            }
        }
        self.children.retain_mut(|child| child.poll().is_ok());

        if status.video_ready {
            if let Some(frame) = self.segment.take_handle_frame() {
                self.segment.ack_buffer(frame.frame)?;
            } else if self.segment.video_frame()?.is_some() {
                self.segment.release_video()?;
            }
            self.frames += 1;
        }
        if status.audio_ready {
            self.segment.release_audio()?;
        }

        if self.since.elapsed() >= Duration::from_secs(1) {
            let geometry = self.segment.geometry();
            info!(
                segment = self.segment.name(),
                fps = self.frames as f64 / self.since.elapsed().as_secs_f64(),
                width = geometry.width,
                height = geometry.height,
                subsegments = self.children.len(),
                "frame rate"
            );
            self.frames = 0;
            self.since = Instant::now();
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = TransportConfig::from_env();
    if args.no_subsegments {
        config.max_subsegments = 0;
    }
    config.autoclock |= args.autoclock;

    let mut point = match ConnectionPoint::bind(
        &args.name,
        args.key.as_deref(),
        &config,
        Geometry::new(args.width, args.height),
    ) {
        Ok(point) => point,
        Err(e) => {
            eprintln!("[Listener] Failed to bind: {}", e);
            std::process::exit(1);
        }
    };
    info!(path = %point.path().display(), "waiting for clients (Ctrl+C to quit)");

    let mut clients: Vec<Client> = Vec::new();
    let mut ticker = MonotonicTicker::new(DEFAULT_TICK);
    loop {
        let ticks = ticker.ticks();
        match point.accept_timeout(Some(Duration::from_millis(5))) {
            Ok(Some(segment)) => clients.push(Client::new(segment)),
            Ok(None) => {}
            Err(FrameLinkError::AuthRejected) => warn!("rejected a client with the wrong key"),
            Err(e) => warn!(error = %e, "accept failed"),
        }

        clients.retain_mut(|client| match client.service(ticks) {
            Ok(()) => true,
            Err(e) => {
                info!(segment = client.segment.name(), reason = %e, "client gone");
                false
            }
        });
    }
}
