//! Example Client (Producer)
//!
//! Connects to a listener, registers, renders a moving gradient and pushes
//! frames through the accelerated output. Optionally resizes once and asks
//! for a popup subsegment.

use clap::Parser;
use framelink::connpoint::{connect, resolve_connpath};
use framelink::{
    AcceleratedOutput, Event, ExternalEvent, FrameLinkError, Geometry, MemfdExporter, SegmentKind, SegmentState, SignalOutcome,
    TargetEvent, TransportConfig,
};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Push frames to a framelink listener")]
struct Args {
    /// Connection point name or absolute socket path
    #[arg(default_value = "framelink_demo")]
    name: String,

    #[arg(long)]
    key: Option<String>,

    /// Number of frames to send
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Resize to WIDTHxHEIGHT after the first frame
    #[arg(long, value_parser = parse_geometry)]
    resize: Option<Geometry>,

    /// Ask for a popup subsegment
    #[arg(long)]
    popup: bool,

    /// Ask the listener for a StepFrame every RATE ticks
    #[arg(long)]
    clock: Option<u32>,
}

fn parse_geometry(s: &str) -> Result<Geometry, String> {
    let (w, h) = s.split_once('x').ok_or("expected WIDTHxHEIGHT")?;
    let width = w.parse().map_err(|e| format!("width: {}", e))?;
    let height = h.parse().map_err(|e| format!("height: {}", e))?;
    Ok(Geometry::new(width, height))
}

fn run(args: Args) -> framelink::Result<()> {
    let config = TransportConfig::from_env();
    let mut client = connect(&resolve_connpath(&args.name)?, args.key.as_deref(), &config)?;
    client.register(SegmentKind::Application, "framelink demo")?;

    while client.state() != SegmentState::Active {
        if client.wait(Some(Duration::from_secs(5)))?.is_none() {
            return Err(FrameLinkError::InvalidState {
                op: "wait for activation",
                state: format!("{:?}", client.state()),
            });
        }
    }
    info!(segment = client.name(), geometry = ?client.geometry(), "active");

    if let Some(rate) = args.clock {
        client.enqueue(Event::External(ExternalEvent::ClockRequest { rate, once: false }))?;
    }

    if args.popup {
        let request_id = client.request_subsegment(SegmentKind::Popup, 128, 64)?;
        let acquired = client.acquire_loop(request_id, Duration::from_secs(2))?;
        match acquired.answer {
            Some(answer) if matches!(answer.event, Event::Target(TargetEvent::NewSegment { .. })) => {
                let popup = client.attach_child(answer)?;
                info!(child = popup.name(), geometry = ?popup.geometry(), "popup attached");
            }
            Some(_) => info!("popup refused"),
            None => warn!("popup request timed out"),
        }
    }

    let mut output = AcceleratedOutput::new(&client, MemfdExporter::new())?;
    let mut sent = 0;
    while sent < args.frames {
        while let Some(delivered) = client.poll()? {
            info!(event = %delivered.event, "server event");
        }

        let shade = (sent % 256) as u32;
        output.back_buffer().fill(0xff00_0000 | shade << 16 | (255 - shade) << 8);
        match output.signal(&mut client) {
            Ok(SignalOutcome::Presented(path)) => {
                sent += 1;
                if sent == 1 {
                    info!(?path, "first frame presented");
                    if let Some(geometry) = args.resize {
                        client.request_resize(geometry)?;
                    }
                }
            }
            Ok(SignalOutcome::Reallocated) => info!(geometry = ?client.geometry(), "resized"),
            Err(FrameLinkError::FrameInFlight(_)) | Err(FrameLinkError::ResizePending) => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }

    info!(frames = sent, readback = client.passing().is_broken(), "done");
    client.terminate()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("[Client] {}", e);
        std::process::exit(1);
    }
}
