//! Event model
//!
//! Events travel through the rings as fixed 64-byte [`RawEvent`] records and
//! are decoded into a closed enum per category. Large data never travels
//! inline; an event that needs a buffer carries the descriptor flag and the
//! file handle follows on the connection socket.

use std::fmt;

/// Maximum label length in bytes
pub const LABEL_LEN: usize = 24;

/// Record carries an out-of-band file handle
pub const FLAG_DESCRIPTOR: u16 = 1;

mod category {
    pub const INPUT: u8 = 1;
    pub const TARGET: u8 = 2;
    pub const EXTERNAL: u8 = 4;
}

mod input_kind {
    pub const KEY: u8 = 1;
    pub const POINTER_MOTION: u8 = 2;
    pub const POINTER_BUTTON: u8 = 3;
    pub const ANALOG: u8 = 4;
    pub const TOUCH: u8 = 5;
}

mod target_kind {
    pub const ACTIVATE: u8 = 1;
    pub const TERMINATE: u8 = 2;
    pub const DISPLAY_HINT: u8 = 3;
    pub const RESIZE_ACK: u8 = 4;
    pub const RESIZE_REJECTED: u8 = 5;
    pub const NEW_SEGMENT: u8 = 6;
    pub const REQUEST_FAIL: u8 = 7;
    pub const BUFFER_ACK: u8 = 8;
    pub const BUFFER_FAIL: u8 = 9;
    pub const STEP_FRAME: u8 = 10;
    pub const MESSAGE: u8 = 11;
}

mod external_kind {
    pub const REGISTER: u8 = 1;
    pub const RESIZE_REQUEST: u8 = 2;
    pub const SEGMENT_REQUEST: u8 = 3;
    pub const BUFFER_STREAM: u8 = 4;
    pub const CLOCK_REQUEST: u8 = 5;
    pub const MESSAGE: u8 = 6;
    pub const TERMINATE: u8 = 7;
}

/// Wire record stored in ring slots
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub category: u8,
    pub kind: u8,
    pub flags: u16,
    pub id: u32,
    pub ints: [i64; 4],
    pub label: [u8; LABEL_LEN],
}

const _: () = assert!(std::mem::size_of::<RawEvent>() == 64);

/// Declared purpose of a segment or subsegment
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    #[default]
    Unknown = 0,
    Application = 1,
    Terminal = 2,
    Emulator = 3,
    Browser = 4,
    Compositor = 5,
    Clipboard = 6,
    Output = 7,
    Accessibility = 8,
    Debug = 9,
    Cursor = 10,
    Popup = 11,
}

impl SegmentKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SegmentKind::Application,
            2 => SegmentKind::Terminal,
            3 => SegmentKind::Emulator,
            4 => SegmentKind::Browser,
            5 => SegmentKind::Compositor,
            6 => SegmentKind::Clipboard,
            7 => SegmentKind::Output,
            8 => SegmentKind::Accessibility,
            9 => SegmentKind::Debug,
            10 => SegmentKind::Cursor,
            11 => SegmentKind::Popup,
            _ => SegmentKind::Unknown,
        }
    }
}

/// Short UTF-8 string that fits inline in a record
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Label(String);

impl Label {
    /// Build a label, truncating at a char boundary to [`LABEL_LEN`] bytes
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(LABEL_LEN);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        Label(s[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_bytes(&self) -> [u8; LABEL_LEN] {
        let mut out = [0u8; LABEL_LEN];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; LABEL_LEN]) -> Self {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        Label(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Format metadata attached to a passed buffer handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleMeta {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub planes: u32,
}

/// Input delivered from the server to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    Key {
        keysym: u32,
        scancode: u16,
        modifiers: u16,
        pressed: bool,
    },
    PointerMotion { x: i32, y: i32, relative: bool },
    PointerButton { button: u8, pressed: bool },
    Analog { device: u16, axis: u8, value: i32 },
    Touch { id: u16, x: i32, y: i32 },
}

/// Control events from the owner to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetEvent {
    Activate,
    Terminate,
    DisplayHint { width: u32, height: u32 },
    ResizeAck { width: u32, height: u32, generation: u64 },
    ResizeRejected { width: u32, height: u32 },
    /// Subsegment grant; the child's connection socket travels with it
    NewSegment {
        request_id: u32,
        purpose: SegmentKind,
        width: u32,
        height: u32,
        name: Label,
    },
    RequestFail { request_id: u32 },
    BufferAck { frame: u64 },
    BufferFail,
    StepFrame { frames: u32 },
    Message(Label),
}

/// Events originated by the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalEvent {
    Register { kind: SegmentKind, title: Label },
    ResizeRequest { width: u32, height: u32 },
    SegmentRequest {
        request_id: u32,
        purpose: SegmentKind,
        width: u32,
        height: u32,
    },
    /// Handle-passed video frame; the buffer handle travels with it
    BufferStream { frame: u64, meta: HandleMeta },
    ClockRequest { rate: u32, once: bool },
    Message(Label),
    Terminate,
}

/// A decoded event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Input(InputEvent),
    Target(TargetEvent),
    External(ExternalEvent),
}

fn pack(lo: u32, hi: u32) -> i64 {
    ((hi as u64) << 32 | lo as u64) as i64
}

fn unpack(v: i64) -> (u32, u32) {
    let v = v as u64;
    (v as u32, (v >> 32) as u32)
}

impl Event {
    /// True if a file handle travels alongside this event
    pub fn carries_descriptor(&self) -> bool {
        matches!(
            self,
            Event::Target(TargetEvent::NewSegment { .. })
                | Event::External(ExternalEvent::BufferStream { .. })
        )
    }

    /// Encode into the fixed wire record
    pub fn encode(&self) -> RawEvent {
        let mut raw = RawEvent::default();
        if self.carries_descriptor() {
            raw.flags |= FLAG_DESCRIPTOR;
        }

        match self {
            Event::Input(ev) => {
                raw.category = category::INPUT;
                match *ev {
                    InputEvent::Key {
                        keysym,
                        scancode,
                        modifiers,
                        pressed,
                    } => {
                        raw.kind = input_kind::KEY;
                        raw.ints = [keysym as i64, scancode as i64, modifiers as i64, pressed as i64];
                    }
                    InputEvent::PointerMotion { x, y, relative } => {
                        raw.kind = input_kind::POINTER_MOTION;
                        raw.ints = [x as i64, y as i64, relative as i64, 0];
                    }
                    InputEvent::PointerButton { button, pressed } => {
                        raw.kind = input_kind::POINTER_BUTTON;
                        raw.ints = [button as i64, pressed as i64, 0, 0];
                    }
                    InputEvent::Analog {
                        device,
                        axis,
                        value,
                    } => {
                        raw.kind = input_kind::ANALOG;
                        raw.ints = [device as i64, axis as i64, value as i64, 0];
                    }
                    InputEvent::Touch { id, x, y } => {
                        raw.kind = input_kind::TOUCH;
                        raw.ints = [id as i64, x as i64, y as i64, 0];
                    }
                }
            }
            Event::Target(ev) => {
                raw.category = category::TARGET;
                match ev {
                    TargetEvent::Activate => raw.kind = target_kind::ACTIVATE,
                    TargetEvent::Terminate => raw.kind = target_kind::TERMINATE,
                    TargetEvent::DisplayHint { width, height } => {
                        raw.kind = target_kind::DISPLAY_HINT;
                        raw.ints[0] = pack(*width, *height);
                    }
                    TargetEvent::ResizeAck {
                        width,
                        height,
                        generation,
                    } => {
                        raw.kind = target_kind::RESIZE_ACK;
                        raw.ints[0] = pack(*width, *height);
                        raw.ints[1] = *generation as i64;
                    }
                    TargetEvent::ResizeRejected { width, height } => {
                        raw.kind = target_kind::RESIZE_REJECTED;
                        raw.ints[0] = pack(*width, *height);
                    }
                    TargetEvent::NewSegment {
                        request_id,
                        purpose,
                        width,
                        height,
                        name,
                    } => {
                        raw.kind = target_kind::NEW_SEGMENT;
                        raw.id = *request_id;
                        raw.ints[0] = pack(*width, *height);
                        raw.ints[1] = *purpose as i64;
                        raw.label = name.to_bytes();
                    }
                    TargetEvent::RequestFail { request_id } => {
                        raw.kind = target_kind::REQUEST_FAIL;
                        raw.id = *request_id;
                    }
                    TargetEvent::BufferAck { frame } => {
                        raw.kind = target_kind::BUFFER_ACK;
                        raw.ints[0] = *frame as i64;
                    }
                    TargetEvent::BufferFail => raw.kind = target_kind::BUFFER_FAIL,
                    TargetEvent::StepFrame { frames } => {
                        raw.kind = target_kind::STEP_FRAME;
                        raw.ints[0] = *frames as i64;
                    }
                    TargetEvent::Message(text) => {
                        raw.kind = target_kind::MESSAGE;
                        raw.label = text.to_bytes();
                    }
                }
            }
            Event::External(ev) => {
                raw.category = category::EXTERNAL;
                match ev {
                    ExternalEvent::Register { kind, title } => {
                        raw.kind = external_kind::REGISTER;
                        raw.ints[0] = *kind as i64;
                        raw.label = title.to_bytes();
                    }
                    ExternalEvent::ResizeRequest { width, height } => {
                        raw.kind = external_kind::RESIZE_REQUEST;
                        raw.ints[0] = pack(*width, *height);
                    }
                    ExternalEvent::SegmentRequest {
                        request_id,
                        purpose,
                        width,
                        height,
                    } => {
                        raw.kind = external_kind::SEGMENT_REQUEST;
                        raw.id = *request_id;
                        raw.ints[0] = pack(*width, *height);
                        raw.ints[1] = *purpose as i64;
                    }
                    ExternalEvent::BufferStream { frame, meta } => {
                        raw.kind = external_kind::BUFFER_STREAM;
                        raw.ints = [
                            *frame as i64,
                            pack(meta.width, meta.height),
                            pack(meta.stride, meta.fourcc),
                            meta.planes as i64,
                        ];
                    }
                    ExternalEvent::ClockRequest { rate, once } => {
                        raw.kind = external_kind::CLOCK_REQUEST;
                        raw.ints = [*rate as i64, *once as i64, 0, 0];
                    }
                    ExternalEvent::Message(text) => {
                        raw.kind = external_kind::MESSAGE;
                        raw.label = text.to_bytes();
                    }
                    ExternalEvent::Terminate => raw.kind = external_kind::TERMINATE,
                }
            }
        }

        raw
    }

    /// Decode a wire record; `None` for unknown category or kind
    pub fn decode(raw: &RawEvent) -> Option<Event> {
        let ints = raw.ints;
        let event = match raw.category {
            category::INPUT => Event::Input(match raw.kind {
                input_kind::KEY => InputEvent::Key {
                    keysym: ints[0] as u32,
                    scancode: ints[1] as u16,
                    modifiers: ints[2] as u16,
                    pressed: ints[3] != 0,
                },
                input_kind::POINTER_MOTION => InputEvent::PointerMotion {
                    x: ints[0] as i32,
                    y: ints[1] as i32,
                    relative: ints[2] != 0,
                },
                input_kind::POINTER_BUTTON => InputEvent::PointerButton {
                    button: ints[0] as u8,
                    pressed: ints[1] != 0,
                },
                input_kind::ANALOG => InputEvent::Analog {
                    device: ints[0] as u16,
                    axis: ints[1] as u8,
                    value: ints[2] as i32,
                },
                input_kind::TOUCH => InputEvent::Touch {
                    id: ints[0] as u16,
                    x: ints[1] as i32,
                    y: ints[2] as i32,
                },
                _ => return None,
            }),
            category::TARGET => Event::Target(match raw.kind {
                target_kind::ACTIVATE => TargetEvent::Activate,
                target_kind::TERMINATE => TargetEvent::Terminate,
                target_kind::DISPLAY_HINT => {
                    let (width, height) = unpack(ints[0]);
                    TargetEvent::DisplayHint { width, height }
                }
                target_kind::RESIZE_ACK => {
                    let (width, height) = unpack(ints[0]);
                    TargetEvent::ResizeAck {
                        width,
                        height,
                        generation: ints[1] as u64,
                    }
                }
                target_kind::RESIZE_REJECTED => {
                    let (width, height) = unpack(ints[0]);
                    TargetEvent::ResizeRejected { width, height }
                }
                target_kind::NEW_SEGMENT => {
                    let (width, height) = unpack(ints[0]);
                    TargetEvent::NewSegment {
                        request_id: raw.id,
                        purpose: SegmentKind::from_u8(ints[1] as u8),
                        width,
                        height,
                        name: Label::from_bytes(&raw.label),
                    }
                }
                target_kind::REQUEST_FAIL => TargetEvent::RequestFail { request_id: raw.id },
                target_kind::BUFFER_ACK => TargetEvent::BufferAck {
                    frame: ints[0] as u64,
                },
                target_kind::BUFFER_FAIL => TargetEvent::BufferFail,
                target_kind::STEP_FRAME => TargetEvent::StepFrame {
                    frames: ints[0] as u32,
                },
                target_kind::MESSAGE => TargetEvent::Message(Label::from_bytes(&raw.label)),
                _ => return None,
            }),
            category::EXTERNAL => Event::External(match raw.kind {
                external_kind::REGISTER => ExternalEvent::Register {
                    kind: SegmentKind::from_u8(ints[0] as u8),
                    title: Label::from_bytes(&raw.label),
                },
                external_kind::RESIZE_REQUEST => {
                    let (width, height) = unpack(ints[0]);
                    ExternalEvent::ResizeRequest { width, height }
                }
                external_kind::SEGMENT_REQUEST => {
                    let (width, height) = unpack(ints[0]);
                    ExternalEvent::SegmentRequest {
                        request_id: raw.id,
                        purpose: SegmentKind::from_u8(ints[1] as u8),
                        width,
                        height,
                    }
                }
                external_kind::BUFFER_STREAM => {
                    let (width, height) = unpack(ints[1]);
                    let (stride, fourcc) = unpack(ints[2]);
                    ExternalEvent::BufferStream {
                        frame: ints[0] as u64,
                        meta: HandleMeta {
                            width,
                            height,
                            stride,
                            fourcc,
                            planes: ints[3] as u32,
                        },
                    }
                }
                external_kind::CLOCK_REQUEST => ExternalEvent::ClockRequest {
                    rate: ints[0] as u32,
                    once: ints[1] != 0,
                },
                external_kind::MESSAGE => ExternalEvent::Message(Label::from_bytes(&raw.label)),
                external_kind::TERMINATE => ExternalEvent::Terminate,
                _ => return None,
            }),
            _ => return None,
        };

        // the flag must agree with the kind or the fd stream desynchronizes
        if event.carries_descriptor() != (raw.flags & FLAG_DESCRIPTOR != 0) {
            return None;
        }
        Some(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Input(ev) => write!(f, "INPUT:{:?}", ev),
            Event::Target(ev) => match ev {
                TargetEvent::NewSegment {
                    request_id,
                    purpose,
                    width,
                    height,
                    name,
                } => write!(
                    f,
                    "TARGET:NewSegment(req={}, {:?}, {}x{}, '{}', +fd)",
                    request_id, purpose, width, height, name
                ),
                other => write!(f, "TARGET:{:?}", other),
            },
            Event::External(ev) => match ev {
                ExternalEvent::BufferStream { frame, meta } => write!(
                    f,
                    "EXTERNAL:BufferStream(frame={}, {}x{}, stride={}, fourcc=0x{:08x}, +fd)",
                    frame, meta.width, meta.height, meta.stride, meta.fourcc
                ),
                other => write!(f, "EXTERNAL:{:?}", other),
            },
        }
    }
}
