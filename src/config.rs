//! Transport configuration

use std::time::Duration;

/// Default number of event slots per ring direction
const DEFAULT_RING_CAPACITY: usize = 64;

/// Default audio buffer size (64KB)
const DEFAULT_AUDIO_BUFFER: usize = 64 * 1024;

/// Largest accepted dimension on either axis
const DEFAULT_MAX_DIMENSION: u32 = 8192;

/// Transport configuration
///
/// Fixed at segment creation: ring capacity and the audio buffer size are
/// part of the published layout and never change during a resize.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Number of event slots per ring (rounded up to a power of two)
    pub ring_capacity: usize,
    /// Size of the audio region in bytes
    pub audio_buffer_size: usize,
    /// Upper bound for width in resize and subsegment requests
    pub max_width: u32,
    /// Upper bound for height in resize and subsegment requests
    pub max_height: u32,
    /// Maximum number of live subsegments per primary segment
    pub max_subsegments: usize,
    /// Subsegment requests that may wait while the owner is busy
    pub max_pending_requests: usize,
    /// Time a handle frame may stay unacknowledged before passing is marked broken
    pub handle_ack_timeout: Duration,
    /// Requester-side deadline for a subsegment answer
    pub subsegment_timeout: Duration,
    /// Granularity of doorbell waits
    pub doorbell_slice: Duration,
    /// Serialize producers on one side with a lock
    pub thread_safe_queue: bool,
    /// Start every segment on the readback path
    pub disable_handle_passing: bool,
    /// Owners consume clock requests and pace clients through `Segment::tick`
    pub autoclock: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            audio_buffer_size: DEFAULT_AUDIO_BUFFER,
            max_width: DEFAULT_MAX_DIMENSION,
            max_height: DEFAULT_MAX_DIMENSION,
            max_subsegments: 8,
            max_pending_requests: 4,
            handle_ack_timeout: Duration::from_millis(500),
            subsegment_timeout: Duration::from_secs(2),
            doorbell_slice: Duration::from_millis(10),
            thread_safe_queue: false,
            disable_handle_passing: false,
            autoclock: false,
        }
    }
}

impl TransportConfig {
    /// Default configuration with `FRAMELINK_*` environment overrides applied
    ///
    /// Recognized variables: `FRAMELINK_RING_CAPACITY`, `FRAMELINK_AUDIO_BUFFER`,
    /// `FRAMELINK_MAX_SUBSEGMENTS`, `FRAMELINK_THREADSAFE_QUEUE`,
    /// `FRAMELINK_NO_FDPASS` and `FRAMELINK_AUTOCLOCK`. Unparseable values
    /// are ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(v) = parse("FRAMELINK_RING_CAPACITY") {
            self.ring_capacity = v;
        }
        if let Some(v) = parse("FRAMELINK_AUDIO_BUFFER") {
            self.audio_buffer_size = v;
        }
        if let Some(v) = parse("FRAMELINK_MAX_SUBSEGMENTS") {
            self.max_subsegments = v;
        }
        if lookup("FRAMELINK_THREADSAFE_QUEUE").is_some() {
            self.thread_safe_queue = true;
        }
        // presence is enough, matching the usual NO_* switch convention
        if lookup("FRAMELINK_NO_FDPASS").is_some() {
            self.disable_handle_passing = true;
        }
        if lookup("FRAMELINK_AUTOCLOCK").is_some() {
            self.autoclock = true;
        }
        self
    }

    /// Ring capacity as stored in the layout
    pub fn effective_ring_capacity(&self) -> usize {
        self.ring_capacity.max(2).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FRAMELINK_RING_CAPACITY", "100"),
            ("FRAMELINK_NO_FDPASS", "1"),
            ("FRAMELINK_AUTOCLOCK", ""),
            ("FRAMELINK_MAX_SUBSEGMENTS", "not a number"),
        ]
        .into_iter()
        .collect();

        let config = TransportConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.ring_capacity, 100);
        assert_eq!(config.effective_ring_capacity(), 128);
        assert!(config.disable_handle_passing);
        assert!(config.autoclock);
        assert!(!config.thread_safe_queue);
        assert_eq!(config.max_subsegments, 8);
    }
}
