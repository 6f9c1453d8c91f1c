//! Common types shared between tasks

use arrayvec::ArrayVec;
use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

/// Maximum number of image streams a single device will collate
pub const MAX_STREAMS: usize = 4;
/// Standard timeout for blocking ops
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Strictly monotonic nanosecond time source, local to this process.
///
/// Every timestamp the protocol exchanges is measured against this ticker (or
/// the leader's, after conversion). There is deliberately no tie to wall-clock
/// time, the offset estimator only ever reasons about differences.
#[derive(Debug)]
pub struct Ticker {
    anchor: Instant,
}

impl Ticker {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// Nanoseconds since the process anchor
    pub fn now_ns(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }
}

/// Get the process-wide ticker, every task on a device shares this instance
pub fn ticker() -> &'static Ticker {
    static TICKER: OnceLock<Ticker> = OnceLock::new();
    TICKER.get_or_init(Ticker::new)
}

/// A set of image stream indices, stored as a bitmask as stream indices are
/// small (< [`MAX_STREAMS`])
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSet(u8);

impl StreamSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, stream: usize) {
        debug_assert!(stream < MAX_STREAMS);
        self.0 |= 1 << stream;
    }

    pub fn contains(&self, stream: usize) -> bool {
        self.0 & (1 << stream) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_STREAMS).filter(|i| self.contains(*i))
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }
}

impl FromIterator<usize> for StreamSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = Self::empty();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

/// What a capture request is for, read by downstream consumers to decide
/// whether the resulting frame is real data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserTag {
    /// An ordinary frame (preview or still)
    #[default]
    Capture,
    /// A phase-alignment injection frame, discarded before persistence
    Inject,
}

/// Identifies which image streams a capture request will write to.
///
/// `targets` must be non-empty for any request whose frames are expected to
/// flow through the collator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureRequestTag {
    pub targets: StreamSet,
    pub user_tag: UserTag,
}

impl CaptureRequestTag {
    /// An ordinary capture touching every configured stream
    pub fn capture_all(n_streams: usize) -> Self {
        Self {
            targets: (0..n_streams).collect(),
            user_tag: UserTag::Capture,
        }
    }
}

/// Per-frame record the camera collaborator emits alongside the image buffers
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataRecord {
    pub tag: CaptureRequestTag,
    /// Start-of-exposure time in the local ticker domain
    pub sensor_timestamp_ns: u64,
    pub sequence_id: u64,
    pub frame_duration_ns: u64,
}

/// An image buffer handle, tagged with the same sensor timestamp as its
/// metadata record. The payload bytes are opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct ImageBuffer {
    pub stream: usize,
    pub sensor_timestamp_ns: u64,
    pub bytes: Vec<u8>,
}

/// A metadata record paired with the image buffers that share its sensor
/// timestamp, one slot per configured stream.
///
/// For every `i` in `metadata.tag.targets`, either `images[i]` is a live
/// buffer with the exact same timestamp or `i` is in `dropped`.
#[derive(Debug, Clone, Default)]
pub struct MatchedBundle {
    pub metadata: MetadataRecord,
    pub images: ArrayVec<Option<ImageBuffer>, MAX_STREAMS>,
    /// Streams whose image never arrived (the camera shed it under pressure)
    pub dropped: StreamSet,
}

impl MatchedBundle {
    pub fn sensor_timestamp_ns(&self) -> u64 {
        self.metadata.sensor_timestamp_ns
    }

    pub fn is_injection(&self) -> bool {
        self.metadata.tag.user_tag == UserTag::Inject
    }
}

/// The camera hardware seam. The host provides the real implementation; the
/// core only ever asks it to queue a single capture with explicit exposure
/// and sensitivity.
pub trait CameraControl: Send + Sync {
    fn request_capture(
        &self,
        tag: CaptureRequestTag,
        exposure_ns: u64,
        sensitivity: i32,
    ) -> eyre::Result<()>;
}

/// Stand-in camera seam for running the core without a host integration,
/// capture requests are logged and otherwise dropped
pub struct LogCamera;

impl CameraControl for LogCamera {
    fn request_capture(
        &self,
        tag: CaptureRequestTag,
        exposure_ns: u64,
        sensitivity: i32,
    ) -> eyre::Result<()> {
        tracing::debug!(?tag, exposure_ns, sensitivity, "Capture requested");
        Ok(())
    }
}
