//! Pairing asynchronously arriving image buffers with their metadata records
//!
//! Metadata is the master: the camera emits a metadata record for every
//! sensor frame, while an image stream may shed frames under memory pressure.
//! Timestamp inequality against a stream's queue head is therefore the sole
//! diagnostic for which side dropped: a stale image head lost its metadata
//! (release it), a future image head means this metadata's image never
//! arrived (record the drop and move on).

use crate::common::{ImageBuffer, MatchedBundle, MetadataRecord, StreamSet, MAX_STREAMS};
use std::{
    collections::VecDeque,
    sync::{mpsc::SyncSender, Mutex},
};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("collator is closed")]
    Closed,
    #[error("stream {0} is at its outstanding-buffer limit")]
    Backpressure(usize),
    #[error("stream index {0} is not configured")]
    BadStream(usize),
    #[error("metadata record carries no target streams")]
    NoTargets,
    #[error("bundle sink is not registered or disconnected")]
    SinkGone,
}

/// Drop accounting, scraped by the monitoring task
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Bundles emitted
    pub matched: u64,
    /// Per-metadata target slots whose image never arrived
    pub dropped_images: u64,
    /// Image buffers released because their metadata never arrived
    pub orphaned_images: u64,
}

struct Inner {
    meta: VecDeque<MetadataRecord>,
    images: Vec<VecDeque<ImageBuffer>>,
    acquired: Vec<usize>,
    sink: Option<SyncSender<MatchedBundle>>,
    stats: Stats,
    closed: bool,
}

/// The image–metadata synchronizer: one FIFO per configured image stream,
/// one metadata FIFO, and a sweep that drains them into [`MatchedBundle`]s.
///
/// All state sits behind a single mutex and every sweep holds it, so output
/// order is monotonic in sensor timestamp. The registered sink is pushed
/// under that lock: the sink's consumer must never call back into the
/// collator (buffer release happens further downstream, after persistence).
pub struct Collator {
    max_outstanding: Vec<usize>,
    inner: Mutex<Inner>,
}

impl Collator {
    /// One entry in `max_outstanding` per stream, bounding how many of that
    /// stream's buffers may be held unreleased at once
    pub fn new(max_outstanding: &[usize]) -> Self {
        let n = max_outstanding.len();
        assert!(
            n <= MAX_STREAMS,
            "at most {MAX_STREAMS} streams are supported"
        );
        Self {
            max_outstanding: max_outstanding.to_vec(),
            inner: Mutex::new(Inner {
                meta: VecDeque::new(),
                images: (0..n).map(|_| VecDeque::new()).collect(),
                acquired: vec![0; n],
                sink: None,
                stats: Stats::default(),
                closed: false,
            }),
        }
    }

    pub fn n_streams(&self) -> usize {
        self.max_outstanding.len()
    }

    /// Where matched bundles go. Replaces any previous sink.
    pub fn register_sink(&self, sink: SyncSender<MatchedBundle>) {
        self.inner.lock().unwrap().sink = Some(sink);
    }

    /// Camera ingress for a per-frame metadata record
    pub fn submit_metadata(&self, m: MetadataRecord) -> Result<(), Error> {
        let targets = m.tag.targets;
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        if let Some(bad) = targets.iter().find(|i| *i >= self.n_streams()) {
            return Err(Error::BadStream(bad));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.meta.push_back(m);
        self.sweep(&mut inner)
    }

    /// Camera ingress for an image buffer on stream `i`.
    ///
    /// Back-pressure is rejection, not blocking: when the stream is at its
    /// outstanding limit the buffer is refused and the producer must drop it.
    pub fn submit_image(&self, i: usize, buf: ImageBuffer) -> Result<(), Error> {
        if i >= self.n_streams() {
            return Err(Error::BadStream(i));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.acquired[i] >= self.max_outstanding[i] {
            return Err(Error::Backpressure(i));
        }
        inner.acquired[i] += 1;
        inner.images[i].push_back(buf);
        self.sweep(&mut inner)
    }

    /// The consumer has let go of one buffer from stream `i`
    pub fn release(&self, i: usize) {
        let mut inner = self.inner.lock().unwrap();
        // Underflow is a programming error in the consumer, abort loudly
        assert!(
            inner.acquired[i] > 0,
            "release on stream {i} with no outstanding buffers"
        );
        inner.acquired[i] -= 1;
    }

    /// Release every live buffer in a bundle the consumer is done with
    pub fn release_bundle(&self, bundle: &MatchedBundle) {
        for image in bundle.images.iter().flatten() {
            self.release(image.stream);
        }
    }

    /// Outstanding (acquired but unreleased) buffers on stream `i`
    pub fn outstanding(&self, i: usize) -> usize {
        self.inner.lock().unwrap().acquired[i]
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().unwrap().stats
    }

    /// Drop everything still queued and fail all subsequent submissions
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.meta.clear();
        for i in 0..self.max_outstanding.len() {
            let queued = inner.images[i].len();
            inner.images[i].clear();
            inner.acquired[i] -= queued;
        }
        info!("Collator closed");
    }

    /// Drain as many head metadata records as current arrivals allow.
    ///
    /// Post-condition: the head of the metadata queue (if any) is missing at
    /// least one of its target images.
    fn sweep(&self, inner: &mut Inner) -> Result<(), Error> {
        let sink = inner.sink.clone().ok_or(Error::SinkGone)?;
        'meta: while let Some(m) = inner.meta.front().copied() {
            let targets = m.tag.targets;
            let ts_m = m.sensor_timestamp_ns;

            // Re-peek from scratch each time an orphan is shed, the new head
            // of that stream needs reclassifying
            let (images, dropped) = loop {
                for i in targets.iter() {
                    if inner.images[i].is_empty() {
                        // Await more arrivals; nothing behind this metadata
                        // can match before it does
                        break 'meta;
                    }
                }
                let mut shed_orphan = false;
                for i in targets.iter() {
                    while inner.images[i]
                        .front()
                        .is_some_and(|h| h.sensor_timestamp_ns < ts_m)
                    {
                        // This buffer's metadata was dropped upstream of us
                        let orphan = inner.images[i].pop_front().unwrap();
                        inner.acquired[i] -= 1;
                        inner.stats.orphaned_images += 1;
                        debug!(
                            stream = i,
                            sensor_timestamp_ns = orphan.sensor_timestamp_ns,
                            "Releasing orphaned image"
                        );
                        shed_orphan = true;
                    }
                }
                if shed_orphan {
                    continue;
                }
                // Every target head is now >= ts_m, classify
                let mut images: arrayvec::ArrayVec<Option<ImageBuffer>, MAX_STREAMS> =
                    (0..self.n_streams()).map(|_| None).collect();
                let mut dropped = StreamSet::empty();
                for i in targets.iter() {
                    let head_ts = inner.images[i].front().unwrap().sensor_timestamp_ns;
                    if ts_m < head_ts {
                        // The matching image never arrived on this stream
                        warn!(stream = i, sensor_timestamp_ns = ts_m, "Image dropped");
                        inner.stats.dropped_images += 1;
                        dropped.insert(i);
                    } else {
                        images[i] = Some(inner.images[i].pop_front().unwrap());
                    }
                }
                break (images, dropped);
            };

            inner.meta.pop_front();
            inner.stats.matched += 1;
            let bundle = MatchedBundle {
                metadata: m,
                images,
                dropped,
            };
            if let Err(std::sync::mpsc::SendError(bundle)) = sink.send(bundle) {
                // The consumer is gone; unwind the accounting for the buffers
                // we just handed nobody
                for image in bundle.images.iter().flatten() {
                    inner.acquired[image.stream] -= 1;
                }
                return Err(Error::SinkGone);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::common::{CaptureRequestTag, UserTag};
    use std::sync::mpsc::{sync_channel, Receiver};

    fn meta(ts: u64, targets: &[usize]) -> MetadataRecord {
        MetadataRecord {
            tag: CaptureRequestTag {
                targets: targets.iter().copied().collect(),
                user_tag: UserTag::Capture,
            },
            sensor_timestamp_ns: ts,
            sequence_id: ts,
            frame_duration_ns: 33_333_333,
        }
    }

    fn img(stream: usize, ts: u64) -> ImageBuffer {
        ImageBuffer {
            stream,
            sensor_timestamp_ns: ts,
            bytes: vec![0xab; 16],
        }
    }

    fn collator(max: &[usize]) -> (Collator, Receiver<MatchedBundle>) {
        let c = Collator::new(max);
        let (s, r) = sync_channel(64);
        c.register_sink(s);
        (c, r)
    }

    #[test]
    fn ideal_match_across_two_streams() {
        let (c, out) = collator(&[4, 4]);
        c.submit_image(0, img(0, 1000)).unwrap();
        c.submit_metadata(meta(1000, &[0, 1])).unwrap();
        c.submit_image(1, img(1, 1000)).unwrap();

        let b = out.try_recv().unwrap();
        assert_eq!(b.sensor_timestamp_ns(), 1000);
        assert_eq!(b.images[0].as_ref().unwrap().sensor_timestamp_ns, 1000);
        assert_eq!(b.images[1].as_ref().unwrap().sensor_timestamp_ns, 1000);
        assert!(b.dropped.is_empty());
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn missing_image_is_reported_as_dropped() {
        let (c, out) = collator(&[4, 4]);
        c.submit_metadata(meta(2000, &[0, 1])).unwrap();
        c.submit_image(0, img(0, 2000)).unwrap();
        c.submit_metadata(meta(3000, &[0, 1])).unwrap();
        c.submit_image(0, img(0, 3000)).unwrap();
        c.submit_image(1, img(1, 3000)).unwrap();

        let b1 = out.try_recv().unwrap();
        assert_eq!(b1.sensor_timestamp_ns(), 2000);
        assert!(b1.images[0].is_some());
        assert!(b1.images[1].is_none());
        assert!(b1.dropped.contains(1));

        let b2 = out.try_recv().unwrap();
        assert_eq!(b2.sensor_timestamp_ns(), 3000);
        assert!(b2.images[0].is_some());
        assert!(b2.images[1].is_some());
        assert!(b2.dropped.is_empty());

        assert_eq!(c.stats().dropped_images, 1);
    }

    #[test]
    fn orphaned_images_are_released() {
        let (c, out) = collator(&[4, 4]);
        c.submit_image(0, img(0, 4000)).unwrap();
        c.submit_image(1, img(1, 4000)).unwrap();
        c.submit_metadata(meta(5000, &[0, 1])).unwrap();
        c.submit_image(0, img(0, 5000)).unwrap();
        c.submit_image(1, img(1, 5000)).unwrap();

        let b = out.try_recv().unwrap();
        assert_eq!(b.sensor_timestamp_ns(), 5000);
        assert!(b.dropped.is_empty());
        assert_eq!(c.stats().orphaned_images, 2);
        // The two orphans were released by the sweep itself
        assert_eq!(c.outstanding(0), 1);
        assert_eq!(c.outstanding(1), 1);
    }

    #[test]
    fn output_timestamps_are_strictly_increasing() {
        let (c, out) = collator(&[8]);
        for ts in [100u64, 200, 300, 400] {
            c.submit_image(0, img(0, ts)).unwrap();
        }
        for ts in [100u64, 200, 300, 400] {
            c.submit_metadata(meta(ts, &[0])).unwrap();
        }
        let mut last = 0;
        for _ in 0..4 {
            let b = out.try_recv().unwrap();
            assert!(b.sensor_timestamp_ns() > last);
            last = b.sensor_timestamp_ns();
        }
    }

    #[test]
    fn backpressure_is_rejection() {
        let (c, _out) = collator(&[2]);
        c.submit_image(0, img(0, 1)).unwrap();
        c.submit_image(0, img(0, 2)).unwrap();
        assert!(matches!(
            c.submit_image(0, img(0, 3)),
            Err(Error::Backpressure(0))
        ));
        // Releasing opens the window again
        c.release(0);
        c.submit_image(0, img(0, 3)).unwrap();
    }

    #[test]
    fn released_buffers_balance_to_zero() {
        let (c, out) = collator(&[4, 4]);
        c.submit_image(0, img(0, 10)).unwrap();
        c.submit_image(1, img(1, 10)).unwrap();
        c.submit_metadata(meta(10, &[0, 1])).unwrap();
        let b = out.try_recv().unwrap();
        for (i, slot) in b.images.iter().enumerate() {
            if slot.is_some() {
                c.release(i);
            }
        }
        assert_eq!(c.outstanding(0) + c.outstanding(1), 0);
    }

    #[test]
    fn metadata_without_targets_is_refused() {
        let (c, _out) = collator(&[2]);
        assert!(matches!(
            c.submit_metadata(meta(1, &[])),
            Err(Error::NoTargets)
        ));
        assert!(matches!(
            c.submit_metadata(meta(1, &[3])),
            Err(Error::BadStream(3))
        ));
    }

    #[test]
    fn close_fails_fast_and_releases() {
        let (c, _out) = collator(&[2]);
        c.submit_image(0, img(0, 1)).unwrap();
        c.close();
        assert_eq!(c.outstanding(0), 0);
        assert!(matches!(c.submit_image(0, img(0, 2)), Err(Error::Closed)));
        assert!(matches!(
            c.submit_metadata(meta(2, &[0])),
            Err(Error::Closed)
        ));
    }

    #[test]
    #[should_panic(expected = "no outstanding buffers")]
    fn release_underflow_aborts() {
        let (c, _out) = collator(&[2]);
        c.release(0);
    }

    #[test]
    fn successive_orphans_drain_in_one_sweep() {
        let (c, out) = collator(&[8]);
        for ts in [100u64, 200, 300] {
            c.submit_image(0, img(0, ts)).unwrap();
        }
        c.submit_image(0, img(0, 400)).unwrap();
        c.submit_metadata(meta(400, &[0])).unwrap();
        let b = out.try_recv().unwrap();
        assert_eq!(b.sensor_timestamp_ns(), 400);
        assert_eq!(c.stats().orphaned_images, 3);
        assert_eq!(c.outstanding(0), 1);
    }
}
