//! Writing triggered captures to disk
//!
//! One directory per capture, named by the leader-domain sensor timestamp so
//! every device in the rig files the same moment under the same name. Beside
//! the per-stream payloads sits a sidecar recording both clock domains.

use crate::{
    collate::Collator,
    common::{MatchedBundle, BLOCK_TIMEOUT},
    db::{CaptureRecord, EventRecord},
};
use hifitime::prelude::*;
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{mpsc::SyncSender, Arc},
};
use thingbuf::mpsc::{blocking::Receiver, errors::RecvTimeoutError};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A bundle the trigger scheduler selected, plus everything the sidecar needs
#[derive(Debug, Default, Clone)]
pub struct PersistJob {
    pub bundle: MatchedBundle,
    pub leader_ts_ns: u64,
    pub goal_ns: u64,
    pub lead_underflow: bool,
}

fn sidecar_text(job: &PersistJob) -> String {
    let m = &job.bundle.metadata;
    let mut text = String::new();
    let _ = writeln!(text, "local_sensor_timestamp_ns = {}", m.sensor_timestamp_ns);
    let _ = writeln!(text, "leader_sensor_timestamp_ns = {}", job.leader_ts_ns);
    let _ = writeln!(text, "goal_leader_ns = {}", job.goal_ns);
    let _ = writeln!(text, "sequence_id = {}", m.sequence_id);
    let _ = writeln!(text, "frame_duration_ns = {}", m.frame_duration_ns);
    let dropped: Vec<String> = job.bundle.dropped.iter().map(|i| i.to_string()).collect();
    let _ = writeln!(text, "dropped_streams = {}", dropped.join(","));
    let _ = writeln!(text, "lead_underflow = {}", job.lead_underflow);
    text
}

/// Write one capture directory, returning its path
pub fn write_capture(root: &Path, job: &PersistJob) -> eyre::Result<PathBuf> {
    let mut dir = root.join(format!("{:020}", job.leader_ts_ns));
    if dir.exists() {
        // Re-triggering at an identical timestamp would clobber; fall back to
        // a wall-clock name
        let fmt = Format::from_str("%Y%m%dT%H%M%S").unwrap();
        let fallback = format!("capture-{}", Formatter::new(Epoch::now()?, fmt));
        warn!(
            "Capture directory {} already exists, writing {fallback} instead",
            dir.display()
        );
        dir = root.join(fallback);
    }
    std::fs::create_dir_all(&dir)?;
    for image in job.bundle.images.iter().flatten() {
        std::fs::write(dir.join(format!("stream_{}.raw", image.stream)), &image.bytes)?;
    }
    std::fs::write(dir.join("timestamps.txt"), sidecar_text(job))?;
    Ok(dir)
}

/// Persistence worker: drains selected bundles, writes them out, and releases
/// every buffer back to the collator whether or not the write succeeded
pub fn persist_task(
    root: PathBuf,
    jobs: Receiver<PersistJob>,
    collator: Arc<Collator>,
    events: SyncSender<EventRecord>,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting persistence task, captures go to {}", root.display());
    loop {
        if shutdown.try_recv().is_ok() {
            info!("Persistence task stopping");
            break;
        }
        let job = match jobs.recv_timeout(BLOCK_TIMEOUT) {
            Ok(j) => j,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Closed) => break,
            Err(_) => unreachable!(),
        };
        match write_capture(&root, &job) {
            Ok(dir) => {
                info!(
                    leader_ts_ns = job.leader_ts_ns,
                    directory = %dir.display(),
                    "Capture persisted"
                );
                let record = EventRecord::Capture(CaptureRecord {
                    leader_ts_ns: job.leader_ts_ns as i64,
                    local_ts_ns: job.bundle.metadata.sensor_timestamp_ns as i64,
                    goal_ns: job.goal_ns as i64,
                    lead_underflow: job.lead_underflow,
                    directory: dir.display().to_string(),
                });
                let _ = events.try_send(record);
            }
            Err(e) => warn!("Error persisting capture - {e}"),
        }
        collator.release_bundle(&job.bundle);
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::common::{CaptureRequestTag, ImageBuffer, MetadataRecord, StreamSet};

    fn job() -> PersistJob {
        let mut bundle = MatchedBundle {
            metadata: MetadataRecord {
                tag: CaptureRequestTag {
                    targets: [0, 1].into_iter().collect(),
                    ..Default::default()
                },
                sensor_timestamp_ns: 9_990_000,
                sequence_id: 17,
                frame_duration_ns: 33_333_333,
            },
            images: (0..2).map(|_| None).collect(),
            dropped: StreamSet::empty(),
        };
        bundle.images[0] = Some(ImageBuffer {
            stream: 0,
            sensor_timestamp_ns: 9_990_000,
            bytes: vec![1, 2, 3],
        });
        bundle.dropped.insert(1);
        PersistJob {
            bundle,
            leader_ts_ns: 10_010_000,
            goal_ns: 10_000_000,
            lead_underflow: false,
        }
    }

    #[test]
    fn capture_directory_layout() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_capture(root.path(), &job()).unwrap();
        assert_eq!(dir, root.path().join("00000000000010010000"));
        assert_eq!(std::fs::read(dir.join("stream_0.raw")).unwrap(), vec![1, 2, 3]);
        let sidecar = std::fs::read_to_string(dir.join("timestamps.txt")).unwrap();
        assert!(sidecar.contains("local_sensor_timestamp_ns = 9990000"));
        assert!(sidecar.contains("leader_sensor_timestamp_ns = 10010000"));
        assert!(sidecar.contains("dropped_streams = 1"));
        assert!(sidecar.contains("lead_underflow = false"));
    }

    #[test]
    fn colliding_directory_gets_a_fallback_name() {
        let root = tempfile::tempdir().unwrap();
        let first = write_capture(root.path(), &job()).unwrap();
        let second = write_capture(root.path(), &job()).unwrap();
        assert_ne!(first, second);
        assert!(second.join("timestamps.txt").exists());
    }
}
