//! Nudging the sensor frame phase onto a shared goal
//!
//! Every device's sensor free-runs at the same frame period but with an
//! arbitrary phase. Injecting a single frame with a computed short (or long)
//! exposure shifts where every subsequent frame starts, so a damped
//! proportional loop of inject / settle / re-measure walks the phase error
//! inside tolerance without touching the steady-state exposure.

use crate::{
    common::{CameraControl, CaptureRequestTag, StreamSet, UserTag},
    config::PhaseConfig,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Published to observers after every measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase_error_ns: i64,
    pub aligned: bool,
}

/// Signed phase error of a leader-domain frame-start time against the goal,
/// wrapped into `[-P/2, P/2)`
pub fn phase_error(t_lead_ns: u64, cfg: &PhaseConfig) -> i64 {
    let p = cfg.frame_period_ns as i64;
    let current = (t_lead_ns % cfg.frame_period_ns) as i64;
    (current - cfg.goal_phase_ns as i64 + p / 2).rem_euclid(p) - p / 2
}

/// Exposure for the one injection frame that cancels `step_gain` of the error
pub fn inject_exposure(error_ns: i64, cfg: &PhaseConfig) -> u64 {
    let scaled = error_ns.unsigned_abs() as f64 * cfg.step_gain;
    let raw = if error_ns > 0 {
        cfg.frame_period_ns as f64 - scaled
    } else {
        scaled
    };
    (raw as u64).clamp(cfg.min_inject_exposure_ns, cfg.max_inject_exposure_ns)
}

/// The per-device alignment controller. Measurement is a per-device sequence
/// driven by the sync worker, so the controller is single-owner mutable.
pub struct PhaseAligner {
    cfg: PhaseConfig,
    camera: Arc<dyn CameraControl>,
    /// Sensitivity to request on injection frames, follows `SET_2A`
    sensitivity: i32,
    active: bool,
    settle_remaining: u32,
}

impl PhaseAligner {
    pub fn new(cfg: PhaseConfig, camera: Arc<dyn CameraControl>) -> Self {
        Self {
            cfg,
            camera,
            sensitivity: 100,
            active: false,
            settle_remaining: 0,
        }
    }

    /// Begin (or restart) an alignment cycle
    pub fn start(&mut self) {
        info!(
            goal_phase_ns = self.cfg.goal_phase_ns,
            tolerance_ns = self.cfg.tolerance_ns,
            "Starting phase alignment cycle"
        );
        self.active = true;
        self.settle_remaining = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_sensitivity(&mut self, sensitivity: i32) {
        self.sensitivity = sensitivity;
    }

    /// Feed one leader-domain frame-start timestamp through the controller.
    ///
    /// Returns a report for every real measurement; frames consumed by the
    /// post-injection settle window return `None`.
    pub fn observe(&mut self, t_lead_ns: u64) -> eyre::Result<Option<PhaseReport>> {
        if !self.active {
            return Ok(None);
        }
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            return Ok(None);
        }
        let error = phase_error(t_lead_ns, &self.cfg);
        let aligned = error.unsigned_abs() <= self.cfg.tolerance_ns;
        if aligned {
            info!(phase_error_ns = error, "Phase aligned");
            self.active = false;
            return Ok(Some(PhaseReport {
                phase_error_ns: error,
                aligned,
            }));
        }
        let exposure = inject_exposure(error, &self.cfg);
        debug!(
            phase_error_ns = error,
            exposure_ns = exposure,
            "Injecting phase-shift frame"
        );
        // The injection lands on the preview stream and is tagged so the
        // trigger scheduler discards it
        let tag = CaptureRequestTag {
            targets: StreamSet::from_iter([0]),
            user_tag: UserTag::Inject,
        };
        self.camera.request_capture(tag, exposure, self.sensitivity)?;
        self.settle_remaining = self.cfg.settle_frames;
        Ok(Some(PhaseReport {
            phase_error_ns: error,
            aligned,
        }))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    pub struct MockCamera {
        pub requests: Mutex<Vec<(CaptureRequestTag, u64, i32)>>,
    }

    impl MockCamera {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(vec![]),
            })
        }
    }

    impl CameraControl for MockCamera {
        fn request_capture(
            &self,
            tag: CaptureRequestTag,
            exposure_ns: u64,
            sensitivity: i32,
        ) -> eyre::Result<()> {
            self.requests.lock().unwrap().push((tag, exposure_ns, sensitivity));
            Ok(())
        }
    }

    fn test_cfg() -> PhaseConfig {
        PhaseConfig {
            frame_period_ns: 33_333_333,
            goal_phase_ns: 0,
            tolerance_ns: 100_000,
            settle_frames: 2,
            step_gain: 0.5,
            min_inject_exposure_ns: 1_000_000,
            max_inject_exposure_ns: 66_000_000,
        }
    }

    #[test]
    fn phase_error_wraps_signed() {
        let cfg = test_cfg();
        let p = cfg.frame_period_ns;
        assert_eq!(phase_error(0, &cfg), 0);
        assert_eq!(phase_error(10_000_000, &cfg), 10_000_000);
        // Just shy of a full period reads as a small negative error
        assert_eq!(phase_error(p - 1000, &cfg), -1000);
        // The wrap point sits at half a period
        assert_eq!(phase_error(p / 2, &cfg), (p / 2) as i64);
        assert_eq!(phase_error(p / 2 + 1, &cfg), -((p / 2) as i64));
    }

    #[test]
    fn injected_exposure_matches_the_worked_example() {
        let cfg = test_cfg();
        assert_eq!(inject_exposure(10_000_000, &cfg), 28_333_333);
    }

    #[test]
    fn exposure_is_clamped() {
        let mut cfg = test_cfg();
        cfg.min_inject_exposure_ns = 30_000_000;
        assert_eq!(inject_exposure(10_000_000, &cfg), 30_000_000);
        cfg.min_inject_exposure_ns = 1_000_000;
        cfg.max_inject_exposure_ns = 20_000_000;
        assert_eq!(inject_exposure(10_000_000, &cfg), 20_000_000);
    }

    #[test]
    fn aligned_phase_requests_nothing() {
        let camera = MockCamera::new();
        let mut aligner = PhaseAligner::new(test_cfg(), camera.clone());
        aligner.start();
        let report = aligner.observe(50_000).unwrap().unwrap();
        assert!(report.aligned);
        assert!(camera.requests.lock().unwrap().is_empty());
        // Cycle is complete, further frames are ignored
        assert!(aligner.observe(50_000).unwrap().is_none());
    }

    #[test]
    fn settle_frames_are_skipped_after_injection() {
        let camera = MockCamera::new();
        let mut aligner = PhaseAligner::new(test_cfg(), camera.clone());
        aligner.start();
        let report = aligner.observe(10_000_000).unwrap().unwrap();
        assert!(!report.aligned);
        assert_eq!(camera.requests.lock().unwrap().len(), 1);
        let (tag, exposure, _) = camera.requests.lock().unwrap()[0];
        assert_eq!(tag.user_tag, UserTag::Inject);
        assert_eq!(exposure, 28_333_333);
        // Two settle frames consumed silently
        assert!(aligner.observe(10_000_000).unwrap().is_none());
        assert!(aligner.observe(10_000_000).unwrap().is_none());
        // Then measurement resumes
        assert!(aligner.observe(10_000_000).unwrap().is_some());
    }

    #[test]
    fn error_contracts_by_the_step_gain_each_round() {
        // Noise-free simulation: an injected frame of exposure d replaces one
        // period-long frame, shifting every later frame start by (d - P)
        let cfg = test_cfg();
        let camera = MockCamera::new();
        let mut aligner = PhaseAligner::new(cfg.clone(), camera.clone());
        aligner.start();

        let p = cfg.frame_period_ns as i64;
        let mut t = 4 * cfg.frame_period_ns + 10_000_000; // error starts at +10 ms
        let mut frame = 0usize;
        let mut last_err = u64::MAX;
        for _ in 0..200 {
            let requests_before = camera.requests.lock().unwrap().len();
            let report = aligner.observe(t).unwrap();
            if let Some(r) = report {
                if r.aligned {
                    return;
                }
                let err = r.phase_error_ns.unsigned_abs();
                // Each measured error is at most (1 - gain) of the last,
                // with a grain of slack for integer rounding
                assert!(err <= last_err / 2 + 2, "error grew: {last_err} -> {err}");
                last_err = err;
            }
            let requests = camera.requests.lock().unwrap();
            let shift = if requests.len() > requests_before {
                requests.last().unwrap().1 as i64 - p
            } else {
                0
            };
            drop(requests);
            t = (t as i64 + p + shift) as u64;
            frame += 1;
        }
        panic!("did not align within {frame} frames");
    }
}
