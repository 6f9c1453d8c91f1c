//! Scheduled captures: selecting the first frame at or past the broadcast goal
//!
//! The leader names a single leader-domain nanosecond target; every device
//! independently persists exactly the first of its frames whose converted
//! timestamp reaches that target. Armed state is one atomic word, zero means
//! disarmed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// What to do with one bundle that just left the collator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not the frame we're waiting for (or we're not waiting), release it
    Discard,
    /// Hand the bundle to persistence and disarm
    Persist {
        goal_leader_ns: u64,
        /// The goal was already in the past when it arrived; the capture is
        /// the earliest frame available rather than a scheduled one
        lead_underflow: bool,
    },
}

pub struct TriggerScheduler {
    /// Leader-domain goal timestamp, zero when disarmed
    goal_ns: AtomicU64,
    lead_underflow: AtomicBool,
}

impl TriggerScheduler {
    pub fn new() -> Self {
        Self {
            goal_ns: AtomicU64::new(0),
            lead_underflow: AtomicBool::new(false),
        }
    }

    /// Arm for the broadcast goal. A goal with no lead time left still arms
    /// and will match the next available frame, flagged for the sidecar.
    pub fn arm(&self, goal_leader_ns: u64, now_leader_ns: u64) {
        let lead_ns = goal_leader_ns as i64 - now_leader_ns as i64;
        if lead_ns <= 0 {
            warn!(
                goal_leader_ns,
                lead_ms = lead_ns / 1_000_000,
                "Trigger goal is already in the past, matching the next frame"
            );
        } else {
            info!(
                goal_leader_ns,
                lead_ms = lead_ns / 1_000_000,
                "Capture pending"
            );
        }
        self.lead_underflow.store(lead_ns <= 0, Ordering::Release);
        self.goal_ns.store(goal_leader_ns, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.goal_ns.store(0, Ordering::Release);
    }

    /// The armed goal, if any
    pub fn armed(&self) -> Option<u64> {
        match self.goal_ns.load(Ordering::Acquire) {
            0 => None,
            goal => Some(goal),
        }
    }

    /// Judge one bundle by its leader-domain timestamp. Injection frames
    /// never persist regardless of timing.
    pub fn evaluate(&self, leader_ts_ns: u64, is_injection: bool) -> Verdict {
        let goal = self.goal_ns.load(Ordering::Acquire);
        if goal == 0 || is_injection || leader_ts_ns < goal {
            return Verdict::Discard;
        }
        // Exactly one frame persists per arming, even if evaluation ever
        // races a re-arm
        match self
            .goal_ns
            .compare_exchange(goal, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Verdict::Persist {
                goal_leader_ns: goal,
                lead_underflow: self.lead_underflow.load(Ordering::Acquire),
            },
            Err(_) => Verdict::Discard,
        }
    }
}

impl Default for TriggerScheduler {
    fn default() -> Self {
        Self::new()
    }
}
