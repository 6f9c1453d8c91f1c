//! Clock offset estimation via bursts of four-timestamp exchanges
//!
//! The leader stamps `t0`, the client echoes it back with its own receive and
//! transmit ticks `t1`/`t2`, and the leader stamps `t3` on arrival. A burst of
//! exchanges is folded down to the single sample with the smallest round-trip
//! time, which bounds the offset error by `rtt / 2`.

use crate::{
    clock::Offset,
    common::ticker,
    rpc::{methods, Transport},
};
use std::{
    net::SocketAddr,
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("burst abandoned after {0} attempts")]
    BurstFailed(usize),
    #[error("response channel closed mid-burst")]
    Closed,
}

/// Burst policy knobs, see the config surface for defaults
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Exchanges per burst (K)
    pub samples: usize,
    /// Inter-sample spacing (S)
    pub spacing: Duration,
    /// Per-sample deadline (D), blowing it abandons the whole burst
    pub deadline: Duration,
    /// Bursts to attempt before giving up (R)
    pub retries: usize,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            samples: 20,
            spacing: Duration::from_millis(10),
            deadline: Duration::from_millis(200),
            retries: 3,
        }
    }
}

/// One folded exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset_ns: i64,
    pub rtt_ns: i64,
}

/// The classical SNTP fold. `t0`/`t3` are leader-domain ticks, `t1`/`t2`
/// client-domain.
pub fn fold(t0: i64, t1: i64, t2: i64, t3: i64) -> Sample {
    Sample {
        offset_ns: ((t1 - t0) + (t2 - t3)) / 2,
        rtt_ns: (t3 - t0) - (t2 - t1),
    }
}

impl Sample {
    pub fn to_offset(self) -> Offset {
        Offset {
            offset_ns: self.offset_ns,
            error_bound_ns: self.rtt_ns.max(0) as u64 / 2,
        }
    }
}

/// Timestamps of one exchange as routed from the dispatch worker: the echoed
/// `t0`, the client's `t1` and `t2`, and the receive-loop's `t3` stamp
pub type Exchange = (i64, i64, i64, i64);

/// Run one full burst against `peer`, blocking until it completes or the
/// retry budget is spent.
///
/// The caller owns routing: the `SNTP_RESP` handler must forward this peer's
/// exchanges into `responses`. Responses echoing a stale `t0` (from an
/// abandoned attempt) are discarded by the match on the current `t0`.
pub fn run_burst(
    transport: &Transport,
    peer: SocketAddr,
    cfg: &BurstConfig,
    responses: &Receiver<Exchange>,
) -> Result<Offset, Error> {
    for attempt in 1..=cfg.retries {
        match run_attempt(transport, peer, cfg, responses) {
            Ok(Some(best)) => {
                debug!(
                    %peer,
                    offset_ns = best.offset_ns,
                    rtt_ns = best.rtt_ns,
                    "Burst complete"
                );
                return Ok(best.to_offset());
            }
            Ok(None) => {
                warn!(%peer, attempt, "Burst abandoned, sample deadline blown");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::BurstFailed(cfg.retries))
}

/// One attempt: K exchanges back to back. Returns the best sample, or `None`
/// if any exchange blew its deadline.
fn run_attempt(
    transport: &Transport,
    peer: SocketAddr,
    cfg: &BurstConfig,
    responses: &Receiver<Exchange>,
) -> Result<Option<Sample>, Error> {
    let mut best: Option<Sample> = None;
    for k in 0..cfg.samples {
        // Flush responses from any abandoned attempt
        while responses.try_recv().is_ok() {}
        let t0 = ticker().now_ns() as i64;
        if let Err(e) = transport.send_to(peer, methods::SNTP_REQ, &t0.to_string()) {
            // Send failure burns this attempt, the retry loop owns re-sends
            warn!(%peer, "Failed to send SNTP_REQ - {e}");
            return Ok(None);
        }
        let sample = match await_echo(t0, cfg.deadline, responses)? {
            Some(s) => s,
            None => return Ok(None),
        };
        if best.map_or(true, |b| sample.rtt_ns < b.rtt_ns) {
            best = Some(sample);
        }
        if k + 1 < cfg.samples {
            std::thread::sleep(cfg.spacing);
        }
    }
    Ok(best)
}

/// Wait for the response echoing `t0`, folding it when it lands
fn await_echo(
    t0: i64,
    deadline: Duration,
    responses: &Receiver<Exchange>,
) -> Result<Option<Sample>, Error> {
    let expires = std::time::Instant::now() + deadline;
    loop {
        let remaining = expires.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match responses.recv_timeout(remaining) {
            Ok((echo_t0, t1, t2, t3)) if echo_t0 == t0 => {
                return Ok(Some(fold(t0, t1, t2, t3)));
            }
            // A stale echo from an earlier sample or attempt
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
        }
    }
}
