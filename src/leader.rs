//! The coordinating role: roster upkeep, offset negotiation, and fanning
//! capture/alignment commands out to the rig
//!
//! The leader's own device participates in every capture, so beside the
//! protocol handlers it carries the same local trigger/alignment plumbing a
//! client does, just with the identity clock.

use crate::{
    common::{ticker, CameraControl, CaptureRequestTag},
    config::Config,
    db::{EventRecord, OffsetRecord},
    membership::Roster,
    rpc::{fields, methods, Datagram, Transport},
    sntp::{run_burst, Exchange},
    trigger::TriggerScheduler,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc::{sync_channel, SyncSender},
        Arc, Mutex,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct Leader {
    transport: Arc<Transport>,
    pub roster: Arc<Roster>,
    cfg: Config,
    camera: Arc<dyn CameraControl>,
    /// Routes from the SNTP_RESP handler into in-flight bursts; a present
    /// route doubles as that client's burst-in-flight marker
    sntp_routes: Arc<Mutex<HashMap<SocketAddr, SyncSender<Exchange>>>>,
    /// Local capture plumbing, fed by the sync worker
    pub trigger: Arc<TriggerScheduler>,
    pub align_requested: Arc<AtomicBool>,
    pub sensitivity: Arc<AtomicI32>,
    events: SyncSender<EventRecord>,
}

impl Leader {
    pub fn new(
        transport: Arc<Transport>,
        roster: Arc<Roster>,
        cfg: Config,
        camera: Arc<dyn CameraControl>,
        events: SyncSender<EventRecord>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            roster,
            cfg,
            camera,
            sntp_routes: Arc::new(Mutex::new(HashMap::new())),
            trigger: Arc::new(TriggerScheduler::new()),
            align_requested: Arc::new(AtomicBool::new(false)),
            sensitivity: Arc::new(AtomicI32::new(100)),
            events,
        })
    }

    /// Register every leader-side method handler. Operator tooling speaks the
    /// same wire protocol at the leader's own port: an inbound trigger/2A/
    /// align datagram is applied locally and fanned out to the rig.
    pub fn install_handlers(self: &Arc<Self>) {
        let leader = self.clone();
        self.transport.register_handler(
            methods::HEARTBEAT,
            Box::new(move |d| leader.on_heartbeat(d)),
        );
        let leader = self.clone();
        self.transport.register_handler(
            methods::SNTP_RESP,
            Box::new(move |d| leader.on_sntp_resp(d)),
        );
        let leader = self.clone();
        self.transport.register_handler(
            methods::SET_TRIGGER_TIME,
            Box::new(move |d| {
                let explicit = d.payload.trim().parse::<u64>().ok();
                if let Err(e) = leader.trigger_capture(explicit) {
                    warn!("Failed to fan out trigger - {e}");
                }
            }),
        );
        let leader = self.clone();
        self.transport.register_handler(
            methods::SET_2A,
            Box::new(move |d| match parse_2a(d) {
                Ok((exposure_ns, sensitivity)) => {
                    if let Err(e) = leader.broadcast_2a(exposure_ns, sensitivity) {
                        warn!("Failed to fan out 2A values - {e}");
                    }
                }
                Err(e) => warn!("{e}"),
            }),
        );
        let leader = self.clone();
        self.transport.register_handler(
            methods::DO_PHASE_ALIGN,
            Box::new(move |_| {
                if let Err(e) = leader.request_phase_align() {
                    warn!("Failed to fan out phase align - {e}");
                }
            }),
        );
    }

    fn on_heartbeat(self: &Arc<Self>, d: &Datagram) {
        let (client_id, synced) = match fields::<2>(d.method, &d.payload) {
            Ok([id, synced]) => (id.to_string(), synced == "true"),
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        let disposition = self.roster.heartbeat(d.sender, &client_id, synced, d.rx_ns);
        if let Err(e) = self.transport.send_to(d.sender, methods::HEARTBEAT_ACK, "") {
            warn!(client = %d.sender, "Failed to ack heartbeat - {e}");
        }
        if disposition.needs_sntp {
            self.start_burst(d.sender);
        }
    }

    /// Kick off an exchange burst for `addr` unless one is already in flight
    fn start_burst(self: &Arc<Self>, addr: SocketAddr) {
        let (resp_s, resp_r) = {
            let mut routes = self.sntp_routes.lock().unwrap();
            if routes.contains_key(&addr) {
                return;
            }
            let (s, r) = sync_channel::<Exchange>(64);
            routes.insert(addr, s.clone());
            (s, r)
        };
        drop(resp_s);
        let leader = self.clone();
        // Bursts are short-lived and per-client, a dedicated thread apiece
        // keeps one slow client from stalling the others
        let spawned = std::thread::Builder::new()
            .name(format!("sntp-{}", addr.port()))
            .spawn(move || {
                info!(client = %addr, "Starting offset negotiation burst");
                let result = run_burst(
                    &leader.transport,
                    addr,
                    &leader.cfg.sntp.burst(),
                    &resp_r,
                );
                leader.sntp_routes.lock().unwrap().remove(&addr);
                match result {
                    Ok(offset) => {
                        let payload =
                            format!("{},{}", offset.offset_ns, offset.error_bound_ns);
                        match leader
                            .transport
                            .send_to(addr, methods::OFFSET_UPDATE, &payload)
                        {
                            Ok(()) => {
                                info!(
                                    client = %addr,
                                    offset_ns = offset.offset_ns,
                                    error_bound_ns = offset.error_bound_ns,
                                    "Offset negotiated"
                                );
                                leader.roster.offset_negotiated(addr, offset);
                                let _ = leader.events.try_send(EventRecord::OffsetUpdate(
                                    OffsetRecord {
                                        peer: addr.to_string(),
                                        offset_ns: offset.offset_ns,
                                        error_bound_ns: offset.error_bound_ns as i64,
                                    },
                                ));
                            }
                            Err(e) => {
                                warn!(client = %addr, "Failed to send offset update - {e}");
                                leader.roster.mark_unsynced(addr);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(client = %addr, "Offset negotiation failed - {e}");
                        leader.roster.mark_unsynced(addr);
                    }
                }
            });
        if spawned.is_err() {
            warn!(client = %addr, "Could not spawn burst thread");
            self.sntp_routes.lock().unwrap().remove(&addr);
        }
    }

    fn on_sntp_resp(&self, d: &Datagram) {
        let Ok([t0, t1, t2]) = fields::<3>(d.method, &d.payload) else {
            warn!(client = %d.sender, "Malformed SNTP response: {:?}", d.payload);
            return;
        };
        let (Ok(t0), Ok(t1), Ok(t2)) = (t0.parse::<i64>(), t1.parse::<i64>(), t2.parse::<i64>())
        else {
            warn!(client = %d.sender, "Malformed SNTP response: {:?}", d.payload);
            return;
        };
        let routes = self.sntp_routes.lock().unwrap();
        match routes.get(&d.sender) {
            // t3 is the receive-loop stamp, not "now": the dispatch queue
            // already cost us time the fold must not see
            Some(route) => {
                let _ = route.try_send((t0, t1, t2, d.rx_ns as i64));
            }
            None => debug!(client = %d.sender, "SNTP response with no burst in flight"),
        }
    }

    /// Broadcast a capture goal and arm the local scheduler. Without an
    /// explicit goal, the configured safety lead is added so every client
    /// hears the broadcast before its frame must match.
    pub fn trigger_capture(&self, explicit_goal_ns: Option<u64>) -> eyre::Result<u64> {
        let now = ticker().now_ns();
        let goal = explicit_goal_ns.unwrap_or(now + self.cfg.trigger_lead_ns());
        self.transport.broadcast(
            &self.roster.addrs(),
            methods::SET_TRIGGER_TIME,
            &goal.to_string(),
        )?;
        self.trigger.arm(goal, now);
        Ok(goal)
    }

    /// Replicate manual exposure/sensitivity across the rig
    pub fn broadcast_2a(&self, exposure_ns: u64, sensitivity: i32) -> eyre::Result<()> {
        let payload = format!("{exposure_ns},{sensitivity}");
        self.transport
            .broadcast(&self.roster.addrs(), methods::SET_2A, &payload)?;
        self.sensitivity.store(sensitivity, Ordering::Release);
        self.camera.request_capture(
            CaptureRequestTag::capture_all(self.cfg.max_outstanding.len()),
            exposure_ns,
            sensitivity,
        )
    }

    /// Start a phase-alignment cycle everywhere, this device included
    pub fn request_phase_align(&self) -> eyre::Result<()> {
        self.transport
            .broadcast(&self.roster.addrs(), methods::DO_PHASE_ALIGN, "")?;
        self.align_requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Periodic roster sweep, paced off the heartbeat period
    pub fn eviction_task(&self, mut shutdown: broadcast::Receiver<()>) -> eyre::Result<()> {
        info!("Starting membership eviction task");
        loop {
            if shutdown.try_recv().is_ok() {
                info!("Eviction task stopping");
                break;
            }
            std::thread::sleep(self.cfg.heartbeat_period());
            self.roster.evict_stale(ticker().now_ns());
        }
        Ok(())
    }
}

fn parse_2a(d: &Datagram) -> Result<(u64, i32), crate::rpc::Error> {
    let [exposure, sensitivity] = fields::<2>(d.method, &d.payload)?;
    let malformed = || crate::rpc::Error::MalformedPayload {
        method: d.method,
        payload: d.payload.clone(),
    };
    Ok((
        exposure.parse().map_err(|_| malformed())?,
        sensitivity.parse().map_err(|_| malformed())?,
    ))
}
