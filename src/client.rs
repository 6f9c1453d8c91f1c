//! The following role: answer the leader's exchanges, install its offsets,
//! and arm local captures on its schedule

use crate::{
    clock::{ClockMap, Offset},
    common::{ticker, CameraControl, CaptureRequestTag},
    config::Config,
    db::{EventRecord, OffsetRecord},
    rpc::{fields, methods, Datagram, Transport},
    trigger::TriggerScheduler,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc::SyncSender,
        Arc, Mutex,
    },
};
use tracing::{info, warn};

pub struct Client {
    transport: Arc<Transport>,
    cfg: Config,
    camera: Arc<dyn CameraControl>,
    /// Installed by `OFFSET_UPDATE`, read by every conversion
    pub clock: Arc<ClockMap>,
    /// Latched from the first heartbeat ack; until then we only know the
    /// subnet broadcast address
    pub leader_addr: Arc<Mutex<Option<SocketAddr>>>,
    pub trigger: Arc<TriggerScheduler>,
    pub align_requested: Arc<AtomicBool>,
    pub sensitivity: Arc<AtomicI32>,
    events: SyncSender<EventRecord>,
}

impl Client {
    pub fn new(
        transport: Arc<Transport>,
        cfg: Config,
        camera: Arc<dyn CameraControl>,
        events: SyncSender<EventRecord>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cfg,
            camera,
            clock: Arc::new(ClockMap::unset()),
            leader_addr: Arc::new(Mutex::new(None)),
            trigger: Arc::new(TriggerScheduler::new()),
            align_requested: Arc::new(AtomicBool::new(false)),
            sensitivity: Arc::new(AtomicI32::new(100)),
            events,
        })
    }

    pub fn install_handlers(self: &Arc<Self>) {
        let client = self.clone();
        self.transport.register_handler(
            methods::HEARTBEAT_ACK,
            Box::new(move |d| {
                let mut leader = client.leader_addr.lock().unwrap();
                if leader.replace(d.sender) != Some(d.sender) {
                    info!(leader = %d.sender, "Latched leader address");
                }
            }),
        );
        let client = self.clone();
        self.transport.register_handler(
            methods::SNTP_REQ,
            Box::new(move |d| client.on_sntp_req(d)),
        );
        let client = self.clone();
        self.transport.register_handler(
            methods::OFFSET_UPDATE,
            Box::new(move |d| client.on_offset_update(d)),
        );
        let client = self.clone();
        self.transport.register_handler(
            methods::SET_TRIGGER_TIME,
            Box::new(move |d| client.on_trigger_time(d)),
        );
        let client = self.clone();
        self.transport.register_handler(
            methods::SET_2A,
            Box::new(move |d| client.on_2a(d)),
        );
        let client = self.clone();
        self.transport.register_handler(
            methods::DO_PHASE_ALIGN,
            Box::new(move |_| {
                info!("Leader requested a phase alignment cycle");
                client.align_requested.store(true, Ordering::Release);
            }),
        );
    }

    fn on_sntp_req(&self, d: &Datagram) {
        // t1 is the receive-loop stamp; t2 is taken as late as possible so
        // the pair brackets only our own handling time
        let Ok([t0]) = fields::<1>(d.method, &d.payload) else {
            warn!("Malformed SNTP request: {:?}", d.payload);
            return;
        };
        let t1 = d.rx_ns;
        let t2 = ticker().now_ns();
        let payload = format!("{t0},{t1},{t2}");
        if let Err(e) = self.transport.send_to(d.sender, methods::SNTP_RESP, &payload) {
            warn!("Failed to send SNTP response - {e}");
        }
    }

    fn on_offset_update(&self, d: &Datagram) {
        let Ok([offset, bound]) = fields::<2>(d.method, &d.payload) else {
            warn!("Malformed offset update: {:?}", d.payload);
            return;
        };
        let (Ok(offset_ns), Ok(error_bound_ns)) = (offset.parse::<i64>(), bound.parse::<u64>())
        else {
            warn!("Malformed offset update: {:?}", d.payload);
            return;
        };
        self.clock.install(Offset {
            offset_ns,
            error_bound_ns,
        });
        info!(offset_ns, error_bound_ns, "Installed leader offset");
        let _ = self.events.try_send(EventRecord::OffsetUpdate(OffsetRecord {
            peer: d.sender.to_string(),
            offset_ns,
            error_bound_ns: error_bound_ns as i64,
        }));
    }

    fn on_trigger_time(&self, d: &Datagram) {
        let Ok(goal_ns) = d.payload.trim().parse::<u64>() else {
            warn!("Malformed trigger time: {:?}", d.payload);
            return;
        };
        // Arming needs a leader-domain "now", which needs a synced clock
        let now_leader = match self.clock.leader_of(ticker().now_ns()) {
            Ok(now) => now,
            Err(e) => {
                warn!("Refusing to arm trigger - {e}");
                return;
            }
        };
        self.trigger.arm(goal_ns, now_leader);
    }

    fn on_2a(&self, d: &Datagram) {
        let Ok([exposure, sensitivity]) = fields::<2>(d.method, &d.payload) else {
            warn!("Malformed 2A update: {:?}", d.payload);
            return;
        };
        let (Ok(exposure_ns), Ok(sensitivity)) =
            (exposure.parse::<u64>(), sensitivity.parse::<i32>())
        else {
            warn!("Malformed 2A update: {:?}", d.payload);
            return;
        };
        info!(exposure_ns, sensitivity, "Applying 2A values");
        self.sensitivity.store(sensitivity, Ordering::Release);
        if let Err(e) = self.camera.request_capture(
            CaptureRequestTag::capture_all(self.cfg.max_outstanding.len()),
            exposure_ns,
            sensitivity,
        ) {
            warn!("Camera refused 2A update - {e}");
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{
        config::SntpSection,
        leader::Leader,
        membership::{Roster, SyncState},
        phase::tests::MockCamera,
        rpc::Transport,
    };
    use std::{
        sync::mpsc::{sync_channel, Receiver},
        time::{Duration, Instant},
    };
    use tokio::sync::broadcast;

    struct Endpoint {
        transport: Arc<Transport>,
        addr: SocketAddr,
        shutdown: broadcast::Sender<()>,
        threads: Vec<std::thread::JoinHandle<eyre::Result<()>>>,
    }

    /// Bind a transport and run its receive and dispatch loops
    fn endpoint() -> Endpoint {
        let transport = Arc::new(Transport::bind(0).unwrap());
        let addr = SocketAddr::from(([127, 0, 0, 1], transport.local_addr().unwrap().port()));
        let (sd_s, sd_recv) = broadcast::channel(1);
        let sd_disp = sd_s.subscribe();
        let (disp_s, disp_r) = sync_channel(256);
        let t1 = transport.clone();
        let t2 = transport.clone();
        let threads = vec![
            std::thread::spawn(move || t1.recv_loop(disp_s, sd_recv)),
            std::thread::spawn(move || t2.dispatch_task(disp_r, sd_disp)),
        ];
        Endpoint {
            transport,
            addr,
            shutdown: sd_s,
            threads,
        }
    }

    fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let expires = Instant::now() + deadline;
        while Instant::now() < expires {
            if probe() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn quick_config() -> Config {
        let mut cfg = Config::default();
        cfg.sntp = SntpSection {
            samples: 4,
            spacing_ms: 1,
            deadline_ms: 500,
            retries: 2,
        };
        cfg
    }

    #[test]
    fn full_negotiation_and_trigger_over_loopback() {
        let cfg = quick_config();
        let (events_s, events_r): (_, Receiver<EventRecord>) = sync_channel(64);

        let leader_end = endpoint();
        let roster = Arc::new(Roster::new(cfg.expiry_ns()));
        let leader = Leader::new(
            leader_end.transport.clone(),
            roster.clone(),
            cfg.clone(),
            MockCamera::new(),
            events_s.clone(),
        );
        leader.install_handlers();

        let client_end = endpoint();
        let client = Client::new(
            client_end.transport.clone(),
            cfg.clone(),
            MockCamera::new(),
            events_s,
        );
        client.install_handlers();

        // First heartbeat: unsynced, kicks off the exchange burst
        client_end
            .transport
            .send_to(leader_end.addr, methods::HEARTBEAT, "cam-test,false")
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(10), || client.clock.is_synced()),
            "client never received an offset"
        );
        assert!(
            wait_until(Duration::from_secs(5), || client
                .leader_addr
                .lock()
                .unwrap()
                .is_some()),
            "client never latched the leader address"
        );
        // Loopback has symmetric near-zero delay, the offset should be tiny
        let offset = client.clock.current().unwrap();
        assert!(offset.error_bound_ns < 1_000_000_000);

        // Acknowledging heartbeat completes the membership handshake
        client_end
            .transport
            .send_to(leader_end.addr, methods::HEARTBEAT, "cam-test,true")
            .unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                roster
                    .clients()
                    .first()
                    .is_some_and(|r| r.sync_state == SyncState::Synced)
            }),
            "leader never saw the client as synced"
        );

        // A broadcast trigger arms the client with the same goal
        let goal = leader.trigger_capture(None).unwrap();
        assert_eq!(leader.trigger.armed(), Some(goal));
        assert!(
            wait_until(Duration::from_secs(5), || client.trigger.armed() == Some(goal)),
            "client never armed"
        );

        // The negotiation logged an offset event on each side
        assert!(wait_until(Duration::from_secs(1), || {
            events_r.try_recv().is_ok()
        }));

        for end in [leader_end, client_end] {
            end.shutdown.send(()).unwrap();
            for t in end.threads {
                t.join().unwrap().unwrap();
            }
        }
    }

    #[test]
    fn unsynced_client_refuses_to_arm() {
        let cfg = quick_config();
        let (events_s, _events_r) = sync_channel(4);
        let transport = Arc::new(Transport::bind(0).unwrap());
        let client = Client::new(transport, cfg, MockCamera::new(), events_s);
        client.on_trigger_time(&Datagram {
            method: methods::SET_TRIGGER_TIME,
            sender: SocketAddr::from(([127, 0, 0, 1], 1)),
            payload: "123456789".to_string(),
            rx_ns: 0,
        });
        assert_eq!(client.trigger.armed(), None);
    }

    #[test]
    fn offset_update_installs_and_advertises() {
        let cfg = quick_config();
        let (events_s, events_r) = sync_channel(4);
        let transport = Arc::new(Transport::bind(0).unwrap());
        let client = Client::new(transport, cfg, MockCamera::new(), events_s);
        client.on_offset_update(&Datagram {
            method: methods::OFFSET_UPDATE,
            sender: SocketAddr::from(([127, 0, 0, 1], 1)),
            payload: "999950,50".to_string(),
            rx_ns: 0,
        });
        let offset = client.clock.current().unwrap();
        assert_eq!(offset.offset_ns, 999_950);
        assert_eq!(offset.error_bound_ns, 50);
        assert!(matches!(
            events_r.try_recv().unwrap(),
            EventRecord::OffsetUpdate(_)
        ));
    }

    #[test]
    fn two_a_values_reach_the_camera() {
        let cfg = quick_config();
        let (events_s, _events_r) = sync_channel(4);
        let transport = Arc::new(Transport::bind(0).unwrap());
        let camera = MockCamera::new();
        let client = Client::new(transport, cfg, camera.clone(), events_s);
        client.on_2a(&Datagram {
            method: methods::SET_2A,
            sender: SocketAddr::from(([127, 0, 0, 1], 1)),
            payload: "8333333,400".to_string(),
            rx_ns: 0,
        });
        let requests = camera.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, 8_333_333);
        assert_eq!(requests[0].2, 400);
        assert_eq!(client.sensitivity.load(Ordering::Acquire), 400);
    }
}
