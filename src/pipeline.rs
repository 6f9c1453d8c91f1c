use crate::{
    args,
    clock::ClockMap,
    collate::Collator,
    common::{CameraControl, LogCamera, MatchedBundle, BLOCK_TIMEOUT},
    config::Config,
    db,
    leader::Leader,
    membership::{heartbeat_task, Roster},
    monitoring,
    persist::{persist_task, PersistJob},
    phase::{PhaseAligner, PhaseReport},
    rpc::{probe_local_ip, subnet_broadcast, Transport},
    trigger::{TriggerScheduler, Verdict},
};
pub use clap::Parser;
use core_affinity::CoreId;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread::JoinHandle,
};
use thingbuf::mpsc::blocking::{channel, Sender};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tracing::{debug, info, warn};

/// Bundles waiting on the sync worker
const BUNDLE_QUEUE: usize = 256;
/// Captures waiting on the persistence worker
const PERSIST_QUEUE: usize = 16;

/// The sync worker: drains matched bundles, converts them into the leader's
/// time domain, runs the phase controller, and judges them against the armed
/// trigger. The one consumer of the collator's sink on either role.
#[allow(clippy::too_many_arguments)]
pub fn sync_task(
    bundles: Receiver<MatchedBundle>,
    clock: Arc<ClockMap>,
    mut aligner: PhaseAligner,
    trigger: Arc<TriggerScheduler>,
    align_requested: Arc<AtomicBool>,
    sensitivity: Arc<AtomicI32>,
    collator: Arc<Collator>,
    persist: Sender<PersistJob>,
    phase_reports: SyncSender<PhaseReport>,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting sync worker");
    loop {
        if shutdown.try_recv().is_ok() {
            info!("Sync worker stopping");
            break;
        }
        let bundle = match bundles.recv_timeout(BLOCK_TIMEOUT) {
            Ok(b) => b,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if align_requested.swap(false, Ordering::AcqRel) {
            aligner.start();
        }
        aligner.set_sensitivity(sensitivity.load(Ordering::Acquire));
        let leader_ts = match clock.leader_of(bundle.sensor_timestamp_ns()) {
            Ok(t) => t,
            Err(e) => {
                // Frames arriving before the first offset install can't be
                // scheduled or measured, let them go
                debug!("Releasing unconvertible bundle - {e}");
                collator.release_bundle(&bundle);
                continue;
            }
        };
        match aligner.observe(leader_ts) {
            Ok(Some(report)) => {
                let _ = phase_reports.try_send(report);
            }
            Ok(None) => (),
            Err(e) => warn!("Phase injection failed - {e}"),
        }
        match trigger.evaluate(leader_ts, bundle.is_injection()) {
            Verdict::Persist {
                goal_leader_ns,
                lead_underflow,
            } => {
                // Ownership of the bundle's buffers rides along; the persist
                // worker releases them once written
                if persist
                    .send(PersistJob {
                        bundle,
                        leader_ts_ns: leader_ts,
                        goal_ns: goal_leader_ns,
                        lead_underflow,
                    })
                    .is_err()
                {
                    eyre::bail!("Persistence queue closed");
                }
            }
            Verdict::Discard => collator.release_bundle(&bundle),
        }
    }
    Ok(())
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn start_pipeline(cli: args::Cli) -> eyre::Result<Vec<JoinHandle<eyre::Result<()>>>> {
    // Load the shared rig config, the CLI may pin the RPC port
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.rpc_port {
        cfg.rpc_port = port;
    }
    // Connect to the sqlite event database
    let conn = db::connect_and_create(cli.db_path)?;
    // Setup the exit handler
    let (sd_s, sd_recv_r) = broadcast::channel(1);
    let sd_disp_r = sd_s.subscribe();
    let sd_sync_r = sd_s.subscribe();
    let sd_persist_r = sd_s.subscribe();
    let sd_db_r = sd_s.subscribe();
    let sd_mon_r = sd_s.subscribe();
    let sd_role_r = sd_s.subscribe();
    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).unwrap();
        let mut quit = signal(SignalKind::quit()).unwrap();
        let mut int = signal(SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = term.recv() => (),
            _ = quit.recv() => (),
            _ = int.recv() => (),
        }
        info!("Shutting down!");
        sd_s.send(()).unwrap()
    });

    // The transport both roles speak through
    let transport = Arc::new(Transport::bind(cfg.rpc_port)?);
    info!("RPC transport bound to {}", transport.local_addr()?);

    // The camera seam; a host integration replaces this with the real sensor
    let camera: Arc<dyn CameraControl> = Arc::new(LogCamera);

    // Frame plumbing: collator -> sync worker -> persistence
    let collator = Arc::new(Collator::new(&cfg.max_outstanding));
    let (bundle_s, bundle_r) = sync_channel(BUNDLE_QUEUE);
    collator.register_sink(bundle_s);
    let (persist_s, persist_r) = channel(PERSIST_QUEUE);

    // Less important channels, these don't have to be bounded tightly
    let (event_s, event_r) = sync_channel(64);
    let (report_s, report_r) = sync_channel(16);

    // Get the CPU core range; pipeline threads cycle over it
    let mut cpus = cli.core_range.clone().cycle();
    // Start the threads
    macro_rules! thread_spawn {
            ($(($thread_name:literal, $fcall:expr)), +) => {
                  vec![$({let cpu = cpus.next().unwrap();
                    std::thread::Builder::new()
                        .name($thread_name.to_string())
                        .spawn( move || {
                            if !core_affinity::set_for_current(CoreId { id: cpu}) {
                                warn!("Couldn't set core affinity on thread {}", $thread_name);
                            }
                            $fcall
                        })
                        .unwrap()}),+]
            };
    }

    let (disp_s, disp_r) = sync_channel(512);
    let aligner = PhaseAligner::new(cfg.phase.clone(), camera.clone());

    let mut handles = vec![];

    // Role-specific wiring: the controller, its handlers, and its periodic
    // driver (eviction on the leader, heartbeats on the client)
    let (clock, trigger, align_requested, sensitivity) = match cli.role {
        args::Role::Leader => {
            let clock = Arc::new(ClockMap::identity());
            let roster = Arc::new(Roster::new(cfg.expiry_ns()));
            monitoring::register_roster(roster.clone());
            let leader = Leader::new(
                transport.clone(),
                roster,
                cfg.clone(),
                camera.clone(),
                event_s.clone(),
            );
            leader.install_handlers();
            let trigger = leader.trigger.clone();
            let align_requested = leader.align_requested.clone();
            let sensitivity = leader.sensitivity.clone();
            let mut these_handles =
                thread_spawn!(("evict", { leader.eviction_task(sd_role_r) }));
            handles.append(&mut these_handles);
            (clock, trigger, align_requested, sensitivity)
        }
        args::Role::Client {
            client_id,
            broadcast,
        } => {
            let client = crate::client::Client::new(
                transport.clone(),
                cfg.clone(),
                camera.clone(),
                event_s.clone(),
            );
            client.install_handlers();
            // Until the first ack, heartbeats go to the subnet broadcast
            let bcast_ip = match broadcast {
                Some(ip) => ip,
                None => subnet_broadcast(probe_local_ip()?),
            };
            let fallback = SocketAddr::from((bcast_ip, cfg.rpc_port));
            info!(%fallback, "Leader unknown, will broadcast heartbeats");
            let clock = client.clock.clone();
            let trigger = client.trigger.clone();
            let align_requested = client.align_requested.clone();
            let sensitivity = client.sensitivity.clone();
            let hb_transport = transport.clone();
            let hb_clock = clock.clone();
            let hb_leader_addr = client.leader_addr.clone();
            let period = cfg.heartbeat_period();
            let mut these_handles = thread_spawn!(("heartbeat", {
                heartbeat_task(
                    hb_transport,
                    hb_clock,
                    hb_leader_addr,
                    fallback,
                    client_id,
                    period,
                    sd_role_r,
                )
            }));
            handles.append(&mut these_handles);
            (clock, trigger, align_requested, sensitivity)
        }
    };
    monitoring::register_clock(clock.clone());

    // Spawn the rest of the threads
    let recv_transport = transport.clone();
    let disp_transport = transport.clone();
    let mon_transport = transport.clone();
    let sync_collator = collator.clone();
    let persist_collator = collator.clone();
    let mon_collator = collator.clone();
    let capture_path = cli.capture_path.clone();
    let mut these_handles = thread_spawn!(
        ("rpc-recv", { recv_transport.recv_loop(disp_s, sd_recv_r) }),
        ("dispatch", { disp_transport.dispatch_task(disp_r, sd_disp_r) }),
        ("sync", {
            sync_task(
                bundle_r,
                clock,
                aligner,
                trigger,
                align_requested,
                sensitivity,
                sync_collator,
                persist_s,
                report_s,
                sd_sync_r,
            )
        }),
        ("persist", {
            persist_task(capture_path, persist_r, persist_collator, event_s, sd_persist_r)
        }),
        ("db", { monitoring::db_task(conn, event_r, sd_db_r) }),
        ("monitor", {
            monitoring::monitor_task(mon_transport, mon_collator, report_r, sd_mon_r)
        })
    );
    handles.append(&mut these_handles);

    // Start the webserver
    tokio::spawn(monitoring::start_web_server(cli.metrics_port)?);

    Ok(handles)
}
