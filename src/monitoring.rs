//! Prometheus gauges, status endpoints, and the event-db writer task

use crate::clock::ClockMap;
use crate::collate::Collator;
use crate::common::BLOCK_TIMEOUT;
use crate::db::EventRecord;
use crate::membership::Roster;
use crate::phase::PhaseReport;
use crate::rpc::Transport;
use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use paste::paste;
use prometheus::{
    register_gauge_vec, register_int_gauge, GaugeVec, IntGauge, TextEncoder,
};
use rusqlite::Connection;
use std::sync::{
    mpsc::{Receiver, RecvTimeoutError},
    Arc, Mutex, OnceLock,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;

/// How often scrape-style gauges are refreshed from their sources
const GAUGE_REFRESH: Duration = Duration::from_secs(1);

macro_rules! static_prom {
    ($name:ident, $kind: ty, $create:expr) => {
        paste! {
            fn $name() -> &'static $kind {
                static [<$name:upper>]: OnceLock<$kind> = OnceLock::new();
                [<$name:upper>].get_or_init(|| { $create })
            }
        }
    };
}

// Global prometheus state variables
static_prom!(
    rpc_received_gauge,
    IntGauge,
    register_int_gauge!("rpc_received", "Datagrams received").unwrap()
);
static_prom!(
    rpc_sent_gauge,
    IntGauge,
    register_int_gauge!("rpc_sent", "Datagrams sent").unwrap()
);
static_prom!(
    rpc_dropped_gauge,
    IntGauge,
    register_int_gauge!(
        "rpc_dropped",
        "Datagrams dropped as malformed or unroutable"
    )
    .unwrap()
);
static_prom!(
    matched_gauge,
    IntGauge,
    register_int_gauge!("matched_bundles", "Bundles emitted by the collator").unwrap()
);
static_prom!(
    dropped_image_gauge,
    IntGauge,
    register_int_gauge!(
        "dropped_images",
        "Target slots whose image never arrived"
    )
    .unwrap()
);
static_prom!(
    orphaned_image_gauge,
    IntGauge,
    register_int_gauge!(
        "orphaned_images",
        "Images released because their metadata never arrived"
    )
    .unwrap()
);
static_prom!(
    outstanding_gauge,
    GaugeVec,
    register_gauge_vec!(
        "outstanding_buffers",
        "Acquired but unreleased image buffers",
        &["stream"]
    )
    .unwrap()
);
static_prom!(
    phase_error_gauge,
    IntGauge,
    register_int_gauge!("phase_error_ns", "Last measured frame phase error").unwrap()
);
static_prom!(
    phase_aligned_gauge,
    IntGauge,
    register_int_gauge!("phase_aligned", "1 when the frame phase is in tolerance").unwrap()
);
static_prom!(
    client_gauge,
    IntGauge,
    register_int_gauge!("clients", "Live clients on the leader's roster").unwrap()
);
static_prom!(
    offset_gauge,
    IntGauge,
    register_int_gauge!("offset_ns", "Installed clock offset").unwrap()
);
static_prom!(
    offset_error_bound_gauge,
    IntGauge,
    register_int_gauge!("offset_error_bound_ns", "Installed offset error bound").unwrap()
);

/// The roster behind `/clients`, registered once by the leader pipeline
fn shared_roster() -> &'static Mutex<Option<Arc<Roster>>> {
    static ROSTER: OnceLock<Mutex<Option<Arc<Roster>>>> = OnceLock::new();
    ROSTER.get_or_init(|| Mutex::new(None))
}

pub fn register_roster(roster: Arc<Roster>) {
    *shared_roster().lock().unwrap() = Some(roster);
}

/// The clock map behind `/offset`, registered once at pipeline start
fn shared_clock() -> &'static Mutex<Option<Arc<ClockMap>>> {
    static CLOCK: OnceLock<Mutex<Option<Arc<ClockMap>>>> = OnceLock::new();
    CLOCK.get_or_init(|| Mutex::new(None))
}

pub fn register_clock(clock: Arc<ClockMap>) {
    *shared_clock().lock().unwrap() = Some(clock);
}

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    HttpResponse::Ok().body(encoder.encode_to_string(&metric_families).unwrap())
}

#[get("/clients")]
async fn clients() -> impl Responder {
    let body = match shared_roster().lock().unwrap().as_ref() {
        Some(roster) => roster
            .clients()
            .iter()
            .map(|r| format!("{} {} {:?}\n", r.addr, r.client_id, r.sync_state))
            .collect::<String>(),
        None => String::new(),
    };
    HttpResponse::Ok().body(body)
}

#[get("/offset")]
async fn offset() -> impl Responder {
    let body = match shared_clock().lock().unwrap().as_ref().and_then(|c| c.current()) {
        Some(o) => format!("{} {}\n", o.offset_ns, o.error_bound_ns),
        None => "unsynced\n".to_string(),
    };
    HttpResponse::Ok().body(body)
}

/// The monitor task refreshes the scrape gauges and folds in phase reports as
/// the sync worker publishes them
pub fn monitor_task(
    transport: Arc<Transport>,
    collator: Arc<Collator>,
    phase_reports: Receiver<PhaseReport>,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting monitoring task");
    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Monitoring task stopping");
            break;
        }

        // Blocking here is ok, phase reports are infrequent events
        match phase_reports.recv_timeout(GAUGE_REFRESH) {
            Ok(report) => {
                phase_error_gauge().set(report.phase_error_ns);
                phase_aligned_gauge().set(report.aligned.into());
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let rpc = transport.stats();
        rpc_received_gauge().set(rpc.received.try_into().unwrap());
        rpc_sent_gauge().set(rpc.sent.try_into().unwrap());
        rpc_dropped_gauge().set(rpc.dropped.try_into().unwrap());

        let collate = collator.stats();
        matched_gauge().set(collate.matched.try_into().unwrap());
        dropped_image_gauge().set(collate.dropped_images.try_into().unwrap());
        orphaned_image_gauge().set(collate.orphaned_images.try_into().unwrap());
        for i in 0..collator.n_streams() {
            outstanding_gauge()
                .with_label_values(&[&i.to_string()])
                .set(collator.outstanding(i) as f64);
        }

        if let Some(roster) = shared_roster().lock().unwrap().as_ref() {
            client_gauge().set(roster.len().try_into().unwrap());
        }
        if let Some(o) = shared_clock().lock().unwrap().as_ref().and_then(|c| c.current()) {
            offset_gauge().set(o.offset_ns);
            offset_error_bound_gauge().set(o.error_bound_ns.try_into().unwrap_or(i64::MAX));
        }
    }
    Ok(())
}

/// The db task serializes capture/offset events into sqlite
pub fn db_task(
    conn: Connection,
    events: Receiver<EventRecord>,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting event db task");
    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Event db task stopping");
            break;
        }
        match events.recv_timeout(BLOCK_TIMEOUT) {
            Ok(r) => match r.db_insert(&conn) {
                Ok(_) => (),
                Err(e) => warn!("Error processing DB event - {}", e),
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

pub fn start_web_server(metrics_port: u16) -> eyre::Result<Server> {
    info!("Starting metrics webserver");
    // Create the server coroutine
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default()) // Tracing middleware
            .service(metrics)
            .service(clients)
            .service(offset)
    })
    .bind(("0.0.0.0", metrics_port))?
    .workers(1)
    .run();
    // And return the coroutine for the caller to spawn
    Ok(server)
}
