//! Who is on the rig: the leader's roster of live clients and their sync
//! state, plus the client-side heartbeat loop that populates it

use crate::{
    clock::{ClockMap, Offset},
    rpc::{methods, Transport},
};
use std::{
    net::SocketAddr,
    sync::{mpsc::SyncSender, Arc, Mutex},
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Where a client sits in the offset negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No usable offset on either end
    Unsynced,
    /// An offset update is in flight but the client has not acknowledged it
    Syncing,
    /// The client acknowledged the offset the leader last sent
    Synced,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub addr: SocketAddr,
    pub client_id: String,
    pub last_heartbeat_ns: u64,
    pub sync_state: SyncState,
    pub negotiated_offset: Option<Offset>,
}

/// Pushed to the registered observer on joins, evictions, and sync-state
/// transitions
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(SocketAddr),
    Evicted(SocketAddr),
    StateChanged(SocketAddr, SyncState),
}

/// What the heartbeat handler should do next for this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatDisposition {
    /// The client has no offset, start an exchange burst (unless one is
    /// already in flight)
    pub needs_sntp: bool,
}

/// The leader's insertion-ordered roster. Guarded by one mutex; observers are
/// notified outside state transitions only through the bounded event channel.
pub struct Roster {
    expiry_ns: u64,
    records: Mutex<Vec<ClientRecord>>,
    observer: Mutex<Option<SyncSender<MembershipEvent>>>,
}

impl Roster {
    pub fn new(expiry_ns: u64) -> Self {
        Self {
            expiry_ns,
            records: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    pub fn observe(&self, events: SyncSender<MembershipEvent>) {
        *self.observer.lock().unwrap() = Some(events);
    }

    fn notify(&self, event: MembershipEvent) {
        if let Some(obs) = self.observer.lock().unwrap().as_ref() {
            // Observers are advisory (UI, logs); a full queue loses events
            // rather than stalling the protocol
            let _ = obs.try_send(event);
        }
    }

    /// Fold one heartbeat into the roster
    pub fn heartbeat(
        &self,
        addr: SocketAddr,
        client_id: &str,
        synced: bool,
        now_ns: u64,
    ) -> HeartbeatDisposition {
        let mut joined = false;
        let mut transition = None;
        {
            let mut records = self.records.lock().unwrap();
            match records.iter_mut().find(|r| r.addr == addr) {
                Some(record) => {
                    record.last_heartbeat_ns = now_ns;
                    record.client_id = client_id.to_string();
                    let next_state = match (synced, record.negotiated_offset) {
                        (true, Some(_)) => SyncState::Synced,
                        // The client believes it is synced but we never
                        // negotiated with it (leader restart); renegotiate
                        (true, None) => SyncState::Syncing,
                        (false, _) => SyncState::Unsynced,
                    };
                    if next_state != record.sync_state {
                        transition = Some(next_state);
                    }
                    record.sync_state = next_state;
                }
                None => {
                    info!(client = %addr, client_id, "Client joined");
                    records.push(ClientRecord {
                        addr,
                        client_id: client_id.to_string(),
                        last_heartbeat_ns: now_ns,
                        sync_state: SyncState::Unsynced,
                        negotiated_offset: None,
                    });
                    joined = true;
                }
            }
        }
        if joined {
            self.notify(MembershipEvent::Joined(addr));
        }
        if let Some(state) = transition {
            self.notify(MembershipEvent::StateChanged(addr, state));
        }
        HeartbeatDisposition { needs_sntp: !synced }
    }

    /// Record the offset we just pushed to `addr`; the state stays `Syncing`
    /// until the client's next heartbeat acknowledges it
    pub fn offset_negotiated(&self, addr: SocketAddr, offset: Offset) {
        let mut found = false;
        {
            let mut records = self.records.lock().unwrap();
            if let Some(r) = records.iter_mut().find(|r| r.addr == addr) {
                r.negotiated_offset = Some(offset);
                r.sync_state = SyncState::Syncing;
                found = true;
            }
        }
        if found {
            self.notify(MembershipEvent::StateChanged(addr, SyncState::Syncing));
        }
    }

    /// The negotiation failed outright, forget any offset we held
    pub fn mark_unsynced(&self, addr: SocketAddr) {
        let mut found = false;
        {
            let mut records = self.records.lock().unwrap();
            if let Some(r) = records.iter_mut().find(|r| r.addr == addr) {
                r.negotiated_offset = None;
                r.sync_state = SyncState::Unsynced;
                found = true;
            }
        }
        if found {
            self.notify(MembershipEvent::StateChanged(addr, SyncState::Unsynced));
        }
    }

    /// Drop every record whose last heartbeat is older than the expiry
    pub fn evict_stale(&self, now_ns: u64) -> Vec<SocketAddr> {
        let mut records = self.records.lock().unwrap();
        let mut evicted = Vec::new();
        records.retain(|r| {
            let stale = now_ns.saturating_sub(r.last_heartbeat_ns) > self.expiry_ns;
            if stale {
                warn!(client = %r.addr, client_id = %r.client_id, "Evicting stale client");
                evicted.push(r.addr);
            }
            !stale
        });
        drop(records);
        for addr in &evicted {
            self.notify(MembershipEvent::Evicted(*addr));
        }
        evicted
    }

    pub fn clients(&self) -> Vec<ClientRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.records.lock().unwrap().iter().map(|r| r.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client-side heartbeat loop. Until a `HEARTBEAT_ACK` latches the leader's
/// address, heartbeats go to the subnet broadcast address.
pub fn heartbeat_task(
    transport: Arc<Transport>,
    clock: Arc<ClockMap>,
    leader_addr: Arc<Mutex<Option<SocketAddr>>>,
    fallback: SocketAddr,
    client_id: String,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!(client_id, "Starting heartbeat task");
    loop {
        if shutdown.try_recv().is_ok() {
            info!("Heartbeat task stopping");
            break;
        }
        let target = leader_addr.lock().unwrap().unwrap_or(fallback);
        let payload = format!("{},{}", client_id, clock.is_synced());
        if let Err(e) = transport.send_to(target, methods::HEARTBEAT, &payload) {
            // Transient send failures are expected on a flaky hotspot, the
            // next beat retries
            warn!("Failed to send heartbeat - {e}");
        }
        std::thread::sleep(period);
    }
    Ok(())
}
