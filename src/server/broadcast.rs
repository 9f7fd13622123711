//! Fan-out of control events to authenticated clients.
//!
//! Each connection registers a bounded outbound queue plus a kill switch.
//! A client that cannot keep up is killed rather than allowed to block a
//! session read loop or the broadcast cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;

use crate::common::mutex_lock_or_recover;

use super::protocol::ServerEvent;

/// One frame queued for a client: control events travel as binary JSON,
/// terminal output as text.
#[derive(Debug)]
pub enum Outbound {
    Event(String),
    Data(String),
}

/// Everything needed to push frames at one client from any thread. Sends
/// that find the queue full or closed trip the kill switch, which the
/// connection task observes and closes the socket.
#[derive(Clone)]
pub struct ClientHandle {
    out_tx: mpsc::Sender<Outbound>,
    kill: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    pub fn new(out_tx: mpsc::Sender<Outbound>, kill: Arc<watch::Sender<bool>>) -> Self {
        Self { out_tx, kill }
    }

    /// Returns false when the client is dead or overflowing; the kill
    /// switch has been tripped in that case.
    pub fn send(&self, frame: Outbound) -> bool {
        match self.out_tx.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "Client outbound queue unavailable; killing connection");
                let _ = self.kill.send(true);
                false
            }
        }
    }

    pub fn send_event(&self, event: &ServerEvent) -> bool {
        self.send(Outbound::Event(event.to_json()))
    }
}

pub struct Broadcaster {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an authenticated client; the returned id unregisters it.
    pub fn register(&self, handle: ClientHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock_or_recover(&self.clients, "client registry").insert(id, handle);
        id
    }

    pub fn unregister(&self, id: u64) {
        mutex_lock_or_recover(&self.clients, "client registry").remove(&id);
    }

    pub fn client_count(&self) -> usize {
        mutex_lock_or_recover(&self.clients, "client registry").len()
    }

    /// Serialize once, fan out to every registered client. Dead clients
    /// are dropped from the registry as a side effect.
    pub fn broadcast(&self, event: &ServerEvent) {
        let payload = event.to_json();
        let mut clients = mutex_lock_or_recover(&self.clients, "client registry");
        clients.retain(|_, handle| handle.send(Outbound::Event(payload.clone())));
    }
}
