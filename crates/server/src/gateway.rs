//! WebSocket fan-out registry.
//!
//! The gateway maps each authenticated user to the outbound queue of their
//! one socket. Emission is fire-and-forget: a slow client gets events
//! dropped, never backpressure onto the frame path. The socket pump itself
//! lives in the web layer; this module only owns addressing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::state::now_ms;

/// Outbound events queued per client before the socket pump drains them.
const CLIENT_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event vocabulary (server -> client)
// ---------------------------------------------------------------------------

pub const EV_DATA: &str = "ventilator:data";
pub const EV_ALARM: &str = "ventilator:alarm";
pub const EV_STATUS: &str = "ventilator:status";
pub const EV_COMMAND_ACK: &str = "ventilator:command:ack";
pub const EV_RESERVE_RESPONSE: &str = "ventilator:reserve:response";
pub const EV_RESERVED: &str = "ventilator:reserved";
pub const EV_RELEASED: &str = "ventilator:released";
pub const EV_ERROR: &str = "ventilator:error";
pub const EV_NOTIFICATION: &str = "notification";
pub const EV_PONG: &str = "pong";
pub const EV_AUTHENTICATED: &str = "authenticated";
pub const EV_AUTH_ERROR: &str = "auth_error";

/// Serialize the `{event, data}` envelope every outbound message uses.
pub fn envelope(event: &str, data: &Value) -> String {
    serde_json::json!({ "event": event, "data": data }).to_string()
}

// ---------------------------------------------------------------------------
// Client registry
// ---------------------------------------------------------------------------

struct ClientHandle {
    sender: mpsc::Sender<String>,
    conn_id: u64,
    authenticated_at: i64,
    /// Cleared by `unsubscribe:data`; gates device telemetry only.
    wants_device_data: bool,
}

#[derive(Default)]
pub struct Gateway {
    clients: RwLock<HashMap<String, ClientHandle>>,
    next_conn_id: AtomicU64,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated socket and return its connection id.
    ///
    /// A user admits one socket: registering again drops the previous
    /// sender, which ends the old socket's pump and closes it.
    pub async fn register(&self, user_id: &str, sender: mpsc::Sender<String>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = ClientHandle {
            sender,
            conn_id,
            authenticated_at: now_ms(),
            wants_device_data: true,
        };
        let previous = self.clients.write().await.insert(user_id.to_string(), handle);
        if previous.is_some() {
            debug!(user = %user_id, "existing socket displaced by new authenticate");
        }
        conn_id
    }

    /// Remove the mapping, but only if it still belongs to this connection
    /// (a displaced socket must not evict its successor).
    pub async fn deregister(&self, user_id: &str, conn_id: u64) {
        let mut clients = self.clients.write().await;
        if clients.get(user_id).is_some_and(|c| c.conn_id == conn_id) {
            clients.remove(user_id);
        }
    }

    pub async fn set_wants_device_data(&self, user_id: &str, wants: bool) {
        if let Some(client) = self.clients.write().await.get_mut(user_id) {
            client.wants_device_data = wants;
        }
    }

    /// Deliver to one user's socket. Silent no-op when the user has no
    /// socket; dropped with a warning when their queue is full.
    pub async fn send_to_user(&self, user_id: &str, event: &str, data: &Value) {
        let clients = self.clients.read().await;
        let Some(client) = clients.get(user_id) else {
            return;
        };
        push(user_id, client, event, data);
    }

    /// Fan out to every connected client.
    pub async fn broadcast(&self, event: &str, data: &Value) {
        let clients = self.clients.read().await;
        for (user_id, client) in clients.iter() {
            push(user_id, client, event, data);
        }
    }

    /// Fan out device telemetry, honouring per-client `unsubscribe:data`.
    pub async fn broadcast_data(&self, event: &str, data: &Value) {
        let clients = self.clients.read().await;
        for (user_id, client) in clients.iter() {
            if client.wants_device_data {
                push(user_id, client, event, data);
            }
        }
    }

    pub async fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<_> = self.clients.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn is_user_connected(&self, user_id: &str) -> bool {
        self.clients.read().await.contains_key(user_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn authenticated_at(&self, user_id: &str) -> Option<i64> {
        self.clients
            .read()
            .await
            .get(user_id)
            .map(|c| c.authenticated_at)
    }
}

fn push(user_id: &str, client: &ClientHandle, event: &str, data: &Value) {
    if client.sender.try_send(envelope(event, data)).is_err() {
        warn!(user = %user_id, event, "client queue full or closed — event dropped");
    }
}

pub fn client_queue() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(CLIENT_QUEUE_CAPACITY)
}

// ===========================================================================
// Tests
// ===========================================================================
