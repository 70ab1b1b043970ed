//! Events pushed to clients and the hub that routes them.
//!
//! Every client connection that has called `init` is attached to the room of
//! its [`SessionId`]. Publishing to a session delivers to every attached
//! connection, which in shared mode means every open tab.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::key::{SessionId, SessionKey};
use super::QueryResult;

/// Identifies one client connection.
pub type ConnectionId = Uuid;

/// Unsolicited event pushed to every connection of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "args", rename_all = "snake_case")]
pub enum BrokerEvent {
    UpdateSize {
        dataset: String,
        engine:  String,
        size:    String,
    },
    UpdateDimension {
        dataset:   String,
        engine:    String,
        dimension: String,
        result:    QueryResult,
    },
    UpdateHist {
        dataset:   String,
        engine:    String,
        dimension: String,
        result:    QueryResult,
    },
    UpdateGroup {
        dataset:     String,
        engine:      String,
        dimension:   String,
        aggregation: String,
        result:      QueryResult,
    },
    AllUpdatesComplete {
        dataset: String,
        engine:  String,
    },
    SessionEnded {
        dataset: String,
        engine:  String,
        message: String,
    },
}

impl BrokerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::UpdateSize { .. }         => "update_size",
            BrokerEvent::UpdateDimension { .. }    => "update_dimension",
            BrokerEvent::UpdateHist { .. }         => "update_hist",
            BrokerEvent::UpdateGroup { .. }        => "update_group",
            BrokerEvent::AllUpdatesComplete { .. } => "all_updates_complete",
            BrokerEvent::SessionEnded { .. }       => "session_ended",
        }
    }

    pub fn update_size(key: &SessionKey, size: impl Into<String>) -> Self {
        BrokerEvent::UpdateSize {
            dataset: key.dataset.clone(),
            engine:  key.worker.to_string(),
            size:    size.into(),
        }
    }

    pub fn all_updates_complete(key: &SessionKey) -> Self {
        BrokerEvent::AllUpdatesComplete {
            dataset: key.dataset.clone(),
            engine:  key.worker.to_string(),
        }
    }

    pub fn session_ended(key: &SessionKey, message: impl Into<String>) -> Self {
        BrokerEvent::SessionEnded {
            dataset: key.dataset.clone(),
            engine:  key.worker.to_string(),
            message: message.into(),
        }
    }
}

/// Anything written to a client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Answer to the client request carrying `id`.
    Reply {
        id:     Option<u64>,
        result: QueryResult,
    },
    Event(BrokerEvent),
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Session rooms: which connections receive a session's events.
#[derive(Debug, Default)]
pub struct ClientHub {
    rooms: Mutex<HashMap<SessionId, HashMap<ConnectionId, OutboundTx>>>,
}

impl ClientHub {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, HashMap<ConnectionId, OutboundTx>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `conn` to `session`'s room. Re-joining is a no-op.
    pub fn join(&self, session: &SessionId, conn: ConnectionId, tx: OutboundTx) {
        self.lock().entry(session.clone()).or_default().insert(conn, tx);
        debug!("connection {conn} joined session {session}");
    }

    pub fn leave(&self, session: &SessionId, conn: ConnectionId) {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get_mut(session) {
            room.remove(&conn);
            if room.is_empty() {
                rooms.remove(session);
            }
        }
    }

    /// Number of connections attached to `session`.
    pub fn attached(&self, session: &SessionId) -> usize {
        self.lock().get(session).map_or(0, HashMap::len)
    }

    /// Deliver `event` to every connection of `session`; returns how many
    /// connections received it.
    pub fn publish(&self, session: &SessionId, event: BrokerEvent) -> usize {
        self.publish_except(session, None, event)
    }

    /// Like [`publish`](Self::publish), skipping `except`.
    pub fn publish_except(
        &self,
        session: &SessionId,
        except:  Option<ConnectionId>,
        event:   BrokerEvent,
    ) -> usize {
        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(session) else { return 0 };
        // Connections whose receiver is gone are dropped from the room.
        room.retain(|_, tx| !tx.is_closed());
        let mut delivered = 0;
        for (conn, tx) in room.iter() {
            if Some(*conn) == except {
                continue;
            }
            if tx.send(Outbound::Event(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        debug!("{} for session {session} delivered to {delivered} connection(s)", event.name());
        delivered
    }
}
