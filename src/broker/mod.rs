//! Session/compute broker.
//!
//! Maps client sessions onto a bounded pool of compute contexts, remembers the
//! views each context's clients asked for, and republishes those views after
//! every state-mutating call.
//!
//! ```text
//!   client command ─► lifecycle (init / load_data / endSession)
//!                 └─► dispatch ─► channel ─► compute worker
//!                        │
//!                        └─ mutating ─► fanout ─► events ─► attached clients
//! ```

pub mod channel;
pub mod dispatch;
pub mod events;
pub mod fanout;
pub mod key;
pub mod lifecycle;
pub mod registry;
pub mod views;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use channel::{ComputeClient, ComputeTransport};
use events::ClientHub;
use key::{SessionId, SessionKey, WorkerKind, DEFAULT_SHARED_SESSION_ID};
use registry::Registry;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a compute call or a dispatch did not produce a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    /// The worker could not be reached (after the retry).
    #[error("compute worker unreachable: {0}")]
    Transport(String),

    /// The worker answered with an exception payload.
    #[error("{message}")]
    Fault { message: String, fatal: bool },

    /// The reply could not be split into its expected fields.
    #[error("malformed worker reply: {0}")]
    Protocol(String),

    #[error("no compute context for {0}; call init first")]
    NoContext(SessionKey),

    #[error("no dataset loaded for {0}; call load_data first")]
    NotLoaded(SessionKey),

    #[error("data for {0} is still loading")]
    Busy(SessionKey),

    /// The context was invalidated while the call was in flight.
    #[error("session {0} ended before the request completed")]
    Superseded(SessionKey),

    #[error("no compute worker configured for engine {0}")]
    UnknownWorker(WorkerKind),

    #[error("{0} is not a data command")]
    NotDispatchable(&'static str),
}

impl ComputeError {
    /// `true` when the worker has lost the context and it must be invalidated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ComputeError::Fault { fatal: true, .. })
    }
}

// ── Query result ──────────────────────────────────────────────────────────────

/// What a client receives for one call: the worker's payload plus timings in
/// seconds. `error` travels beside the result, not inside its JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub data:           String,
    pub compute_time:   f64,
    pub broker_time:    f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_filters: Option<String>,
    #[serde(skip)]
    pub error:          bool,
}

impl QueryResult {
    pub fn ok(
        data:           impl Into<String>,
        compute_time:   f64,
        broker_time:    f64,
        active_filters: Option<String>,
    ) -> Self {
        QueryResult {
            data: data.into(),
            compute_time,
            broker_time,
            active_filters,
            error: false,
        }
    }

    pub fn failure(message: impl Into<String>, compute_time: f64, broker_time: f64) -> Self {
        QueryResult {
            data: message.into(),
            compute_time,
            broker_time,
            active_filters: None,
            error: true,
        }
    }

    /// Answered by the broker itself, without a worker round-trip.
    pub fn local(data: impl Into<String>) -> Self {
        QueryResult::ok(data, 0.0, 0.0, None)
    }
}

/// Broker-side share of `wall` seconds, given the worker spent `compute`.
pub fn broker_seconds(wall: f64, compute: f64) -> f64 {
    (wall - compute).max(0.0)
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Size of the compute slot pool.
    pub max_contexts:        usize,
    pub idle_timeout:        Duration,
    pub sweep_interval:      Duration,
    /// Hold a per-context lock across each mutating call and its fan-out.
    pub serialize_mutations: bool,
    /// Session every tab shares when a client opts out of sessions.
    pub shared_session_id:   SessionId,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_contexts:        1,
            idle_timeout:        Duration::from_secs(1800),
            sweep_interval:      Duration::from_secs(60),
            serialize_mutations: false,
            shared_session_id:   SessionId::new(DEFAULT_SHARED_SESSION_ID),
        }
    }
}

// ── Broker ────────────────────────────────────────────────────────────────────

struct Shared<T> {
    registry: Registry,
    client:   ComputeClient<T>,
    hub:      ClientHub,
    settings: BrokerSettings,
}

/// Cheaply cloneable handle to one broker instance.
pub struct Broker<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Broker { shared: Arc::clone(&self.shared) }
    }
}

impl<T: ComputeTransport> Broker<T> {
    pub fn new(client: ComputeClient<T>, settings: BrokerSettings) -> Self {
        Broker {
            shared: Arc::new(Shared {
                registry: Registry::new(settings.max_contexts),
                client,
                hub: ClientHub::new(),
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &Registry { &self.shared.registry }

    pub fn hub(&self) -> &ClientHub { &self.shared.hub }

    pub fn settings(&self) -> &BrokerSettings { &self.shared.settings }

    pub(crate) fn client(&self) -> &ComputeClient<T> { &self.shared.client }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the broker's unit tests.

    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::channel::testing::ScriptedTransport;
    use super::channel::ComputeClient;
    use super::events::{BrokerEvent, ConnectionId, Outbound, OutboundRx};
    use super::key::{SessionId, SessionKey, WorkerKind};
    use super::wire::ReplyCodec;
    use super::{Broker, BrokerSettings};

    pub fn key(session: &str, dataset: &str) -> SessionKey {
        SessionKey::new(SessionId::new(session), dataset, WorkerKind::new("cudf"))
    }

    pub fn broker_with(settings: BrokerSettings) -> (Broker<ScriptedTransport>, ScriptedTransport) {
        let transport = ScriptedTransport::new();
        let client = ComputeClient::new(transport.clone(), ReplyCodec::default(), Duration::from_millis(1000));
        (Broker::new(client, settings), transport)
    }

    pub fn broker() -> (Broker<ScriptedTransport>, ScriptedTransport) {
        broker_with(BrokerSettings::default())
    }

    /// Attach a fresh client connection to `session`.
    pub fn attach(broker: &Broker<ScriptedTransport>, session: &SessionId) -> (ConnectionId, OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        broker.hub().join(session, conn, tx);
        (conn, rx)
    }

    /// Every event already queued for a client.
    pub fn drain(rx: &mut OutboundRx) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Event(event) = out {
                events.push(event);
            }
        }
        events
    }

    /// Init and load `key` against a worker that accepts everything.
    pub async fn ready(broker: &Broker<ScriptedTransport>, key: &SessionKey) {
        broker.init(key).await.unwrap();
        broker.load_data(key, "arrow").await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_result_serializes_camel_case_without_error_flag() {
        let result = QueryResult::ok("42", 0.5, 0.125, Some("{}".into()));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, serde_json::json!({
            "data": "42",
            "computeTime": 0.5,
            "brokerTime": 0.125,
            "activeFilters": "{}"
        }));
    }

    #[test]
    fn broker_time_never_negative() {
        assert_eq!(broker_seconds(0.2, 0.5), 0.0);
        assert!((broker_seconds(1.0, 0.25) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn only_fatal_faults_are_fatal() {
        assert!(ComputeError::Fault { message: "oom".into(), fatal: true }.is_fatal());
        assert!(!ComputeError::Fault { message: "bad column".into(), fatal: false }.is_fatal());
        assert!(!ComputeError::Transport("refused".into()).is_fatal());
    }
}
