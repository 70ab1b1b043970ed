//! Session Lifecycle Manager.
//!
//! Per compute slot: `NoSession → Established → Ready → Invalidated`.
//! `init` claims a slot (evicting the least-recently-active context when the
//! pool is full), `load_data` makes the context Ready, and `end_session`, a
//! fatal fault or the idle sweep invalidate it. Every invalidation tells the
//! context's clients with `session_ended`.

use log::{error, info, warn};
use tokio::time::Instant;

use super::channel::{CallFailure, CallResult, ComputeTransport};
use super::events::{BrokerEvent, ConnectionId};
use super::key::{SessionId, SessionKey, SessionToken};
use super::registry::{Acquired, ComputeContext, ContextHandle, ContextState};
use super::wire::WorkerCommand;
use super::{Broker, ComputeError, QueryResult};

pub const EVICTED_MESSAGE: &str = "your session has ended (and its dataframe was removed from \
     accelerator memory) because another session claimed the compute slot";

pub const EXPIRED_MESSAGE: &str = "session expired after inactivity";

pub const ENDED_MESSAGE: &str = "session ended by another client";

impl<T: ComputeTransport> Broker<T> {
    /// Session a client belongs to: its own, or the shared one when it opted
    /// out of sessions.
    pub fn resolve_session(&self, token: &SessionToken, use_sessions: bool) -> SessionId {
        if use_sessions {
            SessionId::from_token(token)
        } else {
            self.settings().shared_session_id.clone()
        }
    }

    /// Establish the compute context for `key`.
    ///
    /// Idempotent: an already established key answers immediately. Contexts
    /// evicted to free a slot are ended, and their clients told, before the
    /// new context is created.
    pub async fn init(&self, key: &SessionKey) -> CallResult {
        if self.registry().handle(key).is_some() {
            self.registry().touch(key, Instant::now());
            return Ok(QueryResult::local("connection already established"));
        }
        if !self.client().serves(&key.worker) {
            return Err(CallFailure::refused(ComputeError::UnknownWorker(key.worker.clone())));
        }

        for ctx in self.registry().make_room(key) {
            self.evict(ctx).await;
        }

        let result = self.client().call(key, &WorkerCommand::InitConnection).await?;

        let (acquired, evicted) = self.registry().acquire(key, Instant::now());
        for ctx in evicted {
            self.evict(ctx).await;
        }
        match acquired {
            Acquired::Established(handle) => {
                info!(
                    "{key}: compute context established (epoch {}, {}/{} slots in use)",
                    handle.epoch,
                    self.registry().sessions(),
                    self.registry().capacity(),
                );
                Ok(result)
            }
            Acquired::AlreadyEstablished(_) => Ok(QueryResult::local("connection already established")),
        }
    }

    /// Load the dataset named by `key` into its context.
    ///
    /// A second load of the same dataset on a Ready context is answered from
    /// local state without a worker round-trip.
    pub async fn load_data(&self, key: &SessionKey, load_type: &str) -> CallResult {
        let Some(handle) = self.registry().handle(key) else {
            return Err(CallFailure::refused(ComputeError::NoContext(key.clone())));
        };
        self.registry().touch(key, Instant::now());
        match handle.state {
            ContextState::Ready if handle.dataset_name.as_deref() == Some(key.dataset.as_str()) => {
                info!("{key}: data already loaded");
                return Ok(QueryResult::local("data already loaded"));
            }
            ContextState::Loading => {
                return Err(CallFailure::refused(ComputeError::Busy(key.clone())));
            }
            _ => {}
        }
        if !self.registry().begin_load(&handle) {
            return Err(CallFailure::refused(ComputeError::Superseded(key.clone())));
        }

        info!("{key}: loading {load_type} data into accelerator memory");
        let command = WorkerCommand::ReadData { load_type: load_type.to_string() };
        match self.client().call(key, &command).await {
            Ok(result) => {
                if self.registry().mark_ready(&handle, &key.dataset) {
                    Ok(result)
                } else {
                    Err(CallFailure::refused(ComputeError::Superseded(key.clone())))
                }
            }
            Err(failure) => {
                if failure.is_fatal() {
                    self.fail_context(&handle, &failure.error);
                } else {
                    self.registry().abort_load(&handle);
                }
                Err(failure)
            }
        }
    }

    /// End the session's context on request of the client `origin`.
    ///
    /// The context's other clients receive `session_ended`.
    pub async fn end_session(&self, key: &SessionKey, origin: Option<ConnectionId>) -> CallResult {
        let Some(ctx) = self.registry().invalidate(key) else {
            return Ok(QueryResult::local("session already ended"));
        };
        info!("{key}: session ended by client (was {})", ctx.state.as_str());
        self.hub()
            .publish_except(&key.session, origin, BrokerEvent::session_ended(key, ENDED_MESSAGE));
        self.client().call(key, &WorkerCommand::EndConnection).await
    }

    /// Invalidate the context behind `handle` after a fatal worker fault.
    ///
    /// The worker has already dropped the context, so nothing is sent to it.
    pub fn fail_context(&self, handle: &ContextHandle, err: &ComputeError) {
        let key = &handle.key;
        if self.registry().invalidate_current(handle).is_none() {
            return;
        }
        error!("{key}: fatal compute fault, context invalidated: {err}");
        let message = format!("session ended after a fatal compute error: {err}");
        self.hub().publish(&key.session, BrokerEvent::session_ended(key, message));
    }

    /// Invalidate every context idle for longer than the configured timeout.
    /// Returns the reclaimed keys.
    pub async fn reclaim_idle(&self, now: Instant) -> Vec<SessionKey> {
        let idle = self.settings().idle_timeout;
        let mut reclaimed = Vec::new();
        for ctx in self.registry().take_idle(now, idle) {
            info!("{}: reclaiming context idle for over {idle:?}", ctx.key);
            self.release(&ctx, EXPIRED_MESSAGE).await;
            reclaimed.push(ctx.key);
        }
        reclaimed
    }

    /// Run [`reclaim_idle`](Self::reclaim_idle) every sweep interval, forever.
    pub async fn run_idle_sweep(self) {
        let interval = self.settings().sweep_interval;
        info!(
            "idle sweep every {interval:?}, timeout {:?}",
            self.settings().idle_timeout
        );
        loop {
            tokio::time::sleep(interval).await;
            self.reclaim_idle(Instant::now()).await;
        }
    }

    async fn evict(&self, ctx: ComputeContext) {
        warn!("{}: evicted to free a compute slot", ctx.key);
        self.release(&ctx, EVICTED_MESSAGE).await;
    }

    /// Tell an invalidated context's clients and ask the worker to drop it.
    async fn release(&self, ctx: &ComputeContext, message: &str) {
        let key = &ctx.key;
        self.hub().publish(&key.session, BrokerEvent::session_ended(key, message));
        if let Err(failure) = self.client().call(key, &WorkerCommand::EndConnection).await {
            warn!("{key}: end_connection failed: {}", failure.error);
        }
    }
}
