//! Compute Channel Client.
//!
//! [`ComputeTransport`] moves one encoded request to a worker and returns the
//! raw reply body; [`HttpTransport`] is the production adapter. The
//! [`ComputeClient`] on top of it retries transport failures once, decodes the
//! reply and accounts compute versus broker time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use tokio::time::Instant;
use url::Url;

use super::key::{SessionKey, WorkerKind};
use super::wire::{encode_request, ReplyCodec, WorkerCommand, EXCEPTION_MARKER};
use super::{broker_seconds, ComputeError, QueryResult};
use crate::error::{BrokerError, Result};

// ── Transport seam ────────────────────────────────────────────────────────────

/// Carries one request to the worker serving `worker`.
#[async_trait]
pub trait ComputeTransport: Send + Sync + 'static {
    /// Send `command` with `query` and return the reply body.
    ///
    /// Only [`ComputeError::Transport`] is retried by the client.
    async fn send(
        &self,
        worker:  &WorkerKind,
        command: &str,
        query:   &[(String, String)],
    ) -> std::result::Result<String, ComputeError>;

    /// Whether a worker is configured for `worker` at all.
    fn serves(&self, _worker: &WorkerKind) -> bool { true }
}

// ── HTTP transport ────────────────────────────────────────────────────────────

/// `GET <base>/<command>?<query>` against one base URL per worker kind.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http:      Client,
    endpoints: HashMap<WorkerKind, Url>,
}

impl HttpTransport {
    /// `timeout` bounds a whole request; histogram and load calls on large
    /// datasets can take minutes.
    pub fn new(endpoints: HashMap<WorkerKind, Url>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BrokerError::Http)?;
        Ok(HttpTransport { http, endpoints })
    }

    fn url_for(
        &self,
        worker:  &WorkerKind,
        command: &str,
        query:   &[(String, String)],
    ) -> std::result::Result<Url, ComputeError> {
        let base = self
            .endpoints
            .get(worker)
            .ok_or_else(|| ComputeError::UnknownWorker(worker.clone()))?;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| ComputeError::Transport(format!("worker url {base} cannot carry a path")))?
            .pop_if_empty()
            .push(command);
        url.query_pairs_mut().clear().extend_pairs(query);
        Ok(url)
    }
}

/// Keep a reply body for decoding, or turn it into a transport failure.
///
/// Exception payloads are decoded whatever the status says; any other
/// non-success answer is a transport failure.
fn accept_reply(command: &str, status: StatusCode, body: String) -> std::result::Result<String, ComputeError> {
    if !status.is_success() && !body.contains(EXCEPTION_MARKER) {
        return Err(ComputeError::Transport(format!("{command} answered HTTP {status}")));
    }
    Ok(body)
}

#[async_trait]
impl ComputeTransport for HttpTransport {
    async fn send(
        &self,
        worker:  &WorkerKind,
        command: &str,
        query:   &[(String, String)],
    ) -> std::result::Result<String, ComputeError> {
        let url = self.url_for(worker, command, query)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;
        debug!("{worker} {command} → {status}");
        accept_reply(command, status, body)
    }

    fn serves(&self, worker: &WorkerKind) -> bool {
        self.endpoints.contains_key(worker)
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// A call that produced no usable result. `result` is still what the client
/// receives: the error message with whatever timing was measured.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub error:  ComputeError,
    pub result: QueryResult,
}

impl CallFailure {
    /// A failure decided by the broker before reaching the worker.
    pub fn refused(error: ComputeError) -> Self {
        let result = QueryResult::failure(error.to_string(), 0.0, 0.0);
        CallFailure { error, result }
    }

    fn measured(error: ComputeError, compute: f64, wall: f64) -> Self {
        let result = QueryResult::failure(error.to_string(), compute, broker_seconds(wall, compute));
        CallFailure { error, result }
    }

    pub fn is_fatal(&self) -> bool { self.error.is_fatal() }
}

pub type CallResult = std::result::Result<QueryResult, CallFailure>;

pub struct ComputeClient<T> {
    transport:     T,
    codec:         ReplyCodec,
    retry_backoff: Duration,
}

impl<T: ComputeTransport> ComputeClient<T> {
    pub fn new(transport: T, codec: ReplyCodec, retry_backoff: Duration) -> Self {
        ComputeClient { transport, codec, retry_backoff }
    }

    pub fn serves(&self, worker: &WorkerKind) -> bool { self.transport.serves(worker) }

    /// Run `command` against the context `key`.
    pub async fn call(&self, key: &SessionKey, command: &WorkerCommand) -> CallResult {
        let started = Instant::now();
        let name = command.name();
        let query = encode_request(key, command);
        debug!("{key}: {name}");

        let body = match self.transport.send(&key.worker, name, &query).await {
            Ok(body) => body,
            Err(ComputeError::Transport(e)) => {
                warn!("{key}: {name} failed ({e}); retrying in {:?}", self.retry_backoff);
                tokio::time::sleep(self.retry_backoff).await;
                match self.transport.send(&key.worker, name, &query).await {
                    Ok(body) => body,
                    Err(err) => {
                        return Err(CallFailure::measured(err, 0.0, started.elapsed().as_secs_f64()));
                    }
                }
            }
            Err(err) => return Err(CallFailure::measured(err, 0.0, started.elapsed().as_secs_f64())),
        };

        let wall = started.elapsed().as_secs_f64();
        match self.codec.decode(&body) {
            Ok(reply) => {
                let active_filters = reply.active_filters().map(str::to_string);
                let broker = broker_seconds(wall, reply.compute_seconds);
                debug!("{key}: {name} took {:.3}s compute, {broker:.3}s broker", reply.compute_seconds);
                Ok(QueryResult::ok(reply.payload, reply.compute_seconds, broker, active_filters))
            }
            Err((err, compute)) => {
                warn!("{key}: {name} failed: {err}");
                Err(CallFailure::measured(err, compute, wall))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-in for a compute worker.

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::ComputeTransport;
    use crate::broker::key::WorkerKind;
    use crate::broker::ComputeError;

    /// One request as the worker saw it.
    #[derive(Debug, Clone)]
    pub struct Request {
        pub worker:  WorkerKind,
        pub command: String,
        pub query:   Vec<(String, String)>,
    }

    impl Request {
        pub fn field(&self, name: &str) -> Option<&str> {
            self.query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    type Reply = std::result::Result<String, ComputeError>;

    #[derive(Default)]
    struct Script {
        requests: Vec<Request>,
        queued:   HashMap<String, VecDeque<Reply>>,
        answers:  HashMap<String, String>,
        delays:   HashMap<String, Duration>,
    }

    /// Answers each command from a script and records every request.
    ///
    /// Queued replies are used first, then the command's standing answer,
    /// then `<command>-result&0.01`.
    #[derive(Clone, Default)]
    pub struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self { Self::default() }

        fn lock(&self) -> MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Standing reply body for every `command` call.
        pub fn answer(&self, command: &str, body: &str) {
            self.lock().answers.insert(command.into(), body.into());
        }

        /// One-shot reply for the next `command` call.
        pub fn push(&self, command: &str, reply: Reply) {
            self.lock().queued.entry(command.into()).or_default().push_back(reply);
        }

        /// Make every `command` call take `delay`.
        pub fn delay(&self, command: &str, delay: Duration) {
            self.lock().delays.insert(command.into(), delay);
        }

        pub fn requests(&self) -> Vec<Request> { self.lock().requests.clone() }

        pub fn count(&self, command: &str) -> usize {
            self.lock().requests.iter().filter(|r| r.command == command).count()
        }

        pub fn commands(&self) -> Vec<String> {
            self.lock().requests.iter().map(|r| r.command.clone()).collect()
        }
    }

    #[async_trait]
    impl ComputeTransport for ScriptedTransport {
        async fn send(
            &self,
            worker:  &WorkerKind,
            command: &str,
            query:   &[(String, String)],
        ) -> Reply {
            let (reply, delay) = {
                let mut script = self.lock();
                script.requests.push(Request {
                    worker:  worker.clone(),
                    command: command.to_string(),
                    query:   query.to_vec(),
                });
                let queued = script.queued.get_mut(command).and_then(VecDeque::pop_front);
                let reply = queued.unwrap_or_else(|| {
                    Ok(script
                        .answers
                        .get(command)
                        .cloned()
                        .unwrap_or_else(|| format!("{command}-result&0.01")))
                });
                (reply, script.delays.get(command).copied())
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
        }
    }
}
