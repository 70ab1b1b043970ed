//! One client connection.
//!
//! The upgrade handshake yields the session token (query parameter `token`,
//! else the session cookie, else a freshly minted one returned in
//! `Set-Cookie`). After that a reader loop decodes requests and runs each in
//! its own task, while a writer task drains replies and session events onto
//! the socket.

use std::collections::HashSet;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::protocol::{self, ClientRequest, Envelope};
use crate::broker::channel::{CallResult, ComputeTransport};
use crate::broker::events::{ConnectionId, Outbound, OutboundTx};
use crate::broker::key::{SessionId, SessionKey, SessionToken};
use crate::broker::{Broker, QueryResult};
use crate::error::Result;

/// Query parameter a client may use instead of a cookie.
const TOKEN_PARAM: &str = "token";

/// Session token presented in the upgrade request, if any.
pub fn token_from_request(req: &Request, cookie_name: &str) -> Option<SessionToken> {
    let from_query = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, value)| name == TOKEN_PARAM && !value.is_empty())
            .map(|(_, value)| SessionToken::new(value.into_owned()))
    });
    from_query.or_else(|| {
        req.headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|header| SessionToken::from_cookie_header(header, cookie_name))
    })
}

/// Serve one client over an accepted (and possibly TLS-wrapped) stream.
pub async fn serve<S, T>(stream: S, peer: SocketAddr, broker: Broker<T>, cookie_name: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: ComputeTransport,
{
    let mut token = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        let presented = token_from_request(req, &cookie_name);
        let minted = presented.is_none();
        let t = presented.unwrap_or_else(SessionToken::generate);
        if minted {
            let cookie = format!("{cookie_name}={}; Path=/; HttpOnly; SameSite=Lax", t.as_str());
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                resp.headers_mut().append(SET_COOKIE, value);
            }
        }
        token = Some(t);
        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;
    let token = token.unwrap_or_else(SessionToken::generate);

    let id: ConnectionId = Uuid::new_v4();
    info!("client {peer} connected as {id}");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let text = match protocol::encode(&out) {
                Ok(text) => text,
                Err(e) => {
                    warn!("cannot encode outbound message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        id,
        token,
        broker,
        tx,
        session: None,
        joined: HashSet::new(),
    };

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("client {peer}: {e}");
                break;
            }
        };
        conn.handle_frame(&text);
    }

    conn.detach();
    drop(conn);
    let _ = writer.await;
    info!("client {peer} disconnected");
    Ok(())
}

struct Connection<T> {
    id:      ConnectionId,
    token:   SessionToken,
    broker:  Broker<T>,
    tx:      OutboundTx,
    session: Option<SessionId>,
    joined:  HashSet<SessionId>,
}

impl<T: ComputeTransport> Connection<T> {
    fn reply(&self, id: Option<u64>, result: QueryResult) {
        let _ = self.tx.send(Outbound::Reply { id, result });
    }

    fn handle_frame(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reply(None, QueryResult::failure(e.to_string(), 0.0, 0.0));
                return;
            }
        };
        let request = match envelope.request() {
            Ok(request) => request,
            Err(e) => {
                self.reply(envelope.id, QueryResult::failure(e.to_string(), 0.0, 0.0));
                return;
            }
        };
        debug!("{}: {}", self.id, envelope.event);

        if let ClientRequest::Init { use_sessions, .. } = &request {
            let session = self.broker.resolve_session(&self.token, *use_sessions);
            self.attach(&session);
            self.session = Some(session);
        }
        let Some(session) = self.session.clone() else {
            self.reply(envelope.id, QueryResult::failure("call init first", 0.0, 0.0));
            return;
        };

        let target = request.target();
        let key = SessionKey::new(session, target.dataset.clone(), target.worker());
        let broker = self.broker.clone();
        let tx = self.tx.clone();
        let origin = self.id;
        let id = envelope.id;
        tokio::spawn(async move {
            let outcome = run(&broker, &key, request, origin).await;
            let result = match outcome {
                Ok(result) => result,
                Err(failure) => failure.result,
            };
            let _ = tx.send(Outbound::Reply { id, result });
        });
    }

    fn attach(&mut self, session: &SessionId) {
        if self.joined.insert(session.clone()) {
            self.broker.hub().join(session, self.id, self.tx.clone());
        }
    }

    fn detach(&mut self) {
        for session in self.joined.drain() {
            self.broker.hub().leave(&session, self.id);
        }
    }
}

async fn run<T: ComputeTransport>(
    broker: &Broker<T>,
    key:    &SessionKey,
    request: ClientRequest,
    origin: ConnectionId,
) -> CallResult {
    match request {
        ClientRequest::Init { .. } => broker.init(key).await,
        ClientRequest::LoadData { load_type, .. } => broker.load_data(key, &load_type).await,
        ClientRequest::EndSession { .. } => broker.end_session(key, Some(origin)).await,
        ClientRequest::Data { command, .. } => broker.dispatch_from(key, command, Some(origin)).await.outcome,
    }
}
