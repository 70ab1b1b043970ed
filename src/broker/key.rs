//! Session identity: tokens, session ids, worker kinds and the composite
//! [`SessionKey`] that names exactly one compute context.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Session id used by every tab when shared ("sessionless") mode is requested.
pub const DEFAULT_SHARED_SESSION_ID: &str = "111";

// ── Session token ─────────────────────────────────────────────────────────────

/// Opaque credential a client presents when it connects.
///
/// The broker never interprets the token beyond deriving a [`SessionId`] from
/// it, so any transport can supply one (cookie, query parameter, header).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(s: impl Into<String>) -> Self { SessionToken(s.into()) }

    /// Mint a fresh random token for a client that did not present one.
    pub fn generate() -> Self {
        let bytes: [u8; 24] = rand::random();
        SessionToken(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Extract the token stored under `cookie_name` in a `Cookie` header.
    ///
    /// Returns `None` when the cookie is absent or empty.
    pub fn from_cookie_header(header: &str, cookie_name: &str) -> Option<Self> {
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.trim() == cookie_name)
            .map(|(_, value)| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
            .map(SessionToken::new)
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

// ── Session id ────────────────────────────────────────────────────────────────

/// Identifies one client session (one browser profile, or every tab at once in
/// shared mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self { SessionId(s.into()) }

    /// Derive the session id carried by a token.
    ///
    /// Signed cookie values look like `s:<id>.<signature>` (or `s%3A...` when
    /// URL-encoded); only `<id>` identifies the session, so the signature and
    /// prefix are dropped. Any other token is used verbatim.
    pub fn from_token(token: &SessionToken) -> Self {
        let raw = token.as_str();
        let unsigned = raw
            .strip_prefix("s%3A")
            .or_else(|| raw.strip_prefix("s:"));
        match unsigned {
            Some(rest) => {
                let id = rest.split_once('.').map_or(rest, |(id, _)| id);
                SessionId(id.to_string())
            }
            None => SessionId(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Worker kind ───────────────────────────────────────────────────────────────

/// Which compute backend serves a context (e.g. `cudf` or `pandas`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKind(String);

impl WorkerKind {
    pub fn new(s: impl Into<String>) -> Self {
        WorkerKind(s.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Session key ───────────────────────────────────────────────────────────────

/// `(session, dataset, worker)`: names exactly one compute context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub session: SessionId,
    pub dataset: String,
    pub worker:  WorkerKind,
}

impl SessionKey {
    pub fn new(session: SessionId, dataset: impl Into<String>, worker: WorkerKind) -> Self {
        SessionKey { session, dataset: dataset.into(), worker }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session, self.dataset, self.worker)
    }
}
