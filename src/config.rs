//! Broker configuration file parser.
//!
//! Flat `key = value` lines, `#` comments. Keys are case-insensitive, unknown
//! keys are ignored and unparsable numbers keep their default.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::broker::key::{SessionId, WorkerKind, DEFAULT_SHARED_SESSION_ID};
use crate::broker::wire::DEFAULT_DELIMITER;
use crate::broker::BrokerSettings;
use crate::error::{BrokerError, Result};

// Defaults
const LISTEN_PORT:      u16 = 3000;
const MAX_CONTEXTS:     usize = 1;
const IDLE_TIMEOUT:     u64 = 1800;
const SWEEP_INTERVAL:   u64 = 60;
const RETRY_BACKOFF_MS: u64 = 1000;
const REQUEST_TIMEOUT:  u64 = 300;

/// Prefix of the per-worker endpoint keys (`worker.cudf = http://...`).
const WORKER_PREFIX: &str = "worker.";

/// Full broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // ── Listener ──────────────────────────────────────────────────────────────
    pub listen_addr: String,
    pub listen_port: u16,
    /// PEM certificate chain; together with `tls_key_file` enables `wss://`.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file:  Option<PathBuf>,
    /// Cookie carrying the browser's session token.
    pub session_cookie: String,
    // ── Compute workers ───────────────────────────────────────────────────────
    /// Base URL per worker kind, kept as written until validation.
    pub workers: Vec<(WorkerKind, String)>,
    pub request_timeout:  u64,
    pub retry_backoff_ms: u64,
    pub reply_delimiter:  String,
    // ── Session pool ──────────────────────────────────────────────────────────
    pub max_contexts:        usize,
    pub idle_timeout:        u64,
    pub sweep_interval:      u64,
    pub serialize_mutations: bool,
    pub shared_session_id:   String,
    // ── Process ───────────────────────────────────────────────────────────────
    pub pid_file:   PathBuf,
    pub log_syslog: bool,
    pub log_level:  log::LevelFilter,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr:         "0.0.0.0".to_string(),
            listen_port:         LISTEN_PORT,
            tls_cert_file:       None,
            tls_key_file:        None,
            session_cookie:      "connect.sid".to_string(),
            workers:             Vec::new(),
            request_timeout:     REQUEST_TIMEOUT,
            retry_backoff_ms:    RETRY_BACKOFF_MS,
            reply_delimiter:     DEFAULT_DELIMITER.to_string(),
            max_contexts:        MAX_CONTEXTS,
            idle_timeout:        IDLE_TIMEOUT,
            sweep_interval:      SWEEP_INTERVAL,
            serialize_mutations: false,
            shared_session_id:   DEFAULT_SHARED_SESSION_ID.to_string(),
            pid_file:            PathBuf::from("/var/run/xfilter-broker.pid"),
            log_syslog:          false,
            log_level:           log::LevelFilter::Info,
        }
    }
}

impl BrokerConfig {
    /// `addr:port` the listener binds.
    pub fn listen(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            max_contexts:        self.max_contexts.max(1),
            idle_timeout:        Duration::from_secs(self.idle_timeout),
            sweep_interval:      Duration::from_secs(self.sweep_interval.max(1)),
            serialize_mutations: self.serialize_mutations,
            shared_session_id:   SessionId::new(self.shared_session_id.clone()),
        }
    }

    /// Parsed worker endpoints. Fails on the first URL that does not parse.
    pub fn endpoints(&self) -> Result<HashMap<WorkerKind, Url>> {
        self.workers
            .iter()
            .map(|(kind, raw)| Ok((kind.clone(), Url::parse(raw)?)))
            .collect()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Certificate and key paths, when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

fn flag(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<BrokerConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| BrokerError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

/// Parse configuration text; later lines override earlier ones.
pub fn parse_config(content: &str) -> BrokerConfig {
    let mut cfg = BrokerConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        if let Some(kind) = key.strip_prefix(WORKER_PREFIX) {
            let kind = WorkerKind::new(kind);
            cfg.workers.retain(|(k, _)| *k != kind);
            cfg.workers.push((kind, val));
            continue;
        }

        match key.as_str() {
            "listen_addr"         => cfg.listen_addr         = val,
            "listen_port"         => cfg.listen_port         = val.parse().unwrap_or(LISTEN_PORT),
            "tls_cert_file"       => cfg.tls_cert_file       = Some(PathBuf::from(&val)),
            "tls_key_file"        => cfg.tls_key_file        = Some(PathBuf::from(&val)),
            "session_cookie"      => cfg.session_cookie      = val,
            "request_timeout"     => cfg.request_timeout     = val.parse().unwrap_or(REQUEST_TIMEOUT),
            "retry_backoff_ms"    => cfg.retry_backoff_ms    = val.parse().unwrap_or(RETRY_BACKOFF_MS),
            "reply_delimiter"     => cfg.reply_delimiter     = val,
            "max_contexts"        => cfg.max_contexts        = val.parse().unwrap_or(MAX_CONTEXTS),
            "idle_timeout"        => cfg.idle_timeout        = val.parse().unwrap_or(IDLE_TIMEOUT),
            "sweep_interval"      => cfg.sweep_interval      = val.parse().unwrap_or(SWEEP_INTERVAL),
            "serialize_mutations" => cfg.serialize_mutations = flag(&val),
            "shared_session_id"   => cfg.shared_session_id   = val,
            "pid_file"            => cfg.pid_file            = PathBuf::from(&val),
            "log_syslog"          => cfg.log_syslog          = flag(&val),
            "log_level"           => cfg.log_level           = val.parse().unwrap_or(log::LevelFilter::Info),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Validate that required fields are populated and consistent.
pub fn validate_config(cfg: &BrokerConfig) -> Result<()> {
    if cfg.workers.is_empty() {
        return Err(BrokerError::Config(
            "at least one worker.<kind> = <url> endpoint is required".into(),
        ));
    }
    for (kind, raw) in &cfg.workers {
        Url::parse(raw)
            .map_err(|e| BrokerError::Config(format!("worker.{kind}: invalid URL {raw:?}: {e}")))?;
    }
    if cfg.tls_cert_file.is_some() != cfg.tls_key_file.is_some() {
        return Err(BrokerError::Config(
            "tls_cert_file and tls_key_file must be set together".into(),
        ));
    }
    if cfg.max_contexts == 0 {
        return Err(BrokerError::Config("max_contexts must be at least 1".into()));
    }
    if cfg.reply_delimiter.is_empty() {
        return Err(BrokerError::Config("reply_delimiter must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SAMPLE: &str = "
        # broker
        LISTEN_PORT = 4000
        worker.cudf = http://127.0.0.1:3002
        worker.pandas = http://127.0.0.1:3003/
        max_contexts = 2
        idle_timeout = 600
        serialize_mutations = yes
        log_level = debug
        bogus = ignored
    ";

    #[test]
    fn parses_known_keys() {
        let cfg = parse_config(SAMPLE);
        assert_eq!(cfg.listen(), "0.0.0.0:4000");
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.max_contexts, 2);
        assert!(cfg.serialize_mutations);
        assert_eq!(cfg.log_level, log::LevelFilter::Debug);
        assert_eq!(cfg.session_cookie, "connect.sid");
        assert!(validate_config(&cfg).is_ok());

        let settings = cfg.settings();
        assert_eq!(settings.idle_timeout, Duration::from_secs(600));
        assert_eq!(settings.shared_session_id, SessionId::new("111"));

        let endpoints = cfg.endpoints().unwrap();
        assert_eq!(endpoints[&WorkerKind::new("CUDF")].as_str(), "http://127.0.0.1:3002/");
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let cfg = parse_config("listen_port = many\nretry_backoff_ms = soon\nlog_level = loud");
        assert_eq!(cfg.listen_port, LISTEN_PORT);
        assert_eq!(cfg.retry_backoff(), Duration::from_millis(RETRY_BACKOFF_MS));
        assert_eq!(cfg.log_level, log::LevelFilter::Info);
    }

    #[test]
    fn later_worker_line_overrides() {
        let cfg = parse_config("worker.cudf = http://a:1\nworker.cudf = http://b:2");
        assert_eq!(cfg.workers, vec![(WorkerKind::new("cudf"), "http://b:2".to_string())]);
    }

    #[rstest]
    #[case::no_worker("listen_port = 3000")]
    #[case::bad_url("worker.cudf = not a url")]
    #[case::cert_without_key("worker.cudf = http://h:1\ntls_cert_file = /c.pem")]
    #[case::zero_pool("worker.cudf = http://h:1\nmax_contexts = 0")]
    fn rejects_invalid(#[case] text: &str) {
        let err = validate_config(&parse_config(text)).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn tls_pair_is_exposed() {
        let cfg = parse_config("worker.cudf = http://h:1\ntls_cert_file = /c.pem\ntls_key_file = /k.pem");
        assert!(validate_config(&cfg).is_ok());
        let (cert, key) = cfg.tls_files().unwrap();
        assert_eq!(cert, Path::new("/c.pem"));
        assert_eq!(key, Path::new("/k.pem"));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/broker.conf")).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }
}
