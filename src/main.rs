//! Session/compute broker for cross-filter compute workers.
//!
//! Usage:
//!   xfilter-broker -c /etc/xfilter/broker.conf
//!   xfilter-broker -c /etc/xfilter/broker.conf --stderr   # log to stderr
//!   xfilter-broker -c /etc/xfilter/broker.conf --check    # validate and exit

mod broker;
mod config;
mod error;
mod server;
mod tls;
mod util;

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use broker::channel::{ComputeClient, HttpTransport};
use broker::wire::ReplyCodec;
use broker::Broker;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "xfilter-broker", about = "Session broker between cross-filter clients and compute workers")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/xfilter/broker.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    /// Listen address (`addr:port`), overriding the configuration file.
    #[arg(long)]
    listen: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("xfilter-broker: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("xfilter-broker: config validation: {e}");
        process::exit(1);
    }
    if cli.check {
        println!("xfilter-broker: {} OK", cli.config.display());
        return;
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog, cfg.log_level) {
        eprintln!("xfilter-broker: logging: {e}");
        process::exit(1);
    }

    // Install the post-quantum TLS provider (must happen before any TLS use).
    if rustls_post_quantum::provider().install_default().is_err() {
        error!("a TLS crypto provider was already installed; keeping it");
    }

    if let Err(e) = util::write_pid_file(&cfg.pid_file) {
        error!("cannot write PID file {}: {e}", cfg.pid_file.display());
    }

    let listen = cli.listen.clone().unwrap_or_else(|| cfg.listen());
    let outcome = run(&cfg, &listen).await;

    util::remove_pid_file(&cfg.pid_file);
    if let Err(e) = outcome {
        error!("xfilter-broker exiting: {e:#}");
        process::exit(1);
    }
    info!("xfilter-broker stopped");
}

async fn run(cfg: &config::BrokerConfig, listen: &str) -> anyhow::Result<()> {
    let acceptor = match cfg.tls_files() {
        Some((cert, key)) => Some(
            tls::build_acceptor(cert, key).context("cannot set up TLS for the listener")?,
        ),
        None => None,
    };

    let endpoints = cfg.endpoints().context("invalid worker endpoint")?;
    for (kind, url) in &endpoints {
        info!("worker {kind} at {url}");
    }
    let transport = HttpTransport::new(endpoints, cfg.request_timeout())
        .context("cannot build the compute worker HTTP client")?;
    let client = ComputeClient::new(
        transport,
        ReplyCodec::new(cfg.reply_delimiter.clone()),
        cfg.retry_backoff(),
    );
    let settings = cfg.settings();
    info!(
        "xfilter-broker starting ({} compute slot(s), serialize_mutations={})",
        settings.max_contexts, settings.serialize_mutations
    );
    let broker = Broker::new(client, settings);

    let sweeper = tokio::spawn(broker.clone().run_idle_sweep());
    let served = server::run(broker, listen, acceptor, cfg.session_cookie.clone()).await;
    sweeper.abort();
    served
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool, level: log::LevelFilter) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "xfilter-broker".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .try_init()
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    }
    Ok(())
}
