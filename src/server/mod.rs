//! Client-facing WebSocket listener (`ws://`, or `wss://` with TLS).

pub mod connection;
pub mod protocol;

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::broker::channel::ComputeTransport;
use crate::broker::Broker;

/// Accept clients on `addr` until SIGINT/SIGTERM, one task per connection.
pub async fn run<T: ComputeTransport>(
    broker:      Broker<T>,
    addr:        &str,
    tls:         Option<TlsAcceptor>,
    cookie_name: String,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let scheme = if tls.is_some() { "wss" } else { "ws" };
    info!("listening on {scheme}://{}", listener.local_addr()?);

    let cookie_name: Arc<str> = Arc::from(cookie_name);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested; no longer accepting clients");
                return Ok(());
            }
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                };
                let broker = broker.clone();
                let tls = tls.clone();
                let cookie_name = cookie_name.to_string();
                tokio::spawn(async move {
                    let served = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => connection::serve(stream, peer, broker, cookie_name).await,
                            Err(e) => {
                                warn!("TLS handshake with {peer} failed: {e}");
                                return;
                            }
                        },
                        None => connection::serve(stream, peer, broker, cookie_name).await,
                    };
                    if let Err(e) = served {
                        warn!("client {peer}: {e}");
                    }
                });
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
