//! Listener: accepts POS connections for one `.proxy` file and drives
//! each connection's read/dispatch/respond loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ProxyError;
use crate::framing;
use crate::session::SessionStore;
use crate::upstream::{UpstreamClient, UpstreamConfig};

/// Binds one TCP port and serves POS connections for it.
///
/// Upstream clients are never shared across POS connections: each
/// accepted connection gets a fresh set of [`UpstreamClient`]s (and so
/// its own upstream sockets) built from the same configuration
/// snapshot, and a dispatcher scoped to just that connection. Only the
/// session store is actually shared, since session bindings are
/// meaningful across every POS terminal talking to this listener.
pub struct Listener {
    listen_port: u16,
    upstream_configs: Vec<UpstreamConfig>,
    session_store: Arc<SessionStore>,
}

impl Listener {
    pub fn new(config: &ProxyConfig, session_store: Arc<SessionStore>) -> Self {
        Self {
            listen_port: config.listen_port,
            upstream_configs: config.upstreams.clone(),
            session_store,
        }
    }

    /// Bind and serve until `shutdown` is signalled. Each accepted
    /// connection is handled on its own task; the listener itself
    /// returns once the listening socket is closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let addr = format!("127.0.0.1:{}", self.listen_port);
        let tcp_listener = TcpListener::bind(&addr).await?;
        info!(addr, "listener bound");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(addr, "listener shutting down");
                        return Ok(());
                    }
                }
                accepted = tcp_listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "POS connection accepted");
                    let upstreams: Vec<Arc<UpstreamClient>> = self
                        .upstream_configs
                        .iter()
                        .map(|u| Arc::new(UpstreamClient::new(u.clone())))
                        .collect();
                    let dispatcher = Arc::new(Dispatcher::new(upstreams.clone(), self.session_store.clone()));
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socket, dispatcher, shutdown).await {
                            warn!(%peer, error = %e, "POS connection ended with error");
                        }
                        for upstream in &upstreams {
                            upstream.disconnect().await;
                        }
                        debug!(%peer, "POS connection torn down");
                    });
                }
            }
        }
    }
}

/// How long in-flight dispatches are given to finish after the POS
/// stream itself has failed, before they're abandoned outright. Short
/// relative to the 10s service-shutdown grace in `main.rs` since this
/// path only covers the last few requests already in flight on one
/// connection, not every listener draining at once.
const POS_ERROR_DRAIN: Duration = Duration::from_secs(2);

/// Read requests off `socket` and hand each one to its own dispatch
/// task as soon as it's decoded, so a slow upstream never blocks the
/// next POS request from being read. Responses are serialized back
/// onto the socket through a channel so concurrent dispatch tasks
/// never interleave partial writes. A dispatch whose candidates all
/// failed closes the whole connection rather than leaving the POS side
/// waiting on a message nothing answered.
async fn serve_connection(
    socket: TcpStream,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (mut read_half, mut write_half) = socket.into_split();
    let (response_tx, mut response_rx) = mpsc::channel::<Vec<u8>>(32);
    // Every upstream candidate failing for one message closes the whole
    // connection: the POS writer is dropped and the read loop is told to
    // stop accepting further requests, matching every-task-failed in the
    // dispatch race.
    let (fail_tx, mut fail_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            if write_half.write_all(&response).await.is_err() {
                break;
            }
        }
    });

    let mut in_flight = Vec::new();
    let read_result = loop {
        in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Ok(());
                }
            }
            _ = fail_rx.recv() => {
                break Err(ProxyError::DispatchExhausted);
            }
            frame = framing::read_frame(&mut read_half) => {
                match frame {
                    Ok(frame) => {
                        let dispatcher = dispatcher.clone();
                        let response_tx = response_tx.clone();
                        let fail_tx = fail_tx.clone();
                        in_flight.push(tokio::spawn(async move {
                            match dispatcher.dispatch(&frame).await {
                                Ok(Some(response)) => {
                                    let _ = response_tx.send(response).await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!(error = %e, "dispatch failed for this message, closing connection");
                                    let _ = fail_tx.send(()).await;
                                }
                            }
                        }));
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    // Give in-flight dispatches a brief window to finish and forward
    // their responses, then abort any straggler outright so it can't
    // keep its response_tx clone alive underneath the writer.await below.
    let deadline = tokio::time::Instant::now() + POS_ERROR_DRAIN;
    for mut handle in in_flight {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, &mut handle).await.is_err() {
            handle.abort();
        }
    }

    drop(response_tx);
    let _ = writer.await;
    read_result
}
