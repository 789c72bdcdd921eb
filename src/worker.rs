// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use rustls::server::Acceptor;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::{
    bundle::BundleRegistry,
    endpoint::Endpoint,
    error::{Error, Result},
    handler::serve_connection,
};

/// Upper bound on a single TLS handshake. Keeps a stalled peer from pinning
/// the worker past the shutdown-latency floor.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a spawned accept loop, owned by its endpoint's worker map.
/// Shutdown is cooperative: [`signal`](Self::signal) flips the watch channel
/// the loop selects on, [`join`](Self::join) awaits the task.
pub(crate) struct ListenerWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ListenerWorker {
    /// Spawn the accept loop for `(endpoint, port)`. The returned receiver
    /// fires once the loop is running; callers await it before reporting the
    /// listener as serving.
    pub(crate) fn spawn(
        base_url: String,
        port: u16,
        endpoint: Weak<Endpoint>,
        bundles: Arc<BundleRegistry>,
        listener: TcpListener,
    ) -> (Self, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = AcceptLoop {
            base_url,
            port,
            endpoint,
            bundles,
            listener,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run(ready_tx));
        (
            Self {
                shutdown: shutdown_tx,
                handle,
            },
            ready_rx,
        )
    }

    /// Request shutdown. A no-op when the loop has already exited.
    pub(crate) fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the loop to exit. A panic inside the worker surfaces here.
    pub(crate) async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|error| Error::Worker(error.to_string()))
    }
}

struct AcceptLoop {
    base_url: String,
    port: u16,
    endpoint: Weak<Endpoint>,
    bundles: Arc<BundleRegistry>,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self, ready: oneshot::Sender<()>) {
        let _ = ready.send(());
        debug!(url = %self.base_url, port = self.port, "listener started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                    // stay in the loop; transient accept failures must not
                    // kill the listener
                    Err(error) => warn!(port = self.port, %error, "accept failed"),
                },
            }
        }
        debug!(url = %self.base_url, port = self.port, "listener stopped");
    }

    /// One connection, handled synchronously: snapshot credential, handshake,
    /// one request, one response, close.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(endpoint) = self.endpoint.upgrade() else {
            warn!(port = self.port, "endpoint removed, dropping connection");
            return;
        };
        // The snapshot precedes the handshake; a concurrent credential swap
        // affects only later connections.
        let config = match endpoint.handshake_config() {
            Ok(config) => config,
            Err(error) => {
                warn!(url = %endpoint.base_url(), %error, "no usable TLS credential");
                return;
            }
        };
        drop(endpoint);

        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
            start.into_stream(config).await
        };
        let mut tls = match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(error)) => {
                debug!(%peer, %error, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!(%peer, "TLS handshake timed out");
                return;
            }
        };

        // Request failures are confined to the connection: log and close
        // without a reply.
        if let Err(error) = serve_connection(&mut tls, &self.bundles).await {
            warn!(%peer, %error, "request handling failed");
        }
        let _ = tls.shutdown().await;
    }
}
