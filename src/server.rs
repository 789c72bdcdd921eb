// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tracing::{error, warn};

use crate::{
    bundle::{BundleRegistry, BundleSource},
    credential::{SvidSource, TlsCredential, web_pki_server_config},
    endpoint::Endpoint,
    error::{Error, Result},
    worker::ListenerWorker,
};

/// A SPIFFE bundle federation endpoint server.
///
/// The server publishes trust-bundle documents over authenticated HTTPS.
/// Callers register bundle paths bound to a [`BundleSource`] and a trust
/// domain, add endpoints carrying either Web-PKI material or a SPIFFE
/// [`SvidSource`], and start one listener per (endpoint, port) with
/// [`serve_endpoint`](Self::serve_endpoint). Each accepted connection is
/// served synchronously on its listener: one `GET`, one JSON response,
/// close.
///
/// All state is in memory; several servers can coexist in one process. The
/// server must be dropped only after [`stop`](Self::stop) (or the narrower
/// stop operations) has joined the listeners it spawned.
///
/// ```no_run
/// use std::sync::Arc;
/// use spiffe_bundle_endpoint::{BundleSource, EndpointServer};
///
/// async fn run(source: Arc<dyn BundleSource>, certs: Vec<rustls::pki_types::CertificateDer<'static>>, key: rustls::pki_types::PrivateKeyDer<'static>) -> spiffe_bundle_endpoint::Result<()> {
///     let server = EndpointServer::new();
///     server.register_bundle("/bundle", source, "example.org")?;
///     server.add_https_web_endpoint("https://bundles.example.org", certs, key)?;
///     server.serve_endpoint("https://bundles.example.org", 8443).await?;
///     // ... later
///     server.stop().await
/// }
/// ```
#[derive(Default)]
pub struct EndpointServer {
    bundles: Arc<BundleRegistry>,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointServer {
    /// Create an empty server: no bundle bindings, no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `path` to a bundle source and trust domain.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgument`] when `path` is empty or does not start with
    /// `/`, [`Error::InvalidTrustDomain`] when `trust_domain` does not parse,
    /// [`Error::Exists`] when `path` is already bound.
    pub fn register_bundle(
        &self,
        path: &str,
        source: Arc<dyn BundleSource>,
        trust_domain: &str,
    ) -> Result<()> {
        self.bundles.register(path, source, trust_domain)
    }

    /// Atomically replace the source and trust domain bound to `path`.
    /// Requests racing the update observe the old or the new binding, never
    /// a mix.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when `path` is not bound; argument errors as for
    /// [`register_bundle`](Self::register_bundle).
    pub fn update_bundle(
        &self,
        path: &str,
        source: Arc<dyn BundleSource>,
        trust_domain: &str,
    ) -> Result<()> {
        self.bundles.update(path, source, trust_domain)
    }

    /// Unbind `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when `path` is not bound.
    pub fn remove_bundle(&self, path: &str) -> Result<()> {
        self.bundles.remove(path)
    }

    /// Add an endpoint authenticated with Web-PKI material. The chain is
    /// copied; the caller keeps its own copies.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgument`] when `base_url` is empty,
    /// [`Error::CertificateValidation`] when the chain is empty,
    /// [`Error::PrivateKeyValidation`] when the key does not match the leaf,
    /// [`Error::Exists`] when `base_url` is already registered.
    pub fn add_https_web_endpoint(
        &self,
        base_url: &str,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<EndpointInfo> {
        validate_base_url(base_url)?;
        let config = web_pki_server_config(cert_chain, &private_key)?;
        self.insert_endpoint(base_url, TlsCredential::WebPki(config))
    }

    /// Replace the Web-PKI material of an existing endpoint. The new
    /// credential is re-validated; handshakes already in flight finish with
    /// the old one.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgument`] when `base_url` is empty; validation errors as
    /// for [`add_https_web_endpoint`](Self::add_https_web_endpoint);
    /// [`Error::NotFound`] when `base_url` is unknown.
    pub fn set_https_web_endpoint_auth(
        &self,
        base_url: &str,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<()> {
        validate_base_url(base_url)?;
        let config = web_pki_server_config(cert_chain, &private_key)?;
        self.lookup_endpoint(base_url)?
            .set_credential(TlsCredential::WebPki(config));
        Ok(())
    }

    /// Add an endpoint authenticated with an X509-SVID source. The source is
    /// trusted to provide matching material and is consulted at handshake
    /// time.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgument`] when `base_url` is empty, [`Error::Exists`]
    /// when `base_url` is already registered.
    pub fn add_https_spiffe_endpoint(
        &self,
        base_url: &str,
        source: Arc<dyn SvidSource>,
    ) -> Result<EndpointInfo> {
        validate_base_url(base_url)?;
        self.insert_endpoint(base_url, TlsCredential::Spiffe(source))
    }

    /// Swap the SVID source of an existing endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgument`] when `base_url` is empty, [`Error::NotFound`]
    /// when `base_url` is unknown.
    pub fn set_https_spiffe_endpoint_source(
        &self,
        base_url: &str,
        source: Arc<dyn SvidSource>,
    ) -> Result<()> {
        validate_base_url(base_url)?;
        self.lookup_endpoint(base_url)?
            .set_credential(TlsCredential::Spiffe(source));
        Ok(())
    }

    /// Look up the opaque handle for a registered endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when `base_url` is unknown.
    pub fn endpoint_info(&self, base_url: &str) -> Result<EndpointInfo> {
        validate_base_url(base_url)?;
        Ok(EndpointInfo {
            endpoint: self.lookup_endpoint(base_url)?,
        })
    }

    /// Remove an endpoint, stopping any listeners still serving it first.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when `base_url` is unknown; [`Error::Worker`] when
    /// a leftover listener panicked during the stop.
    pub async fn remove_endpoint(&self, base_url: &str) -> Result<()> {
        validate_base_url(base_url)?;
        let endpoint = {
            let mut endpoints = self.lock_endpoints();
            endpoints.remove(base_url).ok_or(Error::NotFound)?
        };
        stop_workers(endpoint.drain_workers()).await
    }

    /// Start serving the endpoint on `port`. Returns once the listener is
    /// accepting connections.
    ///
    /// # Errors
    ///
    /// [`Error::BadPort`] when `port` is zero, a listener already serves that
    /// port for this endpoint, or the socket cannot be bound;
    /// [`Error::NotFound`] when `base_url` is unknown; [`Error::Worker`] when
    /// the listener dies before reporting readiness.
    pub async fn serve_endpoint(&self, base_url: &str, port: u16) -> Result<()> {
        validate_base_url(base_url)?;
        if port == 0 {
            return Err(Error::BadPort);
        }
        let endpoint = self.lookup_endpoint(base_url)?;
        if endpoint.has_worker(port) {
            return Err(Error::BadPort);
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|err| {
                warn!(url = base_url, port, error = %err, "failed to bind listener");
                Error::BadPort
            })?;

        let (worker, ready) = ListenerWorker::spawn(
            base_url.to_owned(),
            port,
            Arc::downgrade(&endpoint),
            Arc::clone(&self.bundles),
            listener,
        );
        endpoint.insert_worker(port, worker);

        if ready.await.is_err() {
            // The worker died before entering its loop; reap it so the
            // failure is reported rather than left in the map.
            if let Some(worker) = endpoint.remove_worker(port) {
                worker.signal();
                return Err(worker
                    .join()
                    .await
                    .err()
                    .unwrap_or(Error::Worker("listener exited during startup".to_owned())));
            }
            return Err(Error::Worker(
                "listener exited during startup".to_owned(),
            ));
        }
        Ok(())
    }

    /// Stop the listener serving `port` for the endpoint and wait for it to
    /// exit. The join happens with no lock held.
    ///
    /// # Errors
    ///
    /// [`Error::BadPort`] when `port` is zero or no listener serves it,
    /// [`Error::NotFound`] when `base_url` is unknown, [`Error::Worker`] when
    /// the listener panicked.
    pub async fn stop_listener(&self, base_url: &str, port: u16) -> Result<()> {
        validate_base_url(base_url)?;
        if port == 0 {
            return Err(Error::BadPort);
        }
        let endpoint = self.lookup_endpoint(base_url)?;
        let worker = endpoint.remove_worker(port).ok_or(Error::BadPort)?;
        worker.signal();
        worker.join().await
    }

    /// Stop every listener of one endpoint. Workers are drained from the map
    /// under the endpoint lock and signalled and joined after it is released.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when `base_url` is unknown, [`Error::Worker`] when
    /// a listener panicked.
    pub async fn stop_endpoint(&self, base_url: &str) -> Result<()> {
        validate_base_url(base_url)?;
        let endpoint = self.lookup_endpoint(base_url)?;
        stop_workers(endpoint.drain_workers()).await
    }

    /// Stop every listener of every endpoint. Idempotent: a second call is a
    /// no-op returning success.
    ///
    /// # Errors
    ///
    /// [`Error::Worker`] when a listener panicked; the sweep still joins the
    /// rest.
    pub async fn stop(&self) -> Result<()> {
        let workers: Vec<ListenerWorker> = {
            let endpoints = self.lock_endpoints();
            endpoints
                .values()
                .flat_map(|endpoint| endpoint.drain_workers())
                .collect()
        };
        stop_workers(workers).await
    }

    fn insert_endpoint(&self, base_url: &str, credential: TlsCredential) -> Result<EndpointInfo> {
        let mut endpoints = self.lock_endpoints();
        if endpoints.contains_key(base_url) {
            return Err(Error::Exists);
        }
        let endpoint = Endpoint::new(base_url.to_owned(), credential);
        endpoints.insert(base_url.to_owned(), Arc::clone(&endpoint));
        Ok(EndpointInfo { endpoint })
    }

    fn lookup_endpoint(&self, base_url: &str) -> Result<Arc<Endpoint>> {
        self.lock_endpoints()
            .get(base_url)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, Arc<Endpoint>>> {
        match self.endpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Opaque handle to a registered endpoint.
#[derive(Clone)]
pub struct EndpointInfo {
    endpoint: Arc<Endpoint>,
}

impl EndpointInfo {
    /// The base URL the endpoint was registered under.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.endpoint.base_url()
    }

    /// The ports with a live listener, ascending. Empty when the endpoint is
    /// not being served.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.endpoint.ports()
    }
}

/// Signal every worker first so they drain concurrently, then join them one
/// by one outside all locks. The first join failure is returned after the
/// sweep completes.
async fn stop_workers(workers: Vec<ListenerWorker>) -> Result<()> {
    for worker in &workers {
        worker.signal();
    }
    let mut result = Ok(());
    for worker in workers {
        if let Err(err) = worker.join().await {
            error!(error = %err, "listener worker failed during shutdown");
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

fn validate_base_url(base_url: &str) -> Result<()> {
    if base_url.is_empty() {
        return Err(Error::BadArgument("base_url"));
    }
    Ok(())
}
