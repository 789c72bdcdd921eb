// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use rustls::ServerConfig;

use crate::{credential::TlsCredential, error::BoxError, worker::ListenerWorker};

/// A registered federation endpoint: one base URL, one TLS credential slot,
/// and the live listener workers serving it, at most one per port.
///
/// The credential slot and the worker map share the endpoint lock. The lock
/// is only ever taken after the server's endpoint-map lock has been released,
/// and never across I/O.
pub(crate) struct Endpoint {
    base_url: String,
    state: Mutex<EndpointState>,
}

struct EndpointState {
    credential: TlsCredential,
    workers: HashMap<u16, ListenerWorker>,
}

impl Endpoint {
    pub(crate) fn new(base_url: String, credential: TlsCredential) -> Arc<Self> {
        Arc::new(Self {
            base_url,
            state: Mutex::new(EndpointState {
                credential,
                workers: HashMap::new(),
            }),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Swap the credential. Handshakes that already took their snapshot keep
    /// it; the next snapshot sees the new credential.
    pub(crate) fn set_credential(&self, credential: TlsCredential) {
        self.lock().credential = credential;
    }

    /// Resolve the config for one handshake from a stable snapshot of the
    /// credential slot. SPIFFE sources are consulted after the lock is
    /// released.
    pub(crate) fn handshake_config(&self) -> std::result::Result<Arc<ServerConfig>, BoxError> {
        let credential = self.lock().credential.clone();
        credential.handshake_config()
    }

    pub(crate) fn has_worker(&self, port: u16) -> bool {
        self.lock().workers.contains_key(&port)
    }

    pub(crate) fn insert_worker(&self, port: u16, worker: ListenerWorker) {
        self.lock().workers.insert(port, worker);
    }

    pub(crate) fn remove_worker(&self, port: u16) -> Option<ListenerWorker> {
        self.lock().workers.remove(&port)
    }

    /// Take every worker out of the map; the caller signals and joins them
    /// with no lock held.
    pub(crate) fn drain_workers(&self) -> Vec<ListenerWorker> {
        self.lock().workers.drain().map(|(_, worker)| worker).collect()
    }

    pub(crate) fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().workers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
