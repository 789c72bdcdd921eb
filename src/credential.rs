// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::sync::Arc;

use rustls::{
    InconsistentKeys, ServerConfig,
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use spiffe::X509Svid;

use crate::error::{BoxError, Error, Result};

/// A provider of the endpoint's current X509-SVID, supplied by the host
/// application (typically backed by the SPIFFE Workload API).
///
/// The source is consulted once per TLS handshake; implementations should
/// return a cached snapshot rather than block on I/O.
pub trait SvidSource: Send + Sync {
    /// Returns the SVID (certificate chain and private key) to present on the
    /// next handshake.
    fn current_svid(&self) -> std::result::Result<X509Svid, BoxError>;
}

/// TLS server credential of an endpoint. Either shape can be swapped while
/// the endpoint is serving; handshakes that already took their snapshot are
/// not interrupted.
#[derive(Clone)]
pub(crate) enum TlsCredential {
    /// Web-PKI material, validated and compiled to a config when installed.
    WebPki(Arc<ServerConfig>),
    /// SPIFFE source, consulted for fresh material at handshake time.
    Spiffe(Arc<dyn SvidSource>),
}

impl TlsCredential {
    /// Resolve the config to use for one handshake. Fresh SPIFFE material is
    /// fetched here, after the credential snapshot was taken.
    pub(crate) fn handshake_config(&self) -> std::result::Result<Arc<ServerConfig>, BoxError> {
        match self {
            Self::WebPki(config) => Ok(Arc::clone(config)),
            Self::Spiffe(source) => spiffe_server_config(&source.current_svid()?),
        }
    }
}

/// Serves the one certified key regardless of the client hello.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Validate Web-PKI material and compile it to a server config.
///
/// The private key must belong to the leaf certificate; a key the provider
/// cannot compare (`InconsistentKeys::Unknown`) is accepted as-is.
pub(crate) fn web_pki_server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: &PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    if cert_chain.is_empty() {
        return Err(Error::CertificateValidation);
    }
    let signing_key = any_supported_type(private_key).map_err(|_| Error::PrivateKeyValidation)?;
    let certified = CertifiedKey::new(cert_chain, signing_key);
    match certified.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(_) => return Err(Error::PrivateKeyValidation),
    }
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(Arc::new(certified))));
    Ok(Arc::new(config))
}

/// Compile an X509-SVID into a server config for a single handshake.
fn spiffe_server_config(svid: &X509Svid) -> std::result::Result<Arc<ServerConfig>, BoxError> {
    let cert_chain = svid
        .cert_chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.content().to_owned()))
        .collect();
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        svid.private_key().content().to_owned(),
    ));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    Ok(Arc::new(config))
}
