use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

/// Self-signed test CA used to issue endpoint certificates.
pub struct TestCa {
    ca: rcgen::Certificate,
    pub ca_der: CertificateDer<'static>,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "federation test ca");
        let ca = rcgen::Certificate::from_params(params).unwrap();
        let ca_der = CertificateDer::from(ca.serialize_der().unwrap());
        Self { ca, ca_der }
    }

    /// Issue a leaf for `localhost`, optionally carrying a SPIFFE ID URI SAN.
    pub fn issue_leaf(&self, common_name: &str, spiffe_id: Option<&str>) -> LeafMaterial {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_owned()]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.key_usages.push(rcgen::KeyUsagePurpose::DigitalSignature);
        params.is_ca = rcgen::IsCa::ExplicitNoCa;
        if let Some(id) = spiffe_id {
            params
                .subject_alt_names
                .push(rcgen::SanType::URI(id.to_owned()));
        }
        let cert = rcgen::Certificate::from_params(params).unwrap();
        LeafMaterial {
            cert: cert.serialize_der_with_signer(&self.ca).unwrap(),
            key: cert.serialize_private_key_der(),
        }
    }
}

/// DER-encoded leaf certificate and PKCS#8 private key.
pub struct LeafMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl LeafMaterial {
    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert.clone())
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key.clone()))
    }
}

/// Make the aws-lc-rs provider the process default; safe to call from every
/// test.
pub fn init_crypto() {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    );
}

pub fn client_config(roots: &[CertificateDer<'static>]) -> Arc<rustls::ClientConfig> {
    let mut store = rustls::RootCertStore::empty();
    for root in roots {
        store.add(root.clone()).unwrap();
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(store)
            .with_no_client_auth(),
    )
}

pub async fn tls_connect(port: u16, config: Arc<rustls::ClientConfig>) -> TlsStream<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connector = TlsConnector::from(config);
    connector
        .connect("localhost".try_into().unwrap(), stream)
        .await
        .unwrap()
}

/// Write one request and read the response until the server closes the
/// stream.
pub async fn send_request(stream: &mut TlsStream<TcpStream>, method: &str, path: &str) -> String {
    stream
        .write_all(format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// One-shot HTTPS request against `127.0.0.1:port`.
pub async fn https_request(
    port: u16,
    method: &str,
    path: &str,
    config: Arc<rustls::ClientConfig>,
) -> String {
    let mut stream = tls_connect(port, config).await;
    send_request(&mut stream, method, path).await
}

/// The DER leaf certificate the server presented on this connection.
pub fn peer_leaf(stream: &TlsStream<TcpStream>) -> CertificateDer<'static> {
    let (_, connection) = stream.get_ref();
    connection.peer_certificates().unwrap()[0].clone()
}
