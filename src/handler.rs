// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    bundle::BundleRegistry,
    error::ConnectionError,
    http::{
        CONTENT_TYPE_JSON, STATUS_METHOD_NOT_ALLOWED, STATUS_NOT_FOUND, STATUS_OK, read_request,
        write_response,
    },
};

const EMPTY_BODY: &[u8] = b"{}";

/// Serve exactly one request on an established TLS stream: read, dispatch,
/// write, done. The caller shuts the stream down afterwards regardless of
/// outcome.
///
/// Every response carries the single header `Content-Type: application/json`.
/// Absent bindings, absent bundles, and marshalling failures are all `404`
/// with an empty document; a non-GET method is `405`.
pub(crate) async fn serve_connection<S>(
    stream: &mut S,
    bundles: &BundleRegistry,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_request(stream).await?;
    debug!(
        method = %request.method,
        path = %request.path,
        minor_version = request.minor_version,
        "request received"
    );

    let headers = [CONTENT_TYPE_JSON];
    if request.method != "GET" {
        return write_response(stream, STATUS_METHOD_NOT_ALLOWED, &headers, EMPTY_BODY).await;
    }

    // Snapshot the binding and release the registry lock before calling out
    // to the source.
    let Some(binding) = bundles.lookup(&request.path) else {
        return write_response(stream, STATUS_NOT_FOUND, &headers, EMPTY_BODY).await;
    };

    let document = match binding.source.bundle_for_trust_domain(&binding.trust_domain) {
        Ok(document) => document,
        Err(error) => {
            warn!(path = %request.path, %error, "bundle source failed");
            None
        }
    };
    let body = document.and_then(|document| match serde_json::to_vec(&document) {
        Ok(body) => Some(body),
        Err(error) => {
            warn!(path = %request.path, %error, "bundle marshalling failed");
            None
        }
    });

    match body {
        Some(body) => write_response(stream, STATUS_OK, &headers, &body).await,
        None => write_response(stream, STATUS_NOT_FOUND, &headers, EMPTY_BODY).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use spiffe::TrustDomain;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::bundle::BundleSource;
    use crate::error::BoxError;

    struct StaticSource(Option<serde_json::Value>);

    impl BundleSource for StaticSource {
        fn bundle_for_trust_domain(
            &self,
            _trust_domain: &TrustDomain,
        ) -> Result<Option<serde_json::Value>, BoxError> {
            Ok(self.0.clone())
        }
    }

    fn registry_with(document: Option<serde_json::Value>) -> BundleRegistry {
        let registry = BundleRegistry::default();
        registry
            .register("/bundle", Arc::new(StaticSource(document)), "example.org")
            .unwrap();
        registry
    }

    async fn exchange(registry: &BundleRegistry, request: &[u8]) -> String {
        let (mut client, mut server) = tokio::io::duplex(8192);
        client.write_all(request).await.unwrap();
        serve_connection(&mut server, registry).await.unwrap();
        drop(server);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn get_known_path_returns_document() {
        let registry = registry_with(Some(serde_json::json!({ "keys": [] })));
        let response = exchange(&registry, b"GET /bundle HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/json"));
        assert!(response.contains(r#"{"keys":[]}"#));
    }

    #[tokio::test]
    async fn get_unknown_path_is_not_found() {
        let registry = registry_with(Some(serde_json::json!({ "keys": [] })));
        let response = exchange(&registry, b"GET /missing HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("{}"));
    }

    #[tokio::test]
    async fn absent_bundle_is_not_found() {
        let registry = registry_with(None);
        let response = exchange(&registry, b"GET /bundle HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn non_get_method_is_rejected() {
        let registry = registry_with(Some(serde_json::json!({ "keys": [] })));
        let response = exchange(&registry, b"POST /bundle HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("{}"));
    }
}
