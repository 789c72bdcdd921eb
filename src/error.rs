// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use thiserror::Error;

/// Convenience alias for the boxed errors returned by host-supplied sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results of [`EndpointServer`](crate::EndpointServer)
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`EndpointServer`](crate::EndpointServer) operations.
///
/// Each failure mode has exactly one variant, stable across all operations.
/// Failures inside an individual connection (transport, parsing, oversized
/// requests) are confined to that connection: they are logged and the
/// connection is closed, never surfaced here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required identifier (path or base URL) is empty or malformed.
    /// The payload names the offending argument.
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),

    /// The trust-domain name is empty or not a valid SPIFFE trust domain.
    #[error("invalid trust domain name")]
    InvalidTrustDomain,

    /// The certificate chain is empty or its leaf is unusable.
    #[error("certificate validation failed")]
    CertificateValidation,

    /// The private key does not match the leaf certificate's public key.
    #[error("private key validation failed")]
    PrivateKeyValidation,

    /// The path or base URL is already registered.
    #[error("already registered")]
    Exists,

    /// No bundle binding or endpoint exists under the given key.
    #[error("not found")]
    NotFound,

    /// The port is zero, a worker already serves it, or the listening socket
    /// could not be bound.
    #[error("bad port")]
    BadPort,

    /// A listener worker failed to start or panicked; surfaced on serve and
    /// stop operations so teardown failures are never swallowed.
    #[error("listener worker failed: {0}")]
    Worker(String),
}

/// Failures while handling a single connection. Logged at the worker and
/// never propagated to facade callers; the connection is closed without a
/// reply.
#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    /// Transport failure or EOF before a complete request arrived.
    #[error("reading request: {0}")]
    Read(#[source] std::io::Error),

    /// The bytes received so far are not a valid HTTP/1.1 request.
    #[error("parsing request: {0}")]
    Parse(#[from] httparse::Error),

    /// The read buffer filled before the request completed.
    #[error("request did not complete within the read buffer")]
    TooLong,

    /// Transport failure while writing the response.
    #[error("writing response: {0}")]
    Write(#[source] std::io::Error),
}
