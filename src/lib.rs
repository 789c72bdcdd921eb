// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! SPIFFE trust-bundle federation endpoint server.
//!
//! Publishes bundle documents over authenticated HTTPS so that peer trust
//! domains can fetch and refresh them. An [`EndpointServer`] maps request
//! paths to host-supplied [`BundleSource`]s and base URLs to TLS endpoints.
//! An endpoint's credential, either classic Web-PKI material or a SPIFFE
//! [`SvidSource`], can be hot-swapped while serving: every handshake takes a
//! stable snapshot of the credential, so a swap never interrupts a
//! connection already in flight.
//!
//! One listener runs per served (endpoint, port); shutdown is cooperative
//! and joins the listener before returning. The HTTP surface is deliberately
//! minimal: one `GET` per connection, one JSON response, close.

#![forbid(rust_2018_idioms)]
#![forbid(missing_docs, unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::nursery,
    clippy::dbg_macro,
    clippy::todo
)]

mod bundle;
mod credential;
mod endpoint;
mod error;
mod handler;
mod http;
mod server;
mod worker;

pub use bundle::BundleSource;
pub use credential::SvidSource;
pub use error::{BoxError, Error, Result};
pub use server::{EndpointInfo, EndpointServer};
