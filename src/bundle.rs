// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use spiffe::TrustDomain;

use crate::error::{BoxError, Error, Result};

/// A provider of SPIFFE bundle documents, supplied by the host application.
///
/// The server treats sources as opaque handles: it never inspects or caches
/// the documents they produce, and it calls them once per request while
/// holding no lock.
pub trait BundleSource: Send + Sync {
    /// Returns the current bundle document for `trust_domain`, or `Ok(None)`
    /// when the source has no bundle for that domain.
    ///
    /// Both `Ok(None)` and `Err(_)` are served to clients as `404 Not Found`.
    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> std::result::Result<Option<serde_json::Value>, BoxError>;
}

/// A single path binding: the source queried for the document and the trust
/// domain it is queried for. Replaced as a whole, never field by field.
#[derive(Clone)]
pub(crate) struct BundleBinding {
    pub(crate) source: Arc<dyn BundleSource>,
    pub(crate) trust_domain: TrustDomain,
}

/// Mapping from HTTP request path to bundle binding. Paths are unique per
/// server, across all endpoints.
#[derive(Default)]
pub(crate) struct BundleRegistry {
    bindings: Mutex<HashMap<String, BundleBinding>>,
}

impl BundleRegistry {
    pub(crate) fn register(
        &self,
        path: &str,
        source: Arc<dyn BundleSource>,
        trust_domain: &str,
    ) -> Result<()> {
        validate_path(path)?;
        let trust_domain = parse_trust_domain(trust_domain)?;
        let mut bindings = self.lock();
        if bindings.contains_key(path) {
            return Err(Error::Exists);
        }
        bindings.insert(
            path.to_owned(),
            BundleBinding {
                source,
                trust_domain,
            },
        );
        Ok(())
    }

    pub(crate) fn update(
        &self,
        path: &str,
        source: Arc<dyn BundleSource>,
        trust_domain: &str,
    ) -> Result<()> {
        validate_path(path)?;
        let trust_domain = parse_trust_domain(trust_domain)?;
        let mut bindings = self.lock();
        let binding = bindings.get_mut(path).ok_or(Error::NotFound)?;
        *binding = BundleBinding {
            source,
            trust_domain,
        };
        Ok(())
    }

    pub(crate) fn remove(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::BadArgument("path"));
        }
        self.lock().remove(path).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Snapshot the binding for `path`. The clone is taken under the lock so
    /// concurrent updates are observed whole or not at all.
    pub(crate) fn lookup(&self, path: &str) -> Option<BundleBinding> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BundleBinding>> {
        // Binding values are replaced, never mutated in place, so a poisoned
        // lock cannot expose a torn binding.
        match self.bindings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::BadArgument("path"));
    }
    Ok(())
}

fn parse_trust_domain(trust_domain: &str) -> Result<TrustDomain> {
    TrustDomain::try_from(trust_domain).map_err(|_| Error::InvalidTrustDomain)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StaticSource(serde_json::Value);

    impl BundleSource for StaticSource {
        fn bundle_for_trust_domain(
            &self,
            _trust_domain: &TrustDomain,
        ) -> std::result::Result<Option<serde_json::Value>, BoxError> {
            Ok(Some(self.0.clone()))
        }
    }

    fn source() -> Arc<dyn BundleSource> {
        Arc::new(StaticSource(serde_json::json!({ "keys": [] })))
    }

    #[test]
    fn register_then_lookup() {
        let registry = BundleRegistry::default();
        registry
            .register("/bundle", source(), "example.org")
            .unwrap();
        let binding = registry.lookup("/bundle").unwrap();
        assert_eq!(
            binding.trust_domain,
            TrustDomain::try_from("example.org").unwrap()
        );
    }

    #[test]
    fn register_rejects_bad_paths() {
        let registry = BundleRegistry::default();
        assert!(matches!(
            registry.register("", source(), "example.org"),
            Err(Error::BadArgument(_))
        ));
        assert!(matches!(
            registry.register("bundle", source(), "example.org"),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn register_rejects_empty_trust_domain() {
        let registry = BundleRegistry::default();
        assert!(matches!(
            registry.register("/bundle", source(), ""),
            Err(Error::InvalidTrustDomain)
        ));
    }

    #[test]
    fn register_rejects_duplicate() {
        let registry = BundleRegistry::default();
        registry
            .register("/bundle", source(), "example.org")
            .unwrap();
        assert!(matches!(
            registry.register("/bundle", source(), "example.org"),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn update_requires_existing_binding() {
        let registry = BundleRegistry::default();
        assert!(matches!(
            registry.update("/bundle", source(), "example.org"),
            Err(Error::NotFound)
        ));

        registry
            .register("/bundle", source(), "example.org")
            .unwrap();
        registry.update("/bundle", source(), "other.org").unwrap();
        assert_eq!(
            registry.lookup("/bundle").unwrap().trust_domain,
            TrustDomain::try_from("other.org").unwrap()
        );
    }

    #[test]
    fn remove_round_trip() {
        let registry = BundleRegistry::default();
        registry
            .register("/bundle", source(), "example.org")
            .unwrap();
        registry.remove("/bundle").unwrap();
        assert!(registry.lookup("/bundle").is_none());
        assert!(matches!(registry.remove("/bundle"), Err(Error::NotFound)));
    }
}
