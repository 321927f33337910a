//! The handler registry (spec.md §4.4, §9): a process-wide, read-only-after-
//! startup map from back-end name to either a working factory or the error
//! that made it unavailable. Failed loads are preserved as a tagged variant,
//! never silently dropped, so a handshake for an unavailable back end can
//! surface the original load error to the client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::descriptor::ExportDescriptor;
use crate::handler::Handler;

/// Constructs a [`Handler`] from a handshake's Export Descriptor.
///
/// An `async_trait` because construction is inherently asynchronous (it may
/// dial a remote cluster) and the registry needs to hold it as a trait
/// object.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Construct a handler for this back end. `descriptor.raw` carries
    /// whatever back-end-specific keys the client sent alongside `name` and
    /// `blocksize`.
    async fn construct(&self, descriptor: &ExportDescriptor) -> Result<Box<dyn Handler>, String>;
}

/// One registry slot: either a working factory, or the error recorded when
/// this back end failed to load at startup (e.g. a missing optional
/// dependency).
pub enum RegistryEntry {
    Loaded(Arc<dyn BackendFactory>),
    Unavailable(String),
}

/// The process-wide back-end registry, built once at startup and read-only
/// thereafter.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register_loaded(&mut self, name: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.entries
            .insert(name.into(), RegistryEntry::Loaded(factory));
    }

    pub fn register_unavailable(&mut self, name: impl Into<String>, error: impl Into<String>) {
        self.entries
            .insert(name.into(), RegistryEntry::Unavailable(error.into()));
    }

    /// Look up a back-end by name. `None` means "no handler found for
    /// `name` backend" (spec.md's literal handshake-failure scenario 2);
    /// `Some(Unavailable(e))` means it was probed at startup but failed.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl BackendFactory for AlwaysFails {
        async fn construct(&self, _descriptor: &ExportDescriptor) -> Result<Box<dyn Handler>, String> {
            Err("construction always fails in this test".to_string())
        }
    }

    #[test]
    fn unknown_backend_is_not_found() {
        let registry = Registry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn unavailable_backend_preserves_its_load_error() {
        let mut registry = Registry::new();
        registry.register_unavailable("rbd", "image_service_endpoint not configured");
        match registry.get("rbd") {
            Some(RegistryEntry::Unavailable(msg)) => {
                assert_eq!(msg, "image_service_endpoint not configured");
            }
            _ => panic!("expected Unavailable"),
        }
    }

    #[tokio::test]
    async fn loaded_backend_is_reachable_through_the_registry() {
        let mut registry = Registry::new();
        registry.register_loaded("fails", Arc::new(AlwaysFails));
        let Some(RegistryEntry::Loaded(factory)) = registry.get("fails") else {
            panic!("expected Loaded");
        };
        let descriptor = ExportDescriptor::parse(br#"{"name":"fails","blocksize":512}"#).unwrap();
        match factory.construct(&descriptor).await {
            Err(err) => assert_eq!(err, "construction always fails in this test"),
            Ok(_) => panic!("expected construction to fail"),
        }
    }
}
