//! # Federation Registry
//!
//! Named mapping from a federation identifier to an ordered endpoint list.
//! The registry is an explicit handle handed to the planner; a process-wide
//! default instance exists only for convenience.

use dashmap::DashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::algebra::Iri;

/// Process-wide default registry
static DEFAULT_REGISTRY: LazyLock<FederationRegistry> = LazyLock::new(FederationRegistry::new);

/// Concurrent, cheaply clonable federation registry
#[derive(Debug, Clone, Default)]
pub struct FederationRegistry {
    federations: Arc<DashMap<String, Vec<Iri>>>,
}

impl FederationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared default instance
    pub fn global() -> Self {
        DEFAULT_REGISTRY.clone()
    }

    /// Register (or replace) a federation
    pub fn define_federation(&self, name: impl Into<String>, endpoints: Vec<Iri>) {
        let name = name.into();
        debug!("Defining federation {} with {} endpoints", name, endpoints.len());
        self.federations.insert(name, endpoints);
    }

    pub fn get_federation(&self, name: &str) -> Option<Vec<Iri>> {
        self.federations.get(name).map(|entry| entry.value().clone())
    }

    /// Endpoint list for a federation name; an unknown name is taken as a
    /// single endpoint URL
    pub fn resolve(&self, name: &str) -> Vec<Iri> {
        self.get_federation(name)
            .unwrap_or_else(|| vec![Iri::new(name)])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.federations.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Vec<Iri>> {
        self.federations.remove(name).map(|(_, endpoints)| endpoints)
    }

    pub fn len(&self) -> usize {
        self.federations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.federations.is_empty()
    }

    /// Drop every federation
    pub fn clear(&self) {
        self.federations.clear();
    }
}
