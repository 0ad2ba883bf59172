//! Scripted in-process SPARQL endpoints for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use oxirs_fedquery::{
    Binding, BindingSet, FederationError, GraphPattern, Iri, Query, Result, ServiceClient, Term,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const E1: &str = "http://e1.example/sparql";
pub const E2: &str = "http://e2.example/sparql";
pub const E3: &str = "http://e3.example/sparql";

pub const NAME: &str = "http://xmlns.com/foaf/0.1/name";
pub const AGE: &str = "http://xmlns.com/foaf/0.1/age";
pub const KNOWS: &str = "http://xmlns.com/foaf/0.1/knows";

/// One outbound request seen by the mock
#[derive(Debug, Clone)]
pub struct Request {
    pub endpoint: String,
    pub query: String,
    /// Rows of the leading VALUES table, if any
    pub values_rows: Option<usize>,
}

/// Endpoint that echoes the VALUES rows it receives, tagged with its name.
/// A request without VALUES returns a single tagged binding.
#[derive(Default)]
pub struct MockEndpoints {
    requests: Mutex<Vec<Request>>,
    delays: HashMap<String, Duration>,
    down: HashSet<String>,
    garbled: HashSet<String>,
}

impl MockEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, endpoint: &str, delay: Duration) -> Self {
        self.delays.insert(endpoint.to_string(), delay);
        self
    }

    pub fn with_down(mut self, endpoint: &str) -> Self {
        self.down.insert(endpoint.to_string());
        self
    }

    pub fn with_garbled(mut self, endpoint: &str) -> Self {
        self.garbled.insert(endpoint.to_string());
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ServiceClient for MockEndpoints {
    async fn execute_query(
        &self,
        endpoint: &Iri,
        query: &Query,
        _timeout: Duration,
    ) -> Result<BindingSet> {
        let table = match query.pattern.elements().first() {
            Some(GraphPattern::Values(table)) => Some(table.clone()),
            _ => None,
        };
        self.requests.lock().push(Request {
            endpoint: endpoint.as_str().to_string(),
            query: query.to_string(),
            values_rows: table.as_ref().map(|t| t.rows.len()),
        });

        if let Some(delay) = self.delays.get(endpoint.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        if self.down.contains(endpoint.as_str()) {
            return Err(FederationError::transport(endpoint.as_str(), "connection refused"));
        }
        if self.garbled.contains(endpoint.as_str()) {
            return Err(FederationError::parse(endpoint.as_str(), "unexpected end of document"));
        }

        let tag = Term::literal(endpoint.as_str());
        let Some(table) = table else {
            let mut binding = Binding::new();
            binding.insert("src".to_string(), tag);
            return Ok(vec![binding]);
        };
        Ok(table
            .rows
            .iter()
            .map(|row| {
                let mut binding: Binding = table
                    .variables
                    .iter()
                    .zip(row)
                    .filter_map(|(var, value)| value.clone().map(|v| (var.clone(), v)))
                    .collect();
                binding.insert("src".to_string(), tag.clone());
                binding
            })
            .collect())
    }
}

pub fn triple(s: &str, predicate: &str, o: &str) -> GraphPattern {
    GraphPattern::triple(Term::var(s), Term::iri(predicate), Term::var(o))
}

/// `?s` bound to `count` distinct subjects
pub fn subjects(count: usize) -> BindingSet {
    (0..count)
        .map(|i| {
            let mut binding = Binding::new();
            binding.insert("s".to_string(), Term::iri(format!("http://example.org/person/{}", i)));
            binding
        })
        .collect()
}

/// Route library logs to the test output; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
