//! # OxiRS FedQuery - Federated SPARQL Planning and Execution
//!
//! Rewrites a SPARQL query over a federation of endpoints into a tree of
//! SERVICE nodes, then evaluates those nodes against remote endpoints and
//! embedded local engines.
//!
//! ## Planning
//! - **Source selection**: candidate endpoints per triple pattern, from a
//!   static predicate registry or from probe queries ([`SourceSelector`]).
//! - **BGP partitioning**: patterns sharing a candidate list are grouped into
//!   one SERVICE; connected residuals are grown by join compatibility
//!   ([`partition`]).
//! - **Tree rewriting**: FILTER and BIND relocation, EXISTS merging, LIMIT
//!   push-down, named-graph distribution and endpoint exposure
//!   ([`FederationPlanner`]).
//!
//! ## Execution
//! - VALUES or FILTER binding propagation per endpoint protocol version
//! - Slicing of large binding sets into fixed-size batches
//! - Sequential or per-endpoint parallel dispatch with ordered merge
//! - Cooperative cancellation and per-endpoint failure isolation
//!
//! ## Example
//!
//! ```rust,no_run
//! use oxirs_fedquery::{FederationEngine, FederationRegistry, Iri, PredicateRegistry};
//!
//! # async fn example(query: oxirs_fedquery::Query) -> oxirs_fedquery::Result<()> {
//! let registry = FederationRegistry::new();
//! registry.define_federation(
//!     "people",
//!     vec![Iri::new("http://e1.example/sparql"), Iri::new("http://e2.example/sparql")],
//! );
//! let predicates = PredicateRegistry::new()
//!     .with_endpoint("http://e1.example/sparql", &["http://xmlns.com/foaf/0.1/name"]);
//!
//! let engine = FederationEngine::with_predicates(registry, predicates)?;
//! let planned = engine.plan(query).await;
//! println!("{}", planned);
//! # Ok(())
//! # }
//! ```

pub mod algebra;
pub mod binding_compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod partition;
pub mod registry;
pub mod results;
pub mod rewrite;
pub mod service_client;
pub mod source_selection;

pub use algebra::{
    Binding, BindingSet, Environment, Expression, Fragment, GraphPattern, Iri, Literal, Metadata,
    Query, ServiceEndpoints, ServicePattern, Term, TriplePattern, ValuesTable, Variable,
};
pub use binding_compiler::{
    BindingCompiler, CompiledRequest, ProtocolVersion, ProtocolVersionStrategy,
    StaticProtocolVersions,
};
pub use config::{BindingMode, ExecutionOptions, ExecutorConfig, FederationOptions};
pub use error::{FederationError, Result};
pub use executor::{DistributedExecutor, ErrorLog, ExecutionContext, ServiceVisitor};
pub use registry::FederationRegistry;
pub use rewrite::FederationPlanner;
pub use service_client::{
    ClientStats, HttpServiceClient, LocalEngine, ServiceClient, ServiceRouter, LOCAL_SCHEME,
};
pub use source_selection::{CandidateList, EndpointIndex, PredicateRegistry, SourceSelector};

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use config::annotation;

/// Planner and executor wired over one federation registry
pub struct FederationEngine {
    registry: FederationRegistry,
    selector: SourceSelector,
    executor: DistributedExecutor,
    options: FederationOptions,
}

impl FederationEngine {
    pub fn new(
        registry: FederationRegistry,
        selector: SourceSelector,
        executor: DistributedExecutor,
    ) -> Self {
        Self {
            registry,
            selector,
            executor,
            options: FederationOptions::default(),
        }
    }

    /// HTTP transport with source selection over a static predicate registry
    pub fn with_predicates(
        registry: FederationRegistry,
        predicates: PredicateRegistry,
    ) -> Result<Self> {
        let router = Arc::new(ServiceRouter::new(Arc::new(HttpServiceClient::new()?)));
        let executor = DistributedExecutor::new(router, Arc::new(StaticProtocolVersions::new()));
        Ok(Self::new(
            registry,
            SourceSelector::with_registry(predicates),
            executor,
        ))
    }

    /// Baseline switches; query annotations are applied on top per query
    pub fn with_options(mut self, options: FederationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &FederationRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &DistributedExecutor {
        &self.executor
    }

    /// Endpoint list named by the query's `@federate` annotation.
    ///
    /// `@federate name url1 .. urln` registers the federation before use; a
    /// bare unknown name is taken as a single endpoint URL.
    pub fn federation_for(&self, metadata: &Metadata) -> Option<Vec<Iri>> {
        let values = metadata.values(annotation::FEDERATE);
        let (name, urls) = values.split_first()?;
        if !urls.is_empty() {
            self.registry
                .define_federation(name.clone(), urls.iter().map(Iri::new).collect());
        }
        Some(self.registry.resolve(name))
    }

    /// Rewrite a `@federate` query; other queries are returned unchanged
    pub async fn plan(&self, query: Query) -> Query {
        match self.federation_for(&query.metadata) {
            Some(federation) => self.plan_over(&federation, query).await,
            None => {
                debug!("No @federate annotation, query left as is");
                query
            }
        }
    }

    /// Rewrite `query` over an explicit federation. A source selection
    /// failure leaves the query unrewritten.
    #[instrument(skip_all, fields(endpoints = federation.len()))]
    pub async fn plan_over(&self, federation: &[Iri], query: Query) -> Query {
        let options = self.options.clone().with_metadata(&query.metadata);
        match self.selector.build_index(federation, &query, &options).await {
            Ok(index) => FederationPlanner::new(&index, options).rewrite(query),
            Err(e) => {
                warn!("Source selection failed, evaluating query unrewritten: {}", e);
                query
            }
        }
    }

    /// Execution context carrying the annotations of `query`
    pub fn context_for(&self, query: &Query) -> ExecutionContext {
        self.executor.context_for(&query.metadata)
    }

    /// Evaluate one SERVICE node of a planned query
    pub async fn execute_service(
        &self,
        service: &ServicePattern,
        input: Option<&[Binding]>,
        env: &Environment,
        ctx: &ExecutionContext,
    ) -> BindingSet {
        self.executor.execute(service, input, env, ctx).await
    }
}
