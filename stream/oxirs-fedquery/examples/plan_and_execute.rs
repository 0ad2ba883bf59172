//! Plan a federated query and evaluate its SERVICE nodes
//!
//! Two in-process engines stand in for remote endpoints under the `db:`
//! scheme, so the example needs no network.
//!
//! Run with: `cargo run --example plan_and_execute`

use anyhow::Result;
use async_trait::async_trait;
use oxirs_fedquery::{
    Binding, BindingSet, DistributedExecutor, Environment, FederationEngine, FederationRegistry,
    GraphPattern, HttpServiceClient, Iri, LocalEngine, Metadata, PredicateRegistry, Query,
    ServiceRouter, SourceSelector, StaticProtocolVersions, Term,
};
use std::sync::Arc;
use tracing::info;

const PEOPLE: &str = "db:people";
const AGES: &str = "db:ages";
const NAME: &str = "http://xmlns.com/foaf/0.1/name";
const AGE: &str = "http://xmlns.com/foaf/0.1/age";

/// Answers every query with a fixed table
struct TableEngine {
    rows: Vec<Vec<(&'static str, Term)>>,
}

#[async_trait]
impl LocalEngine for TableEngine {
    async fn query(&self, query: &Query) -> Result<BindingSet> {
        info!("  {}", query);
        Ok(self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(var, term)| (var.to_string(), term.clone()))
                    .collect::<Binding>()
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let router = Arc::new(ServiceRouter::new(Arc::new(HttpServiceClient::new()?)));
    router.register_local(
        PEOPLE,
        Arc::new(TableEngine {
            rows: vec![
                vec![("s", Term::iri("http://example.org/alice")), ("n", Term::literal("Alice"))],
                vec![("s", Term::iri("http://example.org/bob")), ("n", Term::literal("Bob"))],
            ],
        }),
    );
    router.register_local(
        AGES,
        Arc::new(TableEngine {
            rows: vec![vec![("s", Term::iri("http://example.org/alice")), ("a", Term::literal("42"))]],
        }),
    );

    let registry = FederationRegistry::new();
    registry.define_federation("demo", vec![Iri::new(PEOPLE), Iri::new(AGES)]);
    let predicates = PredicateRegistry::new()
        .with_endpoint(PEOPLE, &[NAME])
        .with_endpoint(AGES, &[AGE]);
    let executor = DistributedExecutor::new(router, Arc::new(StaticProtocolVersions::new()));
    let engine = FederationEngine::new(registry, SourceSelector::with_registry(predicates), executor);

    let query = Query::select_all(GraphPattern::group(vec![
        GraphPattern::triple(Term::var("s"), Term::iri(NAME), Term::var("n")),
        GraphPattern::triple(Term::var("s"), Term::iri(AGE), Term::var("a")),
    ]))
    .with_metadata(Metadata::new().with("federate", &["demo"]).with("slice", &["1"]));

    info!("Original: {}", query);
    let planned = engine.plan(query).await;
    info!("Planned:  {}", planned);

    // feed the first service's answers into the second, as a join would
    let ctx = engine.context_for(&planned);
    let mut bindings: Option<BindingSet> = None;
    for service in planned.pattern.services() {
        info!("Evaluating SERVICE {}", service.endpoints);
        let results = engine
            .execute_service(service, bindings.as_deref(), &Environment::new(), &ctx)
            .await;
        info!("  -> {} bindings", results.len());
        bindings = Some(results);
    }

    if !ctx.errors().is_empty() {
        info!("Endpoint failures: {:?}", ctx.errors().messages());
    }
    Ok(())
}
