//! Distributed execution of SERVICE nodes against scripted endpoints

mod common;

use async_trait::async_trait;
use common::*;
use oxirs_fedquery::executor::slice_sizes;
use oxirs_fedquery::{
    Binding, BindingSet, DistributedExecutor, Environment, ExecutionContext, ExecutionOptions,
    Iri, LocalEngine, ProtocolVersion, Query, ServiceEndpoints, ServicePattern, ServiceRouter,
    ServiceVisitor, StaticProtocolVersions, Term,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    endpoints: Arc<MockEndpoints>,
    router: Arc<ServiceRouter>,
    versions: Arc<StaticProtocolVersions>,
}

impl Harness {
    fn new(endpoints: MockEndpoints) -> Self {
        let endpoints = Arc::new(endpoints);
        Self {
            router: Arc::new(ServiceRouter::new(endpoints.clone())),
            endpoints,
            versions: Arc::new(StaticProtocolVersions::new()),
        }
    }

    fn executor(&self) -> DistributedExecutor {
        DistributedExecutor::new(self.router.clone(), self.versions.clone())
    }
}

fn name_service(endpoints: &[&str]) -> ServicePattern {
    ServicePattern::new(
        ServiceEndpoints::Endpoints(endpoints.iter().map(|e| Iri::new(*e)).collect()),
        vec![triple("s", NAME, "n")],
    )
}

fn options(parallel: bool, slice: Option<usize>) -> ExecutionOptions {
    ExecutionOptions {
        parallel,
        slice,
        ..ExecutionOptions::default()
    }
}

fn sources(results: &[Binding]) -> Vec<String> {
    results
        .iter()
        .filter_map(|b| match b.get("src") {
            Some(Term::Literal(lit)) => Some(lit.value.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_slices_of_twenty_five_bindings() {
    init_tracing();
    let harness = Harness::new(MockEndpoints::new());
    let input = subjects(25);
    let ctx = ExecutionContext::new(options(false, Some(10)));

    let results = harness
        .executor()
        .execute(&name_service(&[E1]), Some(input.as_slice()), &Environment::new(), &ctx)
        .await;

    let rows: Vec<Option<usize>> = harness
        .endpoints
        .requests()
        .iter()
        .map(|r| r.values_rows)
        .collect();
    assert_eq!(rows, vec![Some(10), Some(10), Some(5)]);
    assert_eq!(results.len(), 25);
    for (sent, received) in input.iter().zip(&results) {
        assert_eq!(sent.get("s"), received.get("s"));
    }
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn test_stop_before_dispatch_sends_nothing() {
    for parallel in [false, true] {
        let harness = Harness::new(MockEndpoints::new());
        let ctx = ExecutionContext::new(options(parallel, Some(10)));
        ctx.stop();

        let input = subjects(25);
        let results = harness
            .executor()
            .execute(&name_service(&[E1, E2]), Some(input.as_slice()), &Environment::new(), &ctx)
            .await;
        assert!(results.is_empty());
        assert_eq!(harness.endpoints.request_count(), 0);
    }
}

/// Raises the stop flag while answering its first request
struct StoppingEngine {
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl LocalEngine for StoppingEngine {
    async fn query(&self, _query: &Query) -> anyhow::Result<BindingSet> {
        self.stop.store(true, Ordering::SeqCst);
        Ok(vec![Binding::new()])
    }
}

#[tokio::test]
async fn test_stop_between_slices_skips_the_rest() {
    let harness = Harness::new(MockEndpoints::new());
    let ctx = ExecutionContext::new(options(false, Some(10)));
    harness.router.register_local(
        "db:people",
        Arc::new(StoppingEngine {
            stop: ctx.stop_handle(),
        }),
    );

    let input = subjects(25);
    let results = harness
        .executor()
        .execute(
            &name_service(&["db:people", E1]),
            Some(input.as_slice()),
            &Environment::new(),
            &ctx,
        )
        .await;

    // first slice answered locally, everything after it skipped
    assert_eq!(results.len(), 1);
    assert_eq!(harness.endpoints.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_merge_follows_endpoint_order_not_completion() {
    let endpoints = MockEndpoints::new()
        .with_delay(E1, Duration::from_millis(300))
        .with_delay(E2, Duration::from_millis(100));
    let harness = Harness::new(endpoints);
    let service = name_service(&[E1, E2, E3]);

    for parallel in [true, false] {
        let ctx = ExecutionContext::new(options(parallel, None));
        let results = harness
            .executor()
            .execute(&service, None, &Environment::new(), &ctx)
            .await;
        assert_eq!(sources(&results), vec![E1, E2, E3]);
    }
}

#[tokio::test]
async fn test_failing_endpoints_are_isolated() {
    init_tracing();
    let endpoints = MockEndpoints::new().with_down(E1).with_garbled(E3);
    let harness = Harness::new(endpoints);
    let service = name_service(&[E1, E2, E3]);

    for parallel in [false, true] {
        let ctx = ExecutionContext::new(options(parallel, None));
        let results = harness
            .executor()
            .execute(&service, None, &Environment::new(), &ctx)
            .await;
        assert_eq!(sources(&results), vec![E2]);
        assert_eq!(ctx.errors().len(), 2);
        assert_eq!(
            ctx.errors().failed_endpoints(),
            vec![E1.to_string(), E3.to_string()]
        );
    }
}

#[tokio::test]
async fn test_endpoint_variable_fans_out_over_input() {
    let harness = Harness::new(MockEndpoints::new());
    let service = ServicePattern::new(
        ServiceEndpoints::Variable("serv".to_string()),
        vec![triple("s", NAME, "n")],
    );
    let input: BindingSet = [(E1, 0), (E2, 1), (E1, 2)]
        .iter()
        .map(|(endpoint, i)| {
            let mut binding = Binding::new();
            binding.insert("serv".to_string(), Term::iri(*endpoint));
            binding.insert("s".to_string(), Term::iri(format!("http://example.org/person/{}", i)));
            binding
        })
        .collect();
    let ctx = ExecutionContext::new(ExecutionOptions::default());

    let results = harness
        .executor()
        .execute(&service, Some(input.as_slice()), &Environment::new(), &ctx)
        .await;

    let requests = harness.endpoints.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].endpoint, E1);
    assert_eq!(requests[0].values_rows, Some(2));
    assert_eq!(requests[1].values_rows, Some(1));
    assert_eq!(sources(&results), vec![E1, E1, E2]);
    for (binding, source) in results.iter().zip(sources(&results)) {
        assert_eq!(binding.get("serv"), Some(&Term::iri(source)));
    }
}

#[tokio::test]
async fn test_legacy_endpoint_receives_filter_bindings() {
    let harness = Harness::new(MockEndpoints::new());
    harness.versions.set(E2, ProtocolVersion::Sparql10);
    let input = subjects(2);
    let ctx = ExecutionContext::new(ExecutionOptions::default());

    harness
        .executor()
        .execute(&name_service(&[E1, E2]), Some(input.as_slice()), &Environment::new(), &ctx)
        .await;

    let requests = harness.endpoints.requests();
    assert_eq!(requests[0].values_rows, Some(2));
    assert_eq!(requests[1].values_rows, None);
    assert!(requests[1].query.contains("FILTER("));
}

#[derive(Default)]
struct CountingVisitor {
    per_endpoint: Mutex<Vec<(String, usize)>>,
    total: Mutex<Option<usize>>,
}

impl ServiceVisitor for CountingVisitor {
    fn endpoint_results(&self, endpoint: &Iri, results: &[Binding]) {
        self.per_endpoint
            .lock()
            .push((endpoint.as_str().to_string(), results.len()));
    }

    fn service_results(&self, _service: &ServicePattern, results: &[Binding]) {
        *self.total.lock() = Some(results.len());
    }
}

#[tokio::test]
async fn test_visitor_observes_without_changing_results() {
    let harness = Harness::new(MockEndpoints::new().with_down(E2));
    let visitor = Arc::new(CountingVisitor::default());
    let ctx = ExecutionContext::new(ExecutionOptions::default()).with_visitor(visitor.clone());

    let results = harness
        .executor()
        .execute(&name_service(&[E1, E2]), None, &Environment::new(), &ctx)
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(
        *visitor.per_endpoint.lock(),
        vec![(E1.to_string(), 1), (E2.to_string(), 0)]
    );
    assert_eq!(*visitor.total.lock(), Some(1));
}

proptest! {
    #[test]
    fn slicing_law(total in 1usize..60, slice in 1usize..15) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let harness = Harness::new(MockEndpoints::new());
        let input = subjects(total);
        let ctx = ExecutionContext::new(options(false, Some(slice)));

        let results = runtime.block_on(harness.executor().execute(
            &name_service(&[E1]),
            Some(input.as_slice()),
            &Environment::new(),
            &ctx,
        ));

        let sizes: Vec<usize> = harness
            .endpoints
            .requests()
            .iter()
            .filter_map(|r| r.values_rows)
            .collect();
        prop_assert_eq!(sizes.len(), total.div_ceil(slice));
        prop_assert_eq!(sizes, slice_sizes(total, slice));
        prop_assert_eq!(results.len(), total);
    }
}
