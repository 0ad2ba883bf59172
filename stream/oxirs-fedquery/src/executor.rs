//! # Distributed Executor
//!
//! Evaluates one rewritten SERVICE node against its endpoints. Incoming
//! bindings are sliced into batches, compiled into one request per batch and
//! dispatched inline or on one task per endpoint. Results are merged in
//! endpoint-list order whatever the completion order was. A failing endpoint
//! contributes nothing and is recorded in the query's [`ErrorLog`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::algebra::{
    Binding, BindingSet, Environment, Iri, Metadata, ServiceEndpoints, ServicePattern, Term,
    Variable,
};
use crate::binding_compiler::{BindingCompiler, ProtocolVersionStrategy};
use crate::config::{ExecutionOptions, ExecutorConfig};
use crate::error::FederationError;
use crate::service_client::ServiceRouter;

/// Failures recorded against the top-level query
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    errors: Arc<Mutex<Vec<FederationError>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: FederationError) {
        self.errors.lock().push(error);
    }

    /// Rendered messages, in recording order
    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().iter().map(|e| e.to_string()).collect()
    }

    /// Endpoints that have at least one recorded failure
    pub fn failed_endpoints(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.errors
            .lock()
            .iter()
            .filter_map(|e| e.endpoint())
            .filter(|e| seen.insert(e.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Drain every recorded failure
    pub fn take(&self) -> Vec<FederationError> {
        std::mem::take(&mut *self.errors.lock())
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

/// Advisory observer of endpoint results; cannot change them
pub trait ServiceVisitor: Send + Sync {
    fn endpoint_results(&self, _endpoint: &Iri, _results: &[Binding]) {}

    fn service_results(&self, _service: &ServicePattern, _results: &[Binding]) {}
}

/// State shared by every SERVICE evaluation of one top-level query
#[derive(Clone)]
pub struct ExecutionContext {
    pub options: ExecutionOptions,
    stop: Arc<AtomicBool>,
    errors: ErrorLog,
    visitor: Option<Arc<dyn ServiceVisitor>>,
}

impl ExecutionContext {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            stop: Arc::new(AtomicBool::new(false)),
            errors: ErrorLog::new(),
            visitor: None,
        }
    }

    pub fn with_visitor(mut self, visitor: Arc<dyn ServiceVisitor>) -> Self {
        self.visitor = Some(visitor);
        self
    }

    /// Request cooperative cancellation
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Flag that can be raised from another task
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }
}

/// Executes SERVICE nodes over local engines and remote endpoints
pub struct DistributedExecutor {
    router: Arc<ServiceRouter>,
    versions: Arc<dyn ProtocolVersionStrategy>,
    config: ExecutorConfig,
}

impl DistributedExecutor {
    pub fn new(router: Arc<ServiceRouter>, versions: Arc<dyn ProtocolVersionStrategy>) -> Self {
        Self::with_config(router, versions, ExecutorConfig::default())
    }

    pub fn with_config(
        router: Arc<ServiceRouter>,
        versions: Arc<dyn ProtocolVersionStrategy>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            router,
            versions,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execution context for a query carrying `metadata`
    pub fn context_for(&self, metadata: &Metadata) -> ExecutionContext {
        ExecutionContext::new(ExecutionOptions::from_metadata(metadata, &self.config))
    }

    /// Evaluate `service` for `input`, which may be absent when nothing has
    /// been bound yet
    #[instrument(skip_all, fields(endpoints = %service.endpoints))]
    pub async fn execute(
        &self,
        service: &ServicePattern,
        input: Option<&[Binding]>,
        env: &Environment,
        ctx: &ExecutionContext,
    ) -> BindingSet {
        let endpoint_var = service.endpoints.as_variable().cloned();
        let endpoints = resolve_endpoints(&service.endpoints, input, env);
        if endpoints.is_empty() {
            if let Some(var) = endpoint_var {
                warn!("Service endpoint ?{} is unbound, skipping", var);
                ctx.errors.record(FederationError::UndefinedEndpoint(var));
            }
            return BindingSet::new();
        }

        let options = &ctx.options;
        let input: Option<Vec<Binding>> = if options.skip_bindings {
            None
        } else {
            input.map(<[Binding]>::to_vec)
        };
        let shared_service = Arc::new(service.clone());
        let shared_env = Arc::new(env.clone());

        let jobs = endpoints.into_iter().filter_map(|endpoint| {
            let restricted = restrict_to_endpoint(input.as_deref(), endpoint_var.as_ref(), &endpoint);
            // no input row can join with this endpoint
            if let (Some(all), Some(kept)) = (&input, &restricted) {
                if !all.is_empty() && kept.is_empty() {
                    debug!("No input binding matches {}, skipping", endpoint.as_str());
                    return None;
                }
            }
            Some(EndpointJob {
                router: self.router.clone(),
                versions: self.versions.clone(),
                service: shared_service.clone(),
                input: restricted,
                endpoint_var: endpoint_var.clone(),
                env: shared_env.clone(),
                options: options.clone(),
                stop: ctx.stop_handle(),
                endpoint,
            })
        });

        let outcomes = if options.parallel {
            self.dispatch_parallel(jobs, ctx).await
        } else {
            let mut outcomes = Vec::new();
            for job in jobs {
                if ctx.is_stopped() {
                    debug!("Stop requested, skipping {}", job.endpoint.as_str());
                    continue;
                }
                outcomes.push(job.run().await);
            }
            outcomes
        };

        self.merge(service, outcomes, ctx)
    }

    async fn dispatch_parallel(
        &self,
        jobs: impl Iterator<Item = EndpointJob>,
        ctx: &ExecutionContext,
    ) -> Vec<EndpointOutcome> {
        let mut handles = Vec::new();
        for job in jobs {
            if ctx.is_stopped() {
                debug!("Stop requested, not starting {}", job.endpoint.as_str());
                continue;
            }
            let endpoint = job.endpoint.clone();
            handles.push((endpoint, tokio::spawn(job.run())));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (endpoint, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(EndpointOutcome {
                    results: BindingSet::new(),
                    errors: vec![FederationError::transport(
                        endpoint.as_str(),
                        format!("endpoint task aborted: {}", e),
                    )],
                    endpoint,
                }),
            }
        }
        outcomes
    }

    fn merge(
        &self,
        service: &ServicePattern,
        outcomes: Vec<EndpointOutcome>,
        ctx: &ExecutionContext,
    ) -> BindingSet {
        if let Some(visitor) = &ctx.visitor {
            for outcome in &outcomes {
                visitor.endpoint_results(&outcome.endpoint, &outcome.results);
            }
        }

        let mut merged = BindingSet::new();
        for outcome in outcomes {
            for error in outcome.errors {
                ctx.errors.record(error);
            }
            merged.extend(outcome.results);
        }

        if let Some(visitor) = &ctx.visitor {
            visitor.service_results(service, &merged);
        }
        info!("Service {} returned {} bindings", service.endpoints, merged.len());
        merged
    }
}

/// Work for one endpoint; owns everything so it can run on its own task
struct EndpointJob {
    router: Arc<ServiceRouter>,
    versions: Arc<dyn ProtocolVersionStrategy>,
    service: Arc<ServicePattern>,
    endpoint: Iri,
    endpoint_var: Option<Variable>,
    input: Option<Vec<Binding>>,
    env: Arc<Environment>,
    options: ExecutionOptions,
    stop: Arc<AtomicBool>,
}

struct EndpointOutcome {
    endpoint: Iri,
    results: BindingSet,
    errors: Vec<FederationError>,
}

impl EndpointJob {
    async fn run(self) -> EndpointOutcome {
        let mut results = BindingSet::new();
        let mut unconstrained_sent = false;

        let batches: Vec<Option<&[Binding]>> = match (&self.input, self.options.slice) {
            (Some(input), Some(size)) if !input.is_empty() => {
                input.chunks(size.max(1)).map(Some).collect()
            }
            (input, _) => vec![input.as_deref()],
        };

        for (index, batch) in batches.into_iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                debug!(
                    "Stop requested, skipping remaining slices for {}",
                    self.endpoint.as_str()
                );
                break;
            }

            let request = BindingCompiler::new(self.options.binding_mode, self.versions.as_ref())
                .with_service_limit(self.options.service_limit)
                .compile(&self.endpoint, &self.service, batch, &self.env);
            if !request.constrained {
                // the same unconstrained request already returned everything
                if unconstrained_sent {
                    debug!("Slice {} of {} carries no constraint, skipped", index, self.endpoint.as_str());
                    continue;
                }
                unconstrained_sent = true;
            }

            debug!(
                "Slice {} ({} bindings) to {}",
                index,
                batch.map_or(0, <[Binding]>::len),
                self.endpoint.as_str()
            );
            match self
                .router
                .send(&self.endpoint, &request.query, self.options.timeout)
                .await
            {
                Ok(bindings) => results.extend(self.tag_endpoint(bindings)),
                Err(FederationError::ResponseParseFailed { endpoint, reason })
                    if self.options.trap =>
                {
                    debug!("Trapped malformed response from {}: {}", endpoint, reason);
                }
                Err(error) => {
                    warn!("Endpoint {} failed: {}", self.endpoint.as_str(), error);
                    return EndpointOutcome {
                        endpoint: self.endpoint,
                        results: BindingSet::new(),
                        errors: vec![error],
                    };
                }
            }
        }

        EndpointOutcome {
            endpoint: self.endpoint,
            results,
            errors: Vec::new(),
        }
    }

    /// Join `?endpointVar = endpoint` into every result, dropping conflicts
    fn tag_endpoint(&self, bindings: BindingSet) -> impl Iterator<Item = Binding> + '_ {
        let value = Term::Iri(self.endpoint.clone());
        bindings.into_iter().filter_map(move |mut binding| {
            let Some(var) = &self.endpoint_var else {
                return Some(binding);
            };
            match binding.get(var) {
                Some(existing) if *existing != value => None,
                Some(_) => Some(binding),
                None => {
                    binding.insert(var.clone(), value.clone());
                    Some(binding)
                }
            }
        })
    }
}

/// Endpoints to query, in list order. A variable position is taken from the
/// environment first, then from the distinct values it holds in the input.
fn resolve_endpoints(
    endpoints: &ServiceEndpoints,
    input: Option<&[Binding]>,
    env: &Environment,
) -> Vec<Iri> {
    match endpoints {
        ServiceEndpoints::Endpoints(list) => list.clone(),
        ServiceEndpoints::Variable(var) => {
            if let Some(iri) = env.get(var).and_then(endpoint_value) {
                return vec![iri];
            }
            let mut seen = HashSet::new();
            input
                .unwrap_or_default()
                .iter()
                .filter_map(|b| b.get(var).and_then(endpoint_value))
                .filter(|iri| seen.insert(iri.clone()))
                .collect()
        }
    }
}

fn endpoint_value(term: &Term) -> Option<Iri> {
    match term {
        Term::Iri(iri) => Some(iri.clone()),
        Term::Literal(literal) if literal.datatype.is_none() && literal.language.is_none() => {
            Some(Iri::new(literal.value.clone()))
        }
        _ => None,
    }
}

/// Bindings compatible with `?var = endpoint`
fn restrict_to_endpoint(
    input: Option<&[Binding]>,
    endpoint_var: Option<&Variable>,
    endpoint: &Iri,
) -> Option<Vec<Binding>> {
    let input = input?;
    let Some(var) = endpoint_var else {
        return Some(input.to_vec());
    };
    Some(
        input
            .iter()
            .filter(|b| match b.get(var) {
                None => true,
                Some(term) => endpoint_value(term).as_ref() == Some(endpoint),
            })
            .cloned()
            .collect(),
    )
}

/// Batch sizes produced for `total` bindings at batch size `slice`
pub fn slice_sizes(total: usize, slice: usize) -> Vec<usize> {
    let slice = slice.max(1);
    (0..total.div_ceil(slice))
        .map(|i| slice.min(total - i * slice))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{GraphPattern, Literal, Query};
    use crate::binding_compiler::StaticProtocolVersions;
    use crate::error::Result;
    use crate::service_client::ServiceClient;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers every request with one binding per endpoint
    #[derive(Default)]
    struct EchoClient {
        requests: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ServiceClient for EchoClient {
        async fn execute_query(
            &self,
            endpoint: &Iri,
            query: &Query,
            _timeout: Duration,
        ) -> Result<BindingSet> {
            self.requests
                .lock()
                .push((endpoint.as_str().to_string(), query.to_string()));
            if endpoint.as_str().contains("down") {
                return Err(FederationError::transport(endpoint.as_str(), "connection refused"));
            }
            if endpoint.as_str().contains("garbled") {
                return Err(FederationError::parse(endpoint.as_str(), "unexpected EOF"));
            }
            let mut binding = Binding::new();
            binding.insert("n".to_string(), Term::literal(endpoint.as_str()));
            Ok(vec![binding])
        }
    }

    fn executor(client: Arc<EchoClient>) -> DistributedExecutor {
        DistributedExecutor::new(
            Arc::new(ServiceRouter::new(client)),
            Arc::new(StaticProtocolVersions::new()),
        )
    }

    fn body() -> Vec<GraphPattern> {
        vec![GraphPattern::triple(
            Term::var("s"),
            Term::iri("http://xmlns.com/foaf/0.1/name"),
            Term::var("n"),
        )]
    }

    #[test]
    fn test_slice_sizes() {
        assert_eq!(slice_sizes(25, 10), vec![10, 10, 5]);
        assert_eq!(slice_sizes(20, 10), vec![10, 10]);
        assert_eq!(slice_sizes(3, 10), vec![3]);
        assert!(slice_sizes(0, 10).is_empty());
    }

    #[test]
    fn test_endpoint_variable_resolution() {
        let var = ServiceEndpoints::Variable("serv".to_string());
        let input: Vec<Binding> = ["http://a/sparql", "http://b/sparql", "http://a/sparql"]
            .iter()
            .map(|e| [("serv".to_string(), Term::iri(*e))].into_iter().collect())
            .collect();
        let resolved = resolve_endpoints(&var, Some(input.as_slice()), &Environment::new());
        assert_eq!(resolved, vec![Iri::new("http://a/sparql"), Iri::new("http://b/sparql")]);

        let env: Environment = [("serv".to_string(), Term::Literal(Literal::simple("http://c/sparql")))]
            .into_iter()
            .collect();
        let resolved = resolve_endpoints(&var, Some(input.as_slice()), &env);
        assert_eq!(resolved, vec![Iri::new("http://c/sparql")]);

        let restricted = restrict_to_endpoint(
            Some(input.as_slice()),
            Some(&"serv".to_string()),
            &Iri::new("http://b/sparql"),
        );
        assert_eq!(restricted.map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn test_unbound_endpoint_variable_is_recorded() {
        let client = Arc::new(EchoClient::default());
        let executor = executor(client.clone());
        let service = ServicePattern::new(ServiceEndpoints::Variable("serv".to_string()), body());
        let ctx = ExecutionContext::new(ExecutionOptions::default());

        let results = executor.execute(&service, None, &Environment::new(), &ctx).await;
        assert!(results.is_empty());
        assert_eq!(ctx.errors().len(), 1);
        assert!(client.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_variable_is_joined_into_results() {
        let client = Arc::new(EchoClient::default());
        let executor = executor(client.clone());
        let service = ServicePattern::new(ServiceEndpoints::Variable("serv".to_string()), body());
        let env: Environment = [("serv".to_string(), Term::iri("http://a/sparql"))]
            .into_iter()
            .collect();
        let ctx = ExecutionContext::new(ExecutionOptions::default());

        let results = executor.execute(&service, None, &env, &ctx).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("serv"), Some(&Term::iri("http://a/sparql")));
    }

    #[tokio::test]
    async fn test_endpoint_without_matching_input_is_skipped() {
        let client = Arc::new(EchoClient::default());
        let executor = executor(client.clone());
        let service = ServicePattern::new(ServiceEndpoints::Variable("serv".to_string()), body());
        let env: Environment = [("serv".to_string(), Term::iri("http://a/sparql"))]
            .into_iter()
            .collect();
        let mut binding = Binding::new();
        binding.insert("serv".to_string(), Term::iri("http://b/sparql"));
        binding.insert("s".to_string(), Term::iri("http://example.org/alice"));
        let input = vec![binding];
        let ctx = ExecutionContext::new(ExecutionOptions::default());

        let results = executor
            .execute(&service, Some(input.as_slice()), &env, &ctx)
            .await;
        assert!(results.is_empty());
        assert!(client.requests.lock().is_empty());
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_trapped_parse_error_is_not_recorded() {
        let client = Arc::new(EchoClient::default());
        let executor = executor(client.clone());
        let service = ServicePattern::new(
            ServiceEndpoints::Endpoints(vec![
                Iri::new("http://garbled/sparql"),
                Iri::new("http://ok/sparql"),
            ]),
            body(),
        );

        let mut options = ExecutionOptions::default();
        options.trap = true;
        let ctx = ExecutionContext::new(options.clone());
        let results = executor.execute(&service, None, &Environment::new(), &ctx).await;
        assert_eq!(results.len(), 1);
        assert!(ctx.errors().is_empty());

        options.trap = false;
        let ctx = ExecutionContext::new(options);
        let results = executor.execute(&service, None, &Environment::new(), &ctx).await;
        assert_eq!(results.len(), 1);
        assert_eq!(ctx.errors().failed_endpoints(), vec!["http://garbled/sparql".to_string()]);
    }

    #[tokio::test]
    async fn test_unconstrained_slices_sent_once() {
        let client = Arc::new(EchoClient::default());
        let executor = executor(client.clone());
        let service = ServicePattern::new(ServiceEndpoints::single(Iri::new("http://ok/sparql")), body());
        // bindings over a variable the body never mentions
        let input: Vec<Binding> = (0..5)
            .map(|i| [("z".to_string(), Term::Literal(Literal::integer(i)))].into_iter().collect())
            .collect();
        let mut options = ExecutionOptions::default();
        options.slice = Some(2);
        let ctx = ExecutionContext::new(options);

        let results = executor
            .execute(&service, Some(input.as_slice()), &Environment::new(), &ctx)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(client.requests.lock().len(), 1);
    }
}
