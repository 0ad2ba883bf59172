//! Service clients for remote SPARQL endpoints and embedded local engines
//!
//! Remote endpoints are queried with one HTTP POST per request, the query
//! text form-encoded in the body. Endpoints using the reserved `db:` scheme,
//! or registered explicitly, are answered in-process by a [`LocalEngine`].

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT},
    Client,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::algebra::{BindingSet, Iri, Query};
use crate::config::ExecutorConfig;
use crate::error::{FederationError, Result};
use crate::results::{parse_results, ResultsFormat};

/// Reserved scheme of local pseudo-endpoints
pub const LOCAL_SCHEME: &str = "db:";

/// Transport for outbound service requests
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Send one query to one endpoint and decode the answer
    async fn execute_query(
        &self,
        endpoint: &Iri,
        query: &Query,
        timeout: Duration,
    ) -> Result<BindingSet>;

    /// Get client statistics
    fn get_stats(&self) -> ClientStats {
        ClientStats::default()
    }
}

/// Embedded single-node engine answering a federated sub-query in-process
#[async_trait]
pub trait LocalEngine: Send + Sync {
    async fn query(&self, query: &Query) -> anyhow::Result<BindingSet>;
}

/// SPARQL protocol client over HTTP
pub struct HttpServiceClient {
    http_client: Client,
    config: ExecutorConfig,
    stats: Arc<Mutex<ClientStats>>,
}

impl HttpServiceClient {
    pub fn new() -> Result<Self> {
        Self::with_config(ExecutorConfig::default())
    }

    pub fn with_config(config: ExecutorConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            http_client,
            config,
            stats: Arc::new(Mutex::new(ClientStats::default())),
        })
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|e| FederationError::Configuration(e.to_string()))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&self.config.accept)
                .map_err(|e| FederationError::Configuration(e.to_string()))?,
        );
        Ok(headers)
    }

    async fn post_query(&self, endpoint: &Iri, query: &str, timeout: Duration) -> Result<BindingSet> {
        let url = endpoint.as_str();
        let target = Url::parse(url)
            .map_err(|e| FederationError::transport(url, format!("invalid endpoint URL: {}", e)))?;
        let response = self
            .http_client
            .post(target)
            .headers(self.build_headers()?)
            .form(&[("query", query)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FederationError::Timeout {
                        endpoint: url.to_string(),
                        millis: timeout.as_millis() as u64,
                    }
                } else {
                    FederationError::transport(url, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::transport(
                url,
                format!("HTTP status {}", status),
            ));
        }

        let format = ResultsFormat::from_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response
            .text()
            .await
            .map_err(|e| FederationError::transport(url, e))?;
        parse_results(url, &body, format)
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn execute_query(
        &self,
        endpoint: &Iri,
        query: &Query,
        timeout: Duration,
    ) -> Result<BindingSet> {
        let text = query.to_string();
        debug!("POST {} ({} bytes)", endpoint.as_str(), text.len());
        let start_time = Instant::now();
        let result = self.post_query(endpoint, &text, timeout).await;
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.record_success(start_time.elapsed()),
            Err(e) => stats.record_error(error_kind(e)),
        }
        result
    }

    fn get_stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }
}

fn error_kind(error: &FederationError) -> &'static str {
    match error {
        FederationError::Timeout { .. } => "timeout",
        FederationError::ResponseParseFailed { .. } => "parse",
        FederationError::TransportFailed { .. } | FederationError::Http(_) => "transport",
        _ => "other",
    }
}

/// Client statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time: Duration,
    pub error_counts: HashMap<String, u64>,
}

impl ClientStats {
    /// Calculate average response time
    pub fn avg_response_time(&self) -> Duration {
        if self.successful_requests > 0 {
            self.total_response_time / self.successful_requests as u32
        } else {
            Duration::ZERO
        }
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_response_time += elapsed;
    }

    fn record_error(&mut self, kind: &str) {
        self.total_requests += 1;
        self.failed_requests += 1;
        *self.error_counts.entry(kind.to_string()).or_insert(0) += 1;
    }
}

/// Routes each request to a local engine or to the remote client
pub struct ServiceRouter {
    remote: Arc<dyn ServiceClient>,
    local_engines: DashMap<String, Arc<dyn LocalEngine>>,
    scheme_engine: Option<Arc<dyn LocalEngine>>,
    default_engine: Option<Arc<dyn LocalEngine>>,
}

impl ServiceRouter {
    pub fn new(remote: Arc<dyn ServiceClient>) -> Self {
        Self {
            remote,
            local_engines: DashMap::new(),
            scheme_engine: None,
            default_engine: None,
        }
    }

    /// Engine answering every `db:` endpoint without a dedicated engine
    pub fn with_scheme_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.scheme_engine = Some(engine);
        self
    }

    /// Engine answering endpoints whose remote transport fails
    pub fn with_default_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.default_engine = Some(engine);
        self
    }

    /// Answer `endpoint` in-process
    pub fn register_local(&self, endpoint: impl Into<String>, engine: Arc<dyn LocalEngine>) {
        self.local_engines.insert(endpoint.into(), engine);
    }

    pub fn is_local(&self, endpoint: &Iri) -> bool {
        self.local_engines.contains_key(endpoint.as_str())
            || endpoint.as_str().starts_with(LOCAL_SCHEME)
    }

    pub fn remote(&self) -> &Arc<dyn ServiceClient> {
        &self.remote
    }

    /// Send `query` to `endpoint`, honoring the per-request timeout
    pub async fn send(&self, endpoint: &Iri, query: &Query, timeout: Duration) -> Result<BindingSet> {
        let local = self
            .local_engines
            .get(endpoint.as_str())
            .map(|entry| entry.value().clone());
        if let Some(engine) = local {
            return run_local(endpoint, engine.as_ref(), query, timeout).await;
        }
        if endpoint.as_str().starts_with(LOCAL_SCHEME) {
            return match &self.scheme_engine {
                Some(engine) => run_local(endpoint, engine.as_ref(), query, timeout).await,
                None => Err(FederationError::transport(
                    endpoint.as_str(),
                    "no local engine registered for the db: scheme",
                )),
            };
        }

        match self.remote.execute_query(endpoint, query, timeout).await {
            Err(e @ FederationError::ResponseParseFailed { .. }) => Err(e),
            Err(e) => match &self.default_engine {
                Some(engine) => {
                    warn!(
                        "Endpoint {} unavailable ({}), answering with the default engine",
                        endpoint.as_str(),
                        e
                    );
                    run_local(endpoint, engine.as_ref(), query, timeout).await
                }
                None => Err(e),
            },
            ok => ok,
        }
    }
}

async fn run_local(
    endpoint: &Iri,
    engine: &dyn LocalEngine,
    query: &Query,
    timeout: Duration,
) -> Result<BindingSet> {
    debug!("Local evaluation for {}", endpoint.as_str());
    match tokio::time::timeout(timeout, engine.query(query)).await {
        Ok(Ok(bindings)) => Ok(bindings),
        Ok(Err(source)) => Err(FederationError::Local {
            endpoint: endpoint.as_str().to_string(),
            source,
        }),
        Err(_) => Err(FederationError::Timeout {
            endpoint: endpoint.as_str().to_string(),
            millis: timeout.as_millis() as u64,
        }),
    }
}
