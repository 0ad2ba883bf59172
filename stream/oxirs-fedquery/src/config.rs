//! Planning switches and executor configuration
//!
//! Switches are read once per query from its annotations. Defaults follow the
//! behaviour of a production federation deployment: source selection, deep
//! partitioning, join pruning and EXISTS merging on; per-fragment fallback,
//! endpoint-variable exposure and aggregation off.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::algebra::Metadata;

/// Annotation names understood by the planner and the executor
pub mod annotation {
    pub const FEDERATE: &str = "federate";
    pub const SKIP: &str = "skip";
    pub const VARIABLE: &str = "variable";
    pub const SERVER: &str = "server";
    pub const SPARQL: &str = "sparql";
    pub const PARALLEL: &str = "parallel";
    pub const SEQUENTIAL: &str = "sequential";
    pub const SLICE: &str = "slice";
    pub const BINDING: &str = "binding";
    pub const BIND: &str = "bind";
    pub const TRAP: &str = "trap";
    pub const LIMIT: &str = "limit";
    pub const TIMEOUT: &str = "timeout";
    pub const FED_BGP: &str = "fedbgp";
    pub const FED_JOIN: &str = "fedjoin";
    pub const FED_PARTITION: &str = "fedpartition";
    pub const FED_COMPLETE: &str = "fedcomplete";
    pub const FED_OPTIONAL: &str = "fedoptional";
    pub const GRAPH: &str = "graph";
    pub const TRACE: &str = "trace";
    pub const DEBUG: &str = "debug";

    /// Values of `@binding`
    pub const VALUES: &str = "values";
    pub const FILTER: &str = "filter";
    /// Value of `@graph` selecting FROM sub-selects for named graphs
    pub const FROM: &str = "from";
}

/// Named boolean switches controlling optional planning behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationOptions {
    /// Run source selection (otherwise every fragment is sent everywhere)
    pub select: bool,
    /// Join-aware pruning of candidate lists with pairwise existence probes
    pub select_join: bool,
    /// Group fragments with identical candidate lists
    pub group: bool,
    /// Factor binary constructs whose operands share one endpoint list
    pub simplify: bool,
    /// Rewrite EXISTS filters and merge their same-endpoint services
    pub exist: bool,
    /// Evaluate a named graph pattern once per declared named graph
    pub distribute_named: bool,
    /// Partition named-graph bodies like a top-level basic pattern
    pub federate_bgp: bool,
    /// Emit a union of complete-component services when a common endpoint exists
    pub partition: bool,
    /// Grow joint-satisfiable groups from join probe results
    pub use_join: bool,
    /// Fall back to one service per fragment per candidate endpoint
    pub complete: bool,
    /// Merge an optional operand into the preceding service when possible
    pub merge_optional: bool,
    /// Expose endpoint URIs through `VALUES ?serv {..}` bindings
    pub variable: bool,
    /// Synthesize GROUP BY over exposed endpoint variables with a count
    pub aggregate: bool,
    /// Wrap the whole body into one service over the federation
    pub sparql: bool,
    /// Wrap named-graph service bodies as FROM sub-selects instead of GRAPH
    pub named_graph_as_from: bool,
    /// Log the rewritten tree
    pub trace: bool,
}

impl Default for FederationOptions {
    fn default() -> Self {
        Self {
            select: true,
            select_join: true,
            group: true,
            simplify: true,
            exist: true,
            distribute_named: true,
            federate_bgp: true,
            partition: true,
            use_join: true,
            complete: false,
            merge_optional: true,
            variable: false,
            aggregate: false,
            sparql: false,
            named_graph_as_from: false,
            trace: false,
        }
    }
}

impl FederationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply query annotations on top of these options
    pub fn with_metadata(mut self, metadata: &Metadata) -> Self {
        for switch in metadata.values(annotation::SKIP) {
            match switch.as_str() {
                "select" => self.select = false,
                "select_join" => self.select_join = false,
                "group" => self.group = false,
                "simplify" => self.simplify = false,
                "exist" => self.exist = false,
                "distribute_named" => self.distribute_named = false,
                other => warn!("Unknown federation switch in @skip: {}", other),
            }
        }
        if metadata.has(annotation::VARIABLE) {
            self.variable = true;
        }
        if metadata.has(annotation::SERVER) {
            self.variable = true;
            self.aggregate = true;
        }
        if metadata.has(annotation::SPARQL) {
            self.sparql = true;
        }
        if metadata.has(annotation::TRACE) || metadata.has(annotation::DEBUG) {
            self.trace = true;
        }
        if metadata.has_value(annotation::GRAPH, annotation::FROM) {
            self.named_graph_as_from = true;
        }
        self.federate_bgp = flag(metadata, annotation::FED_BGP, self.federate_bgp);
        self.use_join = flag(metadata, annotation::FED_JOIN, self.use_join);
        self.partition = flag(metadata, annotation::FED_PARTITION, self.partition);
        self.complete = flag(metadata, annotation::FED_COMPLETE, self.complete);
        self.merge_optional = flag(metadata, annotation::FED_OPTIONAL, self.merge_optional);
        self
    }

    /// Default options with query annotations applied
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self::default().with_metadata(metadata)
    }
}

fn flag(metadata: &Metadata, name: &str, current: bool) -> bool {
    match metadata.value(name) {
        Some(value) => match value.parse::<bool>() {
            Ok(b) => b,
            Err(_) => {
                warn!("Ignoring non-boolean value {} for @{}", value, name);
                current
            }
        },
        None if metadata.has(name) => true,
        None => current,
    }
}

/// How bindings are propagated into outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BindingMode {
    /// VALUES unless the endpoint speaks a legacy protocol version
    #[default]
    Auto,
    /// Always VALUES
    Values,
    /// Always FILTER
    Filter,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Default batch size when slicing is requested without a size
    pub default_slice: usize,
    /// Dispatch endpoints concurrently even without `@parallel`
    pub parallel: bool,
    /// Treat malformed payloads as empty results
    pub trap_parse_errors: bool,
    pub accept: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("oxirs-fedquery/{}", env!("CARGO_PKG_VERSION")),
            default_slice: 20,
            parallel: false,
            trap_parse_errors: false,
            accept: "application/sparql-results+xml, application/sparql-results+json;q=0.9, application/rdf+xml;q=0.8".to_string(),
        }
    }
}

/// Per-query execution settings derived from annotations and [`ExecutorConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub parallel: bool,
    /// Batch size; `None` sends the whole binding set at once
    pub slice: Option<usize>,
    pub binding_mode: BindingMode,
    /// Do not propagate bindings at all
    pub skip_bindings: bool,
    pub trap: bool,
    pub timeout: Duration,
    /// Upper bound on the inner limit of every outbound request
    pub service_limit: Option<usize>,
}

impl ExecutionOptions {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            parallel: config.parallel,
            slice: None,
            binding_mode: BindingMode::Auto,
            skip_bindings: false,
            trap: config.trap_parse_errors,
            timeout: config.request_timeout,
            service_limit: None,
        }
    }

    /// Read execution annotations of the enclosing query
    pub fn from_metadata(metadata: &Metadata, config: &ExecutorConfig) -> Self {
        let mut options = Self::from_config(config);
        if metadata.has(annotation::PARALLEL) {
            options.parallel = true;
        }
        if metadata.has(annotation::SEQUENTIAL) {
            options.parallel = false;
        }
        if metadata.has(annotation::SLICE) {
            let size = metadata
                .value(annotation::SLICE)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(config.default_slice);
            options.slice = Some(size);
        }
        options.binding_mode = match metadata.value(annotation::BINDING) {
            Some(annotation::VALUES) => BindingMode::Values,
            Some(annotation::FILTER) => BindingMode::Filter,
            _ => BindingMode::Auto,
        };
        if metadata.has_value(annotation::BIND, annotation::SKIP) {
            options.skip_bindings = true;
        }
        // federated sub-queries always trap malformed payloads
        if metadata.has(annotation::TRAP) || metadata.has(annotation::FEDERATE) {
            options.trap = true;
        }
        if let Some(ms) = metadata
            .value(annotation::TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
        {
            options.timeout = Duration::from_millis(ms);
        }
        options.service_limit = metadata
            .value(annotation::LIMIT)
            .and_then(|v| v.parse::<usize>().ok());
        options
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}
