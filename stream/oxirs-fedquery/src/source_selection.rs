//! # Source Selection
//!
//! Computes, for every predicate of a query, the list of endpoints able to
//! answer it. The result is an immutable [`EndpointIndex`] built once per
//! query and consulted throughout rewriting, so a predicate is never
//! re-selected.
//!
//! Two index sources are supported: a statically configured predicate
//! registry, and live probing where each endpoint receives one lightweight
//! query testing predicate presence (and, optionally, joint satisfiability of
//! fragment pairs sharing a variable).

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::algebra::{
    Expression, Fragment, GraphPattern, Iri, Query, Term, TriplePattern,
};
use crate::config::FederationOptions;
use crate::error::{FederationError, Result};
use crate::service_client::ServiceRouter;

/// Ordered set of endpoints able to answer a fragment.
///
/// Equality is set equality: order only matters for the order in which
/// services are emitted and endpoints are contacted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateList(Vec<Iri>);

impl CandidateList {
    pub fn new(endpoints: Vec<Iri>) -> Self {
        let mut list = CandidateList(Vec::with_capacity(endpoints.len()));
        for endpoint in endpoints {
            list.push(endpoint);
        }
        list
    }

    pub fn push(&mut self, endpoint: Iri) {
        if !self.0.contains(&endpoint) {
            self.0.push(endpoint);
        }
    }

    pub fn endpoints(&self) -> &[Iri] {
        &self.0
    }

    pub fn into_endpoints(self) -> Vec<Iri> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, endpoint: &Iri) -> bool {
        self.0.contains(endpoint)
    }

    /// Order-independent key usable for bucketing
    pub fn key(&self) -> Vec<String> {
        let mut key: Vec<String> = self.0.iter().map(|i| i.0.clone()).collect();
        key.sort();
        key
    }

    /// Endpoints of `self` also in `other`, in `self` order
    pub fn intersection(&self, other: &CandidateList) -> CandidateList {
        CandidateList(
            self.0
                .iter()
                .filter(|e| other.contains(e))
                .cloned()
                .collect(),
        )
    }

    pub fn union(&self, other: &CandidateList) -> CandidateList {
        let mut out = self.clone();
        for e in &other.0 {
            out.push(e.clone());
        }
        out
    }
}

impl PartialEq for CandidateList {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().all(|e| other.contains(e))
    }
}

impl Eq for CandidateList {}

/// Statically configured endpoint → predicate registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredicateRegistry {
    endpoints: BTreeMap<String, BTreeSet<String>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `endpoint` answers `predicates`
    pub fn register(&mut self, endpoint: Iri, predicates: impl IntoIterator<Item = Iri>) {
        self.endpoints
            .entry(endpoint.0)
            .or_default()
            .extend(predicates.into_iter().map(|p| p.0));
    }

    pub fn with_endpoint(mut self, endpoint: &str, predicates: &[&str]) -> Self {
        self.register(Iri::new(endpoint), predicates.iter().map(|p| Iri::new(*p)));
        self
    }

    pub fn answers(&self, endpoint: &Iri, predicate: &Iri) -> bool {
        self.endpoints
            .get(endpoint.as_str())
            .map(|set| set.contains(predicate.as_str()))
            .unwrap_or(false)
    }

    pub fn knows(&self, endpoint: &Iri) -> bool {
        self.endpoints.contains_key(endpoint.as_str())
    }
}

/// Immutable predicate → candidate-list index for one query
#[derive(Debug, Clone, Default)]
pub struct EndpointIndex {
    federation: CandidateList,
    predicates: HashMap<Iri, CandidateList>,
    joins: HashMap<String, CandidateList>,
    selection_enabled: bool,
}

impl EndpointIndex {
    /// Index that sends every fragment to the whole federation
    pub fn unselective(federation: Vec<Iri>) -> Self {
        Self {
            federation: CandidateList::new(federation),
            predicates: HashMap::new(),
            joins: HashMap::new(),
            selection_enabled: false,
        }
    }

    pub fn federation(&self) -> &CandidateList {
        &self.federation
    }

    pub fn is_selective(&self) -> bool {
        self.selection_enabled
    }

    /// Candidate list recorded for a predicate
    pub fn predicate_candidates(&self, predicate: &Iri) -> Option<&CandidateList> {
        self.predicates.get(predicate)
    }

    /// Candidate list of a fragment; `None` when it is undefined
    pub fn candidates(&self, fragment: &Fragment) -> Option<CandidateList> {
        if !self.selection_enabled {
            return Some(self.federation.clone());
        }
        let list = match fragment {
            Fragment::Triple(TriplePattern { predicate, .. }) => match predicate {
                Term::Iri(iri) => self.predicates.get(iri).cloned().unwrap_or_default(),
                _ => self.federation.clone(),
            },
            Fragment::Path(path) => {
                let mut list = CandidateList::default();
                for predicate in path.path.predicates() {
                    if let Some(found) = self.predicates.get(predicate) {
                        list = list.union(found);
                    }
                }
                // keep federation order
                self.federation.intersection(&list)
            }
        };
        if list.is_empty() {
            None
        } else {
            Some(list)
        }
    }

    /// Endpoints where both fragments are jointly satisfiable, when probed
    pub fn join_candidates(&self, a: &Fragment, b: &Fragment) -> Option<&CandidateList> {
        self.joins.get(&join_key(a, b))
    }

    pub fn has_join_results(&self) -> bool {
        !self.joins.is_empty()
    }
}

fn join_key(a: &Fragment, b: &Fragment) -> String {
    let (x, y) = (a.to_string(), b.to_string());
    if x <= y {
        format!("{} . {}", x, y)
    } else {
        format!("{} . {}", y, x)
    }
}

/// Where the selector gets predicate membership from
#[derive(Clone)]
pub enum SelectionMode {
    Static(PredicateRegistry),
    Probe(Arc<ServiceRouter>),
}

/// Builds an [`EndpointIndex`] for a query over a federation
#[derive(Clone)]
pub struct SourceSelector {
    mode: SelectionMode,
    probe_timeout: Duration,
}

impl SourceSelector {
    pub fn with_registry(registry: PredicateRegistry) -> Self {
        Self {
            mode: SelectionMode::Static(registry),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probing(router: Arc<ServiceRouter>) -> Self {
        Self {
            mode: SelectionMode::Probe(router),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Build the endpoint index for `query`.
    ///
    /// Fails with [`FederationError::SelectionFailed`] when the federation is
    /// empty or when no endpoint could be probed at all.
    #[instrument(skip_all, fields(endpoints = federation.len()))]
    pub async fn build_index(
        &self,
        federation: &[Iri],
        query: &Query,
        options: &FederationOptions,
    ) -> Result<EndpointIndex> {
        if federation.is_empty() {
            return Err(FederationError::SelectionFailed(
                "federation has no endpoints".to_string(),
            ));
        }
        if !options.select {
            return Ok(EndpointIndex::unselective(federation.to_vec()));
        }

        let fragments = query_fragments(query);
        let predicates = constant_predicates(&fragments);
        let pairs = if options.select_join {
            join_pairs(&fragments)
        } else {
            Vec::new()
        };

        let index = match &self.mode {
            SelectionMode::Static(registry) => static_index(registry, federation, &predicates),
            SelectionMode::Probe(router) => {
                self.probe_index(router, federation, &predicates, &pairs)
                    .await?
            }
        };
        info!(
            "Source selection indexed {} predicates and {} join pairs",
            index.predicates.len(),
            index.joins.len()
        );
        Ok(index)
    }

    async fn probe_index(
        &self,
        router: &ServiceRouter,
        federation: &[Iri],
        predicates: &[Iri],
        pairs: &[(Fragment, Fragment)],
    ) -> Result<EndpointIndex> {
        let probe = probe_query(predicates, pairs);
        debug!("Probe query: {}", probe);

        let futures = federation
            .iter()
            .map(|endpoint| router.send(endpoint, &probe, self.probe_timeout));
        let responses = join_all(futures).await;

        let mut index = EndpointIndex {
            federation: CandidateList::new(federation.to_vec()),
            predicates: HashMap::new(),
            joins: HashMap::new(),
            selection_enabled: true,
        };
        let mut answered = 0;
        for (endpoint, response) in federation.iter().zip(responses) {
            let bindings = match response {
                Ok(bindings) => bindings,
                Err(e) => {
                    warn!("Source selection probe failed for {}: {}", endpoint.as_str(), e);
                    continue;
                }
            };
            answered += 1;
            let Some(row) = bindings.first() else {
                continue;
            };
            let holds = |var: &str| {
                row.get(var)
                    .and_then(|t| match t {
                        Term::Literal(lit) => lit.as_bool(),
                        _ => None,
                    })
                    .unwrap_or(false)
            };
            for (i, predicate) in predicates.iter().enumerate() {
                if holds(&predicate_var(i)) {
                    index
                        .predicates
                        .entry(predicate.clone())
                        .or_default()
                        .push(endpoint.clone());
                }
            }
            for (i, (a, b)) in pairs.iter().enumerate() {
                let entry = index.joins.entry(join_key(a, b)).or_default();
                if holds(&join_var(i)) {
                    entry.push(endpoint.clone());
                }
            }
        }

        if answered == 0 {
            return Err(FederationError::SelectionFailed(
                "no endpoint answered the selection probe".to_string(),
            ));
        }
        Ok(index)
    }
}

/// Endpoints absent from the registry are candidates for every predicate
fn static_index(registry: &PredicateRegistry, federation: &[Iri], predicates: &[Iri]) -> EndpointIndex {
    let mut index = EndpointIndex {
        federation: CandidateList::new(federation.to_vec()),
        predicates: HashMap::new(),
        joins: HashMap::new(),
        selection_enabled: true,
    };
    for predicate in predicates {
        let list = CandidateList::new(
            federation
                .iter()
                .filter(|e| !registry.knows(e) || registry.answers(e, predicate))
                .cloned()
                .collect(),
        );
        index.predicates.insert(predicate.clone(), list);
    }
    index
}

fn predicate_var(i: usize) -> String {
    format!("_p{}", i)
}

fn join_var(i: usize) -> String {
    format!("_j{}", i)
}

/// `SELECT * WHERE { BIND(EXISTS {..} AS ?_p0) ... }`
fn probe_query(predicates: &[Iri], pairs: &[(Fragment, Fragment)]) -> Query {
    let mut elements = Vec::with_capacity(predicates.len() + pairs.len());
    for (i, predicate) in predicates.iter().enumerate() {
        let test = GraphPattern::group(vec![GraphPattern::triple(
            Term::var("s"),
            Term::Iri(predicate.clone()),
            Term::var("o"),
        )]);
        elements.push(GraphPattern::Bind {
            expression: Expression::Exists(Box::new(test)),
            variable: predicate_var(i),
        });
    }
    for (i, (a, b)) in pairs.iter().enumerate() {
        let test = GraphPattern::group(vec![
            GraphPattern::Pattern(a.clone()),
            GraphPattern::Pattern(b.clone()),
        ]);
        elements.push(GraphPattern::Bind {
            expression: Expression::Exists(Box::new(test)),
            variable: join_var(i),
        });
    }
    Query::select_all(GraphPattern::group(elements))
}

fn query_fragments(query: &Query) -> Vec<Fragment> {
    let mut fragments: Vec<Fragment> = query.pattern.fragments().into_iter().cloned().collect();
    let mut modifiers = query.clone();
    for expr in modifiers.modifier_expressions_mut() {
        for pattern in expr.exists_patterns_mut() {
            fragments.extend(pattern.fragments().into_iter().cloned());
        }
    }
    fragments
}

/// Distinct constant predicates, in first-occurrence order
fn constant_predicates(fragments: &[Fragment]) -> Vec<Iri> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for fragment in fragments {
        let found: Vec<&Iri> = match fragment {
            Fragment::Triple(t) => t.predicate.as_iri().into_iter().collect(),
            Fragment::Path(p) => p.path.predicates(),
        };
        for iri in found {
            if seen.insert(iri.clone()) {
                out.push(iri.clone());
            }
        }
    }
    out
}

/// Distinct pairs of constant-predicate triples sharing a variable
fn join_pairs(fragments: &[Fragment]) -> Vec<(Fragment, Fragment)> {
    let triples: Vec<&Fragment> = fragments
        .iter()
        .filter(|f| matches!(f, Fragment::Triple(t) if t.predicate.as_iri().is_some()))
        .collect();
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for (i, a) in triples.iter().enumerate() {
        for b in &triples[i + 1..] {
            if a != b && a.shares_variable(b) && seen.insert(join_key(a, b)) {
                pairs.push(((*a).clone(), (*b).clone()));
            }
        }
    }
    pairs
}
