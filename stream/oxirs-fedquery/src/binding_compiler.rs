//! Binding compiler
//!
//! Builds the outbound query for one endpoint: a copy of the service body
//! with the incoming bindings inserted as its first element, either as a
//! `VALUES` table or as a `FILTER` disjunction. The service itself is never
//! modified.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::trace;

use crate::algebra::{
    is_unconstrained, Binding, BinaryOperator, Environment, Expression, GraphPattern, Iri, Query,
    ServicePattern, Term, UnaryOperator, ValuesTable, Variable,
};
use crate::config::BindingMode;

/// SPARQL protocol level spoken by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// No VALUES support
    Sparql10,
    #[default]
    Sparql11,
}

/// Source of per-endpoint protocol versions
pub trait ProtocolVersionStrategy: Send + Sync {
    fn version(&self, endpoint: &Iri) -> ProtocolVersion;
}

/// Configured endpoint versions; unknown endpoints speak SPARQL 1.1
#[derive(Debug, Default)]
pub struct StaticProtocolVersions {
    versions: DashMap<String, ProtocolVersion>,
}

impl StaticProtocolVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, endpoint: impl Into<String>, version: ProtocolVersion) {
        self.versions.insert(endpoint.into(), version);
    }
}

impl ProtocolVersionStrategy for StaticProtocolVersions {
    fn version(&self, endpoint: &Iri) -> ProtocolVersion {
        self.versions
            .get(endpoint.as_str())
            .map(|v| *v.value())
            .unwrap_or_default()
    }
}

/// Outbound query for one endpoint and one slice
#[derive(Debug, Clone)]
pub struct CompiledRequest {
    pub query: Query,
    /// True when a binding constraint was inserted
    pub constrained: bool,
}

/// Compiles services against binding sets
pub struct BindingCompiler<'a> {
    mode: BindingMode,
    versions: &'a dyn ProtocolVersionStrategy,
    service_limit: Option<usize>,
}

impl<'a> BindingCompiler<'a> {
    pub fn new(mode: BindingMode, versions: &'a dyn ProtocolVersionStrategy) -> Self {
        Self {
            mode,
            versions,
            service_limit: None,
        }
    }

    /// Cap the inner limit of every compiled request
    pub fn with_service_limit(mut self, limit: Option<usize>) -> Self {
        self.service_limit = limit;
        self
    }

    /// Build the request sent to `endpoint` for `bindings`, falling back to
    /// `env` when the binding set carries no constraint
    pub fn compile(
        &self,
        endpoint: &Iri,
        service: &ServicePattern,
        bindings: Option<&[Binding]>,
        env: &Environment,
    ) -> CompiledRequest {
        let mut query = (*service.body).clone();
        if let Some(cap) = self.service_limit {
            query.limit = Some(query.limit.map_or(cap, |inner| inner.min(cap)));
        }

        if query.has_values() {
            return CompiledRequest {
                query,
                constrained: false,
            };
        }

        let from_env;
        let rows: &[Binding] = if is_unconstrained(bindings) {
            from_env = [env.clone()];
            &from_env
        } else {
            bindings.unwrap_or_default()
        };

        let referenced = query.pattern.variables();
        let variables: Vec<Variable> = rows
            .iter()
            .flat_map(|b| b.keys())
            .filter(|v| referenced.contains(*v))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if variables.is_empty() {
            return CompiledRequest {
                query,
                constrained: false,
            };
        }

        let use_filter = match self.mode {
            BindingMode::Values => false,
            BindingMode::Filter => true,
            BindingMode::Auto => self.versions.version(endpoint) == ProtocolVersion::Sparql10,
        };
        let constraint = if use_filter {
            filter_constraint(&variables, rows)
        } else {
            Some(values_constraint(variables, rows))
        };

        match constraint {
            Some(element) => {
                trace!("Constraint for {}: {}", endpoint.as_str(), element);
                query.pattern.elements_mut().insert(0, element);
                CompiledRequest {
                    query,
                    constrained: true,
                }
            }
            None => CompiledRequest {
                query,
                constrained: false,
            },
        }
    }
}

/// Constant term safe to send to another endpoint
fn remote_term(term: &Term) -> Option<Term> {
    match term {
        Term::BlankNode(_) | Term::Variable(_) => None,
        Term::Iri(iri) if iri.as_str().contains(' ') => {
            Some(Term::Iri(Iri::new(iri.as_str().replace(' ', "%20"))))
        }
        other => Some(other.clone()),
    }
}

fn values_constraint(variables: Vec<Variable>, rows: &[Binding]) -> GraphPattern {
    let mut table = ValuesTable::new(variables);
    let mut seen = HashSet::new();
    for binding in rows {
        let row: Vec<Option<Term>> = table
            .variables
            .iter()
            .map(|v| binding.get(v).and_then(remote_term))
            .collect();
        if seen.insert(row.clone()) {
            table.rows.push(row);
        }
    }
    GraphPattern::Values(table)
}

/// `(?x = a && ?y = b) || (...)`; `None` when some binding leaves every
/// variable unconstrained
fn filter_constraint(variables: &[Variable], rows: &[Binding]) -> Option<GraphPattern> {
    let mut seen = HashSet::new();
    let mut disjuncts = Vec::new();
    for binding in rows {
        let mut tests = Vec::new();
        for var in variables {
            match binding.get(var) {
                Some(Term::BlankNode(_)) => tests.push(Expression::unary(
                    UnaryOperator::IsBlank,
                    Expression::var(var.clone()),
                )),
                Some(term) => {
                    if let Some(value) = remote_term(term) {
                        tests.push(Expression::equal_term(var, &value));
                    }
                }
                None => {}
            }
        }
        let conjunction = Expression::fold(BinaryOperator::And, tests)?;
        if seen.insert(conjunction.to_string()) {
            disjuncts.push(conjunction);
        }
    }
    Expression::fold(BinaryOperator::Or, disjuncts).map(GraphPattern::Filter)
}
