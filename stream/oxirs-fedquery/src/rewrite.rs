//! # Federation Planner
//!
//! Rewrites a query tree into a tree whose leaves are endpoint-scoped
//! services. Basic patterns are handed to the [`Partitioner`]; every other
//! construct is rebuilt bottom-up, after which filters and binds are moved
//! into the services that bind all of their variables.
//!
//! The planner consumes itself: a tree is rewritten exactly once, so the
//! relocation and merge passes never see their own output.

use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::algebra::{
    Aggregate, Expression, Fragment, GraphPattern, Iri, Query, ServiceEndpoints, ServicePattern,
    Term, ValuesTable, Variable,
};
use crate::config::FederationOptions;
use crate::partition::{FreshVariables, Partitioner};
use crate::source_selection::EndpointIndex;

/// Prefix of variables exposing endpoint identities
pub const SERVER_VARIABLE: &str = "_server";

/// Name of the count projected in aggregation mode
pub const COUNT_VARIABLE: &str = "count";

/// Recursive query rewriter for one query
pub struct FederationPlanner<'a> {
    index: &'a EndpointIndex,
    options: FederationOptions,
    fresh: FreshVariables,
    default_graphs: Vec<Iri>,
    named_graphs: Vec<Iri>,
    exposed: Vec<Variable>,
}

impl<'a> FederationPlanner<'a> {
    pub fn new(index: &'a EndpointIndex, options: FederationOptions) -> Self {
        Self {
            index,
            options,
            fresh: FreshVariables::new(),
            default_graphs: Vec::new(),
            named_graphs: Vec::new(),
            exposed: Vec::new(),
        }
    }

    /// Rewrite `query` into its federated form
    #[instrument(skip_all)]
    pub fn rewrite(mut self, mut query: Query) -> Query {
        prepare_values(&mut query);
        self.default_graphs = std::mem::take(&mut query.dataset.default_graphs);
        self.named_graphs = query.dataset.named_graphs.clone();

        if self.options.sparql {
            let body = std::mem::take(&mut query.pattern);
            let mut service = ServicePattern {
                endpoints: self.federation_endpoints(),
                body: Box::new(Query::select_all(body)),
                silent: false,
            };
            service.body.dataset.default_graphs = self.default_graphs.clone();
            query.pattern = GraphPattern::Group(vec![GraphPattern::Service(service)]);
        } else {
            let pattern = std::mem::take(&mut query.pattern);
            query.pattern = into_group(self.rewrite_pattern(pattern));
            self.rewrite_modifiers(&mut query);
        }

        push_limit(&mut query);

        if self.options.variable {
            let pattern = std::mem::take(&mut query.pattern);
            query.pattern = self.expose(pattern).into_iter().next().unwrap_or_default();
            if self.options.aggregate && !self.exposed.is_empty() {
                query.projection = self.exposed.clone();
                query.group_by = self.exposed.clone();
                query.aggregates = vec![(
                    COUNT_VARIABLE.to_string(),
                    Aggregate::Count {
                        distinct: false,
                        expr: None,
                    },
                )];
            }
        }

        let services = query.pattern.services().len();
        if self.options.trace {
            info!("Federated query ({} services):\n{}", services, query);
        } else {
            debug!("Rewrote query into {} services", services);
        }
        query
    }

    fn federation_endpoints(&self) -> ServiceEndpoints {
        ServiceEndpoints::Endpoints(self.index.federation().endpoints().to_vec())
    }

    fn rewrite_pattern(&mut self, pattern: GraphPattern) -> GraphPattern {
        match pattern {
            GraphPattern::Group(elements) => GraphPattern::Group(self.rewrite_group(elements)),
            GraphPattern::Pattern(_) | GraphPattern::Filter(_) | GraphPattern::Bind { .. } => {
                GraphPattern::Group(self.rewrite_group(vec![pattern]))
            }
            GraphPattern::Optional { left, right } => {
                let left = self.rewrite_pattern(*left);
                let right = self.rewrite_pattern(*right);
                self.simplify_binary(BinaryKind::Optional, left, right)
            }
            GraphPattern::Minus { left, right } => {
                let left = self.rewrite_pattern(*left);
                let right = self.rewrite_pattern(*right);
                self.simplify_binary(BinaryKind::Minus, left, right)
            }
            GraphPattern::Union { left, right } => {
                let left = self.rewrite_pattern(*left);
                let right = self.rewrite_pattern(*right);
                self.simplify_binary(BinaryKind::Union, left, right)
            }
            GraphPattern::Graph { name, pattern } => self.rewrite_graph(name, *pattern),
            GraphPattern::Subquery(query) => {
                GraphPattern::Subquery(Box::new(self.rewrite_subquery(*query)))
            }
            GraphPattern::Values(_) | GraphPattern::Service(_) => pattern,
        }
    }

    fn rewrite_subquery(&mut self, mut query: Query) -> Query {
        let pattern = std::mem::take(&mut query.pattern);
        query.pattern = into_group(self.rewrite_pattern(pattern));
        self.rewrite_modifiers(&mut query);
        push_limit(&mut query);
        query
    }

    /// EXISTS inside HAVING / ORDER BY
    fn rewrite_modifiers(&mut self, query: &mut Query) {
        if !self.options.exist {
            return;
        }
        for expr in query.modifier_expressions_mut() {
            for pattern in expr.exists_patterns_mut() {
                let inner = std::mem::take(pattern);
                *pattern = self.rewrite_exists(inner);
            }
        }
    }

    fn rewrite_group(&mut self, elements: Vec<GraphPattern>) -> Vec<GraphPattern> {
        let mut rebuilt = Vec::with_capacity(elements.len());
        let mut run: Vec<Fragment> = Vec::new();
        let mut filters: Vec<Expression> = Vec::new();

        for element in elements {
            match element {
                GraphPattern::Pattern(fragment) => run.push(fragment),
                GraphPattern::Filter(expr) => filters.push(expr),
                other => {
                    self.flush_run(&mut run, &mut rebuilt);
                    match other {
                        GraphPattern::Bind { .. } | GraphPattern::Values(_) => rebuilt.push(other),
                        other => rebuilt.push(self.rewrite_pattern(other)),
                    }
                }
            }
        }
        self.flush_run(&mut run, &mut rebuilt);

        let mut out = self.relocate_binds(rebuilt);
        self.relocate_filters(filters, &mut out);
        out
    }

    fn flush_run(&mut self, run: &mut Vec<Fragment>, rebuilt: &mut Vec<GraphPattern>) {
        if run.is_empty() {
            return;
        }
        let fragments = std::mem::take(run);
        let partitioner = Partitioner::new(self.index, &self.options);
        for mut unit in partitioner.partition(fragments, &mut self.fresh) {
            if !self.default_graphs.is_empty() {
                for service in scoped_services_mut(&mut unit, None) {
                    service.body.dataset.default_graphs = self.default_graphs.clone();
                }
            }
            rebuilt.push(unit);
        }
    }

    fn relocate_binds(&mut self, rebuilt: Vec<GraphPattern>) -> Vec<GraphPattern> {
        let mut out: Vec<GraphPattern> = Vec::with_capacity(rebuilt.len());
        for element in rebuilt {
            match element {
                GraphPattern::Bind {
                    mut expression,
                    variable,
                } => {
                    if expression.contains_exists() {
                        if self.options.exist {
                            expression = self.rewrite_expression(expression);
                        }
                        out.push(GraphPattern::Bind {
                            expression,
                            variable,
                        });
                        continue;
                    }
                    let vars = expression.free_variables();
                    match out.iter().rposition(|e| covers(e, &vars)) {
                        Some(k) => {
                            trace_move("bind", &out[k]);
                            if let GraphPattern::Service(service) = &mut out[k] {
                                service.elements_mut().push(GraphPattern::Bind {
                                    expression,
                                    variable,
                                });
                            }
                        }
                        None => out.push(GraphPattern::Bind {
                            expression,
                            variable,
                        }),
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    fn relocate_filters(&mut self, filters: Vec<Expression>, out: &mut Vec<GraphPattern>) {
        let mut remaining = Vec::new();
        for expr in filters {
            if expr.contains_exists() {
                if !self.options.exist {
                    remaining.push(expr);
                    continue;
                }
                let expr = self.rewrite_expression(expr);
                if !move_exists_into_service(&expr, out) {
                    remaining.push(expr);
                }
                continue;
            }
            let vars = expr.free_variables();
            match out.iter().position(|e| covers(e, &vars)) {
                Some(k) => {
                    trace_move("filter", &out[k]);
                    if let GraphPattern::Service(service) = &mut out[k] {
                        service.elements_mut().push(GraphPattern::Filter(expr));
                    }
                }
                None => remaining.push(expr),
            }
        }
        out.extend(remaining.into_iter().map(GraphPattern::Filter));
    }

    fn rewrite_expression(&mut self, mut expr: Expression) -> Expression {
        for pattern in expr.exists_patterns_mut() {
            let inner = std::mem::take(pattern);
            *pattern = self.rewrite_exists(inner);
        }
        expr
    }

    /// Rewrite an EXISTS pattern and merge its same-endpoint services
    fn rewrite_exists(&mut self, pattern: GraphPattern) -> GraphPattern {
        match self.rewrite_pattern(pattern) {
            GraphPattern::Group(elements) => GraphPattern::Group(merge_services(elements)),
            other => other,
        }
    }

    fn simplify_binary(&mut self, kind: BinaryKind, left: GraphPattern, right: GraphPattern) -> GraphPattern {
        if self.options.simplify {
            if let (Some(l), Some(r)) = (single_service(&left), single_service(&right)) {
                if l.endpoints.same_endpoints(&r.endpoints)
                    && l.endpoints.as_variable().is_none()
                    && l.body.is_plain()
                    && r.body.is_plain()
                {
                    debug!("Factoring {:?} into one service over {}", kind, l.endpoints);
                    let endpoints = l.endpoints.clone();
                    let inner = kind.build(l.body.pattern.clone(), r.body.pattern.clone());
                    return GraphPattern::Service(ServicePattern::new(endpoints, vec![inner]));
                }
            }
            if kind == BinaryKind::Optional && self.options.merge_optional {
                if let Some(merged) = merge_optional_into_left(&left, &right) {
                    return merged;
                }
            }
        }
        kind.build(left, right)
    }

    fn rewrite_graph(&mut self, name: Term, pattern: GraphPattern) -> GraphPattern {
        if self.options.federate_bgp {
            let mut rewritten = self.rewrite_pattern(pattern);
            let as_from = match (&name, self.options.named_graph_as_from) {
                (Term::Iri(iri), true) => Some(iri.clone()),
                _ => None,
            };
            let graph_var = name.as_variable().cloned();
            for service in scoped_services_mut(&mut rewritten, graph_var.as_ref()) {
                match &as_from {
                    Some(iri) => service.body.dataset.default_graphs = vec![iri.clone()],
                    None => {
                        let body = std::mem::take(&mut service.body.pattern);
                        service.body.pattern =
                            GraphPattern::Group(vec![GraphPattern::graph(name.clone(), body)]);
                    }
                }
            }
            return rewritten;
        }

        if let (Term::Variable(var), true) = (&name, self.options.distribute_named) {
            if !self.named_graphs.is_empty() {
                let branches = self.named_graphs.clone().into_iter().map(|graph| {
                    let service = ServicePattern::new(
                        self.federation_endpoints(),
                        vec![GraphPattern::graph(Term::Iri(graph.clone()), pattern.clone())],
                    );
                    GraphPattern::Group(vec![
                        GraphPattern::Service(service),
                        GraphPattern::Bind {
                            expression: Expression::Iri(graph),
                            variable: var.clone(),
                        },
                    ])
                });
                let branches: Vec<GraphPattern> = branches.collect();
                if let Some(union) = branches.into_iter().reduce(GraphPattern::union) {
                    return union;
                }
            }
        }

        GraphPattern::Service(ServicePattern::new(
            self.federation_endpoints(),
            vec![GraphPattern::graph(name, pattern)],
        ))
    }

    /// `Service(<uri>){B}` into `VALUES ?s {<uri>} . Service ?s {B}`
    fn expose(&mut self, pattern: GraphPattern) -> Vec<GraphPattern> {
        match pattern {
            GraphPattern::Service(mut service) => match &service.endpoints {
                ServiceEndpoints::Endpoints(endpoints) => {
                    let var = self.fresh.fresh(SERVER_VARIABLE);
                    let values = ValuesTable::single(
                        var.clone(),
                        endpoints.iter().cloned().map(Term::Iri).collect(),
                    );
                    service.endpoints = ServiceEndpoints::Variable(var.clone());
                    self.exposed.push(var);
                    vec![GraphPattern::Values(values), GraphPattern::Service(service)]
                }
                ServiceEndpoints::Variable(_) => vec![GraphPattern::Service(service)],
            },
            GraphPattern::Group(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.extend(self.expose(element));
                }
                vec![GraphPattern::Group(out)]
            }
            GraphPattern::Optional { left, right } => {
                let left = self.expose_one(*left);
                let right = self.expose_one(*right);
                vec![GraphPattern::optional(left, right)]
            }
            GraphPattern::Minus { left, right } => {
                let left = self.expose_one(*left);
                let right = self.expose_one(*right);
                vec![GraphPattern::minus(left, right)]
            }
            GraphPattern::Union { left, right } => {
                let left = self.expose_one(*left);
                let right = self.expose_one(*right);
                vec![GraphPattern::union(left, right)]
            }
            GraphPattern::Graph { name, pattern } => {
                vec![GraphPattern::graph(name, self.expose_one(*pattern))]
            }
            GraphPattern::Subquery(mut query) => {
                let before = self.exposed.len();
                let pattern = std::mem::take(&mut query.pattern);
                query.pattern = into_group(self.expose_one(pattern));
                // server variables must reach the enclosing aggregation
                for var in self.exposed[before..].iter() {
                    project_variable(&mut query, var);
                }
                vec![GraphPattern::Subquery(query)]
            }
            other => vec![other],
        }
    }

    fn expose_one(&mut self, pattern: GraphPattern) -> GraphPattern {
        let mut exposed = self.expose(pattern);
        if exposed.len() == 1 {
            exposed.remove(0)
        } else {
            GraphPattern::Group(exposed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryKind {
    Optional,
    Minus,
    Union,
}

impl BinaryKind {
    fn build(self, left: GraphPattern, right: GraphPattern) -> GraphPattern {
        match self {
            BinaryKind::Optional => GraphPattern::optional(left, right),
            BinaryKind::Minus => GraphPattern::minus(left, right),
            BinaryKind::Union => GraphPattern::union(left, right),
        }
    }
}

fn trace_move(what: &str, target: &GraphPattern) {
    if let GraphPattern::Service(service) = target {
        debug!("Moving {} into service {}", what, service.endpoints);
    }
}

fn into_group(pattern: GraphPattern) -> GraphPattern {
    match pattern {
        GraphPattern::Group(_) => pattern,
        other => GraphPattern::Group(vec![other]),
    }
}

/// Trailing query-level VALUES becomes the first body element
fn prepare_values(query: &mut Query) {
    if let Some(values) = query.values.take() {
        query.pattern.elements_mut().insert(0, GraphPattern::Values(values));
    }
}

/// Push the outer limit into a lone service when that cannot change results.
///
/// Nothing is pushed under OFFSET, DISTINCT, ORDER BY, GROUP BY or aggregates:
/// those apply after the join, so a limit inside the service would cut rows
/// they still need.
fn push_limit(query: &mut Query) {
    let Some(limit) = query.limit else {
        return;
    };
    if query.offset.is_some()
        || query.distinct
        || !query.order_by.is_empty()
        || !query.group_by.is_empty()
        || !query.aggregates.is_empty()
    {
        return;
    }
    let mut services = query
        .pattern
        .elements_mut()
        .iter_mut()
        .filter(|e| !matches!(e, GraphPattern::Values(_)));
    if let (Some(GraphPattern::Service(service)), None) = (services.next(), services.next()) {
        match service.body.limit {
            Some(inner) if inner <= limit => {}
            _ => {
                debug!("Pushing LIMIT {} into service {}", limit, service.endpoints);
                service.body.limit = Some(limit);
            }
        }
    }
}

/// Service bodies that can take extra elements without changing meaning
fn accepts_elements(body: &Query) -> bool {
    body.projection.is_empty()
        && body.aggregates.is_empty()
        && !body.distinct
        && body.group_by.is_empty()
        && body.order_by.is_empty()
        && body.limit.is_none()
        && body.offset.is_none()
        && body.values.is_none()
}

/// True if `element` is a service binding every variable of `vars`
fn covers(element: &GraphPattern, vars: &BTreeSet<Variable>) -> bool {
    match element {
        GraphPattern::Service(service) => {
            accepts_elements(&service.body) && vars.is_subset(&service.in_scope_variables())
        }
        _ => false,
    }
}

fn single_service(pattern: &GraphPattern) -> Option<&ServicePattern> {
    match pattern {
        GraphPattern::Service(service) => Some(service),
        GraphPattern::Group(elements) if elements.len() == 1 => elements[0].as_service(),
        _ => None,
    }
}

/// `{ A . S(e){B} } OPTIONAL S(e){C}` into `{ A . S(e){ B OPTIONAL C } }`
fn merge_optional_into_left(left: &GraphPattern, right: &GraphPattern) -> Option<GraphPattern> {
    let r = single_service(right)?;
    let GraphPattern::Group(elements) = left else {
        return None;
    };
    let (last, rest) = elements.split_last()?;
    let l = last.as_service()?;
    if !l.endpoints.same_endpoints(&r.endpoints)
        || l.endpoints.as_variable().is_some()
        || !l.body.is_plain()
        || !r.body.is_plain()
    {
        return None;
    }
    // variables the optional part shares with the rest of the left side
    let rest_vars: BTreeSet<Variable> = rest.iter().flat_map(|e| e.variables()).collect();
    let shared: BTreeSet<Variable> = r
        .body
        .pattern
        .variables()
        .intersection(&rest_vars)
        .cloned()
        .collect();
    if !shared.is_subset(&l.in_scope_variables()) {
        return None;
    }
    let inner = GraphPattern::optional(l.body.pattern.clone(), r.body.pattern.clone());
    let mut merged = rest.to_vec();
    merged.push(GraphPattern::Service(ServicePattern::new(
        l.endpoints.clone(),
        vec![inner],
    )));
    Some(GraphPattern::Group(merged))
}

/// Concatenate the bodies of sibling services over the same endpoints
fn merge_services(elements: Vec<GraphPattern>) -> Vec<GraphPattern> {
    let mut out: Vec<GraphPattern> = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            GraphPattern::Service(service)
                if service.endpoints.as_variable().is_none() && accepts_elements(&service.body) =>
            {
                let target = out.iter().position(|o| match o {
                    GraphPattern::Service(t) => {
                        t.endpoints.same_endpoints(&service.endpoints) && accepts_elements(&t.body)
                    }
                    _ => false,
                });
                match target {
                    Some(k) => {
                        if let GraphPattern::Service(t) = &mut out[k] {
                            t.elements_mut().extend(service.elements().iter().cloned());
                        }
                    }
                    None => out.push(GraphPattern::Service(service)),
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Move `FILTER [NOT] EXISTS { S(e){B} }` into a sibling service over `e`
/// binding every correlated variable
fn move_exists_into_service(expr: &Expression, out: &mut [GraphPattern]) -> bool {
    let (pattern, negated) = match expr {
        Expression::Exists(p) => (p.as_ref(), false),
        Expression::NotExists(p) => (p.as_ref(), true),
        _ => return false,
    };
    let Some(inner) = single_service(pattern) else {
        return false;
    };
    if inner.endpoints.as_variable().is_some() || !accepts_elements(&inner.body) {
        return false;
    }
    let outer_vars: BTreeSet<Variable> = out.iter().flat_map(|e| e.in_scope_variables()).collect();
    let correlated: BTreeSet<Variable> = pattern
        .variables()
        .intersection(&outer_vars)
        .cloned()
        .collect();
    let target = out.iter().position(|e| match e {
        GraphPattern::Service(t) => {
            t.endpoints.same_endpoints(&inner.endpoints)
                && accepts_elements(&t.body)
                && correlated.is_subset(&t.in_scope_variables())
        }
        _ => false,
    });
    let Some(k) = target else {
        return false;
    };
    let body = Box::new(inner.body.pattern.clone());
    let moved = if negated {
        Expression::NotExists(body)
    } else {
        Expression::Exists(body)
    };
    if let GraphPattern::Service(t) = &mut out[k] {
        debug!("Moving EXISTS filter into service {}", t.endpoints);
        t.elements_mut().push(GraphPattern::Filter(moved));
        return true;
    }
    false
}

/// Add `var` to an explicit subquery projection so it stays visible outside
fn project_variable(query: &mut Query, var: &Variable) {
    let explicit = !query.projection.is_empty() || !query.aggregates.is_empty();
    if explicit && !query.projection.contains(var) {
        query.projection.push(var.clone());
    }
    let grouped = !query.group_by.is_empty() || !query.aggregates.is_empty();
    if grouped && !query.group_by.contains(var) {
        query.group_by.push(var.clone());
    }
}

/// Services in the scope of `pattern` without entering another service body.
///
/// The walk reaches EXISTS patterns of filters and binds and subquery bodies.
/// When `graph_var` is set, every subquery on the way projects it.
fn scoped_services_mut<'p>(
    pattern: &'p mut GraphPattern,
    graph_var: Option<&Variable>,
) -> Vec<&'p mut ServicePattern> {
    let mut out = Vec::new();
    collect_scoped_services(pattern, graph_var, &mut out);
    out
}

fn collect_scoped_services<'p>(
    pattern: &'p mut GraphPattern,
    graph_var: Option<&Variable>,
    out: &mut Vec<&'p mut ServicePattern>,
) {
    match pattern {
        GraphPattern::Service(service) => out.push(service),
        GraphPattern::Group(elements) => {
            for element in elements {
                collect_scoped_services(element, graph_var, out);
            }
        }
        GraphPattern::Optional { left, right }
        | GraphPattern::Minus { left, right }
        | GraphPattern::Union { left, right } => {
            collect_scoped_services(left, graph_var, out);
            collect_scoped_services(right, graph_var, out);
        }
        GraphPattern::Graph { pattern, .. } => collect_scoped_services(pattern, graph_var, out),
        GraphPattern::Subquery(query) => {
            if let Some(var) = graph_var {
                project_variable(query, var);
            }
            collect_scoped_services(&mut query.pattern, graph_var, out);
        }
        GraphPattern::Filter(expr) | GraphPattern::Bind { expression: expr, .. } => {
            for inner in expr.exists_patterns_mut() {
                collect_scoped_services(inner, graph_var, out);
            }
        }
        GraphPattern::Pattern(_) | GraphPattern::Values(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{BinaryOperator, Literal, Metadata, OrderCondition};
    use crate::source_selection::{PredicateRegistry, SourceSelector};

    const E1: &str = "http://e1.example/sparql";
    const E2: &str = "http://e2.example/sparql";

    fn p(local: &str) -> String {
        format!("http://example.org/{}", local)
    }

    fn triple(s: &str, pred: &str, o: &str) -> GraphPattern {
        GraphPattern::triple(Term::var(s), Term::iri(p(pred)), Term::var(o))
    }

    fn registry() -> PredicateRegistry {
        PredicateRegistry::new()
            .with_endpoint(E1, &[&p("name"), &p("mbox"), &p("knows")])
            .with_endpoint(E2, &[&p("age"), &p("knows")])
    }

    async fn plan(query: Query, options: FederationOptions) -> Query {
        let federation = vec![Iri::new(E1), Iri::new(E2)];
        let index = SourceSelector::with_registry(registry())
            .build_index(&federation, &query, &options)
            .await
            .unwrap();
        FederationPlanner::new(&index, options).rewrite(query)
    }

    fn body_services(query: &Query) -> Vec<&ServicePattern> {
        query
            .pattern
            .elements()
            .iter()
            .filter_map(GraphPattern::as_service)
            .collect()
    }

    fn endpoint_list(service: &ServicePattern) -> Vec<&str> {
        match &service.endpoints {
            ServiceEndpoints::Endpoints(e) => e.iter().map(Iri::as_str).collect(),
            ServiceEndpoints::Variable(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_single_endpoint_fragment() {
        let query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        let out = plan(query, FederationOptions::default()).await;
        let services = body_services(&out);
        assert_eq!(services.len(), 1);
        assert_eq!(endpoint_list(services[0]), vec![E1]);
        assert!(!out.to_string().contains(E2));
    }

    #[tokio::test]
    async fn test_disjoint_fragments_joined_in_block() {
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            triple("s", "age", "a"),
        ]));
        let out = plan(query, FederationOptions::default()).await;
        let services = body_services(&out);
        assert_eq!(services.len(), 2);
        assert_eq!(endpoint_list(services[0]), vec![E1]);
        assert_eq!(endpoint_list(services[1]), vec![E2]);
    }

    #[tokio::test]
    async fn test_limit_push_down() {
        let query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")])).with_limit(10);
        let out = plan(query, FederationOptions::default()).await;
        assert_eq!(body_services(&out)[0].body.limit, Some(10));

        // a tighter inner limit is kept
        let mut query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        query.limit = Some(10);
        query.pattern = GraphPattern::Group(vec![GraphPattern::Service(ServicePattern {
            endpoints: ServiceEndpoints::single(Iri::new(E1)),
            body: Box::new(Query::select_all(triple("s", "name", "n")).with_limit(3)),
            silent: false,
        })]);
        let out = plan(query, FederationOptions::default()).await;
        assert_eq!(body_services(&out)[0].body.limit, Some(3));

        // ordering prevents the push
        let mut query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")])).with_limit(10);
        query.order_by.push(OrderCondition {
            expr: Expression::var("n"),
            ascending: true,
        });
        let out = plan(query, FederationOptions::default()).await;
        assert_eq!(body_services(&out)[0].body.limit, None);
    }

    #[tokio::test]
    async fn test_filter_relocation() {
        let local = Expression::binary(
            BinaryOperator::NotEqual,
            Expression::var("n"),
            Expression::Literal(Literal::simple("Bob")),
        );
        let cross = Expression::binary(
            BinaryOperator::Less,
            Expression::var("n"),
            Expression::var("a"),
        );
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            GraphPattern::Filter(local.clone()),
            triple("s", "age", "a"),
            GraphPattern::Filter(cross.clone()),
        ]));
        let out = plan(query, FederationOptions::default()).await;
        let services = body_services(&out);
        assert!(services[0].elements().contains(&GraphPattern::Filter(local)));
        assert_eq!(out.pattern.elements().last(), Some(&GraphPattern::Filter(cross)));
    }

    #[tokio::test]
    async fn test_bind_relocation() {
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            GraphPattern::Bind {
                expression: Expression::Function {
                    name: "UCASE".to_string(),
                    args: vec![Expression::var("n")],
                },
                variable: "upper".to_string(),
            },
        ]));
        let out = plan(query, FederationOptions::default()).await;
        assert_eq!(out.pattern.elements().len(), 1);
        let service = body_services(&out)[0];
        assert!(service.in_scope_variables().contains("upper"));
    }

    #[tokio::test]
    async fn test_not_exists_moves_into_same_endpoint_service() {
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            GraphPattern::Filter(Expression::NotExists(Box::new(GraphPattern::group(vec![
                triple("s", "mbox", "m"),
            ])))),
        ]));
        let out = plan(query, FederationOptions::default()).await;
        assert_eq!(out.pattern.elements().len(), 1);
        let service = body_services(&out)[0];
        assert!(matches!(
            service.elements().last(),
            Some(GraphPattern::Filter(Expression::NotExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_exists_over_other_endpoint_is_rewritten_in_place() {
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            GraphPattern::Filter(Expression::Exists(Box::new(GraphPattern::group(vec![
                triple("s", "age", "a"),
            ])))),
        ]));
        let out = plan(query, FederationOptions::default()).await;
        match out.pattern.elements().last() {
            Some(GraphPattern::Filter(Expression::Exists(inner))) => {
                let services = inner.services();
                assert_eq!(services.len(), 1);
                assert_eq!(endpoint_list(services[0]), vec![E2]);
            }
            other => panic!("expected an EXISTS filter, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_optional_same_endpoint_is_factored() {
        let query = Query::select_all(GraphPattern::optional(
            GraphPattern::group(vec![triple("s", "name", "n")]),
            GraphPattern::group(vec![triple("s", "mbox", "m")]),
        ));
        let out = plan(query, FederationOptions::default()).await;
        let services = body_services(&out);
        assert_eq!(services.len(), 1);
        assert!(matches!(
            services[0].elements()[0],
            GraphPattern::Optional { .. }
        ));
    }

    #[tokio::test]
    async fn test_optional_different_endpoints_kept_apart() {
        let query = Query::select_all(GraphPattern::optional(
            GraphPattern::group(vec![triple("s", "name", "n")]),
            GraphPattern::group(vec![triple("s", "age", "a")]),
        ));
        let out = plan(query, FederationOptions::default()).await;
        match &out.pattern.elements()[0] {
            GraphPattern::Optional { left, right } => {
                assert_eq!(endpoint_list(single_service(left).unwrap()), vec![E1]);
                assert_eq!(endpoint_list(single_service(right).unwrap()), vec![E2]);
            }
            other => panic!("expected OPTIONAL, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_named_graph_is_reapplied_per_service() {
        let query = Query::select_all(GraphPattern::group(vec![GraphPattern::graph(
            Term::var("g"),
            GraphPattern::group(vec![triple("s", "name", "n"), triple("s", "age", "a")]),
        )]));
        let out = plan(query, FederationOptions::default()).await;
        let services = out.pattern.services();
        assert_eq!(services.len(), 2);
        for service in services {
            assert!(matches!(service.elements()[0], GraphPattern::Graph { .. }));
        }
    }

    fn graph_g(elements: Vec<GraphPattern>) -> Query {
        Query::select_all(GraphPattern::group(vec![GraphPattern::graph(
            Term::var("g"),
            GraphPattern::group(elements),
        )]))
    }

    fn first_subquery(pattern: &GraphPattern) -> Option<&Query> {
        match pattern {
            GraphPattern::Subquery(q) => Some(q),
            GraphPattern::Group(elements) => elements.iter().find_map(first_subquery),
            _ => None,
        }
    }

    fn assert_graph_scoped(query: &Query, expected: usize) {
        let services = query.pattern.services();
        assert_eq!(services.len(), expected, "{}", query);
        for service in services {
            assert!(
                matches!(service.elements()[0], GraphPattern::Graph { .. }),
                "service {} lost its graph: {}",
                service.endpoints,
                query
            );
        }
    }

    #[tokio::test]
    async fn test_named_graph_reaches_exists_filter() {
        let query = graph_g(vec![
            triple("s", "name", "n"),
            GraphPattern::Filter(Expression::Exists(Box::new(GraphPattern::group(vec![
                triple("s", "age", "a"),
            ])))),
        ]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 2);
        assert!(out.to_string().contains(&format!("SERVICE <{}> {{ GRAPH ?g", E2)));
    }

    #[tokio::test]
    async fn test_named_graph_reaches_exists_bind() {
        let query = graph_g(vec![
            triple("s", "name", "n"),
            GraphPattern::Bind {
                expression: Expression::Exists(Box::new(GraphPattern::group(vec![triple(
                    "s", "age", "a",
                )]))),
                variable: "adult".to_string(),
            },
        ]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 2);
    }

    #[tokio::test]
    async fn test_named_graph_reaches_subquery() {
        let inner = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        let query = graph_g(vec![GraphPattern::Subquery(Box::new(inner))]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 1);
        assert!(out.to_string().contains("GRAPH ?g"));
    }

    #[tokio::test]
    async fn test_named_graph_variable_is_projected_by_subquery() {
        let mut inner = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        inner.projection = vec!["n".to_string()];
        let query = graph_g(vec![GraphPattern::Subquery(Box::new(inner))]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 1);
        let subquery = first_subquery(&out.pattern).unwrap();
        assert_eq!(subquery.projection, vec!["n".to_string(), "g".to_string()]);
    }

    #[tokio::test]
    async fn test_named_graph_reaches_optional_and_union_bodies() {
        let query = graph_g(vec![GraphPattern::optional(
            GraphPattern::group(vec![triple("s", "name", "n")]),
            GraphPattern::group(vec![triple("s", "age", "a")]),
        )]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 2);

        let query = graph_g(vec![GraphPattern::union(
            GraphPattern::group(vec![triple("s", "name", "n")]),
            GraphPattern::group(vec![triple("s", "age", "a")]),
        )]);
        let out = plan(query, FederationOptions::default()).await;
        assert_graph_scoped(&out, 2);
    }

    #[tokio::test]
    async fn test_named_graph_iri_as_from_reaches_exists() {
        let query = Query::select_all(GraphPattern::group(vec![GraphPattern::graph(
            Term::iri("http://g.example"),
            GraphPattern::group(vec![
                triple("s", "name", "n"),
                GraphPattern::Filter(Expression::Exists(Box::new(GraphPattern::group(vec![
                    triple("s", "age", "a"),
                ])))),
            ]),
        )]));
        let options = FederationOptions {
            named_graph_as_from: true,
            ..FederationOptions::default()
        };
        let out = plan(query, options).await;
        let services = out.pattern.services();
        assert_eq!(services.len(), 2);
        for service in services {
            assert_eq!(service.body.dataset.default_graphs, vec![Iri::new("http://g.example")]);
        }
    }

    #[tokio::test]
    async fn test_named_graph_distribution() {
        let mut query = Query::select_all(GraphPattern::group(vec![GraphPattern::graph(
            Term::var("g"),
            GraphPattern::group(vec![triple("s", "name", "n")]),
        )]));
        query.dataset.named_graphs = vec![Iri::new("http://g1.example"), Iri::new("http://g2.example")];
        let options = FederationOptions {
            federate_bgp: false,
            ..FederationOptions::default()
        };
        let out = plan(query, options).await;
        assert!(matches!(out.pattern.elements()[0], GraphPattern::Union { .. }));
        assert_eq!(out.pattern.services().len(), 2);
        assert!(out.to_string().contains("BIND(<http://g1.example> AS ?g)"));
    }

    #[tokio::test]
    async fn test_subquery_is_rewritten() {
        let inner = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")])).with_limit(5);
        let query = Query::select_all(GraphPattern::group(vec![
            GraphPattern::Subquery(Box::new(inner)),
            triple("s", "age", "a"),
        ]));
        let out = plan(query, FederationOptions::default()).await;
        match &out.pattern.elements()[0] {
            GraphPattern::Subquery(q) => {
                let services = body_services(q);
                assert_eq!(services.len(), 1);
                assert_eq!(services[0].body.limit, Some(5));
            }
            other => panic!("expected a subquery, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_server_exposure_and_aggregation() {
        let query = Query::select_all(GraphPattern::group(vec![
            triple("s", "name", "n"),
            triple("s", "age", "a"),
        ]))
        .with_metadata(Metadata::new().with("server", &[]));
        let options = FederationOptions::from_metadata(&query.metadata);
        let out = plan(query, options).await;

        assert_eq!(out.group_by, vec!["_server_0".to_string(), "_server_1".to_string()]);
        assert_eq!(out.projection, out.group_by);
        assert_eq!(out.aggregates.len(), 1);
        let text = out.to_string();
        assert!(text.contains("VALUES (?_server_0) { (<http://e1.example/sparql>) }"));
        assert!(text.contains("SERVICE ?_server_0"));
        assert!(text.contains("(COUNT(*) AS ?count)"));
    }

    #[tokio::test]
    async fn test_server_exposure_reaches_subquery() {
        let mut inner = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        inner.projection = vec!["s".to_string()];
        let query = Query::select_all(GraphPattern::group(vec![
            GraphPattern::Subquery(Box::new(inner)),
            triple("s", "age", "a"),
        ]))
        .with_metadata(Metadata::new().with("server", &[]));
        let options = FederationOptions::from_metadata(&query.metadata);
        let out = plan(query, options).await;

        assert_eq!(out.group_by.len(), 2);
        let subquery = first_subquery(&out.pattern).unwrap();
        let inner_server = &out.group_by[0];
        assert!(subquery.projection.contains(inner_server));
        assert!(subquery.to_string().contains(&format!("SERVICE ?{}", inner_server)));
        assert!(!subquery.to_string().contains(&format!("SERVICE <{}>", E1)));
    }

    #[tokio::test]
    async fn test_whole_body_mode_keeps_values_inside() {
        let mut query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")])).with_limit(4);
        query.values = Some(ValuesTable::single(
            "s".to_string(),
            vec![Term::iri("http://example.org/alice")],
        ));
        let options = FederationOptions {
            sparql: true,
            ..FederationOptions::default()
        };
        let out = plan(query, options).await;
        let services = body_services(&out);
        assert_eq!(services.len(), 1);
        assert_eq!(endpoint_list(services[0]), vec![E1, E2]);
        assert!(services[0].body.has_values());
        assert_eq!(services[0].body.limit, Some(4));
        assert!(out.values.is_none());
    }

    #[tokio::test]
    async fn test_default_graphs_become_subselects() {
        let mut query = Query::select_all(GraphPattern::group(vec![triple("s", "name", "n")]));
        query.dataset.default_graphs = vec![Iri::new("http://g.example")];
        let out = plan(query, FederationOptions::default()).await;
        assert!(out.dataset.default_graphs.is_empty());
        let text = out.to_string();
        assert!(text.contains("{ SELECT * FROM <http://g.example> WHERE"));
    }
}
