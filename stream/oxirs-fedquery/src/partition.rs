//! # BGP Partitioning
//!
//! Splits the fragments of one basic pattern into endpoint-scoped services.
//!
//! Fragments with identical candidate lists share one service. The remaining
//! fragments are connected through shared variables; each connected
//! component that has a common endpoint is sent whole to every such
//! endpoint, otherwise joint-satisfiable groups are grown from join probe
//! results, and whatever is left goes out fragment by fragment.

use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, trace};

use crate::algebra::{
    Fragment, GraphPattern, Iri, ServiceEndpoints, ServicePattern, Variable,
};
use crate::config::FederationOptions;
use crate::source_selection::{CandidateList, EndpointIndex};

/// Prefix of placeholder variables naming unresolved endpoints
pub const UNDEFINED_SERVICE: &str = "undef_serv";

/// Generator of fresh variable names for one rewriting pass
#[derive(Debug, Default)]
pub struct FreshVariables {
    next: usize,
}

impl FreshVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, prefix: &str) -> Variable {
        let var = format!("{}_{}", prefix, self.next);
        self.next += 1;
        var
    }
}

/// Partitions basic patterns against an endpoint index
pub struct Partitioner<'a> {
    index: &'a EndpointIndex,
    options: &'a FederationOptions,
}

struct Unit {
    position: usize,
    pattern: GraphPattern,
}

impl<'a> Partitioner<'a> {
    pub fn new(index: &'a EndpointIndex, options: &'a FederationOptions) -> Self {
        Self { index, options }
    }

    /// Turn `fragments` into services, in order of their first fragment
    pub fn partition(&self, fragments: Vec<Fragment>, fresh: &mut FreshVariables) -> Vec<GraphPattern> {
        let candidates = self.effective_candidates(&fragments);
        let mut units: Vec<Unit> = Vec::new();
        let mut residual: Vec<(usize, CandidateList)> = Vec::new();

        // bucket by candidate list value
        let mut buckets: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
        for (i, candidate) in candidates.iter().enumerate() {
            match candidate {
                None => {
                    let var = fresh.fresh(UNDEFINED_SERVICE);
                    debug!("No endpoint for {}, using ?{}", fragments[i], var);
                    units.push(Unit {
                        position: i,
                        pattern: service(
                            ServiceEndpoints::Variable(var),
                            vec![fragments[i].clone()],
                        ),
                    });
                }
                Some(list) if self.options.group => {
                    buckets.entry(list.key()).or_default().push(i);
                }
                Some(list) => residual.push((i, list.clone())),
            }
        }

        for members in buckets.into_values() {
            let first = members[0];
            let list = candidates[first].clone().unwrap_or_default();
            if members.len() > 1 || list.len() == 1 {
                units.push(Unit {
                    position: first,
                    pattern: service(
                        endpoints_of(&list),
                        members.iter().map(|&i| fragments[i].clone()).collect(),
                    ),
                });
            } else {
                residual.push((first, list));
            }
        }
        residual.sort_by_key(|(i, _)| *i);

        if self.options.federate_bgp {
            units.extend(self.partition_components(&fragments, residual));
        } else {
            for (i, list) in residual {
                units.push(self.fallback(i, &fragments[i], &list));
            }
        }

        units.sort_by_key(|u| u.position);
        units.into_iter().map(|u| u.pattern).collect()
    }

    /// Candidate lists narrowed by join probe results where that keeps them non-empty
    fn effective_candidates(&self, fragments: &[Fragment]) -> Vec<Option<CandidateList>> {
        let mut candidates: Vec<Option<CandidateList>> =
            fragments.iter().map(|f| self.index.candidates(f)).collect();
        if !self.options.select_join || !self.index.has_join_results() {
            return candidates;
        }
        for (i, fragment) in fragments.iter().enumerate() {
            let Some(list) = candidates[i].clone() else {
                continue;
            };
            let mut pruned = list.clone();
            for (j, other) in fragments.iter().enumerate() {
                if i == j || !fragment.shares_variable(other) {
                    continue;
                }
                if let Some(joint) = self.index.join_candidates(fragment, other) {
                    pruned = pruned.intersection(joint);
                }
            }
            if !pruned.is_empty() && pruned != list {
                trace!("Join pruning narrowed {} to {} endpoints", fragment, pruned.len());
                candidates[i] = Some(pruned);
            }
        }
        candidates
    }

    fn partition_components(
        &self,
        fragments: &[Fragment],
        residual: Vec<(usize, CandidateList)>,
    ) -> Vec<Unit> {
        let mut graph: UnGraph<usize, ()> = UnGraph::new_undirected();
        let nodes: Vec<NodeIndex> = residual.iter().map(|(i, _)| graph.add_node(*i)).collect();
        for a in 0..residual.len() {
            for b in a + 1..residual.len() {
                if fragments[residual[a].0].shares_variable(&fragments[residual[b].0]) {
                    graph.add_edge(nodes[a], nodes[b], ());
                }
            }
        }

        let mut units = Vec::new();
        let mut visited = HashSet::new();
        for (start, _) in nodes.iter().enumerate() {
            if visited.contains(&nodes[start]) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([nodes[start]]);
            while let Some(node) = queue.pop_front() {
                if visited.insert(node) {
                    component.push(node.index());
                    for neighbor in graph.neighbors(node) {
                        if !visited.contains(&neighbor) {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
            component.sort_unstable();
            let members: Vec<(usize, CandidateList)> =
                component.into_iter().map(|k| residual[k].clone()).collect();
            units.extend(self.partition_component(fragments, members));
        }
        debug!("Partitioned {} residual fragments into {} units", residual.len(), units.len());
        units
    }

    fn partition_component(
        &self,
        fragments: &[Fragment],
        members: Vec<(usize, CandidateList)>,
    ) -> Vec<Unit> {
        if members.len() == 1 {
            let (i, list) = &members[0];
            return vec![self.fallback(*i, &fragments[*i], list)];
        }

        let common = members
            .iter()
            .skip(1)
            .fold(members[0].1.clone(), |acc, (_, list)| acc.intersection(list));
        if !common.is_empty() && self.options.partition {
            let body: Vec<Fragment> = members.iter().map(|(i, _)| fragments[*i].clone()).collect();
            return vec![Unit {
                position: members[0].0,
                pattern: union_of_services(&common, &body),
            }];
        }

        if !self.options.use_join {
            return members
                .iter()
                .map(|(i, list)| self.fallback(*i, &fragments[*i], list))
                .collect();
        }

        // grow joint-satisfiable groups
        let mut groups: Vec<(Vec<usize>, CandidateList)> = Vec::new();
        for (i, list) in members {
            let mut placed = false;
            for (group, joint) in groups.iter_mut() {
                let connected = group
                    .iter()
                    .any(|&g| fragments[g].shares_variable(&fragments[i]));
                if !connected {
                    continue;
                }
                let mut narrowed = joint.intersection(&list);
                for &g in group.iter() {
                    if let Some(pair) = self.index.join_candidates(&fragments[g], &fragments[i]) {
                        narrowed = narrowed.intersection(pair);
                    }
                }
                if !narrowed.is_empty() {
                    group.push(i);
                    *joint = narrowed;
                    placed = true;
                    break;
                }
            }
            if !placed {
                groups.push((vec![i], list));
            }
        }

        groups
            .into_iter()
            .map(|(group, joint)| {
                if group.len() == 1 {
                    self.fallback(group[0], &fragments[group[0]], &joint)
                } else {
                    let body: Vec<Fragment> = group.iter().map(|&g| fragments[g].clone()).collect();
                    Unit {
                        position: group[0],
                        pattern: union_of_services(&joint, &body),
                    }
                }
            })
            .collect()
    }

    /// Single-fragment service: per-endpoint union when complete, else generalized
    fn fallback(&self, position: usize, fragment: &Fragment, list: &CandidateList) -> Unit {
        let pattern = if self.options.complete {
            union_of_services(list, std::slice::from_ref(fragment))
        } else {
            service(endpoints_of(list), vec![fragment.clone()])
        };
        Unit { position, pattern }
    }
}

fn endpoints_of(list: &CandidateList) -> ServiceEndpoints {
    ServiceEndpoints::Endpoints(list.endpoints().to_vec())
}

fn service(endpoints: ServiceEndpoints, fragments: Vec<Fragment>) -> GraphPattern {
    GraphPattern::Service(ServicePattern::new(
        endpoints,
        fragments.into_iter().map(GraphPattern::Pattern).collect(),
    ))
}

/// `Service(e1){body} UNION ... UNION Service(en){body}`
fn union_of_services(endpoints: &CandidateList, body: &[Fragment]) -> GraphPattern {
    let services = endpoints
        .endpoints()
        .iter()
        .map(|e: &Iri| service(ServiceEndpoints::single(e.clone()), body.to_vec()));
    services
        .reduce(GraphPattern::union)
        .unwrap_or_else(|| GraphPattern::Group(Vec::new()))
}
