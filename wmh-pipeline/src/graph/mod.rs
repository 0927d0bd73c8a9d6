//! Stage graph: declarative stage specs, iteration groups and validation
//!
//! A workflow is a list of [`StageSpec`]s. Each spec names the upstream ports
//! it consumes, the ports it produces and the iteration groups it is
//! replicated over. Fields inside one [`IterableGroup`] advance in lockstep
//! (subject and session of one case); separate groups form a cross product
//! (cases × thresholds).
//!
//! [`StageGraph::build`] validates the specs once. [`StageGraph::plan`] expands
//! them into per-branch instances for the executor.

pub mod dot;
pub mod plan;

pub use plan::{ExecutionPlan, Instance};

use crate::error::GraphError;
use crate::tools::StageAction;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

const MAX_SLUG_LEN: usize = 96;

/// Named group of synchronized iteration fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterableGroup {
    name: String,
    fields: Vec<(String, Vec<String>)>,
}

impl IterableGroup {
    /// Fields that advance together; all value lists must have the same length
    pub fn synchronized<N: Into<String>>(
        name: &str,
        fields: Vec<(N, Vec<String>)>,
    ) -> Result<Self, GraphError> {
        let fields: Vec<(String, Vec<String>)> =
            fields.into_iter().map(|(n, v)| (n.into(), v)).collect();
        let Some((_, first)) = fields.first() else {
            return Err(GraphError::EmptyGroup(name.to_string()));
        };
        let expected = first.len();
        for (field, values) in &fields {
            if values.len() != expected {
                return Err(GraphError::UnsynchronizedGroup {
                    group: name.to_string(),
                    field: field.clone(),
                    expected,
                    found: values.len(),
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Group with one field named like the group
    pub fn single(name: &str, values: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            fields: vec![(name.to_string(), values)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.fields.first().map_or(0, |(_, v)| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    fn values_at(&self, index: usize) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .filter_map(move |(n, v)| v.get(index).map(|value| (n.as_str(), value.as_str())))
    }
}

/// Iteration groups available to a workflow
#[derive(Debug, Clone, Default)]
pub struct IterationSpace {
    groups: Vec<IterableGroup>,
}

impl IterationSpace {
    pub fn new(groups: Vec<IterableGroup>) -> Result<Self, GraphError> {
        let mut seen = BTreeSet::new();
        for group in &groups {
            if !seen.insert(group.name.clone()) {
                return Err(GraphError::DuplicateGroup(group.name.clone()));
            }
        }
        let mut fields = BTreeSet::new();
        for field in groups.iter().flat_map(|g| g.field_names()) {
            if !fields.insert(field.to_string()) {
                return Err(GraphError::DuplicateGroup(field.to_string()));
            }
        }
        Ok(Self { groups })
    }

    pub fn group(&self, name: &str) -> Option<&IterableGroup> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Position of one branch: an index per iteration group plus the field values there
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey {
    coords: BTreeMap<String, usize>,
    values: BTreeMap<String, String>,
}

impl BranchKey {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn coords(&self) -> &BTreeMap<String, usize> {
        &self.coords
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    fn push(&mut self, group: &IterableGroup, index: usize) {
        self.coords.insert(group.name.clone(), index);
        for (field, value) in group.values_at(index) {
            self.values.insert(field.to_string(), value.to_string());
        }
    }

    /// Directory name of the branch: `_<field>_<value>` pairs in field order
    ///
    /// Values that had to be rewritten (training lists, labels with
    /// punctuation) and long slugs get a hash of the exact key appended, so
    /// distinct branches never share a directory.
    pub fn slug(&self) -> String {
        if self.values.is_empty() {
            return "_root".to_string();
        }
        let full: String = self
            .values
            .iter()
            .map(|(k, v)| format!("_{}_{}", sanitize(k), sanitize(v)))
            .collect();
        let rewritten = self.values.iter().any(|(_, v)| !v.chars().all(slug_safe));
        if full.len() <= MAX_SLUG_LEN && !rewritten {
            return full;
        }
        let digest = Sha256::digest(self.to_string().as_bytes());
        let hash: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        let cut: String = full.chars().take(MAX_SLUG_LEN - hash.len() - 1).collect();
        format!("{cut}_{hash}")
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if parts.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

fn slug_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

fn sanitize(s: &str) -> String {
    s.chars().map(|c| if slug_safe(c) { c } else { '_' }).collect()
}

/// Typed connection from an upstream port to one of this stage's ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from_stage: String,
    pub from_port: String,
    pub to_port: String,
}

/// Declarative description of one stage
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub action: Arc<dyn StageAction>,
    pub over: Vec<String>,
    pub inputs: Vec<Edge>,
    pub outputs: Vec<String>,
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("over", &self.over)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl StageSpec {
    pub fn new(name: &str, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.to_string(),
            action,
            over: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Iteration groups this stage is replicated over
    pub fn over(mut self, groups: &[&str]) -> Self {
        self.over = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Consume `from_stage.from_port` as `to_port`
    pub fn input(mut self, from_stage: &str, from_port: &str, to_port: &str) -> Self {
        self.inputs.push(Edge {
            from_stage: from_stage.to_string(),
            from_port: from_port.to_string(),
            to_port: to_port.to_string(),
        });
        self
    }

    pub fn outputs(mut self, ports: &[&str]) -> Self {
        self.outputs.extend(ports.iter().map(|p| p.to_string()));
        self
    }

    pub fn upstream_stages(&self) -> BTreeSet<&str> {
        self.inputs.iter().map(|e| e.from_stage.as_str()).collect()
    }
}

/// Validated stage graph in topological order
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
}

impl StageGraph {
    /// Validate specs and order them topologically
    ///
    /// Rejects duplicate names, unknown upstream stages or ports, ports fed
    /// twice, cycles, and stages iterating over fewer groups than an upstream.
    pub fn build(specs: Vec<StageSpec>) -> Result<Self, GraphError> {
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateStage(spec.name.clone()));
            }
        }

        for spec in &specs {
            let mut ports = BTreeSet::new();
            for edge in &spec.inputs {
                let upstream = by_name.get(&edge.from_stage).map(|&i| &specs[i]).ok_or_else(|| {
                    GraphError::UnknownStage {
                        stage: spec.name.clone(),
                        upstream: edge.from_stage.clone(),
                    }
                })?;
                if !upstream.outputs.contains(&edge.from_port) {
                    return Err(GraphError::UnknownPort {
                        stage: spec.name.clone(),
                        upstream: edge.from_stage.clone(),
                        port: edge.from_port.clone(),
                    });
                }
                if !ports.insert(edge.to_port.as_str()) {
                    return Err(GraphError::DuplicateInput {
                        stage: spec.name.clone(),
                        port: edge.to_port.clone(),
                    });
                }
                if !upstream.over.iter().all(|g| spec.over.contains(g)) {
                    return Err(GraphError::IterationMismatch {
                        stage: spec.name.clone(),
                        upstream: upstream.name.clone(),
                        stage_groups: spec.over.clone(),
                        upstream_groups: upstream.over.clone(),
                    });
                }
            }
        }

        let order = topological_order(&specs, &by_name)?;
        let mut slots: Vec<Option<StageSpec>> = specs.into_iter().map(Some).collect();
        let stages: Vec<StageSpec> = order.into_iter().filter_map(|i| slots[i].take()).collect();
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Ok(Self { stages, index })
    }

    /// Stages in topological order
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Kahn's algorithm; ties resolved by declaration order
fn topological_order(specs: &[StageSpec], by_name: &HashMap<String, usize>) -> Result<Vec<usize>, GraphError> {
    let n = specs.len();
    let mut in_degree = vec![0usize; n];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, spec) in specs.iter().enumerate() {
        for up in spec.upstream_stages() {
            if let Some(&u) = by_name.get(up) {
                downstream[u].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &downstream[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }
    Err(GraphError::Cycle(find_cycle(specs, by_name, &in_degree)))
}

/// Walk upstream edges among the unsorted stages until a stage repeats
fn find_cycle(specs: &[StageSpec], by_name: &HashMap<String, usize>, in_degree: &[usize]) -> Vec<String> {
    let Some(start) = (0..specs.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = specs[current]
            .upstream_stages()
            .into_iter()
            .filter_map(|up| by_name.get(up).copied())
            .find(|&u| in_degree[u] > 0);
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            // Upstream walk reversed into data-flow order, closed on its first stage
            let mut cycle: Vec<String> = path[pos..].iter().rev().map(|&i| specs[i].name.clone()).collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(|&i| specs[i].name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsynchronized_group_rejected() {
        let err = IterableGroup::synchronized(
            "case",
            vec![
                ("subject", vec!["A".to_string(), "B".to_string()]),
                ("session", vec!["s1".to_string()]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::UnsynchronizedGroup { found: 1, .. }));
    }

    #[test]
    fn test_slug_is_stable_and_bounded() {
        let mut key = BranchKey::default();
        let group = IterableGroup::synchronized(
            "case",
            vec![("subject", vec!["A".to_string()]), ("session", vec!["s1".to_string()])],
        )
        .unwrap();
        key.push(&group, 0);
        assert_eq!(key.slug(), "_session_s1_subject_A");
        assert_eq!(key.to_string(), "session=s1,subject=A");

        let long: Vec<String> = vec![(1..200).map(|i| i.to_string()).collect::<Vec<_>>().join(",")];
        let mut long_key = BranchKey::default();
        long_key.push(&IterableGroup::single("training_nums", long), 0);
        let slug = long_key.slug();
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert_eq!(slug, long_key.slug());
    }

    #[test]
    fn test_punctuated_values_get_distinct_slugs() {
        let slug_of = |value: &str| {
            let mut key = BranchKey::default();
            key.push(&IterableGroup::single("subject", vec![value.to_string()]), 0);
            key.slug()
        };
        assert_ne!(slug_of("A+B"), slug_of("A=B"));
        assert_ne!(slug_of("A_B"), slug_of("A+B"));
        assert!(slug_of("A+B").starts_with("_subject_A_B_"));
        assert_eq!(slug_of("0.99"), "_subject_0.99");
    }
}
