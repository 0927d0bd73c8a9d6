//! Expansion of a stage graph into per-branch instances

use super::{BranchKey, IterableGroup, IterationSpace, StageGraph};
use crate::error::GraphError;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One stage replicated at one branch key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: usize,
    /// Position of the stage in [`StageGraph::stages`]
    pub stage: usize,
    pub stage_name: String,
    pub key: BranchKey,
    /// Instances whose outputs this one reads
    pub deps: Vec<usize>,
}

/// All instances of a workflow in dependency order
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    instances: Vec<Instance>,
    dependents: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn get(&self, id: usize) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Instances reading the outputs of `id`
    pub fn dependents(&self, id: usize) -> &[usize] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instances_of<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.instances.iter().filter(move |i| i.stage_name == stage)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl StageGraph {
    /// Replicate every stage over its iteration groups
    ///
    /// An instance depends on the upstream instance whose key is its own key
    /// restricted to the upstream's groups. Sibling branches share nothing.
    pub fn plan(&self, space: &IterationSpace) -> Result<ExecutionPlan, GraphError> {
        let mut instances: Vec<Instance> = Vec::new();
        let mut lookup: HashMap<(usize, BTreeMap<String, usize>), usize> = HashMap::new();

        for (stage_idx, spec) in self.stages().iter().enumerate() {
            let groups = spec
                .over
                .iter()
                .map(|g| {
                    space.group(g).ok_or_else(|| GraphError::UnknownGroup {
                        stage: spec.name.clone(),
                        group: g.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            for key in expand(&groups) {
                let mut deps = BTreeSet::new();
                for upstream in spec.upstream_stages() {
                    let Some(up_idx) = self.position(upstream) else {
                        continue;
                    };
                    let up_groups = &self.stages()[up_idx].over;
                    let coords: BTreeMap<String, usize> = key
                        .coords()
                        .iter()
                        .filter(|(g, _)| up_groups.contains(*g))
                        .map(|(g, i)| (g.clone(), *i))
                        .collect();
                    if let Some(&id) = lookup.get(&(up_idx, coords)) {
                        deps.insert(id);
                    }
                }

                let id = instances.len();
                lookup.insert((stage_idx, key.coords().clone()), id);
                instances.push(Instance {
                    id,
                    stage: stage_idx,
                    stage_name: spec.name.clone(),
                    key,
                    deps: deps.into_iter().collect(),
                });
            }
        }

        let mut dependents = vec![Vec::new(); instances.len()];
        for instance in &instances {
            for &dep in &instance.deps {
                dependents[dep].push(instance.id);
            }
        }

        Ok(ExecutionPlan {
            instances,
            dependents,
        })
    }
}

/// Cross product of the groups; fields within a group stay synchronized
fn expand(groups: &[&IterableGroup]) -> Vec<BranchKey> {
    let mut keys = vec![BranchKey::default()];
    for group in groups {
        let mut next = Vec::with_capacity(keys.len() * group.len());
        for key in &keys {
            for index in 0..group.len() {
                let mut k = key.clone();
                k.push(group, index);
                next.push(k);
            }
        }
        keys = next;
    }
    keys
}
