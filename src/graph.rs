//! Dependency graph over services.
//!
//! Nodes are services in declaration order; an edge `(dependent, dependency)`
//! means "the dependency must be Healthy before the dependent starts".
//! The graph is validated and sorted once at construction and is immutable
//! afterwards.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::LoadError;
use crate::topology::ServiceSpec;

/// Ordered pair `(dependent, dependency)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
}

/// Validated, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    specs: Vec<Arc<ServiceSpec>>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names, dangling references and cycles.
    pub fn build(specs: Vec<ServiceSpec>) -> Result<Self, LoadError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(LoadError::DuplicateName(spec.name.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let j = *index
                    .get(dep)
                    .ok_or_else(|| LoadError::UnknownDependency {
                        service: spec.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let order = topo_sort(&dependencies, &dependents);
        if order.len() < specs.len() {
            let visited: BTreeSet<usize> = order.iter().copied().collect();
            let leftover = (0..specs.len())
                .filter(|i| !visited.contains(i))
                .map(|i| specs[i].name.clone())
                .collect();
            return Err(LoadError::CyclicDependency(leftover));
        }

        Ok(Self {
            specs: specs.into_iter().map(Arc::new).collect(),
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Services in declaration order.
    pub fn services(&self) -> &[Arc<ServiceSpec>] {
        &self.specs
    }

    /// Startup order: every dependency precedes its dependents; ties keep
    /// declaration order.
    pub fn topological_order(&self) -> Vec<Arc<ServiceSpec>> {
        self.order.iter().map(|&i| Arc::clone(&self.specs[i])).collect()
    }

    /// Reverse of [`topological_order`](Self::topological_order).
    pub fn shutdown_order(&self) -> Vec<Arc<ServiceSpec>> {
        self.order
            .iter()
            .rev()
            .map(|&i| Arc::clone(&self.specs[i]))
            .collect()
    }

    /// Direct dependencies of `name`. Empty for unknown names.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependencies)
    }

    /// Services that directly depend on `name`. Empty for unknown names.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    /// Every service that (directly or indirectly) depends on `name`, in
    /// topological order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.specs.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &d in &self.dependents[i] {
                if !seen[d] {
                    seen[d] = true;
                    queue.push_back(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|&&i| seen[i])
            .map(|&i| self.specs[i].name.as_str())
            .collect()
    }

    /// All edges, grouped by dependent in declaration order.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(i, deps)| {
                deps.iter().map(move |&j| DependencyEdge {
                    dependent: self.specs[i].name.clone(),
                    dependency: self.specs[j].name.clone(),
                })
            })
            .collect()
    }

    fn neighbours<'a>(&'a self, name: &str, table: &[Vec<usize>]) -> Vec<&'a str> {
        match self.index.get(name) {
            Some(&i) => table[i]
                .iter()
                .map(|&j| self.specs[j].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Kahn's algorithm; the ready set is ordered by declaration index so that
/// unconstrained services keep their source order.
fn topo_sort(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }
    order
}
