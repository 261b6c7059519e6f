//! Dependency resolver
//!
//! Orders entities so that every entity comes after everything it
//! references, and computes the transitive dependency closure of a
//! selection.

use crate::entity::{Entity, EntityKind, Reference, references_of};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Node {
    kind: EntityKind,
    name: String,
    dependencies: BTreeSet<Uuid>,
}

/// Directed graph of dependent → dependency edges.
///
/// Edges pointing at UUIDs that are not nodes of the graph are kept (they
/// matter for the bundle digest) but ignored when ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<Uuid, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from entity payloads
    pub fn build(entities: &[Entity]) -> Result<Self> {
        let mut graph = Self::new();
        for entity in entities {
            let references = references_of(entity)?;
            graph.add(entity, references.iter().map(|r| r.uuid));
        }
        Ok(graph)
    }

    /// Add a node with explicitly declared dependencies
    pub fn add(&mut self, entity: &Entity, dependencies: impl IntoIterator<Item = Uuid>) {
        self.nodes.insert(
            entity.uuid,
            Node {
                kind: entity.kind,
                name: entity.name.clone(),
                dependencies: dependencies.into_iter().collect(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.nodes.contains_key(uuid)
    }

    /// Direct dependencies of a node, including ones outside the graph
    pub fn dependencies_of<'a>(
        &'a self,
        uuid: &Uuid,
    ) -> impl Iterator<Item = &'a Uuid> + use<'a> {
        self.nodes
            .get(uuid)
            .into_iter()
            .flat_map(|n| n.dependencies.iter())
    }

    /// Every `(uuid, dependencies)` pair, sorted by uuid
    pub fn edges(&self) -> impl Iterator<Item = (&Uuid, &BTreeSet<Uuid>)> {
        self.nodes.iter().map(|(id, n)| (id, &n.dependencies))
    }

    /// Kahn's algorithm with a (kind precedence, name, uuid) ready queue.
    pub fn order(&self) -> Result<Vec<Uuid>> {
        let mut pending: HashMap<Uuid, usize> = HashMap::with_capacity(self.nodes.len());
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for (id, node) in &self.nodes {
            let mut count = 0;
            for dep in node.dependencies.iter().filter(|d| self.nodes.contains_key(*d)) {
                count += 1;
                dependents.entry(*dep).or_default().push(*id);
            }
            pending.insert(*id, count);
        }

        let mut ready: BTreeSet<(u8, &str, Uuid)> = self
            .nodes
            .iter()
            .filter(|(id, _)| pending.get(*id) == Some(&0))
            .map(|(id, n)| (n.kind.precedence(), n.name.as_str(), *id))
            .collect();

        let mut ordered = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            let id = next.2;
            ordered.push(id);
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        let node = &self.nodes[dependent];
                        ready.insert((node.kind.precedence(), node.name.as_str(), *dependent));
                    }
                }
            }
        }

        if ordered.len() < self.nodes.len() {
            let emitted: BTreeSet<Uuid> = ordered.iter().copied().collect();
            let involved = self.find_cycle(&emitted);
            log::debug!("cycle detected among {} entities", involved.len());
            return Err(Error::CyclicDependency { involved });
        }

        Ok(ordered)
    }

    /// Walk dependency edges through the unemitted remainder until a node
    /// repeats. Every remaining node has a remaining dependency, so the walk
    /// always closes.
    fn find_cycle(&self, emitted: &BTreeSet<Uuid>) -> Vec<Uuid> {
        let remaining = |id: &Uuid| self.nodes.contains_key(id) && !emitted.contains(id);

        let Some(start) = self.nodes.keys().find(|id| remaining(*id)) else {
            return Vec::new();
        };

        let mut path: Vec<Uuid> = Vec::new();
        let mut seen: HashMap<Uuid, usize> = HashMap::new();
        let mut current = *start;
        loop {
            if let Some(&index) = seen.get(&current) {
                return path[index..].to_vec();
            }
            seen.insert(current, path.len());
            path.push(current);
            match self.dependencies_of(&current).find(|d| remaining(*d)) {
                Some(next) => current = *next,
                None => return path,
            }
        }
    }
}

/// Order entities so that each appears after all entities it references.
///
/// Ties between ready entities break by kind precedence (Connection, Table,
/// Visualization, Dashboard), then display name, then UUID.
pub fn topological_order(entities: &[Entity]) -> Result<Vec<Entity>> {
    let graph = DependencyGraph::build(entities)?;
    let order = graph.order()?;
    let mut by_uuid: HashMap<Uuid, &Entity> = entities.iter().map(|e| (e.uuid, e)).collect();
    Ok(order
        .into_iter()
        .filter_map(|id| by_uuid.remove(&id).cloned())
        .collect())
}

/// Transitive dependency closure of `seeds` inside `universe`.
///
/// A reference that leaves the universe fails with `DanglingReference`.
pub fn closure(
    seeds: &BTreeSet<Uuid>,
    universe: &HashMap<Uuid, Entity>,
) -> Result<BTreeSet<Uuid>> {
    let mut result = BTreeSet::new();
    let mut frontier: Vec<Uuid> = seeds.iter().copied().collect();

    while let Some(id) = frontier.pop() {
        if !result.insert(id) {
            continue;
        }
        let Some(entity) = universe.get(&id) else {
            continue;
        };
        for reference in references_of(entity)? {
            if !universe.contains_key(&reference.uuid) {
                return Err(Error::DanglingReference {
                    from: id,
                    to: reference,
                });
            }
            if !result.contains(&reference.uuid) {
                frontier.push(reference.uuid);
            }
        }
    }

    Ok(result)
}

/// References of `entity` that point outside `members`.
pub fn external_references(
    entity: &Entity,
    members: &BTreeSet<Uuid>,
) -> Result<Vec<Reference>> {
    Ok(references_of(entity)?
        .into_iter()
        .filter(|r| !members.contains(&r.uuid))
        .collect())
}
