//! Dependency resolution.
//!
//! ## Algorithm
//!
//! 1. De-duplicate by ID (skeleton over flesh, then best rank)
//! 2. Drop atoms with absent dependencies, cascading (unless allowed)
//! 3. Detect cycles with a DFS over sorted IDs; any cycle is fatal
//! 4. Arbitrate conflicts in rank order
//! 5. Keep the best atom of each exclusion group
//! 6. Re-check dependencies after the drops of steps 4-5
//! 7. Topological sort (Kahn) with a ranked ready queue
//!
//! ## Determinism Guarantees
//!
//! - Adjacency is keyed by ID in BTreeMaps
//! - The ready queue breaks ties on (category rank, mandatory desc,
//!   combined desc, priority desc, ID asc)

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use crate::policy::{CompilerConfig, ConflictPolicy};
use crate::types::{DropReason, DroppedEntry, OrderedAtom, ScoredAtom, SelectionSource};

/// Kind of dependency problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyErrorKind {
    /// A declared dependency is absent.
    Missing,
    /// Dependencies form a cycle.
    Cycle,
    /// Two mandatory atoms exclude each other.
    Conflict,
}

impl fmt::Display for DependencyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Cycle => write!(f, "cycle"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// A dependency problem. Cycles and mandatory conflicts are fatal; missing
/// dependencies and ordinary conflicts are kept as diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub struct DependencyError {
    /// Kind of problem.
    pub kind: DependencyErrorKind,
    /// Atom the problem was found on.
    pub atom_id: String,
    /// Absent dependency, for `Missing`.
    pub missing_dep_id: Option<String>,
    /// Other side of a conflict, for `Conflict`.
    pub conflict_id: Option<String>,
    /// Cycle path, first ID repeated at the end, for `Cycle`.
    pub cycle_ids: Vec<String>,
}

impl DependencyError {
    /// A missing dependency.
    pub fn missing(atom_id: &str, dependency: &str) -> Self {
        Self {
            kind: DependencyErrorKind::Missing,
            atom_id: atom_id.to_string(),
            missing_dep_id: Some(dependency.to_string()),
            conflict_id: None,
            cycle_ids: Vec::new(),
        }
    }

    /// A dependency cycle.
    pub fn cycle(path: Vec<String>) -> Self {
        Self {
            kind: DependencyErrorKind::Cycle,
            atom_id: path.first().cloned().unwrap_or_default(),
            missing_dep_id: None,
            conflict_id: None,
            cycle_ids: path,
        }
    }

    /// A conflict between two atoms.
    pub fn conflict(atom_id: &str, other: &str) -> Self {
        Self {
            kind: DependencyErrorKind::Conflict,
            atom_id: atom_id.to_string(),
            missing_dep_id: None,
            conflict_id: Some(other.to_string()),
            cycle_ids: Vec::new(),
        }
    }

}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DependencyErrorKind::Missing => write!(
                f,
                "Atom {} depends on missing atom {}",
                self.atom_id,
                self.missing_dep_id.as_deref().unwrap_or("?")
            ),
            DependencyErrorKind::Cycle => {
                write!(f, "Dependency cycle detected: {}", self.cycle_ids.join(" -> "))
            }
            DependencyErrorKind::Conflict => write!(
                f,
                "Atom {} conflicts with {}",
                self.atom_id,
                self.conflict_id.as_deref().unwrap_or("?")
            ),
        }
    }
}

/// Outcome of resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Atoms in final order, `order` numbered from 0.
    pub ordered: Vec<OrderedAtom>,
    /// Atoms removed by the resolver.
    pub dropped: Vec<DroppedEntry>,
    /// Non-fatal problems.
    pub diagnostics: Vec<DependencyError>,
}

/// Dependency resolver.
pub struct Resolver<'a> {
    config: &'a CompilerConfig,
}

impl<'a> Resolver<'a> {
    /// Create a resolver.
    pub fn new(config: &'a CompilerConfig) -> Self {
        Self { config }
    }

    /// Resolve a selection into an ordered list.
    pub fn resolve(&self, selected: Vec<ScoredAtom>) -> Result<Resolution, DependencyError> {
        let mut resolution = Resolution::default();

        let mut atoms = dedupe(selected);
        self.drop_missing(&mut atoms, &mut resolution);
        detect_cycle(&atoms)?;
        self.arbitrate_conflicts(&mut atoms, &mut resolution)?;
        arbitrate_groups(&mut atoms, &mut resolution)?;
        self.drop_missing(&mut atoms, &mut resolution);

        resolution.ordered = self.topological_order(atoms)?;
        tracing::debug!(
            ordered = resolution.ordered.len(),
            dropped = resolution.dropped.len(),
            diagnostics = resolution.diagnostics.len(),
            "Resolution complete"
        );
        Ok(resolution)
    }

    /// Remove atoms whose dependencies are absent until nothing changes.
    ///
    /// Mandatory atoms are kept with a diagnostic.
    fn drop_missing(&self, atoms: &mut BTreeMap<String, ScoredAtom>, resolution: &mut Resolution) {
        let mut reported: BTreeSet<(String, String)> = resolution
            .diagnostics
            .iter()
            .filter(|d| d.kind == DependencyErrorKind::Missing)
            .filter_map(|d| Some((d.atom_id.clone(), d.missing_dep_id.clone()?)))
            .collect();

        loop {
            let mut removed = Vec::new();
            for (id, scored) in atoms.iter() {
                let Some(missing) = scored.atom.depends_on.iter().find(|dep| !atoms.contains_key(*dep)) else {
                    continue;
                };
                if reported.insert((id.clone(), missing.clone())) {
                    resolution.diagnostics.push(DependencyError::missing(id, missing));
                }
                if self.config.allow_missing_deps || scored.atom.is_mandatory {
                    continue;
                }
                removed.push((id.clone(), missing.clone()));
            }
            if removed.is_empty() {
                break;
            }
            for (id, missing) in removed {
                tracing::warn!(atom_id = %id, dependency = %missing, "Dropping atom with missing dependency");
                atoms.remove(&id);
                resolution.dropped.push(DroppedEntry::new(
                    id,
                    DropReason::MissingDependency { dependency: missing },
                ));
            }
        }
    }

    fn arbitrate_conflicts(
        &self,
        atoms: &mut BTreeMap<String, ScoredAtom>,
        resolution: &mut Resolution,
    ) -> Result<(), DependencyError> {
        let mut ranked: Vec<&ScoredAtom> = atoms.values().collect();
        ranked.sort_by(|a, b| a.rank_cmp(b));

        // Excluded ID -> admitted atom that excluded it.
        let mut excluded: BTreeMap<&str, &ScoredAtom> = BTreeMap::new();
        let mut admitted: BTreeMap<&str, &ScoredAtom> = BTreeMap::new();
        let mut losers: Vec<(String, String)> = Vec::new();

        for scored in ranked {
            let id = scored.id();
            let winner = match excluded.get(id) {
                Some(winner) => Some(*winner),
                None if self.config.conflict_policy == ConflictPolicy::Symmetric => scored
                    .atom
                    .conflicts_with
                    .iter()
                    .find_map(|other| admitted.get(other.as_str()).copied()),
                None => None,
            };

            if let Some(winner) = winner {
                if scored.atom.is_mandatory && winner.atom.is_mandatory {
                    tracing::error!(atom_id = %id, winner = %winner.id(), "Mandatory atoms conflict");
                    return Err(DependencyError::conflict(id, winner.id()));
                }
                losers.push((id.to_string(), winner.id().to_string()));
                continue;
            }

            admitted.insert(id, scored);
            for other in &scored.atom.conflicts_with {
                excluded.entry(other.as_str()).or_insert(scored);
            }
        }

        for (id, winner) in losers {
            tracing::debug!(atom_id = %id, winner = %winner, "Dropped by conflict");
            atoms.remove(&id);
            resolution.diagnostics.push(DependencyError::conflict(&id, &winner));
            resolution
                .dropped
                .push(DroppedEntry::new(id, DropReason::Conflict { winner }));
        }
        Ok(())
    }

    fn topological_order(&self, mut atoms: BTreeMap<String, ScoredAtom>) -> Result<Vec<OrderedAtom>, DependencyError> {
        let order = self.kahn_order(&atoms)?;
        Ok(order
            .into_iter()
            .enumerate()
            .filter_map(|(position, id)| atoms.remove(&id).map(|scored| OrderedAtom::new(scored, position)))
            .collect())
    }

    fn kahn_order(&self, atoms: &BTreeMap<String, ScoredAtom>) -> Result<Vec<String>, DependencyError> {
        // Edges point from a dependency to its dependents.
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut in_degree: BTreeMap<&str, usize> = atoms.keys().map(|id| (id.as_str(), 0)).collect();
        for (id, scored) in atoms {
            for dep in &scored.atom.depends_on {
                if atoms.contains_key(dep) {
                    dependents.entry(dep.as_str()).or_default().push(id.as_str());
                    *in_degree.entry(id.as_str()).or_default() += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<Ready<'_>>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .filter_map(|(id, _)| atoms.get(*id))
            .map(|scored| Reverse(self.ready(scored)))
            .collect();

        let mut order: Vec<String> = Vec::with_capacity(atoms.len());
        while let Some(Reverse(next)) = ready.pop() {
            let id = next.scored.id();
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                let Some(degree) = in_degree.get_mut(dependent) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    if let Some(scored) = atoms.get(*dependent) {
                        ready.push(Reverse(self.ready(scored)));
                    }
                }
            }
        }

        if order.len() != atoms.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let stuck: Vec<String> = atoms
                .keys()
                .filter(|id| !placed.contains(id.as_str()))
                .cloned()
                .collect();
            return Err(DependencyError::cycle(stuck));
        }
        Ok(order)
    }

    fn ready<'s>(&self, scored: &'s ScoredAtom) -> Ready<'s> {
        let (category_rank, category_name) = if self.config.sort_by_category {
            let category = scored.atom.category;
            (self.config.category_rank(category), category.as_str())
        } else {
            (0, "")
        };
        Ready {
            category_rank,
            category_name,
            scored,
        }
    }
}

/// Ready-queue entry. Smaller sorts first.
struct Ready<'a> {
    category_rank: usize,
    category_name: &'static str,
    scored: &'a ScoredAtom,
}

impl Ord for Ready<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.category_rank
            .cmp(&other.category_rank)
            .then_with(|| self.category_name.cmp(other.category_name))
            .then_with(|| self.scored.rank_cmp(other.scored))
    }
}

impl PartialOrd for Ready<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ready<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready<'_> {}

/// Keep one atom per ID: skeleton over flesh, then best rank.
fn dedupe(selected: Vec<ScoredAtom>) -> BTreeMap<String, ScoredAtom> {
    let mut atoms: BTreeMap<String, ScoredAtom> = BTreeMap::new();
    for scored in selected {
        let replace = match atoms.get(scored.id()) {
            None => true,
            Some(existing) => {
                let skeleton = |s: &ScoredAtom| s.source == SelectionSource::Skeleton;
                match (skeleton(&scored), skeleton(existing)) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => scored.rank_cmp(existing) == Ordering::Less,
                }
            }
        };
        if replace {
            atoms.insert(scored.id().to_string(), scored);
        }
    }
    atoms
}

/// DFS over sorted IDs. Returns the first cycle found, including self-loops.
fn detect_cycle(atoms: &BTreeMap<String, ScoredAtom>) -> Result<(), DependencyError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        atoms: &'a BTreeMap<String, ScoredAtom>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), DependencyError> {
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(scored) = atoms.get(id) {
            for dep in &scored.atom.depends_on {
                if !atoms.contains_key(dep) {
                    continue;
                }
                match marks.get(dep.as_str()) {
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|s| *s == dep.as_str()).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        tracing::error!(cycle = %path.join(" -> "), "Dependency cycle");
                        return Err(DependencyError::cycle(path));
                    }
                    Some(Mark::Done) => {}
                    None => visit(dep, atoms, marks, stack)?,
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack = Vec::new();
    for id in atoms.keys() {
        if !marks.contains_key(id.as_str()) {
            visit(id, atoms, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

/// Keep the best-ranked atom of every exclusion group.
fn arbitrate_groups(
    atoms: &mut BTreeMap<String, ScoredAtom>,
    resolution: &mut Resolution,
) -> Result<(), DependencyError> {
    let mut groups: BTreeMap<&str, Vec<&ScoredAtom>> = BTreeMap::new();
    for scored in atoms.values() {
        if let Some(group) = scored.atom.exclusion_group.as_deref() {
            groups.entry(group).or_default().push(scored);
        }
    }

    let mut losers: Vec<(String, String, String)> = Vec::new();
    for (group, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|a, b| a.rank_cmp(b));
        let winner = members[0];
        for loser in &members[1..] {
            if loser.atom.is_mandatory {
                tracing::error!(group, atom_id = %loser.id(), winner = %winner.id(), "Mandatory atom lost its exclusion group");
                return Err(DependencyError::conflict(loser.id(), winner.id()));
            }
            losers.push((loser.id().to_string(), group.to_string(), winner.id().to_string()));
        }
    }

    for (id, group, winner) in losers {
        tracing::debug!(atom_id = %id, group = %group, winner = %winner, "Dropped by exclusion group");
        atoms.remove(&id);
        resolution
            .dropped
            .push(DroppedEntry::new(id, DropReason::ExclusionGroup { group, winner }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Atom, Category};

    fn scored(id: &str, score: f32) -> ScoredAtom {
        ScoredAtom::with_score(Atom::new(id, Category::Domain, id), score)
    }

    fn with(atom: Atom, score: f32) -> ScoredAtom {
        ScoredAtom::with_score(atom, score)
    }

    fn ids(resolution: &Resolution) -> Vec<&str> {
        resolution.ordered.iter().map(OrderedAtom::id).collect()
    }

    #[test]
    fn test_orders_by_rank_without_edges() {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config)
            .resolve(vec![scored("b", 0.5), scored("a", 0.5), scored("c", 0.9)])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["c", "a", "b"]);
        assert_eq!(resolution.ordered[2].order, 2);
    }

    #[test]
    fn test_missing_dependency_cascades() {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").depends_on("ghost"), 0.5),
                with(Atom::new("b", Category::Domain, "b").depends_on("a"), 0.5),
                scored("c", 0.5),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["c"]);
        assert_eq!(resolution.dropped.len(), 2);
        assert!(resolution
            .diagnostics
            .iter()
            .all(|d| d.kind == DependencyErrorKind::Missing));
    }

    #[test]
    fn test_allow_missing_deps() {
        let config = CompilerConfig {
            allow_missing_deps: true,
            ..CompilerConfig::default()
        };
        let resolution = Resolver::new(&config)
            .resolve(vec![with(Atom::new("a", Category::Domain, "a").depends_on("ghost"), 0.5)])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["a"]);
        assert_eq!(resolution.diagnostics.len(), 1);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let config = CompilerConfig::default();
        let err = Resolver::new(&config)
            .resolve(vec![with(Atom::new("a", Category::Domain, "a").depends_on("a"), 0.5)])
            .unwrap_err();
        assert_eq!(err.kind, DependencyErrorKind::Cycle);
        assert_eq!(err.cycle_ids, vec!["a", "a"]);
    }

    #[test]
    fn test_cycle_path_reported() {
        let config = CompilerConfig::default();
        let err = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").depends_on("b"), 0.5),
                with(Atom::new("b", Category::Domain, "b").depends_on("c"), 0.5),
                with(Atom::new("c", Category::Domain, "c").depends_on("a"), 0.5),
            ])
            .unwrap_err();
        assert_eq!(err.cycle_ids, vec!["a", "b", "c", "a"]);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_symmetric_conflict_policy() {
        let config = CompilerConfig::default().with_conflict_policy(ConflictPolicy::Symmetric);
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").conflicts_with("b"), 0.3),
                scored("b", 0.9),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["b"]);
        assert_eq!(
            resolution.dropped[0].reason,
            DropReason::Conflict { winner: "b".to_string() }
        );
    }

    #[test]
    fn test_higher_ranked_conflict_evicts() {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").conflicts_with("b"), 0.9),
                scored("b", 0.3),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["a"]);
    }

    #[test]
    fn test_mandatory_conflict_is_fatal() {
        let config = CompilerConfig::default();
        let err = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").mandatory().conflicts_with("b"), 1.0),
                with(Atom::new("b", Category::Domain, "b").mandatory(), 1.0),
            ])
            .unwrap_err();
        assert_eq!(err.kind, DependencyErrorKind::Conflict);
        assert_eq!(err.atom_id, "b");
    }

    #[test]
    fn test_mandatory_wins_conflict_against_higher_score() {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("m", Category::Domain, "m").mandatory().conflicts_with("x"), 0.1),
                scored("x", 0.99),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["m"]);
    }

    #[test]
    fn test_dependents_of_conflict_losers_dropped() {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("a", Category::Domain, "a").conflicts_with("b"), 0.9),
                scored("b", 0.3),
                with(Atom::new("c", Category::Domain, "c").depends_on("b"), 0.8),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["a"]);
        assert!(resolution.dropped.iter().any(|d| d.atom_id == "c"
            && d.reason == DropReason::MissingDependency { dependency: "b".to_string() }));
    }

    #[test]
    fn test_category_sort_respects_dependencies() {
        let config = CompilerConfig::default();
        // Safety ranks before protocol, but the safety atom depends on it.
        let resolution = Resolver::new(&config)
            .resolve(vec![
                with(Atom::new("p", Category::Protocol, "p"), 0.5),
                with(Atom::new("s", Category::Safety, "s").depends_on("p"), 0.9),
                with(Atom::new("i", Category::Identity, "i"), 0.1),
            ])
            .unwrap();
        assert_eq!(ids(&resolution), vec!["i", "p", "s"]);
    }

    #[test]
    fn test_dedupe_prefers_skeleton() {
        let skeleton = ScoredAtom::skeleton(Atom::new("x", Category::Identity, "skeleton"), "r");
        let flesh = ScoredAtom::flesh(Atom::new("x", Category::Identity, "flesh"), 1.0, 1.0, 1.0, "r");
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config).resolve(vec![flesh, skeleton]).unwrap();
        assert_eq!(resolution.ordered.len(), 1);
        assert_eq!(resolution.ordered[0].content(), "skeleton");
    }
}
