//! Token budget fitting.
//!
//! Fits the resolver's ordered atoms into `budget - headroom` by category,
//! downscaling non-mandatory atoms through their render variants.
//!
//! ## Protocol
//!
//! 1. Mandatory atoms are admitted in `standard`, whatever the allocation
//! 2. Every skeleton category with candidates keeps at least one atom when
//!    any of its variants fits the global budget
//! 3. Categories in fitting order: atoms by rank try standard, concise, min;
//!    the first variant keeping the category inside its allocation wins
//! 4. A global second pass spends what is left, bounded by `max_tokens`
//!    unless the category may exceed it
//! 5. Atoms whose dependency was dropped are swept in one pass over the
//!    topological order
//!
//! ## Determinism Guarantees
//!
//! - Walks follow `ScoredAtom::rank_cmp` (ID as last tiebreak)
//! - Atoms are never mutated; only `render_mode` and `order` are assigned

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::policy::{BudgetConfig, BudgetTier};
use crate::types::{Category, DropReason, DroppedEntry, OrderedAtom, RenderMode};

/// Budget errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    /// Headroom leaves nothing to fit into.
    #[error("token budget {budget} leaves no room after {reserved} reserved tokens")]
    Exhausted {
        /// Total budget.
        budget: usize,
        /// Headroom.
        reserved: usize,
    },
}

/// Tokens available for the prompt, or an error when headroom eats the budget.
pub fn available_tokens(budget: usize, reserved: usize) -> Result<usize, BudgetError> {
    match budget.checked_sub(reserved) {
        Some(available) if available > 0 => Ok(available),
        _ => Err(BudgetError::Exhausted { budget, reserved }),
    }
}

/// Usage of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUsage {
    /// Tokens allocated by the strategy.
    pub allocated: usize,
    /// Tokens spent.
    pub used: usize,
    /// Atoms admitted.
    pub atom_count: usize,
    /// Priority tier.
    pub tier: BudgetTier,
}

/// Allocation report of one fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    /// Per-category usage, for categories with an allocation or admitted atoms.
    pub categories: BTreeMap<Category, CategoryUsage>,
    /// Tokens available.
    pub total_budget: usize,
    /// Tokens spent.
    pub total_used: usize,
    /// Tokens spent on mandatory atoms.
    pub mandatory_tokens: usize,
    /// Tokens spent on optional atoms.
    pub optional_tokens: usize,
    /// Tokens over `total_budget` (mandatory atoms alone can cause this).
    pub over_budget: usize,
}

impl BudgetReport {
    /// Overage against a different budget.
    pub fn report_against(&self, budget: usize) -> usize {
        self.total_used.saturating_sub(budget)
    }

    /// Fraction of the budget used.
    pub fn utilization(&self) -> f32 {
        if self.total_budget == 0 {
            return 0.0;
        }
        self.total_used as f32 / self.total_budget as f32
    }
}

/// Output of [`Budgeter::fit`].
#[derive(Debug, Clone, Default)]
pub struct Fitted {
    /// Admitted atoms in resolver order, renumbered from 0.
    pub atoms: Vec<OrderedAtom>,
    /// Atoms that did not fit.
    pub dropped: Vec<DroppedEntry>,
    /// Allocation report.
    pub report: BudgetReport,
}

const CASCADE: [RenderMode; 3] = [RenderMode::Standard, RenderMode::Concise, RenderMode::Min];

/// Running totals while fitting.
struct Ledger {
    available: usize,
    used: usize,
    per_category: BTreeMap<Category, usize>,
    admitted: BTreeMap<usize, RenderMode>,
}

impl Ledger {
    fn remaining(&self) -> usize {
        self.available.saturating_sub(self.used)
    }

    fn category_used(&self, category: Category) -> usize {
        self.per_category.get(&category).copied().unwrap_or(0)
    }

    fn admit(&mut self, index: usize, category: Category, mode: RenderMode, cost: usize) {
        self.used += cost;
        *self.per_category.entry(category).or_default() += cost;
        self.admitted.insert(index, mode);
    }
}

/// Token budgeter.
pub struct Budgeter<'a> {
    config: &'a BudgetConfig,
}

impl<'a> Budgeter<'a> {
    /// Create a budgeter.
    pub fn new(config: &'a BudgetConfig) -> Self {
        Self { config }
    }

    /// Fit ordered atoms into `available` tokens.
    pub fn fit(&self, atoms: Vec<OrderedAtom>, available: usize) -> Fitted {
        if atoms.is_empty() {
            return Fitted {
                report: BudgetReport {
                    total_budget: available,
                    ..BudgetReport::default()
                },
                ..Fitted::default()
            };
        }

        let allocations = self.config.allocate(available);
        let mut ledger = Ledger {
            available,
            used: 0,
            per_category: BTreeMap::new(),
            admitted: BTreeMap::new(),
        };

        // Indices of non-mandatory atoms, best rank first.
        let mut optional: Vec<usize> = (0..atoms.len()).filter(|i| !atoms[*i].atom().is_mandatory).collect();
        optional.sort_by(|a, b| atoms[*a].scored.rank_cmp(&atoms[*b].scored));

        for (index, ordered) in atoms.iter().enumerate() {
            let atom = ordered.atom();
            if atom.is_mandatory {
                let cost = atom.tokens_for(RenderMode::Standard).unwrap_or(0);
                ledger.admit(index, atom.category, RenderMode::Standard, cost);
            }
        }
        if ledger.used > available {
            tracing::warn!(
                mandatory_tokens = ledger.used,
                available,
                "Mandatory atoms exceed the budget"
            );
        }

        self.pin_skeleton(&atoms, &optional, &mut ledger);

        for category in self.config.fitting_order() {
            let allocation = allocations.get(&category).copied().unwrap_or(0);
            for &index in &optional {
                let atom = atoms[index].atom();
                if atom.category != category || ledger.admitted.contains_key(&index) {
                    continue;
                }
                let room = allocation.saturating_sub(ledger.category_used(category));
                if let Some((mode, cost)) = first_fit(&atoms[index], room.min(ledger.remaining())) {
                    ledger.admit(index, category, mode, cost);
                }
            }
        }

        for &index in &optional {
            if ledger.admitted.contains_key(&index) {
                continue;
            }
            let category = atoms[index].atom().category;
            let rule = self.config.rule(category);
            let mut room = ledger.remaining();
            if !rule.can_exceed_max {
                room = room.min(rule.max_tokens.saturating_sub(ledger.category_used(category)));
            }
            if let Some((mode, cost)) = first_fit(&atoms[index], room) {
                ledger.admit(index, category, mode, cost);
            }
        }

        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(ledger.admitted.len());
        for (index, mut ordered) in atoms.into_iter().enumerate() {
            match ledger.admitted.get(&index) {
                Some(mode) => {
                    ordered.render_mode = *mode;
                    kept.push(ordered);
                }
                None => {
                    tracing::debug!(atom_id = %ordered.id(), "Dropped by budget");
                    dropped.push(DroppedEntry::new(ordered.id(), DropReason::Budget));
                }
            }
        }

        let mut kept = sweep_dependencies(kept, &mut dropped);
        for (position, ordered) in kept.iter_mut().enumerate() {
            ordered.order = position;
        }

        let report = self.report(&kept, &allocations, available);
        tracing::debug!(
            admitted = kept.len(),
            dropped = dropped.len(),
            used = report.total_used,
            available,
            "Budget fit complete"
        );
        Fitted {
            atoms: kept,
            dropped,
            report,
        }
    }

    /// Keep one atom in every skeleton category that has candidates but no
    /// admitted atom.
    fn pin_skeleton(&self, atoms: &[OrderedAtom], optional: &[usize], ledger: &mut Ledger) {
        let covered: BTreeSet<Category> = ledger.admitted.keys().map(|i| atoms[*i].atom().category).collect();
        let mut pinned: BTreeSet<Category> = BTreeSet::new();

        for &index in optional {
            let category = atoms[index].atom().category;
            if !category.is_skeleton() || covered.contains(&category) || pinned.contains(&category) {
                continue;
            }
            if let Some((mode, cost)) = first_fit(&atoms[index], ledger.remaining()) {
                tracing::debug!(atom_id = %atoms[index].id(), category = %category, mode = %mode.as_str(), "Pinned skeleton atom");
                ledger.admit(index, category, mode, cost);
                pinned.insert(category);
            }
        }
    }

    fn report(&self, kept: &[OrderedAtom], allocations: &BTreeMap<Category, usize>, available: usize) -> BudgetReport {
        let mut categories: BTreeMap<Category, CategoryUsage> = allocations
            .iter()
            .filter(|(_, allocated)| **allocated > 0)
            .map(|(category, allocated)| {
                (
                    *category,
                    CategoryUsage {
                        allocated: *allocated,
                        used: 0,
                        atom_count: 0,
                        tier: self.config.rule(*category).tier,
                    },
                )
            })
            .collect();

        let mut report = BudgetReport {
            total_budget: available,
            ..BudgetReport::default()
        };
        for ordered in kept {
            let atom = ordered.atom();
            let tokens = ordered.tokens();
            let usage = categories.entry(atom.category).or_insert_with(|| CategoryUsage {
                allocated: 0,
                used: 0,
                atom_count: 0,
                tier: self.config.rule(atom.category).tier,
            });
            usage.used += tokens;
            usage.atom_count += 1;
            report.total_used += tokens;
            if atom.is_mandatory {
                report.mandatory_tokens += tokens;
            } else {
                report.optional_tokens += tokens;
            }
        }
        report.categories = categories;
        report.over_budget = report.report_against(available);
        report
    }
}

/// First variant, in cascade order, whose cost fits `room`.
fn first_fit(ordered: &OrderedAtom, room: usize) -> Option<(RenderMode, usize)> {
    CASCADE.iter().find_map(|mode| {
        let cost = ordered.atom().tokens_for(*mode)?;
        (cost <= room).then_some((*mode, cost))
    })
}

/// Drop non-mandatory atoms whose dependency was dropped. `kept` is in
/// topological order, so one pass cascades.
fn sweep_dependencies(kept: Vec<OrderedAtom>, dropped: &mut Vec<DroppedEntry>) -> Vec<OrderedAtom> {
    let mut gone: BTreeSet<String> = dropped.iter().map(|d| d.atom_id.clone()).collect();
    let mut survivors = Vec::with_capacity(kept.len());
    for ordered in kept {
        let atom = ordered.atom();
        let lost = if atom.is_mandatory {
            None
        } else {
            atom.depends_on.iter().find(|dep| gone.contains(*dep)).cloned()
        };
        match lost {
            Some(dependency) => {
                tracing::debug!(atom_id = %ordered.id(), dependency = %dependency, "Dropped with its dependency");
                gone.insert(ordered.id().to_string());
                dropped.push(DroppedEntry::new(ordered.id(), DropReason::BudgetDependency { dependency }));
            }
            None => survivors.push(ordered),
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CategoryBudget;
    use crate::types::{Atom, ScoredAtom};

    fn ordered(atom: Atom, score: f32, order: usize) -> OrderedAtom {
        OrderedAtom::new(ScoredAtom::with_score(atom, score), order)
    }

    fn ids(fitted: &Fitted) -> Vec<&str> {
        fitted.atoms.iter().map(OrderedAtom::id).collect()
    }

    #[test]
    fn test_available_tokens() {
        assert_eq!(available_tokens(10_000, 1_000), Ok(9_000));
        assert_eq!(
            available_tokens(1_000, 1_000),
            Err(BudgetError::Exhausted { budget: 1_000, reserved: 1_000 })
        );
        assert!(available_tokens(10, 20).is_err());
    }

    #[test]
    fn test_downgrade_to_concise() {
        let config = BudgetConfig::default()
            .with_category(Category::Domain, CategoryBudget::new(0.04, 0, 400, BudgetTier::Medium, false));
        let atom = Atom::new("domain/big", Category::Domain, "standard")
            .with_tokens(800)
            .with_concise("concise", Some(300))
            .with_min("min", Some(80));
        let fitted = Budgeter::new(&config).fit(vec![ordered(atom, 0.8, 0)], 10_000);
        assert_eq!(fitted.atoms.len(), 1);
        assert_eq!(fitted.atoms[0].render_mode, RenderMode::Concise);
        assert_eq!(fitted.report.total_used, 300);
    }

    #[test]
    fn test_mandatory_overage_reported() {
        let config = BudgetConfig::default();
        let atoms = vec![
            ordered(Atom::new("identity/a", Category::Identity, "a").mandatory().with_tokens(80), 1.0, 0),
            ordered(Atom::new("safety/b", Category::Safety, "b").mandatory().with_tokens(70), 1.0, 1),
            ordered(Atom::new("domain/c", Category::Domain, "c").with_tokens(5), 0.9, 2),
        ];
        let fitted = Budgeter::new(&config).fit(atoms, 100);
        assert_eq!(ids(&fitted), vec!["identity/a", "safety/b"]);
        assert_eq!(fitted.report.over_budget, 50);
        assert_eq!(fitted.report.mandatory_tokens, 150);
        assert_eq!(fitted.report.report_against(120), 30);
        assert_eq!(fitted.dropped, vec![DroppedEntry::new("domain/c", DropReason::Budget)]);
    }

    #[test]
    fn test_never_exceeds_budget_without_mandatory() {
        let config = BudgetConfig::default();
        let atoms: Vec<OrderedAtom> = (0..20)
            .map(|i| {
                let atom = Atom::new(format!("language/{i:02}"), Category::Language, "x").with_tokens(40 + i * 7);
                ordered(atom, 0.5, i)
            })
            .collect();
        let fitted = Budgeter::new(&config).fit(atoms, 500);
        assert!(fitted.report.total_used <= 500);
        assert_eq!(fitted.atoms.len() + fitted.dropped.len(), 20);
    }

    #[test]
    fn test_skeleton_category_pinned() {
        // No allocation for methodology, but one atom still fits globally.
        let config = BudgetConfig::default().with_category(
            Category::Methodology,
            CategoryBudget::new(0.0, 0, 0, BudgetTier::High, false),
        );
        let atoms = vec![
            ordered(Atom::new("methodology/a", Category::Methodology, "a").with_tokens(300), 0.4, 0),
            ordered(Atom::new("methodology/b", Category::Methodology, "b").with_tokens(200), 0.9, 1),
        ];
        let fitted = Budgeter::new(&config).fit(atoms, 1_000);
        assert_eq!(ids(&fitted), vec!["methodology/b"]);
    }

    #[test]
    fn test_dependency_sweep_cascades() {
        let config = BudgetConfig::default();
        let atoms = vec![
            ordered(Atom::new("domain/base", Category::Domain, "x").with_tokens(5_000), 0.2, 0),
            ordered(Atom::new("domain/mid", Category::Domain, "x").with_tokens(10).depends_on("domain/base"), 0.9, 1),
            ordered(Atom::new("domain/top", Category::Domain, "x").with_tokens(10).depends_on("domain/mid"), 0.9, 2),
            ordered(Atom::new("domain/free", Category::Domain, "x").with_tokens(10), 0.9, 3),
        ];
        let fitted = Budgeter::new(&config).fit(atoms, 1_000);
        assert_eq!(ids(&fitted), vec!["domain/free"]);
        assert_eq!(fitted.atoms[0].order, 0);
        assert!(fitted.dropped.contains(&DroppedEntry::new(
            "domain/top",
            DropReason::BudgetDependency { dependency: "domain/mid".to_string() }
        )));
    }

    #[test]
    fn test_second_pass_respects_max() {
        let config = BudgetConfig::default().with_category(
            Category::Domain,
            CategoryBudget::new(0.01, 0, 50, BudgetTier::Medium, false),
        );
        let atoms = vec![
            ordered(Atom::new("domain/a", Category::Domain, "a").with_tokens(40), 0.9, 0),
            ordered(Atom::new("domain/b", Category::Domain, "b").with_tokens(40), 0.8, 1),
        ];
        let fitted = Budgeter::new(&config).fit(atoms, 10_000);
        assert_eq!(ids(&fitted), vec!["domain/a"]);
    }

    #[test]
    fn test_empty_input() {
        let fitted = Budgeter::new(&BudgetConfig::default()).fit(Vec::new(), 1_000);
        assert!(fitted.atoms.is_empty());
        assert_eq!(fitted.report.total_budget, 1_000);
    }
}
