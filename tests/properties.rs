//! Property tests for resolution and budget fitting.

use std::collections::BTreeSet;

use jit_prompt_compiler::{
    Atom, BudgetConfig, BudgetStrategy, Budgeter, Category, CompilerConfig, DependencyErrorKind,
    OrderedAtom, Resolver, ScoredAtom,
};
use proptest::prelude::*;

const CATEGORIES: [Category; 6] = [
    Category::Identity,
    Category::Methodology,
    Category::Language,
    Category::Domain,
    Category::Exemplar,
    Category::Northstar,
];

#[derive(Debug, Clone)]
struct AtomSpec {
    category: usize,
    tokens: usize,
    concise: Option<usize>,
    score: f32,
    group: Option<u8>,
    deps: Vec<usize>,
}

fn atom_spec() -> impl Strategy<Value = AtomSpec> {
    (
        0..CATEGORIES.len(),
        1usize..600,
        proptest::option::of(1usize..200),
        0.0f32..1.0,
        proptest::option::weighted(0.3, 0u8..3),
        proptest::collection::vec(0usize..16, 0..3),
    )
        .prop_map(|(category, tokens, concise, score, group, deps)| AtomSpec {
            category,
            tokens,
            concise,
            score,
            group,
            deps,
        })
}

/// Atoms whose dependencies only point at lower indices, so the graph is acyclic.
fn build(specs: &[AtomSpec]) -> Vec<ScoredAtom> {
    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let mut atom = Atom::new(format!("atom/{i:02}"), CATEGORIES[spec.category], format!("body {i}"))
                .with_tokens(spec.tokens);
            if let Some(concise) = spec.concise {
                atom = atom.with_concise(format!("short {i}"), Some(concise));
            }
            if let Some(group) = spec.group {
                atom = atom.in_group(format!("group-{group}"));
            }
            for dep in spec.deps.iter().filter(|d| **d < i) {
                atom = atom.depends_on(format!("atom/{dep:02}"));
            }
            ScoredAtom::with_score(atom, spec.score)
        })
        .collect()
}

fn strategy() -> impl Strategy<Value = BudgetStrategy> {
    prop_oneof![
        Just(BudgetStrategy::PriorityFirst),
        Just(BudgetStrategy::Proportional),
        Just(BudgetStrategy::Balanced),
    ]
}

proptest! {
    #[test]
    fn prop_dependencies_precede_dependents(specs in proptest::collection::vec(atom_spec(), 1..16)) {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config).resolve(build(&specs)).unwrap();

        for (position, ordered) in resolution.ordered.iter().enumerate() {
            prop_assert_eq!(ordered.order, position);
            for dep in &ordered.atom().depends_on {
                let dep_order = resolution.ordered.iter().find(|a| a.id() == dep).map(|a| a.order);
                prop_assert!(dep_order.is_some(), "{} kept without {}", ordered.id(), dep);
                prop_assert!(dep_order.unwrap() < ordered.order);
            }
        }
    }

    #[test]
    fn prop_one_atom_per_exclusion_group(specs in proptest::collection::vec(atom_spec(), 1..16)) {
        let config = CompilerConfig::default();
        let resolution = Resolver::new(&config).resolve(build(&specs)).unwrap();

        let mut groups = BTreeSet::new();
        for ordered in &resolution.ordered {
            if let Some(group) = &ordered.atom().exclusion_group {
                prop_assert!(groups.insert(group.clone()), "group {} kept twice", group);
            }
        }
    }

    #[test]
    fn prop_optional_atoms_fit_budget(
        specs in proptest::collection::vec(atom_spec(), 1..16),
        available in 1usize..3_000,
        strategy in strategy(),
    ) {
        let config = CompilerConfig::default();
        let budget = BudgetConfig::default().with_strategy(strategy);
        let resolution = Resolver::new(&config).resolve(build(&specs)).unwrap();
        let input: usize = resolution.ordered.len();
        let fitted = Budgeter::new(&budget).fit(resolution.ordered, available);

        prop_assert!(fitted.report.total_used <= available);
        prop_assert_eq!(fitted.report.over_budget, 0);
        prop_assert_eq!(fitted.atoms.len() + fitted.dropped.len(), input);
        let used: usize = fitted.atoms.iter().map(OrderedAtom::tokens).sum();
        prop_assert_eq!(used, fitted.report.total_used);
    }

    #[test]
    fn prop_mandatory_overage_is_reported(
        tokens in proptest::collection::vec(1usize..500, 1..6),
        available in 1usize..1_000,
    ) {
        let atoms: Vec<OrderedAtom> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let atom = Atom::new(format!("identity/{i}"), Category::Identity, "x").mandatory().with_tokens(*t);
                OrderedAtom::new(ScoredAtom::with_score(atom, 1.0), i)
            })
            .collect();
        let total: usize = tokens.iter().sum();
        let fitted = Budgeter::new(&BudgetConfig::default()).fit(atoms, available);

        prop_assert_eq!(fitted.atoms.len(), tokens.len());
        prop_assert_eq!(fitted.report.over_budget, total.saturating_sub(available));
    }

    #[test]
    fn prop_back_edge_is_a_cycle(
        specs in proptest::collection::vec(atom_spec(), 2..12),
        from in 0usize..12,
    ) {
        // Chain every atom onto its predecessor, then close the loop.
        let n = specs.len();
        let from = from % n;
        let mut atoms: Vec<ScoredAtom> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut atom = Atom::new(format!("atom/{i:02}"), Category::Domain, "x");
                if i > 0 {
                    atom = atom.depends_on(format!("atom/{:02}", i - 1));
                }
                ScoredAtom::with_score(atom, spec.score)
            })
            .collect();
        atoms[0].atom.depends_on.insert(format!("atom/{from:02}"));

        let config = CompilerConfig::default();
        let err = Resolver::new(&config).resolve(atoms).unwrap_err();
        prop_assert_eq!(err.kind, DependencyErrorKind::Cycle);
        prop_assert_eq!(err.cycle_ids.first(), err.cycle_ids.last());
    }
}
