//! Token budget configuration: strategies and per-category allocations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::Category;

/// Priority tier of a category. Tiers are served in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    /// Served first.
    Mandatory,
    /// Served second.
    High,
    /// Served third.
    Medium,
    /// Served fourth.
    Low,
    /// Served last, alongside `Low`.
    Conditional,
}

impl BudgetTier {
    /// Rank used for ordering; `Low` and `Conditional` share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Mandatory => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low | Self::Conditional => 3,
        }
    }
}

/// Allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    /// Tiers in order, each against what earlier tiers left.
    PriorityFirst,
    /// Every category gets its share of the whole budget.
    Proportional,
    /// Minimums first, remainder proportionally.
    Balanced,
}

impl Default for BudgetStrategy {
    fn default() -> Self {
        Self::PriorityFirst
    }
}

/// Allocation rule for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryBudget {
    /// Share of the budget [0, 1].
    pub base_percent: f32,
    /// Lower clamp.
    pub min_tokens: usize,
    /// Upper clamp.
    pub max_tokens: usize,
    /// Priority tier.
    pub tier: BudgetTier,
    /// Whether the second pass may push the category past `max_tokens`.
    pub can_exceed_max: bool,
}

impl CategoryBudget {
    /// Create a category budget; `base_percent` is clamped to [0, 1] and
    /// `max_tokens` raised to `min_tokens` when smaller.
    pub fn new(base_percent: f32, min_tokens: usize, max_tokens: usize, tier: BudgetTier, can_exceed_max: bool) -> Self {
        Self {
            base_percent: base_percent.clamp(0.0, 1.0),
            min_tokens,
            max_tokens: max_tokens.max(min_tokens),
            tier,
            can_exceed_max,
        }
    }

    /// Clamp a raw allocation into `[min_tokens, max_tokens]`.
    pub fn clamp(&self, tokens: usize) -> usize {
        tokens.max(self.min_tokens).min(self.max_tokens)
    }

    /// `base_percent` in basis points, so allocation arithmetic is exact.
    pub fn basis_points(&self) -> usize {
        (self.base_percent as f64 * 10_000.0).round() as usize
    }

    /// Share of `total`, clamped.
    pub fn share_of(&self, total: usize) -> usize {
        self.clamp(total * self.basis_points() / 10_000)
    }
}

/// Budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Allocation strategy.
    pub strategy: BudgetStrategy,
    /// Per-category rules. Categories without a rule use `fallback`.
    pub categories: BTreeMap<Category, CategoryBudget>,
    /// Rule for categories missing from `categories`.
    pub fallback: CategoryBudget,
}

impl BudgetConfig {
    /// Rule for a category.
    pub fn rule(&self, category: Category) -> &CategoryBudget {
        self.categories.get(&category).unwrap_or(&self.fallback)
    }

    /// Replace the rule of a category.
    pub fn with_category(mut self, category: Category, budget: CategoryBudget) -> Self {
        self.categories.insert(category, budget);
        self
    }

    /// Use a different strategy.
    pub fn with_strategy(mut self, strategy: BudgetStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Categories in fitting order: tier rank, then declaration order.
    pub fn fitting_order(&self) -> Vec<Category> {
        let mut order: Vec<Category> = Category::ALL.to_vec();
        order.sort_by_key(|c| (self.rule(*c).tier.rank(), *c));
        order
    }

    /// Compute per-category allocations for `available` tokens.
    pub fn allocate(&self, available: usize) -> BTreeMap<Category, usize> {
        match self.strategy {
            BudgetStrategy::Proportional => Category::ALL
                .iter()
                .map(|c| (*c, self.rule(*c).share_of(available).min(available)))
                .collect(),
            BudgetStrategy::PriorityFirst => {
                let mut remaining = available;
                let mut allocations = BTreeMap::new();
                for category in self.fitting_order() {
                    let granted = self.rule(category).share_of(available).min(remaining);
                    remaining -= granted;
                    allocations.insert(category, granted);
                }
                allocations
            }
            BudgetStrategy::Balanced => self.allocate_balanced(available),
        }
    }

    fn allocate_balanced(&self, available: usize) -> BTreeMap<Category, usize> {
        let mins: usize = Category::ALL.iter().map(|c| self.rule(*c).min_tokens).sum();
        let mut allocations = BTreeMap::new();

        if mins >= available {
            // Not even the minimums fit: scale them down.
            for category in Category::ALL {
                let min = self.rule(category).min_tokens;
                let scaled = if mins == 0 { 0 } else { min * available / mins };
                allocations.insert(category, scaled);
            }
            return allocations;
        }

        let remainder = available - mins;
        let points_sum: usize = Category::ALL
            .iter()
            .map(|c| self.rule(*c).basis_points())
            .sum();

        for category in Category::ALL {
            let rule = self.rule(category);
            let extra = if points_sum > 0 {
                remainder * rule.basis_points() / points_sum
            } else {
                0
            };
            let mut granted = rule.min_tokens + extra;
            if !rule.can_exceed_max {
                granted = granted.min(rule.max_tokens);
            }
            allocations.insert(category, granted);
        }
        allocations
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        use BudgetTier::*;
        let rules = [
            (Category::Identity, CategoryBudget::new(0.05, 100, 4_000, Mandatory, true)),
            (Category::Safety, CategoryBudget::new(0.05, 100, 4_000, Mandatory, true)),
            (Category::Protocol, CategoryBudget::new(0.06, 100, 6_000, Mandatory, true)),
            (Category::Methodology, CategoryBudget::new(0.07, 100, 6_000, High, false)),
            (Category::Hallucination, CategoryBudget::new(0.04, 0, 3_000, High, false)),
            (Category::Language, CategoryBudget::new(0.12, 0, 20_000, High, true)),
            (Category::Context, CategoryBudget::new(0.12, 0, 20_000, High, true)),
            (Category::Framework, CategoryBudget::new(0.10, 0, 15_000, High, false)),
            (Category::Domain, CategoryBudget::new(0.08, 0, 10_000, Medium, false)),
            (Category::Intent, CategoryBudget::new(0.05, 0, 5_000, Medium, false)),
            (Category::Knowledge, CategoryBudget::new(0.08, 0, 10_000, Medium, true)),
            (Category::WorldState, CategoryBudget::new(0.03, 0, 3_000, Medium, false)),
            (Category::BuildLayer, CategoryBudget::new(0.03, 0, 3_000, Medium, false)),
            (Category::Reviewer, CategoryBudget::new(0.02, 0, 3_000, Medium, false)),
            (Category::Exemplar, CategoryBudget::new(0.04, 0, 5_000, Low, false)),
            (Category::Init, CategoryBudget::new(0.02, 0, 2_000, Low, false)),
            (Category::Campaign, CategoryBudget::new(0.02, 0, 2_000, Low, false)),
            (Category::Northstar, CategoryBudget::new(0.01, 0, 1_000, Conditional, false)),
            (Category::Ouroboros, CategoryBudget::new(0.01, 0, 1_000, Conditional, false)),
        ];

        Self {
            strategy: BudgetStrategy::default(),
            categories: rules.into_iter().collect(),
            fallback: CategoryBudget::new(0.0, 0, 0, Conditional, false),
        }
    }
}
