use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::TableError;
use crate::weights::WeightTable;

/// A purchasable draw: its price, outcome weights and what each outcome pays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawTable {
    pub id: String,
    pub price: u64,
    pub weights: WeightTable,
    pub payouts: BTreeMap<String, u64>,
}

impl DrawTable {
    pub fn new(
        id: impl Into<String>,
        price: u64,
        weights: WeightTable,
        payouts: BTreeMap<String, u64>,
    ) -> Result<Self, TableError> {
        if let Some(missing) = weights
            .entries()
            .iter()
            .find(|e| !payouts.contains_key(&e.outcome_id))
        {
            return Err(TableError::MissingPayout {
                outcome_id: missing.outcome_id.clone(),
            });
        }
        Ok(Self {
            id: id.into(),
            price,
            weights,
            payouts,
        })
    }

    pub fn payout(&self, outcome_id: &str) -> u64 {
        self.payouts.get(outcome_id).copied().unwrap_or(0)
    }

    /// Built-in cases: gifts weighted by rarity (legendary 1, epic 5, rare 20,
    /// common 74), each case drawing from a subset.
    pub fn defaults() -> Result<Vec<DrawTable>, TableError> {
        const GIFTS: [(&str, i64, u64); 4] = [
            ("gift_common", 74, 25),
            ("gift_rare", 20, 80),
            ("gift_epic", 5, 300),
            ("gift_legendary", 1, 2500),
        ];
        let case = |id: &str, price: u64, pick: &[usize]| {
            let weights = WeightTable::normalize(pick.iter().map(|&i| (GIFTS[i].0, GIFTS[i].1)))?;
            let payouts = pick
                .iter()
                .map(|&i| (GIFTS[i].0.to_string(), GIFTS[i].2))
                .collect();
            DrawTable::new(id, price, weights, payouts)
        };
        [
            case("case_common", 50, &[0, 1]),
            case("case_rare", 150, &[1, 2]),
            case("case_legendary", 500, &[0, 1, 2, 3]),
        ]
        .into_iter()
        .collect()
    }
}

/// Shared lookup of draw tables by id. Tables are replaced wholesale, never
/// mutated, so a draw holding an `Arc<DrawTable>` keeps the exact table it
/// was committed against.
#[derive(Debug, Default, Clone)]
pub struct TableRegistry {
    tables: Arc<RwLock<HashMap<String, Arc<DrawTable>>>>,
}

impl TableRegistry {
    pub fn new(tables: impl IntoIterator<Item = DrawTable>) -> Self {
        let registry = Self::default();
        for t in tables {
            registry.upsert(t);
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<Arc<DrawTable>> {
        self.tables
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn upsert(&self, table: DrawTable) -> Arc<DrawTable> {
        let table = Arc::new(table);
        self.tables
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(table.id.clone(), table.clone());
        table
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let tables = DrawTable::defaults().unwrap();
        assert_eq!(tables.len(), 3);
        let legendary = tables.iter().find(|t| t.id == "case_legendary").unwrap();
        assert_eq!(legendary.weights.total_weight(), 100);
        assert_eq!(legendary.price, 500);
        assert_eq!(legendary.payout("gift_legendary"), 2500);
    }

    #[test]
    fn test_missing_payout_rejected() {
        let weights = WeightTable::normalize([("a", 1), ("b", 1)]).unwrap();
        let payouts = BTreeMap::from([("a".to_string(), 5)]);
        assert!(matches!(
            DrawTable::new("t", 1, weights, payouts),
            Err(TableError::MissingPayout { outcome_id }) if outcome_id == "b"
        ));
    }

    #[test]
    fn test_upsert_keeps_old_arc() {
        let registry = TableRegistry::new(DrawTable::defaults().unwrap());
        let before = registry.get("case_common").unwrap();
        let mut changed = (*before).clone();
        changed.price = 75;
        registry.upsert(changed);
        assert_eq!(before.price, 50);
        assert_eq!(registry.get("case_common").unwrap().price, 75);
        assert_eq!(registry.ids(), vec!["case_common", "case_legendary", "case_rare"]);
    }
}
