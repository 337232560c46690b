use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TableError;

/// Largest total weight accepted by [`WeightTable::normalize`].
pub const MAX_TOTAL_WEIGHT: u64 = 1 << 53;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub outcome_id: String,
    pub weight: u64,
}

/// Ordered, validated outcome weights. Entry order is part of the table's
/// identity and is never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeightTable {
    entries: Vec<WeightEntry>,
    #[serde(skip)]
    bounds: Vec<(u64, u64)>,
    total: u64,
}

impl WeightTable {
    /// Validate raw `(outcome, weight)` pairs. Weights come in signed so that
    /// zero and negative inputs from config or requests are reported rather
    /// than wrapped.
    pub fn normalize<I, S>(entries: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut out: Vec<WeightEntry> = Vec::new();
        let mut bounds = Vec::new();
        let mut total: u64 = 0;
        for (outcome, weight) in entries {
            let outcome_id = outcome.into();
            if weight <= 0 {
                return Err(TableError::NonPositiveWeight { outcome_id, weight });
            }
            if out.iter().any(|e| e.outcome_id == outcome_id) {
                return Err(TableError::DuplicateOutcome { outcome_id });
            }
            let weight = weight as u64;
            let upper = total
                .checked_add(weight)
                .filter(|t| *t <= MAX_TOTAL_WEIGHT)
                .ok_or(TableError::Overflow)?;
            bounds.push((total, upper));
            total = upper;
            out.push(WeightEntry { outcome_id, weight });
        }
        if out.is_empty() {
            return Err(TableError::EmptyTable);
        }
        Ok(Self {
            entries: out,
            bounds,
            total,
        })
    }

    pub fn entries(&self) -> &[WeightEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    /// Half-open `[lower, upper)` interval of each entry within `[0, total)`.
    pub fn cumulative_bounds(&self) -> &[(u64, u64)] {
        &self.bounds
    }

    /// Index of the first entry whose interval contains `point`.
    pub fn locate(&self, point: u64) -> Option<usize> {
        if point >= self.total {
            return None;
        }
        let idx = self.bounds.partition_point(|&(_, upper)| upper <= point);
        debug_assert!(self.bounds[idx].0 <= point && point < self.bounds[idx].1);
        Some(idx)
    }

    pub fn contains(&self, outcome_id: &str) -> bool {
        self.entries.iter().any(|e| e.outcome_id == outcome_id)
    }

    /// Canonical encoding: for each entry in order, a big-endian u32 id length,
    /// the id bytes, then the big-endian u64 weight.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 24);
        for e in &self.entries {
            buf.extend_from_slice(&(e.outcome_id.len() as u32).to_be_bytes());
            buf.extend_from_slice(e.outcome_id.as_bytes());
            buf.extend_from_slice(&e.weight.to_be_bytes());
        }
        buf
    }

    /// Hex SHA-256 of [`canonical_bytes`](Self::canonical_bytes).
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }
}

impl<'de> Deserialize<'de> for WeightTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            outcome_id: String,
            weight: i64,
        }
        #[derive(Deserialize)]
        struct Wire {
            entries: Vec<Raw>,
        }
        let wire = Wire::deserialize(deserializer)?;
        WeightTable::normalize(wire.entries.into_iter().map(|r| (r.outcome_id, r.weight)))
            .map_err(serde::de::Error::custom)
    }
}
