//! Price-level map for one side of one binary market.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer price in cents, `0..=100` for a binary contract.
pub type Cents = i64;

/// Resting size in contracts.
pub type Contracts = i64;

/// Upper bound of the binary price range.
pub const MAX_PRICE_CENTS: Cents = 100;

/// Side of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Yes,
    No,
}

impl BookSide {
    /// Parse a feed side string (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// What a delta did to its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelChange {
    /// Level was absent and now rests with positive size.
    Inserted,
    /// Level existed and still has positive size.
    Updated,
    /// Level reached size <= 0 and was removed.
    Removed,
    /// Level was absent and the delta left it non-positive.
    Unchanged,
}

/// Mapping price -> resting size. Every stored size is strictly positive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceLevelMap {
    levels: BTreeMap<Cents, Contracts>,
}

impl PriceLevelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(price, size)` pairs. Later duplicates overwrite earlier ones;
    /// non-positive sizes are not stored.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Cents, Contracts)>,
    {
        let mut levels = BTreeMap::new();
        for (price, size) in pairs {
            if size > 0 {
                levels.insert(price, size);
            } else {
                levels.remove(&price);
            }
        }
        Self { levels }
    }

    /// Size resting at `price`, 0 if absent.
    #[inline]
    pub fn size_at(&self, price: Cents) -> Contracts {
        self.levels.get(&price).copied().unwrap_or(0)
    }

    /// Add a signed size change at `price`.
    ///
    /// The sum saturates instead of wrapping; a result <= 0 removes the level.
    pub fn apply_delta(&mut self, price: Cents, delta: Contracts) -> LevelChange {
        let current = self.levels.get(&price).copied();
        let new_size = current.unwrap_or(0).saturating_add(delta);

        match (current, new_size > 0) {
            (Some(_), false) => {
                self.levels.remove(&price);
                LevelChange::Removed
            }
            (None, false) => LevelChange::Unchanged,
            (Some(_), true) => {
                self.levels.insert(price, new_size);
                LevelChange::Updated
            }
            (None, true) => {
                self.levels.insert(price, new_size);
                LevelChange::Inserted
            }
        }
    }

    /// Highest-priced level.
    #[inline]
    pub fn best(&self) -> Option<(Cents, Contracts)> {
        self.levels.iter().next_back().map(|(&p, &s)| (p, s))
    }

    /// Levels ascending by price.
    pub fn to_pairs(&self) -> Vec<[i64; 2]> {
        self.levels.iter().map(|(&p, &s)| [p, s]).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Cents, Contracts)> + '_ {
        self.levels.iter().map(|(&p, &s)| (p, s))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Total resting size across all levels.
    pub fn depth(&self) -> Contracts {
        self.levels.values().fold(0, |acc, &s| acc.saturating_add(s))
    }
}
