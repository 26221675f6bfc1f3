//! Validated interaction table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{error::InputDataError, schema::REQUIRED_COLUMNS};

/// Upper bound of the rescaled rating range.
pub const SCALED_MAX: i64 = 100;

/// One `(user, item, rating)` observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Interaction {
    /// User identifier.
    pub user_id: u32,
    /// Item identifier.
    pub prod_id: u32,
    /// Observed rating.
    pub rating: i64,
}

/// How ratings are min-max rescaled to `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    /// Dataset-wide minimum and maximum.
    #[default]
    Global,
    /// Each user's own minimum and maximum.
    PerUser,
}

/// Interactions with unique `(user_id, prod_id)` pairs, columns fixed to
/// `(user_id, prod_id, rating)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Dataset {
    rows: Vec<Interaction>,
}

impl Dataset {
    /// Builds a dataset, rejecting repeated `(user_id, prod_id)` pairs.
    pub fn from_interactions(rows: Vec<Interaction>) -> Result<Self, InputDataError> {
        let mut seen: HashMap<(u32, u32), usize> = HashMap::with_capacity(rows.len());
        let mut first_duplicate = None;
        let mut duplicates = 0;
        for row in &rows {
            let count = seen.entry((row.user_id, row.prod_id)).or_insert(0);
            *count += 1;
            if *count > 1 {
                duplicates += 1;
                first_duplicate.get_or_insert((row.user_id, row.prod_id));
            }
        }
        if let Some((user_id, prod_id)) = first_duplicate {
            return Err(InputDataError::duplicate_pair(user_id, prod_id, duplicates));
        }
        Ok(Self { rows })
    }

    /// Column names, always in `(user_id, prod_id, rating)` order.
    #[must_use]
    pub const fn columns(&self) -> [&'static str; 3] {
        REQUIRED_COLUMNS
    }

    /// Rows in load order.
    #[must_use]
    pub fn rows(&self) -> &[Interaction] {
        &self.rows
    }

    /// Number of interactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no interactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct users, ascending.
    #[must_use]
    pub fn users(&self) -> BTreeSet<u32> {
        self.rows.iter().map(|row| row.user_id).collect()
    }

    /// Distinct items, ascending.
    #[must_use]
    pub fn items(&self) -> BTreeSet<u32> {
        self.rows.iter().map(|row| row.prod_id).collect()
    }

    /// Rows grouped by user.
    #[must_use]
    pub fn by_user(&self) -> BTreeMap<u32, Vec<Interaction>> {
        let mut groups: BTreeMap<u32, Vec<Interaction>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(row.user_id).or_default().push(*row);
        }
        groups
    }

    /// Observed `(min, max)` rating.
    #[must_use]
    pub fn rating_bounds(&self) -> Option<(i64, i64)> {
        bounds(self.rows.iter().map(|row| row.rating))
    }

    /// Rows at the given positions, in the given order. Out-of-range positions are skipped.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            rows: indices
                .iter()
                .filter_map(|&idx| self.rows.get(idx).copied())
                .collect(),
        }
    }

    /// Bernoulli sample without replacement; deterministic for a given seed.
    #[must_use]
    pub fn sample(&self, fraction: f64, seed: u64) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut rng = SmallRng::seed_from_u64(seed);
        Self {
            rows: self
                .rows
                .iter()
                .filter(|_| rng.gen_bool(fraction))
                .copied()
                .collect(),
        }
    }

    /// Copy with ratings min-max rescaled to `[0, 100]`:
    /// `round((rating - min) / (max - min) * 100)`, or 100 when `min == max`.
    #[must_use]
    pub fn rescaled(&self, mode: ScaleMode) -> Self {
        let rows = match mode {
            ScaleMode::Global => {
                let range = self.rating_bounds();
                self.rows
                    .iter()
                    .map(|row| Interaction {
                        rating: range.map_or(SCALED_MAX, |range| scale_rating(row.rating, range)),
                        ..*row
                    })
                    .collect()
            }
            ScaleMode::PerUser => {
                let ranges: HashMap<u32, (i64, i64)> = self
                    .by_user()
                    .into_iter()
                    .filter_map(|(user, rows)| {
                        bounds(rows.iter().map(|row| row.rating)).map(|range| (user, range))
                    })
                    .collect();
                self.rows
                    .iter()
                    .map(|row| Interaction {
                        rating: ranges
                            .get(&row.user_id)
                            .map_or(SCALED_MAX, |range| scale_rating(row.rating, *range)),
                        ..*row
                    })
                    .collect()
            }
        };
        Self { rows }
    }

    /// Row-oriented JSON records.
    pub fn to_json_records(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.rows)
    }
}

fn bounds(ratings: impl Iterator<Item = i64>) -> Option<(i64, i64)> {
    ratings.fold(None, |acc, rating| match acc {
        None => Some((rating, rating)),
        Some((min, max)) => Some((min.min(rating), max.max(rating))),
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn scale_rating(rating: i64, (min, max): (i64, i64)) -> i64 {
    if max == min {
        return SCALED_MAX;
    }
    let offset = i128::from(rating) - i128::from(min);
    let span = i128::from(max) - i128::from(min);
    (offset as f64 / span as f64 * SCALED_MAX as f64).round() as i64
}
