//! Seeded synthetic interactions for tests.

use rand::{rngs::SmallRng, seq::index, Rng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::dataset::{Dataset, Interaction};

/// Each user rates between 2 and `items - 2` distinct items; ratings peak where the user's
/// relative position matches the item's.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn synthetic_interactions(users: u32, items: u32, seed: u64) -> Vec<Interaction> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let span = |count: u32| f64::from(count.saturating_sub(1).max(1));
    let mut rows = Vec::new();
    for user_id in 0..users {
        let upper = items.saturating_sub(2).max(2).min(items);
        let count = rng.gen_range(upper.min(2)..=upper) as usize;
        let mut picked: Vec<u32> = index::sample(&mut rng, items as usize, count)
            .into_iter()
            .map(|idx| idx as u32)
            .collect();
        picked.sort_unstable();
        for prod_id in picked {
            let similarity =
                1.0 - (f64::from(user_id) / span(users) - f64::from(prod_id) / span(items)).abs();
            let jitter: f64 = rng.gen_range(-2.0..=2.0);
            let rating = similarity.mul_add(100.0, jitter).clamp(1.0, 100.0) as i64;
            rows.push(Interaction {
                user_id,
                prod_id,
                rating,
            });
        }
    }
    rows
}

pub fn synthetic_dataset(users: u32, items: u32, seed: u64) -> Dataset {
    Dataset::from_interactions(synthetic_interactions(users, items, seed))
        .expect("generated pairs are unique")
}

/// Row-oriented JSON records.
pub fn synthetic_records(users: u32, items: u32, seed: u64) -> String {
    synthetic_dataset(users, items, seed)
        .to_json_records()
        .expect("records serialize")
}

/// Column-oriented JSON keyed by row label, the layout dataframe exporters emit.
pub fn synthetic_columns(users: u32, items: u32, seed: u64) -> String {
    let rows = synthetic_interactions(users, items, seed);
    let mut user_col = Map::new();
    let mut prod_col = Map::new();
    let mut rating_col = Map::new();
    for (idx, row) in rows.iter().enumerate() {
        user_col.insert(idx.to_string(), json!(row.user_id));
        prod_col.insert(idx.to_string(), json!(row.prod_id));
        rating_col.insert(idx.to_string(), json!(row.rating));
    }
    json!({
        "prod_id": Value::Object(prod_col),
        "rating": Value::Object(rating_col),
        "user_id": Value::Object(user_col),
    })
    .to_string()
}
