use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use chrono::Utc;
use ndarray::{Array1, Array2, ArrayView1};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use uuid::Uuid;

use super::{
    params::Hyperparameters,
    persist::{self, ModelMetadata, ITEM_FACTORS, USER_FACTORS},
    top_k, FactorModel, ScoredItem, Trainer,
};
use crate::{
    dataset::Dataset,
    error::{EngineError, EngineResult},
};

const MODEL_CLASS: &str = "AlsModel";
/// Replaces non-positive Cholesky pivots so rank-deficient systems still solve.
const PIVOT_FLOOR: f64 = 1e-10;

/// Alternating least squares trainer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlsTrainer;

/// User and item factor matrices learned by [`AlsTrainer`].
#[derive(Debug, Clone)]
pub struct AlsModel {
    uid: Uuid,
    params: Hyperparameters,
    user_ids: Vec<u32>,
    user_index: HashMap<u32, usize>,
    user_factors: Array2<f32>,
    item_ids: Vec<u32>,
    item_factors: Array2<f32>,
}

impl AlsModel {
    fn from_parts(
        uid: Uuid,
        params: Hyperparameters,
        user_ids: Vec<u32>,
        user_factors: Array2<f32>,
        item_ids: Vec<u32>,
        item_factors: Array2<f32>,
    ) -> Self {
        let user_index = user_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx))
            .collect();
        Self {
            uid,
            params,
            user_ids,
            user_index,
            user_factors,
            item_ids,
            item_factors,
        }
    }

    /// Model identifier, stable across save/load.
    #[must_use]
    pub const fn uid(&self) -> Uuid {
        self.uid
    }

    /// Items with learned factors, ascending.
    #[must_use]
    pub fn items(&self) -> &[u32] {
        &self.item_ids
    }

    /// Latent vector of a user.
    #[must_use]
    pub fn user_vector(&self, user_id: u32) -> Option<ArrayView1<'_, f32>> {
        self.user_index
            .get(&user_id)
            .map(|&row| self.user_factors.row(row))
    }
}

impl FactorModel for AlsModel {
    fn params(&self) -> &Hyperparameters {
        &self.params
    }

    fn rank(&self) -> usize {
        self.user_factors.ncols()
    }

    fn users(&self) -> Vec<u32> {
        self.user_ids.clone()
    }

    fn recommend_for_user(&self, user_id: u32, k: usize) -> Vec<ScoredItem> {
        if k == 0 {
            return Vec::new();
        }
        let Some(user) = self.user_vector(user_id) else {
            return Vec::new();
        };
        let scores = self.item_factors.dot(&user);
        let scored = self
            .item_ids
            .iter()
            .zip(scores.iter())
            .map(|(&prod_id, &score)| ScoredItem { prod_id, score })
            .collect();
        top_k(scored, k)
    }

    fn save(&self, path: &Path) -> EngineResult<()> {
        let metadata = ModelMetadata {
            format_version: persist::FORMAT_VERSION,
            class: MODEL_CLASS.into(),
            uid: self.uid,
            timestamp: Utc::now(),
            rank: self.rank(),
            num_users: self.user_ids.len(),
            num_items: self.item_ids.len(),
            params: self.params.clone(),
        };
        let users = factor_rows(&self.user_ids, &self.user_factors, path)?;
        let items = factor_rows(&self.item_ids, &self.item_factors, path)?;
        persist::write_layout(path, &metadata, users.into_iter(), items.into_iter())
    }
}

fn factor_rows<'a>(
    ids: &[u32],
    factors: &'a Array2<f32>,
    path: &Path,
) -> EngineResult<Vec<(u32, &'a [f32])>> {
    let values = factors
        .as_slice()
        .ok_or_else(|| EngineError::persistence(path, "factor matrix is not contiguous"))?;
    Ok(ids
        .iter()
        .copied()
        .zip(values.chunks(factors.ncols().max(1)))
        .collect())
}

impl Trainer for AlsTrainer {
    type Model = AlsModel;

    #[allow(clippy::cast_precision_loss)]
    fn fit(&self, dataset: &Dataset, params: &Hyperparameters) -> EngineResult<AlsModel> {
        params.validate()?;
        if dataset.is_empty() {
            return Err(EngineError::Training(
                "cannot fit a model on an empty dataset".into(),
            ));
        }
        let user_ids: Vec<u32> = dataset.users().into_iter().collect();
        let item_ids: Vec<u32> = dataset.items().into_iter().collect();
        let user_pos: HashMap<u32, usize> =
            user_ids.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();
        let item_pos: HashMap<u32, usize> =
            item_ids.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();

        let mut by_user: Vec<Vec<(usize, f64)>> = vec![Vec::new(); user_ids.len()];
        let mut by_item: Vec<Vec<(usize, f64)>> = vec![Vec::new(); item_ids.len()];
        for row in dataset.rows() {
            let (user, item) = (user_pos[&row.user_id], item_pos[&row.prod_id]);
            by_user[user].push((item, row.rating as f64));
            by_item[item].push((user, row.rating as f64));
        }
        // Row order must not change the floating point sums.
        for observed in by_user.iter_mut().chain(by_item.iter_mut()) {
            observed.sort_unstable_by_key(|(idx, _)| *idx);
        }

        let mut rng = SmallRng::seed_from_u64(params.seed);
        let mut user_factors = init_factors(user_ids.len(), params.rank, &mut rng);
        let mut item_factors = init_factors(item_ids.len(), params.rank, &mut rng);
        for _ in 0..params.max_iter {
            user_factors = solve_side(&item_factors, &by_user, params);
            item_factors = solve_side(&user_factors, &by_item, params);
        }

        Ok(AlsModel::from_parts(
            Uuid::new_v4(),
            params.clone(),
            user_ids,
            user_factors,
            item_ids,
            item_factors,
        ))
    }

    fn load(&self, path: &Path) -> EngineResult<AlsModel> {
        persist::check_layout(path)?;
        let metadata = persist::read_metadata(path)?;
        if metadata.class != MODEL_CLASS {
            return Err(EngineError::persistence(
                path,
                format!("expected a {MODEL_CLASS} directory, found {}", metadata.class),
            ));
        }
        let rank = metadata.rank;
        let (user_ids, user_factors) =
            stack_factors(persist::read_factors(path, USER_FACTORS, rank)?, rank, path)?;
        let (item_ids, item_factors) =
            stack_factors(persist::read_factors(path, ITEM_FACTORS, rank)?, rank, path)?;
        let mut seen = HashSet::with_capacity(user_ids.len());
        if let Some(user) = user_ids.iter().find(|&&user| !seen.insert(user)) {
            return Err(EngineError::persistence(
                path,
                format!("user {user} appears more than once in user factors"),
            ));
        }
        if !item_ids.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(EngineError::persistence(
                path,
                "item factors are not in ascending id order",
            ));
        }
        Ok(AlsModel::from_parts(
            metadata.uid,
            metadata.params,
            user_ids,
            user_factors,
            item_ids,
            item_factors,
        ))
    }
}

fn stack_factors(
    rows: Vec<persist::FactorRow>,
    rank: usize,
    path: &Path,
) -> EngineResult<(Vec<u32>, Array2<f32>)> {
    let mut ids = Vec::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len() * rank);
    for row in rows {
        ids.push(row.id);
        values.extend(row.features);
    }
    let factors = Array2::from_shape_vec((ids.len(), rank), values)
        .map_err(|err| EngineError::persistence(path, err))?;
    Ok((ids, factors))
}

#[allow(clippy::cast_precision_loss)]
fn init_factors(rows: usize, rank: usize, rng: &mut SmallRng) -> Array2<f32> {
    let scale = (rank as f32).sqrt();
    Array2::from_shape_fn((rows, rank), |_| rng.gen::<f32>() / scale)
}

/// Solves every row of one side with the other side's factors held fixed.
///
/// Explicit: `(Yᵤᵀ Yᵤ + λ nᵤ I) x = Yᵤᵀ r`.
/// Implicit: `(YᵀY + Yᵀ(Cᵤ − I)Y + λ nᵤ I) x = Yᵀ Cᵤ p`, with `c = 1 + α|r|` and `p = [r > 0]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn solve_side(
    fixed: &Array2<f32>,
    observations: &[Vec<(usize, f64)>],
    params: &Hyperparameters,
) -> Array2<f32> {
    let rank = fixed.ncols();
    let fixed64 = fixed.mapv(f64::from);
    let gram = if params.implicit_prefs {
        fixed64.t().dot(&fixed64)
    } else {
        Array2::zeros((rank, rank))
    };
    let mut solved = Array2::<f32>::zeros((observations.len(), rank));
    for (row, observed) in observations.iter().enumerate() {
        if observed.is_empty() {
            continue;
        }
        let mut lhs = gram.clone();
        let mut rhs = Array1::<f64>::zeros(rank);
        for &(col, rating) in observed {
            let (weight, target) = if params.implicit_prefs {
                let confidence = params.alpha.mul_add(rating.abs(), 1.0);
                let preference = if rating > 0.0 { confidence } else { 0.0 };
                (confidence - 1.0, preference)
            } else {
                (1.0, rating)
            };
            let y = fixed64.row(col);
            for p in 0..rank {
                rhs[p] += target * y[p];
                for q in 0..rank {
                    lhs[[p, q]] += weight * y[p] * y[q];
                }
            }
        }
        let lambda = params.reg_param * observed.len() as f64;
        for p in 0..rank {
            lhs[[p, p]] += lambda;
        }
        let x = cholesky_solve(lhs, rhs);
        for p in 0..rank {
            solved[[row, p]] = x[p] as f32;
        }
    }
    solved
}

/// Solves `A x = b` for symmetric positive (semi-)definite `A` via `A = L Lᵀ`.
fn cholesky_solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Array1<f64> {
    let n = b.len();
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= a[[j, k]] * a[[j, k]];
        }
        let pivot = diag.max(PIVOT_FLOOR).sqrt();
        a[[j, j]] = pivot;
        for i in (j + 1)..n {
            let mut value = a[[i, j]];
            for k in 0..j {
                value -= a[[i, k]] * a[[j, k]];
            }
            a[[i, j]] = value / pivot;
        }
    }
    for i in 0..n {
        let mut value = b[i];
        for k in 0..i {
            value -= a[[i, k]] * b[k];
        }
        b[i] = value / a[[i, i]];
    }
    for i in (0..n).rev() {
        let mut value = b[i];
        for k in (i + 1)..n {
            value -= a[[k, i]] * b[k];
        }
        b[i] = value / a[[i, i]];
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::Interaction, test_support::synthetic_dataset};
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn cholesky_solves_spd_system() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![2.0, 1.0];
        let x = cholesky_solve(a, b);
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);
    }

    #[test]
    fn training_is_deterministic() {
        let dataset = synthetic_dataset(20, 15, 7);
        let params = Hyperparameters {
            rank: 4,
            ..Hyperparameters::default()
        };
        let first = AlsTrainer.fit(&dataset, &params).unwrap();
        let second = AlsTrainer.fit(&dataset, &params).unwrap();
        assert_eq!(
            first.recommend_for_all_users(5),
            second.recommend_for_all_users(5)
        );
    }

    #[test]
    fn explicit_model_fits_observed_ratings() {
        let rows = vec![
            Interaction { user_id: 0, prod_id: 0, rating: 5 },
            Interaction { user_id: 0, prod_id: 1, rating: 1 },
            Interaction { user_id: 1, prod_id: 0, rating: 5 },
            Interaction { user_id: 1, prod_id: 1, rating: 1 },
        ];
        let dataset = Dataset::from_interactions(rows).unwrap();
        let params = Hyperparameters {
            rank: 2,
            max_iter: 20,
            reg_param: 0.01,
            implicit_prefs: false,
            ..Hyperparameters::default()
        };
        let model = AlsTrainer.fit(&dataset, &params).unwrap();
        let ranked = model.recommend_for_user(0, 2);
        assert_eq!(ranked[0].prod_id, 0);
        assert!(ranked[0].score > ranked[1].score);
        let top = model.recommend_for_user(1, 1);
        assert_eq!(top[0].prod_id, 0);
    }

    #[test]
    fn recommendations_are_bounded_and_ordered() {
        let dataset = synthetic_dataset(10, 50, 3);
        let model = AlsTrainer.fit(&dataset, &Hyperparameters::default()).unwrap();
        for user in model.recommend_for_all_users(20) {
            assert!(user.recommendations.len() <= 20);
            assert!(user
                .recommendations
                .windows(2)
                .all(|pair| pair[0].score >= pair[1].score));
        }
        assert!(model.recommend_for_user(9_999, 5).is_empty());
        assert!(model.recommend_for_user(0, 0).is_empty());
    }

    #[test]
    fn save_load_round_trip_preserves_rankings() {
        let dataset = synthetic_dataset(12, 30, 11);
        let model = AlsTrainer.fit(&dataset, &Hyperparameters::default()).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_model");
        model.save(&path).unwrap();
        let restored = AlsTrainer.load(&path).unwrap();
        assert_eq!(restored.uid(), model.uid());
        assert_eq!(restored.params(), model.params());
        assert_eq!(
            restored.recommend_for_all_users(20),
            model.recommend_for_all_users(20)
        );
    }

    #[test]
    fn load_rejects_repeated_user_ids() {
        let dataset = synthetic_dataset(6, 10, 3);
        let model = AlsTrainer.fit(&dataset, &Hyperparameters::default()).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_model");
        model.save(&path).unwrap();
        let users = path.join(USER_FACTORS);
        let lines = std::fs::read_to_string(&users).unwrap();
        let first = lines.lines().next().unwrap().to_string();
        std::fs::write(&users, format!("{}\n{first}\n", lines.trim_end())).unwrap();
        let err = AlsTrainer.load(&path).unwrap_err();
        assert_eq!(err.tag(), "persistence_error");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn empty_dataset_is_a_training_error() {
        let err = AlsTrainer
            .fit(&Dataset::default(), &Hyperparameters::default())
            .unwrap_err();
        assert_eq!(err.tag(), "training_error");
    }
}
