//! Latent-factor trainer capability and the built-in ALS implementation.

/// Alternating least squares trainer and model.
pub mod als;
/// Hyperparameters and search grids.
pub mod params;
/// On-disk model directory layout.
pub mod persist;

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::{dataset::Dataset, error::EngineResult};

pub use als::{AlsModel, AlsTrainer};
pub use params::{HyperparameterGrid, Hyperparameters, ParamMap, ParamValue};

/// Item with its predicted score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoredItem {
    /// Item identifier.
    pub prod_id: u32,
    /// Predicted preference.
    pub score: f32,
}

/// Native top-N output for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecommendations {
    /// User identifier.
    pub user_id: u32,
    /// Items ordered by descending score.
    pub recommendations: Vec<ScoredItem>,
}

/// Trained latent-factor model.
pub trait FactorModel: Send + Sync + fmt::Debug {
    /// Hyperparameters the model was trained with.
    fn params(&self) -> &Hyperparameters;

    /// Number of latent factors.
    fn rank(&self) -> usize;

    /// Users with learned factors, ascending.
    fn users(&self) -> Vec<u32>;

    /// Up to `k` items for `user_id`, best first. Unknown users get an empty list.
    fn recommend_for_user(&self, user_id: u32, k: usize) -> Vec<ScoredItem>;

    /// Up to `k` items for every known user.
    fn recommend_for_all_users(&self, k: usize) -> Vec<UserRecommendations> {
        self.users()
            .into_iter()
            .map(|user_id| UserRecommendations {
                user_id,
                recommendations: self.recommend_for_user(user_id, k),
            })
            .collect()
    }

    /// Writes the model directory.
    fn save(&self, path: &Path) -> EngineResult<()>;
}

/// Fits models from interactions and restores saved ones.
pub trait Trainer: Send + Sync {
    /// Model produced by this trainer.
    type Model: FactorModel;

    /// Trains a model on `dataset`.
    fn fit(&self, dataset: &Dataset, params: &Hyperparameters) -> EngineResult<Self::Model>;

    /// Restores a model written by [`FactorModel::save`].
    fn load(&self, path: &Path) -> EngineResult<Self::Model>;
}

/// Orders by score descending, ties by item id ascending, and keeps the first `k`.
#[must_use]
pub fn top_k(mut scored: Vec<ScoredItem>, k: usize) -> Vec<ScoredItem> {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.prod_id.cmp(&b.prod_id))
    });
    scored.truncate(k);
    scored
}
