//! K-fold grid search over trainer hyperparameters, scored by ranking overlap.

/// Per-user ranking tables.
pub mod ranking;

use std::{sync::Arc, time::Instant};

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::Serialize;
use serde_json::json;

use crate::{
    config::CrossValidationSettings,
    dataset::Dataset,
    engine::RecommendationEngine,
    error::{EngineError, EngineResult},
    trainer::{
        AlsTrainer, FactorModel, HyperparameterGrid, Hyperparameters, ParamMap, Trainer,
        UserRecommendations,
    },
};

pub use ranking::{RankingTable, RecommendationTable, RelevanceTable};

/// One fold: disjoint train and test partitions whose union is the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// Rows outside the held-out fold.
    pub train: Dataset,
    /// Held-out fold.
    pub test: Dataset,
}

/// Fold scores and their mean for one grid point.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GridScore {
    /// Grid point as requested.
    pub params: ParamMap,
    /// Score per fold, in fold order.
    pub fold_scores: Vec<f64>,
    /// Mean of `fold_scores`.
    pub mean: f64,
}

/// Grid search driven through one engine. Results persist until the next [`CrossValidation::fit`].
pub struct CrossValidation<'e, T: Trainer = AlsTrainer> {
    engine: &'e RecommendationEngine<T>,
    settings: CrossValidationSettings,
    best_params: Option<ParamMap>,
    best_hyperparameters: Option<Hyperparameters>,
    best_model: Option<Arc<T::Model>>,
    results: Vec<GridScore>,
}

impl<T: Trainer> std::fmt::Debug for CrossValidation<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossValidation")
            .field("settings", &self.settings)
            .field("best_params", &self.best_params)
            .field("combinations", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl<'e, T: Trainer> CrossValidation<'e, T> {
    /// Binds to `engine`, taking its configured tuning settings.
    #[must_use]
    pub fn new(engine: &'e RecommendationEngine<T>) -> Self {
        Self {
            engine,
            settings: engine.cv_settings().clone(),
            best_params: None,
            best_hyperparameters: None,
            best_model: None,
            results: Vec::new(),
        }
    }

    /// Replaces the tuning settings.
    #[must_use]
    pub fn with_settings(mut self, settings: CrossValidationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &CrossValidationSettings {
        &self.settings
    }

    /// Shuffles row positions with the configured seed and deals them into `n_splits` folds;
    /// the first `len % n_splits` folds take one extra row.
    pub fn create_splits(&self, dataset: &Dataset, n_splits: usize) -> EngineResult<Vec<Split>> {
        let n_rows = dataset.len();
        if n_splits < 2 {
            return Err(EngineError::Value(format!(
                "number of folds must be at least 2, got {n_splits}"
            )));
        }
        if n_splits > n_rows {
            return Err(EngineError::Value(format!(
                "cannot split {n_rows} rows into {n_splits} folds"
            )));
        }
        let mut order: Vec<usize> = (0..n_rows).collect();
        order.shuffle(&mut SmallRng::seed_from_u64(self.settings.seed));

        let fold_size = n_rows / n_splits;
        let remainder = n_rows % n_splits;
        let mut splits = Vec::with_capacity(n_splits);
        let mut start = 0;
        for fold in 0..n_splits {
            let end = start + fold_size + usize::from(fold < remainder);
            let mut test = order[start..end].to_vec();
            let mut train: Vec<usize> =
                order[..start].iter().chain(&order[end..]).copied().collect();
            test.sort_unstable();
            train.sort_unstable();
            splits.push(Split {
                train: dataset.select(&train),
                test: dataset.select(&test),
            });
            start = end;
        }
        Ok(splits)
    }

    /// Expands the grid into trainer configurations over the engine's current defaults,
    /// paired with the grid point each was built from.
    pub fn build_models(
        &self,
        grid: &HyperparameterGrid,
    ) -> EngineResult<(Vec<Hyperparameters>, Vec<ParamMap>)> {
        if grid.is_empty() {
            return Err(EngineError::Value("hyperparameter grid is empty".into()));
        }
        for name in grid.names() {
            if !Hyperparameters::accepts(name) {
                return Err(EngineError::Value(format!(
                    "unknown hyperparameter {name}; accepted: {}",
                    Hyperparameters::ACCEPTED.join(", ")
                )));
            }
            if grid.get(name).is_some_and(<[_]>::is_empty) {
                return Err(EngineError::Value(format!(
                    "hyperparameter {name} has no candidate values"
                )));
            }
        }
        let base = self.engine.hyperparameters();
        let points = grid.expand();
        let configs = points
            .iter()
            .map(|point| base.with_overrides(point))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok((configs, points))
    }

    /// Each user's items by rating descending (ties by item id), cut to `top_k`.
    #[must_use]
    pub fn process_relevance(&self, dataset: &Dataset) -> RelevanceTable {
        let mut table = RankingTable::relevance();
        for (user, mut rows) in dataset.by_user() {
            rows.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.prod_id.cmp(&b.prod_id)));
            table.insert(
                user,
                rows.iter()
                    .take(self.settings.top_k)
                    .map(|row| row.prod_id)
                    .collect(),
            );
        }
        table
    }

    /// Item ids of the model's native top-N output, order preserved.
    #[must_use]
    pub fn process_recommendation(&self, raw: &[UserRecommendations]) -> RecommendationTable {
        let mut table = RankingTable::recommendations();
        for user in raw {
            table.insert(
                user.user_id,
                user.recommendations.iter().map(|item| item.prod_id).collect(),
            );
        }
        table
    }

    /// Mean over relevance users of `|relevant ∩ recommended| / |relevant|`.
    ///
    /// A relevance user missing from `recommendations` scores 0; users only in
    /// `recommendations` are ignored; an empty relevance table scores 0.0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(recommendations: &RecommendationTable, relevance: &RelevanceTable) -> f64 {
        if relevance.is_empty() {
            return 0.0;
        }
        let total: f64 = relevance
            .iter()
            .map(|(user, relevant)| {
                if relevant.is_empty() {
                    return 0.0;
                }
                let Some(recommended) = recommendations.get(user) else {
                    return 0.0;
                };
                let hits = relevant
                    .iter()
                    .filter(|item| recommended.contains(*item))
                    .count();
                hits as f64 / relevant.len() as f64
            })
            .sum();
        total / relevance.len() as f64
    }

    /// Grid search over `grid` with `n_folds` folds of the engine's current dataset, then
    /// retrains the winning configuration on the full transformed dataset.
    ///
    /// Ties on mean score keep the earliest grid point.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(
        &mut self,
        n_folds: usize,
        grid: &HyperparameterGrid,
        scale: bool,
    ) -> EngineResult<Arc<T::Model>> {
        let started = Instant::now();
        let engine = self.engine;
        let dataset = engine
            .get_data()
            .ok_or_else(|| EngineError::Training("no dataset is loaded".into()))?;
        if dataset.is_empty() {
            return Err(EngineError::Training("loaded dataset is empty".into()));
        }
        let dataset = engine.transform_dataset(&dataset, scale)?;
        let splits = self.create_splits(&dataset, n_folds)?;
        let (configs, points) = self.build_models(grid)?;
        let telemetry = engine.telemetry();

        let mut results = Vec::with_capacity(points.len());
        for (combination, (config, point)) in configs.iter().zip(points).enumerate() {
            let mut fold_scores = Vec::with_capacity(splits.len());
            for (fold, split) in splits.iter().enumerate() {
                let model = engine.fit(&split.train, config)?;
                let relevance = self.process_relevance(&split.test);
                let recommendations = self
                    .process_recommendation(&model.recommend_for_all_users(self.settings.top_k));
                let score = Self::score(&recommendations, &relevance);
                telemetry.record(
                    "cv.fold_scored",
                    json!({ "combination": combination, "fold": fold, "score": score }),
                );
                fold_scores.push(score);
            }
            let mean = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            telemetry.record(
                "cv.combination_scored",
                json!({ "combination": combination, "params": &point, "mean": mean }),
            );
            results.push(GridScore {
                params: point,
                fold_scores,
                mean,
            });
        }

        let mut best = 0;
        for (idx, result) in results.iter().enumerate().skip(1) {
            if result.mean > results[best].mean {
                best = idx;
            }
        }
        let best_config = configs[best].clone();
        let model = Arc::new(engine.fit(&dataset, &best_config)?);
        telemetry.record(
            "cv.best_selected",
            json!({
                "params": &results[best].params,
                "mean": results[best].mean,
                "folds": n_folds,
                "combinations": results.len(),
                "elapsed_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        );

        self.best_params = Some(results[best].params.clone());
        self.best_hyperparameters = Some(best_config);
        self.best_model = Some(Arc::clone(&model));
        self.results = results;
        Ok(model)
    }

    /// Winning grid point of the last fit.
    #[must_use]
    pub const fn best_params(&self) -> Option<&ParamMap> {
        self.best_params.as_ref()
    }

    /// Full hyperparameters of the winning configuration.
    #[must_use]
    pub const fn best_hyperparameters(&self) -> Option<&Hyperparameters> {
        self.best_hyperparameters.as_ref()
    }

    /// Model retrained on the full dataset with the winning configuration.
    #[must_use]
    pub fn best_model(&self) -> Option<Arc<T::Model>> {
        self.best_model.clone()
    }

    /// Per-combination scores of the last fit, in grid order.
    #[must_use]
    pub fn cv_results(&self) -> &[GridScore] {
        &self.results
    }
}
