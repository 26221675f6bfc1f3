use std::{collections::HashSet, fmt, path::Path, sync::Arc, time::Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::{
    config::{CrossValidationSettings, DataSettings, EngineConfig},
    cross_validation::{CrossValidation, RankingTable, RecommendationTable},
    dataset::Dataset,
    error::{EngineError, EngineResult},
    schema::{Frame, Validator},
    telemetry::EngineTelemetry,
    trainer::{AlsTrainer, FactorModel, HyperparameterGrid, Hyperparameters, Trainer},
};

struct EngineState<M> {
    dataset: Option<Arc<Dataset>>,
    model: Option<Arc<M>>,
    hyperparameters: Hyperparameters,
}

/// Stateful orchestrator owning the current dataset and model.
///
/// Writers (`load_data`, `train_model`, `tune_model`, `load_model`) run one at a time.
/// State is published by swapping `Arc`s, so readers see either the previous or the new
/// model, never a partial one. A failed write leaves the previous state untouched.
pub struct RecommendationEngine<T: Trainer = AlsTrainer> {
    trainer: T,
    validator: Validator,
    state: RwLock<EngineState<T::Model>>,
    writer: Mutex<()>,
    cv_settings: CrossValidationSettings,
    data_settings: DataSettings,
    telemetry: EngineTelemetry,
}

impl<T: Trainer> fmt::Debug for RecommendationEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RecommendationEngine")
            .field("rows", &state.dataset.as_ref().map(|data| data.len()))
            .field("trained", &state.model.is_some())
            .field("hyperparameters", &state.hyperparameters)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl RecommendationEngine<AlsTrainer> {
    /// Engine with the ALS trainer and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Engine with the ALS trainer.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_trainer(AlsTrainer, config)
    }
}

impl Default for RecommendationEngine<AlsTrainer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Trainer> RecommendationEngine<T> {
    /// Engine over an arbitrary trainer.
    #[must_use]
    pub fn with_trainer(trainer: T, config: &EngineConfig) -> Self {
        Self {
            trainer,
            validator: Validator,
            state: RwLock::new(EngineState {
                dataset: None,
                model: None,
                hyperparameters: config.hyperparameters.clone(),
            }),
            writer: Mutex::new(()),
            cv_settings: config.cross_validation.clone(),
            data_settings: config.data,
            telemetry: EngineTelemetry::default(),
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &EngineTelemetry {
        &self.telemetry
    }

    /// Default tuning settings.
    #[must_use]
    pub const fn cv_settings(&self) -> &CrossValidationSettings {
        &self.cv_settings
    }

    /// Data preparation settings.
    #[must_use]
    pub const fn data_settings(&self) -> &DataSettings {
        &self.data_settings
    }

    /// Parses and validates a JSON payload, storing the result as the current dataset.
    pub fn load_data(&self, raw: &str) -> EngineResult<Arc<Dataset>> {
        let frame = Frame::from_json(raw)?;
        self.load_frame(&frame)
    }

    /// Validates a frame, storing the result as the current dataset.
    pub fn load_frame(&self, frame: &Frame) -> EngineResult<Arc<Dataset>> {
        let dataset = Arc::new(self.validator.validate(frame)?);
        {
            let _writer = self.writer.lock();
            self.state.write().dataset = Some(Arc::clone(&dataset));
        }
        self.telemetry.record(
            "engine.data_loaded",
            json!({
                "rows": dataset.len(),
                "users": dataset.users().len(),
                "items": dataset.items().len(),
            }),
        );
        Ok(dataset)
    }

    /// Re-validates a frame and rescales ratings when `scale` is set. Engine state is untouched.
    pub fn transform_data(&self, frame: &Frame, scale: bool) -> EngineResult<Dataset> {
        Ok(self
            .validator
            .transform(frame, self.data_settings.mode_for(scale))?)
    }

    /// [`RecommendationEngine::transform_data`] over an existing dataset.
    pub fn transform_dataset(&self, dataset: &Dataset, scale: bool) -> EngineResult<Dataset> {
        self.transform_data(&Frame::from(dataset), scale)
    }

    /// Current dataset.
    #[must_use]
    pub fn get_data(&self) -> Option<Arc<Dataset>> {
        self.state.read().dataset.clone()
    }

    /// Current model.
    #[must_use]
    pub fn get_model(&self) -> Option<Arc<T::Model>> {
        self.state.read().model.clone()
    }

    /// Hyperparameters used by [`RecommendationEngine::train_model`].
    #[must_use]
    pub fn hyperparameters(&self) -> Hyperparameters {
        self.state.read().hyperparameters.clone()
    }

    /// Replaces the default hyperparameters.
    pub fn set_hyperparameters(&self, params: Hyperparameters) -> EngineResult<()> {
        params.validate()?;
        let _writer = self.writer.lock();
        self.state.write().hyperparameters = params;
        Ok(())
    }

    /// Runs the trainer without touching engine state.
    pub fn fit(&self, dataset: &Dataset, params: &Hyperparameters) -> EngineResult<T::Model> {
        if dataset.is_empty() {
            return Err(EngineError::Training(
                "cannot train on an empty dataset".into(),
            ));
        }
        self.trainer.fit(dataset, params)
    }

    /// Trains on the current dataset with the default hyperparameters and adopts the model.
    pub fn train_model(&self, scale: bool) -> EngineResult<Arc<T::Model>> {
        let _writer = self.writer.lock();
        let started = Instant::now();
        let (dataset, params) = {
            let state = self.state.read();
            (state.dataset.clone(), state.hyperparameters.clone())
        };
        let dataset =
            dataset.ok_or_else(|| EngineError::Training("no dataset is loaded".into()))?;
        if dataset.is_empty() {
            return Err(EngineError::Training("loaded dataset is empty".into()));
        }
        let prepared = self.transform_dataset(&dataset, scale)?;
        let model = Arc::new(self.fit(&prepared, &params)?);
        self.state.write().model = Some(Arc::clone(&model));
        self.telemetry.record(
            "engine.model_trained",
            json!({
                "rows": prepared.len(),
                "rank": model.rank(),
                "scaled": scale,
                "elapsed_ms": elapsed_ms(started),
            }),
        );
        Ok(model)
    }

    /// Grid search with `folds` folds; adopts the best model and its hyperparameters.
    pub fn tune_model(
        &self,
        grid: &HyperparameterGrid,
        folds: usize,
        scale: bool,
    ) -> EngineResult<Arc<T::Model>> {
        let _writer = self.writer.lock();
        let started = Instant::now();
        let mut cv = CrossValidation::new(self);
        let model = cv.fit(folds, grid, scale)?;
        let best = cv
            .best_hyperparameters()
            .cloned()
            .unwrap_or_else(|| model.params().clone());
        {
            let mut state = self.state.write();
            state.model = Some(Arc::clone(&model));
            state.hyperparameters = best;
        }
        self.telemetry.record(
            "engine.model_tuned",
            json!({
                "best_params": cv.best_params(),
                "folds": folds,
                "scaled": scale,
                "elapsed_ms": elapsed_ms(started),
            }),
        );
        Ok(model)
    }

    /// Writes the current model to `path`.
    pub fn persist_model(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let model = self
            .get_model()
            .ok_or_else(|| EngineError::persistence(path, "no trained model to persist"))?;
        model.save(path)?;
        self.telemetry.record(
            "engine.model_persisted",
            json!({ "path": path.display().to_string(), "rank": model.rank() }),
        );
        Ok(())
    }

    /// Restores a model from `path` and adopts it with its hyperparameters.
    pub fn load_model(&self, path: impl AsRef<Path>) -> EngineResult<Arc<T::Model>> {
        let path = path.as_ref();
        let _writer = self.writer.lock();
        let model = Arc::new(self.trainer.load(path)?);
        {
            let mut state = self.state.write();
            state.hyperparameters = model.params().clone();
            state.model = Some(Arc::clone(&model));
        }
        self.telemetry.record(
            "engine.model_loaded",
            json!({ "path": path.display().to_string(), "rank": model.rank() }),
        );
        Ok(model)
    }

    /// Up to `k` items for every user of the current dataset (or of the model when no
    /// dataset is loaded). Users unknown to the model map to an empty list.
    pub fn generate_recommendations(&self, k: usize) -> EngineResult<RecommendationTable> {
        let (dataset, model) = {
            let state = self.state.read();
            (state.dataset.clone(), state.model.clone())
        };
        let model = model.ok_or(EngineError::ModelNotTrained)?;
        let known = model.users();
        let users: Vec<u32> = match dataset {
            Some(dataset) => dataset.users().into_iter().collect(),
            None => known.clone(),
        };
        let known: HashSet<u32> = known.into_iter().collect();
        let unknown = users.iter().filter(|user| !known.contains(*user)).count();
        if unknown > 0 {
            self.telemetry.warn(
                "engine.unknown_users",
                json!({ "unknown": unknown, "users": users.len() }),
            );
        }
        let mut table = RankingTable::recommendations();
        for user in users {
            table.insert(user, item_ids(&*model, user, k));
        }
        Ok(table)
    }

    /// Up to `k` items for one user; empty when the user has no scored items.
    pub fn recommend_items(&self, user_id: u32, k: usize) -> EngineResult<Vec<u32>> {
        let model = self.get_model().ok_or(EngineError::ModelNotTrained)?;
        Ok(item_ids(&*model, user_id, k))
    }
}

fn item_ids<M: FactorModel + ?Sized>(model: &M, user_id: u32, k: usize) -> Vec<u32> {
    model
        .recommend_for_user(user_id, k)
        .into_iter()
        .map(|item| item.prod_id)
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        row,
        schema::{DataSchemas, Frame},
        test_support::{synthetic_columns, synthetic_records},
    };
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    fn loaded_engine() -> RecommendationEngine {
        let engine = RecommendationEngine::new();
        engine.load_data(&synthetic_records(20, 15, 9)).unwrap();
        engine
    }

    #[test]
    fn load_data_orders_columns_and_stores_dataset() {
        let engine = RecommendationEngine::new();
        let dataset = engine
            .load_data(
                r#"[{"rating": 3, "prod_id": 7, "user_id": 1},
                    {"prod_id": 8, "user_id": 1, "rating": 1}]"#,
            )
            .unwrap();
        assert_eq!(dataset.columns(), ["user_id", "prod_id", "rating"]);
        assert_eq!(dataset.len(), 2);
        assert!(Arc::ptr_eq(&dataset, &engine.get_data().unwrap()));
    }

    #[test]
    fn accepts_column_oriented_payloads() {
        let engine = RecommendationEngine::new();
        let dataset = engine.load_data(&synthetic_columns(8, 6, 4)).unwrap();
        assert!(!dataset.is_empty());
    }

    #[test]
    fn invalid_payload_keeps_previous_dataset() {
        let engine = loaded_engine();
        let before = engine.get_data().unwrap();
        let err = engine
            .load_data(r#"[{"user_id": 1, "prod_id": "x", "rating": 2}]"#)
            .unwrap_err();
        assert_eq!(err.tag(), "type_error");
        assert!(Arc::ptr_eq(&before, &engine.get_data().unwrap()));
    }

    #[test]
    fn transform_data_revalidates_and_scales() {
        let engine = RecommendationEngine::new();
        let frame = Frame::with_schema(
            &DataSchemas::INT,
            vec![row![555, 5555, 1], row![555, 6666, 2], row![444, 4444, 50], row![333, 3333, 0]],
        );
        let scaled = engine.transform_data(&frame, true).unwrap();
        let ratings: Vec<i64> = scaled.rows().iter().map(|row| row.rating).collect();
        assert_eq!(ratings, vec![2, 4, 100, 0]);
        let unscaled = engine.transform_data(&frame, false).unwrap();
        assert_eq!(unscaled.rows()[2].rating, 50);
        assert!(engine.get_data().is_none());

        let bad = Frame::with_schema(&DataSchemas::TEXT, vec![row![555, "5t55", 1]]);
        assert_eq!(
            engine.transform_data(&bad, false).unwrap_err().tag(),
            "type_error"
        );
    }

    #[test]
    fn training_without_data_is_training_error() {
        let engine = RecommendationEngine::new();
        assert_eq!(engine.train_model(false).unwrap_err().tag(), "training_error");
        engine
            .load_frame(&Frame::with_schema(&DataSchemas::INT, Vec::new()))
            .unwrap();
        assert_eq!(engine.train_model(false).unwrap_err().tag(), "training_error");
        assert!(engine.get_model().is_none());
    }

    #[test]
    fn recommendations_require_a_model() {
        let engine = loaded_engine();
        assert_eq!(
            engine.generate_recommendations(5).unwrap_err().tag(),
            "model_not_trained_error"
        );
        assert_eq!(
            engine.recommend_items(1, 5).unwrap_err().tag(),
            "model_not_trained_error"
        );
    }

    #[test]
    fn repeated_training_is_idempotent() {
        let engine = loaded_engine();
        engine.train_model(true).unwrap();
        let first = engine.generate_recommendations(10).unwrap();
        engine.train_model(true).unwrap();
        assert_eq!(first, engine.generate_recommendations(10).unwrap());
    }

    #[test]
    fn recommendations_never_exceed_k() {
        let engine = loaded_engine();
        engine.train_model(false).unwrap();
        let table = engine.generate_recommendations(20).unwrap();
        assert_eq!(table.len(), engine.get_data().unwrap().users().len());
        assert!(table.iter().all(|(_, items)| items.len() <= 20));
        assert!(engine.recommend_items(9_999, 5).unwrap().is_empty());
        let user = table.users().next().unwrap();
        assert_eq!(
            engine.recommend_items(user, 20).unwrap(),
            table.get(user).unwrap()
        );
    }

    #[test]
    fn persist_load_round_trip() {
        let engine = loaded_engine();
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test_model");
        assert_eq!(
            engine.persist_model(&path).unwrap_err().tag(),
            "persistence_error"
        );
        engine.train_model(false).unwrap();
        let before = engine.generate_recommendations(10).unwrap();
        engine.persist_model(&path).unwrap();
        for entry in ["itemFactors", "userFactors", "metadata"] {
            assert!(path.join(entry).exists());
        }

        let restored = RecommendationEngine::new();
        restored.load_model(&path).unwrap();
        let from_model = restored.generate_recommendations(10).unwrap();
        assert_eq!(before, from_model);
        assert_eq!(restored.hyperparameters(), engine.hyperparameters());

        engine.load_model(&path).unwrap();
        assert_eq!(before, engine.generate_recommendations(10).unwrap());
    }

    #[test]
    fn failed_load_keeps_current_model() {
        let engine = loaded_engine();
        let model = engine.train_model(false).unwrap();
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("broken")).unwrap();
        std::fs::write(tmp.path().join("broken/metadata"), "{}").unwrap();
        let err = engine.load_model(tmp.path().join("broken")).unwrap_err();
        assert_eq!(err.tag(), "persistence_error");
        assert!(Arc::ptr_eq(&model, &engine.get_model().unwrap()));
    }

    #[test]
    fn failed_training_keeps_current_model() {
        let engine = loaded_engine();
        let model = engine.train_model(false).unwrap();
        engine
            .load_frame(&Frame::with_schema(&DataSchemas::INT, Vec::new()))
            .unwrap();
        assert_eq!(engine.train_model(false).unwrap_err().tag(), "training_error");
        assert!(Arc::ptr_eq(&model, &engine.get_model().unwrap()));
    }

    #[test]
    fn readers_see_whole_models_while_training() {
        let engine = loaded_engine();
        engine.train_model(false).unwrap();
        let before = engine.generate_recommendations(5).unwrap();
        let observed = std::thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..20)
                            .map(|_| engine.generate_recommendations(5).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let writers: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| engine.train_model(true).unwrap()))
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            readers
                .into_iter()
                .flat_map(|reader| reader.join().unwrap())
                .collect::<Vec<_>>()
        });
        let after = engine.generate_recommendations(5).unwrap();
        assert!(observed
            .iter()
            .all(|table| *table == before || *table == after));
    }

    #[test]
    fn unknown_users_are_logged_as_warnings() {
        let tmp = tempdir().unwrap();
        let log_path = tmp.path().join("engine.log");
        let telemetry = EngineTelemetry::builder("engine")
            .log_path(&log_path)
            .build()
            .unwrap();
        let engine = RecommendationEngine::new().with_telemetry(telemetry);
        engine.load_data(&synthetic_records(10, 8, 5)).unwrap();
        engine.train_model(false).unwrap();
        engine
            .load_data(r#"[{"user_id": 9999, "prod_id": 1, "rating": 3}]"#)
            .unwrap();
        let table = engine.generate_recommendations(5).unwrap();
        assert!(table.get(9_999).unwrap().is_empty());
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("engine.unknown_users"));
        assert!(log.contains("WARN"));
    }

    #[test]
    fn tuning_adopts_best_hyperparameters() {
        let engine = loaded_engine();
        let grid = HyperparameterGrid::new()
            .with("rank", [2, 4])
            .with("alpha", [0.5, 0.4]);
        engine.tune_model(&grid, 2, true).unwrap();
        let tuned = engine.generate_recommendations(10).unwrap();
        let params = engine.hyperparameters();
        assert!(params.rank == 2 || params.rank == 4);
        engine.train_model(true).unwrap();
        assert_eq!(tuned, engine.generate_recommendations(10).unwrap());
    }

    #[test]
    fn lifecycle_events_are_published() {
        let bus = Arc::new(MemoryEventBus::new(32));
        let telemetry = EngineTelemetry::builder("engine")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let engine = RecommendationEngine::new().with_telemetry(telemetry);
        engine.load_data(&synthetic_records(6, 6, 2)).unwrap();
        engine.train_model(false).unwrap();
        assert_eq!(bus.events_of_type("engine.data_loaded").len(), 1);
        let trained = bus.events_of_type("engine.model_trained");
        assert_eq!(trained.len(), 1);
        assert_eq!(trained[0].payload["rank"], 10);
    }
}
