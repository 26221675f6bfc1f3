#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Collaborative-filtering recommendation engine: validated interaction data, latent-factor
//! training, k-fold hyperparameter tuning, model persistence and per-user ranking.

/// Engine configuration loaded from TOML.
#[path = "../config.rs"]
pub mod config;
/// K-fold grid search and ranking-overlap scoring.
#[path = "../crossvalidation/main.rs"]
pub mod cross_validation;
/// Validated interaction table.
#[path = "../dataset.rs"]
pub mod dataset;
/// Stateful train/tune/persist/recommend orchestration.
#[path = "../engine.rs"]
pub mod engine;
/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;
/// Interaction schema, raw frames and validation.
#[path = "../schema.rs"]
pub mod schema;
/// Command dispatch for front ends.
#[path = "../service.rs"]
pub mod service;
/// Log and event sinks.
#[path = "../telemetry.rs"]
pub mod telemetry;
/// Trainer capability and the ALS implementation.
#[path = "../trainer/main.rs"]
pub mod trainer;

#[cfg(test)]
#[path = "../test_support.rs"]
mod test_support;

pub use config::{CrossValidationSettings, DataSettings, EngineConfig, TelemetrySettings};
pub use cross_validation::{
    CrossValidation, GridScore, RankingTable, RecommendationTable, RelevanceTable, Split,
};
pub use dataset::{Dataset, Interaction, ScaleMode};
pub use engine::RecommendationEngine;
pub use error::{EngineError, EngineResult, InputDataError, InputErrorKind};
pub use schema::{Cell, DataSchema, DataSchemas, Frame, Validator};
pub use service::{Command, EngineService, Reply, SUCCESS};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use trainer::{
    AlsModel, AlsTrainer, FactorModel, HyperparameterGrid, Hyperparameters, ParamMap, ParamValue,
    ScoredItem, Trainer, UserRecommendations,
};
