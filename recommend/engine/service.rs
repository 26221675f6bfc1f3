//! Request/response glue mapping front-end commands onto engine operations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    engine::RecommendationEngine,
    error::EngineResult,
    trainer::{AlsTrainer, HyperparameterGrid, Trainer},
};

/// Body returned by successful train, tune, save and load commands.
pub const SUCCESS: &str = "success";

/// Front-end command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Load `data` and train with the default hyperparameters.
    Train {
        /// Serialized interaction payload.
        data: String,
        /// Rescale ratings; defaults to the configured data setting.
        #[serde(default)]
        scale: Option<bool>,
    },
    /// Recommendation table for every user of the current dataset.
    Recommend {
        /// Items per user.
        items: usize,
    },
    /// Recommendations for one user.
    RecommendUser {
        /// User identifier.
        user_id: u32,
        /// Items to return.
        items: usize,
    },
    /// Load `data` and grid-search hyperparameters.
    Tune {
        /// Serialized interaction payload.
        data: String,
        /// Candidate grid; defaults to the configured grid.
        #[serde(default)]
        params: Option<HyperparameterGrid>,
        /// Fold count; defaults to the configured count.
        #[serde(default)]
        folds: Option<usize>,
        /// Rescale ratings; defaults to the configured data setting.
        #[serde(default)]
        scale: Option<bool>,
    },
    /// Persist the current model under `name`.
    Save {
        /// Model directory name.
        name: String,
    },
    /// Restore the model saved under `name`.
    Load {
        /// Model directory name.
        name: String,
    },
}

/// Outcome of a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    /// Command succeeded.
    Success {
        /// `"success"` or a JSON result.
        payload: Value,
    },
    /// Command failed.
    Failure {
        /// Taxonomy tag of the failed check.
        error: String,
        /// Failure description.
        message: String,
    },
}

impl Reply {
    fn ok() -> Self {
        Self::Success {
            payload: Value::String(SUCCESS.into()),
        }
    }

    /// Whether the command succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Response body: string payloads verbatim, other payloads as JSON, failures as `tag: message`.
    #[must_use]
    pub fn body(&self) -> String {
        match self {
            Self::Success {
                payload: Value::String(text),
            } => text.clone(),
            Self::Success { payload } => payload.to_string(),
            Self::Failure { error, message } => format!("{error}: {message}"),
        }
    }
}

/// Dispatches commands to one engine. Model names resolve under `model_root`.
#[derive(Debug)]
pub struct EngineService<T: Trainer = AlsTrainer> {
    engine: RecommendationEngine<T>,
    model_root: PathBuf,
}

impl<T: Trainer> EngineService<T> {
    /// Wraps an engine; model names resolve against the working directory.
    #[must_use]
    pub fn new(engine: RecommendationEngine<T>) -> Self {
        Self {
            engine,
            model_root: PathBuf::from("."),
        }
    }

    /// Sets the directory model names resolve under.
    #[must_use]
    pub fn with_model_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.model_root = root.into();
        self
    }

    /// Underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &RecommendationEngine<T> {
        &self.engine
    }

    /// Directory for a model name.
    #[must_use]
    pub fn model_path(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.model_root.join(candidate)
        }
    }

    /// Runs a command.
    pub fn dispatch(&self, command: &Command) -> Reply {
        match self.run(command) {
            Ok(reply) => reply,
            Err(err) => Reply::Failure {
                error: err.tag().into(),
                message: err.to_string(),
            },
        }
    }

    /// Parses a JSON command and runs it. Unparsable commands fail with `value_error`.
    pub fn dispatch_json(&self, raw: &str) -> Reply {
        match serde_json::from_str::<Command>(raw) {
            Ok(command) => self.dispatch(&command),
            Err(err) => Reply::Failure {
                error: "value_error".into(),
                message: format!("invalid command: {err}"),
            },
        }
    }

    fn run(&self, command: &Command) -> EngineResult<Reply> {
        let engine = &self.engine;
        let default_scale = engine.data_settings().scale;
        match command {
            Command::Train { data, scale } => {
                engine.load_data(data)?;
                engine.train_model(scale.unwrap_or(default_scale))?;
                Ok(Reply::ok())
            }
            Command::Recommend { items } => {
                let table = engine.generate_recommendations(*items)?;
                Ok(Reply::Success {
                    payload: json!(table.into_inner()),
                })
            }
            Command::RecommendUser { user_id, items } => Ok(Reply::Success {
                payload: engine.recommend_items(*user_id, *items)?.into(),
            }),
            Command::Tune {
                data,
                params,
                folds,
                scale,
            } => {
                engine.load_data(data)?;
                let settings = engine.cv_settings();
                engine.tune_model(
                    params.as_ref().unwrap_or(&settings.grid),
                    folds.unwrap_or(settings.folds),
                    scale.unwrap_or(default_scale),
                )?;
                Ok(Reply::ok())
            }
            Command::Save { name } => {
                engine.persist_model(self.model_path(name))?;
                Ok(Reply::ok())
            }
            Command::Load { name } => {
                engine.load_model(self.model_path(name))?;
                Ok(Reply::ok())
            }
        }
    }
}
