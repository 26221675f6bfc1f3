use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use recommend_engine::{
    Command, EngineConfig, EngineService, EngineTelemetry, HyperparameterGrid, RecommendationEngine,
    Reply,
};
use serde_json::json;
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "recommend", version, about = "Collaborative-filtering recommendation engine")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Engine configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON-lines event log; overrides the configured one.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    /// JSON-lines log file; overrides the configured one.
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,
    /// Lowest logged level; overrides the configured one.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validates an interaction payload and prints a summary.
    Validate {
        /// Interaction payload (JSON records or columns).
        #[arg(long)]
        data: PathBuf,
    },
    /// Trains on a payload and saves the model.
    Train {
        #[arg(long)]
        data: PathBuf,
        /// Model directory to write.
        #[arg(long)]
        save: PathBuf,
        /// Rescale ratings to [0, 100] before training.
        #[arg(long)]
        scale: bool,
    },
    /// Grid-searches hyperparameters with k-fold cross-validation and saves the best model.
    Tune {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        save: PathBuf,
        /// Fold count; defaults to the configured count.
        #[arg(long)]
        folds: Option<usize>,
        /// Grid as inline JSON (`{"rank": [5, 10]}`) or `@path` to a JSON file.
        #[arg(long)]
        grid: Option<String>,
        #[arg(long)]
        scale: bool,
    },
    /// Prints recommendations from a saved model.
    Recommend {
        /// Model directory to load.
        #[arg(long)]
        model: PathBuf,
        /// Payload whose users are ranked; defaults to the model's users.
        #[arg(long)]
        data: Option<PathBuf>,
        /// Items per user.
        #[arg(long, default_value_t = 10)]
        items: usize,
        /// Single user to rank.
        #[arg(long)]
        user: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let service = build_service(&cli.common)?;
    match cli.command {
        Commands::Validate { data } => {
            let dataset = service
                .engine()
                .load_data(&read_payload(&data)?)
                .map_err(|err| anyhow::anyhow!("{}: {err}", err.tag()))?;
            let summary = json!({
                "rows": dataset.len(),
                "users": dataset.users().len(),
                "items": dataset.items().len(),
                "rating_bounds": dataset.rating_bounds(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Train { data, save, scale } => {
            expect_success(service.dispatch(&Command::Train {
                data: read_payload(&data)?,
                scale: Some(scale),
            }))?;
            save_model(&service, &save)
        }
        Commands::Tune {
            data,
            save,
            folds,
            grid,
            scale,
        } => {
            let params = grid.as_deref().map(parse_grid).transpose()?;
            expect_success(service.dispatch(&Command::Tune {
                data: read_payload(&data)?,
                params,
                folds,
                scale: Some(scale),
            }))?;
            let engine = service.engine();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "hyperparameters": engine.hyperparameters() }))?
            );
            save_model(&service, &save)
        }
        Commands::Recommend {
            model,
            data,
            items,
            user,
        } => {
            expect_success(service.dispatch(&Command::Load {
                name: model.display().to_string(),
            }))?;
            if let Some(data) = data {
                service
                    .engine()
                    .load_data(&read_payload(&data)?)
                    .map_err(|err| anyhow::anyhow!("{}: {err}", err.tag()))?;
            }
            let command = match user {
                Some(user_id) => Command::RecommendUser { user_id, items },
                None => Command::Recommend { items },
            };
            println!("{}", expect_success(service.dispatch(&command))?);
            Ok(())
        }
    }
}

fn build_service(common: &CommonArgs) -> Result<EngineService> {
    let mut config = match &common.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(path) = &common.event_log {
        config.telemetry.event_log = Some(path.clone());
    }
    if let Some(path) = &common.log_path {
        config.telemetry.log_path = Some(path.clone());
    }
    if let Some(level) = common.log_level {
        config.telemetry.min_level = level;
    }
    let telemetry =
        EngineTelemetry::from_settings(&config.telemetry).context("initialising telemetry")?;
    let engine = RecommendationEngine::from_config(&config).with_telemetry(telemetry);
    Ok(EngineService::new(engine))
}

fn read_payload(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading payload {}", path.display()))
}

fn parse_grid(raw: &str) -> Result<HyperparameterGrid> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading grid {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("parsing hyperparameter grid")
}

fn save_model(service: &EngineService, path: &Path) -> Result<()> {
    println!(
        "{}",
        expect_success(service.dispatch(&Command::Save {
            name: path.display().to_string(),
        }))?
    );
    Ok(())
}

fn expect_success(reply: Reply) -> Result<String> {
    if reply.is_success() {
        Ok(reply.body())
    } else {
        bail!("{}", reply.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_inline_and_file_grids() {
        let grid = parse_grid(r#"{"rank": [2, 3], "alpha": [0.5]}"#).unwrap();
        assert_eq!(grid.combinations(), 2);
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("grid.json");
        fs::write(&path, r#"{"regParam": [0.01, 0.1, 1.0]}"#).unwrap();
        let grid = parse_grid(&format!("@{}", path.display())).unwrap();
        assert_eq!(grid.combinations(), 3);
        assert!(parse_grid("[1, 2]").is_err());
    }

    #[test]
    fn cli_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "recommend",
            "tune",
            "--data",
            "data.json",
            "--save",
            "model",
            "--grid",
            "{\"rank\": [2]}",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert_eq!(cli.common.log_level, Some(LogLevel::Warn));
        assert!(matches!(cli.command, Commands::Tune { folds: None, .. }));
    }
}
