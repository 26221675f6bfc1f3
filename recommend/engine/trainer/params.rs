use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Scalar hyperparameter value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
}

impl ParamValue {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn as_u64(self) -> Option<u64> {
        match self {
            Self::Int(value) => u64::try_from(value).ok(),
            Self::Float(value) if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 => {
                Some(value as u64)
            }
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    const fn as_f64(self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(value as f64),
            Self::Float(value) => Some(value),
            Self::Bool(_) => None,
        }
    }

    const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(flag),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// One point of a hyperparameter grid: parameter name to value, in grid order.
pub type ParamMap = IndexMap<String, ParamValue>;

/// Candidate values per parameter name, in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct HyperparameterGrid {
    params: IndexMap<String, Vec<ParamValue>>,
}

impl HyperparameterGrid {
    /// Empty grid.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the candidates for `name`.
    #[must_use]
    pub fn with<V: Into<ParamValue>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.insert(name, values);
        self
    }

    /// Adds (or replaces) the candidates for `name`.
    pub fn insert<V: Into<ParamValue>>(
        &mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) {
        self.params
            .insert(name.into(), values.into_iter().map(Into::into).collect());
    }

    /// Candidates for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[ParamValue]> {
        self.params.get(name).map(Vec::as_slice)
    }

    /// Parameter names in grid order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Whether the grid names no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Number of points in the Cartesian product.
    #[must_use]
    pub fn combinations(&self) -> usize {
        if self.params.is_empty() {
            return 0;
        }
        self.params.values().map(Vec::len).product()
    }

    /// Cartesian product of the candidate lists. The first parameter varies slowest,
    /// each parameter's values keep their listed order.
    #[must_use]
    pub fn expand(&self) -> Vec<ParamMap> {
        if self.params.is_empty() {
            return Vec::new();
        }
        let mut points = vec![ParamMap::new()];
        for (name, values) in &self.params {
            points = points
                .iter()
                .flat_map(|point| {
                    values.iter().map(move |value| {
                        let mut next = point.clone();
                        next.insert(name.clone(), *value);
                        next
                    })
                })
                .collect();
        }
        points
    }
}

/// Trainer hyperparameters for alternating least squares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    /// Number of latent factors.
    pub rank: usize,
    /// Alternating sweeps.
    pub max_iter: usize,
    /// Regularisation weight, scaled by each row's observation count.
    pub reg_param: f64,
    /// Confidence growth for implicit feedback.
    pub alpha: f64,
    /// Treat ratings as implicit preference strength rather than explicit scores.
    pub implicit_prefs: bool,
    /// Factor initialisation seed.
    pub seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            rank: 10,
            max_iter: 10,
            reg_param: 0.1,
            alpha: 1.0,
            implicit_prefs: true,
            seed: 42,
        }
    }
}

impl Hyperparameters {
    /// Parameter names accepted by [`Hyperparameters::set`].
    pub const ACCEPTED: [&'static str; 9] = [
        "rank",
        "max_iter",
        "maxIter",
        "reg_param",
        "regParam",
        "alpha",
        "implicit_prefs",
        "implicitPrefs",
        "seed",
    ];

    /// Whether `name` is a recognised parameter.
    #[must_use]
    pub fn accepts(name: &str) -> bool {
        Self::ACCEPTED.contains(&name)
    }

    /// Sets one parameter by name.
    pub fn set(&mut self, name: &str, value: ParamValue) -> EngineResult<()> {
        let invalid =
            || EngineError::Value(format!("hyperparameter {name} cannot take value {value}"));
        match name {
            "rank" => {
                self.rank = value
                    .as_u64()
                    .and_then(|rank| usize::try_from(rank).ok())
                    .ok_or_else(invalid)?;
            }
            "max_iter" | "maxIter" => {
                self.max_iter = value
                    .as_u64()
                    .and_then(|iters| usize::try_from(iters).ok())
                    .ok_or_else(invalid)?;
            }
            "reg_param" | "regParam" => self.reg_param = value.as_f64().ok_or_else(invalid)?,
            "alpha" => self.alpha = value.as_f64().ok_or_else(invalid)?,
            "implicit_prefs" | "implicitPrefs" => {
                self.implicit_prefs = value.as_bool().ok_or_else(invalid)?;
            }
            "seed" => self.seed = value.as_u64().ok_or_else(invalid)?,
            other => {
                return Err(EngineError::Value(format!(
                    "unknown hyperparameter {other}; accepted: {}",
                    Self::ACCEPTED.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// Copy with every entry of `overrides` applied, then validated.
    pub fn with_overrides(&self, overrides: &ParamMap) -> EngineResult<Self> {
        let mut params = self.clone();
        for (name, value) in overrides {
            params.set(name, *value)?;
        }
        params.validate()?;
        Ok(params)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> EngineResult<()> {
        if self.rank == 0 {
            return Err(EngineError::Value("rank must be at least 1".into()));
        }
        if self.max_iter == 0 {
            return Err(EngineError::Value("max_iter must be at least 1".into()));
        }
        if !self.reg_param.is_finite() || self.reg_param < 0.0 {
            return Err(EngineError::Value(format!(
                "reg_param must be a non-negative number, got {}",
                self.reg_param
            )));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(EngineError::Value(format!(
                "alpha must be a non-negative number, got {}",
                self.alpha
            )));
        }
        Ok(())
    }

    /// Parameters as a name/value map.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_param_map(&self) -> ParamMap {
        let mut map = ParamMap::new();
        map.insert("rank".into(), ParamValue::Int(self.rank as i64));
        map.insert("max_iter".into(), ParamValue::Int(self.max_iter as i64));
        map.insert("reg_param".into(), ParamValue::Float(self.reg_param));
        map.insert("alpha".into(), ParamValue::Float(self.alpha));
        map.insert("implicit_prefs".into(), ParamValue::Bool(self.implicit_prefs));
        map.insert("seed".into(), ParamValue::Int(self.seed as i64));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_grid_in_stable_order() {
        let grid = HyperparameterGrid::new()
            .with("rank", [5, 10])
            .with("alpha", [0.5, 0.4]);
        let points = grid.expand();
        assert_eq!(grid.combinations(), 4);
        assert_eq!(points.len(), 4);
        assert_eq!(points[0]["rank"], ParamValue::Int(5));
        assert_eq!(points[0]["alpha"], ParamValue::Float(0.5));
        assert_eq!(points[1]["alpha"], ParamValue::Float(0.4));
        assert_eq!(points[2]["rank"], ParamValue::Int(10));
        assert_eq!(points[0].keys().collect::<Vec<_>>(), vec!["rank", "alpha"]);
    }

    #[test]
    fn overrides_accept_aliases_and_reject_unknown_names() {
        let mut point = ParamMap::new();
        point.insert("regParam".into(), ParamValue::Float(0.05));
        point.insert("rank".into(), ParamValue::Int(3));
        let params = Hyperparameters::default().with_overrides(&point).unwrap();
        assert_eq!(params.rank, 3);
        assert!((params.reg_param - 0.05).abs() < f64::EPSILON);

        point.insert("depth".into(), ParamValue::Int(3));
        let err = Hyperparameters::default().with_overrides(&point).unwrap_err();
        assert_eq!(err.tag(), "value_error");
    }

    #[test]
    fn rejects_ill_typed_values() {
        let mut params = Hyperparameters::default();
        assert!(params.set("rank", ParamValue::Float(2.5)).is_err());
        assert!(params.set("implicit_prefs", ParamValue::Int(1)).is_err());
        assert!(params.set("alpha", ParamValue::Int(2)).is_ok());
        assert!(params.set("rank", ParamValue::Int(0)).is_ok());
        assert!(params.validate().is_err());
    }

    #[test]
    fn grid_deserializes_from_json_object() {
        let grid: HyperparameterGrid =
            serde_json::from_str(r#"{"rank": [5, 10], "implicitPrefs": [true, false], "alpha": [0.4]}"#)
                .unwrap();
        assert_eq!(grid.names().collect::<Vec<_>>(), vec!["rank", "implicitPrefs", "alpha"]);
        assert_eq!(grid.get("implicitPrefs").unwrap()[1], ParamValue::Bool(false));
    }
}
