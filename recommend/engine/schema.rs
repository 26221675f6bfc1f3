//! Interaction schema, raw tabular frames, and the validator guarding the trainer.

use std::{collections::HashMap, fmt};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dataset::{Dataset, Interaction, ScaleMode},
    error::InputDataError,
};

/// User identifier column.
pub const USER_ID: &str = "user_id";
/// Item identifier column.
pub const PROD_ID: &str = "prod_id";
/// Rating column.
pub const RATING: &str = "rating";
/// Required columns in output order.
pub const REQUIRED_COLUMNS: [&str; 3] = [USER_ID, PROD_ID, RATING];

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Integer column.
    Integer,
    /// Free text column.
    Text,
}

/// Named, typed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaField {
    /// Column name.
    pub name: &'static str,
    /// Declared type.
    pub field_type: FieldType,
}

/// Fixed three-column interaction schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSchema {
    /// Fields in `(user_id, prod_id, rating)` order.
    pub fields: [SchemaField; 3],
}

impl DataSchema {
    const fn uniform(field_type: FieldType) -> Self {
        Self {
            fields: [
                SchemaField {
                    name: USER_ID,
                    field_type,
                },
                SchemaField {
                    name: PROD_ID,
                    field_type,
                },
                SchemaField {
                    name: RATING,
                    field_type,
                },
            ],
        }
    }

    /// Column names in schema order.
    #[must_use]
    pub fn names(&self) -> [&'static str; 3] {
        self.fields.map(|field| field.name)
    }
}

/// The two recognised interaction schemas.
#[derive(Debug, Clone, Copy)]
pub struct DataSchemas;

impl DataSchemas {
    /// `(user_id:int, prod_id:int, rating:int)`.
    pub const INT: DataSchema = DataSchema::uniform(FieldType::Integer);
    /// Textual variant used to probe type violations.
    pub const TEXT: DataSchema = DataSchema::uniform(FieldType::Text);
}

/// Single untyped cell of a raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// Missing value.
    Null,
}

// 2^63; `i64::MAX as f64` rounds up to this value.
const I64_UPPER_EXCLUSIVE: f64 = 9_223_372_036_854_775_808.0;

impl Cell {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Text(flag.to_string()),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Text(number.to_string())),
            Value::String(text) => Self::Text(text.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    /// Integer value of the cell, if it can be coerced without loss.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value)
                if value.is_finite()
                    && value.fract() == 0.0
                    && *value >= i64::MIN as f64
                    && *value < I64_UPPER_EXCLUSIVE =>
            {
                Some(*value as i64)
            }
            Self::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn coerce_to(self, field_type: FieldType) -> Self {
        match (field_type, self) {
            (FieldType::Text, Self::Null) => Self::Null,
            (FieldType::Text, Self::Text(text)) => Self::Text(text),
            (FieldType::Text, other) => Self::Text(other.to_string()),
            (FieldType::Integer, cell) => cell.coerce_int().map_or(cell, Self::Int),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Cell {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Builds a frame row from heterogeneous values: `row![555, "5t55", 1]`.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::schema::Cell::from($value)),*]
    };
}

/// Raw, unvalidated table: named columns and rows of cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    /// Creates a frame; short rows are padded with nulls, long rows truncated.
    #[must_use]
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>, rows: Vec<Vec<Cell>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Creates a frame whose cells are coerced to the schema's declared field types.
    #[must_use]
    pub fn with_schema(schema: &DataSchema, rows: Vec<Vec<Cell>>) -> Self {
        let mut frame = Self::new(schema.names(), rows);
        for row in &mut frame.rows {
            for (cell, field) in row.iter_mut().zip(schema.fields.iter()) {
                *cell = std::mem::replace(cell, Cell::Null).coerce_to(field.field_type);
            }
        }
        frame
    }

    /// Parses a serialized JSON payload.
    ///
    /// Two layouts are recognised: row-oriented records
    /// (`[{"user_id": 1, "prod_id": 2, "rating": 3}, ...]`) and column-oriented tables keyed by
    /// row label (`{"user_id": {"0": 1}, "prod_id": {"0": 2}, "rating": {"0": 3}}`), where each
    /// column may also be a plain array.
    pub fn from_json(raw: &str) -> Result<Self, InputDataError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| InputDataError::format(format!("payload is not valid JSON: {err}")))?;
        Self::from_value(&value)
    }

    /// Builds a frame from an already parsed JSON value.
    pub fn from_value(value: &Value) -> Result<Self, InputDataError> {
        match value {
            Value::Array(records) => Self::from_records(records),
            Value::Object(columns) => Self::from_columns(columns),
            other => Err(InputDataError::format(format!(
                "expected an array of records or an object of columns, found {}",
                json_kind(other)
            ))),
        }
    }

    fn from_records(records: &[Value]) -> Result<Self, InputDataError> {
        let mut columns = IndexSet::new();
        for (idx, record) in records.iter().enumerate() {
            let object = record.as_object().ok_or_else(|| {
                InputDataError::format(format!(
                    "record {idx} is {}, expected an object",
                    json_kind(record)
                ))
            })?;
            columns.extend(object.keys().cloned());
        }
        let rows = records
            .iter()
            .filter_map(Value::as_object)
            .map(|object| {
                columns
                    .iter()
                    .map(|column| object.get(column).map_or(Cell::Null, Cell::from_json))
                    .collect()
            })
            .collect();
        Ok(Self {
            columns: columns.into_iter().collect(),
            rows,
        })
    }

    fn from_columns(columns: &serde_json::Map<String, Value>) -> Result<Self, InputDataError> {
        let mut labels: IndexSet<String> = IndexSet::new();
        let mut series: Vec<(String, HashMap<String, Cell>)> = Vec::with_capacity(columns.len());
        for (name, column) in columns {
            let cells: HashMap<String, Cell> = match column {
                Value::Object(entries) => entries
                    .iter()
                    .map(|(label, value)| (label.clone(), Cell::from_json(value)))
                    .collect(),
                Value::Array(values) => values
                    .iter()
                    .enumerate()
                    .map(|(idx, value)| (idx.to_string(), Cell::from_json(value)))
                    .collect(),
                other => {
                    return Err(InputDataError::format(format!(
                        "column {name} is {}, expected an object or array",
                        json_kind(other)
                    )))
                }
            };
            match column {
                Value::Object(entries) => labels.extend(entries.keys().cloned()),
                Value::Array(values) => labels.extend((0..values.len()).map(|idx| idx.to_string())),
                _ => {}
            }
            series.push((name.clone(), cells));
        }
        let mut ordered: Vec<String> = labels.into_iter().collect();
        ordered.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(left), Ok(right)) => left.cmp(&right),
            _ => a.cmp(b),
        });
        let rows = ordered
            .iter()
            .map(|label| {
                series
                    .iter()
                    .map(|(_, cells)| cells.get(label).cloned().unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();
        Ok(Self {
            columns: series.into_iter().map(|(name, _)| name).collect(),
            rows,
        })
    }

    /// Column names in payload order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the frame has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

impl From<&Dataset> for Frame {
    fn from(dataset: &Dataset) -> Self {
        Self {
            columns: REQUIRED_COLUMNS.iter().map(ToString::to_string).collect(),
            rows: dataset
                .rows()
                .iter()
                .map(|row| {
                    vec![
                        Cell::from(row.user_id),
                        Cell::from(row.prod_id),
                        Cell::from(row.rating),
                    ]
                })
                .collect(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validates raw frames into datasets. Checks run in order: columns, types, uniqueness.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    /// Validates a frame and projects it onto `(user_id, prod_id, rating)`.
    pub fn validate(&self, frame: &Frame) -> Result<Dataset, InputDataError> {
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|column| frame.column_index(column).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(InputDataError::missing_columns(&missing));
        }
        let [user_col, prod_col, rating_col] =
            REQUIRED_COLUMNS.map(|column| frame.column_index(column).unwrap_or_default());

        let mut rows = Vec::with_capacity(frame.len());
        for (idx, row) in frame.rows().iter().enumerate() {
            rows.push(Interaction {
                user_id: coerce_id(&row[user_col], USER_ID, idx)?,
                prod_id: coerce_id(&row[prod_col], PROD_ID, idx)?,
                rating: row[rating_col]
                    .coerce_int()
                    .ok_or_else(|| InputDataError::not_integer(RATING, idx, &row[rating_col].to_string()))?,
            });
        }
        Dataset::from_interactions(rows)
    }

    /// Re-validates a frame and optionally rescales ratings.
    pub fn transform(
        &self,
        frame: &Frame,
        scale: Option<ScaleMode>,
    ) -> Result<Dataset, InputDataError> {
        let dataset = self.validate(frame)?;
        Ok(match scale {
            Some(mode) => dataset.rescaled(mode),
            None => dataset,
        })
    }
}

fn coerce_id(cell: &Cell, column: &str, row: usize) -> Result<u32, InputDataError> {
    cell.coerce_int()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| InputDataError::not_integer(column, row, &cell.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::InputErrorKind, row};

    fn kind_of(frame: &Frame) -> InputErrorKind {
        Validator.validate(frame).unwrap_err().kind()
    }

    #[test]
    fn missing_user_column_is_column_error() {
        let frame = Frame::new(
            ["test", "prod_id", "rating"],
            vec![row![555, 5555, 1], row![444, 4444, 0], row![333, 3333, 1]],
        );
        assert_eq!(kind_of(&frame), InputErrorKind::ColumnError);
    }

    #[test]
    fn characters_in_any_column_are_type_errors() {
        for bad in [row!["5t5", 5555, 1], row![555, "5t55", 1], row![555, 5555, "A"]] {
            let frame = Frame::with_schema(
                &DataSchemas::TEXT,
                vec![bad, row![444, 4444, 0], row![333, 3333, 1]],
            );
            assert_eq!(kind_of(&frame), InputErrorKind::TypeError);
        }
    }

    #[test]
    fn negative_and_fractional_values_are_type_errors() {
        let negative = Frame::with_schema(&DataSchemas::INT, vec![row![-1, 5, 1]]);
        assert_eq!(kind_of(&negative), InputErrorKind::TypeError);
        let fractional = Frame::with_schema(&DataSchemas::INT, vec![row![1, 5, 2.5]]);
        assert_eq!(kind_of(&fractional), InputErrorKind::TypeError);
        let missing = Frame::new(REQUIRED_COLUMNS, vec![row![1, 5]]);
        assert_eq!(kind_of(&missing), InputErrorKind::TypeError);
    }

    #[test]
    fn ratings_beyond_i64_are_type_errors() {
        let frame = Frame::from_json(
            r#"[{"user_id": 1, "prod_id": 2, "rating": 9223372036854775808}]"#,
        )
        .unwrap();
        assert_eq!(kind_of(&frame), InputErrorKind::TypeError);
        assert_eq!(Cell::Float(9_223_372_036_854_775_808.0).coerce_int(), None);
        assert_eq!(
            Cell::Float(-9_223_372_036_854_775_808.0).coerce_int(),
            Some(i64::MIN)
        );

        let extremes = Frame::from_json(
            r#"[{"user_id": 1, "prod_id": 2, "rating": -9223372036854775808},
                {"user_id": 1, "prod_id": 3, "rating": 9223372036854775807}]"#,
        )
        .unwrap();
        assert_eq!(
            Validator.validate(&extremes).unwrap().rating_bounds(),
            Some((i64::MIN, i64::MAX))
        );
    }

    #[test]
    fn duplicate_pairs_are_unique_errors() {
        let frame = Frame::with_schema(
            &DataSchemas::INT,
            vec![
                row![555, 5555, 1],
                row![555, 5555, 1],
                row![444, 4444, 0],
                row![333, 3333, 1],
            ],
        );
        assert_eq!(kind_of(&frame), InputErrorKind::UniqueError);
    }

    #[test]
    fn textual_schema_with_clean_integers_validates() {
        let frame = Frame::with_schema(
            &DataSchemas::TEXT,
            vec![row![555, 5555, 1], row![444, 4444, 0]],
        );
        assert_eq!(frame.rows()[0][0], Cell::Text("555".into()));
        assert_eq!(Validator.validate(&frame).unwrap().len(), 2);
    }

    #[test]
    fn well_formed_frame_is_reordered() {
        let frame = Frame::new(
            ["rating", "extra", "prod_id", "user_id"],
            vec![row![7, "x", 20, 1], row![3, "y", 21, 1]],
        );
        let dataset = Validator.validate(&frame).unwrap();
        assert_eq!(dataset.columns(), REQUIRED_COLUMNS);
        assert_eq!(
            dataset.rows()[0],
            Interaction {
                user_id: 1,
                prod_id: 20,
                rating: 7
            }
        );
    }

    #[test]
    fn parses_records_payload() {
        let frame = Frame::from_json(
            r#"[{"rating": 5, "user_id": 1, "prod_id": 2}, {"user_id": "3", "prod_id": 4.0, "rating": 1}]"#,
        )
        .unwrap();
        let dataset = Validator.validate(&frame).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.rows()[1].prod_id, 4);
    }

    #[test]
    fn parses_column_oriented_payload() {
        let frame = Frame::from_json(
            r#"{"user_id": {"0": 1, "1": 1, "10": 2, "2": 3},
                "prod_id": {"0": 5, "1": 6, "10": 5, "2": 7},
                "rating": {"0": 9, "1": 8, "10": 7, "2": 6}}"#,
        )
        .unwrap();
        let dataset = Validator.validate(&frame).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.rows()[3].user_id, 2);
    }

    #[test]
    fn records_missing_a_field_everywhere_is_column_error() {
        let frame = Frame::from_json(r#"[{"user_id": 1, "rating": 2}]"#).unwrap();
        assert_eq!(kind_of(&frame), InputErrorKind::ColumnError);
    }

    #[test]
    fn unparsable_payload_is_format_error() {
        let err = Frame::from_json("user_id,prod_id\n1,2").unwrap_err();
        assert_eq!(err.kind(), InputErrorKind::FormatError);
        let err = Frame::from_json("42").unwrap_err();
        assert_eq!(err.kind(), InputErrorKind::FormatError);
    }

    #[test]
    fn transform_rescales_globally() {
        let frame = Frame::with_schema(
            &DataSchemas::INT,
            vec![
                row![555, 5555, 1],
                row![555, 6666, 2],
                row![444, 4444, 50],
                row![333, 3333, 0],
            ],
        );
        let scaled = Validator.transform(&frame, Some(ScaleMode::Global)).unwrap();
        let ratings: Vec<i64> = scaled.rows().iter().map(|row| row.rating).collect();
        assert_eq!(ratings, vec![2, 4, 100, 0]);
        let unscaled = Validator.transform(&frame, None).unwrap();
        assert_eq!(unscaled.rows()[2].rating, 50);
    }
}
