use crate::config::{DatasetDefinition, RetrieverConfig, VariableConfig};
use crate::dataset::{AttrValue, Dataset, UNITS, Variable};
use crate::error::{PipelineError, Result};
use arrow_array::{
    Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray, TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray, UInt32Array,
};
use arrow_schema::{DataType, TimeUnit};
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, path::PathBuf};

/// One column of a raw input table.
#[derive(Debug, Clone, PartialEq)]
pub enum RawColumn {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl RawColumn {
    pub fn len(&self) -> usize {
        match self {
            RawColumn::Numeric(v) => v.len(),
            RawColumn::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&mut self, other: RawColumn) -> Result<()> {
        match (self, other) {
            (RawColumn::Numeric(a), RawColumn::Numeric(b)) => a.extend(b),
            (RawColumn::Text(a), RawColumn::Text(b)) => a.extend(b),
            _ => {
                return Err(PipelineError::Retrieval(
                    "column changes type between record batches".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Named columns read from one or more inputs, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<(String, RawColumn)>,
}

impl RawTable {
    pub fn get(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    fn merge(&mut self, other: RawTable, source: &Path) -> Result<()> {
        for (name, column) in other.columns {
            if self.get(&name).is_some() {
                return Err(PipelineError::Retrieval(format!(
                    "column '{}' from {} is already provided by another input",
                    name,
                    source.display()
                )));
            }
            self.columns.push((name, column));
        }
        Ok(())
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

/// Input formats the retriever can read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderKind {
    Csv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_true")]
        has_headers: bool,
    },
    Parquet,
}

impl ReaderKind {
    /// Reads one input file into a raw table.
    pub fn read(&self, path: &Path) -> Result<RawTable> {
        match self {
            ReaderKind::Csv {
                delimiter,
                has_headers,
            } => read_csv(path, *delimiter, *has_headers),
            ReaderKind::Parquet => read_parquet(path),
        }
    }
}

/// Reads a delimited text file. Columns whose cells all parse as numbers
/// (empty cells become NaN) are numeric; the rest stay text.
fn read_csv(path: &Path, delimiter: char, has_headers: bool) -> Result<RawTable> {
    if !delimiter.is_ascii() {
        return Err(PipelineError::Retrieval(format!(
            "CSV delimiter '{delimiter}' must be a single ASCII character"
        )));
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(has_headers)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut names: Vec<String> = if has_headers {
        reader.headers()?.iter().map(str::to_string).collect()
    } else {
        Vec::new()
    };
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); names.len()];
    for record in reader.records() {
        let record = record?;
        if names.is_empty() {
            names = (0..record.len()).map(|i| format!("column_{i}")).collect();
            cells = vec![Vec::new(); names.len()];
        }
        for (i, field) in record.iter().enumerate() {
            cells[i].push(field.to_string());
        }
    }

    let columns = names
        .into_iter()
        .zip(cells)
        .map(|(name, values)| (name, classify(values)))
        .collect();
    Ok(RawTable { columns })
}

fn classify(values: Vec<String>) -> RawColumn {
    let parsed: Option<Vec<f64>> = values
        .iter()
        .map(|v| {
            if v.is_empty() {
                Some(f64::NAN)
            } else {
                v.parse::<f64>().ok()
            }
        })
        .collect();
    match parsed {
        Some(numbers) => RawColumn::Numeric(numbers),
        None => RawColumn::Text(values),
    }
}

fn read_parquet(path: &Path) -> Result<RawTable> {
    debug!("Reading Parquet file: {}", path.display());
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut table = RawTable::default();
    for batch in reader {
        let batch: RecordBatch = batch?;
        let schema = batch.schema();
        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let column = column_from_array(field.name(), array)?;
            match table.columns.iter_mut().find(|(n, _)| n.as_str() == field.name().as_str()) {
                Some((_, existing)) => existing.extend(column)?,
                None => table.columns.push((field.name().clone(), column)),
            }
        }
    }
    Ok(table)
}

fn downcast<'a, T: 'static>(name: &str, array: &'a ArrayRef) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        PipelineError::Retrieval(format!("column {name} has an unexpected array type"))
    })
}

macro_rules! numeric_column {
    ($name:expr, $array:expr, $ty:ty, $scale:expr) => {{
        let typed = downcast::<$ty>($name, $array)?;
        RawColumn::Numeric(
            (0..typed.len())
                .map(|i| {
                    if typed.is_null(i) {
                        f64::NAN
                    } else {
                        typed.value(i) as f64 / $scale
                    }
                })
                .collect(),
        )
    }};
}

fn column_from_array(name: &str, array: &ArrayRef) -> Result<RawColumn> {
    let column = match array.data_type() {
        DataType::Float64 => numeric_column!(name, array, Float64Array, 1.0),
        DataType::Float32 => numeric_column!(name, array, Float32Array, 1.0),
        DataType::Int64 => numeric_column!(name, array, Int64Array, 1.0),
        DataType::Int32 => numeric_column!(name, array, Int32Array, 1.0),
        DataType::UInt32 => numeric_column!(name, array, UInt32Array, 1.0),
        DataType::Timestamp(TimeUnit::Second, _) => {
            numeric_column!(name, array, TimestampSecondArray, 1.0)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            numeric_column!(name, array, TimestampMillisecondArray, 1e3)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            numeric_column!(name, array, TimestampMicrosecondArray, 1e6)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            numeric_column!(name, array, TimestampNanosecondArray, 1e9)
        }
        DataType::Utf8 => {
            let typed = downcast::<StringArray>(name, array)?;
            RawColumn::Text(
                (0..typed.len())
                    .map(|i| {
                        if typed.is_null(i) {
                            String::new()
                        } else {
                            typed.value(i).to_string()
                        }
                    })
                    .collect(),
            )
        }
        other => {
            return Err(PipelineError::Retrieval(format!(
                "column {name} has unsupported type {other}"
            )));
        }
    };
    Ok(column)
}

/// Parses a text timestamp into seconds since 1970-01-01T00:00:00Z.
pub fn parse_timestamp(value: &str, format: &str) -> Result<f64> {
    let datetime = match NaiveDateTime::parse_from_str(value, format) {
        Ok(dt) => dt,
        Err(_) => NaiveDate::parse_from_str(value, format)
            .map(|d| d.and_time(chrono::NaiveTime::MIN))
            .map_err(|e| {
                PipelineError::Retrieval(format!(
                    "cannot parse '{value}' with format '{format}': {e}"
                ))
            })?,
    };
    let utc = datetime.and_utc();
    Ok(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) / 1e9)
}

/// Loads raw inputs and maps them onto the declared dataset variables.
pub struct Retriever {
    readers: Vec<(Regex, ReaderKind)>,
}

impl Retriever {
    /// Compiles the reader patterns of `config`, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if a pattern is not a valid regex.
    pub fn from_config(config: &RetrieverConfig) -> Result<Self> {
        let readers = config
            .readers
            .iter()
            .map(|r| {
                Regex::new(&r.regex)
                    .map(|re| (re, r.kind.clone()))
                    .map_err(|e| PipelineError::Config(format!("invalid reader regex: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { readers })
    }

    /// Reads every input with the first reader whose pattern matches it.
    pub fn read_inputs(&self, inputs: &[PathBuf]) -> Result<RawTable> {
        if inputs.is_empty() {
            return Err(PipelineError::Retrieval("no input keys given".to_string()));
        }
        let mut table = RawTable::default();
        for input in inputs {
            let key = input.to_string_lossy();
            let (_, reader) = self
                .readers
                .iter()
                .find(|(re, _)| re.is_match(&key))
                .ok_or_else(|| {
                    PipelineError::Retrieval(format!("no reader registered for input '{key}'"))
                })?;
            debug!("Reading input {} with {:?}", key, reader);
            table.merge(reader.read(input)?, input)?;
        }
        Ok(table)
    }

    /// Produces a dataset holding every declared variable with its source
    /// units. Absent columns without a configured default are reported
    /// together.
    pub fn retrieve(&self, inputs: &[PathBuf], definition: &DatasetDefinition) -> Result<Dataset> {
        let raw = self.read_inputs(inputs)?;
        let mut ds = build_dataset(&raw, definition)?;
        let input_files: Vec<String> = inputs.iter().map(|p| input_name(p)).collect();
        ds.attrs.insert(
            "input_files".to_string(),
            AttrValue::from(input_files.join(", ")),
        );
        Ok(ds)
    }
}

/// File name of an input, or the whole path when it has none.
pub fn input_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Maps a raw table onto the dataset definition.
pub fn build_dataset(raw: &RawTable, definition: &DatasetDefinition) -> Result<Dataset> {
    let mut ds = Dataset::new();
    ds.attrs = definition.attrs.clone();
    let mut missing = Vec::new();

    for coord in definition.coords.values() {
        match variable_data(raw, coord, None)? {
            Some(data) => ds.add_coord(source_variable(coord, data))?,
            None => missing.push(coord.name.clone()),
        }
    }
    for var in definition.data_vars.values() {
        let Some(len) = ds.dim_len(var.dim()) else {
            // The coordinate itself is missing and already reported.
            continue;
        };
        match variable_data(raw, var, Some(len))? {
            Some(data) => {
                if data.len() != len {
                    return Err(PipelineError::Retrieval(format!(
                        "variable '{}' has {} values but coordinate '{}' has {}",
                        var.name,
                        data.len(),
                        var.dim(),
                        len
                    )));
                }
                ds.add_data_var(source_variable(var, data));
            }
            None => missing.push(var.name.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(PipelineError::MissingVariables(missing));
    }
    ds.validate()?;
    Ok(ds)
}

fn source_variable(config: &VariableConfig, data: Vec<f64>) -> Variable {
    let mut var = Variable::new(config.name.clone(), config.dim(), data);
    var.attrs = config.attrs.clone();
    if let Some(units) = config.source_units() {
        var.attrs.insert(UNITS.to_string(), AttrValue::from(units));
    }
    var
}

/// `Ok(None)` means the variable's source column is absent and no default
/// applies.
/// Converts one text cell. Empty cells are missing (NaN) unless the column
/// is a timestamp column, where every row must parse.
fn text_value(column: &str, row: usize, value: &str, time_format: Option<&str>) -> Result<f64> {
    let value = value.trim();
    match time_format {
        Some(format) => parse_timestamp(value, format).map_err(|e| {
            PipelineError::Retrieval(format!("column '{column}' row {row}: {e}"))
        }),
        None if value.is_empty() => Ok(f64::NAN),
        None => value.parse::<f64>().map_err(|_| {
            PipelineError::Retrieval(format!(
                "column '{column}' row {row} holds non-numeric value '{value}'"
            ))
        }),
    }
}

fn variable_data(
    raw: &RawTable,
    config: &VariableConfig,
    len: Option<usize>,
) -> Result<Option<Vec<f64>>> {
    let fill = config
        .attrs
        .get(crate::dataset::FILL_VALUE)
        .and_then(AttrValue::as_f64)
        .unwrap_or(f64::NAN);

    if let Some(data) = &config.data {
        return Ok(Some(data.clone()));
    }
    let Some(retrieve) = &config.retrieve else {
        return Ok(len.map(|n| vec![fill; n]));
    };

    match raw.get(&retrieve.name) {
        Some(RawColumn::Numeric(values)) => Ok(Some(values.clone())),
        Some(RawColumn::Text(values)) => {
            let parsed = values
                .iter()
                .enumerate()
                .map(|(row, v)| text_value(&retrieve.name, row, v, retrieve.time_format.as_deref()))
                .collect::<Result<Vec<f64>>>()?;
            Ok(Some(parsed))
        }
        None => match (retrieve.default, len) {
            (Some(policy), Some(n)) => {
                let value = policy.value().unwrap_or(fill);
                warn!(
                    "Input column '{}' is absent; filling '{}' with default {}",
                    retrieve.name, config.name, value
                );
                Ok(Some(vec![value; n]))
            }
            _ => Ok(None),
        },
    }
}
