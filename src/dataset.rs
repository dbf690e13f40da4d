use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FILL_VALUE: &str = "_FillValue";
pub const UNITS: &str = "units";
pub const LONG_NAME: &str = "long_name";
pub const VALID_RANGE: &str = "valid_range";
pub const FAIL_RANGE: &str = "fail_range";
pub const WARN_RANGE: &str = "warn_range";
pub const TIME: &str = "time";

/// A single attribute value attached to a dataset or variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    List(Vec<f64>),
    Text(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `(min, max)` for two-element numeric lists such as `fail_range`.
    pub fn as_range(&self) -> Option<(f64, f64)> {
        match self {
            AttrValue::List(v) if v.len() == 2 => Some((v[0], v[1])),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Number(value)
    }
}

/// Attributes keyed by name, sorted for stable output.
pub type Attrs = BTreeMap<String, AttrValue>;

/// One-dimensional variable (coordinate or data variable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub dim: String,
    pub data: Vec<f64>,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(name: impl Into<String>, dim: impl Into<String>, data: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            dim: dim.into(),
            data,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn units(&self) -> Option<&str> {
        self.attrs.get(UNITS).and_then(AttrValue::as_str)
    }

    pub fn fill_value(&self) -> Option<f64> {
        self.attrs.get(FILL_VALUE).and_then(AttrValue::as_f64)
    }

    pub fn range_attr(&self, key: &str) -> Option<(f64, f64)> {
        self.attrs.get(key).and_then(AttrValue::as_range)
    }

    /// A value is missing when it is NaN or equals the variable's `_FillValue`.
    pub fn is_missing(&self, index: usize) -> bool {
        let value = self.data[index];
        value.is_nan() || self.fill_value() == Some(value)
    }

    /// Value used to mask out data: `_FillValue` if declared, NaN otherwise.
    pub fn mask_value(&self) -> f64 {
        self.fill_value().unwrap_or(f64::NAN)
    }
}

/// How severe a QC flag is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    #[default]
    Bad,
    Indeterminate,
}

/// Meaning of one bit in a variable's QC side-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagMeaning {
    pub bit: u32,
    pub test: String,
    pub description: String,
    pub assessment: Assessment,
}

/// Bit-packed QC flags for one variable. Bit `n` is set at index `i` when the
/// test described by `meanings[n]` flagged value `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QcFlags {
    pub values: Vec<u32>,
    pub meanings: Vec<FlagMeaning>,
}

impl QcFlags {
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0; len],
            meanings: Vec::new(),
        }
    }

    /// Returns the bit assigned to `test`, allocating the next free one.
    pub fn bit_for(
        &mut self,
        test: &str,
        description: &str,
        assessment: Assessment,
    ) -> Result<u32> {
        if let Some(existing) = self.meanings.iter().find(|m| m.test == test) {
            return Ok(existing.bit);
        }
        let bit = self.meanings.len() as u32;
        if bit >= u32::BITS {
            return Err(PipelineError::Data(format!(
                "more than {} QC tests flag the same variable",
                u32::BITS
            )));
        }
        let description = if description.trim().is_empty() {
            format!("flagged by {test}")
        } else {
            description.to_string()
        };
        self.meanings.push(FlagMeaning {
            bit,
            test: test.to_string(),
            description,
            assessment,
        });
        Ok(bit)
    }

    pub fn set(&mut self, index: usize, bit: u32) {
        self.values[index] |= 1 << bit;
    }

    pub fn is_flagged(&self, index: usize) -> bool {
        self.values[index] != 0
    }

    pub fn flagged_count(&self) -> usize {
        self.values.iter().filter(|v| **v != 0).count()
    }

    /// Descriptions of every test that flagged `index`.
    pub fn reasons(&self, index: usize) -> Vec<&str> {
        let value = self.values[index];
        self.meanings
            .iter()
            .filter(|m| value & (1 << m.bit) != 0)
            .map(|m| m.description.as_str())
            .collect()
    }

    fn retain(&mut self, keep: &[bool]) {
        let mut i = 0;
        self.values.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
    }
}

/// In-memory dataset: coordinates, data variables, global attributes and the
/// QC side-channel. Variables keep their declaration order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub attrs: Attrs,
    coords: Vec<Variable>,
    data_vars: Vec<Variable>,
    qc: BTreeMap<String, QcFlags>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coords(&self) -> &[Variable] {
        &self.coords
    }

    pub fn data_vars(&self) -> &[Variable] {
        &self.data_vars
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.coords.iter().chain(self.data_vars.iter())
    }

    /// Adds or replaces a coordinate. A coordinate is its own dimension, so
    /// `coord.name` must equal `coord.dim`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Data` if the coordinate is dimensioned by
    /// another name.
    pub fn add_coord(&mut self, coord: Variable) -> Result<()> {
        if coord.name != coord.dim {
            return Err(PipelineError::Data(format!(
                "coordinate '{}' must be dimensioned by itself, got '{}'",
                coord.name, coord.dim
            )));
        }
        self.remove(&coord.name);
        self.coords.push(coord);
        Ok(())
    }

    /// Adds or replaces a data variable. Lengths are checked by `validate`.
    pub fn add_data_var(&mut self, var: Variable) {
        self.remove(&var.name);
        self.data_vars.push(var);
    }

    pub fn coord(&self, name: &str) -> Option<&Variable> {
        self.coords.iter().find(|v| v.name == name)
    }

    /// Looks up a data variable or coordinate by name.
    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.variables().find(|v| v.name == name)
    }

    /// Coordinate or data variable named `name`.
    pub fn var_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.coords
            .iter_mut()
            .chain(self.data_vars.iter_mut())
            .find(|v| v.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.var(name).is_some()
    }

    /// Removes a variable and its QC flags.
    pub fn remove(&mut self, name: &str) -> Option<Variable> {
        self.qc.remove(name);
        if let Some(pos) = self.coords.iter().position(|v| v.name == name) {
            return Some(self.coords.remove(pos));
        }
        let pos = self.data_vars.iter().position(|v| v.name == name)?;
        Some(self.data_vars.remove(pos))
    }

    /// Length of dimension `dim`, taken from its coordinate.
    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.coord(dim).map(Variable::len)
    }

    /// Dimension names, in coordinate order.
    pub fn dims(&self) -> Vec<&str> {
        self.coords.iter().map(|c| c.name.as_str()).collect()
    }

    /// Checks that every variable's length matches its dimension's coordinate
    /// and that QC arrays line up with the variables they describe.
    pub fn validate(&self) -> Result<()> {
        for var in &self.data_vars {
            let expected = self.dim_len(&var.dim).ok_or_else(|| {
                PipelineError::Data(format!(
                    "variable '{}' uses dimension '{}' which has no coordinate",
                    var.name, var.dim
                ))
            })?;
            if var.len() != expected {
                return Err(PipelineError::Data(format!(
                    "variable '{}' has length {} but dimension '{}' has length {}",
                    var.name,
                    var.len(),
                    var.dim,
                    expected
                )));
            }
        }
        for (name, flags) in &self.qc {
            let var = self.var(name).ok_or_else(|| {
                PipelineError::Data(format!("QC flags recorded for unknown variable '{name}'"))
            })?;
            if flags.values.len() != var.len() {
                return Err(PipelineError::Data(format!(
                    "QC flags for '{}' have length {} but the variable has length {}",
                    name,
                    flags.values.len(),
                    var.len()
                )));
            }
        }
        Ok(())
    }

    pub fn qc(&self) -> &BTreeMap<String, QcFlags> {
        &self.qc
    }

    pub fn qc_flags(&self, name: &str) -> Option<&QcFlags> {
        self.qc.get(name)
    }

    /// Flags for `name`, created empty on first use.
    pub fn qc_flags_mut(&mut self, name: &str) -> Result<&mut QcFlags> {
        let len = self
            .var(name)
            .map(Variable::len)
            .ok_or_else(|| PipelineError::Data(format!("no variable named '{name}'")))?;
        Ok(self
            .qc
            .entry(name.to_string())
            .or_insert_with(|| QcFlags::new(len)))
    }

    /// Replaces the flags of `name`. Lengths are checked by `validate`.
    pub fn set_qc_flags(&mut self, name: &str, flags: QcFlags) {
        self.qc.insert(name.to_string(), flags);
    }

    pub fn take_qc_flags(&mut self, name: &str) -> Option<QcFlags> {
        self.qc.remove(name)
    }

    /// Drops every index where `keep` is false from all variables on `dim`.
    pub fn retain_along(&mut self, dim: &str, keep: &[bool]) -> Result<()> {
        let len = self
            .dim_len(dim)
            .ok_or_else(|| PipelineError::Data(format!("no coordinate for dimension '{dim}'")))?;
        if keep.len() != len {
            return Err(PipelineError::Data(format!(
                "mask length {} does not match dimension '{}' of length {}",
                keep.len(),
                dim,
                len
            )));
        }
        let mut touched = Vec::new();
        for var in self.coords.iter_mut().chain(self.data_vars.iter_mut()) {
            if var.dim == dim {
                let mut i = 0;
                var.data.retain(|_| {
                    let k = keep[i];
                    i += 1;
                    k
                });
                touched.push(var.name.clone());
            }
        }
        for name in touched {
            if let Some(flags) = self.qc.get_mut(&name) {
                flags.retain(keep);
            }
        }
        Ok(())
    }

    /// Renames a variable; renaming a coordinate also renames its dimension.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.contains(new) {
            return Err(PipelineError::Data(format!(
                "cannot rename '{old}' to '{new}': name already in use"
            )));
        }
        let is_coord = self.coord(old).is_some();
        let var = self
            .var_mut(old)
            .ok_or_else(|| PipelineError::Data(format!("no variable named '{old}'")))?;
        var.name = new.to_string();
        if is_coord {
            var.dim = new.to_string();
            for v in self.data_vars.iter_mut().filter(|v| v.dim == old) {
                v.dim = new.to_string();
            }
        }
        if let Some(flags) = self.qc.remove(old) {
            self.qc.insert(new.to_string(), flags);
        }
        Ok(())
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_str)
    }

    pub fn datastream(&self) -> Option<&str> {
        self.attr_str("datastream")
    }

    /// First and last time coordinate values, in epoch seconds.
    pub fn time_span(&self) -> Option<(f64, f64)> {
        let time = self.coord(TIME)?;
        Some((*time.data.first()?, *time.data.last()?))
    }

    /// `(YYYYMMDD, HHMMSS)` of the first time value.
    pub fn start_date_time(&self) -> Option<(String, String)> {
        let (start, _) = self.time_span()?;
        let dt = epoch_to_datetime(start)?;
        Some((
            dt.format("%Y%m%d").to_string(),
            dt.format("%H%M%S").to_string(),
        ))
    }
}

/// Converts seconds since 1970-01-01T00:00:00Z to a UTC datetime.
/// Returns `None` for non-finite or out-of-range values.
pub fn epoch_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let secs = seconds.floor();
    let nanos = ((seconds - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_coord(Variable::new("time", "time", vec![0.0, 60.0, 120.0]))
            .unwrap();
        ds.add_data_var(
            Variable::new("temp", "time", vec![1.0, -9999.0, 3.0]).with_attr(FILL_VALUE, -9999.0),
        );
        ds
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let mut ds = sample();
        ds.add_data_var(Variable::new("rh", "time", vec![1.0]));
        assert!(matches!(ds.validate(), Err(PipelineError::Data(_))));
    }

    #[test]
    fn missing_values_use_fill_and_nan() {
        let mut ds = sample();
        assert!(ds.var("temp").unwrap().is_missing(1));
        ds.var_mut("temp").unwrap().data[0] = f64::NAN;
        assert!(ds.var("temp").unwrap().is_missing(0));
        assert!(!ds.var("temp").unwrap().is_missing(2));
    }

    #[test]
    fn retain_along_drops_values_and_flags() {
        let mut ds = sample();
        let flags = ds.qc_flags_mut("temp").unwrap();
        let bit = flags.bit_for("check_missing", "", Assessment::Bad).unwrap();
        flags.set(1, bit);
        ds.retain_along("time", &[true, false, true]).unwrap();
        assert_eq!(ds.coord("time").unwrap().data, vec![0.0, 120.0]);
        assert_eq!(ds.var("temp").unwrap().data, vec![1.0, 3.0]);
        assert_eq!(ds.qc_flags("temp").unwrap().values, vec![0, 0]);
        ds.validate().unwrap();
    }

    #[test]
    fn rename_coordinate_renames_dimension() {
        let mut ds = sample();
        ds.rename("time", "timestamp").unwrap();
        assert_eq!(ds.var("temp").unwrap().dim, "timestamp");
        ds.validate().unwrap();
    }

    #[test]
    fn flag_reasons_are_never_empty() {
        let mut flags = QcFlags::new(2);
        let bit = flags.bit_for("check_sentinel", "  ", Assessment::Bad).unwrap();
        flags.set(0, bit);
        assert_eq!(flags.reasons(0), vec!["flagged by check_sentinel"]);
        assert!(flags.reasons(1).is_empty());
    }

    #[test]
    fn start_date_time_formats_first_sample() {
        let mut ds = Dataset::new();
        ds.add_coord(Variable::new("time", "time", vec![1_648_158_180.0]))
            .unwrap();
        assert_eq!(
            ds.start_date_time(),
            Some(("20220324".to_string(), "214300".to_string()))
        );
    }
}
