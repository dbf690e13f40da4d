use crate::config::{DatasetDefinition, ResampleConfig, TransformConfig};
use crate::dataset::{AttrValue, Dataset, QcFlags, UNITS, Variable};
use crate::error::{PipelineError, Result};
use crate::units;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Aggregation or interpolation applied to one variable when resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Mean,
    Median,
    Min,
    Max,
    Sum,
    First,
    Last,
    /// Sample in the bin closest to the bin's left edge.
    Nearest,
    /// Linear interpolation onto the bin's left edge.
    Interpolate,
}

/// Converts a quality-controlled dataset into the standardized output.
///
/// Steps run in a fixed order: unit conversion to the declared units,
/// optional resampling, renaming, and conformance to the declared schema.
///
/// # Errors
///
/// Returns `PipelineError::Transform` if:
/// - units are unknown or incompatible
/// - a resampled variable has no aggregation method
/// - a declared variable is absent from the dataset
pub fn transform(
    mut ds: Dataset,
    definition: &DatasetDefinition,
    config: &TransformConfig,
) -> Result<Dataset> {
    convert_units(&mut ds, definition)?;
    if let Some(resample) = &config.resample {
        ds = resample_dataset(&ds, resample)?;
    }
    for (from, to) in &config.rename {
        debug!("Renaming '{}' to '{}'", from, to);
        ds.rename(from, to)
            .map_err(|e| PipelineError::Transform(e.to_string()))?;
    }
    conform(ds, definition, config)
}

/// Converts every variable from its current units to the declared ones.
/// Missing values are left untouched.
pub fn convert_units(ds: &mut Dataset, definition: &DatasetDefinition) -> Result<()> {
    for declared in definition.variables() {
        let Some(target) = declared.units() else {
            continue;
        };
        let Some(var) = ds.var_mut(&declared.name) else {
            continue;
        };
        if let Some(source) = var.units().map(str::to_string) {
            let conversion = units::conversion(&source, target).map_err(|e| {
                PipelineError::Transform(format!("variable '{}': {}", declared.name, e))
            })?;
            if conversion != units::Conversion::Identity {
                debug!(
                    "Converting '{}' from {} to {}",
                    declared.name, source, target
                );
                let fill = var.fill_value();
                var.data.par_iter_mut().for_each(|value| {
                    if !value.is_nan() && Some(*value) != fill {
                        *value = conversion.apply(*value);
                    }
                });
            }
        }
        var.attrs
            .insert(UNITS.to_string(), AttrValue::from(target));
    }
    Ok(())
}

/// Upper bound on output bins per input sample when resampling.
const MAX_BINS_PER_SAMPLE: usize = 10_000;

/// Bins every variable on `config.dim` into fixed-width intervals.
pub fn resample_dataset(ds: &Dataset, config: &ResampleConfig) -> Result<Dataset> {
    let coord = ds.coord(&config.dim).ok_or_else(|| {
        PipelineError::Transform(format!("no coordinate named '{}'", config.dim))
    })?;
    let times = &coord.data;
    if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(PipelineError::Transform(format!(
            "resampling requires '{}' to be finite and strictly increasing",
            config.dim
        )));
    }

    // `origin` only anchors bin alignment; the first bin holds the first sample.
    let interval = config.interval;
    let anchor = config.origin.unwrap_or(0.0);
    let start = match times.first() {
        Some(first) => anchor + ((first - anchor) / interval).floor() * interval,
        None => anchor,
    };
    let span = match times.last() {
        Some(last) => ((last - start) / interval).floor() + 1.0,
        None => 0.0,
    };
    let limit = times.len().max(1).saturating_mul(MAX_BINS_PER_SAMPLE) as f64;
    if !span.is_finite() || span > limit {
        return Err(PipelineError::Transform(format!(
            "resampling {} samples of '{}' every {} would create {} bins (limit {})",
            times.len(),
            config.dim,
            interval,
            span,
            limit
        )));
    }
    let n_bins = span as usize;
    let bins: Vec<usize> = times
        .iter()
        .map(|t| (((t - start) / interval).floor() as usize).min(n_bins.saturating_sub(1)))
        .collect();
    let edges: Vec<f64> = (0..n_bins).map(|k| start + k as f64 * interval).collect();
    debug!(
        "Resampling '{}' from {} samples into {} bins of {}",
        config.dim,
        times.len(),
        n_bins,
        interval
    );

    let mut out = Dataset::new();
    out.attrs = ds.attrs.clone();
    for c in ds.coords() {
        if c.name == config.dim {
            let mut new_coord = Variable::new(c.name.clone(), c.dim.clone(), edges.clone());
            new_coord.attrs = c.attrs.clone();
            out.add_coord(new_coord)?;
        } else {
            out.add_coord(c.clone())?;
        }
    }

    let resampled: Vec<Variable> = ds
        .data_vars()
        .par_iter()
        .map(|var| {
            if var.dim != config.dim {
                return Ok(var.clone());
            }
            let method = config
                .methods
                .get(&var.name)
                .copied()
                .or(config.default_method)
                .ok_or_else(|| {
                    PipelineError::Transform(format!(
                        "no resampling method declared for '{}'",
                        var.name
                    ))
                })?;
            Ok(resample_variable(var, times, &bins, &edges, method))
        })
        .collect::<Result<Vec<_>>>()?;
    for var in resampled {
        out.add_data_var(var);
    }

    for (name, flags) in ds.qc() {
        let on_dim = ds.var(name).is_some_and(|v| v.dim == config.dim);
        if on_dim {
            let mut combined = QcFlags::new(n_bins);
            combined.meanings = flags.meanings.clone();
            for (i, bin) in bins.iter().enumerate() {
                combined.values[*bin] |= flags.values[i];
            }
            out.set_qc_flags(name, combined);
        } else {
            out.set_qc_flags(name, flags.clone());
        }
    }
    out.validate()?;
    Ok(out)
}

fn resample_variable(
    var: &Variable,
    times: &[f64],
    bins: &[usize],
    edges: &[f64],
    method: Method,
) -> Variable {
    let mut members: Vec<Vec<(f64, f64)>> = vec![Vec::new(); edges.len()];
    for (i, bin) in bins.iter().enumerate() {
        if !var.is_missing(i) {
            members[*bin].push((times[i], var.data[i]));
        }
    }
    let mask = var.mask_value();
    let data = match method {
        Method::Interpolate => {
            let valid: Vec<(f64, f64)> = (0..var.len())
                .filter(|i| !var.is_missing(*i))
                .map(|i| (times[i], var.data[i]))
                .collect();
            edges
                .iter()
                .map(|t| interpolate(&valid, *t).unwrap_or(mask))
                .collect()
        }
        _ => members
            .iter()
            .zip(edges)
            .map(|(m, edge)| aggregate(m, *edge, method).unwrap_or(mask))
            .collect(),
    };
    let mut out = Variable::new(var.name.clone(), var.dim.clone(), data);
    out.attrs = var.attrs.clone();
    out
}

fn aggregate(members: &[(f64, f64)], edge: f64, method: Method) -> Option<f64> {
    if members.is_empty() {
        return None;
    }
    let values: Vec<f64> = members.iter().map(|(_, v)| *v).collect();
    let result = match method {
        Method::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Method::Median => calculate_median(&values),
        Method::Min => values.iter().fold(f64::INFINITY, |a, &b| a.min(b)),
        Method::Max => values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
        Method::Sum => values.iter().sum(),
        Method::First => values[0],
        Method::Last => values[values.len() - 1],
        Method::Nearest => {
            members
                .iter()
                .min_by(|a, b| (a.0 - edge).abs().total_cmp(&(b.0 - edge).abs()))?
                .1
        }
        Method::Interpolate => interpolate(members, edge)?,
    };
    Some(result)
}

/// Linear interpolation at `t` over points sorted by time. Returns `None`
/// outside the sampled range.
fn interpolate(points: &[(f64, f64)], t: f64) -> Option<f64> {
    let upper = points.iter().position(|(x, _)| *x >= t)?;
    let (x1, y1) = points[upper];
    if x1 == t {
        return Some(y1);
    }
    let (x0, y0) = *points.get(upper.checked_sub(1)?)?;
    let weight = (t - x0) / (x1 - x0);
    Some(y0 * (1.0 - weight) + y1 * weight)
}

/// Calculates the median of a non-empty slice of finite values.
fn calculate_median(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }

    let mut sorted_data = data.to_vec();
    sorted_data.sort_by(|a, b| a.total_cmp(b));

    let len = sorted_data.len();
    if len.is_multiple_of(2) {
        (sorted_data[len / 2 - 1] + sorted_data[len / 2]) / 2.0
    } else {
        sorted_data[len / 2]
    }
}

/// Rebuilds the dataset holding exactly the declared variables, under their
/// output names and in declaration order.
fn conform(
    mut ds: Dataset,
    definition: &DatasetDefinition,
    config: &TransformConfig,
) -> Result<Dataset> {
    let output_name = |name: &str| -> String {
        config
            .rename
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };

    let mut out = Dataset::new();
    out.attrs = std::mem::take(&mut ds.attrs);

    for declared in definition.coords.values() {
        let name = output_name(&declared.name);
        let flags = ds.take_qc_flags(&name);
        let coord = ds.remove(&name).ok_or_else(|| {
            PipelineError::Transform(format!("declared coordinate '{name}' is absent"))
        })?;
        out.add_coord(coord)?;
        if let Some(flags) = flags {
            out.set_qc_flags(&name, flags);
        }
    }
    for declared in definition.data_vars.values() {
        let name = output_name(&declared.name);
        let flags = ds.take_qc_flags(&name);
        let var = ds.remove(&name).ok_or_else(|| {
            PipelineError::Transform(format!("declared variable '{name}' is absent"))
        })?;
        let expected_dim = output_name(declared.dim());
        if var.dim != expected_dim {
            return Err(PipelineError::Transform(format!(
                "variable '{}' is dimensioned by '{}' instead of '{}'",
                name, var.dim, expected_dim
            )));
        }
        if let Some(target) = declared.units() {
            if var.units() != Some(target) {
                return Err(PipelineError::Transform(format!(
                    "variable '{}' has units {:?} instead of '{}'",
                    name,
                    var.units(),
                    target
                )));
            }
        }
        out.add_data_var(var);
        if let Some(flags) = flags {
            out.set_qc_flags(&name, flags);
        }
    }

    for leftover in ds.variables() {
        debug!("Dropping undeclared variable '{}'", leftover.name);
    }
    out.validate()?;
    Ok(out)
}
