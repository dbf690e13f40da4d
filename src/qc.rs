use crate::config::{DATA_VARS, QcTestConfig, QualityConfig};
use crate::dataset::{Assessment, Dataset, FAIL_RANGE, VALID_RANGE, Variable, WARN_RANGE};
use crate::error::{PipelineError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Increasing,
    Decreasing,
}

/// Identifies failing values of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Checker {
    /// NaN or `_FillValue`.
    CheckMissing,
    CheckSentinel {
        value: f64,
    },
    CheckRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    CheckValidMin,
    CheckValidMax,
    CheckFailMin,
    CheckFailMax,
    CheckWarnMin,
    CheckWarnMax,
    CheckMonotonic {
        #[serde(default)]
        direction: Direction,
    },
    CheckValidDelta {
        max_delta: f64,
    },
}

impl Checker {
    /// Returns one entry per value, `true` where the value fails the check.
    /// Range and delta checks never fail missing values.
    pub fn run(&self, var: &Variable) -> Result<Vec<bool>> {
        match self {
            Checker::CheckMissing => Ok((0..var.len()).map(|i| var.is_missing(i)).collect()),
            Checker::CheckSentinel { value } => {
                Ok(var.data.iter().map(|v| v == value).collect())
            }
            Checker::CheckRange { min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(PipelineError::Data(
                        "check_range needs a min or a max".to_string(),
                    ));
                }
                Ok(outside(var, *min, *max))
            }
            Checker::CheckValidMin => Ok(outside(var, Some(range(var, VALID_RANGE)?.0), None)),
            Checker::CheckValidMax => Ok(outside(var, None, Some(range(var, VALID_RANGE)?.1))),
            Checker::CheckFailMin => Ok(outside(var, Some(range(var, FAIL_RANGE)?.0), None)),
            Checker::CheckFailMax => Ok(outside(var, None, Some(range(var, FAIL_RANGE)?.1))),
            Checker::CheckWarnMin => Ok(outside(var, Some(range(var, WARN_RANGE)?.0), None)),
            Checker::CheckWarnMax => Ok(outside(var, None, Some(range(var, WARN_RANGE)?.1))),
            Checker::CheckMonotonic { direction } => Ok(non_monotonic(var, *direction)),
            Checker::CheckValidDelta { max_delta } => {
                let mut failed = vec![false; var.len()];
                let mut previous: Option<f64> = None;
                for (i, value) in var.data.iter().enumerate() {
                    if var.is_missing(i) {
                        continue;
                    }
                    if let Some(prev) = previous {
                        failed[i] = (value - prev).abs() > *max_delta;
                    }
                    previous = Some(*value);
                }
                Ok(failed)
            }
        }
    }
}

fn range(var: &Variable, key: &str) -> Result<(f64, f64)> {
    var.range_attr(key).ok_or_else(|| {
        PipelineError::Data(format!(
            "variable '{}' has no two-element '{}' attribute",
            var.name, key
        ))
    })
}

fn outside(var: &Variable, min: Option<f64>, max: Option<f64>) -> Vec<bool> {
    var.data
        .iter()
        .enumerate()
        .map(|(i, v)| {
            !var.is_missing(i)
                && (min.is_some_and(|m| *v < m) || max.is_some_and(|m| *v > m))
        })
        .collect()
}

fn non_monotonic(var: &Variable, direction: Direction) -> Vec<bool> {
    let mut failed = vec![false; var.len()];
    let mut extreme: Option<f64> = None;
    for (i, value) in var.data.iter().enumerate() {
        if value.is_nan() {
            failed[i] = true;
            continue;
        }
        let ok = match (extreme, direction) {
            (None, _) => true,
            (Some(e), Direction::Increasing) => *value > e,
            (Some(e), Direction::Decreasing) => *value < e,
        };
        if ok {
            extreme = Some(*value);
        } else {
            failed[i] = true;
        }
    }
    failed
}

/// Acts on the values a checker failed. Handlers run in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handler {
    RecordFlag {
        #[serde(default)]
        assessment: Assessment,
    },
    /// Failed values become `_FillValue`, or NaN without one.
    ReplaceWithFill,
    /// Drops failed indices from every variable sharing the dimension.
    RemoveFailedValues,
    /// Aborts the run when the failed fraction exceeds `tolerance`.
    FailPipeline {
        #[serde(default)]
        tolerance: f64,
    },
}

impl Handler {
    /// Rejects a `fail_pipeline` tolerance outside `0..=1`.
    pub fn validate(&self) -> Result<()> {
        if let Handler::FailPipeline { tolerance } = self {
            if !(0.0..=1.0).contains(tolerance) {
                return Err(PipelineError::Config(format!(
                    "fail_pipeline tolerance {tolerance} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one test on one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test: String,
    pub variable: String,
    pub failed: usize,
    pub error: Option<String>,
}

/// Per-test outcomes of one quality-control pass, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcReport {
    pub outcomes: Vec<TestOutcome>,
}

impl QcReport {
    pub fn errors(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn total_failed(&self) -> usize {
        self.outcomes.iter().map(|o| o.failed).sum()
    }
}

const DEFAULT_HANDLERS: [Handler; 1] = [Handler::RecordFlag {
    assessment: Assessment::Bad,
}];

/// Runs every configured test in declaration order.
///
/// Internal errors of non-critical tests are recorded in the report and as
/// an indeterminate flag on every value of the variable; critical tests and
/// `fail_pipeline` thresholds abort with an error.
pub fn run_quality_control(ds: &mut Dataset, quality: &QualityConfig) -> Result<QcReport> {
    let mut report = QcReport::default();
    for test in &quality.tests {
        for variable in resolve_variables(ds, test) {
            debug!("Running QC test '{}' on '{}'", test.name, variable);
            match apply_test(ds, test, &variable) {
                Ok(failed) => {
                    if failed > 0 {
                        debug!("QC test '{}' failed {} value(s) of '{}'", test.name, failed, variable);
                    }
                    report.outcomes.push(TestOutcome {
                        test: test.name.clone(),
                        variable,
                        failed,
                        error: None,
                    });
                }
                Err(err @ PipelineError::QcFailure { .. }) => return Err(err),
                Err(err) if test.critical => return Err(err),
                Err(err) => {
                    warn!("QC test '{}' errored on '{}': {}", test.name, variable, err);
                    let failed = record_test_error(ds, test, &variable, &err);
                    report.outcomes.push(TestOutcome {
                        test: test.name.clone(),
                        variable,
                        failed,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
    }
    Ok(report)
}

fn resolve_variables(ds: &Dataset, test: &QcTestConfig) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in &test.variables {
        let expanded: Vec<String> = if name == DATA_VARS {
            ds.data_vars().iter().map(|v| v.name.clone()).collect()
        } else {
            vec![name.clone()]
        };
        for n in expanded {
            if !names.contains(&n) {
                names.push(n);
            }
        }
    }
    names
}

fn apply_test(ds: &mut Dataset, test: &QcTestConfig, variable: &str) -> Result<usize> {
    let var = ds
        .var(variable)
        .ok_or_else(|| PipelineError::Data(format!("no variable named '{variable}'")))?;
    let dim = var.dim.clone();
    let mut failed = test.checker.run(var)?;
    let failed_count = failed.iter().filter(|f| **f).count();
    let total = failed.len();

    let handlers: &[Handler] = if test.handlers.is_empty() {
        &DEFAULT_HANDLERS
    } else {
        &test.handlers
    };
    for handler in handlers {
        match handler {
            Handler::RecordFlag { assessment } => {
                let flags = ds.qc_flags_mut(variable)?;
                let bit = flags.bit_for(&test.name, &test.reason(), *assessment)?;
                for (i, _) in failed.iter().enumerate().filter(|(_, f)| **f) {
                    flags.set(i, bit);
                }
            }
            Handler::ReplaceWithFill => {
                let var = ds
                    .var_mut(variable)
                    .ok_or_else(|| PipelineError::Data(format!("no variable named '{variable}'")))?;
                let mask = var.mask_value();
                for (value, _) in var.data.iter_mut().zip(&failed).filter(|(_, f)| **f) {
                    *value = mask;
                }
            }
            Handler::RemoveFailedValues => {
                let keep: Vec<bool> = failed.iter().map(|f| !f).collect();
                ds.retain_along(&dim, &keep)?;
                failed.retain(|f| !f);
            }
            Handler::FailPipeline { tolerance } => {
                if total > 0 && failed_count as f64 / total as f64 > *tolerance {
                    return Err(PipelineError::QcFailure {
                        test: test.name.clone(),
                        variable: variable.to_string(),
                        failed: failed_count,
                        total,
                        tolerance: *tolerance,
                    });
                }
            }
        }
    }
    Ok(failed_count)
}

/// Flags every value of `variable` as indeterminate. Returns the number of
/// values flagged; nothing is flagged when no bit is left for the test.
fn record_test_error(
    ds: &mut Dataset,
    test: &QcTestConfig,
    variable: &str,
    err: &PipelineError,
) -> usize {
    let Some(len) = ds.var(variable).map(Variable::len) else {
        return 0;
    };
    let reason = format!("{} errored: {}", test.name, err);
    let flagged = ds.qc_flags_mut(variable).and_then(|flags| {
        let bit = flags.bit_for(&test.name, &reason, Assessment::Indeterminate)?;
        for i in 0..len {
            flags.set(i, bit);
        }
        Ok(len)
    });
    match flagged {
        Ok(n) => n,
        Err(e) => {
            warn!("Could not flag '{}' for QC test '{}': {}", variable, test.name, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AttrValue, FILL_VALUE};

    fn dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_coord(Variable::new("time", "time", vec![0.0, 1.0, 2.0]))
            .unwrap();
        ds.add_data_var(
            Variable::new("temp", "time", vec![10.0, 20.0, -999.0]).with_attr(FILL_VALUE, -9999.0),
        );
        ds
    }

    fn test_config(yaml: &str) -> QualityConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn sentinel_is_flagged_and_value_preserved() {
        let mut ds = dataset();
        let quality = test_config(
            r#"
tests:
  - name: flag_sentinel
    description: sentinel -999
    variables: [temp]
    checker: {type: check_sentinel, value: -999}
    handlers: [{type: record_flag}]
"#,
        );
        let report = run_quality_control(&mut ds, &quality).unwrap();
        assert_eq!(report.total_failed(), 1);
        let flags = ds.qc_flags("temp").unwrap();
        assert_eq!(flags.values, vec![0, 0, 1]);
        assert_eq!(flags.reasons(2), vec!["sentinel -999"]);
        assert_eq!(ds.var("temp").unwrap().data[2], -999.0);
    }

    #[test]
    fn replace_masks_value_and_later_tests_see_it() {
        let mut ds = dataset();
        let quality = test_config(
            r#"
tests:
  - name: mask_sentinel
    variables: [DATA_VARS]
    checker: {type: check_sentinel, value: -999}
    handlers: [{type: record_flag}, {type: replace_with_fill}]
  - name: below_zero
    variables: [temp]
    checker: {type: check_range, min: 0.0}
"#,
        );
        let report = run_quality_control(&mut ds, &quality).unwrap();
        assert_eq!(ds.var("temp").unwrap().data[2], -9999.0);
        // the masked value is missing and no longer fails the range check
        assert_eq!(report.outcomes[1].failed, 0);
        let flags = ds.qc_flags("temp").unwrap();
        for i in 0..3 {
            assert_eq!(flags.is_flagged(i), !flags.reasons(i).is_empty());
        }
    }

    #[test]
    fn missing_range_attribute_is_recorded_not_fatal() {
        let mut ds = dataset();
        let quality = test_config(
            r#"
tests:
  - name: fail_min
    variables: [temp]
    checker: {type: check_fail_min}
"#,
        );
        let report = run_quality_control(&mut ds, &quality).unwrap();
        assert_eq!(report.errors().count(), 1);
        let flags = ds.qc_flags("temp").unwrap();
        assert!(flags.reasons(0)[0].starts_with("fail_min errored"));
        assert_eq!(flags.meanings[0].assessment, Assessment::Indeterminate);
    }

    #[test]
    fn critical_test_errors_abort() {
        let mut ds = dataset();
        let quality = test_config(
            r#"
tests:
  - name: fail_min
    variables: [temp]
    critical: true
    checker: {type: check_fail_min}
"#,
        );
        assert!(matches!(
            run_quality_control(&mut ds, &quality),
            Err(PipelineError::Data(_))
        ));
    }

    #[test]
    fn fail_pipeline_threshold() {
        let mut ds = dataset();
        let quality = test_config(
            r#"
tests:
  - name: too_many_sentinels
    variables: [temp]
    checker: {type: check_sentinel, value: -999}
    handlers: [{type: fail_pipeline, tolerance: 0.2}]
"#,
        );
        let err = run_quality_control(&mut ds, &quality).unwrap_err();
        assert!(matches!(err, PipelineError::QcFailure { failed: 1, total: 3, .. }));
    }

    #[test]
    fn remove_failed_values_on_time() {
        let mut ds = Dataset::new();
        ds.add_coord(Variable::new("time", "time", vec![0.0, 2.0, 1.0, 3.0]))
            .unwrap();
        ds.add_data_var(Variable::new("temp", "time", vec![1.0, 2.0, 3.0, 4.0]));
        let quality = test_config(
            r#"
tests:
  - name: monotonic_time
    variables: [time]
    checker: {type: check_monotonic}
    handlers: [{type: remove_failed_values}]
"#,
        );
        run_quality_control(&mut ds, &quality).unwrap();
        assert_eq!(ds.coord("time").unwrap().data, vec![0.0, 2.0, 3.0]);
        assert_eq!(ds.var("temp").unwrap().data, vec![1.0, 2.0, 4.0]);
        ds.validate().unwrap();
    }

    #[test]
    fn valid_delta_skips_missing() {
        let var = Variable::new("temp", "time", vec![1.0, f64::NAN, 1.5, 9.0]);
        let failed = Checker::CheckValidDelta { max_delta: 1.0 }.run(&var).unwrap();
        assert_eq!(failed, vec![false, false, false, true]);
    }

    #[test]
    fn flag_bit_overflow_is_recorded_not_fatal() {
        let mut ds = dataset();
        let tests: Vec<String> = (0..33)
            .map(|i| {
                format!(
                    "  - name: sentinel_{i}\n    variables: [temp]\n    checker: {{type: check_sentinel, value: -999}}\n"
                )
            })
            .collect();
        let quality = test_config(&format!("tests:\n{}", tests.concat()));
        let report = run_quality_control(&mut ds, &quality).unwrap();
        assert_eq!(report.outcomes.len(), 33);
        let errors: Vec<&TestOutcome> = report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].test, "sentinel_32");
        assert_eq!(errors[0].failed, 0);
        assert_eq!(ds.qc_flags("temp").unwrap().meanings.len(), 32);
    }

    #[test]
    fn decreasing_monotonic_flags_rises() {
        let var = Variable::new("depth", "time", vec![5.0, 4.0, 4.5, 3.0, f64::NAN]);
        let failed = Checker::CheckMonotonic {
            direction: Direction::Decreasing,
        }
        .run(&var)
        .unwrap();
        assert_eq!(failed, vec![false, false, true, false, true]);
    }

    #[test]
    fn valid_and_warn_ranges_read_attributes() {
        let var = Variable::new("temp", "time", vec![-5.0, 10.0, 45.0, -9999.0])
            .with_attr(FILL_VALUE, -9999.0)
            .with_attr(VALID_RANGE, AttrValue::List(vec![-2.0, 40.0]))
            .with_attr(WARN_RANGE, AttrValue::List(vec![0.0, 30.0]));
        assert_eq!(
            Checker::CheckValidMin.run(&var).unwrap(),
            vec![true, false, false, false]
        );
        assert_eq!(
            Checker::CheckValidMax.run(&var).unwrap(),
            vec![false, false, true, false]
        );
        assert_eq!(
            Checker::CheckWarnMin.run(&var).unwrap(),
            vec![true, false, false, false]
        );
        assert_eq!(
            Checker::CheckWarnMax.run(&var).unwrap(),
            vec![false, false, true, false]
        );
    }
}
