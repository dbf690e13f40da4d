use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};
use tsdat::storage::FileSystemStorage;
use tsdat::{Pipeline, PipelineConfig, PipelineError, Stage, VersionPolicy};

const CONFIG: &str = r#"
pipeline:
  name: buoy_ingest
  type: ingest
retriever:
  readers:
    - regex: '.*\.csv$'
      kind: csv
dataset:
  attrs:
    title: Buoy Ingest
    description: Surface temperature from a moored buoy
    conventions: CF-1.6
    code_url: https://example.org/buoy
    location_id: humboldt
    instrument_id: buoy
    qualifier: z05
  coords:
    time:
      attrs:
        units: seconds since 1970-01-01T00:00:00
      retrieve:
        name: time
  data_vars:
    temperature:
      attrs:
        units: K
        long_name: Water temperature
        _FillValue: -9999
      retrieve:
        name: temp_raw
        units: degC
quality:
  tests:
    - name: flag_sentinel
      description: Value is the -999 sentinel
      variables: [temperature]
      checker:
        type: check_sentinel
        value: -999
      handlers:
        - type: record_flag
"#;

const DATASTREAM: &str = "humboldt.buoyz05.b1";

fn config(root: &Path, extra: &str) -> PipelineConfig {
    let mut config = PipelineConfig::from_yaml_str(&format!("{CONFIG}{extra}")).unwrap();
    config.storage.root = root.to_path_buf();
    config
}

fn write_input(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("buoy.20220324.csv");
    fs::write(&path, body).unwrap();
    path
}

fn latest(storage: &FileSystemStorage) -> tsdat::Dataset {
    let records = storage.latest_records(DATASTREAM).unwrap();
    assert_eq!(records.len(), 1);
    storage.read_record(&records[0].path).unwrap().dataset
}

#[test]
fn sentinel_is_flagged_with_reason_and_value_kept() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n0,10\n1,20\n2,-999\n");
    let pipeline = Pipeline::new(config(&tmp.path().join("root"), "")).unwrap();
    let report = pipeline.run(&[input]);
    assert!(report.succeeded(), "{:?}", report.error);

    let ds = latest(pipeline.storage());
    let temperature = ds.var("temperature").unwrap();
    assert_eq!(temperature.data[0], 10.0 + 273.15);
    assert_eq!(temperature.data[1], 20.0 + 273.15);
    assert_eq!(temperature.data[2], -999.0 + 273.15);
    assert_eq!(temperature.units(), Some("K"));

    let flags = ds.qc_flags("temperature").unwrap();
    assert!(!flags.is_flagged(0));
    assert!(!flags.is_flagged(1));
    assert!(flags.is_flagged(2));
    assert_eq!(flags.reasons(2), vec!["Value is the -999 sentinel"]);
}

#[test]
fn replace_with_fill_masks_flagged_value() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n0,10\n1,20\n2,-999\n");
    let yaml = CONFIG.replace(
        "        - type: record_flag\n",
        "        - type: record_flag\n        - type: replace_with_fill\n",
    );
    let mut config = PipelineConfig::from_yaml_str(&yaml).unwrap();
    config.storage.root = tmp.path().join("root");
    let pipeline = Pipeline::new(config).unwrap();
    assert!(pipeline.run(&[input]).succeeded());

    let ds = latest(pipeline.storage());
    assert_eq!(ds.var("temperature").unwrap().data[2], -9999.0);
    assert!(ds.qc_flags("temperature").unwrap().is_flagged(2));
}

#[test]
fn celsius_is_converted_to_kelvin() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n0,0.0\n60,100.0\n");
    let pipeline = Pipeline::new(config(&tmp.path().join("root"), "")).unwrap();
    assert!(pipeline.run(&[input]).succeeded());

    let ds = latest(pipeline.storage());
    assert_eq!(ds.var("temperature").unwrap().data, vec![273.15, 373.15]);
}

#[test]
fn missing_variable_is_retrieval_error_and_stores_nothing() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,salinity\n0,33.1\n");
    let pipeline = Pipeline::new(config(&tmp.path().join("root"), "")).unwrap();
    let report = pipeline.run(&[input]);

    assert_eq!(report.state(), Stage::Failed);
    match report.error {
        Some(PipelineError::MissingVariables(names)) => assert_eq!(names, vec!["temperature"]),
        other => panic!("expected missing variables, got {other:?}"),
    }
    assert!(pipeline.storage().list_records(DATASTREAM).unwrap().is_empty());
}

#[test]
fn repeated_runs_are_deterministic_under_overwrite() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n1648158180,10.5\n1648158240,11.25\n");
    let pipeline = Pipeline::new(config(&tmp.path().join("root"), "")).unwrap();

    let first = pipeline.run(&[input.clone()]).into_result().unwrap();
    let data_first = latest(pipeline.storage());
    let second = pipeline.run(&[input]).into_result().unwrap();
    let data_second = latest(pipeline.storage());

    assert_eq!(first.key, "humboldt.buoyz05.b1.20220324.214300");
    assert_eq!(first.version, 1);
    assert_eq!(second.version, 1);
    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(data_first, data_second);
}

#[test]
fn version_policy_keeps_every_run() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n0,10\n");
    let mut config = config(&tmp.path().join("root"), "");
    config.storage.policy = VersionPolicy::Version;
    let pipeline = Pipeline::new(config).unwrap();

    let a = pipeline.run(&[input.clone()]).into_result().unwrap();
    let b = pipeline.run(&[input]).into_result().unwrap();
    assert_eq!((a.version, b.version), (1, 2));
    assert_eq!(a.content_hash, b.content_hash);
    assert_eq!(pipeline.storage().list_records(DATASTREAM).unwrap().len(), 2);
}

#[test]
fn resampled_run_averages_into_bins() {
    let tmp = tempdir().unwrap();
    let input = write_input(&tmp, "time,temp_raw\n0,10\n30,20\n60,30\n90,40\n");
    let extra = "transform:\n  resample:\n    interval: 60\n    default_method: mean\n";
    let pipeline = Pipeline::new(config(&tmp.path().join("root"), extra)).unwrap();
    let report = pipeline.run(&[input]);
    assert!(report.succeeded(), "{:?}", report.error);

    let ds = latest(pipeline.storage());
    assert_eq!(ds.coord("time").unwrap().data, vec![0.0, 60.0]);
    let temperature = &ds.var("temperature").unwrap().data;
    assert!((temperature[0] - 288.15).abs() < 1e-9);
    assert!((temperature[1] - 308.15).abs() < 1e-9);
}
