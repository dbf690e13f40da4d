//! Filesystem storage area for versioned dataset records.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<datastream>/<datastream>.<YYYYMMDD>.<HHMMSS>.v0001/
//!     data.<dim>.parquet    one table per dimension, QC columns included
//!     record.json           attributes, variable metadata, provenance
//! <root>/<datastream>/ancillary/
//! ```
//!
//! Records are written into a hidden staging directory and renamed into
//! place, so readers only ever see complete records. Hidden entries (leading
//! `.`) are never listed.

use crate::config::StorageConfig;
use crate::dataset::{Attrs, Dataset, FlagMeaning, QcFlags, TIME, Variable};
use crate::error::{PipelineError, Result};
use crate::load::{self, OutputFormat, QC_PREFIX};
use arrow_array::{Array, Float64Array, UInt32Array};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const RECORD_FILE: &str = "record.json";
const ANCILLARY_DIR: &str = "ancillary";

/// What happens when a record for the same datastream and start time exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Replace the newest version in place.
    #[default]
    Overwrite,
    /// Write the next version number alongside earlier ones.
    Version,
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub input_files: Vec<String>,
    pub config_hash: String,
    pub processed_at: DateTime<Utc>,
    pub history: String,
}

impl Provenance {
    /// Provenance stamped with the current time.
    pub fn new(input_files: Vec<String>, config_hash: String) -> Self {
        let processed_at = Utc::now();
        Self {
            input_files,
            config_hash,
            history: format!("Ran at {}", processed_at.format("%Y-%m-%d %H:%M:%S")),
            processed_at,
        }
    }
}

/// Name, dimension and attributes of one stored variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub name: String,
    pub dim: String,
    pub coordinate: bool,
    pub attrs: Attrs,
}

/// Contents of `record.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub datastream: String,
    pub key: String,
    pub version: u32,
    /// Hash of data, metadata, inputs and config; excludes processing time.
    pub content_hash: String,
    pub time_span: Option<(f64, f64)>,
    pub provenance: Provenance,
    pub attrs: Attrs,
    pub variables: Vec<VariableMetadata>,
    pub qc: BTreeMap<String, Vec<FlagMeaning>>,
}

/// A persisted record read back from the storage area.
#[derive(Debug, Clone)]
pub struct StorageRecord {
    pub path: PathBuf,
    pub metadata: RecordMetadata,
    pub dataset: Dataset,
}

/// Location of one published record version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub key: String,
    pub version: u32,
    pub path: PathBuf,
}

/// Removes the on-disk lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(PipelineError::Storage(
                format!("record is locked by another writer: {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}

/// Storage area rooted at a local directory. Safe to share between threads;
/// writes to the same record are serialized.
pub struct FileSystemStorage {
    config: StorageConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileSystemStorage {
    /// Opens the storage area, creating its root directory if needed.
    pub fn new(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn datastream_dir(&self, datastream: &str) -> PathBuf {
        self.config.root.join(datastream)
    }

    fn record_lock(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| PipelineError::Storage("lock registry poisoned".to_string()))?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Persists `ds` as a new record version, or replaces the newest existing
    /// version under the overwrite policy.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Storage` if the dataset has no datastream or
    /// time values, or the record is locked by another process. A failed
    /// write leaves earlier records untouched.
    pub fn save_data(&self, ds: &Dataset, provenance: Provenance) -> Result<RecordMetadata> {
        ds.validate()?;
        let datastream = ds
            .datastream()
            .ok_or_else(|| PipelineError::Storage("dataset has no datastream attribute".into()))?
            .to_string();
        let (date, time) = ds
            .start_date_time()
            .ok_or_else(|| PipelineError::Storage("dataset has no time values".into()))?;
        let key = format!("{datastream}.{date}.{time}");

        let dir = self.datastream_dir(&datastream);
        fs::create_dir_all(&dir)?;

        let record_lock = self.record_lock(&key)?;
        let result = self.save_locked(ds, provenance, &dir, &datastream, &key, &record_lock);
        drop(record_lock);
        self.release_record_lock(&key);
        result
    }

    /// Drops the registry entry for `key` once no writer holds it.
    fn release_record_lock(&self, key: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }

    fn save_locked(
        &self,
        ds: &Dataset,
        provenance: Provenance,
        dir: &Path,
        datastream: &str,
        key: &str,
        record_lock: &Mutex<()>,
    ) -> Result<RecordMetadata> {
        let _guard = record_lock
            .lock()
            .map_err(|_| PipelineError::Storage(format!("lock for {key} poisoned")))?;
        let _file_lock = LockFile::acquire(dir.join(format!(".{key}.lock")))?;

        let highest = self
            .versions(datastream, key)?
            .iter()
            .map(|r| r.version)
            .max();
        let version = match self.config.policy {
            VersionPolicy::Overwrite => highest.unwrap_or(1),
            VersionPolicy::Version => highest.unwrap_or(0) + 1,
        };
        let metadata = build_metadata(ds, datastream, key, version, provenance)?;
        let target = dir.join(format!("{key}.v{version:04}"));
        let staging = dir.join(format!(".staging-{key}.v{version:04}"));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        if let Err(e) = self.write_record(ds, &metadata, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        publish(&staging, &target)?;
        info!(
            "Stored {} (version {}, {} variables)",
            target.display(),
            version,
            metadata.variables.len()
        );
        Ok(metadata)
    }

    fn write_record(&self, ds: &Dataset, metadata: &RecordMetadata, dir: &Path) -> Result<()> {
        for dim in ds.dims() {
            load::write_parquet(ds, dim, &dir.join(format!("data.{dim}.parquet")))?;
        }
        for format in &self.config.formats {
            match format {
                OutputFormat::Csv => {
                    for dim in ds.dims() {
                        load::write_csv(ds, dim, &dir.join(format!("data.{dim}.csv")))?;
                    }
                    load::write_csv_header(ds, &dir.join("data.hdr.csv"))?;
                    load::write_csv_attrs(ds, &dir.join("data.attrs.csv"))?;
                }
                OutputFormat::Json => load::write_json(ds, &dir.join("data.json"))?,
            }
        }
        let file = File::create(dir.join(RECORD_FILE))?;
        serde_json::to_writer_pretty(file, metadata)?;
        Ok(())
    }

    /// Every published record of a datastream, sorted by key then version.
    pub fn list_records(&self, datastream: &str) -> Result<Vec<RecordRef>> {
        let dir = self.datastream_dir(datastream);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let Some((key, version)) = name.rsplit_once(".v") else {
                continue;
            };
            let Ok(version) = version.parse::<u32>() else {
                continue;
            };
            records.push(RecordRef {
                key: key.to_string(),
                version,
                path: entry.path(),
            });
        }
        records.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(records)
    }

    fn versions(&self, datastream: &str, key: &str) -> Result<Vec<RecordRef>> {
        Ok(self
            .list_records(datastream)?
            .into_iter()
            .filter(|r| r.key == key)
            .collect())
    }

    /// Reads a published record directory back into memory.
    ///
    /// # Arguments
    ///
    /// * `path` - Record directory, as returned in `RecordRef::path`
    ///
    /// # Returns
    ///
    /// The record's metadata and its dataset, with data and QC values
    /// identical to what was saved.
    ///
    /// # Errors
    ///
    /// Returns error if `record.json` or a parquet table is missing or
    /// malformed, or a column has an unexpected type.
    pub fn read_record(&self, path: &Path) -> Result<StorageRecord> {
        let metadata: RecordMetadata =
            serde_json::from_reader(File::open(path.join(RECORD_FILE))?)?;
        let dataset = read_dataset(path, &metadata)?;
        Ok(StorageRecord {
            path: path.to_path_buf(),
            metadata,
            dataset,
        })
    }

    /// Newest version of every record of `datastream`.
    pub fn latest_records(&self, datastream: &str) -> Result<Vec<RecordRef>> {
        let mut latest: BTreeMap<String, RecordRef> = BTreeMap::new();
        for record in self.list_records(datastream)? {
            latest.insert(record.key.clone(), record);
        }
        Ok(latest.into_values().collect())
    }

    /// Concatenates the newest version of every record overlapping
    /// `[start, end]`, keeping only samples inside the range.
    pub fn fetch_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        datastream: &str,
    ) -> Result<Dataset> {
        let (lo, hi) = (epoch_seconds(start), epoch_seconds(end));
        let mut combined: Option<Dataset> = None;
        for record in self.latest_records(datastream)? {
            let record = self.read_record(&record.path)?;
            let Some((first, last)) = record.metadata.time_span else {
                continue;
            };
            if last < lo || first > hi {
                continue;
            }
            debug!("Fetching {}", record.path.display());
            let mut ds = record.dataset;
            let keep: Vec<bool> = ds
                .coord(TIME)
                .map(|t| t.data.iter().map(|v| *v >= lo && *v <= hi).collect())
                .unwrap_or_default();
            ds.retain_along(TIME, &keep)?;
            combined = Some(match combined {
                None => ds,
                Some(acc) => concat_time(acc, &ds)?,
            });
        }
        combined.ok_or_else(|| {
            PipelineError::Storage(format!(
                "no data for {datastream} between {start} and {end}"
            ))
        })
    }

    /// Copies a non-dataset file (plot, report) into the datastream's
    /// ancillary area.
    pub fn save_ancillary_file(&self, path: &Path, datastream: &str) -> Result<PathBuf> {
        let name = path.file_name().ok_or_else(|| {
            PipelineError::Storage(format!("{} has no file name", path.display()))
        })?;
        let dir = self.datastream_dir(datastream).join(ANCILLARY_DIR);
        fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        fs::copy(path, &target)?;
        debug!("Saved ancillary file {}", target.display());
        Ok(target)
    }

    /// Runs `write` against a temporary directory and, if it succeeds, saves
    /// every file it left there as an ancillary file.
    pub fn uploadable_dir<F>(&self, datastream: &str, write: F) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let tmp = tempfile::tempdir()?;
        write(tmp.path())?;
        let mut saved = Vec::new();
        for file in files_under(tmp.path())? {
            saved.push(self.save_ancillary_file(&file, datastream)?);
        }
        Ok(saved)
    }
}

fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(files_under(&path)?);
        } else if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Moves a staged record into place. An existing target is renamed aside
/// first and deleted once the new record is visible.
fn publish(staging: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let trash = target.with_file_name(format!(".trash-{name}"));
        if trash.exists() {
            fs::remove_dir_all(&trash)?;
        }
        fs::rename(target, &trash)?;
        if let Err(e) = fs::rename(staging, target) {
            // put the previous record back
            fs::rename(&trash, target)?;
            return Err(e.into());
        }
        // the new record is committed from here on
        if let Err(e) = fs::remove_dir_all(&trash) {
            warn!("failed to remove replaced record {}: {}", trash.display(), e);
        }
    } else {
        fs::rename(staging, target)?;
    }
    Ok(())
}

fn epoch_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

fn build_metadata(
    ds: &Dataset,
    datastream: &str,
    key: &str,
    version: u32,
    provenance: Provenance,
) -> Result<RecordMetadata> {
    let variables: Vec<VariableMetadata> = ds
        .variables()
        .map(|v| VariableMetadata {
            name: v.name.clone(),
            dim: v.dim.clone(),
            coordinate: ds.coord(&v.name).is_some(),
            attrs: v.attrs.clone(),
        })
        .collect();
    let qc: BTreeMap<String, Vec<FlagMeaning>> = ds
        .qc()
        .iter()
        .map(|(name, flags)| (name.clone(), flags.meanings.clone()))
        .collect();
    let content_hash = content_hash(ds, &provenance)?;
    Ok(RecordMetadata {
        datastream: datastream.to_string(),
        key: key.to_string(),
        version,
        content_hash,
        time_span: ds.time_span(),
        provenance,
        attrs: ds.attrs.clone(),
        variables,
        qc,
    })
}

/// SHA-256 over everything that makes a record what it is, processing time
/// and history excepted.
pub fn content_hash(ds: &Dataset, provenance: &Provenance) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&ds.attrs)?);
    for var in ds.variables() {
        hasher.update(var.name.as_bytes());
        hasher.update(var.dim.as_bytes());
        hasher.update(serde_json::to_vec(&var.attrs)?);
        for value in &var.data {
            hasher.update(value.to_bits().to_le_bytes());
        }
    }
    for (name, flags) in ds.qc() {
        hasher.update(name.as_bytes());
        hasher.update(serde_json::to_vec(&flags.meanings)?);
        for value in &flags.values {
            hasher.update(value.to_le_bytes());
        }
    }
    hasher.update(serde_json::to_vec(&provenance.input_files)?);
    hasher.update(provenance.config_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn read_dataset(dir: &Path, metadata: &RecordMetadata) -> Result<Dataset> {
    let mut columns: HashMap<String, Vec<f64>> = HashMap::new();
    let mut qc_columns: HashMap<String, Vec<u32>> = HashMap::new();
    let dims: Vec<&str> = metadata
        .variables
        .iter()
        .filter(|v| v.coordinate)
        .map(|v| v.name.as_str())
        .collect();
    for dim in dims {
        let file = File::open(dir.join(format!("data.{dim}.parquet")))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            let batch = batch?;
            let schema = batch.schema();
            for (field, array) in schema.fields().iter().zip(batch.columns()) {
                if let Some(values) = array.as_any().downcast_ref::<Float64Array>() {
                    columns
                        .entry(field.name().clone())
                        .or_default()
                        .extend_from_slice(values.values());
                } else if let Some(values) = array.as_any().downcast_ref::<UInt32Array>() {
                    let name = field
                        .name()
                        .strip_prefix(QC_PREFIX)
                        .unwrap_or(field.name())
                        .to_string();
                    qc_columns
                        .entry(name)
                        .or_default()
                        .extend_from_slice(values.values());
                } else {
                    return Err(PipelineError::Storage(format!(
                        "column {} has unexpected type {}",
                        field.name(),
                        array.data_type()
                    )));
                }
            }
        }
    }

    let mut ds = Dataset::new();
    ds.attrs = metadata.attrs.clone();
    for meta in &metadata.variables {
        let data = columns.remove(&meta.name).ok_or_else(|| {
            PipelineError::Storage(format!("record is missing column '{}'", meta.name))
        })?;
        let mut var = Variable::new(meta.name.clone(), meta.dim.clone(), data);
        var.attrs = meta.attrs.clone();
        if meta.coordinate {
            ds.add_coord(var)?;
        } else {
            ds.add_data_var(var);
        }
    }
    for (name, meanings) in &metadata.qc {
        let values = qc_columns.remove(name).ok_or_else(|| {
            PipelineError::Storage(format!("record is missing QC column for '{name}'"))
        })?;
        ds.set_qc_flags(
            name,
            QcFlags {
                values,
                meanings: meanings.clone(),
            },
        );
    }
    ds.validate()?;
    Ok(ds)
}

/// Appends `next` to `acc` along `time`. Both must declare the same
/// variables; QC bits are remapped by test name.
fn concat_time(mut acc: Dataset, next: &Dataset) -> Result<Dataset> {
    let names = |ds: &Dataset| ds.variables().map(|v| v.name.clone()).collect::<Vec<_>>();
    if names(&acc) != names(next) {
        return Err(PipelineError::Storage(
            "records in the requested range declare different variables".to_string(),
        ));
    }
    let acc_len = acc.dim_len(TIME).unwrap_or(0);
    let next_len = next.dim_len(TIME).unwrap_or(0);

    for var in next.variables().filter(|v| v.dim == TIME) {
        if let Some(target) = acc.var_mut(&var.name) {
            target.data.extend_from_slice(&var.data);
        }
    }
    let flagged: BTreeSet<String> = acc
        .qc()
        .keys()
        .chain(next.qc().keys())
        .filter(|n| next.var(n).is_some_and(|v| v.dim == TIME))
        .cloned()
        .collect();
    for name in flagged {
        let mut merged = acc
            .take_qc_flags(&name)
            .unwrap_or_else(|| QcFlags::new(acc_len));
        match next.qc_flags(&name) {
            Some(incoming) => {
                let mut remap = Vec::with_capacity(incoming.meanings.len());
                for meaning in &incoming.meanings {
                    let bit =
                        merged.bit_for(&meaning.test, &meaning.description, meaning.assessment)?;
                    remap.push((meaning.bit, bit));
                }
                for value in &incoming.values {
                    let mut out = 0u32;
                    for (from, to) in &remap {
                        if value & (1 << from) != 0 {
                            out |= 1 << to;
                        }
                    }
                    merged.values.push(out);
                }
            }
            None => merged.values.extend(std::iter::repeat(0).take(next_len)),
        }
        acc.set_qc_flags(&name, merged);
    }
    acc.validate()?;
    Ok(acc)
}
