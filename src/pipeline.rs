use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use crate::qc::{QcReport, run_quality_control};
use crate::retrieve::{Retriever, input_name};
use crate::storage::{FileSystemStorage, Provenance, RecordMetadata};
use crate::transform::transform;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Stages of a single pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Retrieving,
    Qc,
    Transforming,
    Storing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "INIT",
            Stage::Retrieving => "RETRIEVING",
            Stage::Qc => "QC",
            Stage::Transforming => "TRANSFORMING",
            Stage::Storing => "STORING",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// User code invoked at stage boundaries. Every method has a no-op default.
///
/// Hooks may modify the dataset in place; it is re-validated after each one
/// returns. They cannot skip or reorder stages.
pub trait PipelineHooks: Send + Sync {
    fn before_retrieve(&self, _inputs: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    /// Runs after retrieval, before quality control.
    fn hook_customize_dataset(&self, _ds: &mut Dataset) -> Result<()> {
        Ok(())
    }

    fn after_qc(&self, _ds: &mut Dataset, _report: &QcReport) -> Result<()> {
        Ok(())
    }

    /// Runs after transformation, before storage.
    fn hook_finalize_dataset(&self, _ds: &mut Dataset) -> Result<()> {
        Ok(())
    }

    /// Runs after the record is stored. Files written into `dir` are saved
    /// as ancillary files of the datastream.
    fn hook_plot_dataset(&self, _ds: &Dataset, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn on_transition(&self, _from: Stage, _to: Stage) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl PipelineHooks for NoHooks {}

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one run: every stage entered, the QC results and the stored
/// record, or the error that ended it.
#[derive(Debug)]
pub struct RunReport {
    pub transitions: Vec<Stage>,
    pub failed_at: Option<Stage>,
    pub error: Option<PipelineError>,
    pub qc: Option<QcReport>,
    pub record: Option<RecordMetadata>,
    pub ancillary: Vec<PathBuf>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            transitions: vec![Stage::Init],
            failed_at: None,
            error: None,
            qc: None,
            record: None,
            ancillary: Vec::new(),
        }
    }

    /// Current state; `Init` until the first transition.
    pub fn state(&self) -> Stage {
        self.transitions.last().copied().unwrap_or(Stage::Init)
    }

    pub fn succeeded(&self) -> bool {
        self.state() == Stage::Done
    }

    /// The stored record, or the error that failed the run.
    pub fn into_result(self) -> Result<RecordMetadata> {
        match (self.error, self.record) {
            (Some(err), _) => Err(err),
            (None, Some(record)) => Ok(record),
            (None, None) => Err(PipelineError::Storage(
                "run finished without storing a record".to_string(),
            )),
        }
    }
}

/// One configured pipeline. Immutable once built, so a single instance can
/// serve many runs in parallel.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    retriever: Retriever,
    storage: Arc<FileSystemStorage>,
    hooks: Box<dyn PipelineHooks>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Builds a pipeline writing to the storage area named in its config.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let storage = Arc::new(FileSystemStorage::new(config.storage.clone())?);
        Self::with_storage(Arc::new(config), storage)
    }

    /// Builds a pipeline sharing an existing storage area.
    pub fn with_storage(
        config: Arc<PipelineConfig>,
        storage: Arc<FileSystemStorage>,
    ) -> Result<Self> {
        let retriever = Retriever::from_config(&config.retriever)?;
        Ok(Self {
            config,
            retriever,
            storage,
            hooks: Box::new(NoHooks),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the no-op hooks.
    pub fn with_hooks(mut self, hooks: impl PipelineHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<FileSystemStorage> {
        &self.storage
    }

    /// Runs every stage against `inputs`. Never panics on pipeline errors;
    /// a failed run ends in `Stage::Failed` with the error attached.
    pub fn run(&self, inputs: &[PathBuf]) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::new();
        match self.execute(inputs, &mut report) {
            Ok(record) => {
                report.record = Some(record);
                self.advance(&mut report, Stage::Done);
                info!(
                    "[{}] Run completed in {:.2?}",
                    self.config.datastream(),
                    start.elapsed()
                );
            }
            Err(err) => {
                error!(
                    "[{}] Run failed during {}: {}",
                    self.config.datastream(),
                    report.state(),
                    err
                );
                report.failed_at = Some(report.state());
                report.error = Some(err);
                self.advance(&mut report, Stage::Failed);
            }
        }
        report
    }

    fn execute(&self, inputs: &[PathBuf], report: &mut RunReport) -> Result<RecordMetadata> {
        self.enter(report, Stage::Retrieving)?;
        self.hooks
            .before_retrieve(inputs)
            .map_err(|e| hook_error("before_retrieve", e))?;
        let mut ds = self.retriever.retrieve(inputs, &self.config.dataset)?;
        self.run_hook("hook_customize_dataset", &mut ds, |ds| {
            self.hooks.hook_customize_dataset(ds)
        })?;

        self.enter(report, Stage::Qc)?;
        let qc = run_quality_control(&mut ds, &self.config.quality)?;
        debug!(
            "QC ran {} test(s), {} value(s) flagged",
            qc.outcomes.len(),
            qc.total_failed()
        );
        self.run_hook("after_qc", &mut ds, |ds| self.hooks.after_qc(ds, &qc))?;
        report.qc = Some(qc);

        self.enter(report, Stage::Transforming)?;
        let mut ds = transform(ds, &self.config.dataset, &self.config.transform)?;
        self.run_hook("hook_finalize_dataset", &mut ds, |ds| {
            self.hooks.hook_finalize_dataset(ds)
        })?;

        self.enter(report, Stage::Storing)?;
        let input_files = inputs.iter().map(|p| input_name(p)).collect();
        let provenance = Provenance::new(input_files, self.config.hash()?);
        let record = self.storage.save_data(&ds, provenance)?;

        // The record is already committed; a failing plot hook only loses
        // the ancillary files.
        match self
            .storage
            .uploadable_dir(&record.datastream, |dir| self.hooks.hook_plot_dataset(&ds, dir))
        {
            Ok(saved) => report.ancillary = saved,
            Err(e) => warn!("hook_plot_dataset failed: {}", e),
        }
        Ok(record)
    }

    fn enter(&self, report: &mut RunReport, stage: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(stage.to_string()));
        }
        self.advance(report, stage);
        Ok(())
    }

    fn advance(&self, report: &mut RunReport, stage: Stage) {
        let from = report.state();
        debug!("[{}] {} -> {}", self.config.datastream(), from, stage);
        report.transitions.push(stage);
        self.hooks.on_transition(from, stage);
    }

    fn run_hook<F>(&self, name: &str, ds: &mut Dataset, hook: F) -> Result<()>
    where
        F: FnOnce(&mut Dataset) -> Result<()>,
    {
        hook(ds).map_err(|e| hook_error(name, e))?;
        ds.validate()
            .map_err(|e| PipelineError::Hook(format!("{name} left an invalid dataset: {e}")))
    }
}

fn hook_error(name: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Hook(_) => err,
        other => PipelineError::Hook(format!("{name}: {other}")),
    }
}

/// Runs independent input batches in parallel against the same pipeline.
/// Reports are returned in the order of `batches`.
pub fn run_many(pipeline: &Pipeline, batches: &[Vec<PathBuf>]) -> Vec<RunReport> {
    batches
        .par_iter()
        .map(|inputs| pipeline.run(inputs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::BUOY_YAML;
    use crate::dataset::Variable;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::from_yaml_str(BUOY_YAML).unwrap();
        config.storage.root = root.to_path_buf();
        config
    }

    fn input(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[derive(Default, Clone)]
    struct Recorder {
        transitions: Arc<Mutex<Vec<(Stage, Stage)>>>,
    }

    impl PipelineHooks for Recorder {
        fn on_transition(&self, from: Stage, to: Stage) {
            self.transitions.lock().unwrap().push((from, to));
        }

        fn hook_plot_dataset(&self, ds: &Dataset, dir: &Path) -> Result<()> {
            let n = ds.dim_len("time").unwrap_or(0);
            fs::write(dir.join("summary.txt"), format!("{n} samples"))?;
            Ok(())
        }
    }

    #[test]
    fn successful_run_visits_every_stage() {
        let tmp = tempdir().unwrap();
        let csv = input(&tmp, "buoy.csv", "time,temp_raw\n0,10\n60,20\n120,-999\n");
        let recorder = Recorder::default();
        let pipeline = Pipeline::new(config(&tmp.path().join("root")))
            .unwrap()
            .with_hooks(recorder.clone());
        let report = pipeline.run(&[csv]);

        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(
            report.transitions,
            vec![
                Stage::Init,
                Stage::Retrieving,
                Stage::Qc,
                Stage::Transforming,
                Stage::Storing,
                Stage::Done
            ]
        );
        assert_eq!(recorder.transitions.lock().unwrap().len(), 5);
        assert_eq!(report.qc.as_ref().unwrap().total_failed(), 1);
        assert_eq!(report.ancillary.len(), 1);
        let record = report.record.unwrap();
        assert_eq!(record.datastream, "humboldt.buoyz05.b1");
        assert_eq!(record.provenance.input_files, vec!["buoy.csv".to_string()]);
    }

    #[test]
    fn missing_column_fails_in_retrieval() {
        let tmp = tempdir().unwrap();
        let csv = input(&tmp, "buoy.csv", "time,salinity\n0,33\n");
        let pipeline = Pipeline::new(config(&tmp.path().join("root"))).unwrap();
        let report = pipeline.run(&[csv]);

        assert_eq!(report.state(), Stage::Failed);
        assert_eq!(report.failed_at, Some(Stage::Retrieving));
        assert!(report.error.as_ref().unwrap().is_retrieval());
        assert!(pipeline.storage().list_records("humboldt.buoyz05.b1").unwrap().is_empty());
    }

    struct Breaker;

    impl PipelineHooks for Breaker {
        fn hook_finalize_dataset(&self, ds: &mut Dataset) -> Result<()> {
            ds.add_data_var(Variable::new("extra", "time", vec![1.0]));
            Ok(())
        }
    }

    #[test]
    fn hook_leaving_invalid_dataset_fails_before_storage() {
        let tmp = tempdir().unwrap();
        let csv = input(&tmp, "buoy.csv", "time,temp_raw\n0,10\n60,20\n");
        let pipeline = Pipeline::new(config(&tmp.path().join("root")))
            .unwrap()
            .with_hooks(Breaker);
        let report = pipeline.run(&[csv]);

        assert_eq!(report.failed_at, Some(Stage::Transforming));
        assert!(matches!(report.error, Some(PipelineError::Hook(_))));
        assert!(report.record.is_none());
    }

    #[test]
    fn cancelled_token_stops_before_first_stage() {
        let tmp = tempdir().unwrap();
        let csv = input(&tmp, "buoy.csv", "time,temp_raw\n0,10\n");
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Pipeline::new(config(&tmp.path().join("root")))
            .unwrap()
            .with_cancellation(token);
        let report = pipeline.run(&[csv]);

        assert_eq!(report.transitions, vec![Stage::Init, Stage::Failed]);
        assert!(matches!(report.error, Some(PipelineError::Cancelled(_))));
    }

    #[test]
    fn run_many_keeps_batch_order() {
        let tmp = tempdir().unwrap();
        let a = input(&tmp, "a.csv", "time,temp_raw\n0,10\n");
        let b = input(&tmp, "b.csv", "time,temp_raw\n86400,11\n");
        let c = input(&tmp, "c.txt", "time,temp_raw\n0,12\n");
        let pipeline = Pipeline::new(config(&tmp.path().join("root"))).unwrap();
        let reports = run_many(&pipeline, &[vec![a], vec![b], vec![c]]);

        assert!(reports[0].succeeded());
        assert!(reports[1].succeeded());
        assert_eq!(reports[2].state(), Stage::Failed);
        assert_eq!(
            pipeline
                .storage()
                .list_records("humboldt.buoyz05.b1")
                .unwrap()
                .len(),
            2
        );
    }
}
