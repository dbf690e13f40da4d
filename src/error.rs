use arrow_schema::ArrowError;

/// Every failure a pipeline run can end with.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parquet Error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Arrow Error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Data Error: {0}")]
    Data(String),
    #[error("Config Error: {0}")]
    Config(String),
    #[error("Retrieval Error: {0}")]
    Retrieval(String),
    #[error("Retrieval Error: missing required variable(s): {}", .0.join(", "))]
    MissingVariables(Vec<String>),
    #[error(
        "QC Failure: test '{test}' failed {failed}/{total} values of '{variable}' (tolerance {tolerance})"
    )]
    QcFailure {
        test: String,
        variable: String,
        failed: usize,
        total: usize,
        tolerance: f64,
    },
    #[error("Transform Error: {0}")]
    Transform(String),
    #[error("Storage Error: {0}")]
    Storage(String),
    #[error("Hook Error: {0}")]
    Hook(String),
    #[error("Run cancelled before stage {0}")]
    Cancelled(String),
}

impl PipelineError {
    /// True for failures raised while loading raw inputs.
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            PipelineError::Retrieval(_) | PipelineError::MissingVariables(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
