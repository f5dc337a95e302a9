use log::{Level, Log, Metadata, Record as LogRecord};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default location of the raw postings export.
pub const DEFAULT_INPUT_PATH: &str = "data/postings.csv";

/// Default directory receiving the pipeline artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Number of leading rows kept in the cleaned sample artifact.
pub const DEFAULT_SAMPLE_SIZE: usize = 5000;

/// Columns kept from the raw export, in output order.
///
/// Salary and pay columns are left out because most postings do not fill them.
pub const KEEP_COLUMNS: [&str; 9] = [
    "job_id",
    "company_name",
    "title",
    "description",
    "location",
    "work_type",
    "formatted_experience_level",
    "remote_allowed",
    "listed_time",
];

pub const REMOTE_ALLOWED: &str = "remote_allowed";
pub const WORK_TYPE: &str = "work_type";
pub const LISTED_TIME: &str = "listed_time";

pub const IS_REMOTE: &str = "is_remote";
pub const POSTING_AGE_DAYS: &str = "posting_age_days";
pub const LISTED_DATE: &str = "listed_date";

/// Simple logger implementation
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &LogRecord) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error | Level::Warn => eprintln!("[{}] {}", record.level(), record.args()),
            _ => println!("[{}] {}", record.level(), record.args()),
        }
    }

    fn flush(&self) {}
}

/// Share of remote postings for one `work_type` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteShare {
    pub work_type: String,
    pub remote_share: f64,
}

/// Mean posting age for one `is_remote` group. `None` when no row of the
/// group has a listing timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingAge {
    pub is_remote: bool,
    pub avg_posting_age_days: Option<f64>,
}

/// Missing-value count for one column of the selected table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMissing {
    pub column: String,
    pub missing_count: usize,
    pub missing_pct: f64,
}

/// Dataset-wide remote share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOverview {
    pub total_postings: usize,
    pub remote_postings: usize,
    pub percent_remote: Option<f64>,
}

/// Unit of the epoch values stored in the `listed_time` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
}

impl TimeUnit {
    /// Number of raw units in one day.
    pub fn per_day(self) -> f64 {
        match self {
            TimeUnit::Seconds => 86_400.0,
            TimeUnit::Milliseconds => 86_400_000.0,
        }
    }
}

/// File formats the writer can emit. CSV is always produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum OutputFormat {
    Csv,
    Json,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Configuration for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub sample_size: usize,
    pub time_unit: TimeUnit,
    pub formats: Vec<OutputFormat>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from(DEFAULT_INPUT_PATH),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            sample_size: DEFAULT_SAMPLE_SIZE,
            time_unit: TimeUnit::Seconds,
            formats: vec![OutputFormat::Csv],
        }
    }
}
