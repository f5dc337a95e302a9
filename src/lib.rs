pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod structs;
pub mod transform;

// Re-export public API
pub use error::{PipelineError, Result};
pub use extract::{read_csv, read_postings};
pub use load::{sample_rows, write_outputs};
pub use pipeline::{PipelineReport, Stage, StageFailure, run_pipeline};
pub use structs::{
    ColumnMissing, KEEP_COLUMNS, OutputFormat, PipelineConfig, PostingAge, RemoteOverview,
    RemoteShare, SimpleLogger, TimeUnit,
};
pub use transform::{
    Indicator, add_features, is_remote_posting, missing_summary, posting_age_by_remote,
    remote_overview, remote_share_by_work_type, select_columns,
};
