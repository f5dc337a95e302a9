use crate::error::PipelineError;
use crate::extract::read_postings;
use crate::load::{sample_rows, write_outputs};
use crate::structs::{
    ColumnMissing, KEEP_COLUMNS, PipelineConfig, PostingAge, RemoteOverview, RemoteShare,
};
use crate::transform::{
    add_features, cell_text, missing_summary, posting_age_by_remote, remote_overview,
    remote_share_by_work_type, select_columns,
};
use arrow_array::RecordBatch;
use log::{debug, info};
use std::{fmt, path::PathBuf, time::Instant};

/// Pipeline step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Select,
    Enrich,
    Aggregate,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Select => "select",
            Stage::Enrich => "enrich",
            Stage::Aggregate => "aggregate",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// A fatal error together with the step that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} step failed: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T> AtStage<T> for crate::error::Result<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|source| StageFailure { stage, source })
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub raw_rows: usize,
    pub raw_columns: usize,
    pub sample_rows: usize,
    pub missing: Vec<ColumnMissing>,
    pub overview: RemoteOverview,
    pub remote_share: Vec<RemoteShare>,
    pub posting_age: Vec<PostingAge>,
    pub written: Vec<PathBuf>,
}

/// Runs the postings pipeline once: load, select, enrich, aggregate, write.
///
/// Each step consumes the previous step's table. The first failure stops the
/// run and is returned with the step it happened in; outputs are only
/// replaced when every artifact was written.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport, StageFailure> {
    let start = Instant::now();
    let raw = read_postings(&config.input_path).at(Stage::Load)?;
    info!(
        "Loaded {} rows x {} columns from {} in {:.2?}",
        raw.num_rows(),
        raw.num_columns(),
        config.input_path.display(),
        start.elapsed()
    );
    debug!("Raw columns: {}", column_names(&raw).join(", "));

    let selected = select_columns(&raw, &KEEP_COLUMNS).at(Stage::Select)?;
    info!(
        "Selected {} rows x {} columns",
        selected.num_rows(),
        selected.num_columns()
    );
    log_head(&selected);

    let missing = missing_summary(&selected);
    info!("Missing values in core columns:");
    for column in &missing {
        info!(
            "  {:<28} {:>8} ({:.2}%)",
            column.column, column.missing_count, column.missing_pct
        );
    }

    let enrich_start = Instant::now();
    let enriched = add_features(&selected, config.time_unit).at(Stage::Enrich)?;
    debug!("Feature engineering took {:.2?}", enrich_start.elapsed());

    let aggregate_start = Instant::now();
    let overview = remote_overview(&enriched).at(Stage::Aggregate)?;
    let remote_share = remote_share_by_work_type(&enriched).at(Stage::Aggregate)?;
    let posting_age = posting_age_by_remote(&enriched).at(Stage::Aggregate)?;
    debug!("Aggregation took {:.2?}", aggregate_start.elapsed());

    match overview.percent_remote {
        Some(percent) => info!(
            "Remote postings: {} of {} ({:.2}%)",
            overview.remote_postings, overview.total_postings, percent
        ),
        None => info!("No postings to summarize"),
    }
    for share in &remote_share {
        info!("Remote share {:<16} {:.4}", share.work_type, share.remote_share);
    }
    for age in &posting_age {
        match age.avg_posting_age_days {
            Some(days) => info!("Avg posting age (remote={}): {:.2} days", age.is_remote, days),
            None => info!("Avg posting age (remote={}): n/a", age.is_remote),
        }
    }

    let sample = sample_rows(&enriched, config.sample_size);
    let write_start = Instant::now();
    let written = write_outputs(
        &config.output_dir,
        &config.formats,
        &sample,
        &remote_share,
        &posting_age,
    )
    .at(Stage::Write)?;
    debug!("Writing outputs took {:.2?}", write_start.elapsed());
    for path in &written {
        info!("Wrote {}", path.display());
    }

    Ok(PipelineReport {
        raw_rows: raw.num_rows(),
        raw_columns: raw.num_columns(),
        sample_rows: sample.num_rows(),
        missing,
        overview,
        remote_share,
        posting_age,
        written,
    })
}

fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

fn log_head(batch: &RecordBatch) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let head = sample_rows(batch, 5);
    for row in 0..head.num_rows() {
        let cells: Vec<String> = head
            .columns()
            .iter()
            .map(|column| {
                cell_text(column, row)
                    .ok()
                    .flatten()
                    .map(|text| text.chars().take(32).collect::<String>())
                    .unwrap_or_default()
            })
            .collect();
        debug!("  {}", cells.join(" | "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{OutputFormat, TimeUnit};
    use tempfile::TempDir;

    fn config(dir: &TempDir, input: &str) -> PipelineConfig {
        let input_path = dir.path().join("postings.csv");
        std::fs::write(&input_path, input).unwrap();
        PipelineConfig {
            input_path,
            output_dir: dir.path().join("output"),
            sample_size: 2,
            time_unit: TimeUnit::Seconds,
            formats: vec![OutputFormat::Csv],
        }
    }

    const INPUT: &str = "\
job_id,company_name,title,description,location,work_type,formatted_experience_level,remote_allowed,listed_time,max_salary
1,Acme,Engineer,Build,Austin,Full-time,Mid,1.0,1700086400,120000
2,Beta,Analyst,Count,Remote,Full-time,Entry,,1700000000,
3,Gamma,Nurse,Care,Boston,Part-time,Entry,,1699913600,
";

    #[test]
    fn run_reports_every_stage_result() {
        let dir = TempDir::new().unwrap();
        let report = run_pipeline(&config(&dir, INPUT)).unwrap();
        assert_eq!(report.raw_rows, 3);
        assert_eq!(report.raw_columns, 10);
        assert_eq!(report.sample_rows, 2);
        assert_eq!(report.overview.remote_postings, 1);
        assert_eq!(report.remote_share.len(), 2);
        assert_eq!(report.posting_age.len(), 2);
        assert_eq!(report.written.len(), 3);
    }

    #[test]
    fn missing_input_fails_at_load() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, INPUT);
        config.input_path = dir.path().join("absent.csv");
        let failure = run_pipeline(&config).unwrap_err();
        assert_eq!(failure.stage, Stage::Load);
        assert!(matches!(failure.source, PipelineError::InputNotFound { .. }));
        assert!(failure.to_string().starts_with("load step failed: "));
    }

    #[test]
    fn missing_column_fails_at_select() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "job_id,work_type\n1,Full-time\n");
        let failure = run_pipeline(&config).unwrap_err();
        assert_eq!(failure.stage, Stage::Select);
        assert!(failure.to_string().contains("listed_time"));
        assert!(!config.output_dir.exists());
    }

    #[test]
    fn text_timestamps_fail_at_enrich() {
        let dir = TempDir::new().unwrap();
        let input = INPUT.replace("1700000000", "last week");
        let failure = run_pipeline(&config(&dir, &input)).unwrap_err();
        assert_eq!(failure.stage, Stage::Enrich);
    }
}
