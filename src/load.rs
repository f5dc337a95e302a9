use crate::error::{PipelineError, Result};
use crate::structs::{OutputFormat, PostingAge, RemoteShare};
use crate::transform::{cell_text, downcast};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use csv::Writer;
use log::debug;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

pub const SAMPLE_STEM: &str = "clean_postings_sample";
pub const REMOTE_SHARE_STEM: &str = "remote_share_by_work_type";
pub const POSTING_AGE_STEM: &str = "posting_age_by_remote";

/// Returns the first `size` rows of a table (the whole table if shorter).
pub fn sample_rows(batch: &RecordBatch, size: usize) -> RecordBatch {
    batch.slice(0, size.min(batch.num_rows()))
}

/// Writes all pipeline artifacts into `output_dir`.
///
/// CSV files are always written; `formats` may add JSON and Parquet copies.
/// Every file is first written next to its destination with a `.tmp` suffix,
/// and the staged files are only renamed over their destinations once all of
/// them were written. Existing files are replaced, never appended to.
///
/// # Arguments
/// * `output_dir` - Destination directory, created if absent
/// * `formats` - Requested output formats
/// * `sample` - Sample of the enriched postings table
/// * `remote_share` - Remote share per work type
/// * `posting_age` - Mean posting age per remote status
///
/// # Returns
/// Returns the written file paths, CSV files first.
///
/// # Errors
/// Returns `PipelineError::OutputWriteFailure` if the directory cannot be
/// created or a file cannot be written or renamed. Previously written outputs
/// are left untouched in that case.
pub fn write_outputs(
    output_dir: &Path,
    formats: &[OutputFormat],
    sample: &RecordBatch,
    remote_share: &[RemoteShare],
    posting_age: &[PostingAge],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir).map_err(|e| PipelineError::output(output_dir, e))?;

    let mut formats = formats.to_vec();
    formats.push(OutputFormat::Csv);
    formats.sort();
    formats.dedup();

    let mut staged = Vec::new();
    let result = stage_all(output_dir, &formats, sample, remote_share, posting_age, &mut staged)
        .and_then(|()| commit(&staged));
    if let Err(err) = result {
        for file in &staged {
            let _ = fs::remove_file(&file.staged);
        }
        return Err(err);
    }

    Ok(staged.into_iter().map(|file| file.target).collect())
}

struct StagedFile {
    staged: PathBuf,
    target: PathBuf,
}

fn stage_all(
    output_dir: &Path,
    formats: &[OutputFormat],
    sample: &RecordBatch,
    remote_share: &[RemoteShare],
    posting_age: &[PostingAge],
    staged: &mut Vec<StagedFile>,
) -> Result<()> {
    for &format in formats {
        let ext = format.extension();
        let sample_path = output_dir.join(format!("{}.{}", SAMPLE_STEM, ext));
        let share_path = output_dir.join(format!("{}.{}", REMOTE_SHARE_STEM, ext));
        let age_path = output_dir.join(format!("{}.{}", POSTING_AGE_STEM, ext));

        match format {
            OutputFormat::Csv => {
                staged.push(stage(sample_path, |w| write_table_csv(sample, w))?);
                staged.push(stage(share_path, |w| write_remote_share_csv(remote_share, w))?);
                staged.push(stage(age_path, |w| write_posting_age_csv(posting_age, w))?);
            }
            OutputFormat::Json => {
                staged.push(stage(sample_path, |w| write_table_json(sample, w))?);
                staged.push(stage(share_path, |w| write_json(remote_share, w))?);
                staged.push(stage(age_path, |w| write_json(posting_age, w))?);
            }
            OutputFormat::Parquet => {
                let share_batch = remote_share_batch(remote_share)?;
                let age_batch = posting_age_batch(posting_age)?;
                staged.push(stage(sample_path, |w| write_parquet(sample, w))?);
                staged.push(stage(share_path, |w| write_parquet(&share_batch, w))?);
                staged.push(stage(age_path, |w| write_parquet(&age_batch, w))?);
            }
        }
    }
    Ok(())
}

/// Writes one artifact to `<target>.tmp`.
fn stage<F>(target: PathBuf, write: F) -> Result<StagedFile>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let staged = sibling(&target, ".tmp");

    debug!("Staging {}", staged.display());
    let file = File::create(&staged).map_err(|e| PipelineError::output(&target, e))?;
    let mut writer = BufWriter::new(file);
    let written = write(&mut writer).and_then(|()| Ok(writer.flush()?));
    if let Err(err) = written {
        let _ = fs::remove_file(&staged);
        return Err(match err {
            PipelineError::Io(source) => PipelineError::output(&target, source),
            other => other,
        });
    }

    Ok(StagedFile { staged, target })
}

/// Moves every staged file over its destination.
///
/// Destinations are checked up front, and each replaced file is kept as a
/// `.bak` sibling until all renames went through, so a failure part-way
/// restores the previous outputs.
fn commit(staged: &[StagedFile]) -> Result<()> {
    for file in staged {
        if fs::metadata(&file.target).is_ok_and(|meta| meta.is_dir()) {
            return Err(PipelineError::output(
                &file.target,
                io::Error::other("destination is a directory"),
            ));
        }
    }

    let mut committed: Vec<(&StagedFile, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    for file in staged {
        match replace(file) {
            Ok(backup) => committed.push((file, backup)),
            Err(err) => {
                rollback(&committed);
                return Err(err);
            }
        }
        debug!("Wrote {}", file.target.display());
    }

    for backup in committed.into_iter().filter_map(|(_, backup)| backup) {
        let _ = fs::remove_file(backup);
    }
    Ok(())
}

/// Renames one staged file into place, returning the backup of the file it replaced.
fn replace(file: &StagedFile) -> Result<Option<PathBuf>> {
    let backup = if file.target.exists() {
        let backup = sibling(&file.target, ".bak");
        fs::rename(&file.target, &backup).map_err(|e| PipelineError::output(&file.target, e))?;
        Some(backup)
    } else {
        None
    };

    if let Err(err) = fs::rename(&file.staged, &file.target) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, &file.target);
        }
        return Err(PipelineError::output(&file.target, err));
    }
    Ok(backup)
}

fn rollback(committed: &[(&StagedFile, Option<PathBuf>)]) {
    for (file, backup) in committed.iter().rev() {
        match backup {
            Some(backup) => {
                let _ = fs::rename(backup, &file.target);
            }
            None => {
                let _ = fs::remove_file(&file.target);
            }
        }
    }
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes a table as CSV with a header row. Nulls become empty fields.
pub fn write_table_csv<W: Write>(batch: &RecordBatch, writer: W) -> Result<()> {
    let mut writer = Writer::from_writer(writer);
    let schema = batch.schema();
    writer.write_record(schema.fields().iter().map(|f| f.name().as_str()))?;

    let mut record = Vec::with_capacity(batch.num_columns());
    for row in 0..batch.num_rows() {
        record.clear();
        for column in batch.columns() {
            record.push(cell_text(column, row)?.unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes remote share rows as `work_type,remote_share`.
pub fn write_remote_share_csv<W: Write>(rows: &[RemoteShare], writer: W) -> Result<()> {
    let mut writer = Writer::from_writer(writer);
    writer.write_record(["work_type", "remote_share"])?;
    for row in rows {
        writer.write_record([row.work_type.clone(), format!("{:?}", row.remote_share)])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes posting age rows as `is_remote,avg_posting_age_days`; a missing
/// mean is an empty field.
pub fn write_posting_age_csv<W: Write>(rows: &[PostingAge], writer: W) -> Result<()> {
    let mut writer = Writer::from_writer(writer);
    writer.write_record(["is_remote", "avg_posting_age_days"])?;
    for row in rows {
        writer.write_record([
            row.is_remote.to_string(),
            row.avg_posting_age_days
                .map(|age| format!("{:?}", age))
                .unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes serializable rows as a pretty-formatted JSON array.
pub fn write_json<T: Serialize, W: Write>(rows: &[T], writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, rows)?;
    Ok(())
}

/// Writes a table as a pretty-formatted JSON array of objects, keeping the
/// column order of the schema.
pub fn write_table_json<W: Write>(batch: &RecordBatch, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, &JsonTable(batch))?;
    Ok(())
}

struct JsonTable<'a>(&'a RecordBatch);

struct JsonRow<'a> {
    batch: &'a RecordBatch,
    row: usize,
}

impl Serialize for JsonTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.num_rows()))?;
        for row in 0..self.0.num_rows() {
            seq.serialize_element(&JsonRow {
                batch: self.0,
                row,
            })?;
        }
        seq.end()
    }
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let schema = self.batch.schema();
        let mut map = serializer.serialize_map(Some(self.batch.num_columns()))?;
        for (field, column) in schema.fields().iter().zip(self.batch.columns()) {
            let value = cell_json(column, self.row).map_err(S::Error::custom)?;
            map.serialize_entry(field.name(), &value)?;
        }
        map.end()
    }
}

fn cell_json(column: &ArrayRef, row: usize) -> Result<Value> {
    if column.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match column.data_type() {
        DataType::Utf8 => Value::from(downcast::<StringArray>(column)?.value(row)),
        DataType::Int64 => Value::from(downcast::<Int64Array>(column)?.value(row)),
        DataType::Float64 => {
            let value = downcast::<Float64Array>(column)?.value(row);
            serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        DataType::Boolean => Value::from(downcast::<BooleanArray>(column)?.value(row)),
        other => {
            return Err(PipelineError::Data(format!(
                "Unsupported column type: {}",
                other
            )));
        }
    };
    Ok(value)
}

/// Writes a table to a Parquet file using the Arrow writer.
///
/// # Errors
/// Returns error if the schema cannot be mapped or the write fails.
pub fn write_parquet<W: Write + Send>(batch: &RecordBatch, writer: W) -> Result<()> {
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(writer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn remote_share_batch(rows: &[RemoteShare]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("work_type", DataType::Utf8, false),
        Field::new("remote_share", DataType::Float64, false),
    ]));
    let work_types: StringArray =
        StringArray::from_iter_values(rows.iter().map(|r| r.work_type.as_str()));
    let shares: Float64Array = rows.iter().map(|r| r.remote_share).collect();

    Ok(RecordBatch::try_new(
        schema,
        vec![Arc::new(work_types), Arc::new(shares)],
    )?)
}

fn posting_age_batch(rows: &[PostingAge]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("is_remote", DataType::Boolean, false),
        Field::new("avg_posting_age_days", DataType::Float64, true),
    ]));
    let is_remote: BooleanArray = rows.iter().map(|r| Some(r.is_remote)).collect();
    let ages: Float64Array = rows.iter().map(|r| r.avg_posting_age_days).collect();

    Ok(RecordBatch::try_new(
        schema,
        vec![Arc::new(is_remote), Arc::new(ages)],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::read_csv;
    use tempfile::TempDir;

    fn table() -> RecordBatch {
        read_csv(
            "job_id,title,remote_allowed,score\n1,\"Engineer, Senior\",1.0,0.5\n2,Analyst,,\n3,Nurse,0,2.25\n"
                .as_bytes(),
        )
        .unwrap()
    }

    fn shares() -> Vec<RemoteShare> {
        vec![
            RemoteShare {
                work_type: "Contract".to_string(),
                remote_share: 0.25,
            },
            RemoteShare {
                work_type: "Full-time".to_string(),
                remote_share: 1.0,
            },
        ]
    }

    fn ages() -> Vec<PostingAge> {
        vec![
            PostingAge {
                is_remote: false,
                avg_posting_age_days: Some(3.5),
            },
            PostingAge {
                is_remote: true,
                avg_posting_age_days: None,
            },
        ]
    }

    #[test]
    fn sample_takes_leading_rows() {
        let batch = table();
        assert_eq!(sample_rows(&batch, 2).num_rows(), 2);
        assert_eq!(sample_rows(&batch, 10).num_rows(), 3);
        assert_eq!(sample_rows(&batch, 0).num_rows(), 0);
    }

    #[test]
    fn table_csv_round_trips() {
        let batch = table();
        let mut out = Vec::new();
        write_table_csv(&batch, &mut out).unwrap();

        let back = read_csv(out.as_slice()).unwrap();
        assert_eq!(back.schema(), batch.schema());
        assert_eq!(back.num_rows(), batch.num_rows());
        for (a, b) in batch.columns().iter().zip(back.columns()) {
            assert_eq!(a.as_ref(), b.as_ref());
        }
    }

    #[test]
    fn aggregate_csv_layout() {
        let mut out = Vec::new();
        write_posting_age_csv(&ages(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "is_remote,avg_posting_age_days\nfalse,3.5\ntrue,\n"
        );

        let mut out = Vec::new();
        write_remote_share_csv(&shares(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "work_type,remote_share\nContract,0.25\nFull-time,1.0\n"
        );
    }

    #[test]
    fn table_json_keeps_column_order_and_nulls() {
        let mut out = Vec::new();
        write_table_json(&table(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let job_id = text.find("\"job_id\"").unwrap();
        let score = text.find("\"score\"").unwrap();
        assert!(job_id < score);

        let rows: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["remote_allowed"], Value::Null);
        assert_eq!(rows[0]["title"], "Engineer, Senior");
        assert_eq!(rows[2]["score"], 2.25);
    }

    #[test]
    fn writes_csv_outputs_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let out_dir = dir.path().join("nested").join("output");
        let target = out_dir.join("posting_age_by_remote.csv");
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(&target, "stale contents that are longer than the new file\n").unwrap();

        let written = write_outputs(&out_dir, &[], &table(), &shares(), &ages()).unwrap();
        assert_eq!(
            written,
            vec![
                out_dir.join("clean_postings_sample.csv"),
                out_dir.join("remote_share_by_work_type.csv"),
                target.clone(),
            ]
        );
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "is_remote,avg_posting_age_days\nfalse,3.5\ntrue,\n"
        );

        let leftovers = fs::read_dir(&out_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().unwrap() == "tmp")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn writes_every_requested_format() {
        let dir = TempDir::new().unwrap();
        let formats = [OutputFormat::Parquet, OutputFormat::Json];
        let written = write_outputs(dir.path(), &formats, &table(), &shares(), &ages()).unwrap();
        assert_eq!(written.len(), 9);
        assert!(written.iter().all(|p| p.exists()));
        assert_eq!(written[0].extension().unwrap(), "csv");
        assert_eq!(written[8].extension().unwrap(), "parquet");
    }

    #[test]
    fn unwritable_directory_is_output_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let err = write_outputs(&blocker.join("out"), &[], &table(), &shares(), &ages())
            .unwrap_err();
        match err {
            PipelineError::OutputWriteFailure { path, .. } => {
                assert_eq!(path, blocker.join("out"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_commit_keeps_every_previous_output() {
        let dir = TempDir::new().unwrap();
        let out_dir = dir.path().to_path_buf();
        let sample = out_dir.join("clean_postings_sample.csv");
        fs::write(&sample, "OLD").unwrap();
        let blocked = out_dir.join("posting_age_by_remote.csv");
        fs::create_dir_all(&blocked).unwrap();
        fs::write(blocked.join("keep"), "x").unwrap();

        let err = write_outputs(&out_dir, &[], &table(), &shares(), &ages()).unwrap_err();
        match err {
            PipelineError::OutputWriteFailure { path, .. } => assert_eq!(path, blocked),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(fs::read_to_string(&sample).unwrap(), "OLD");
        assert!(!out_dir.join("remote_share_by_work_type.csv").exists());
        let leftovers: Vec<_> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp") || name.ends_with(".bak"))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
    }

    #[test]
    fn rollback_restores_replaced_and_removes_new_targets() {
        let dir = TempDir::new().unwrap();
        let replaced = dir.path().join("replaced.csv");
        let created = dir.path().join("created.csv");
        fs::write(&replaced, "old").unwrap();

        let staged_replaced = sibling(&replaced, ".tmp");
        let staged_created = sibling(&created, ".tmp");
        fs::write(&staged_replaced, "new").unwrap();
        fs::write(&staged_created, "new").unwrap();
        let files = [
            StagedFile {
                staged: staged_replaced,
                target: replaced.clone(),
            },
            StagedFile {
                staged: staged_created,
                target: created.clone(),
            },
        ];

        let committed: Vec<_> = files
            .iter()
            .map(|file| (file, replace(file).unwrap()))
            .collect();
        assert_eq!(fs::read_to_string(&replaced).unwrap(), "new");

        rollback(&committed);
        assert_eq!(fs::read_to_string(&replaced).unwrap(), "old");
        assert!(!created.exists());
        assert!(!sibling(&replaced, ".bak").exists());
    }
}
