use crate::error::{PipelineError, Result};
use crate::structs::{
    ColumnMissing, IS_REMOTE, LISTED_DATE, LISTED_TIME, POSTING_AGE_DAYS, PostingAge,
    REMOTE_ALLOWED, RemoteOverview, RemoteShare, TimeUnit, WORK_TYPE,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field, FieldRef, Schema};
use chrono::DateTime;
use log::debug;
use std::{collections::BTreeMap, sync::Arc};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Text values read as a negative remote indicator (compared trimmed and case-insensitively).
const FALSY_WORDS: [&str; 6] = ["false", "f", "no", "n", "0", "0.0"];

/// A raw remote indicator value, as typed by the loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Indicator<'a> {
    Number(f64),
    Flag(bool),
    Text(&'a str),
}

/// Restricts a table to the given columns, in the given order.
///
/// Row order and row count are preserved.
///
/// # Arguments
///
/// * `batch` - Raw table as produced by the loader
/// * `columns` - Allow-list of column names to keep
///
/// # Errors
///
/// Returns `PipelineError::SchemaMismatch` naming every allow-listed column
/// that the table does not have.
pub fn select_columns(batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut indices = Vec::with_capacity(columns.len());
    let mut missing = Vec::new();
    for name in columns {
        match schema.index_of(name) {
            Ok(idx) => indices.push(idx),
            Err(_) => missing.push(name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(PipelineError::SchemaMismatch { missing });
    }

    debug!("Projecting {} of {} columns", indices.len(), schema.fields().len());
    Ok(batch.project(&indices)?)
}

/// Remote-work rule applied to a single posting.
///
/// A posting is remote only when its indicator is present and truthy. A
/// missing indicator means the posting is not remote.
///
/// # Rules
///
/// - **Missing**: `false`
/// - **Number**: `true` when non-zero (NaN is `false`)
/// - **Flag**: the flag itself
/// - **Text**: `false` for blank text and the words in `FALSY_WORDS`, `true` otherwise
pub fn is_remote_posting(indicator: Option<Indicator<'_>>) -> bool {
    match indicator {
        None => false,
        Some(Indicator::Number(value)) => !value.is_nan() && value != 0.0,
        Some(Indicator::Flag(flag)) => flag,
        Some(Indicator::Text(text)) => {
            let text = text.trim();
            !text.is_empty()
                && !FALSY_WORDS
                    .iter()
                    .any(|word| word.eq_ignore_ascii_case(text))
        }
    }
}

/// Adds the derived posting features to a selected table.
///
/// The input table is left untouched; a new table is returned with three
/// extra columns appended:
///
/// - `is_remote`: [`is_remote_posting`] applied to `remote_allowed`
/// - `posting_age_days`: days between each listing and the newest listing of
///   the table, null where `listed_time` is missing
/// - `listed_date`: `listed_time` as a UTC date-time string
///
/// # Arguments
///
/// * `batch` - Table holding at least `remote_allowed` and `listed_time`
/// * `unit` - Unit of the epoch values in `listed_time`
///
/// # Errors
///
/// Returns `PipelineError::Data` if a required column is absent or if
/// `listed_time` is not numeric.
pub fn add_features(batch: &RecordBatch, unit: TimeUnit) -> Result<RecordBatch> {
    let remote_col = get_column(batch, REMOTE_ALLOWED)?;
    let is_remote = (0..batch.num_rows())
        .map(|i| indicator_at(remote_col, i).map(is_remote_posting))
        .collect::<Result<Vec<bool>>>()?;

    let listed = numeric_values(batch, LISTED_TIME)?;

    // The newest listing has to be known before any age can be computed.
    let newest = listed.iter().flatten().copied().reduce(f64::max);
    debug!("Newest listing timestamp: {:?}", newest);

    let per_day = unit.per_day();
    let ages: Vec<Option<f64>> = listed
        .iter()
        .map(|t| match (newest, t) {
            (Some(newest), Some(t)) => Some((newest - t) / per_day),
            _ => None,
        })
        .collect();
    let dates: Vec<Option<String>> = listed
        .iter()
        .map(|t| t.and_then(|t| format_listed_date(t, unit)))
        .collect();

    let schema = batch.schema();
    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    fields.push(Arc::new(Field::new(IS_REMOTE, DataType::Boolean, false)));
    fields.push(Arc::new(Field::new(POSTING_AGE_DAYS, DataType::Float64, true)));
    fields.push(Arc::new(Field::new(LISTED_DATE, DataType::Utf8, true)));

    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns.push(Arc::new(BooleanArray::from(is_remote)));
    columns.push(Arc::new(Float64Array::from(ages)));
    columns.push(Arc::new(StringArray::from(dates)));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Fraction of remote postings per `work_type`.
///
/// Rows without a `work_type` are not grouped. Results are ordered by
/// `work_type` (byte-wise lexical order).
pub fn remote_share_by_work_type(batch: &RecordBatch) -> Result<Vec<RemoteShare>> {
    let work_types = get_column(batch, WORK_TYPE)?;
    let is_remote = get_column_bool(batch, IS_REMOTE)?;

    let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for i in 0..batch.num_rows() {
        let Some(work_type) = cell_text(work_types, i)? else {
            continue;
        };
        let (remote, total) = groups.entry(work_type).or_default();
        if is_remote.value(i) {
            *remote += 1;
        }
        *total += 1;
    }
    debug!("Found {} distinct work types", groups.len());

    Ok(groups
        .into_iter()
        .map(|(work_type, (remote, total))| RemoteShare {
            work_type,
            remote_share: remote as f64 / total as f64,
        })
        .collect())
}

/// Mean `posting_age_days` per `is_remote` group, `false` first.
///
/// Undefined ages are left out of both the sum and the count, so a group whose
/// ages are all undefined has no mean.
pub fn posting_age_by_remote(batch: &RecordBatch) -> Result<Vec<PostingAge>> {
    let is_remote = get_column_bool(batch, IS_REMOTE)?;
    let ages = get_column_f64(batch, POSTING_AGE_DAYS)?;

    let mut groups: BTreeMap<bool, (f64, usize)> = BTreeMap::new();
    for i in 0..batch.num_rows() {
        let (sum, count) = groups.entry(is_remote.value(i)).or_default();
        if ages.is_valid(i) {
            *sum += ages.value(i);
            *count += 1;
        }
    }

    Ok(groups
        .into_iter()
        .map(|(is_remote, (sum, count))| PostingAge {
            is_remote,
            avg_posting_age_days: (count > 0).then(|| sum / count as f64),
        })
        .collect())
}

/// Missing-value count and percentage (two decimals) per column, most
/// missing first. Ties keep the table's column order.
pub fn missing_summary(batch: &RecordBatch) -> Vec<ColumnMissing> {
    let rows = batch.num_rows();
    let schema = batch.schema();
    let mut summary: Vec<ColumnMissing> = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, column)| {
            let missing_count = column.null_count();
            let missing_pct = if rows == 0 {
                0.0
            } else {
                (missing_count as f64 * 100.0 / rows as f64 * 100.0).round() / 100.0
            };
            ColumnMissing {
                column: field.name().clone(),
                missing_count,
                missing_pct,
            }
        })
        .collect();
    summary.sort_by(|a, b| b.missing_count.cmp(&a.missing_count));
    summary
}

/// Dataset-wide count and percentage of remote postings.
pub fn remote_overview(batch: &RecordBatch) -> Result<RemoteOverview> {
    let is_remote = get_column_bool(batch, IS_REMOTE)?;
    let total_postings = batch.num_rows();
    let remote_postings = is_remote.true_count();
    let percent_remote =
        (total_postings > 0).then(|| remote_postings as f64 * 100.0 / total_postings as f64);
    Ok(RemoteOverview {
        total_postings,
        remote_postings,
        percent_remote,
    })
}

/// Renders a cell as text, `None` for nulls.
///
/// Floats always keep a fractional part (`1.0`, not `1`) so they read back as floats.
///
/// # Errors
///
/// Returns `PipelineError::Data` for column types the loader never produces.
pub(crate) fn cell_text(column: &ArrayRef, row: usize) -> Result<Option<String>> {
    if column.is_null(row) {
        return Ok(None);
    }
    let text = match column.data_type() {
        DataType::Utf8 => downcast::<StringArray>(column)?.value(row).to_string(),
        DataType::Int64 => downcast::<Int64Array>(column)?.value(row).to_string(),
        DataType::Float64 => format!("{:?}", downcast::<Float64Array>(column)?.value(row)),
        DataType::Boolean => downcast::<BooleanArray>(column)?.value(row).to_string(),
        other => {
            return Err(PipelineError::Data(format!(
                "Unsupported column type: {}",
                other
            )));
        }
    };
    Ok(Some(text))
}

fn indicator_at(column: &ArrayRef, row: usize) -> Result<Option<Indicator<'_>>> {
    if column.is_null(row) {
        return Ok(None);
    }
    let indicator = match column.data_type() {
        DataType::Int64 => Indicator::Number(downcast::<Int64Array>(column)?.value(row) as f64),
        DataType::Float64 => Indicator::Number(downcast::<Float64Array>(column)?.value(row)),
        DataType::Boolean => Indicator::Flag(downcast::<BooleanArray>(column)?.value(row)),
        DataType::Utf8 => Indicator::Text(downcast::<StringArray>(column)?.value(row)),
        other => {
            return Err(PipelineError::Data(format!(
                "Column {} has unsupported type {}",
                REMOTE_ALLOWED, other
            )));
        }
    };
    Ok(Some(indicator))
}

/// Reads a timestamp-like column as optional floats.
///
/// Non-finite values count as missing. A text column is accepted only when it
/// holds no value at all, which is what the loader produces for an empty or
/// fully-missing column.
fn numeric_values(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>> {
    let column = get_column(batch, name)?;
    match column.data_type() {
        DataType::Int64 => Ok(downcast::<Int64Array>(column)?
            .iter()
            .map(|v| v.map(|v| v as f64))
            .collect()),
        DataType::Float64 => Ok(downcast::<Float64Array>(column)?
            .iter()
            .map(|v| v.filter(|v| v.is_finite()))
            .collect()),
        _ if column.null_count() == column.len() => Ok(vec![None; column.len()]),
        other => Err(PipelineError::Data(format!(
            "Column {} is not numeric ({})",
            name, other
        ))),
    }
}

fn format_listed_date(value: f64, unit: TimeUnit) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let datetime = match unit {
        TimeUnit::Seconds => {
            let secs = value.floor();
            let nanos = ((value - secs) * 1e9) as u32;
            DateTime::from_timestamp(secs as i64, nanos)?
        }
        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(value.floor() as i64)?,
    };
    Some(datetime.format(DATE_FORMAT).to_string())
}

/// Looks up a column of a RecordBatch by name.
///
/// # Errors
///
/// Returns `PipelineError::Data` if the column doesn't exist.
fn get_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::Data(format!("Column not found: {}", name)))
}

/// Extracts a Float64 column from an Arrow RecordBatch by name.
///
/// # Errors
///
/// Returns `PipelineError::Data` if:
/// - Column with the specified name doesn't exist
/// - Column exists but is not of Float64 type
fn get_column_f64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    get_column(batch, name)?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| PipelineError::Data(format!("Column {} is not Float64", name)))
}

/// Extracts a Boolean column from an Arrow RecordBatch by name.
///
/// # Errors
///
/// Returns `PipelineError::Data` if:
/// - Column with the specified name doesn't exist
/// - Column exists but is not of Boolean type
fn get_column_bool<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray> {
    get_column(batch, name)?
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| PipelineError::Data(format!("Column {} is not Boolean", name)))
}

pub(crate) fn downcast<T: Array + 'static>(column: &ArrayRef) -> Result<&T> {
    column.as_any().downcast_ref::<T>().ok_or_else(|| {
        PipelineError::Data(format!(
            "Column of type {} could not be read",
            column.data_type()
        ))
    })
}
