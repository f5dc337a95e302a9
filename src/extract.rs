use crate::error::{PipelineError, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, RecordBatchOptions, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use csv::ReaderBuilder;
use log::debug;
use std::{fs::File, io::ErrorKind, io::Read, path::Path, sync::Arc};

/// Raw tokens read as missing values.
const NULL_TOKENS: [&str; 14] = [
    "", "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "NULL", "null", "None", "<NA>", "#N/A",
    "#NA",
];

/// Reads a postings CSV file into a single in-memory RecordBatch.
///
/// Every row and column of the file is kept. Column types are inferred from
/// the raw text, see [`infer_type`].
///
/// # Errors
///
/// Returns `PipelineError::InputNotFound` if the path does not exist, or a CSV
/// error if the file is malformed.
pub fn read_postings(path: &Path) -> Result<RecordBatch> {
    debug!("Reading CSV file: {}", path.display());
    let file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => PipelineError::InputNotFound {
            path: path.to_path_buf(),
        },
        _ => PipelineError::Io(err),
    })?;
    read_csv(file)
}

/// Reads CSV data with a header row from any reader.
pub fn read_csv<R: Read>(reader: R) -> Result<RecordBatch> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();

    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    let mut num_rows = 0;
    for result in rdr.records() {
        let record = result?;
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(record.get(idx).filter(|raw| !is_null_token(raw)).map(String::from));
        }
        num_rows += 1;
    }
    debug!("Read {} rows across {} columns", num_rows, headers.len());

    let mut fields = Vec::with_capacity(headers.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(headers.len());
    for (name, values) in headers.iter().zip(columns) {
        let data_type = infer_type(&values);
        arrays.push(build_array(&data_type, values)?);
        fields.push(Field::new(name, data_type, true));
    }

    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    let batch = RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)?;
    Ok(batch)
}

/// Any spelling of NaN is missing too, since `f64` parsing accepts them all.
fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw) || raw.trim_start_matches(['+', '-']).eq_ignore_ascii_case("nan")
}

/// Picks the narrowest type that fits every non-missing value of a column.
///
/// Integers win over floats, floats over booleans, and anything else is text.
/// A column without any value is text.
fn infer_type(values: &[Option<String>]) -> DataType {
    let mut present = values.iter().flatten().peekable();
    if present.peek().is_none() {
        return DataType::Utf8;
    }

    let present: Vec<&String> = present.collect();
    if present.iter().all(|v| v.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if present.iter().all(|v| v.parse::<f64>().is_ok()) {
        DataType::Float64
    } else if present.iter().all(|v| parse_bool(v).is_some()) {
        DataType::Boolean
    } else {
        DataType::Utf8
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn build_array(data_type: &DataType, values: Vec<Option<String>>) -> Result<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| v.as_deref().map(str::parse::<i64>).transpose())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| PipelineError::Data(format!("Invalid integer: {}", e)))?,
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| v.as_deref().map(str::parse::<f64>).transpose())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| PipelineError::Data(format!("Invalid float: {}", e)))?,
        )),
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| v.as_deref().and_then(parse_bool))
                .collect::<Vec<_>>(),
        )),
        DataType::Utf8 => Arc::new(StringArray::from(values)),
        other => {
            return Err(PipelineError::Data(format!(
                "Unsupported inferred type: {}",
                other
            )));
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;

    const SAMPLE: &str = "\
job_id,title,remote_allowed,listed_time,salary,flag
1,Engineer,1.0,1700000000,,true
2,\"Analyst, Data\",,1700086400,NaN,False
3,Nurse,NaN,,55000.5,
";

    #[test]
    fn keeps_every_row_and_column() {
        let batch = read_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 6);
        let names: Vec<_> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            ["job_id", "title", "remote_allowed", "listed_time", "salary", "flag"]
        );
    }

    #[test]
    fn infers_column_types_from_text() {
        let batch = read_csv(SAMPLE.as_bytes()).unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Int64);
        assert_eq!(schema.field(4).data_type(), &DataType::Float64);
        assert_eq!(schema.field(5).data_type(), &DataType::Boolean);
    }

    #[test]
    fn null_tokens_become_nulls() {
        let batch = read_csv(SAMPLE.as_bytes()).unwrap();
        let remote = batch.column(2);
        assert!(!remote.is_null(0));
        assert!(remote.is_null(1));
        assert!(remote.is_null(2));
        assert!(batch.column(3).is_null(2));
        assert_eq!(batch.column(4).null_count(), 2);
    }

    #[test]
    fn every_nan_spelling_is_missing() {
        let batch = read_csv("score\n1.5\nNAN\n+nan\n-NaN\nnAn\n".as_bytes()).unwrap();
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Float64);
        assert_eq!(batch.column(0).null_count(), 4);
    }

    #[test]
    fn quoted_fields_are_kept_verbatim() {
        let batch = read_csv(SAMPLE.as_bytes()).unwrap();
        let titles = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(titles.value(1), "Analyst, Data");
    }

    #[test]
    fn header_only_file_gives_empty_text_columns() {
        let batch = read_csv("job_id,work_type\n".as_bytes()).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn missing_file_is_input_not_found() {
        let err = read_postings(Path::new("does/not/exist.csv")).unwrap_err();
        match err {
            PipelineError::InputNotFound { path } => {
                assert_eq!(path, Path::new("does/not/exist.csv"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = read_csv("a,b\n1,2\n3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::Csv(_)));
    }
}
