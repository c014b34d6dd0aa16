//! CSV export of query results.

use crate::error::{CopilotError, Result};
use crate::execution::QueryRows;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Write `rows` as CSV with a header line. Strings are written bare, nulls as empty
/// fields, numbers and booleans in their JSON form.
pub fn write_csv_to<W: Write>(rows: &QueryRows, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(rows.column_names())
        .map_err(csv_error)?;
    for row in &rows.rows {
        let record: Vec<String> = row.iter().map(cell_text).collect();
        csv_writer.write_record(&record).map_err(csv_error)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_csv(rows: &QueryRows, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    write_csv_to(rows, file)?;
    info!("Exported {} rows to {}", rows.row_count(), path.display());
    Ok(())
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_error(err: csv::Error) -> CopilotError {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => CopilotError::Io(e),
        other => CopilotError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{:?}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ColumnInfo;
    use serde_json::json;

    fn rows() -> QueryRows {
        QueryRows {
            columns: vec![
                ColumnInfo {
                    name: "product_category".to_string(),
                    data_type: "TEXT".to_string(),
                },
                ColumnInfo {
                    name: "category_revenue".to_string(),
                    data_type: "REAL".to_string(),
                },
            ],
            rows: vec![
                vec![json!("Home, Garden"), json!(120.5)],
                vec![json!("Toys"), json!(null)],
            ],
            truncated: false,
        }
    }

    #[test]
    fn test_csv_quotes_and_nulls() {
        let mut buffer = Vec::new();
        write_csv_to(&rows(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text,
            "product_category,category_revenue\n\"Home, Garden\",120.5\nToys,\n"
        );
    }

    #[test]
    fn test_write_csv_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("outputs").join("category.csv");
        write_csv(&rows(), &path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().starts_with("product_category,"));
    }
}
