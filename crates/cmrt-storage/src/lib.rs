//! Spreadsheet ingestion, table export and hash-addressed report storage for CMRT.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use calamine::{open_workbook_auto, Data, Reader};
use cmrt_core::{Row, Table, TableError};
use parquet::arrow::ArrowWriter;
use rust_xlsxwriter::{Workbook, XlsxError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmrt-storage";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
/// Worksheet name used for exported result workbooks.
pub const RESULT_SHEET: &str = "Result";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("opening {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("reading {name}{}: {source}", line_suffix(.line))]
    Csv {
        name: String,
        line: Option<u64>,
        source: csv::Error,
    },
    #[error("{name}: {source}")]
    Table { name: String, source: TableError },
    #[error("writing csv: {0}")]
    CsvWrite(#[from] csv::Error),
    #[error("flushing csv buffer: {0}")]
    Flush(#[from] std::io::Error),
    #[error("building record batch: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("writing parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        source: calamine::Error,
    },
    #[error("workbook {path} has no worksheet")]
    EmptyWorkbook { path: PathBuf },
    #[error("writing xlsx: {0}")]
    XlsxWrite(#[from] XlsxError),
    #[error("table does not fit in a worksheet: {rows} rows x {columns} columns")]
    SheetBounds { rows: usize, columns: usize },
}

/// Reads a CSV upload with a header row.
///
/// Header names and cell values are whitespace-trimmed; blank cells become
/// null. Errors name the file (and line, when known).
pub fn read_csv_table(path: impl AsRef<Path>) -> Result<Table, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv_from(file, &path.display().to_string())
}

pub fn read_csv_from<R: Read>(reader: R, name: &str) -> Result<Table, StorageError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|source| csv_error(name, source))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|source| csv_error(name, source))?;
        let row: Row = record
            .iter()
            .map(|v| {
                let v = v.trim();
                if v.is_empty() {
                    None
                } else {
                    Some(v.to_string())
                }
            })
            .collect();
        rows.push(row);
    }
    let table = Table::from_rows(headers, rows).map_err(|source| StorageError::Table {
        name: name.to_string(),
        source,
    })?;
    debug!(name, rows = table.height(), columns = table.width(), "ingested csv table");
    Ok(table)
}

/// Reads the first worksheet of an Excel workbook; the first row is the header.
///
/// Every cell is read as text. Headers and values are trimmed and blank cells
/// become null, the same as CSV uploads.
pub fn read_xlsx_table(path: impl AsRef<Path>) -> Result<Table, StorageError> {
    let path = path.as_ref();
    let name = path.display().to_string();
    let workbook_error = |source| StorageError::Workbook {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook = open_workbook_auto(path).map_err(workbook_error)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| StorageError::EmptyWorkbook {
            path: path.to_path_buf(),
        })?
        .map_err(workbook_error)?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|header| {
            header
                .iter()
                .map(|h| h.to_string().trim_start_matches('\u{feff}').trim().to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let body: Vec<Row> = rows
        .map(|row| row.iter().map(sheet_cell).collect())
        .collect();
    let table = Table::from_rows(headers, body).map_err(|source| StorageError::Table {
        name: name.clone(),
        source,
    })?;
    debug!(name, rows = table.height(), columns = table.width(), "ingested xlsx table");
    Ok(table)
}

fn sheet_cell(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        other => {
            let text = other.to_string();
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }
    }
}

/// Reads an upload, choosing the Excel reader for `.xlsx`, `.xlsm` and `.xls` files and CSV otherwise.
pub fn read_table(path: impl AsRef<Path>) -> Result<Table, StorageError> {
    let path = path.as_ref();
    let is_workbook = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "xlsx" | "xlsm" | "xls"));
    if is_workbook {
        read_xlsx_table(path)
    } else {
        read_csv_table(path)
    }
}

fn line_suffix(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

fn csv_error(name: &str, source: csv::Error) -> StorageError {
    StorageError::Csv {
        name: name.to_string(),
        line: source.position().map(|p| p.line()),
        source,
    }
}

/// CSV serialization of a table; nulls are written as empty cells.
pub fn csv_bytes(table: &Table) -> Result<Vec<u8>, StorageError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(table.columns())?;
    for row in 0..table.height() {
        wtr.write_record(table.row(row).into_iter().map(|c| c.unwrap_or("")))?;
    }
    wtr.into_inner().map_err(|e| StorageError::Flush(e.into_error()))
}

/// Parquet serialization of a table; every column is nullable UTF-8.
pub fn parquet_bytes(table: &Table) -> Result<Vec<u8>, StorageError> {
    let schema = Arc::new(Schema::new(
        table
            .columns()
            .iter()
            .map(|c| ArrowField::new(c.as_str(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrays = table
        .columns()
        .iter()
        .map(|name| Ok(Arc::new(StringArray::from(table.column_values(name)?)) as ArrayRef))
        .collect::<Result<Vec<_>, TableError>>()
        .map_err(|source| StorageError::Table {
            name: "parquet export".to_string(),
            source,
        })?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

/// Single-sheet xlsx workbook of a table; every cell is written as text and nulls stay blank.
pub fn xlsx_bytes(table: &Table) -> Result<Vec<u8>, StorageError> {
    let bounds = || StorageError::SheetBounds {
        rows: table.height(),
        columns: table.width(),
    };
    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name(RESULT_SHEET)?;
        for (c, name) in table.columns().iter().enumerate() {
            let col = u16::try_from(c).map_err(|_| bounds())?;
            sheet.write_string(0, col, name.as_str())?;
        }
        for r in 0..table.height() {
            let row = u32::try_from(r + 1).map_err(|_| bounds())?;
            for (c, cell) in table.row(r).into_iter().enumerate() {
                if let Some(text) = cell {
                    let col = u16::try_from(c).map_err(|_| bounds())?;
                    sheet.write_string(row, col, text)?;
                }
            }
        }
    }
    Ok(workbook.save_to_buffer()?)
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub file_name: String,
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes run outputs under `<root>/<run_id>/` with atomic temp-file renames.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn store_bytes(
        &self,
        run_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let span = info_span!("store_report", run_id, file_name);
        let _guard = span.enter();

        let relative_path = PathBuf::from(run_id).join(file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.run_dir(run_id);
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(bytes = bytes.len(), "stored report file");
        Ok(StoredReport {
            file_name: file_name.to_string(),
            sha256: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub fn store_table_csv(
        &self,
        run_id: &str,
        file_name: &str,
        table: &Table,
    ) -> anyhow::Result<StoredReport> {
        let bytes = csv_bytes(table).with_context(|| format!("serializing {file_name}"))?;
        self.store_bytes(run_id, file_name, &bytes)
    }

    pub fn store_table_parquet(
        &self,
        run_id: &str,
        file_name: &str,
        table: &Table,
    ) -> anyhow::Result<StoredReport> {
        let bytes = parquet_bytes(table).with_context(|| format!("serializing {file_name}"))?;
        self.store_bytes(run_id, file_name, &bytes)
    }

    pub fn store_table_xlsx(
        &self,
        run_id: &str,
        file_name: &str,
        table: &Table,
    ) -> anyhow::Result<StoredReport> {
        let bytes = xlsx_bytes(table).with_context(|| format!("serializing {file_name}"))?;
        self.store_bytes(run_id, file_name, &bytes)
    }

    /// Writes `manifest.json` listing `files` and returns the stored manifest.
    pub fn write_manifest(
        &self,
        run_id: &str,
        files: &[StoredReport],
    ) -> anyhow::Result<(ReportManifest, StoredReport)> {
        let manifest = ReportManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            files: files
                .iter()
                .map(|f| ReportManifestFile {
                    name: f.file_name.clone(),
                    path: f.file_name.clone(),
                    sha256: f.sha256.clone(),
                    bytes: f.byte_size as u64,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        let stored = self.store_bytes(run_id, MANIFEST_FILE, &bytes)?;
        Ok((manifest, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn sample_table() -> Table {
        Table::from_rows(
            ["BRANCH_ID", "AREA"],
            vec![
                vec![Some("B1".into()), Some("Area, North".into())],
                vec![Some("B2".into()), None],
            ],
        )
        .expect("table")
    }

    #[test]
    fn report_hashing_is_stable() {
        assert_eq!(
            ReportStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn ingestion_trims_headers_and_values() {
        let input = " BRANCH_ID , AREA ,LOB\nB1,  Area A ,CREDIT\nB2,,  \n";
        let table = read_csv_from(input.as_bytes(), "branches.csv").expect("parse");
        assert_eq!(
            table.columns(),
            &["BRANCH_ID".to_string(), "AREA".to_string(), "LOB".to_string()]
        );
        assert_eq!(table.value(0, "AREA").unwrap(), Some("Area A"));
        assert_eq!(table.value(1, "AREA").unwrap(), None);
        assert_eq!(table.value(1, "LOB").unwrap(), None);
    }

    #[test]
    fn ragged_rows_name_the_input() {
        let input = "A,B\n1,2\n3\n";
        let err = read_csv_from(input.as_bytes(), "setups.csv").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("setups.csv"), "{message}");
        assert!(matches!(err, StorageError::Csv { line: Some(_), .. }));
    }

    #[test]
    fn duplicate_headers_are_rejected() {
        let err = read_csv_from("A,A\n1,2\n".as_bytes(), "dup.csv").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Table {
                source: TableError::DuplicateColumn(_),
                ..
            }
        ));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_csv_table("/definitely/not/here.csv").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.csv"));
    }

    #[test]
    fn csv_export_round_trips_nulls_and_quoting() {
        let table = sample_table();
        let bytes = csv_bytes(&table).expect("csv");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert_eq!(text, "BRANCH_ID,AREA\nB1,\"Area, North\"\nB2,\n");
        let back = read_csv_from(bytes.as_slice(), "export").expect("reparse");
        assert_eq!(back, table);
    }

    #[test]
    fn parquet_export_keeps_columns_and_nulls() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.parquet");
        fs::write(&path, parquet_bytes(&sample_table()).expect("parquet")).expect("write");

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).expect("open"))
            .expect("builder")
            .build()
            .expect("reader");
        let batches = reader.collect::<Result<Vec<_>, _>>().expect("batches");
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(1).name(), "AREA");
        let area = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 column");
        assert_eq!(area.value(0), "Area, North");
        assert!(area.is_null(1));
    }

    #[test]
    fn xlsx_export_reads_back_as_the_same_table() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("result.xlsx");
        let table = Table::from_rows(
            ["BRANCH_ID", "TOTAL_SAMPLE", "AREA"],
            vec![
                vec![Some("B1".into()), Some("4".into()), Some("Area, North".into())],
                vec![Some("B2".into()), None, Some("007".into())],
            ],
        )
        .expect("table");
        fs::write(&path, xlsx_bytes(&table).expect("xlsx")).expect("write");

        let back = read_table(&path).expect("read xlsx");
        assert_eq!(back, table);
        assert_eq!(back.value(1, "AREA").unwrap(), Some("007"));
    }

    #[test]
    fn xlsx_headers_are_trimmed_and_blank_cells_are_null() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("branches.xlsx");
        let mut workbook = Workbook::new();
        {
            let sheet = workbook.add_worksheet();
            sheet.write_string(0, 0, " BRANCH_ID ").expect("header");
            sheet.write_string(0, 1, "AREA ").expect("header");
            sheet.write_string(1, 0, "B1").expect("cell");
            sheet.write_string(1, 1, "   ").expect("cell");
            sheet.write_number(2, 0, 12).expect("cell");
            sheet.write_string(2, 1, " North ").expect("cell");
        }
        workbook.save(&path).expect("save");

        let table = read_xlsx_table(&path).expect("read");
        assert_eq!(table.columns(), vec!["BRANCH_ID", "AREA"]);
        assert_eq!(table.value(0, "AREA").unwrap(), None);
        assert_eq!(table.value(1, "BRANCH_ID").unwrap(), Some("12"));
        assert_eq!(table.value(1, "AREA").unwrap(), Some("North"));
    }

    #[test]
    fn unreadable_workbook_names_the_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.xlsx");
        fs::write(&path, b"not a zip archive").expect("write");
        let err = read_table(&path).unwrap_err();
        assert!(matches!(err, StorageError::Workbook { .. }));
        assert!(err.to_string().contains("broken.xlsx"));
    }

    #[test]
    fn store_writes_atomically_and_manifests_hashes() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let stored = store
            .store_table_csv("run-1", "result.csv", &sample_table())
            .expect("store");
        assert!(stored.absolute_path.exists());
        assert_eq!(stored.relative_path, PathBuf::from("run-1").join("result.csv"));

        let on_disk = fs::read(&stored.absolute_path).expect("read");
        assert_eq!(stored.sha256, ReportStore::sha256_hex(&on_disk));

        let (manifest, manifest_file) = store
            .write_manifest("run-1", std::slice::from_ref(&stored))
            .expect("manifest");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].bytes, on_disk.len() as u64);
        let parsed: ReportManifest =
            serde_json::from_slice(&fs::read(&manifest_file.absolute_path).expect("read manifest"))
                .expect("parse manifest");
        assert_eq!(parsed, manifest);

        let leftovers = fs::read_dir(store.run_dir("run-1"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
