//! Core tabular model, domain catalog and key normalization for CMRT.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use polars::prelude::{
    col, BooleanChunked, DataFrame, DataType, Expr, IdxCa, IdxSize, IntoLazy, JoinArgs, JoinType,
    NamedFrom, PolarsError, Series, StringChunked, UniqueKeepStrategy,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "cmrt-core";

/// Prefix carried by every compliance-indicator code.
pub const CI_CODE_PREFIX: &str = "CI_";
/// Number of hex digest characters kept after the prefix.
pub const CI_CODE_HEX_LEN: usize = 6;

/// Closed line-of-business catalog used to build the setup universe.
pub const LOB_CATALOG: [&str; 14] = [
    "CREDIT",
    "FUNDING",
    "OPERATIONS",
    "TREASURY",
    "TRADE_FINANCE",
    "REMITTANCE",
    "CARD",
    "WEALTH",
    "BANCASSURANCE",
    "PAYROLL",
    "CASH_MANAGEMENT",
    "DIGITAL_BANKING",
    "CUSTOMER_SERVICE",
    "COMPLIANCE",
];

/// Canonical column names shared by ingestion, the reconciliation flows and exports.
pub mod columns {
    pub const BRANCH_ID: &str = "BRANCH_ID";
    pub const BRANCH_NAME: &str = "BRANCH_NAME";
    pub const AREA: &str = "AREA";
    pub const COMPANY_ID: &str = "COMPANY_ID";
    pub const LOB: &str = "LOB";
    pub const EMPLOYEE_ID: &str = "EMPLOYEE_ID";
    pub const STATUS: &str = "STATUS";
    pub const SUB_WP: &str = "SUB_WP";
    pub const PROCESS: &str = "PROCESS";
    pub const COMPLIANCE_INDICATOR: &str = "COMPLIANCE_INDICATOR";
    pub const CI_CODE: &str = "CI_CODE";
    pub const INSPECTION_CATEGORY: &str = "INSPECTION_CATEGORY";
    pub const PIC: &str = "PIC";
    pub const SCORE: &str = "SCORE";
    pub const TOTAL_SAMPLE: &str = "TOTAL_SAMPLE";
    pub const PROGRESS_STATUS: &str = "PROGRESS_STATUS";
    pub const EVIDENCE_FILE: &str = "EVIDENCE_FILE";
    pub const CENTRAL_FUNCTION: &str = "CENTRAL_FUNCTION";
}

pub type Cell = Option<String>;
pub type Row = Vec<Cell>;

/// Scratch column used to carry row positions through a partition.
const ROW_INDEX: &str = "__cmrt_row";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("missing column `{0}`")]
    MissingColumn(String),
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("row {row} has {found} cells, expected {expected}")]
    WidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("column `{column}` has {found} values but the table has {expected} rows")]
    HeightMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot append a table with columns {found:?} to one with columns {expected:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("dataframe operation failed: {0}")]
    Frame(String),
}

impl From<PolarsError> for TableError {
    fn from(err: PolarsError) -> Self {
        Self::Frame(err.to_string())
    }
}

/// Ordered records with named columns; every cell is a string or null.
///
/// Backed by a polars `DataFrame` whose columns are all `String` typed.
/// Column names are unique and every row is exactly as wide as the header.
/// Transformations return new tables and leave `self` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "RawTable", into = "RawTable")]
pub struct Table {
    frame: DataFrame,
}

/// Row-major wire form; deserialization goes through `Table::from_rows`.
#[derive(Serialize, Deserialize)]
struct RawTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl TryFrom<RawTable> for Table {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        Table::from_rows(raw.columns, raw.rows)
    }
}

impl From<Table> for RawTable {
    fn from(table: Table) -> Self {
        RawTable {
            columns: table.columns(),
            rows: table.to_rows(),
        }
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.columns() == other.columns() && self.frame.equals_missing(&other.frame)
    }
}

fn check_unique(columns: &[String]) -> Result<(), TableError> {
    let mut seen = HashSet::new();
    for name in columns {
        if !seen.insert(name.as_str()) {
            return Err(TableError::DuplicateColumn(name.clone()));
        }
    }
    Ok(())
}

impl Table {
    pub fn new<I, S>(columns: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_rows(columns, Vec::new())
    }

    pub fn from_rows<I, S>(columns: I, rows: Vec<Row>) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        check_unique(&columns)?;
        let mut values: Vec<Vec<Cell>> = vec![Vec::with_capacity(rows.len()); columns.len()];
        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::WidthMismatch {
                    row: idx,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            for (column, cell) in values.iter_mut().zip(row) {
                column.push(cell);
            }
        }
        let series: Vec<Series> = columns
            .iter()
            .zip(values)
            .map(|(name, cells)| Series::new(name, cells))
            .collect();
        Ok(Self {
            frame: DataFrame::new(series)?,
        })
    }

    /// Wraps an existing frame, casting every column to `String`.
    pub fn from_frame(frame: DataFrame) -> Result<Self, TableError> {
        let series = frame
            .get_columns()
            .iter()
            .map(|s| s.cast(&DataType::String))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            frame: DataFrame::new(series)?,
        })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn push_row(&mut self, row: Row) -> Result<(), TableError> {
        if row.len() != self.width() {
            return Err(TableError::WidthMismatch {
                row: self.height(),
                expected: self.width(),
                found: row.len(),
            });
        }
        let single = Self::from_rows(self.columns(), vec![row])?;
        self.frame.vstack_mut(&single.frame)?;
        Ok(())
    }

    pub fn columns(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn width(&self) -> usize {
        self.frame.width()
    }

    pub fn is_empty(&self) -> bool {
        self.height() == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.frame
            .get_column_index(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    pub fn require_columns(&self, names: &[&str]) -> Result<(), TableError> {
        for name in names {
            self.column_index(name)?;
        }
        Ok(())
    }

    pub fn strings(&self, name: &str) -> Result<&StringChunked, TableError> {
        let series = self
            .frame
            .column(name)
            .map_err(|_| TableError::MissingColumn(name.to_string()))?;
        Ok(series.str()?)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        if row >= self.height() {
            return None;
        }
        self.frame.get_columns().get(column)?.str().ok()?.get(row)
    }

    pub fn value(&self, row: usize, name: &str) -> Result<Option<&str>, TableError> {
        let idx = self.column_index(name)?;
        Ok(self.cell(row, idx))
    }

    /// Cells of one row in column order.
    pub fn row(&self, row: usize) -> Vec<Option<&str>> {
        (0..self.width()).map(|c| self.cell(row, c)).collect()
    }

    pub fn to_rows(&self) -> Vec<Row> {
        (0..self.height())
            .map(|r| {
                self.row(r)
                    .into_iter()
                    .map(|c| c.map(str::to_string))
                    .collect()
            })
            .collect()
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<Option<&str>>, TableError> {
        Ok(self.strings(name)?.into_iter().collect())
    }

    /// Distinct non-null values of a column in ascending order.
    pub fn distinct_values(&self, name: &str) -> Result<Vec<String>, TableError> {
        let set: BTreeSet<&str> = self.strings(name)?.into_iter().flatten().collect();
        Ok(set.into_iter().map(str::to_string).collect())
    }

    /// Header-only copy of this table.
    pub fn empty_like(&self) -> Self {
        Self {
            frame: self.frame.head(Some(0)),
        }
    }

    /// Rows at `indices`, in the order given. Out-of-range indices are ignored.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Self, TableError> {
        let height = self.height();
        let positions: Vec<IdxSize> = indices
            .iter()
            .filter(|&&i| i < height)
            .map(|&i| i as IdxSize)
            .collect();
        Ok(Self {
            frame: self.frame.take(&IdxCa::from_vec("", positions))?,
        })
    }

    /// Keeps rows whose value in `column` is non-null and contained in `allowed`.
    pub fn retain_in(&self, column: &str, allowed: &BTreeSet<String>) -> Result<Self, TableError> {
        let mask: BooleanChunked = self
            .strings(column)?
            .into_iter()
            .map(|v| v.is_some_and(|v| allowed.contains(v)))
            .collect();
        Ok(Self {
            frame: self.frame.filter(&mask)?,
        })
    }

    /// Adds `name` as a trailing column, or replaces it in place when it already exists.
    pub fn with_column(&self, name: &str, values: Vec<Cell>) -> Result<Self, TableError> {
        if values.len() != self.height() {
            return Err(TableError::HeightMismatch {
                column: name.to_string(),
                expected: self.height(),
                found: values.len(),
            });
        }
        let mut frame = self.frame.clone();
        frame.with_column(Series::new(name, values))?;
        Ok(Self { frame })
    }

    /// Columns `names` in the given order.
    pub fn project(&self, names: &[&str]) -> Result<Self, TableError> {
        self.require_columns(names)?;
        check_unique(&names.iter().map(|n| n.to_string()).collect::<Vec<_>>())?;
        Ok(Self {
            frame: self.frame.select(names.iter().copied())?,
        })
    }

    pub fn rename_column(&self, from: &str, to: &str) -> Result<Self, TableError> {
        self.column_index(from)?;
        if from != to && self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        let mut frame = self.frame.clone();
        frame.rename(from, to)?;
        Ok(Self { frame })
    }

    /// Drops the named columns; names not present are ignored.
    pub fn drop_columns(&self, names: &[&str]) -> Self {
        Self {
            frame: self.frame.drop_many(names),
        }
    }

    pub fn append(&mut self, other: &Table) -> Result<(), TableError> {
        if self.columns() != other.columns() {
            return Err(TableError::SchemaMismatch {
                expected: self.columns(),
                found: other.columns(),
            });
        }
        self.frame.vstack_mut(&other.frame)?;
        Ok(())
    }

    /// Every row of `self` paired with every row of `other`, `self`-row major.
    pub fn cross_join(&self, other: &Table) -> Result<Self, TableError> {
        if let Some(shared) = other.columns().into_iter().find(|c| self.has_column(c)) {
            return Err(TableError::DuplicateColumn(shared));
        }
        let frame = self
            .frame
            .clone()
            .lazy()
            .join(
                other.frame.clone().lazy(),
                Vec::<Expr>::new(),
                Vec::<Expr>::new(),
                JoinArgs::new(JoinType::Cross),
            )
            .collect()?;
        Self::from_frame(frame)
    }

    /// Left outer join on `keys`. Left rows keep their order and null keys match null keys.
    ///
    /// Non-key columns present on both sides must be renamed by the caller first.
    pub fn left_join(&self, other: &Table, keys: &[&str]) -> Result<Self, TableError> {
        self.require_columns(keys)?;
        other.require_columns(keys)?;
        if let Some(shared) = other
            .columns()
            .into_iter()
            .find(|c| !keys.contains(&c.as_str()) && self.has_column(c))
        {
            return Err(TableError::DuplicateColumn(shared));
        }
        let on: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
        let mut args = JoinArgs::new(JoinType::Left);
        args.join_nulls = true;
        let frame = self
            .frame
            .clone()
            .lazy()
            .join(other.frame.clone().lazy(), on.clone(), on, args)
            .collect()?;
        Self::from_frame(frame)
    }

    /// First row for every distinct `keys` tuple, in input order.
    pub fn unique_first(&self, keys: &[&str]) -> Result<Self, TableError> {
        self.require_columns(keys)?;
        let subset: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Ok(Self {
            frame: self
                .frame
                .unique_stable(Some(subset.as_slice()), UniqueKeepStrategy::First, None)?,
        })
    }

    /// Row positions for every distinct `keys` tuple, ordered by key.
    ///
    /// Null cells form their own key component; rows inside a group keep input order.
    pub fn group_rows(
        &self,
        keys: &[&str],
    ) -> Result<BTreeMap<Vec<Option<String>>, Vec<usize>>, TableError> {
        self.require_columns(keys)?;
        let mut groups = BTreeMap::new();
        if self.is_empty() {
            return Ok(groups);
        }
        let indexed = self.frame.with_row_index(ROW_INDEX, None)?;
        for part in indexed.partition_by_stable(keys.to_vec(), true)? {
            let mut key = Vec::with_capacity(keys.len());
            for name in keys {
                key.push(part.column(name)?.str()?.get(0).map(str::to_string));
            }
            let rows = part
                .column(ROW_INDEX)?
                .idx()?
                .into_no_null_iter()
                .map(|i| i as usize)
                .collect();
            groups.insert(key, rows);
        }
        Ok(groups)
    }
}

/// Collapses whitespace runs, trims and lowercases `text`.
///
/// Null input and text that is blank after normalization both yield `None`.
pub fn normalize_text(text: Option<&str>) -> Option<String> {
    let normalized = text?
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Short join code for a free-text compliance indicator.
///
/// `CI_` followed by the first six hex characters of the SHA-256 digest of the
/// normalized text. Texts that normalize identically share a code.
pub fn compliance_code(text: Option<&str>) -> Option<String> {
    let normalized = normalize_text(text)?;
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    Some(format!("{CI_CODE_PREFIX}{}", &digest[..CI_CODE_HEX_LEN]))
}

/// Null-safe numeric parse; blank or non-numeric cells are `None`.
pub fn parse_numeric(cell: Option<&str>) -> Option<f64> {
    cell.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetupStatus {
    Configured,
    NotConfigured,
}

impl SetupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "Configured",
            Self::NotConfigured => "NotConfigured",
        }
    }
}

impl fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Area/LOB selection owned by the caller and handed to each run.
///
/// `None` means "everything"; `reset` returns to that default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSelection {
    pub areas: Option<BTreeSet<String>>,
    pub lobs: Option<BTreeSet<String>>,
}

impl FilterSelection {
    pub fn with_areas<I, S>(mut self, areas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.areas = Some(areas.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_lobs<I, S>(mut self, lobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lobs = Some(lobs.into_iter().map(Into::into).collect());
        self
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_unrestricted(&self) -> bool {
        self.areas.is_none() && self.lobs.is_none()
    }

    pub fn apply(&self, table: &Table) -> Result<Table, TableError> {
        let mut out = table.clone();
        if let Some(areas) = &self.areas {
            out = out.retain_in(columns::AREA, areas)?;
        }
        if let Some(lobs) = &self.lobs {
            out = out.retain_in(columns::LOB, lobs)?;
        }
        Ok(out)
    }
}
