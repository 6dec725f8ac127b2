//! Column-oriented result tables.
//!
//! Results are assembled column by column in caller order (pixel data,
//! positions, channels) and written one row per sample.

use crate::error::{AppResult, DaqError};

/// Parallel columns of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnTable {
    columns: Vec<Vec<f64>>,
}

impl ColumnTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from columns; all columns must have the same length.
    pub fn from_columns<I, C>(columns: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<f64>>,
    {
        let mut table = Self::new();
        for column in columns {
            table.push_column(column)?;
        }
        Ok(table)
    }

    /// Table from rows; all rows must have the same length.
    pub fn from_rows<I, R>(rows: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[f64]>,
    {
        let mut columns: Vec<Vec<f64>> = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            let row = row.as_ref();
            if i == 0 {
                columns = row.iter().map(|v| vec![*v]).collect();
            } else if row.len() != columns.len() {
                return Err(DaqError::invalid(
                    "table",
                    format!("row {i} has {} values, expected {}", row.len(), columns.len()),
                ));
            } else {
                for (column, value) in columns.iter_mut().zip(row) {
                    column.push(*value);
                }
            }
        }
        Ok(Self { columns })
    }

    /// Append a column.
    pub fn push_column(&mut self, column: impl Into<Vec<f64>>) -> AppResult<()> {
        let column = column.into();
        if let Some(first) = self.columns.first() {
            if first.len() != column.len() {
                return Err(DaqError::invalid(
                    "table",
                    format!(
                        "column {} has {} rows, expected {}",
                        self.columns.len(),
                        column.len(),
                        first.len()
                    ),
                ));
            }
        }
        self.columns.push(column);
        Ok(())
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Column by index.
    pub fn column(&self, index: usize) -> Option<&[f64]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Rows in order.
    pub fn rows(&self) -> impl Iterator<Item = Vec<f64>> + '_ {
        (0..self.row_count()).map(move |r| self.columns.iter().map(|c| c[r]).collect())
    }

    /// Rows rendered as text, tab-delimited, one line each.
    pub fn to_tsv(&self) -> String {
        let mut out = String::new();
        for row in self.rows() {
            let line: Vec<String> = row.iter().map(f64::to_string).collect();
            out.push_str(&line.join("\t"));
            out.push('\n');
        }
        out
    }
}
