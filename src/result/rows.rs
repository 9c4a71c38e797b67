use crate::core::Value;
use std::sync::Arc;

/// Fully drained result of one statement.
///
/// Drivers read every row off the wire before handing a `RowSet` back, so the
/// underlying cursor is always released by the time scanning starts.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.into(),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    /// Value of `column` in row `row`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}
