use super::RowSet;
use crate::core::{Error, Result, Value};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};
use std::fmt;
use std::sync::Arc;

/// Maps a column name to the field key it should fill.
pub type ColumnMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

lazy_static! {
    static ref DEFAULT_API: Arc<ScanApi> = Arc::new(ScanApi::new());
}

/// Row scanning capability: turns a [`RowSet`] into typed destinations.
///
/// Destinations are any `serde::Deserialize` type. A row with exactly one
/// column may scan into a scalar (`i64`, `String`, `Option<_>`, ...);
/// otherwise each column fills the struct field of the same name. Column names
/// containing the separator (`.` by default) fill nested structs, so
/// `SELECT a AS "user.name"` populates `row.user.name`.
#[derive(Clone)]
pub struct ScanApi {
    column_separator: String,
    column_mapper: Option<ColumnMapper>,
}

impl ScanApi {
    pub fn new() -> Self {
        Self {
            column_separator: ".".to_string(),
            column_mapper: None,
        }
    }

    /// Process-wide default configuration.
    pub fn default_api() -> Arc<ScanApi> {
        Arc::clone(&DEFAULT_API)
    }

    /// Separator splitting a column name into nested field keys. Empty disables nesting.
    pub fn column_separator(mut self, separator: impl Into<String>) -> Self {
        self.column_separator = separator.into();
        self
    }

    pub fn column_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.column_mapper = Some(Arc::new(mapper));
        self
    }

    /// Scans every row. An empty set yields an empty vector.
    pub fn scan_all<T: DeserializeOwned>(&self, rows: RowSet) -> Result<Vec<T>> {
        let mut dst = Vec::with_capacity(rows.row_count());
        self.scan_all_into(&mut dst, rows)?;
        Ok(dst)
    }

    /// Scans every row into `dst`, replacing whatever it held before.
    pub fn scan_all_into<T: DeserializeOwned>(&self, dst: &mut Vec<T>, rows: RowSet) -> Result<()> {
        dst.clear();
        let columns = rows.columns().to_vec();
        for row in rows.into_rows() {
            dst.push(self.scan_row(&columns, row)?);
        }
        Ok(())
    }

    /// Scans the single row of `rows`, failing when there is not exactly one.
    pub fn scan_one<T: DeserializeOwned>(&self, rows: RowSet) -> Result<T> {
        match rows.row_count() {
            0 => Err(Error::NoRows),
            1 => {
                let columns = rows.columns().to_vec();
                let row = rows.into_rows().pop().ok_or(Error::NoRows)?;
                self.scan_row(&columns, row)
            }
            n => Err(Error::MultipleRows(n)),
        }
    }

    fn scan_row<T: DeserializeOwned>(&self, columns: &[String], row: Vec<Value>) -> Result<T> {
        if row.len() != columns.len() {
            return Err(Error::Scan(format!(
                "row has {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }

        let scalar_err = if row.len() == 1 {
            match serde_json::from_value::<T>(row[0].to_json()) {
                Ok(value) => return Ok(value),
                Err(err) => Some(err),
            }
        } else {
            None
        };

        let object = self.build_object(columns, &row)?;
        serde_json::from_value::<T>(object).map_err(|err| {
            Error::Scan(scalar_err.map(|e| e.to_string()).unwrap_or_else(|| err.to_string()))
        })
    }

    fn build_object(&self, columns: &[String], row: &[Value]) -> Result<Json> {
        let mut root = Map::new();

        for (column, value) in columns.iter().zip(row) {
            let key = match &self.column_mapper {
                Some(mapper) => mapper(column),
                None => column.clone(),
            };

            let path: Vec<&str> = if self.column_separator.is_empty() {
                vec![key.as_str()]
            } else {
                key.split(self.column_separator.as_str()).collect()
            };

            insert_path(&mut root, &path, value.to_json(), column)?;
        }

        Ok(Json::Object(root))
    }
}

fn insert_path(map: &mut Map<String, Json>, path: &[&str], value: Json, column: &str) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };

    if rest.is_empty() {
        if map.contains_key(*head) {
            return Err(Error::Scan(format!("column '{}' appears more than once", column)));
        }
        map.insert(head.to_string(), value);
        return Ok(());
    }

    let child = map
        .entry(head.to_string())
        .or_insert_with(|| Json::Object(Map::new()));
    match child {
        Json::Object(nested) => insert_path(nested, rest, value, column),
        _ => Err(Error::Scan(format!(
            "column '{}' conflicts with a scalar column '{}'",
            column, head
        ))),
    }
}

impl Default for ScanApi {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScanApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanApi")
            .field("column_separator", &self.column_separator)
            .field("column_mapper", &self.column_mapper.is_some())
            .finish()
    }
}
