use super::settings::SessionView;
use super::sql::{ColumnSpec, Expr, Filter, Projection, Statement};
use crate::core::{DriverError, Error, Result, Value, codes};
use crate::result::RowSet;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub(super) struct Table {
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<Value>>,
    next_serial: i64,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| undefined_column(name))
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

pub(super) type Tables = BTreeMap<String, Table>;

/// Result of one statement: buffered rows plus the command's row count.
#[derive(Debug, Default)]
pub(super) struct Outcome {
    pub rows: RowSet,
    pub affected: u64,
}

impl Outcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(rows: RowSet) -> Self {
        let affected = rows.row_count() as u64;
        Self { rows, affected }
    }
}

pub(super) struct EvalContext<'a> {
    pub params: &'a [Value],
    pub view: &'a SessionView,
    /// `pg_sleep` already ran for this statement and evaluates to NULL.
    pub allow_sleep: bool,
}

type RowRef<'a> = Option<(&'a Table, &'a [Value])>;

pub(super) fn driver_error(code: &str, message: impl Into<String>) -> Error {
    Error::Driver(DriverError::with_code(code, message))
}

fn undefined_table(name: &str) -> Error {
    driver_error(
        codes::UNDEFINED_TABLE,
        format!("relation \"{}\" does not exist", name),
    )
}

fn undefined_column(name: &str) -> Error {
    driver_error(
        codes::UNDEFINED_COLUMN,
        format!("column \"{}\" does not exist", name),
    )
}

pub(super) fn eval(expr: &Expr, ctx: &EvalContext<'_>, row: RowRef<'_>) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Param(n) => ctx.params.get(n - 1).cloned().ok_or_else(|| {
            driver_error(
                codes::PROTOCOL_VIOLATION,
                format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    ctx.params.len(),
                    n
                ),
            )
        }),
        Expr::Column(name) => match row {
            Some((table, values)) => Ok(values[table.column_index(name)?].clone()),
            None => Err(undefined_column(name)),
        },
        Expr::Cast(inner, ty) => cast(eval(inner, ctx, row)?, ty),
        Expr::Now => Ok(Value::Timestamp(ctx.view.now)),
        Expr::CurrentDatabase => Ok(Value::Text(ctx.view.database.clone())),
        Expr::CurrentSetting(name) => ctx.view.show(name).map(Value::Text),
        Expr::Sleep(_) if ctx.allow_sleep => Ok(Value::Null),
        Expr::Sleep(_) => Err(driver_error(
            codes::FEATURE_NOT_SUPPORTED,
            "pg_sleep is only supported in a SELECT without FROM",
        )),
    }
}

fn invalid_input(ty: &str, value: &Value) -> Error {
    driver_error(
        codes::INVALID_TEXT_REPRESENTATION,
        format!("invalid input syntax for type {}: \"{}\"", ty, value),
    )
}

fn cast(value: Value, ty: &str) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match ty {
        "text" | "varchar" | "character varying" | "name" | "char" | "bpchar" => Ok(match value {
            Value::Text(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }),
        "int" | "int2" | "int4" | "int8" | "integer" | "bigint" | "smallint" => {
            let parsed = match &value {
                Value::Text(s) => s.trim().parse::<i64>().ok(),
                Value::Boolean(b) => Some(i64::from(*b)),
                Value::Float(f) if f.is_finite() => Some(f.round() as i64),
                other => other.as_i64(),
            };
            parsed
                .map(Value::Integer)
                .ok_or_else(|| invalid_input("integer", &value))
        }
        "float" | "float4" | "float8" | "real" | "double precision" | "numeric" | "decimal" => {
            let parsed = match &value {
                Value::Text(s) => s.trim().parse::<f64>().ok(),
                other => other.as_f64(),
            };
            parsed
                .map(Value::Float)
                .ok_or_else(|| invalid_input("double precision", &value))
        }
        "bool" | "boolean" => match &value {
            Value::Boolean(_) => Ok(value),
            Value::Text(s) => match s.trim().to_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => Ok(Value::Boolean(true)),
                "f" | "false" | "no" | "off" | "0" => Ok(Value::Boolean(false)),
                _ => Err(invalid_input("boolean", &value)),
            },
            _ => Err(invalid_input("boolean", &value)),
        },
        "json" | "jsonb" => match &value {
            Value::Json(_) => Ok(value),
            Value::Text(s) => serde_json::from_str(s)
                .map(Value::Json)
                .map_err(|_| invalid_input("json", &value)),
            other => Ok(Value::Json(other.to_json())),
        },
        "uuid" => match &value {
            Value::Uuid(_) => Ok(value),
            Value::Text(s) => Uuid::parse_str(s.trim())
                .map(Value::Uuid)
                .map_err(|_| invalid_input("uuid", &value)),
            _ => Err(invalid_input("uuid", &value)),
        },
        "timestamptz" | "timestamp" | "timestamp with time zone" | "timestamp without time zone" => match &value {
            Value::Timestamp(_) => Ok(value),
            Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| invalid_input("timestamp with time zone", &value)),
            _ => Err(invalid_input("timestamp with time zone", &value)),
        },
        _ => Ok(value),
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn matches(table: &Table, row: &[Value], filter: &[Filter], ctx: &EvalContext<'_>) -> Result<bool> {
    for condition in filter {
        let left = &row[table.column_index(&condition.column)?];
        let right = eval(&condition.value, ctx, Some((table, row)))?;
        if left.is_null() || right.is_null() || *left != right {
            return Ok(false);
        }
    }
    Ok(true)
}

fn check_unique(name: &str, table: &Table) -> Result<()> {
    for (idx, column) in table.columns.iter().enumerate() {
        if !column.unique {
            continue;
        }
        let mut seen: Vec<&Value> = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let value = &row[idx];
            if value.is_null() {
                continue;
            }
            if seen.iter().any(|v| *v == value) {
                return Err(driver_error(
                    codes::UNIQUE_VIOLATION,
                    format!(
                        "duplicate key value violates unique constraint \"{}_{}_key\"",
                        name, column.name
                    ),
                ));
            }
            seen.push(value);
        }
    }
    Ok(())
}

fn project(
    items: &[Projection],
    table: &Table,
    rows: &[&Vec<Value>],
    ctx: &EvalContext<'_>,
) -> Result<RowSet> {
    let counts = items
        .iter()
        .filter(|i| matches!(i, Projection::Count { .. }))
        .count();
    if counts > 0 {
        if counts != items.len() {
            return Err(driver_error(
                "42803",
                "column must appear in the GROUP BY clause or be used in an aggregate function",
            ));
        }
        let names = items
            .iter()
            .map(|i| match i {
                Projection::Count { name } => name.clone(),
                _ => String::new(),
            })
            .collect();
        let row = vec![Value::Integer(rows.len() as i64); items.len()];
        return Ok(RowSet::new(names, vec![row]));
    }

    let mut names = Vec::new();
    for item in items {
        match item {
            Projection::Wildcard => names.extend(table.column_names()),
            Projection::Expr { name, .. } => names.push(name.clone()),
            Projection::Count { .. } => {}
        }
    }

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(names.len());
        for item in items {
            match item {
                Projection::Wildcard => values.extend(row.iter().cloned()),
                Projection::Expr { expr, .. } => {
                    values.push(eval(expr, ctx, Some((table, row.as_slice())))?)
                }
                Projection::Count { .. } => {}
            }
        }
        out.push(values);
    }
    Ok(RowSet::new(names, out))
}

/// SELECT without FROM: one row of evaluated expressions.
pub(super) fn project_values(
    items: &[Projection],
    ctx: &EvalContext<'_>,
    limit: Option<usize>,
) -> Result<Outcome> {
    let mut names = Vec::with_capacity(items.len());
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Projection::Expr { expr, name } => {
                names.push(name.clone());
                values.push(eval(expr, ctx, None)?);
            }
            Projection::Count { name } => {
                names.push(name.clone());
                values.push(Value::Integer(1));
            }
            Projection::Wildcard => {
                return Err(driver_error(
                    codes::SYNTAX_ERROR,
                    "SELECT * with no tables specified is not valid",
                ));
            }
        }
    }
    let rows = if limit == Some(0) { vec![] } else { vec![values] };
    Ok(Outcome::rows(RowSet::new(names, rows)))
}

/// Runs a table statement against `tables`, recording every table it writes in `dirty`.
pub(super) fn execute(
    tables: &mut Tables,
    dirty: &mut BTreeSet<String>,
    stmt: Statement,
    ctx: &EvalContext<'_>,
) -> Result<Outcome> {
    match stmt {
        Statement::CreateTable {
            name,
            columns,
            if_not_exists,
        } => {
            if tables.contains_key(&name) {
                if if_not_exists {
                    return Ok(Outcome::empty());
                }
                return Err(driver_error(
                    codes::DUPLICATE_TABLE,
                    format!("relation \"{}\" already exists", name),
                ));
            }
            tables.insert(
                name.clone(),
                Table {
                    columns,
                    rows: Vec::new(),
                    next_serial: 1,
                },
            );
            dirty.insert(name);
            Ok(Outcome::empty())
        }

        Statement::DropTable { names, if_exists } => {
            for name in names {
                if tables.remove(&name).is_none() && !if_exists {
                    return Err(driver_error(
                        codes::UNDEFINED_TABLE,
                        format!("table \"{}\" does not exist", name),
                    ));
                }
                dirty.insert(name);
            }
            Ok(Outcome::empty())
        }

        Statement::Insert {
            table: name,
            columns,
            rows,
            returning,
        } => {
            let table = tables.get_mut(&name).ok_or_else(|| undefined_table(&name))?;
            let targets = match &columns {
                Some(cols) => cols
                    .iter()
                    .map(|c| table.column_index(c))
                    .collect::<Result<Vec<_>>>()?,
                None => (0..table.columns.len()).collect(),
            };

            let first_new = table.rows.len();
            for exprs in &rows {
                if exprs.len() > targets.len() {
                    return Err(driver_error(
                        codes::SYNTAX_ERROR,
                        "INSERT has more expressions than target columns",
                    ));
                }
                let mut row = vec![Value::Null; table.columns.len()];
                let mut provided = vec![false; table.columns.len()];
                for (expr, &idx) in exprs.iter().zip(&targets) {
                    row[idx] = eval(expr, ctx, None)?;
                    provided[idx] = true;
                }
                for (idx, column) in table.columns.iter().enumerate() {
                    if column.serial && !provided[idx] {
                        row[idx] = Value::Integer(table.next_serial);
                        table.next_serial += 1;
                    }
                }
                table.rows.push(row);
            }
            check_unique(&name, table)?;
            dirty.insert(name);

            let inserted: Vec<&Vec<Value>> = table.rows[first_new..].iter().collect();
            let affected = inserted.len() as u64;
            let rows = match returning {
                Some(items) => project(&items, table, &inserted, ctx)?,
                None => RowSet::empty(),
            };
            Ok(Outcome { rows, affected })
        }

        Statement::Update {
            table: name,
            assignments,
            filter,
            returning,
        } => {
            let table = tables.get_mut(&name).ok_or_else(|| undefined_table(&name))?;
            let targets = assignments
                .iter()
                .map(|(c, _)| table.column_index(c))
                .collect::<Result<Vec<_>>>()?;

            let mut updated = Vec::new();
            for idx in 0..table.rows.len() {
                if !matches(table, &table.rows[idx], &filter, ctx)? {
                    continue;
                }
                let mut new_values = Vec::with_capacity(assignments.len());
                for (_, expr) in &assignments {
                    new_values.push(eval(expr, ctx, Some((&*table, table.rows[idx].as_slice())))?);
                }
                for (value, &col) in new_values.into_iter().zip(&targets) {
                    table.rows[idx][col] = value;
                }
                updated.push(idx);
            }
            check_unique(&name, table)?;
            dirty.insert(name);

            let affected = updated.len() as u64;
            let rows = match returning {
                Some(items) => {
                    let refs: Vec<&Vec<Value>> = updated.iter().map(|&i| &table.rows[i]).collect();
                    project(&items, table, &refs, ctx)?
                }
                None => RowSet::empty(),
            };
            Ok(Outcome { rows, affected })
        }

        Statement::Delete {
            table: name,
            filter,
            returning,
        } => {
            let table = tables.get_mut(&name).ok_or_else(|| undefined_table(&name))?;
            let mut kept = Vec::with_capacity(table.rows.len());
            let mut removed = Vec::new();
            for row in std::mem::take(&mut table.rows) {
                if matches(table, &row, &filter, ctx)? {
                    removed.push(row);
                } else {
                    kept.push(row);
                }
            }
            table.rows = kept;
            dirty.insert(name);

            let affected = removed.len() as u64;
            let rows = match returning {
                Some(items) => {
                    let refs: Vec<&Vec<Value>> = removed.iter().collect();
                    project(&items, table, &refs, ctx)?
                }
                None => RowSet::empty(),
            };
            Ok(Outcome { rows, affected })
        }

        Statement::Select {
            items,
            from: Some(name),
            filter,
            order_by,
            limit,
        } => {
            let table = tables.get(&name).ok_or_else(|| undefined_table(&name))?;
            let mut selected = Vec::new();
            for row in &table.rows {
                if matches(table, row, &filter, ctx)? {
                    selected.push(row);
                }
            }
            if let Some((column, desc)) = order_by {
                let idx = table.column_index(&column)?;
                selected.sort_by(|a, b| {
                    let ord = compare(&a[idx], &b[idx]);
                    if desc { ord.reverse() } else { ord }
                });
            }
            if let Some(limit) = limit {
                selected.truncate(limit);
            }
            Ok(Outcome::rows(project(&items, table, &selected, ctx)?))
        }

        other => Err(driver_error(
            codes::FEATURE_NOT_SUPPORTED,
            format!("statement is not a table operation: {:?}", other),
        )),
    }
}
