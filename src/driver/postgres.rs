// ============================================================================
// PostgreSQL driver backed by sqlx
// ============================================================================

use super::{Connect, Pool, Session};
use crate::connection::config::PoolConfig;
use crate::connection::dsn;
use crate::core::{DriverError, Error, Result, Value};
use crate::result::RowSet;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgConnection, PgPool, PgRow, PgSslMode,
    PgTypeInfo,
};
use sqlx::{Column, Connection, Postgres, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Error::Closed,
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                let message = db.message().to_string();
                Error::Driver(
                    DriverError::new(message)
                        .with_sqlstate(code)
                        .with_source(sqlx::Error::Database(db)),
                )
            }
            other => Error::Driver(DriverError::new(other.to_string()).with_source(other)),
        }
    }
}

/// Parses a connection string in URL (`postgres://...`) or libpq keyword form.
pub fn parse_dsn(input: &str) -> std::result::Result<PgConnectOptions, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty connection string".to_string());
    }
    if input.starts_with("postgres://") || input.starts_with("postgresql://") {
        return PgConnectOptions::from_str(input).map_err(|e| e.to_string());
    }

    let mut options = PgConnectOptions::new();
    for (key, value) in dsn::parse_keyword_dsn(input)? {
        options = match key.as_str() {
            "host" | "hostaddr" => options.host(&value),
            "port" => options.port(
                value
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {:?}", value))?,
            ),
            "dbname" => options.database(&value),
            "user" => options.username(&value),
            "password" => options.password(&value),
            "sslmode" => options.ssl_mode(
                PgSslMode::from_str(&value).map_err(|_| format!("invalid sslmode: {:?}", value))?,
            ),
            "sslrootcert" => options.ssl_root_cert(value.as_str()),
            "application_name" => options.application_name(&value),
            // Connect timeouts are governed by the pool's acquire timeout.
            "connect_timeout" => options,
            other => return Err(format!("unsupported connection parameter: {:?}", other)),
        };
    }
    Ok(options)
}

/// Opens sqlx pools for one endpoint.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    pool: PoolConfig,
    endpoint: String,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions, pool: PoolConfig) -> Self {
        let endpoint = format!(
            "{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or_default()
        );
        Self {
            options,
            pool,
            endpoint,
        }
    }

    pub fn from_dsn(input: &str, pool: PoolConfig) -> std::result::Result<Self, String> {
        pool.validate()?;
        Ok(Self::new(parse_dsn(input)?, pool))
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connect for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn Pool>> {
        let pool = self
            .pool
            .pool_options()
            .connect_with(self.options.clone())
            .await?;
        debug!(endpoint = %self.endpoint, "postgres pool opened");
        Ok(Arc::new(PgEndpoint {
            pool,
            endpoint: self.endpoint.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// An opened sqlx pool.
pub struct PgEndpoint {
    pool: PgPool,
    endpoint: String,
}

impl PgEndpoint {
    pub fn new(pool: PgPool, endpoint: impl Into<String>) -> Self {
        Self {
            pool,
            endpoint: endpoint.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Pool for PgEndpoint {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn acquire(&self) -> Result<Box<dyn Session>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession {
            conn: Some(conn),
            in_transaction: false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        debug!(endpoint = %self.endpoint, "postgres pool closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// A pooled sqlx connection.
///
/// A session dropped while a transaction block is open is detached from the
/// pool and closed instead of being handed to the next caller mid-transaction.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        self.conn.as_mut().ok_or(Error::Closed)
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                drop(conn.detach());
            }
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }
        let conn: &mut PgConnection = &mut *self.conn()?;
        let rows = query.fetch_all(conn).await?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let values = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        Ok(RowSet::new(columns, values))
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }
        let conn: &mut PgConnection = &mut *self.conn()?;
        let done = query.execute(conn).await?;
        Ok(done.rows_affected())
    }

    async fn execute_simple(&mut self, sql: &str) -> Result<()> {
        let conn: &mut PgConnection = &mut *self.conn()?;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn begin(&mut self, statement: &str) -> Result<()> {
        self.execute_simple(statement).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.execute_simple("COMMIT").await;
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    async fn rollback(&mut self) -> Result<()> {
        let result = self.execute_simple("ROLLBACK").await;
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }
}

/// NULL parameter with no declared type (OID 0), so the server infers it
/// from the column or expression it is compared with.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(UntypedNull),
        Value::Integer(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Boolean(b) => query.bind(*b),
        Value::Bytes(bytes) => query.bind(bytes.as_slice()),
        Value::Json(json) => query.bind(sqlx::types::Json(json)),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::Uuid(id) => query.bind(*id),
        Value::Array(items) => bind_array(query, items),
    }
}

/// Homogeneous arrays bind as Postgres arrays, anything else as JSONB.
fn bind_array<'q>(query: PgQuery<'q>, items: &'q [Value]) -> PgQuery<'q> {
    if items.iter().all(|v| matches!(v, Value::Integer(_))) {
        let values: Vec<i64> = items.iter().filter_map(Value::as_i64).collect();
        return query.bind(values);
    }
    if items.iter().all(|v| matches!(v, Value::Text(_))) {
        let values: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        return query.bind(values);
    }
    if items.iter().all(|v| matches!(v, Value::Float(_))) {
        let values: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
        return query.bind(values);
    }
    if items.iter().all(|v| matches!(v, Value::Boolean(_))) {
        let values: Vec<bool> = items
            .iter()
            .filter_map(|v| match v {
                Value::Boolean(b) => Some(*b),
                _ => None,
            })
            .collect();
        return query.bind(values);
    }
    let json = serde_json::Value::Array(items.iter().map(Value::to_json).collect());
    query.bind(sqlx::types::Json(json))
}

/// NUMERIC, INTERVAL, INET and friends have no lossless [`Value`] form and
/// their binary encoding is not text, so they must be cast in the query.
fn unsupported_column(row: &PgRow, idx: usize, type_name: &str) -> Error {
    Error::Scan(format!(
        "column {} has unsupported type {}; cast it in the query, e.g. {}::text",
        row.column(idx).name(),
        type_name,
        row.column(idx).name()
    ))
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| decode_column(row, idx)).collect()
}

fn decode_column(row: &PgRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => Value::Boolean(row.try_get(idx)?),
        "INT2" => Value::Integer(row.try_get::<i16, _>(idx)?.into()),
        "INT4" => Value::Integer(row.try_get::<i32, _>(idx)?.into()),
        "INT8" => Value::Integer(row.try_get(idx)?),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(idx)?.into()),
        "FLOAT8" => Value::Float(row.try_get(idx)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(idx)?),
        "BYTEA" => Value::Bytes(row.try_get(idx)?),
        "JSON" | "JSONB" => Value::Json(row.try_get(idx)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?.and_utc()),
        "DATE" => Value::Text(row.try_get::<NaiveDate, _>(idx)?.to_string()),
        "UUID" => Value::Uuid(row.try_get::<Uuid, _>(idx)?),
        "TEXT[]" | "VARCHAR[]" => Value::from(row.try_get::<Vec<String>, _>(idx)?),
        "INT4[]" => Value::Array(
            row.try_get::<Vec<i32>, _>(idx)?
                .into_iter()
                .map(Value::from)
                .collect(),
        ),
        "INT8[]" => Value::from(row.try_get::<Vec<i64>, _>(idx)?),
        "FLOAT8[]" => Value::Array(
            row.try_get::<Vec<f64>, _>(idx)?
                .into_iter()
                .map(Value::Float)
                .collect(),
        ),
        "BOOL[]" => Value::Array(
            row.try_get::<Vec<bool>, _>(idx)?
                .into_iter()
                .map(Value::Boolean)
                .collect(),
        ),
        "VOID" => Value::Null,
        other => return Err(unsupported_column(row, idx, other)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keyword_dsn() {
        let options =
            parse_dsn("host=db1 port=5433 dbname=app user=alice password='s3 cret' sslmode=disable")
                .unwrap();
        assert_eq!(options.get_host(), "db1");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("app"));
        assert_eq!(options.get_username(), "alice");
    }

    #[test]
    fn test_parse_url_dsn() {
        let options = parse_dsn("postgres://bob:pw@replica-2:6432/orders").unwrap();
        assert_eq!(options.get_host(), "replica-2");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_database(), Some("orders"));
    }

    #[test]
    fn test_parse_dsn_rejects_garbage() {
        assert!(parse_dsn("").is_err());
        assert!(parse_dsn("host=db1 port=notaport").is_err());
        assert!(parse_dsn("host=db1 frobnicate=yes").is_err());
        assert!(parse_dsn("just words").is_err());
    }

    #[test]
    fn test_connector_endpoint_hides_credentials() {
        let connector =
            PgConnector::from_dsn("postgres://bob:secret@db:5432/app", PoolConfig::default()).unwrap();
        assert_eq!(connector.endpoint(), "db:5432/app");
        assert!(!connector.endpoint().contains("secret"));
    }
}
