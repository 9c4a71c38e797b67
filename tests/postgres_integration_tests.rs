//! Runs against a live PostgreSQL server.
//!
//! Set `PGCLUSTER_TEST_DATABASE_DSN` to a DSN with permission to create
//! tables; the tests are skipped otherwise. The same server is used as
//! primary and replica.

use pgcluster::{Cluster, ClusterOptions, Context, Error, TxDb, TxOptions, Value, codes, params};
use std::time::{Duration, Instant};
use uuid::Uuid;

const DSN_ENV: &str = "PGCLUSTER_TEST_DATABASE_DSN";

async fn cluster() -> Option<Cluster> {
    let Ok(dsn) = std::env::var(DSN_ENV) else {
        eprintln!("skipping: {} is not set", DSN_ENV);
        return None;
    };
    let cluster = Cluster::open(&[dsn.as_str(), dsn.as_str()], ClusterOptions::new())
        .await
        .expect("failed to open cluster");
    Some(cluster)
}

fn table_name() -> String {
    format!("pgcluster_test_{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_ping_and_round_trip() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();

    cluster.ping(&ctx).await.unwrap();
    let answer: i32 = cluster.get(&ctx, "SELECT 42::int4", params!()).await.unwrap();
    assert_eq!(answer, 42);

    let text: String = cluster
        .get(&ctx, "SELECT $1::text", params!["hello"])
        .await
        .unwrap();
    assert_eq!(text, "hello");

    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_statement_timeout_cancels_query() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();

    let started = Instant::now();
    let err = cluster
        .tx(
            &ctx,
            TxOptions::new().statement_timeout(Duration::from_millis(100)),
            |_ctx, q| async move {
                q.exec(&Context::background(), "SELECT pg_sleep(2)", params!()).await
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(codes::QUERY_CANCELED));
    assert!(started.elapsed() < Duration::from_secs(2));
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_in_transaction_timeout_ends_transaction() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();

    let result = cluster
        .tx(
            &ctx,
            TxOptions::new().transaction_timeout(Duration::from_millis(100)),
            |_ctx, q| async move {
                q.exec(&Context::background(), "SELECT 1", params!()).await?;
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok::<_, Error>(())
            },
        )
        .await;

    // The server drops the session, so the commit can never succeed.
    assert!(result.is_err());
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_txdb_discards_everything() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();
    let table = table_name();

    cluster
        .exec(
            &ctx,
            &format!("CREATE TABLE {} (id SERIAL PRIMARY KEY, name TEXT NOT NULL)", table),
            params!(),
        )
        .await
        .unwrap();

    let db = TxDb::new(cluster.clone());
    db.exec(&ctx, &format!("INSERT INTO {} (name) VALUES ($1)", table), params!["alice"])
        .await
        .unwrap();

    let insert = format!("INSERT INTO {} (name) VALUES ($1)", table);
    let err = db
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            q.exec(&Context::background(), &insert, params!["bob"]).await?;
            q.exec(&Context::background(), "SELECT * FROM no_such_table", params!())
                .await
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::UNDEFINED_TABLE));

    let names: Vec<String> = db
        .select(&ctx, &format!("SELECT name FROM {} ORDER BY id", table), params!())
        .await
        .unwrap();
    assert_eq!(names, vec!["alice"]);

    db.rollback().await.unwrap();
    let count: i64 = cluster
        .primary()
        .get(&ctx, &format!("SELECT count(*) FROM {}", table), params!())
        .await
        .unwrap();
    assert_eq!(count, 0);

    cluster
        .exec(&ctx, &format!("DROP TABLE {}", table), params!())
        .await
        .unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_null_binds_to_any_column_type() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();
    let table = table_name();

    cluster
        .exec(
            &ctx,
            &format!("CREATE TABLE {} (id INT, seen_at TIMESTAMPTZ, tag TEXT)", table),
            params!(),
        )
        .await
        .unwrap();

    let inserted = cluster
        .exec(
            &ctx,
            &format!("INSERT INTO {} (id, seen_at, tag) VALUES ($1, $2, $3)", table),
            params![Value::Null, Value::Null, Value::Null],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let nulls: i64 = cluster
        .primary()
        .get(
            &ctx,
            &format!("SELECT count(*) FROM {} WHERE id IS NULL AND seen_at IS NULL", table),
            params!(),
        )
        .await
        .unwrap();
    assert_eq!(nulls, 1);

    cluster
        .exec(&ctx, &format!("DROP TABLE {}", table), params!())
        .await
        .unwrap();
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_numeric_column_needs_explicit_cast() {
    let Some(cluster) = cluster().await else { return };
    let ctx = Context::background();

    let err = cluster
        .query(&ctx, "SELECT 1.50::numeric AS price", params!())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scan(ref msg) if msg.contains("NUMERIC")));

    let price: String = cluster
        .get(&ctx, "SELECT 1.50::numeric::text AS price", params!())
        .await
        .unwrap();
    assert_eq!(price, "1.50");

    cluster.close().await.unwrap();
}
