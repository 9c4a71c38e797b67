use pgcluster::driver::Connect;
use pgcluster::driver::memory::MemoryServer;
use pgcluster::{
    Cluster, ClusterOptions, Context, Error, Querier, ScanApi, TxManager, TxOptions, codes, params,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Timeouts {
    idle_in_txn_timeout: String,
    stmt_timeout: String,
}

const SHOW_TIMEOUTS: &str = "SELECT current_setting('idle_in_transaction_session_timeout') AS idle_in_txn_timeout, current_setting('statement_timeout') AS stmt_timeout";

async fn setup() -> (MemoryServer, Cluster) {
    let server = MemoryServer::new("app");
    let connectors = vec![Arc::new(server.clone()) as Arc<dyn Connect>];
    let cluster = Cluster::connect(connectors, ClusterOptions::new()).await.unwrap();

    let ctx = Context::background();
    cluster
        .exec(&ctx, "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL)", params!())
        .await
        .unwrap();
    (server, cluster)
}

async fn insert_user(q: &Querier, name: &str) -> pgcluster::Result<u64> {
    q.exec(&Context::background(), "INSERT INTO users (name) VALUES ($1)", params![name])
        .await
}

async fn names(cluster: &Cluster) -> Vec<String> {
    cluster
        .select(&Context::background(), "SELECT name FROM users ORDER BY id", params!())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_select_get_exec() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let affected = cluster
        .exec(&ctx, "INSERT INTO users (name) VALUES ($1), ($2)", params!["alice", "bob"])
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let users: Vec<User> = cluster
        .select(&ctx, "SELECT id, name FROM users ORDER BY id", params!())
        .await
        .unwrap();
    assert_eq!(
        users,
        vec![
            User { id: 1, name: "alice".into() },
            User { id: 2, name: "bob".into() },
        ]
    );

    let bob: User = cluster
        .get(&ctx, "SELECT id, name FROM users WHERE name = $1", params!["bob"])
        .await
        .unwrap();
    assert_eq!(bob.id, 2);

    let count: i64 = cluster.get(&ctx, "SELECT count(*) FROM users", params!()).await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_select_into_replaces_contents() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();
    cluster
        .exec(&ctx, "INSERT INTO users (name) VALUES ('carol')", params!())
        .await
        .unwrap();

    let mut dst = vec!["stale".to_string(), "entries".to_string()];
    cluster
        .select_into(&ctx, &mut dst, "SELECT name FROM users", params!())
        .await
        .unwrap();
    assert_eq!(dst, vec!["carol"]);

    cluster
        .select_into(&ctx, &mut dst, "SELECT name FROM users WHERE name = 'nobody'", params!())
        .await
        .unwrap();
    assert!(dst.is_empty());
}

#[tokio::test]
async fn test_get_requires_exactly_one_row() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .get::<User>(&ctx, "SELECT id, name FROM users", params!())
        .await
        .unwrap_err();
    assert!(err.is_no_rows());

    cluster
        .exec(&ctx, "INSERT INTO users (name) VALUES ('a'), ('b'), ('c')", params!())
        .await
        .unwrap();
    let err = cluster
        .get::<User>(&ctx, "SELECT id, name FROM users", params!())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MultipleRows(3)));
}

#[tokio::test]
async fn test_driver_errors_keep_their_code() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .select::<User>(&ctx, "SELECT id, name FROM accounts", params!())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::UNDEFINED_TABLE));

    cluster
        .exec(&ctx, "INSERT INTO users (id, name) VALUES (1, 'x')", params!())
        .await
        .unwrap();
    let err = cluster
        .exec(&ctx, "INSERT INTO users (id, name) VALUES (1, 'y')", params!())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn test_tx_commits_on_success() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();

    let inserted = cluster
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            insert_user(&q, "alice").await?;
            insert_user(&q, "bob").await
        })
        .await
        .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(server.row_count("users").unwrap(), Some(2));
}

#[tokio::test]
async fn test_tx_rolls_back_and_returns_fn_error() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            insert_user(&q, "alice").await?;
            Err::<(), _>(Error::Scan("validation failed".into()))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Scan(ref msg) if msg == "validation failed"));
    assert_eq!(server.row_count("users").unwrap(), Some(0));
}

#[tokio::test]
async fn test_nested_tx_is_a_savepoint() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();

    cluster
        .tx(&ctx, TxOptions::new(), |tx_ctx, outer| async move {
            insert_user(&outer, "kept").await?;

            let inner = outer
                .tx(&tx_ctx, TxOptions::new(), |_ctx, inner| async move {
                    insert_user(&inner, "discarded").await?;
                    Err::<(), _>(Error::Scan("inner failure".into()))
                })
                .await;
            assert!(inner.is_err());

            outer
                .tx(&tx_ctx, TxOptions::new(), |_ctx, inner| async move {
                    insert_user(&inner, "released").await
                })
                .await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    assert_eq!(names(&cluster).await, vec!["kept", "released"]);
    assert_eq!(server.stats().transactions, 1);
}

#[tokio::test]
async fn test_context_tx_is_joined_by_nested_calls() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();
    let manager = TxManager::new(cluster.primary());

    let (tx_ctx, guard) = manager.begin(&ctx, TxOptions::new()).await.unwrap();
    cluster
        .exec(&tx_ctx, "INSERT INTO users (name) VALUES ('pending')", params!())
        .await
        .unwrap();

    // A tx call made with the context becomes a savepoint of the open transaction.
    cluster
        .tx(&tx_ctx, TxOptions::new(), |_ctx, q| async move { insert_user(&q, "nested").await })
        .await
        .unwrap();

    let inside: i64 = cluster.get(&tx_ctx, "SELECT count(*) FROM users", params!()).await.unwrap();
    let outside: i64 = cluster.get(&ctx, "SELECT count(*) FROM users", params!()).await.unwrap();
    assert_eq!((inside, outside), (2, 0));

    guard.rollback().await.unwrap();
    assert_eq!(server.row_count("users").unwrap(), Some(0));
    assert_eq!(server.stats().transactions, 1);
}

#[tokio::test]
async fn test_tx_manager_commit() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();
    let manager = TxManager::new(cluster.primary());

    let (tx_ctx, guard) = manager.begin(&ctx, TxOptions::new()).await.unwrap();
    assert!(tx_ctx.tx().is_some());
    assert!(ctx.tx().is_none());
    cluster
        .exec(&tx_ctx, "INSERT INTO users (name) VALUES ('committed')", params!())
        .await
        .unwrap();
    guard.commit().await.unwrap();

    assert_eq!(server.row_count("users").unwrap(), Some(1));
    assert!(matches!(
        cluster.exec(&tx_ctx, "INSERT INTO users (name) VALUES ('late')", params!()).await,
        Err(Error::TxDone)
    ));
}

#[tokio::test]
async fn test_statement_timeout_aborts_query() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let started = Instant::now();
    let err = cluster
        .tx(
            &ctx,
            TxOptions::new().statement_timeout(Duration::from_millis(50)),
            |_ctx, q| async move {
                q.query(&Context::background(), "SELECT pg_sleep(1)", params!()).await?;
                Ok::<_, Error>(())
            },
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(err.code(), Some(codes::QUERY_CANCELED));
    assert!(!matches!(err, Error::Cancelled | Error::DeadlineExceeded));
}

#[tokio::test]
async fn test_idle_in_transaction_timeout_surfaces_at_commit() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .tx(
            &ctx,
            TxOptions::new().transaction_timeout(Duration::from_millis(50)),
            |_ctx, q| async move {
                insert_user(&q, "slow").await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Error>(())
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(codes::IDLE_IN_TRANSACTION_SESSION_TIMEOUT));
    assert_eq!(server.row_count("users").unwrap(), Some(0));
}

#[tokio::test]
async fn test_timeouts_are_local_to_the_transaction() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let inside = cluster
        .tx(
            &ctx,
            TxOptions::new()
                .transaction_timeout(Duration::from_secs(1))
                .statement_timeout(Duration::from_secs(2)),
            |_ctx, q| async move { q.get::<Timeouts>(&Context::background(), SHOW_TIMEOUTS, params!()).await },
        )
        .await
        .unwrap();
    assert_eq!(
        inside,
        Timeouts {
            idle_in_txn_timeout: "1s".into(),
            stmt_timeout: "2s".into(),
        }
    );

    let untouched = cluster
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            q.get::<Timeouts>(&Context::background(), SHOW_TIMEOUTS, params!()).await
        })
        .await
        .unwrap();
    assert_eq!(untouched.idle_in_txn_timeout, "0");
    assert_eq!(untouched.stmt_timeout, "0");
}

#[tokio::test]
async fn test_deadline_interrupts_statement() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background().with_timeout(Duration::from_millis(30));

    let started = Instant::now();
    let err = cluster
        .query(&ctx, "SELECT pg_sleep(2)", params!())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(1));

    // An expired context fails fast without touching the database.
    assert!(matches!(
        cluster.exec(&ctx, "DELETE FROM users", params!()).await,
        Err(Error::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn test_cancel_interrupts_statement() {
    let (_server, cluster) = setup().await;
    let (ctx, cancel) = Context::background().with_cancel();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = cluster
        .query(&ctx, "SELECT pg_sleep(2)", params!())
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_swallowed_statement_error_aborts_commit() {
    let (server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            insert_user(&q, "alice").await?;
            let failed = q
                .exec(&Context::background(), "INSERT INTO missing VALUES (1)", params!())
                .await;
            assert_eq!(failed.unwrap_err().code(), Some(codes::UNDEFINED_TABLE));

            let refused = insert_user(&q, "bob").await.unwrap_err();
            assert_eq!(refused.code(), Some(codes::IN_FAILED_SQL_TRANSACTION));
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TxAborted));
    assert_eq!(server.row_count("users").unwrap(), Some(0));
}

#[tokio::test]
async fn test_panic_rolls_back_and_propagates() {
    let (server, cluster) = setup().await;

    let task = tokio::spawn(async move {
        cluster
            .tx(&Context::background(), TxOptions::new(), |_ctx, q| async move {
                insert_user(&q, "doomed").await?;
                if q.tx_handle().is_some() {
                    panic!("handler crashed");
                }
                Ok::<_, Error>(())
            })
            .await
    });

    let join_err = task.await.unwrap_err();
    assert!(join_err.is_panic());
    assert_eq!(server.row_count("users").unwrap(), Some(0));
}

#[tokio::test]
async fn test_read_only_transaction_rejects_writes() {
    let (_server, cluster) = setup().await;
    let ctx = Context::background();

    let err = cluster
        .tx(&ctx, TxOptions::new().read_only(), |_ctx, q| async move {
            insert_user(&q, "nope").await
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::READ_ONLY_SQL_TRANSACTION));
}

#[tokio::test]
async fn test_custom_scan_api_maps_columns() {
    #[derive(Debug, Deserialize)]
    struct Row {
        user_id: i64,
        user_name: String,
    }

    let server = MemoryServer::new("app");
    let options = ClusterOptions::new()
        .scan_api(ScanApi::new().column_mapper(|column| format!("user_{}", column)));
    let cluster = Cluster::connect(vec![Arc::new(server) as Arc<dyn Connect>], options)
        .await
        .unwrap();
    let ctx = Context::background();
    cluster
        .exec(&ctx, "CREATE TABLE users (id SERIAL, name TEXT)", params!())
        .await
        .unwrap();
    cluster
        .exec(&ctx, "INSERT INTO users (name) VALUES ('dora')", params!())
        .await
        .unwrap();

    let row: Row = cluster.get(&ctx, "SELECT id, name FROM users", params!()).await.unwrap();
    assert_eq!((row.user_id, row.user_name.as_str()), (1, "dora"));
}
