use pgcluster::driver::Connect;
use pgcluster::driver::memory::MemoryServer;
use pgcluster::{Cluster, ClusterOptions, Context, Error, TxOptions, codes, params};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn memory_cluster(names: &[&str], options: ClusterOptions) -> (Vec<MemoryServer>, Cluster) {
    init_tracing();
    let servers: Vec<MemoryServer> = names.iter().map(|name| MemoryServer::new(*name)).collect();
    let connectors = servers
        .iter()
        .map(|s| Arc::new(s.clone()) as Arc<dyn Connect>)
        .collect();
    let cluster = Cluster::connect(connectors, options).await.unwrap();
    (servers, cluster)
}

async fn current_database(cluster: &Cluster, ctx: &Context) -> String {
    cluster
        .get(ctx, "SELECT current_database()", params!())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_open_reports_malformed_entry_index() {
    let dsns = [
        "postgres://app@primary:5432/app",
        "postgres://app@replica-1:5432/app",
        "host=replica-2 dbname=app user=app",
        "replica-3 app",
    ];

    let err = Cluster::open(&dsns, ClusterOptions::new()).await.unwrap_err();
    match &err {
        Error::Config { index, .. } => assert_eq!(*index, 4),
        other => panic!("expected config error, got {:?}", other),
    }
    assert!(err.to_string().contains("index 4"));
}

#[tokio::test]
async fn test_open_rejects_invalid_pool_config() {
    let options = ClusterOptions::new().pool(pgcluster::PoolConfig::new().max_connections(0));
    let err = Cluster::open(&["postgres://db/app"], options).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn test_connect_requires_a_connection() {
    let err = Cluster::connect(Vec::new(), ClusterOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::EmptyCluster));
}

#[tokio::test]
async fn test_connect_failure_aggregates_every_error() {
    let servers: Vec<MemoryServer> = ["primary", "replica-1", "replica-2"]
        .iter()
        .map(|name| MemoryServer::new(*name))
        .collect();
    servers[1].set_available(false);
    servers[2].set_available(false);

    let connectors = servers
        .iter()
        .map(|s| Arc::new(s.clone()) as Arc<dyn Connect>)
        .collect();
    let err = Cluster::connect(connectors, ClusterOptions::new()).await.unwrap_err();

    let Error::Aggregate(errors) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.code() == Some(codes::UNABLE_TO_CONNECT)));
    assert!(errors.to_string().starts_with("2 errors occurred:"));
}

#[tokio::test]
async fn test_close_then_ping_reports_every_connection() {
    let ctx = Context::background();
    let (_servers, cluster) =
        memory_cluster(&["primary", "replica-1", "replica-2"], ClusterOptions::new()).await;

    cluster.ping(&ctx).await.unwrap();
    cluster.close().await.unwrap();
    // Closing again is harmless.
    cluster.close().await.unwrap();

    let err = cluster.ping(&ctx).await.unwrap_err();
    let Error::Aggregate(errors) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(Error::is_closed));
    assert_eq!(errors.to_string().matches("closed pool").count(), 3);
}

#[tokio::test]
async fn test_ping_reports_only_failing_connections() {
    let ctx = Context::background();
    let (servers, cluster) =
        memory_cluster(&["primary", "replica-1", "replica-2"], ClusterOptions::new()).await;
    servers[2].set_available(false);

    let Error::Aggregate(errors) = cluster.ping(&ctx).await.unwrap_err() else {
        panic!("expected aggregate error");
    };
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn test_reads_cycle_through_replicas() {
    let ctx = Context::background();
    let (_servers, cluster) = memory_cluster(
        &["primary", "replica-1", "replica-2", "replica-3"],
        ClusterOptions::new(),
    )
    .await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(current_database(&cluster, &ctx).await);
    }
    assert_eq!(
        seen,
        vec!["replica-1", "replica-2", "replica-3", "replica-1", "replica-2", "replica-3"]
    );
}

#[tokio::test]
async fn test_single_connection_serves_reads() {
    let ctx = Context::background();
    let (_servers, cluster) = memory_cluster(&["only"], ClusterOptions::new()).await;

    for _ in 0..3 {
        assert_eq!(current_database(&cluster, &ctx).await, "only");
        assert_eq!(cluster.replica().endpoint(), cluster.primary().endpoint());
    }
    assert_eq!(cluster.len(), 1);
    assert!(cluster.connections()[0].is_primary());
}

#[tokio::test]
async fn test_exec_and_tx_go_to_primary() {
    let ctx = Context::background();
    let (servers, cluster) =
        memory_cluster(&["primary", "replica-1"], ClusterOptions::new()).await;

    cluster
        .exec(&ctx, "CREATE TABLE events (id SERIAL PRIMARY KEY, kind TEXT)", params!())
        .await
        .unwrap();
    cluster
        .tx(&ctx, TxOptions::new(), |_ctx, q| async move {
            q.exec(&Context::background(), "INSERT INTO events (kind) VALUES ($1)", params!["signup"])
                .await
        })
        .await
        .unwrap();

    assert_eq!(servers[0].row_count("events").unwrap(), Some(1));
    assert_eq!(servers[1].row_count("events").unwrap(), None);
}

async fn add_event(cluster: &Cluster, ctx: &Context, kind: &str) -> pgcluster::Result<u64> {
    cluster
        .exec(ctx, "INSERT INTO events (kind) VALUES ($1)", params![kind])
        .await
}

#[tokio::test]
async fn test_helpers_called_with_tx_context_join_the_transaction() {
    let ctx = Context::background();
    let (servers, cluster) =
        memory_cluster(&["primary", "replica-1"], ClusterOptions::new()).await;
    cluster
        .exec(&ctx, "CREATE TABLE events (id SERIAL PRIMARY KEY, kind TEXT)", params!())
        .await
        .unwrap();

    let db = &cluster;
    let err = cluster
        .tx(&ctx, TxOptions::new(), |tx_ctx, _q| async move {
            assert!(tx_ctx.tx().is_some());
            add_event(db, &tx_ctx, "signup").await?;

            // Reads through the cluster's replica path see the pending row too.
            let pending: i64 = db.get(&tx_ctx, "SELECT count(*) FROM events", params!()).await?;
            assert_eq!(pending, 1);
            Err::<(), _>(Error::Scan("abort".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scan(_)));
    assert_eq!(servers[0].row_count("events").unwrap(), Some(0));

    cluster
        .tx(&ctx, TxOptions::new(), |tx_ctx, _q| async move {
            add_event(db, &tx_ctx, "login").await
        })
        .await
        .unwrap();
    assert_eq!(servers[0].row_count("events").unwrap(), Some(1));
    assert_eq!(servers[0].stats().transactions, 2);
}

#[tokio::test]
async fn test_custom_picker_routes_reads() {
    let ctx = Context::background();
    let options = ClusterOptions::new().picker(|cluster, sql| {
        if sql.contains("current_database") {
            cluster.primary()
        } else {
            cluster.replica()
        }
    });
    let (_servers, cluster) = memory_cluster(&["primary", "replica-1", "replica-2"], options).await;

    for _ in 0..3 {
        assert_eq!(current_database(&cluster, &ctx).await, "primary");
    }
}

#[tokio::test]
async fn test_absent_picker_keeps_round_robin() {
    let ctx = Context::background();
    let options = ClusterOptions::new().with_picker(None).with_scan_api(None);
    let (_servers, cluster) = memory_cluster(&["primary", "replica-1", "replica-2"], options).await;

    assert_eq!(current_database(&cluster, &ctx).await, "replica-1");
    assert_eq!(current_database(&cluster, &ctx).await, "replica-2");
}

#[tokio::test]
async fn test_connections_are_opened_per_server() {
    let (servers, cluster) =
        memory_cluster(&["primary", "replica-1", "replica-2"], ClusterOptions::new()).await;

    let roles: Vec<String> = cluster
        .connections()
        .iter()
        .map(|c| format!("{}:{}", c.role(), c.endpoint()))
        .collect();
    assert_eq!(
        roles,
        vec![
            "primary:memory://primary",
            "replica:memory://replica-1",
            "replica:memory://replica-2"
        ]
    );
    assert!(servers.iter().all(|s| s.is_available()));
}
