use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use super::execution_profile::ExecutionProfile;
use super::session::Session;
use super::session_builder::SessionBuilder;
use crate::cluster::host::Host;
use crate::errors::{
    DbError, ExecutionError, NewSessionError, RequestAttemptError, UseKeyspaceError, WriteType,
};
use crate::frame::response::result;
use crate::frame::types::Consistency;
use crate::policies::load_balancing::{RoundRobinPolicy, TokenAwarePolicy};
use crate::policies::retry::DowngradingConsistencyRetryPolicy;
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::statement::Statement;
use crate::test_utils::{setup_tracing, MockReply, MockServer, StaticReplicaLookup};

async fn connect(servers: &[&MockServer]) -> Session {
    SessionBuilder::new()
        .known_nodes_addr(servers.iter().map(|server| server.address()))
        .build()
        .await
        .unwrap()
}

fn read_timeout() -> MockReply {
    MockReply::Error(
        DbError::ReadTimeout {
            consistency: Consistency::LocalQuorum,
            received: 2,
            required: 2,
            data_present: false,
        },
        "Operation timed out".to_owned(),
    )
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn successful_request_reports_execution_info() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;

    let result = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap();

    assert_matches!(result.result(), result::Result::Void);
    let info = result.execution_info();
    assert_eq!(info.retries(), 0);
    assert_eq!(info.consistency(), Consistency::LocalQuorum);
    assert_eq!(info.attempted_hosts().len(), 1);
    assert_eq!(info.attempted_hosts()[0].address, server.address());

    let queries = server.received_queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].consistency, Consistency::LocalQuorum);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn read_timeout_is_retried_once_then_surfaced() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;
    server.push_reply(read_timeout());
    server.push_reply(read_timeout());

    let err = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap_err();

    assert_matches!(err.db_error(), Some(DbError::ReadTimeout { .. }));
    assert_eq!(server.received_queries().len(), 2);

    // The script is used up, so the next execution succeeds right away.
    let result = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap();
    assert_eq!(result.execution_info().retries(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn reraised_error_walks_the_plan_and_is_surfaced_last() {
    setup_tracing();
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let session = connect(&[&first, &second]).await;
    for server in [&first, &second] {
        server.set_default_reply(MockReply::Error(
            DbError::ReadTimeout {
                consistency: Consistency::LocalQuorum,
                received: 1,
                required: 2,
                data_present: false,
            },
            "Operation timed out".to_owned(),
        ));
    }

    let err = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(
            DbError::ReadTimeout { received: 1, .. },
            _
        ))
    );
    assert_eq!(first.received_queries().len(), 1);
    assert_eq!(second.received_queries().len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn fatal_errors_are_not_retried() {
    setup_tracing();
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let session = connect(&[&first, &second]).await;
    for server in [&first, &second] {
        server.set_default_reply(MockReply::Error(
            DbError::SyntaxError,
            "line 1:0 no viable alternative".to_owned(),
        ));
    }

    let err = session
        .execute(&Statement::new("SELEC * FROM ks.t"))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(DbError::SyntaxError, _))
    );
    assert_eq!(
        first.received_queries().len() + second.received_queries().len(),
        1
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn downgrading_policy_ignores_simple_write_timeout() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;
    server.push_reply(MockReply::Error(
        DbError::WriteTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            write_type: WriteType::Simple,
        },
        "Operation timed out".to_owned(),
    ));

    let mut statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
    statement.set_retry_policy(Some(Arc::new(DowngradingConsistencyRetryPolicy::new())));
    let result = session.execute(&statement).await.unwrap();

    assert_matches!(result.result(), result::Result::Void);
    assert_eq!(result.execution_info().retries(), 0);
    assert_eq!(server.received_queries().len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn downgrading_policy_retries_with_lower_consistency() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;
    server.push_reply(MockReply::Error(
        DbError::Unavailable {
            consistency: Consistency::All,
            required: 3,
            alive: 1,
        },
        "Cannot achieve consistency level ALL".to_owned(),
    ));

    let profile = ExecutionProfile::builder()
        .consistency(Consistency::All)
        .retry_policy(Arc::new(DowngradingConsistencyRetryPolicy::new()))
        .build();
    let mut statement = Statement::new("SELECT * FROM ks.t");
    statement.set_execution_profile_handle(Some(profile.into_handle()));

    let result = session.execute(&statement).await.unwrap();
    assert_eq!(result.execution_info().retries(), 1);
    assert_eq!(result.execution_info().consistency(), Consistency::One);

    let consistencies: Vec<_> = server
        .received_queries()
        .into_iter()
        .map(|query| query.consistency)
        .collect();
    assert_eq!(consistencies, vec![Consistency::All, Consistency::One]);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn overloaded_host_is_skipped() {
    setup_tracing();
    let overloaded = MockServer::start().await;
    let healthy = MockServer::start().await;
    overloaded.set_default_reply(MockReply::Error(
        DbError::Overloaded,
        "Too many in flight hints".to_owned(),
    ));
    let session = connect(&[&overloaded, &healthy]).await;

    // Two consecutive round robin plans start on different hosts.
    let mut attempts = Vec::new();
    for _ in 0..2 {
        let result = session
            .execute(&Statement::new("SELECT * FROM ks.t"))
            .await
            .unwrap();
        attempts.push(result.execution_info().attempted_hosts().len());
    }
    attempts.sort();

    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(overloaded.received_queries().len(), 1);
    assert_eq!(healthy.received_queries().len(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn no_connected_host_fails_session_creation() {
    setup_tracing();
    let server = MockServer::start().await;
    let address = server.address();
    server.stop();
    drop(server);

    let err = SessionBuilder::new()
        .known_node_addr(address)
        .build()
        .await
        .unwrap_err();

    assert_matches!(err, NewSessionError::NoConnectedHost(ref no_hosts) if no_hosts.errors().contains_key(&address));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unreachable_hosts_yield_no_hosts_available() {
    setup_tracing();
    let alive = MockServer::start().await;
    let dead = MockServer::start().await;
    let dead_address = dead.address();
    dead.stop();
    drop(dead);

    let session = SessionBuilder::new()
        .known_nodes_addr([alive.address(), dead_address])
        .build()
        .await
        .unwrap();
    let hosts = session.get_hosts();
    assert_eq!(hosts.len(), 2);
    assert!(hosts.iter().any(|host| host.address == dead_address && !host.is_up()));

    // The down host is not planned at all.
    for _ in 0..3 {
        let result = session
            .execute(&Statement::new("SELECT * FROM ks.t"))
            .await
            .unwrap();
        assert_eq!(
            result.execution_info().attempted_hosts()[0].address,
            alive.address()
        );
    }

    alive.stop();
    let err = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap_err();
    assert_matches!(err, ExecutionError::NoHostsAvailable(_));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn silent_server_hits_request_timeout() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;
    server.set_default_reply(MockReply::Silent);

    let mut statement = Statement::new("SELECT * FROM ks.t");
    statement.set_request_timeout(Some(Duration::from_millis(200)));
    let err = session.execute(&statement).await.unwrap_err();

    // Without an attempt timeout only the whole execution is bounded.
    assert_matches!(err, ExecutionError::RequestTimeout(timeout) if timeout == Duration::from_millis(200));
    assert_eq!(server.received_queries().len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn attempt_timeout_moves_idempotent_statement_to_next_host() {
    setup_tracing();
    let silent = MockServer::start().await;
    let healthy = MockServer::start().await;
    silent.set_default_reply(MockReply::Silent);
    let session = connect(&[&silent, &healthy]).await;

    let profile = ExecutionProfile::builder()
        .request_timeout(Some(Duration::from_secs(10)))
        .attempt_timeout(Some(Duration::from_millis(200)))
        .build();
    let mut statement = Statement::new("SELECT * FROM ks.t");
    statement.set_execution_profile_handle(Some(profile.into_handle()));
    statement.set_is_idempotent(true);

    // Round robin starts one of the two plans on the silent host.
    let mut attempted = Vec::new();
    for _ in 0..2 {
        let result = session.execute(&statement).await.unwrap();
        let hosts: Vec<_> = result
            .execution_info()
            .attempted_hosts()
            .iter()
            .map(|host| host.address)
            .collect();
        attempted.push(hosts);
    }
    attempted.sort_by_key(Vec::len);

    assert_eq!(attempted[0], vec![healthy.address()]);
    assert_eq!(attempted[1], vec![silent.address(), healthy.address()]);
    assert_eq!(silent.received_queries().len(), 1);
    assert_eq!(healthy.received_queries().len(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn attempt_timeout_fails_non_idempotent_statement() {
    setup_tracing();
    let silent = MockServer::start().await;
    let healthy = MockServer::start().await;
    silent.set_default_reply(MockReply::Silent);
    let session = connect(&[&silent, &healthy]).await;

    let mut statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
    statement.set_request_timeout(Some(Duration::from_secs(10)));
    statement.set_attempt_timeout(Some(Some(Duration::from_millis(200))));

    let mut timeouts = 0;
    for _ in 0..2 {
        match session.execute(&statement).await {
            Ok(_) => {}
            Err(err) => {
                assert_matches!(
                    err,
                    ExecutionError::LastAttemptError(RequestAttemptError::Timeout(timeout))
                        if timeout == Duration::from_millis(200)
                );
                timeouts += 1;
            }
        }
    }

    // The write may have been applied, so it is not sent anywhere else.
    assert_eq!(timeouts, 1);
    assert_eq!(silent.received_queries().len(), 1);
    assert_eq!(healthy.received_queries().len(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn retried_host_is_listed_once() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;
    server.push_reply(read_timeout());

    let result = session
        .execute(&Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap();

    let info = result.execution_info();
    assert_eq!(info.retries(), 1);
    assert_eq!(info.attempted_hosts().len(), 1);
    assert_eq!(info.attempted_hosts()[0].address, server.address());
    assert_eq!(server.received_queries().len(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn timestamp_generator_fills_missing_timestamps() {
    setup_tracing();
    struct CountingGenerator(AtomicI64);
    impl TimestampGenerator for CountingGenerator {
        fn next_timestamp(&self) -> i64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    let server = MockServer::start().await;
    let session = SessionBuilder::new()
        .known_node_addr(server.address())
        .timestamp_generator(Arc::new(CountingGenerator(AtomicI64::new(1000))))
        .build()
        .await
        .unwrap();

    let generated = Statement::new("INSERT INTO ks.t (a) VALUES (1)");
    let mut explicit = Statement::new("INSERT INTO ks.t (a) VALUES (2)");
    explicit.set_timestamp(Some(42));
    session.execute(&generated).await.unwrap();
    session.execute(&explicit).await.unwrap();
    session.execute(&generated).await.unwrap();

    let timestamps: Vec<_> = server
        .received_queries()
        .into_iter()
        .map(|query| query.timestamp)
        .collect();
    assert_eq!(timestamps, vec![Some(1000), Some(42), Some(1001)]);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn without_generator_timestamps_are_left_to_the_server() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = connect(&[&server]).await;

    session
        .execute(&Statement::new("INSERT INTO ks.t (a) VALUES (1)"))
        .await
        .unwrap();
    assert_eq!(server.received_queries()[0].timestamp, None);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn use_keyspace_switches_every_connection() {
    setup_tracing();
    let server = MockServer::start().await;
    let session = SessionBuilder::new()
        .known_node_addr(server.address())
        .use_keyspace("ks", false)
        .build()
        .await
        .unwrap();
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));

    // A USE statement sent by the user switches the session too.
    session.execute(&Statement::new("USE other")).await.unwrap();
    assert_eq!(
        session.get_keyspace().as_deref().map(String::as_str),
        Some("other")
    );

    session.use_keyspace("CaseSensitive", true).await.unwrap();
    let contents: Vec<_> = server
        .received_queries()
        .into_iter()
        .map(|query| query.contents)
        .collect();
    assert!(contents.contains(&"USE ks".to_owned()));
    assert!(contents.contains(&"USE \"CaseSensitive\"".to_owned()));

    assert_matches!(
        session.use_keyspace("not a keyspace", false).await,
        Err(UseKeyspaceError::BadKeyspaceName(_))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn token_aware_profile_routes_to_replica() {
    setup_tracing();
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let replica = Arc::new(Host::new(second.address(), None, None));

    let profile = ExecutionProfile::builder()
        .load_balancing_policy(Arc::new(
            TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new())).shuffle_replicas(false),
        ))
        .build();
    let session = SessionBuilder::new()
        .known_nodes_addr([first.address(), second.address()])
        .default_execution_profile_handle(profile.into_handle())
        .replica_lookup(Arc::new(
            StaticReplicaLookup::default().with(b"pk", vec![replica]),
        ))
        .build()
        .await
        .unwrap();

    let mut statement = Statement::new("SELECT * FROM ks.t WHERE pk = ?");
    statement.set_routing_key(Some(bytes::Bytes::from_static(b"pk")));
    for _ in 0..4 {
        session.execute(&statement).await.unwrap();
    }

    assert_eq!(first.received_queries().len(), 0);
    assert_eq!(second.received_queries().len(), 4);
}
