//! Request/response cycles on an established session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tds_client::{
    Config, Credentials, EncryptionMode, Error, PacketType, ProtocolEvent, ResponseState, Session,
    TimeoutConfig, Value,
};
use tds_protocol::sql_batch::SqlBatch;
use tds_protocol::token::{DoneStatus, EnvChange, EnvChangeType, ServerMessage};
use tds_testing::{MockResponse, MockServerBuilder, MockTdsServer, TokenStreamBuilder};
use tds_types::TypeDescriptor;

async fn connect(builder: MockServerBuilder) -> (MockTdsServer, Session) {
    connect_with(builder, |config| config).await
}

async fn connect_with(
    builder: MockServerBuilder,
    customize: impl FnOnce(Config) -> Config,
) -> (MockTdsServer, Session) {
    let server = builder.build().await.expect("mock server should start");
    let config = Config::new()
        .host(server.host())
        .port(server.port())
        .credentials(Credentials::sql_server("app", "s3cret"))
        .encryption(EncryptionMode::NotSupported)
        .timeouts(TimeoutConfig::new().login_timeout(Duration::from_secs(10)));
    let session = Session::connect(customize(config)).await.unwrap();
    (server, session)
}

async fn collect(session: &mut Session) -> Vec<ProtocolEvent> {
    let mut events = Vec::new();
    while let Some(event) = session.next_event().await.unwrap() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_result_set_round_trip() {
    let columns = [("id", TypeDescriptor::intn(4)), ("name", TypeDescriptor::nvarchar(50))];
    let types = [columns[0].1, columns[1].1];
    let tokens = TokenStreamBuilder::new()
        .col_metadata(&columns)
        .row(&types, &[Value::Int(1), Value::String("alice".into())])
        .row(&types, &[Value::Int(2), Value::Null])
        .done(DoneStatus::COUNT, 2)
        .build()
        .unwrap();
    let (_server, mut session) = connect(
        MockTdsServer::builder().with_response("SELECT id, name FROM users", MockResponse::tokens(tokens)),
    )
    .await;

    session.send_sql_batch("SELECT id, name FROM users").await.unwrap();
    assert_eq!(session.response_state(), ResponseState::Reading);
    let events = collect(&mut session).await;
    assert_eq!(session.response_state(), ResponseState::Idle);

    match &events[0] {
        ProtocolEvent::ColumnMetadata(cols) => {
            assert_eq!(cols.len(), 2);
            assert_eq!(cols[1].name, "name");
            assert!(cols[1].is_nullable());
        }
        other => panic!("expected column metadata, got {other:?}"),
    }
    assert_eq!(
        events[1].as_row().unwrap(),
        &[Value::Int(1), Value::String("alice".into())]
    );
    assert_eq!(events[2].as_row().unwrap(), &[Value::Int(2), Value::Null]);
    assert_eq!(events[3].as_done().unwrap().rows(), Some(2));
}

#[tokio::test]
async fn test_server_error_keeps_session_usable() {
    let (_server, mut session) = connect(
        MockTdsServer::builder()
            .with_response("SELECT * FROM missing", MockResponse::error(208, 16, "Invalid object name 'missing'.")),
    )
    .await;

    session.send_sql_batch("SELECT * FROM missing").await.unwrap();
    let err = session.next_event().await.unwrap_err();
    assert!(err.is_server_error(208));
    assert_eq!(err.class(), Some(16));
    assert_eq!(session.response_state(), ResponseState::Idle);

    session.send_sql_batch("SELECT 1").await.unwrap();
    session.drain().await.unwrap();
}

#[tokio::test]
async fn test_request_while_reading_is_rejected() {
    let (_server, mut session) = connect(MockTdsServer::builder()).await;

    session.send_sql_batch("SELECT 1").await.unwrap();
    let err = session.send_sql_batch("SELECT 2").await.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    session.drain().await.unwrap();
}

#[tokio::test]
async fn test_transaction_descriptor_follows_env_change() {
    let begin = TokenStreamBuilder::new()
        .env_change(&EnvChange::transaction(EnvChangeType::BeginTransaction, 0x2A))
        .done(DoneStatus::empty(), 0)
        .build()
        .unwrap();
    let commit = TokenStreamBuilder::new()
        .env_change(&EnvChange::transaction(EnvChangeType::CommitTransaction, 0x2A))
        .done(DoneStatus::empty(), 0)
        .build()
        .unwrap();
    let (server, mut session) = connect(
        MockTdsServer::builder()
            .with_response("BEGIN TRANSACTION", MockResponse::tokens(begin))
            .with_response("COMMIT", MockResponse::tokens(commit)),
    )
    .await;

    for sql in ["BEGIN TRANSACTION", "UPDATE t SET x = 1", "COMMIT", "SELECT 1"] {
        session.send_sql_batch(sql).await.unwrap();
        session.drain().await.unwrap();
        if sql == "BEGIN TRANSACTION" {
            assert!(session.state().in_transaction());
        }
    }
    assert!(!session.state().in_transaction());

    let descriptors: Vec<u64> = server
        .recorded()
        .await
        .batches
        .iter()
        .map(|b| b.headers.transaction_descriptor)
        .collect();
    assert_eq!(descriptors, vec![0, 0x2A, 0x2A, 0]);
}

#[tokio::test]
async fn test_packet_size_renegotiation() {
    let rows: Vec<Vec<Value>> = (0..400)
        .map(|i| vec![Value::Int(i), Value::String("x".repeat(40))])
        .collect();
    let columns = [("n", TypeDescriptor::intn(4)), ("pad", TypeDescriptor::nvarchar(100))];
    let types = [columns[0].1, columns[1].1];
    let mut builder = TokenStreamBuilder::new().col_metadata(&columns);
    for row in &rows {
        builder = builder.row(&types, row);
    }
    let tokens = builder.done(DoneStatus::COUNT, 400).build().unwrap();
    assert!(tokens.len() > 3 * 8192);

    let (_server, mut session) = connect_with(
        MockTdsServer::builder().with_response("SELECT * FROM big", MockResponse::tokens(tokens)),
        |config| config.packet_size(8192),
    )
    .await;
    assert_eq!(session.packet_size(), 8192);
    assert_eq!(session.state().packet_size, 8192);

    session.send_sql_batch("SELECT * FROM big").await.unwrap();
    let events = collect(&mut session).await;
    let decoded: Vec<&[Value]> = events.iter().filter_map(ProtocolEvent::as_row).collect();
    assert_eq!(decoded.len(), 400);
    assert_eq!(decoded[399], rows[399].as_slice());
}

#[tokio::test]
async fn test_server_chosen_packet_size() {
    let (_server, session) = connect(MockTdsServer::builder().with_packet_size(2048)).await;
    assert_eq!(session.packet_size(), 2048);
}

#[tokio::test]
async fn test_cancel_outstanding_request() {
    let (server, mut session) = connect(
        MockTdsServer::builder().with_response("WAITFOR DELAY '01:00:00'", MockResponse::Stall),
    )
    .await;

    session
        .send_sql_batch("WAITFOR DELAY '01:00:00'")
        .await
        .unwrap();
    session.cancel().await.unwrap();

    let events = collect(&mut session).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].as_done().unwrap().is_attention_ack());
    assert_eq!(session.response_state(), ResponseState::Idle);
    assert_eq!(server.recorded().await.attentions, 1);

    // The session is reusable after the acknowledgement.
    session.send_sql_batch("SELECT 1").await.unwrap();
    session.drain().await.unwrap();
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let (_server, mut session) = connect(
        MockTdsServer::builder().with_response("EXEC long_running", MockResponse::Stall),
    )
    .await;

    session.send_sql_batch("EXEC long_running").await.unwrap();
    let handle = session.cancel_handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel().await
    });

    let events: Vec<_> = session.events().collect().await;
    canceller.await.unwrap().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].as_ref().unwrap().as_done().unwrap().is_attention_ack());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_without_request() {
    let (_server, mut session) = connect(MockTdsServer::builder()).await;
    assert!(matches!(session.cancel().await, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_info_messages_reach_observer() {
    let tokens = TokenStreamBuilder::new()
        .info(50000, "progress 50%")
        .done(DoneStatus::empty(), 0)
        .build()
        .unwrap();
    let (_server, mut session) = connect(
        MockTdsServer::builder().with_response("EXEC report", MockResponse::tokens(tokens)),
    )
    .await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.set_message_observer(Some(Arc::new(move |msg: &ServerMessage| {
        sink.lock().unwrap().push(msg.message.clone());
    })));

    session.send_sql_batch("EXEC report").await.unwrap();
    let events = collect(&mut session).await;
    assert!(matches!(events[0], ProtocolEvent::InfoMessage(_)));
    assert_eq!(*seen.lock().unwrap(), vec!["progress 50%".to_string()]);
}

#[tokio::test]
async fn test_caller_built_request() {
    let (server, mut session) = connect(MockTdsServer::builder()).await;

    let batch = SqlBatch::new("SELECT @@VERSION");
    session
        .send_request(PacketType::SqlBatch, &batch.encode())
        .await
        .unwrap();
    session.drain().await.unwrap();
    assert_eq!(server.recorded().await.batches[0].sql, "SELECT @@VERSION");
}

#[tokio::test]
async fn test_malformed_response_poisons_session() {
    let tokens = TokenStreamBuilder::new().raw(&[0x5A, 0x00]).build().unwrap();
    let (_server, mut session) = connect(
        MockTdsServer::builder().with_response("SELECT bad", MockResponse::tokens(tokens)),
    )
    .await;

    session.send_sql_batch("SELECT bad").await.unwrap();
    assert!(matches!(
        session.next_event().await,
        Err(Error::ProtocolViolation(_))
    ));
    assert_eq!(session.response_state(), ResponseState::Poisoned);
    assert!(session.next_event().await.unwrap().is_none());
    assert!(session.send_sql_batch("SELECT 1").await.is_err());
}

#[tokio::test]
async fn test_close() {
    let (server, session) = connect(MockTdsServer::builder()).await;
    session.close().await.unwrap();

    // The server sees the disconnect and drops its connection task.
    for _ in 0..50 {
        if server.connection_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server still holds the connection");
}
