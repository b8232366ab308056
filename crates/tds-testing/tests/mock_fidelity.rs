//! Mock TDS Server Fidelity Tests
//!
//! Drive the mock server with raw packets, without the session layer, and
//! check that its replies are well-formed TDS.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Buf;
use tds_framer::PacketFramer;
use tds_protocol::login7::Login7;
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, PacketType};
use tds_protocol::prelogin::{EncryptionLevel, PreLogin};
use tds_protocol::sql_batch::SqlBatch;
use tds_protocol::token::{Done, EnvChange, EnvChangeType, LoginAck, TokenType};
use tds_testing::{MockResponse, MockTdsServer};
use tokio::net::TcpStream;

async fn login(server: &MockTdsServer, packet_size: u32) -> (PacketFramer<TcpStream>, bytes::Bytes) {
    let stream = TcpStream::connect(server.addr()).await.unwrap();
    let mut framer = PacketFramer::new(stream, DEFAULT_PACKET_SIZE).unwrap();

    let request = PreLogin::new().with_encryption(EncryptionLevel::NotSupported);
    framer
        .send_message(PacketType::PreLogin, &request.encode())
        .await
        .unwrap();
    let (packet_type, payload) = framer.read_message().await.unwrap();
    assert_eq!(packet_type, PacketType::TabularResult);
    let reply = PreLogin::decode(payload).unwrap();
    assert_eq!(reply.encryption, EncryptionLevel::NotSupported);
    assert_eq!(reply.version.major, 16);

    let login = Login7::new()
        .with_sql_auth("sa", "pw")
        .with_packet_size(packet_size);
    framer
        .send_message(PacketType::Login7, &login.encode().unwrap())
        .await
        .unwrap();
    let (packet_type, tokens) = framer.read_message().await.unwrap();
    assert_eq!(packet_type, PacketType::TabularResult);
    (framer, tokens)
}

#[tokio::test]
async fn test_mock_server_starts_and_listens() {
    let server = MockTdsServer::builder()
        .with_server_name("FidelityTest")
        .with_database("testdb")
        .build()
        .await
        .expect("Server should start");

    assert!(server.port() > 0, "Should have valid port");
    assert_eq!(server.host(), "127.0.0.1", "Should listen on localhost");
    assert_eq!(server.connection_count().await, 0, "Should start with no connections");
}

#[tokio::test]
async fn test_login_response_token_order() {
    let server = MockTdsServer::builder()
        .with_server_name("FidelityTest")
        .with_database("testdb")
        .build()
        .await
        .unwrap();
    let (_framer, mut tokens) = login(&server, 4096).await;

    assert_eq!(tokens.get_u8(), TokenType::EnvChange as u8);
    let env = EnvChange::decode(&mut tokens).unwrap();
    assert_eq!(env.env_type, EnvChangeType::Database);
    assert_eq!(env.new_value.as_text(), Some("testdb"));

    assert_eq!(tokens.get_u8(), TokenType::Info as u8);
    let len = usize::from(tokens.get_u16_le());
    tokens.advance(len);

    assert_eq!(tokens.get_u8(), TokenType::LoginAck as u8);
    let ack = LoginAck::decode(&mut tokens).unwrap();
    assert_eq!(ack.prog_name, "FidelityTest");

    // No packet size change for the default size.
    assert_eq!(tokens.get_u8(), TokenType::Done as u8);
    let done = Done::decode(&mut tokens).unwrap();
    assert!(!done.has_more());
    assert!(!tokens.has_remaining());

    let recorded = server.recorded().await;
    assert_eq!(recorded.logins[0].username, "sa");
    assert_eq!(recorded.logins[0].password, "pw");
}

#[tokio::test]
async fn test_packet_size_acknowledged() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let (_framer, mut tokens) = login(&server, 8192).await;

    let mut sizes = Vec::new();
    while tokens.has_remaining() {
        let token = tokens.get_u8();
        if token == TokenType::EnvChange as u8 {
            sizes.extend(EnvChange::decode(&mut tokens).unwrap().new_packet_size().unwrap());
        } else if token == TokenType::Done as u8 {
            Done::decode(&mut tokens).unwrap();
        } else {
            let len = usize::from(tokens.get_u16_le());
            tokens.advance(len);
        }
    }
    assert_eq!(sizes, vec![8192]);
}

#[tokio::test]
async fn test_batch_and_attention() {
    let server = MockTdsServer::builder()
        .with_response("select 42", MockResponse::rows_affected(42))
        .with_response("WAITFOR DELAY '00:10'", MockResponse::Stall)
        .build()
        .await
        .unwrap();
    let (mut framer, _) = login(&server, 4096).await;

    framer
        .send_message(PacketType::SqlBatch, &SqlBatch::new("SELECT 42").encode())
        .await
        .unwrap();
    let (_, mut reply) = framer.read_message().await.unwrap();
    assert_eq!(reply.get_u8(), TokenType::Done as u8);
    assert_eq!(Done::decode(&mut reply).unwrap().rows(), Some(42));

    framer
        .send_message(PacketType::SqlBatch, &SqlBatch::new("WAITFOR DELAY '00:10'").encode())
        .await
        .unwrap();
    framer.attention_handle().send().await.unwrap();
    let (_, mut ack) = framer.read_message().await.unwrap();
    assert_eq!(ack.get_u8(), TokenType::Done as u8);
    assert!(Done::decode(&mut ack).unwrap().is_attention_ack());

    let recorded = server.recorded().await;
    assert_eq!(recorded.batches.len(), 2);
    assert_eq!(recorded.attentions, 1);
}
