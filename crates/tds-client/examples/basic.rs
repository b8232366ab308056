//! Connect, run one batch and print the decoded events.
//!
//! # Running
//!
//! ```bash
//! export TDS_HOST=localhost
//! export TDS_DATABASE=master
//! export TDS_USER=sa
//! export TDS_PASSWORD=YourStrong@Passw0rd
//! # Set TDS_ENCRYPT=false for development servers without TLS configured
//!
//! RUST_LOG=tds_client=debug cargo run --example basic
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use tds_client::{Config, Credentials, EncryptionMode, Error, ProtocolEvent, Session};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let host = std::env::var("TDS_HOST").unwrap_or_else(|_| "localhost".into());
    let database = std::env::var("TDS_DATABASE").unwrap_or_else(|_| "master".into());
    let user = std::env::var("TDS_USER").unwrap_or_else(|_| "sa".into());
    let password = std::env::var("TDS_PASSWORD").unwrap_or_else(|_| "Password123!".into());
    let encryption = match std::env::var("TDS_ENCRYPT").as_deref() {
        Ok("false") => EncryptionMode::Off,
        _ => EncryptionMode::On,
    };

    let config = Config::new()
        .host(host)
        .database(database)
        .credentials(Credentials::sql_server(user, password))
        .encryption(encryption)
        .trust_server_certificate(true)
        .application_name("tds-basic");

    let mut session = Session::connect(config).await?;
    if let Some(ack) = &session.state().login_ack {
        println!("Connected to {} (TDS {:?})", ack.prog_name, ack.tds_version);
    }
    println!("Encrypted: {}, packet size: {}", session.is_encrypted(), session.packet_size());

    session
        .send_sql_batch("SELECT @@SERVERNAME AS server, DB_NAME() AS db; PRINT 'done';")
        .await?;
    while let Some(event) = session.next_event().await? {
        match event {
            ProtocolEvent::ColumnMetadata(columns) => {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                println!("columns: {names:?}");
            }
            ProtocolEvent::Row(values) | ProtocolEvent::NullBitmapRow(values) => {
                println!("row: {values:?}");
            }
            ProtocolEvent::InfoMessage(msg) => println!("info {}: {}", msg.number, msg.message),
            ProtocolEvent::Done(done) => println!("done: {:?} rows", done.rows()),
            other => println!("{other:?}"),
        }
    }

    session.close().await
}
