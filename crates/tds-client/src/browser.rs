//! SQL Server Browser lookup of named instances.
//!
//! The Browser service answers on UDP port 1434. A `CLNT_UCAST_EX` probe
//! (a single `0x03` byte) returns every instance on the host as
//! `;`-separated key/value pairs, instances separated by `;;`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// UDP port of the SQL Server Browser service.
pub const BROWSER_PORT: u16 = 1434;

const CLNT_UCAST_EX: u8 = 0x03;
const SVR_RESP: u8 = 0x05;
const MAX_RESPONSE: usize = 16 * 1024 - 1;

/// Properties of one instance, keyed by property name (`InstanceName`, `tcp`, ...).
pub type InstanceInfo = HashMap<String, String>;

/// Parse a Browser reply into instances keyed by upper-cased instance name.
///
/// Entries without an `InstanceName` are dropped.
pub fn parse_instances(reply: &[u8]) -> Result<HashMap<String, InstanceInfo>> {
    let body = match reply {
        [SVR_RESP, lo, hi, rest @ ..] => {
            let len = usize::from(u16::from_le_bytes([*lo, *hi]));
            rest.get(..len).unwrap_or(rest)
        }
        _ => {
            return Err(Error::ProtocolViolation(
                "SQL Browser reply is not a SVR_RESP".into(),
            ));
        }
    };
    let text = String::from_utf8_lossy(body);

    let mut instances = HashMap::new();
    let mut current = InstanceInfo::new();
    let mut key: Option<&str> = None;
    for field in text.split(';') {
        match key.take() {
            Some(name) => {
                current.insert(name.to_owned(), field.to_owned());
            }
            // An empty key closes the current instance.
            None if field.is_empty() => {
                if let Some(name) = current.get("InstanceName") {
                    instances.insert(name.to_uppercase(), std::mem::take(&mut current));
                } else if current.is_empty() {
                    break;
                } else {
                    current.clear();
                }
            }
            None => key = Some(field),
        }
    }
    Ok(instances)
}

/// Ask the Browser service on `host` for the TCP port of `instance`.
pub async fn resolve_instance(host: &str, instance: &str, timeout: Duration) -> Result<u16> {
    tracing::debug!(host = %host, instance = %instance, "querying SQL Browser");
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((host, BROWSER_PORT)).await?;
    socket.send(&[CLNT_UCAST_EX]).await?;

    let mut buf = vec![0u8; MAX_RESPONSE];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    buf.truncate(len);

    port_for(&parse_instances(&buf)?, host, instance)
}

fn port_for(instances: &HashMap<String, InstanceInfo>, host: &str, instance: &str) -> Result<u16> {
    let info = instances.get(&instance.to_uppercase()).ok_or_else(|| {
        Error::Config(format!("instance {instance} not found on {host}"))
    })?;
    let port = info
        .get("tcp")
        .ok_or_else(|| Error::Config(format!("instance {instance} does not listen on TCP")))?;
    let port = port
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("invalid tcp port {port:?} for {instance}")))?;
    tracing::debug!(instance = %instance, port, "resolved named instance");
    Ok(port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn reply(text: &str) -> Vec<u8> {
        let mut out = vec![SVR_RESP];
        out.extend_from_slice(&(text.len() as u16).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }

    #[test]
    fn test_parse_two_instances() {
        let text = "ServerName;DB1;InstanceName;SQLEXPRESS;IsClustered;No;Version;15.0.2000.5;tcp;49703;;\
                    ServerName;DB1;InstanceName;Reporting;IsClustered;No;Version;16.0.1000.6;np;\\\\DB1\\pipe\\sql\\query;;";
        let instances = parse_instances(&reply(text)).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances["SQLEXPRESS"]["tcp"], "49703");
        assert_eq!(instances["REPORTING"]["Version"], "16.0.1000.6");
        assert!(!instances["REPORTING"].contains_key("tcp"));
    }

    #[test]
    fn test_port_lookup_is_case_insensitive() {
        let instances =
            parse_instances(&reply("ServerName;H;InstanceName;SqlExpress;tcp;1533;;")).unwrap();
        assert_eq!(port_for(&instances, "h", "sqlexpress").unwrap(), 1533);
        assert!(matches!(port_for(&instances, "h", "other"), Err(Error::Config(_))));
    }

    #[test]
    fn test_instance_without_tcp() {
        let instances =
            parse_instances(&reply("ServerName;H;InstanceName;PIPES;np;\\\\H\\pipe;;")).unwrap();
        assert!(matches!(port_for(&instances, "h", "pipes"), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_port_is_violation() {
        let instances = parse_instances(&reply("InstanceName;A;tcp;http;;")).unwrap();
        assert!(matches!(
            port_for(&instances, "h", "a"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_response_type() {
        assert!(parse_instances(&[0x04, 0, 0]).is_err());
        assert!(parse_instances(&[]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_against_udp_responder() {
        let responder = UdpSocket::bind(("127.0.0.1", BROWSER_PORT)).await;
        // Port 1434 may be taken or privileged on the test host.
        let Ok(responder) = responder else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, peer) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[CLNT_UCAST_EX]);
            let body = reply("ServerName;LOCAL;InstanceName;TESTINST;tcp;41433;;");
            responder.send_to(&body, peer).await.unwrap();
        });

        let port = resolve_instance("127.0.0.1", "testinst", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(port, 41433);
    }
}
